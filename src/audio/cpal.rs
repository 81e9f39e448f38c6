//! Native microphone and speaker devices using cpal
//!
//! `cpal::Stream` is not `Send`, so each stream lives on a dedicated thread
//! that holds it until a stop signal arrives.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig, SupportedStreamConfig,
    SupportedStreamConfigRange,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::backend::{AudioOutput, CaptureBackend, CaptureBlock, CaptureConfig, OutputSink};
use super::capture::resample_nearest;
use crate::error::{CaptureError, PlaybackError};

/// Keeps a stream thread alive; dropping the sender ends it
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(mut self) -> Option<JoinHandle<()>> {
        let _ = self.stop_tx.send(());
        self.thread.take()
    }
}

/// Collects interleaved device samples into fixed-size mono blocks
struct BlockAccumulator {
    block_size: usize,
    sample_rate: u32,
    channels: usize,
    buffer: Vec<f32>,
    tx: mpsc::Sender<CaptureBlock>,
    dropped: u64,
}

impl BlockAccumulator {
    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        for frame in data.chunks(self.channels) {
            let mono = frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32;
            self.buffer.push(mono);

            if self.buffer.len() >= self.block_size {
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.block_size));
                let block = CaptureBlock {
                    samples,
                    sample_rate: self.sample_rate,
                };

                // Never block the audio thread
                if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(block) {
                    self.dropped += 1;
                    if self.dropped % 50 == 1 {
                        warn!("Capture consumer lagging, {} blocks dropped", self.dropped);
                    }
                }
            }
        }
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut accumulator: BlockAccumulator,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| accumulator.push(data),
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::DeviceDenied(e.to_string()))
}

/// Default input device
pub struct CpalCapture {
    config: CaptureConfig,
    stream: Option<StreamThread>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for CpalCapture {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, CaptureError> {
        if self.stream.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }

        let (block_tx, block_rx) = mpsc::channel(self.config.channel_capacity);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, CaptureError>>();
        let block_size = self.config.block_size.max(1);

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(CaptureError::DeviceDenied(
                        "No input device available".to_string(),
                    )));
                    return;
                }
            };

            let supported = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(CaptureError::DeviceDenied(e.to_string())));
                    return;
                }
            };

            let sample_rate = supported.sample_rate().0;
            let config: StreamConfig = supported.config();
            let accumulator = BlockAccumulator {
                block_size,
                sample_rate,
                channels: config.channels.max(1) as usize,
                buffer: Vec::with_capacity(block_size),
                tx: block_tx,
                dropped: 0,
            };

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, accumulator),
                SampleFormat::I16 => build_input::<i16>(&device, &config, accumulator),
                SampleFormat::U16 => build_input::<u16>(&device, &config, accumulator),
                other => Err(CaptureError::Unsupported(format!("{:?}", other))),
            };

            let stream = match stream.and_then(|s| {
                s.play()
                    .map(|_| s)
                    .map_err(|e| CaptureError::DeviceDenied(e.to_string()))
            }) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let _ = ready_tx.send(Ok(sample_rate));

            // Hold the stream until asked to stop
            let _ = stop_rx.recv();
            drop(stream);
            info!("Microphone stream released");
        });

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| CaptureError::DeviceDenied(e.to_string()))?
            .map_err(|_| CaptureError::DeviceDenied("capture thread exited".to_string()))?;

        let sample_rate = ready?;
        info!("Microphone capture started ({}Hz native)", sample_rate);

        self.stream = Some(StreamThread {
            stop_tx,
            thread: Some(thread),
        });

        Ok(block_rx)
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        info!("Stopping microphone capture");
        if let Some(thread) = stream.stop() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

struct TimelineChunk {
    id: u64,
    start_frame: u64,
    samples: Arc<[f32]>,
}

/// Chunks waiting to be rendered, positioned in device frames
#[derive(Default)]
struct Timeline {
    chunks: Vec<TimelineChunk>,
}

fn render<T>(output: &mut [T], channels: usize, timeline: &Mutex<Timeline>, played: &AtomicU64)
where
    T: Sample + FromSample<f32>,
{
    let base = played.load(Ordering::Acquire);
    let frames = output.len() / channels;

    match timeline.lock() {
        Ok(mut timeline) => {
            for (i, frame) in output.chunks_mut(channels).enumerate() {
                let position = base + i as u64;
                let value: f32 = timeline
                    .chunks
                    .iter()
                    .filter(|c| position >= c.start_frame)
                    .filter_map(|c| c.samples.get((position - c.start_frame) as usize))
                    .sum();

                let value = T::from_sample(value.clamp(-1.0, 1.0));
                for sample in frame.iter_mut() {
                    *sample = value;
                }
            }

            let end = base + frames as u64;
            timeline
                .chunks
                .retain(|c| c.start_frame + c.samples.len() as u64 > end);
        }
        Err(_) => {
            for sample in output.iter_mut() {
                *sample = T::EQUILIBRIUM;
            }
        }
    }

    played.fetch_add(frames as u64, Ordering::Release);
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    played: Arc<AtomicU64>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
                render(output, channels, &timeline, &played)
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))
}

/// Pick an output config at `wanted` Hz, preferring float samples
///
/// `None` when no range of at most two channels covers that rate.
fn choose_output_config(ranges: &[SupportedStreamConfigRange], wanted: u32) -> Option<SupportedStreamConfig> {
    let wanted = SampleRate(wanted);
    let covering: Vec<_> = ranges
        .iter()
        .filter(|r| r.channels() <= 2)
        .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
        .collect();

    covering
        .iter()
        .find(|r| r.sample_format() == SampleFormat::F32)
        .or_else(|| covering.first())
        .map(|r| (*r).clone().with_sample_rate(wanted))
}

/// Default output device
///
/// Opens at the requested rate when the device supports it, otherwise at the
/// device's default rate with scheduled chunks resampled to match.
pub struct CpalOutput {
    sample_rate: u32,
}

impl CpalOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait::async_trait]
impl AudioOutput for CpalOutput {
    async fn open(&mut self) -> Result<Box<dyn OutputSink>, PlaybackError> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let played = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, PlaybackError>>();
        let source_rate = self.sample_rate;

        let thread_timeline = Arc::clone(&timeline);
        let thread_played = Arc::clone(&played);
        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(PlaybackError::DeviceUnavailable(
                        "No output device available".to_string(),
                    )));
                    return;
                }
            };

            let ranges: Vec<_> = match device.supported_output_configs() {
                Ok(ranges) => ranges.collect(),
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };

            let supported = match choose_output_config(&ranges, source_rate) {
                Some(c) => c,
                None => match device.default_output_config() {
                    Ok(c) => {
                        warn!(
                            "Output device does not support {}Hz, resampling to {}Hz",
                            source_rate,
                            c.sample_rate().0
                        );
                        c
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::DeviceUnavailable(e.to_string())));
                        return;
                    }
                },
            };

            let device_rate = supported.sample_rate().0;
            let config: StreamConfig = supported.config();

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, thread_timeline, thread_played),
                SampleFormat::I16 => build_output::<i16>(&device, &config, thread_timeline, thread_played),
                SampleFormat::U16 => build_output::<u16>(&device, &config, thread_timeline, thread_played),
                other => Err(PlaybackError::DeviceUnavailable(format!(
                    "Unsupported sample format: {:?}",
                    other
                ))),
            };

            let stream = match stream.and_then(|s| {
                s.play()
                    .map(|_| s)
                    .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))
            }) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let _ = ready_tx.send(Ok(device_rate));
            let _ = stop_rx.recv();
            drop(stream);
            info!("Speaker stream released");
        });

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?
            .map_err(|_| PlaybackError::DeviceUnavailable("output thread exited".to_string()))?;

        let device_rate = ready?;
        info!("Speaker output started ({}Hz device, {}Hz speech)", device_rate, source_rate);

        Ok(Box::new(CpalSink {
            timeline,
            played,
            source_rate,
            device_rate,
            stream: Some(StreamThread {
                stop_tx,
                thread: Some(thread),
            }),
        }))
    }

    fn name(&self) -> &str {
        "cpal speakers"
    }
}

struct CpalSink {
    timeline: Arc<Mutex<Timeline>>,
    played: Arc<AtomicU64>,
    /// Rate of the samples handed to `schedule`
    source_rate: u32,
    device_rate: u32,
    stream: Option<StreamThread>,
}

#[async_trait::async_trait]
impl OutputSink for CpalSink {
    fn now(&self) -> f64 {
        self.played.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, id: u64, samples: Arc<[f32]>, start_at: f64) -> Result<(), PlaybackError> {
        let start_frame = (start_at * self.device_rate as f64).round() as u64;
        let samples: Arc<[f32]> = if self.source_rate == self.device_rate {
            samples
        } else {
            resample_nearest(&samples, self.source_rate, self.device_rate).into()
        };

        let mut timeline = self.timeline.lock().map_err(|_| PlaybackError::Closed)?;
        timeline.chunks.push(TimelineChunk {
            id,
            start_frame,
            samples,
        });
        Ok(())
    }

    fn cancel(&mut self, id: u64) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.chunks.retain(|c| c.id != id);
        }
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Some(thread) = stream.stop() {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_output_config_prefers_float_range_covering_rate() {
        let ranges = vec![
            range(2, 8000, 48000, SampleFormat::I16),
            range(2, 8000, 48000, SampleFormat::F32),
        ];

        let config = choose_output_config(&ranges, 24000).unwrap();
        assert_eq!(config.sample_rate(), SampleRate(24000));
        assert_eq!(config.sample_format(), SampleFormat::F32);
    }

    #[test]
    fn test_output_config_none_when_rate_unsupported() {
        let ranges = vec![
            range(2, 44100, 44100, SampleFormat::F32),
            range(2, 48000, 48000, SampleFormat::F32),
            range(8, 8000, 96000, SampleFormat::F32),
        ];

        assert!(choose_output_config(&ranges, 24000).is_none());
    }

    #[test]
    fn test_sink_converts_to_device_frames() {
        let mut sink = CpalSink {
            timeline: Arc::new(Mutex::new(Timeline::default())),
            played: Arc::new(AtomicU64::new(0)),
            source_rate: 24000,
            device_rate: 48000,
            stream: None,
        };

        sink.schedule(7, vec![0.25f32; 240].into(), 0.5).unwrap();
        {
            let timeline = sink.timeline.lock().unwrap();
            assert_eq!(timeline.chunks[0].start_frame, 24000);
            assert_eq!(timeline.chunks[0].samples.len(), 480);
        }

        sink.played.store(48000, Ordering::Release);
        assert!((sink.now() - 1.0).abs() < 1e-9);

        sink.cancel(7);
        assert!(sink.timeline.lock().unwrap().chunks.is_empty());
    }
}
