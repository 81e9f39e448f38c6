use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{CaptureBackend, CaptureBlock, CaptureConfig};
use crate::error::CaptureError;

/// Decoded WAV file, mixed down to mono floats
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read audio samples")?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()
                    .context("Failed to read audio samples")?
            }
        };

        let channels = spec.channels.max(1);
        let samples: Vec<f32> = interleaved
            .chunks(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        let duration_seconds = samples.len() as f64 / spec.sample_rate as f64;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} frames",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }
}

/// Capture backend that streams a WAV file as if it were a microphone
///
/// Blocks are paced at real time unless `realtime` is disabled, in which case
/// they are pushed as fast as the consumer accepts them.
pub struct FileCapture {
    path: PathBuf,
    config: CaptureConfig,
    realtime: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>, config: CaptureConfig) -> Self {
        Self {
            path: path.into(),
            config,
            realtime: true,
            cancel: None,
            task: None,
        }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[async_trait::async_trait]
impl CaptureBackend for FileCapture {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }

        let audio = AudioFile::open(&self.path)
            .map_err(|e| CaptureError::DeviceDenied(format!("{:#}", e)))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let cancel = CancellationToken::new();
        let block_size = self.config.block_size.max(1);
        let sample_rate = audio.sample_rate;
        let pace = if self.realtime {
            Some(Duration::from_secs_f64(block_size as f64 / sample_rate as f64))
        } else {
            None
        };

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = pace.map(tokio::time::interval);

            for chunk in audio.samples.chunks(block_size) {
                if let Some(ticker) = ticker.as_mut() {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                }

                let block = CaptureBlock {
                    samples: chunk.to_vec(),
                    sample_rate,
                };

                if pace.is_some() {
                    // Real-time source: drop the block if the consumer lags
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(block) {
                        break;
                    }
                } else {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        sent = tx.send(block) => if sent.is_err() { break },
                    }
                }
            }

            debug!("File capture finished");
        });

        info!("File capture started: {}", self.path.display());

        self.cancel = Some(cancel);
        self.task = Some(task);

        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("File capture stopped: {}", self.path.display());
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}
