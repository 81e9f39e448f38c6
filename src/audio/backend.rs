use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{CaptureError, PlaybackError};

/// Rate the voice service expects for microphone audio
pub const INPUT_SAMPLE_RATE: u32 = 16000;
/// Rate of synthesized speech coming back from the voice service
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// One block of raw microphone samples at the device's native rate
#[derive(Debug, Clone)]
pub struct CaptureBlock {
    /// Mono float samples in [-1, 1]
    pub samples: Vec<f32>,
    /// Native sample rate of the device in Hz
    pub sample_rate: u32,
}

/// Encoded audio exchanged with the voice service (16-bit PCM, mono, little-endian)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// PCM16LE bytes
    pub payload: Vec<u8>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Monotonically increasing index within one direction of a session
    pub sequence: u64,
}

impl AudioFrame {
    pub fn from_pcm16(samples: &[i16], sample_rate: u32, sequence: u64) -> Self {
        let payload = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        Self {
            payload,
            sample_rate,
            sequence,
        }
    }

    /// Decode the payload back into integer samples; a trailing odd byte is ignored
    pub fn pcm16(&self) -> Vec<i16> {
        self.payload
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }
}

/// Configuration for capture backends
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per block handed to the encoder
    pub block_size: usize,
    /// Capacity of the block channel; blocks are dropped when it is full
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            channel_capacity: 32,
        }
    }
}

/// Microphone capture backend
///
/// Implementations:
/// - `CpalCapture`: default input device (feature `backend-cpal`)
/// - `FileCapture`: WAV file played back as if it were a microphone
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open the device and start delivering blocks
    ///
    /// Any failure here is fatal for the session start and maps to
    /// `CaptureError::DeviceDenied`.
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, CaptureError>;

    /// Release the device. Safe to call when not capturing.
    async fn close(&mut self) -> Result<(), CaptureError>;

    fn is_capturing(&self) -> bool;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Output device that hands out schedulable sinks
#[async_trait::async_trait]
pub trait AudioOutput: Send + Sync {
    async fn open(&mut self) -> Result<Box<dyn OutputSink>, PlaybackError>;

    fn name(&self) -> &str;
}

/// A sink that plays float blocks at absolute times on its own clock
#[async_trait::async_trait]
pub trait OutputSink: Send {
    /// Current output clock in seconds
    fn now(&self) -> f64;

    /// Queue `samples` to start playing at `start_at` seconds on the output clock
    fn schedule(&mut self, id: u64, samples: Arc<[f32]>, start_at: f64) -> Result<(), PlaybackError>;

    /// Stop a scheduled chunk; unknown or finished ids are ignored
    fn cancel(&mut self, id: u64);

    /// Release the device
    async fn close(&mut self);
}

/// Audio input source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default microphone (requires the `backend-cpal` feature)
    Microphone,
    /// WAV file streamed in real time
    File(PathBuf),
}

/// Audio output type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSink {
    /// Default output device (requires the `backend-cpal` feature)
    Speakers,
    /// Discard audio but keep a real-time clock
    Null,
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create a capture backend for the given source
    pub fn capture(
        source: AudioSource,
        config: CaptureConfig,
    ) -> Result<Box<dyn CaptureBackend>, CaptureError> {
        match source {
            AudioSource::Microphone => {
                #[cfg(feature = "backend-cpal")]
                {
                    Ok(Box::new(super::cpal::CpalCapture::new(config)))
                }

                #[cfg(not(feature = "backend-cpal"))]
                {
                    let _ = config;
                    Err(CaptureError::DeviceDenied(
                        "microphone capture requires the 'backend-cpal' feature".to_string(),
                    ))
                }
            }

            AudioSource::File(path) => Ok(Box::new(super::file::FileCapture::new(path, config))),
        }
    }

    /// Create an output backend
    pub fn output(sink: AudioSink, sample_rate: u32) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        match sink {
            AudioSink::Speakers => {
                #[cfg(feature = "backend-cpal")]
                {
                    Ok(Box::new(super::cpal::CpalOutput::new(sample_rate)))
                }

                #[cfg(not(feature = "backend-cpal"))]
                {
                    let _ = sample_rate;
                    Err(PlaybackError::DeviceUnavailable(
                        "speaker output requires the 'backend-cpal' feature".to_string(),
                    ))
                }
            }

            AudioSink::Null => Ok(Box::new(super::null::NullOutput::new())),
        }
    }
}
