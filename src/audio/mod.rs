pub mod backend;
pub mod capture;
pub mod file;
pub mod level;
pub mod null;
pub mod playback;

#[cfg(feature = "backend-cpal")]
pub mod cpal;

pub use backend::{
    AudioBackendFactory, AudioFrame, AudioOutput, AudioSink, AudioSource, CaptureBackend,
    CaptureBlock, CaptureConfig, OutputSink, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use capture::{CaptureEncoder, EncodedBlock};
pub use file::{AudioFile, FileCapture};
pub use level::LevelMeter;
pub use null::NullOutput;
pub use playback::{spawn_playback, ChunkSpan, PlaybackHandle, PlaybackScheduler};
