pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendFactory, AudioFile, AudioFrame, AudioOutput, AudioSink, AudioSource, CaptureBackend,
    CaptureBlock, CaptureConfig, CaptureEncoder, FileCapture, NullOutput, OutputSink, PlaybackScheduler,
};
pub use config::Config;
pub use error::{CaptureError, PlaybackError, SendError, SessionError, TransportError};
pub use http::{create_router, AppState};
pub use session::{
    ConnectionState, PersonaConfig, PersonaTraits, RetryPolicy, SessionController, SessionSettings,
    TranscriptEntry, VoiceId,
};
pub use transport::{Connector, NatsConnector, Speaker, TransportEvent, TransportSession};
