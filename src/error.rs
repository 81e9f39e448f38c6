use thiserror::Error;

/// Failures opening or running the capture device
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be opened (permission denied, missing, or busy)
    #[error("Microphone unavailable: {0}")]
    DeviceDenied(String),

    #[error("Unsupported capture format: {0}")]
    Unsupported(String),

    #[error("Capture already running")]
    AlreadyCapturing,
}

/// Failures on the output side
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Output sink closed")]
    Closed,
}

/// Failures establishing or running a transport session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to voice service: {0}")]
    Connect(String),

    #[error("Voice service rejected the session: {0}")]
    HandshakeRejected(String),

    #[error("Malformed message from voice service: {0}")]
    Protocol(String),
}

/// Why an outgoing frame was dropped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("outbound queue full")]
    QueueFull,
}

/// Errors surfaced by `SessionController::start`
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A stop or a newer start arrived before the handshake finished
    #[error("Session start cancelled")]
    Cancelled,
}
