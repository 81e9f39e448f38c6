//! Connection to the remote voice service
//!
//! A `Connector` performs the handshake and hands back a `TransportSession`:
//! an outbound frame queue plus an inbound event stream, both backed by tasks
//! the connector spawned. Dropping or closing the session tears them down.

pub mod messages;
pub mod nats;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::AudioFrame;
use crate::error::{SendError, TransportError};
use crate::session::PersonaConfig;

pub use messages::{AudioFrameMessage, ServerEvent, SessionCloseMessage, SessionOpenReply, SessionOpenRequest};
pub use nats::{NatsConnector, NatsTransportConfig};

/// Who said a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// Event delivered by the remote service
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Synthesized speech, 24 kHz PCM16
    Audio(AudioFrame),
    Transcript { speaker: Speaker, text: String },
    /// The user barged in; anything still playing is stale
    Interrupted,
    /// The channel ended; no further events follow
    Closed { reason: String },
}

/// Opens transport sessions
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the handshake with `persona`
    async fn connect(&self, persona: &PersonaConfig) -> Result<TransportSession, TransportError>;

    fn name(&self) -> &str;
}

/// Cloneable, non-blocking sender for outgoing frames
#[derive(Debug, Clone)]
pub struct FrameSender(mpsc::Sender<AudioFrame>);

impl FrameSender {
    pub fn new(tx: mpsc::Sender<AudioFrame>) -> Self {
        Self(tx)
    }

    pub fn try_send(&self, frame: AudioFrame) -> Result<(), SendError> {
        self.0.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// One handshaken connection to the voice service
pub struct TransportSession {
    session_id: String,
    outbound: FrameSender,
    events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportSession {
    /// Assemble a session from the pieces a connector built
    ///
    /// `shutdown` must stop every task in `tasks` when cancelled.
    pub fn new(
        session_id: String,
        outbound: mpsc::Sender<AudioFrame>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            session_id,
            outbound: FrameSender::new(outbound),
            events,
            shutdown,
            tasks,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn frame_sender(&self) -> FrameSender {
        self.outbound.clone()
    }

    /// Queue a frame without waiting
    pub fn try_send(&self, frame: AudioFrame) -> Result<(), SendError> {
        self.outbound.try_send(frame)
    }

    /// Next event, or `None` once the inbound side has gone away
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Tear the connection down and wait for its tasks
    pub async fn close(mut self) {
        debug!("Closing transport session {}", self.session_id);
        self.shutdown.cancel();
        self.events.close();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        info!("Transport session {} closed", self.session_id);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (TransportSession, mpsc::Receiver<AudioFrame>, mpsc::Sender<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (ev_tx, ev_rx) = mpsc::channel(4);
        let session = TransportSession::new(
            "voice-test".to_string(),
            out_tx,
            ev_rx,
            CancellationToken::new(),
            Vec::new(),
        );
        (session, out_rx, ev_tx)
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let (session, _out_rx, _ev_tx) = session();
        let frame = AudioFrame::from_pcm16(&[0; 4], 16000, 0);

        assert_eq!(session.try_send(frame.clone()), Ok(()));
        assert_eq!(session.try_send(frame), Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_try_send_after_close_is_not_connected() {
        let (session, out_rx, _ev_tx) = session();
        let sender = session.frame_sender();
        drop(out_rx);

        let frame = AudioFrame::from_pcm16(&[0; 4], 16000, 0);
        assert_eq!(sender.try_send(frame), Err(SendError::NotConnected));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_close_cancels_shutdown_token() {
        let token = CancellationToken::new();
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_ev_tx, ev_rx) = mpsc::channel(1);

        let task_token = token.clone();
        let task = tokio::spawn(async move { task_token.cancelled().await });

        let session = TransportSession::new("voice-test".to_string(), out_tx, ev_rx, token.clone(), vec![task]);
        session.close().await;

        assert!(token.is_cancelled());
    }
}
