use async_nats::{Client, ConnectOptions, Event, Subscriber};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{AudioFrameMessage, ServerEvent, SessionCloseMessage, SessionOpenReply, SessionOpenRequest};
use super::{Connector, TransportEvent, TransportSession};
use crate::audio::{AudioFrame, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::TransportError;
use crate::session::PersonaConfig;

/// Capacity of the inbound event queue
const EVENT_CAPACITY: usize = 64;
/// Upper bound on the hang-up publish when the connection is already gone
const HANGUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for the NATS transport
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    /// NATS server URL
    pub url: String,
    /// Subject prefix, e.g. "voice"
    pub subject_prefix: String,
    /// Outgoing frames buffered before `try_send` reports a full queue
    pub outbound_capacity: usize,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// How long to wait for the handshake reply
    pub handshake_timeout: Duration,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "voice".to_string(),
            outbound_capacity: 32,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl NatsTransportConfig {
    pub fn open_subject(&self) -> String {
        format!("{}.session.open", self.subject_prefix)
    }

    pub fn close_subject(&self) -> String {
        format!("{}.session.close", self.subject_prefix)
    }

    pub fn audio_subject(&self, session_id: &str) -> String {
        format!("{}.audio.in.{}", self.subject_prefix, session_id)
    }

    pub fn events_subject(&self, session_id: &str) -> String {
        format!("{}.events.{}", self.subject_prefix, session_id)
    }
}

/// Connects to the voice service over NATS
///
/// Every `connect` opens its own NATS connection so a session owns its
/// channel end to end and closing it releases everything.
pub struct NatsConnector {
    config: NatsTransportConfig,
}

impl NatsConnector {
    pub fn new(config: NatsTransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NatsTransportConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, persona: &PersonaConfig) -> Result<TransportSession, TransportError> {
        let session_id = format!("voice-{}", Uuid::new_v4());
        info!("Connecting to NATS at {}", self.config.url);

        let (lost_tx, lost_rx) = mpsc::unbounded_channel::<String>();
        let client = ConnectOptions::new()
            .request_timeout(Some(self.config.handshake_timeout))
            .event_callback(move |event| {
                let lost_tx = lost_tx.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            let _ = lost_tx.send("connection to NATS lost".to_string());
                        }
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // Subscribe before the handshake so no early event is missed
        let events_subject = self.config.events_subject(&session_id);
        let subscriber = client
            .subscribe(events_subject.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let request = SessionOpenRequest::new(
            session_id.clone(),
            persona.voice().as_str(),
            persona.instruction(),
            self.config.input_sample_rate,
            self.config.output_sample_rate,
        );
        let payload = serde_json::to_vec(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let reply = client
            .request(self.config.open_subject(), payload.into())
            .await
            .map_err(|e| TransportError::Connect(format!("handshake failed: {}", e)))?;

        let reply: SessionOpenReply =
            serde_json::from_slice(&reply.payload).map_err(|e| TransportError::Protocol(e.to_string()))?;

        if !reply.accepted {
            let reason = reply.reason.unwrap_or_else(|| "no reason given".to_string());
            warn!("Session {} rejected: {}", session_id, reason);
            return Err(TransportError::HandshakeRejected(reason));
        }

        info!(
            "Session {} open (voice={}, events on {})",
            session_id,
            persona.voice().as_str(),
            events_subject
        );

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let outbound = spawn_outbound(
            client.clone(),
            session_id.clone(),
            self.config.audio_subject(&session_id),
            self.config.close_subject(),
            out_rx,
            shutdown.clone(),
        );
        let inbound = spawn_inbound(subscriber, lost_rx, event_tx, shutdown.clone());

        Ok(TransportSession::new(
            session_id,
            out_tx,
            event_rx,
            shutdown,
            vec![outbound, inbound],
        ))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

fn spawn_outbound(
    client: Client,
    session_id: String,
    audio_subject: String,
    close_subject: String,
    mut frames: mpsc::Receiver<AudioFrame>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => publish_frame(&client, &session_id, &audio_subject, &frame).await,
                    None => break,
                },
            }
        }

        let hangup = async {
            let message = SessionCloseMessage::new(&session_id);
            if let Ok(payload) = serde_json::to_vec(&message) {
                let _ = client.publish(close_subject, payload.into()).await;
            }
            let _ = client.flush().await;
        };

        if tokio::time::timeout(HANGUP_TIMEOUT, hangup).await.is_err() {
            debug!("Hang-up for {} not delivered", session_id);
        }
    })
}

async fn publish_frame(client: &Client, session_id: &str, subject: &str, frame: &AudioFrame) {
    let message = AudioFrameMessage::from_frame(session_id, frame);

    let payload = match serde_json::to_vec(&message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to serialize frame {}: {}", frame.sequence, e);
            return;
        }
    };

    match client.publish(subject.to_string(), payload.into()).await {
        Ok(()) => debug!(
            "Published frame {} to {} ({} bytes)",
            frame.sequence,
            subject,
            frame.payload.len()
        ),
        Err(e) => debug!("Dropped frame {}: {}", frame.sequence, e),
    }
}

fn spawn_inbound(
    mut subscriber: Subscriber,
    mut lost: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break None,
                reason = lost.recv() => {
                    break Some(reason.unwrap_or_else(|| "connection to NATS lost".to_string()));
                }
                message = subscriber.next() => {
                    let Some(message) = message else {
                        break Some("event stream ended".to_string());
                    };

                    match ServerEvent::parse(&message.payload).and_then(ServerEvent::into_event) {
                        Ok(TransportEvent::Closed { reason }) => break Some(reason),
                        Ok(event) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => break None,
                                sent = events.send(event) => if sent.is_err() { break None },
                            }
                        }
                        Err(e) => warn!("Ignoring malformed event: {}", e),
                    }
                }
            }
        };

        let _ = subscriber.unsubscribe().await;

        // Exactly one closure per session, and none for a local close
        if let Some(reason) = reason {
            info!("Voice service closed the session: {}", reason);
            let _ = events.send(TransportEvent::Closed { reason }).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let config = NatsTransportConfig {
            subject_prefix: "tutor".to_string(),
            ..Default::default()
        };

        assert_eq!(config.open_subject(), "tutor.session.open");
        assert_eq!(config.close_subject(), "tutor.session.close");
        assert_eq!(config.audio_subject("voice-1"), "tutor.audio.in.voice-1");
        assert_eq!(config.events_subject("voice-1"), "tutor.events.voice-1");
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let connector = NatsConnector::new(NatsTransportConfig {
            url: "nats://127.0.0.1:1".to_string(),
            ..Default::default()
        });

        let result = connector.connect(&PersonaConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
