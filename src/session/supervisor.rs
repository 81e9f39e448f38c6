//! Keeps a transport session alive across transient failures
//!
//! The supervisor owns the `RetryState`. It forwards incoming events to
//! playback and the transcript, and on an unexpected close waits
//! `base_delay * 2^attempts` before connecting again, up to `MAX_ATTEMPTS`.
//! Cancelling its token (user stop) ends it from any state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::persona::PersonaConfig;
use super::state::ConnectionState;
use super::status::SessionStatus;
use crate::audio::PlaybackHandle;
use crate::error::TransportError;
use crate::transport::{Connector, FrameSender, TransportEvent, TransportSession};

/// Reconnect attempts after one unexpected close
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows `attempts` earlier ones
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Attempt counter; reset only by a successful handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    next_delay: Duration,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = Duration::ZERO;
    }

    /// Claim the next attempt, returning how long to wait before it
    ///
    /// `None` once the policy's attempts are used up.
    pub fn record_attempt(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if self.attempts >= policy.max_attempts {
            return None;
        }

        let delay = policy.delay_for(self.attempts);
        self.attempts += 1;
        self.next_delay = policy.delay_for(self.attempts);
        Some(delay)
    }
}

/// Why `ReconnectionSupervisor::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Cancelled from outside (user stop or restart)
    Stopped,
    /// Every reconnect attempt failed; the session is over
    Exhausted,
}

pub struct ReconnectionSupervisor {
    connector: Arc<dyn Connector>,
    persona: PersonaConfig,
    policy: RetryPolicy,
    retry: RetryState,
    status: Arc<SessionStatus>,
    route: watch::Sender<Option<FrameSender>>,
    playback: PlaybackHandle,
    cancel: CancellationToken,
}

impl ReconnectionSupervisor {
    /// `route` is where the capture loop picks up the current frame sender
    pub fn new(
        connector: Arc<dyn Connector>,
        persona: PersonaConfig,
        policy: RetryPolicy,
        status: Arc<SessionStatus>,
        route: watch::Sender<Option<FrameSender>>,
        playback: PlaybackHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            persona,
            policy,
            retry: RetryState::default(),
            status,
            route,
            playback,
            cancel,
        }
    }

    /// First connection of a session. Failure is fatal and not retried.
    pub async fn establish(&mut self) -> Result<TransportSession, TransportError> {
        self.status.set_state(ConnectionState::Connecting);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Connect("cancelled".to_string())),
            result = self.connector.connect(&self.persona) => result,
        };

        match result {
            Ok(session) => {
                self.on_connected(&session);
                Ok(session)
            }
            Err(e) => {
                self.status.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Drive `session` and its successors until stopped or out of attempts
    pub async fn run(mut self, session: TransportSession) -> SupervisorExit {
        let mut current = Some(session);
        let mut exit = SupervisorExit::Stopped;

        while let Some(mut session) = current.take() {
            let lost = self.pump(&mut session).await;
            self.route.send_replace(None);
            session.close().await;

            if let Some(reason) = lost {
                warn!("Connection to voice service lost: {}", reason);
                self.status.seal_transcript().await;
                match self.reconnect().await {
                    Ok(session) => current = Some(session),
                    Err(reason) => exit = reason,
                }
            }
        }

        self.route.send_replace(None);
        info!("Reconnection supervisor stopped ({:?})", exit);
        exit
    }

    /// Forward events until the session closes (`Some(reason)`) or we are cancelled
    async fn pump(&mut self, session: &mut TransportSession) -> Option<String> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                event = session.next_event() => event,
            };

            match event {
                Some(TransportEvent::Audio(frame)) => {
                    debug!("Received frame {} ({} bytes)", frame.sequence, frame.payload.len());
                    if let Err(e) = self.playback.enqueue(frame) {
                        warn!("Dropping incoming audio: {}", e);
                    }
                }
                Some(TransportEvent::Transcript { speaker, text }) => {
                    self.status.record_transcript(speaker, &text).await;
                }
                Some(TransportEvent::Interrupted) => {
                    info!("Interrupted, flushing playback");
                    self.playback.flush();
                    self.status.seal_transcript().await;
                }
                Some(TransportEvent::Closed { reason }) => return Some(reason),
                None => return Some("event stream ended".to_string()),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<TransportSession, SupervisorExit> {
        loop {
            let Some(delay) = self.retry.record_attempt(&self.policy) else {
                let message = format!(
                    "Lost connection to the voice service after {} reconnect attempts",
                    self.policy.max_attempts
                );
                error!("{}", message);
                self.status.set_error(message);
                self.status.set_state(ConnectionState::Disconnected);
                // Ends the capture loop too
                self.cancel.cancel();
                return Err(SupervisorExit::Exhausted);
            };

            self.status.set_state(ConnectionState::Reconnecting);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                self.retry.attempts(),
                self.policy.max_attempts
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SupervisorExit::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SupervisorExit::Stopped),
                result = self.connector.connect(&self.persona) => result,
            };

            match result {
                Ok(session) => {
                    self.on_connected(&session);
                    return Ok(session);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", self.retry.attempts(), e),
            }
        }
    }

    fn on_connected(&mut self, session: &TransportSession) {
        self.retry.reset();
        self.route.send_replace(Some(session.frame_sender()));
        self.status.set_state(ConnectionState::Connected);
        info!("Connected via {} (session {})", self.connector.name(), session.session_id());
    }
}
