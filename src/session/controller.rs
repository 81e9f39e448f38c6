use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionSettings;
use super::debounce::Debouncer;
use super::persona::PersonaConfig;
use super::state::ConnectionState;
use super::status::{SessionStatus, StatusSnapshot, TranscriptEntry};
use super::supervisor::{ReconnectionSupervisor, SupervisorExit};
use crate::audio::{
    spawn_playback, AudioOutput, CaptureBackend, CaptureBlock, CaptureEncoder, PlaybackHandle,
    PlaybackScheduler,
};
use crate::error::{SendError, SessionError};
use crate::transport::{Connector, FrameSender};

/// Public entry point for a voice session
///
/// Wires capture, transport and playback together and owns their lifetime.
/// Cheap to clone; all clones drive the same session. Must be created inside
/// a tokio runtime.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

struct Shared {
    this: Weak<Shared>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    status: Arc<SessionStatus>,
    /// Token of the session being launched or running. Reachable without
    /// `inner`, so a stop can interrupt a handshake in flight.
    current: watch::Sender<Option<CancellationToken>>,
    persona: watch::Sender<Option<PersonaConfig>>,
    inner: Mutex<Inner>,
    debouncer: Debouncer<PersonaConfig>,
}

struct Inner {
    capture: Box<dyn CaptureBackend>,
    output: Box<dyn AudioOutput>,
    active: Option<ActiveSession>,
}

/// Tasks and handles of a running session
struct ActiveSession {
    cancel: CancellationToken,
    playback: PlaybackHandle,
    playback_task: JoinHandle<()>,
    supervisor_task: JoinHandle<()>,
    capture_task: JoinHandle<()>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn Connector>,
        capture: Box<dyn CaptureBackend>,
        output: Box<dyn AudioOutput>,
        settings: SessionSettings,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let this = weak.clone();
            let debouncer = Debouncer::spawn(settings.reconfigure_quiet, move |persona: PersonaConfig| {
                let weak = this.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.restart(persona).await;
                    }
                }
            });

            Shared {
                this: weak.clone(),
                connector,
                settings,
                status: Arc::new(SessionStatus::new()),
                current: watch::channel(None).0,
                persona: watch::channel(None).0,
                inner: Mutex::new(Inner {
                    capture,
                    output,
                    active: None,
                }),
                debouncer,
            }
        });

        Self { shared }
    }

    /// Open the devices and connect with `persona`
    ///
    /// A running or connecting session is stopped first. Device and handshake
    /// failures are returned, recorded as the last error, and never retried.
    pub async fn start(&self, persona: PersonaConfig) -> Result<(), SessionError> {
        self.shared.debouncer.cancel();

        let cancel = CancellationToken::new();
        self.shared.supersede(Some(cancel.clone()));

        let mut inner = self.shared.inner.lock().await;
        self.shared.stop_locked(&mut inner).await;
        self.shared.status.reset().await;

        self.shared.persona.send_replace(Some(persona.clone()));
        self.shared.launch(&mut inner, persona, cancel).await
    }

    /// Change the persona of the running session
    ///
    /// Edits are coalesced: the session restarts once, with the last persona,
    /// after the quiet period. When no session is running or connecting the
    /// persona is only remembered.
    pub async fn reconfigure(&self, persona: PersonaConfig) {
        self.shared.persona.send_replace(Some(persona.clone()));

        if self.is_active() {
            debug!("Persona changed, restart scheduled");
            self.shared.debouncer.push(persona);
        } else {
            debug!("Persona stored for the next start");
        }
    }

    /// Stop the session from any state. Idempotent; returns once devices and
    /// transport are released.
    pub async fn stop(&self) {
        self.shared.debouncer.cancel();
        self.shared.supersede(None);

        let mut inner = self.shared.inner.lock().await;
        self.shared.stop_locked(&mut inner).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe_state()
    }

    /// Microphone level of the last captured block, 0–1
    pub fn input_volume(&self) -> f32 {
        self.shared.status.input_volume()
    }

    /// Smoothed level of the speech being played, 0–1
    pub fn output_level(&self) -> f32 {
        self.shared.status.output_level()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.last_error()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.shared.status.subscribe_errors()
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.status.transcript().await
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.shared.status.snapshot().await
    }

    /// Persona of the running session, or the one stored for the next start
    pub fn persona(&self) -> Option<PersonaConfig> {
        self.shared.persona.borrow().clone()
    }

    /// True while a session is connecting or running
    pub fn is_active(&self) -> bool {
        self.shared
            .current
            .borrow()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Shared {
    /// Install the token of the next session and cancel the previous one
    fn supersede(&self, next: Option<CancellationToken>) {
        if let Some(previous) = self.current.send_replace(next) {
            previous.cancel();
        }
    }

    async fn launch(
        &self,
        inner: &mut Inner,
        persona: PersonaConfig,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        info!(
            "Starting voice session (voice={}, capture={}, output={}, transport={})",
            persona.voice(),
            inner.capture.name(),
            inner.output.name(),
            self.connector.name()
        );
        self.status.set_state(ConnectionState::Connecting);

        let blocks = match inner.capture.open().await {
            Ok(blocks) => blocks,
            Err(e) => return Err(self.fail(&cancel, e.into())),
        };

        let sink = match inner.output.open().await {
            Ok(sink) => sink,
            Err(e) => {
                let _ = inner.capture.close().await;
                return Err(self.fail(&cancel, e.into()));
            }
        };

        let scheduler = PlaybackScheduler::new(sink, self.settings.output_sample_rate);
        let (playback, playback_task) =
            spawn_playback(scheduler, self.status.output_meter(), self.settings.level_interval);

        let (route_tx, route_rx) = watch::channel(None);
        let mut supervisor = ReconnectionSupervisor::new(
            Arc::clone(&self.connector),
            persona,
            self.settings.policy.clone(),
            Arc::clone(&self.status),
            route_tx,
            playback.clone(),
            cancel.clone(),
        );

        let session = match supervisor.establish().await {
            Ok(session) => session,
            Err(e) => {
                playback.shutdown().await;
                let _ = playback_task.await;
                let _ = inner.capture.close().await;
                return Err(self.fail(&cancel, e.into()));
            }
        };

        let this = self.this.clone();
        let supervisor_task = tokio::spawn(async move {
            if supervisor.run(session).await == SupervisorExit::Exhausted {
                if let Some(shared) = this.upgrade() {
                    // Detached: stop_locked awaits this task
                    tokio::spawn(async move { shared.release_abandoned().await });
                }
            }
        });
        let capture_task = spawn_capture_loop(
            blocks,
            CaptureEncoder::new(self.settings.input_sample_rate),
            route_rx,
            Arc::clone(&self.status),
            cancel.clone(),
        );

        inner.active = Some(ActiveSession {
            cancel,
            playback,
            playback_task,
            supervisor_task,
            capture_task,
        });

        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(active) = inner.active.take() {
            info!("Stopping voice session");

            active.cancel.cancel();
            let _ = active.supervisor_task.await;
            let _ = active.capture_task.await;

            if let Err(e) = inner.capture.close().await {
                warn!("Failed to release {}: {}", inner.capture.name(), e);
            }

            active.playback.shutdown().await;
            let _ = active.playback_task.await;

            info!("Voice session stopped");
        }

        self.status.set_input_volume(0.0);
        self.status.set_state(ConnectionState::Disconnected);
    }

    /// Tear down and relaunch with a new persona after the debounce settles
    async fn restart(&self, persona: PersonaConfig) {
        let mut inner = self.inner.lock().await;

        // A stop issued after the debounce fired cancels the running token
        let running = inner.active.is_some();
        let cancel = CancellationToken::new();
        let live = self.current.send_if_modified(|current| {
            let live = running && current.as_ref().is_some_and(|token| !token.is_cancelled());
            if live {
                *current = Some(cancel.clone());
            }
            live
        });

        if !live {
            debug!("Restart skipped: session no longer running");
            return;
        }

        info!("Restarting voice session with new persona (voice={})", persona.voice());
        self.stop_locked(&mut inner).await;

        // Failure is already recorded in the status
        let _ = self.launch(&mut inner, persona, cancel).await;
    }

    /// Release the devices of a session whose supervisor gave up reconnecting
    async fn release_abandoned(&self) {
        let mut inner = self.inner.lock().await;
        let abandoned = inner
            .active
            .as_ref()
            .is_some_and(|active| active.cancel.is_cancelled());

        if abandoned {
            info!("Releasing devices after reconnection gave up");
            self.stop_locked(&mut inner).await;
        }
    }

    fn fail(&self, cancel: &CancellationToken, error: SessionError) -> SessionError {
        self.status.set_state(ConnectionState::Disconnected);

        if cancel.is_cancelled() {
            info!("Voice session start cancelled");
            return SessionError::Cancelled;
        }

        cancel.cancel();
        error!("Failed to start voice session: {}", error);
        self.status.set_error(error.to_string());
        error
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(token) = self.current.borrow().as_ref() {
            token.cancel();
        }
        if let Some(active) = self.inner.get_mut().active.as_ref() {
            active.cancel.cancel();
        }
    }
}

/// Encode microphone blocks and hand them to whichever transport is current
///
/// Never waits on the network: with no route or a full queue the frame is dropped.
fn spawn_capture_loop(
    mut blocks: mpsc::Receiver<CaptureBlock>,
    mut encoder: CaptureEncoder,
    route: watch::Receiver<Option<FrameSender>>,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Capture loop started ({}Hz out)", encoder.target_rate());

        loop {
            let block = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                block = blocks.recv() => match block {
                    Some(block) => block,
                    None => break,
                },
            };

            let encoded = encoder.encode_block(&block);
            status.set_input_volume(encoded.volume);

            let sender = route.borrow().clone();
            let sequence = encoded.frame.sequence;
            let sent = match sender {
                Some(sender) => sender.try_send(encoded.frame),
                None => Err(SendError::NotConnected),
            };

            if let Err(e) = sent {
                debug!("Dropped outgoing frame {}: {}", sequence, e);
            }
        }

        status.set_input_volume(0.0);
        debug!("Capture loop stopped");
    })
}
