#![allow(dead_code)]

use loqa_voice::audio::{AudioOutput, CaptureBackend, CaptureBlock, OutputSink};
use loqa_voice::{
    AudioFrame, CaptureError, Connector, PersonaConfig, PlaybackError, SessionController, SessionSettings,
    TransportError, TransportEvent, TransportSession,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// In-memory voice service
// ============================================================================

/// The service side of one accepted session
pub struct RemoteEnd {
    pub persona: PersonaConfig,
    /// Frames the client sent
    pub outbound: mpsc::Receiver<AudioFrame>,
    /// Push events to the client
    pub events: mpsc::Sender<TransportEvent>,
    /// Cancelled when the client closes the session
    pub shutdown: CancellationToken,
}

impl RemoteEnd {
    pub async fn send(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.send(TransportEvent::Closed {
            reason: reason.to_string(),
        })
        .await;
    }
}

#[derive(Default)]
struct ScriptState {
    /// Outcome of upcoming connects; `true` accepts
    script: VecDeque<bool>,
    /// Outcome once the script is used up
    default_accept: bool,
    attempts: Vec<(Instant, PersonaConfig)>,
    next_id: usize,
}

pub struct MockConnector {
    state: Mutex<ScriptState>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    /// While true, handshakes wait before answering
    held: watch::Sender<bool>,
}

impl MockConnector {
    /// Accepts every connect
    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::scripted(&[], true)
    }

    pub fn scripted(script: &[bool], default_accept: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(ScriptState {
                script: script.iter().copied().collect(),
                default_accept,
                ..Default::default()
            }),
            remotes: tx,
            held: watch::channel(false).0,
        });
        (connector, rx)
    }

    /// Keep upcoming handshakes pending until `release_handshakes`
    pub fn hold_handshakes(&self) {
        self.held.send_replace(true);
    }

    pub fn release_handshakes(&self) {
        self.held.send_replace(false);
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.iter().map(|(t, _)| *t).collect()
    }

    pub fn personas(&self) -> Vec<PersonaConfig> {
        self.state.lock().unwrap().attempts.iter().map(|(_, p)| p.clone()).collect()
    }

    /// Gaps between consecutive connect attempts
    pub fn attempt_gaps(&self) -> Vec<Duration> {
        self.attempt_times().windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, persona: &PersonaConfig) -> Result<TransportSession, TransportError> {
        let (accept, id) = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push((Instant::now(), persona.clone()));
            let accept = state.script.pop_front().unwrap_or(state.default_accept);
            state.next_id += 1;
            (accept, state.next_id)
        };

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        if !accept {
            return Err(TransportError::Connect("scripted failure".to_string()));
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let _ = self.remotes.send(RemoteEnd {
            persona: persona.clone(),
            outbound: out_rx,
            events: event_tx,
            shutdown: shutdown.clone(),
        });

        Ok(TransportSession::new(
            format!("mock-{}", id),
            out_tx,
            event_rx,
            shutdown,
            Vec::new(),
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Connector whose handshake is always refused
pub struct RejectingConnector;

#[async_trait::async_trait]
impl Connector for RejectingConnector {
    async fn connect(&self, _persona: &PersonaConfig) -> Result<TransportSession, TransportError> {
        Err(TransportError::HandshakeRejected("unknown voice".to_string()))
    }

    fn name(&self) -> &str {
        "rejecting"
    }
}

// ============================================================================
// Capture fed from the test
// ============================================================================

#[derive(Default)]
struct CaptureShared {
    feed: Mutex<Option<mpsc::Sender<CaptureBlock>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

pub struct ChannelCapture {
    shared: Arc<CaptureShared>,
    deny: bool,
}

/// Test-side view of a `ChannelCapture`
#[derive(Clone)]
pub struct CaptureProbe {
    shared: Arc<CaptureShared>,
}

impl ChannelCapture {
    pub fn new() -> (Self, CaptureProbe) {
        Self::build(false)
    }

    /// Capture whose device refuses to open
    pub fn denied() -> (Self, CaptureProbe) {
        Self::build(true)
    }

    fn build(deny: bool) -> (Self, CaptureProbe) {
        let shared = Arc::new(CaptureShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
                deny,
            },
            CaptureProbe { shared },
        )
    }
}

#[async_trait::async_trait]
impl CaptureBackend for ChannelCapture {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, CaptureError> {
        if self.deny {
            return Err(CaptureError::DeviceDenied("permission denied".to_string()));
        }

        let (tx, rx) = mpsc::channel(32);
        *self.shared.feed.lock().unwrap() = Some(tx);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        if self.shared.feed.lock().unwrap().take().is_some() {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.shared.feed.lock().unwrap().is_some()
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl CaptureProbe {
    /// Deliver a block as the device would; false when capture is closed
    pub async fn push(&self, block: CaptureBlock) -> bool {
        let tx = self.shared.feed.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(block).await.is_ok(),
            None => false,
        }
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.shared.feed.lock().unwrap().is_some()
    }
}

// ============================================================================
// Output with a clock the test controls
// ============================================================================

#[derive(Debug, Default)]
pub struct Timeline {
    pub now: f64,
    /// (chunk id, start time, sample count)
    pub scheduled: Vec<(u64, f64, usize)>,
    pub cancelled: Vec<u64>,
    pub opens: usize,
    pub closes: usize,
}

pub struct VirtualOutput {
    timeline: Arc<Mutex<Timeline>>,
}

impl VirtualOutput {
    pub fn new() -> (Self, Arc<Mutex<Timeline>>) {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        (
            Self {
                timeline: Arc::clone(&timeline),
            },
            timeline,
        )
    }
}

#[async_trait::async_trait]
impl AudioOutput for VirtualOutput {
    async fn open(&mut self) -> Result<Box<dyn OutputSink>, PlaybackError> {
        self.timeline.lock().unwrap().opens += 1;
        Ok(Box::new(VirtualSink(Arc::clone(&self.timeline))))
    }

    fn name(&self) -> &str {
        "virtual"
    }
}

struct VirtualSink(Arc<Mutex<Timeline>>);

#[async_trait::async_trait]
impl OutputSink for VirtualSink {
    fn now(&self) -> f64 {
        self.0.lock().unwrap().now
    }

    fn schedule(&mut self, id: u64, samples: Arc<[f32]>, start_at: f64) -> Result<(), PlaybackError> {
        self.0.lock().unwrap().scheduled.push((id, start_at, samples.len()));
        Ok(())
    }

    fn cancel(&mut self, id: u64) {
        self.0.lock().unwrap().cancelled.push(id);
    }

    async fn close(&mut self) {
        self.0.lock().unwrap().closes += 1;
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub controller: SessionController,
    pub connector: Arc<MockConnector>,
    pub remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    pub capture: CaptureProbe,
    pub timeline: Arc<Mutex<Timeline>>,
}

impl Harness {
    pub fn new(connector: Arc<MockConnector>, remotes: mpsc::UnboundedReceiver<RemoteEnd>) -> Self {
        let (capture, probe) = ChannelCapture::new();
        let (output, timeline) = VirtualOutput::new();
        let controller = SessionController::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            Box::new(capture),
            Box::new(output),
            SessionSettings::default(),
        );

        Self {
            controller,
            connector,
            remotes,
            capture: probe,
            timeline,
        }
    }

    pub fn accepting() -> Self {
        let (connector, remotes) = MockConnector::accepting();
        Self::new(connector, remotes)
    }

    pub async fn next_remote(&mut self) -> RemoteEnd {
        tokio::time::timeout(Duration::from_secs(120), self.remotes.recv())
            .await
            .expect("no session was opened")
            .expect("connector dropped")
    }
}

/// Poll `check` until it holds, failing after a generous timeout
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn block(samples: usize, sample_rate: u32, value: f32) -> CaptureBlock {
    CaptureBlock {
        samples: vec![value; samples],
        sample_rate,
    }
}

pub fn speech(samples: usize, sequence: u64) -> TransportEvent {
    TransportEvent::Audio(AudioFrame::from_pcm16(&vec![8000i16; samples], 24000, sequence))
}
