use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

use super::state::ConnectionState;
use crate::audio::LevelMeter;
use crate::transport::Speaker;

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// When the first fragment of this turn arrived
    pub timestamp: DateTime<Utc>,
}

/// Ordered conversation log
///
/// Consecutive fragments from the same speaker extend the current entry until
/// the entry is sealed (by an interruption or a change of speaker).
#[derive(Debug, Default)]
struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    sealed: bool,
}

impl TranscriptLog {
    fn push(&mut self, speaker: Speaker, text: &str) {
        if text.is_empty() {
            return;
        }

        match self.entries.last_mut() {
            Some(last) if !self.sealed && last.speaker == speaker => last.text.push_str(text),
            _ => self.entries.push(TranscriptEntry {
                speaker,
                text: text.to_string(),
                timestamp: Utc::now(),
            }),
        }

        self.sealed = false;
    }

    fn seal(&mut self) {
        self.sealed = true;
    }
}

/// Serializable view of a session for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub input_volume: f32,
    pub output_level: f32,
    pub last_error: Option<String>,
    pub transcript_entries: usize,
    pub started_at: Option<DateTime<Utc>>,
}

/// Observable session state shared by the controller, supervisor and UI
///
/// Levels are lock-free; state and errors are watch channels so readers can
/// either poll or wait for changes.
pub struct SessionStatus {
    state: watch::Sender<ConnectionState>,
    last_error: watch::Sender<Option<String>>,
    input_volume: LevelMeter,
    output_level: Arc<LevelMeter>,
    transcript: Mutex<TranscriptLog>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            last_error: watch::Sender::new(None),
            input_volume: LevelMeter::new(),
            output_level: Arc::new(LevelMeter::new()),
            transcript: Mutex::new(TranscriptLog::default()),
            started_at: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection state: {} -> {}", previous, state);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.last_error.send_replace(Some(error.into()));
    }

    pub fn clear_error(&self) {
        self.last_error.send_replace(None);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    pub fn set_input_volume(&self, volume: f32) {
        self.input_volume.store(volume);
    }

    pub fn input_volume(&self) -> f32 {
        self.input_volume.load()
    }

    pub fn output_level(&self) -> f32 {
        self.output_level.load()
    }

    /// Meter the playback actor writes into
    pub fn output_meter(&self) -> Arc<LevelMeter> {
        Arc::clone(&self.output_level)
    }

    pub async fn record_transcript(&self, speaker: Speaker, text: &str) {
        self.transcript.lock().await.push(speaker, text);
    }

    pub async fn seal_transcript(&self) {
        self.transcript.lock().await.seal();
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().await.entries.clone()
    }

    /// Forget the previous conversation; called on a user-initiated start
    pub async fn reset(&self) {
        *self.transcript.lock().await = TranscriptLog::default();
        *self.started_at.lock().await = Some(Utc::now());
        self.clear_error();
        self.input_volume.store(0.0);
        self.output_level.store(0.0);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            input_volume: self.input_volume(),
            output_level: self.output_level(),
            last_error: self.last_error(),
            transcript_entries: self.transcript.lock().await.entries.len(),
            started_at: *self.started_at.lock().await,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fragments_merge_per_speaker() {
        let status = SessionStatus::new();

        status.record_transcript(Speaker::User, "What is ").await;
        status.record_transcript(Speaker::User, "a verb?").await;
        status.record_transcript(Speaker::Model, "A verb is ").await;
        status.record_transcript(Speaker::Model, "an action word.").await;

        let transcript = status.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].text, "What is a verb?");
        assert_eq!(transcript[1].speaker, Speaker::Model);
        assert_eq!(transcript[1].text, "A verb is an action word.");
    }

    #[tokio::test]
    async fn test_seal_starts_new_entry() {
        let status = SessionStatus::new();

        status.record_transcript(Speaker::Model, "Let me explain").await;
        status.seal_transcript().await;
        status.record_transcript(Speaker::Model, "Sure, go ahead.").await;
        status.record_transcript(Speaker::Model, "").await;

        let transcript = status.transcript().await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].text, "Sure, go ahead.");
    }

    #[tokio::test]
    async fn test_state_and_errors_are_observable() {
        let status = SessionStatus::new();
        let mut states = status.subscribe_state();

        status.set_state(ConnectionState::Connecting);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

        status.set_error("boom");
        assert_eq!(status.last_error().as_deref(), Some("boom"));

        status.reset().await;
        let snapshot = status.snapshot().await;
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.started_at.is_some());
        assert_eq!(snapshot.state, ConnectionState::Connecting);
    }
}
