//! Voice session management
//!
//! This module provides the `SessionController` facade and the pieces it wires:
//! - Persona (voice + behavior instruction) sent on each handshake
//! - Reconnection with bounded exponential backoff
//! - Debounced reconfiguration (persona edits restart the session once)
//! - Observable status: connection state, levels, transcript, last error

mod config;
mod controller;
mod debounce;
mod persona;
mod state;
mod status;
mod supervisor;

pub use config::SessionSettings;
pub use controller::SessionController;
pub use debounce::Debouncer;
pub use persona::{PersonaConfig, PersonaTraits, VoiceId, MAX_CONTEXT_CHARS};
pub use state::ConnectionState;
pub use status::{SessionStatus, StatusSnapshot, TranscriptEntry};
pub use supervisor::{ReconnectionSupervisor, RetryPolicy, RetryState, SupervisorExit, MAX_ATTEMPTS};
