//! HTTP API for driving the voice session from a UI
//!
//! - POST /voice/session/start - Start a session with a persona
//! - POST /voice/session/reconfigure - Change the persona (debounced restart)
//! - POST /voice/session/stop - Stop the session
//! - GET /voice/session/status - Connection state, levels, last error
//! - GET /voice/session/transcript - Conversation so far
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::PersonaRequest;
pub use routes::create_router;
pub use state::AppState;
