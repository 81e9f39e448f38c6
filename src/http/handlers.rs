use super::state::AppState;
use crate::error::{SessionError, TransportError};
use crate::session::{ConnectionState, PersonaConfig, PersonaTraits, TranscriptEntry, VoiceId};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PersonaRequest {
    /// Voice to speak with (default: Puck)
    #[serde(default)]
    pub voice: VoiceId,

    /// Explicit behavior instruction; overrides the personality sliders
    #[serde(default)]
    pub instruction: Option<String>,

    /// Personality sliders and knowledge context
    #[serde(flatten)]
    pub traits: PersonaTraits,
}

impl PersonaRequest {
    pub fn into_persona(self) -> PersonaConfig {
        match self.instruction {
            Some(instruction) if !instruction.trim().is_empty() => PersonaConfig::new(self.voice, instruction),
            _ => PersonaConfig::from_traits(self.voice, &self.traits),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub state: ConnectionState,
    pub voice: Option<VoiceId>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_status(error: &SessionError) -> StatusCode {
    match error {
        SessionError::Capture(_) | SessionError::Playback(_) => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Transport(TransportError::HandshakeRejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
        SessionError::Cancelled => StatusCode::CONFLICT,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /voice/session/start
/// Start (or restart) the voice session with a persona
pub async fn start_session(State(state): State<AppState>, Json(req): Json<PersonaRequest>) -> impl IntoResponse {
    let persona = req.into_persona();
    let voice = persona.voice();

    info!("Starting voice session with voice {}", voice);

    match state.controller.start(persona).await {
        Ok(()) => (
            StatusCode::OK,
            Json(SessionResponse {
                state: state.controller.state(),
                voice: Some(voice),
                message: format!("Voice session started with {}", voice),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start voice session: {}", e);
            (
                error_status(&e),
                Json(ErrorResponse {
                    error: format!("Failed to start voice session: {}", e),
                }),
            )
                .into_response()
        }
    }
}

/// POST /voice/session/reconfigure
/// Change the persona; the running session restarts once edits settle
pub async fn reconfigure_session(
    State(state): State<AppState>,
    Json(req): Json<PersonaRequest>,
) -> impl IntoResponse {
    let persona = req.into_persona();
    let voice = persona.voice();
    let active = state.controller.is_active();

    state.controller.reconfigure(persona).await;

    let message = if active {
        "Persona updated, session will restart".to_string()
    } else {
        "Persona stored for the next start".to_string()
    };

    (
        StatusCode::ACCEPTED,
        Json(SessionResponse {
            state: state.controller.state(),
            voice: Some(voice),
            message,
        }),
    )
}

/// POST /voice/session/stop
/// Stop the voice session (idempotent)
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.stop().await;
    info!("Voice session stopped via HTTP");

    (
        StatusCode::OK,
        Json(SessionResponse {
            state: state.controller.state(),
            voice: state.controller.persona().map(|p| p.voice()),
            message: "Voice session stopped".to_string(),
        }),
    )
}

/// GET /voice/session/status
pub async fn get_session_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.controller.snapshot().await))
}

/// GET /voice/session/transcript
pub async fn get_session_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let transcript: Vec<TranscriptEntry> = state.controller.transcript().await;
    (StatusCode::OK, Json(transcript))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_instruction_wins() {
        let req: PersonaRequest =
            serde_json::from_str(r#"{"voice":"Charon","instruction":"Speak like a pirate.","humor":90}"#).unwrap();
        let persona = req.into_persona();

        assert_eq!(persona.voice(), VoiceId::Charon);
        assert_eq!(persona.instruction(), "Speak like a pirate.");
    }

    #[test]
    fn test_sliders_used_without_instruction() {
        let req: PersonaRequest = serde_json::from_str(r#"{"verbosity":5}"#).unwrap();
        let persona = req.into_persona();

        assert_eq!(persona.voice(), VoiceId::Puck);
        assert!(persona.instruction().contains("short sentences"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&SessionError::Transport(TransportError::HandshakeRejected("quota".into()))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(&SessionError::Transport(TransportError::Connect("refused".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(error_status(&SessionError::Cancelled), StatusCode::CONFLICT);
    }
}
