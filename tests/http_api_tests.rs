mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{ChannelCapture, Harness, MockConnector, VirtualOutput};
use loqa_voice::{create_router, AppState, SessionController, SessionSettings, VoiceId};
use serde_json::Value;
use tower::ServiceExt;

async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn call_json(app: &axum::Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let harness = Harness::accepting();
    let app = create_router(AppState::new(harness.controller.clone()));

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let mut harness = Harness::accepting();
    let app = create_router(AppState::new(harness.controller.clone()));

    let (status, body) = call_json(
        &app,
        "POST",
        "/voice/session/start",
        Some(r#"{"voice": "Kore", "strictness": 80, "knowledge_context": "Chapter 3: irregular verbs"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connected");
    assert_eq!(body["voice"], "Kore");

    let remote = harness.next_remote().await;
    assert_eq!(remote.persona.voice(), VoiceId::Kore);
    assert!(remote.persona.instruction().contains("irregular verbs"));

    let (status, body) = call_json(&app, "GET", "/voice/session/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connected");
    assert!(body["last_error"].is_null());
    assert!(body["started_at"].is_string());

    let (status, body) = call_json(&app, "GET", "/voice/session/transcript", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Array(vec![]));

    let (status, body) = call_json(
        &app,
        "POST",
        "/voice/session/reconfigure",
        Some(r#"{"voice": "Aoede", "instruction": "Only speak French."}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["voice"], "Aoede");

    let (status, body) = call_json(&app, "POST", "/voice/session/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "disconnected");
    assert!(remote.shutdown.is_cancelled());

    // Stop again is still fine
    let (status, _) = call_json(&app, "POST", "/voice/session/stop", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_denied_microphone_returns_service_unavailable() {
    let (connector, _remotes) = MockConnector::accepting();
    let (capture, _probe) = ChannelCapture::denied();
    let (output, _timeline) = VirtualOutput::new();
    let controller = SessionController::new(connector, Box::new(capture), Box::new(output), SessionSettings::default());
    let app = create_router(AppState::new(controller));

    let (status, body) = call_json(&app, "POST", "/voice/session/start", Some("{}")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("Microphone unavailable"));

    let (_, body) = call_json(&app, "GET", "/voice/session/status", None).await;
    assert_eq!(body["state"], "disconnected");
    assert!(body["last_error"].is_string());
}

#[tokio::test]
async fn test_unknown_voice_is_rejected() {
    let harness = Harness::accepting();
    let app = create_router(AppState::new(harness.controller.clone()));

    let (status, _) = call(&app, "POST", "/voice/session/start", Some(r#"{"voice": "Zeus"}"#)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(harness.connector.attempts(), 0);
}
