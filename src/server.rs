//! HTTP server for streamed chat answers.
//!
//! # Endpoints
//!
//! | Method | Path        | Description                                   |
//! |--------|-------------|-----------------------------------------------|
//! | `POST` | `/api/chat` | Answer the latest turn as an NDJSON stream    |
//! | `GET`  | `/health`   | Health check (status, version, timestamp)     |
//!
//! # Request
//!
//! ```json
//! { "chat": { "id": "c1", "messages": [{ "role": "user", "content": "What is a balk?" }] } }
//! ```
//!
//! # Response
//!
//! `200` with `Content-Type: text/event-stream`; the body is one JSON record
//! per line (see [`crate::stream`]). Failures after the stream has started
//! are reported in-band as `error` records, never as HTTP statuses.
//!
//! # Error Contract
//!
//! Requests rejected before streaming get a JSON error body:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "chat.messages must not be empty" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! chat widgets.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Chat, Role};
use crate::orchestrator::{spawn_turn, Responder};
use crate::services::{build_responder, Secrets, ServiceParts};
use crate::stream::encode_record;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    responder: Arc<Responder>,
    request_timeout: Duration,
}

/// Starts the HTTP server using clients built from config and the environment.
///
/// Fails before binding if a required API key is missing.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let parts = ServiceParts::connect(config, &Secrets::from_env())?;
    let responder = Arc::new(build_responder(config, parts)?);
    run_server_with_responder(config, responder).await
}

/// Starts the HTTP server around an existing [`Responder`].
pub async fn run_server_with_responder(
    config: &Config,
    responder: Arc<Responder>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(
        responder,
        Duration::from_secs(config.server.request_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// The application router.
pub fn router(responder: Arc<Responder>, request_timeout: Duration) -> Router {
    let state = AppState {
        responder,
        request_timeout,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
    /// RFC 3339 server time.
    timestamp: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    chat: Chat,
}

fn validate_chat(chat: &Chat) -> Result<(), AppError> {
    if chat.id.trim().is_empty() {
        return Err(bad_request("chat.id must not be empty"));
    }
    if chat.messages.is_empty() {
        return Err(bad_request("chat.messages must not be empty"));
    }
    if !chat.messages.iter().any(|m| m.role == Role::User) {
        return Err(bad_request("chat.messages must contain a user message"));
    }
    Ok(())
}

/// Handler for `POST /api/chat`.
///
/// Validates the request, starts the turn on a background task and returns
/// immediately with a body that yields records as they are produced.
/// Dropping the body (client disconnect) closes the reader, which stops the
/// turn at its next write.
async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    validate_chat(&request.chat)?;

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "chat",
        request_id = %request_id,
        chat_id = %request.chat.id,
    );
    span.in_scope(|| {
        tracing::info!(messages = request.chat.messages.len(), "chat request received")
    });

    let rx = spawn_turn(
        state.responder.clone(),
        request.chat,
        state.request_timeout,
        span,
    );
    let body = Body::from_stream(ReceiverStream::new(rx).map(|event| encode_record(&event)));

    let mut response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}
