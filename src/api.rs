//! HTTP API.
//!
//! | Method | Path | Auth |
//! |---|---|---|
//! | GET | `/health` | none |
//! | POST | `/requests` | none |
//! | GET | `/requests/{id}?t=TOKEN` | requester token |
//! | PATCH | `/requests/{id}/status` | `Authorization: Bearer <admin token>` |
//!
//! Request bodies are read as raw bytes and decoded with serde_json; any body
//! that does not decode is a 400 "bad json", whatever its content type.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::engine::Engine;
use crate::error::Error;
use crate::model::{EventId, RequestId, Status};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Request body for `POST /requests`.
#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    #[serde(default)]
    pub title: String,
}

/// Response body for `POST /requests`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestResponse {
    pub request_id: RequestId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub tracking_url: String,
}

/// Query string for `GET /requests/{id}`.
#[derive(Debug, Deserialize)]
pub struct ReadRequestQuery {
    pub t: Option<String>,
}

/// Response body for `GET /requests/{id}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequestResponse {
    pub request_id: RequestId,
    pub title: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

/// Request body for `PATCH /requests/{id}/status`.
#[derive(Debug, Deserialize)]
pub struct TransitionStatusBody {
    #[serde(default)]
    pub status: String,
}

/// Response body for `PATCH /requests/{id}/status`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionStatusResponse {
    pub request_id: RequestId,
    pub new_status: Status,
    pub changed_at: DateTime<Utc>,
    pub event_id: EventId,
}

/// API error type mapping engine errors to HTTP status codes.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::MessageFormat(_) => (StatusCode::BAD_REQUEST, "bad json".to_string()),
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Error::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not found".to_string()),
            Error::Queue(_) => {
                tracing::error!(error = %self.0, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue".to_string())
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError(Error::Validation("bad json".to_string())))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok\n"
}

/// Handler for `POST /requests`.
pub async fn create_request_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CreateRequestResponse>, ApiError> {
    let payload: CreateRequestBody = parse_body(&body)?;
    let created = state.engine.create_request(&payload.title).await?;

    Ok(Json(CreateRequestResponse {
        request_id: created.request.id,
        title: created.request.title,
        created_at: created.request.created_at,
        tracking_url: created.tracking_url,
    }))
}

/// Handler for `GET /requests/{id}?t=TOKEN`.
pub async fn read_request_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ReadRequestQuery>,
) -> Result<Json<ReadRequestResponse>, ApiError> {
    let request = state.engine.read_request(&id, query.t.as_deref()).await?;

    Ok(Json(ReadRequestResponse {
        request_id: request.id,
        title: request.title,
        status: request.status,
        created_at: request.created_at,
    }))
}

/// Handler for `PATCH /requests/{id}/status`.
///
/// The credential is checked before the body is looked at.
pub async fn transition_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TransitionStatusResponse>, ApiError> {
    let credential = bearer_token(&headers);
    state.engine.authorize_admin(credential)?;

    let payload: TransitionStatusBody = parse_body(&body)?;
    let event = state
        .engine
        .transition_status(&id, &payload.status, credential)
        .await?;

    Ok(Json(TransitionStatusResponse {
        request_id: event.request_id,
        new_status: event.new_status,
        changed_at: event.changed_at,
        event_id: event.event_id,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/requests", post(create_request_handler))
        .route("/requests/{id}", get(read_request_handler))
        .route("/requests/{id}/status", patch(transition_status_handler))
        .layer(Extension(Arc::new(state)))
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::error::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
