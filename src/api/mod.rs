//! HTTP surface over the allocation registry.
//!
//! - `POST /api/get-socket-path` `{"roomId"}` → `{"socketPath"}`
//! - `POST /api/heartbeat` `{"roomId"}` → `{"message"}`
//! - `GET /health`

mod server;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AllocationError;
use crate::orchestrator::AllocationRegistry;

pub use server::ApiServer;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<AllocationRegistry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomRequest {
    #[serde(default)]
    room_id: Option<String>,
}

impl RoomRequest {
    fn room_id(self) -> Result<String, ApiError> {
        self.room_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("roomId is required".to_string()))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SocketPathResponse {
    socket_path: String,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::InvalidSession { .. } => Self::BadRequest(err.to_string()),
            AllocationError::SessionNotFound { .. } => Self::NotFound(err.to_string()),
            other => {
                tracing::error!(error = %other, "Request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

async fn get_socket_path(
    State(state): State<ApiState>,
    body: Result<Json<RoomRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let room_id = body?.0.room_id()?;
    let allocated = state.registry.allocate(&room_id).await?;
    let status = if allocated.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(SocketPathResponse {
            socket_path: allocated.route.0,
        }),
    ))
}

async fn heartbeat(
    State(state): State<ApiState>,
    body: Result<Json<RoomRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let room_id = body?.0.room_id()?;
    state.registry.heartbeat(&room_id).await?;
    Ok(Json(serde_json::json!({ "message": "Heartbeat received" })))
}

async fn health() -> &'static str {
    "ok"
}

/// CORS restricted to `origins`, credentials allowed. Unparseable origins
/// are skipped with a warning.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

pub fn router(state: ApiState, origins: &[String]) -> Router {
    Router::new()
        .route("/api/get-socket-path", post(get_socket_path))
        .route("/api/heartbeat", post(heartbeat))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors_layer(origins))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_room_id_required() {
        let missing: RoomRequest = serde_json::from_str("{}").unwrap();
        assert!(matches!(missing.room_id(), Err(ApiError::BadRequest(_))));

        let blank: RoomRequest = serde_json::from_str(r#"{"roomId": "  "}"#).unwrap();
        assert!(blank.room_id().is_err());

        let ok: RoomRequest = serde_json::from_str(r#"{"roomId": "room-1"}"#).unwrap();
        assert_eq!(ok.room_id().unwrap(), "room-1");
    }

    #[test]
    fn test_socket_path_serializes_camel_case() {
        let body = serde_json::to_value(SocketPathResponse {
            socket_path: "calm-fox-abc12".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "socketPath": "calm-fox-abc12" }));
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found = ApiError::from(AllocationError::SessionNotFound {
            session_id: "room-9".to_string(),
        });
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let invalid = ApiError::from(AllocationError::InvalidSession {
            reason: "empty".to_string(),
        });
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
