//! Thin reference HTTP+WebSocket transport for the broker's external
//! interface. Everything outside this module is the actual broker core;
//! this module only translates wire requests into `Broker` calls and
//! `Broker` results back into wire responses.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::Span;

use crate::broker::Broker;
use crate::error::BrokerError;

pub type AppState = Arc<Broker>;

pub fn build_router(broker: AppState) -> Router {
    Router::new()
        .route("/chat", post(routes::create_chat))
        .route("/chat/{id}/message", post(routes::send_message))
        .route("/chat/{id}/close", post(routes::close_chat))
        .route("/chat/{id}/messages", get(routes::get_messages))
        .route("/ws", get(ws::upgrade))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(axum::middleware::from_fn(enrich_span))
        .with_state(broker)
}

async fn enrich_span(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let path = req.uri().path().to_string();
    let span = Span::current();
    span.record("path", &path.as_str());
    next.run(req).await
}

/// Maps a `BrokerError` to the narrowest applicable HTTP status without
/// leaking implementation details.
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            BrokerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            BrokerError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            BrokerError::AuthRequired => (StatusCode::UNAUTHORIZED, "auth_required"),
            BrokerError::AdapterUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "adapter_unavailable"),
            BrokerError::Backpressure => (StatusCode::TOO_MANY_REQUESTS, "backpressure"),
            BrokerError::ChildSpawnFailed(_) | BrokerError::ChildCrashed(_) => (StatusCode::BAD_GATEWAY, "child_error"),
            BrokerError::StorageError(_) | BrokerError::FailedPrecondition => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };
        (status, axum::Json(serde_json::json!({ "code": code, "message": self.0.to_string() }))).into_response()
    }
}
