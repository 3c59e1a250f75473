//! REST handlers over the Broker:
//! `POST /chat`, `POST /chat/{id}/message`, `POST /chat/{id}/close`,
//! `GET /chat/{id}/messages?since=<timestamp>`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::schema::{Message, Mode, Tool};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub tool: String,
    pub project_path: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateChatResponse {
    pub conversation_id: String,
}

pub async fn create_chat(State(broker): State<AppState>, Json(body): Json<CreateChatRequest>) -> Result<Json<CreateChatResponse>, ApiError> {
    let tool = Tool::parse(&body.tool).ok_or_else(|| crate::error::BrokerError::AdapterUnavailable(body.tool.clone()))?;
    let mode = parse_mode(body.mode.as_deref());
    let (conversation_id, _cursor) = broker.create_session(tool, body.project_path, body.model, mode).await?;
    Ok(Json(CreateChatResponse { conversation_id }))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

pub async fn send_message(State(broker): State<AppState>, Path(id): Path<String>, Json(body): Json<SendMessageRequest>) -> Result<StatusCode, ApiError> {
    broker.send(&id, &body.text).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn close_chat(State(broker): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    broker.close_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub since: Option<i64>,
}

pub async fn get_messages(
    State(broker): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    // attach()/detach() immediately is the cheapest way to reuse the
    // Broker's snapshot path without adding a separate store passthrough.
    let (subscriber_id, _rx, snapshot) = broker.attach(&id, query.since).await?;
    broker.detach(&id, subscriber_id).await;
    Ok(Json(snapshot))
}

fn parse_mode(raw: Option<&str>) -> Mode {
    match raw {
        Some("plan") => Mode::Plan,
        Some("ask") => Mode::Ask,
        _ => Mode::Agent,
    }
}
