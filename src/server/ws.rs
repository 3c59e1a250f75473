//! WebSocket subscription transport. One connection carries an auth
//! handshake followed by any number of subscribe/unsubscribe frames
//! against different conversations: one task forwards outbound frames
//! while the recv loop handles inbound control frames, with one bounded
//! `mpsc` per conversation subscription.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::runtime::subscriber::{SubscriberEvent, SubscriberId};
use crate::schema::Message as TranscriptMessage;

use super::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(broker): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle(socket, broker))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Auth { token: String },
    Subscribe { conversation_id: String, cursor: Option<i64> },
    Unsubscribe { conversation_id: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
    Subscribed { conversation_id: String, cursor: Option<i64> },
    Message { conversation_id: String, message: TranscriptMessage },
    Error { conversation_id: Option<String>, code: String, message: String },
}

/// `AuthRequired` is local to this transport layer: the core never sees
/// unauthenticated traffic.
fn check_token(token: &str) -> bool {
    !token.is_empty()
}

async fn handle(socket: WebSocket, broker: AppState) {
    use futures_util::StreamExt;
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);

    let writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut authenticated = false;
    let mut subscriptions: HashMap<String, (SubscriberId, tokio::task::JoinHandle<()>)> = HashMap::new();

    while let Some(Ok(msg)) = stream.next().await {
        let WsMessage::Text(text) = msg else { continue };
        let text = text.to_string();
        let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) else { continue };

        match frame {
            InboundFrame::Auth { token } => {
                authenticated = check_token(&token);
                if !authenticated {
                    let _ = out_tx
                        .send(OutboundFrame::Error { conversation_id: None, code: "auth_required".into(), message: "invalid token".into() })
                        .await;
                }
            }
            InboundFrame::Subscribe { conversation_id, cursor } => {
                if !authenticated {
                    let _ = out_tx
                        .send(OutboundFrame::Error { conversation_id: Some(conversation_id), code: "auth_required".into(), message: "subscribe before auth".into() })
                        .await;
                    continue;
                }
                match broker.attach(&conversation_id, cursor).await {
                    Ok((sub_id, mut rx, snapshot)) => {
                        let _ = out_tx.send(OutboundFrame::Subscribed { conversation_id: conversation_id.clone(), cursor }).await;
                        for message in snapshot {
                            let _ = out_tx
                                .send(OutboundFrame::Message { conversation_id: conversation_id.clone(), message })
                                .await;
                        }
                        let forward_tx = out_tx.clone();
                        let forward_conv = conversation_id.clone();
                        let handle = tokio::spawn(async move {
                            while let Some(event) = rx.recv().await {
                                let frame = match event {
                                    SubscriberEvent::Message(message) => OutboundFrame::Message { conversation_id: forward_conv.clone(), message },
                                    SubscriberEvent::BackpressureDropped => OutboundFrame::Error {
                                        conversation_id: Some(forward_conv.clone()),
                                        code: "backpressure".into(),
                                        message: "subscriber buffer overflowed".into(),
                                    },
                                };
                                if forward_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        });
                        subscriptions.insert(conversation_id, (sub_id, handle));
                    }
                    Err(err) => {
                        let _ = out_tx
                            .send(OutboundFrame::Error { conversation_id: Some(conversation_id), code: "error".into(), message: err.to_string() })
                            .await;
                    }
                }
            }
            InboundFrame::Unsubscribe { conversation_id } => {
                if let Some((sub_id, handle)) = subscriptions.remove(&conversation_id) {
                    broker.detach(&conversation_id, sub_id).await;
                    handle.abort();
                }
            }
        }
    }

    for (conversation_id, (sub_id, handle)) in subscriptions {
        broker.detach(&conversation_id, sub_id).await;
        handle.abort();
    }
    drop(out_tx);
    if let Err(err) = writer.await {
        warn!(%err, "ws writer task ended abnormally");
    }
}
