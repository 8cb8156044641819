// WebSocket endpoint for live alerts
//
// Subscribers connect to /ws/alerts, optionally scoped to one project
// via ?project=. Outbound delivery is best-effort with backpressure
// (the hub queue drops oldest); a subscriber is only disconnected after
// three consecutive write timeouts or 60 s of inbound silence. Clients
// send {"type":"ping"} and receive {"type":"pong"}; reconnection is
// purely client-side.

use std::sync::Arc;
use std::time::Duration;

use agentsight_contracts::Alert;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, timeout, Instant};

use crate::hub::BroadcastHub;

/// Inbound control frames above this size close the connection.
const MAX_CONTROL_BYTES: usize = 4 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_WRITE_TIMEOUTS: u32 = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEPALIVE_AFTER: Duration = Duration::from_secs(25);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/ws/alerts", get(ws_alerts))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Server-side project filter; absent means all projects.
    pub project: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    Alert { data: &'a Alert },
    Ping,
    Pong,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    frame_type: String,
}

async fn ws_alerts(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, query.project))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>, project: Option<String>) {
    let (subscriber_id, queue) = hub.subscribe(project).await;
    let (mut sender, mut receiver) = socket.split();

    let mut consecutive_timeouts = 0u32;
    let mut last_inbound = Instant::now();
    let mut last_keepalive = Instant::now();
    let mut housekeeping = interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            alert = queue.pop() => {
                let frame = match serde_json::to_string(&OutboundFrame::Alert { data: &alert }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "alert frame encode failed");
                        continue;
                    }
                };
                match timeout(WRITE_TIMEOUT, sender.send(Message::Text(frame))).await {
                    Ok(Ok(())) => consecutive_timeouts = 0,
                    Ok(Err(_)) => break,
                    Err(_) => {
                        consecutive_timeouts += 1;
                        tracing::warn!(
                            subscriber_id = %subscriber_id,
                            consecutive_timeouts,
                            "alert write timed out"
                        );
                        if consecutive_timeouts >= MAX_WRITE_TIMEOUTS {
                            break;
                        }
                    }
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if text.len() > MAX_CONTROL_BYTES {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::SIZE,
                                    reason: "message too large".into(),
                                })))
                                .await;
                            break;
                        }
                        if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                            if frame.frame_type == "ping" {
                                let pong = match serde_json::to_string(&OutboundFrame::Pong) {
                                    Ok(pong) => pong,
                                    Err(_) => continue,
                                };
                                if sender.send(Message::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        last_inbound = Instant::now();
                        if payload.len() > MAX_CONTROL_BYTES {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::SIZE,
                                    reason: "message too large".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %subscriber_id, error = %e, "socket error");
                        break;
                    }
                }
            }

            _ = housekeeping.tick() => {
                if last_inbound.elapsed() > IDLE_TIMEOUT {
                    tracing::info!(subscriber_id = %subscriber_id, "closing idle subscriber");
                    break;
                }
                if last_inbound.elapsed() > KEEPALIVE_AFTER
                    && last_keepalive.elapsed() > KEEPALIVE_AFTER
                {
                    last_keepalive = Instant::now();
                    let ping = match serde_json::to_string(&OutboundFrame::Ping) {
                        Ok(ping) => ping,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(ping)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    hub.unsubscribe(subscriber_id).await;
    tracing::info!(
        subscriber_id = %subscriber_id,
        dropped = queue.dropped(),
        "subscriber disconnected"
    );
}
