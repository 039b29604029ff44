//! WebSocket endpoint for live trip updates.
//!
//! Every connection gets its own broadcast receiver and its own forward task;
//! there is no shared socket state between connections. Clients receive an
//! `active_trips` snapshot on connect, then the event stream as it happens,
//! and can re-request the snapshot at any time to resync after missed events.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::trips::ActiveTripView;
use crate::tracker::BusTracker;

#[derive(Clone)]
pub struct WsState {
    pub tracker: Arc<BusTracker>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Ask for a fresh snapshot of every running trip
    RequestActiveTrips,
}

/// Messages the server sends that are not tracker events.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    /// Snapshot of all running trips
    ActiveTrips {
        active_trips: Vec<ActiveTripView>,
        count: usize,
    },
}

/// WebSocket endpoint for trip lifecycle events
pub async fn ws_trips(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.tracker.subscribe();

    let connected = ServerMessage::Connected {
        message: "Connected to trip updates".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Initial state, so the client renders running trips without waiting for
    // their next position update.
    if let Ok(json) = serde_json::to_string(&active_trips_message(&state).await) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Channel from the receiver loop to the forward task for snapshot
    // requests.
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel::<()>(16);

    let forward_state = state.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = sub_rx.recv() => {
                    let msg = active_trips_message(&forward_state).await;
                    if let Ok(json) = serde_json::to_string(&msg) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                result = event_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        // Slow consumer skips ahead; the client resyncs via
                        // request_active_trips.
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "websocket client lagged behind event stream");
                            continue;
                        }
                    }
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                    match client_msg {
                        ClientMessage::RequestActiveTrips => {
                            let _ = sub_tx.send(()).await;
                        }
                    }
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
}

async fn active_trips_message(state: &WsState) -> ServerMessage {
    let active_trips: Vec<ActiveTripView> = state
        .tracker
        .active_trips()
        .await
        .into_iter()
        .map(ActiveTripView::from)
        .collect();
    let count = active_trips.len();
    ServerMessage::ActiveTrips {
        active_trips,
        count,
    }
}
