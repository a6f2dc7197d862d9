use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::AppState;

/// Live feed of `SignalProduced` events: `/ws/signals`
pub fn stream_routes() -> Router<AppState> {
    Router::new().route("/ws/signals", get(ws_signals_handler))
}

async fn ws_signals_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signal_socket(socket, state))
}

async fn handle_signal_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(signals) = state.signals.as_ref() else {
        let _ = sender
            .send(Message::Text(json!({ "error": "Signal stream not enabled" }).to_string()))
            .await;
        return;
    };
    let mut rx = signals.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "Signal stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Only watch for the client going away
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
