//! WebSocket Handler
//!
//! Bridges the engine's event bus (C9) to WebSocket clients: one outbound
//! `WsMessage::Event` per `DomainEvent` published by the orchestrator,
//! recovery supervisor, or batch pipeline. A lagged/slow subscriber simply
//! misses events per C9's non-blocking contract; nothing here retries.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::events::DomainEvent;
use crate::infrastructure::server::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsMessage {
    Connected { client_id: String },
    Event(DomainEvent),
    Ping,
    Pong,
    Error { message: String },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let client_id = Uuid::new_v4().to_string();
    let connected_msg = WsMessage::Connected { client_id: client_id.clone() };

    if let Ok(json) = serde_json::to_string(&connected_msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    let mut subscriber = state.event_bus.subscribe();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = subscriber.recv().await {
            let msg = WsMessage::Event((*event).clone());
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(ws_msg) = serde_json::from_str::<WsMessage>(&text) {
                        if let WsMessage::Ping = ws_msg {
                            // clients may ping to keep the connection alive;
                            // no pong is sent back over this read-only half
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    tracing::info!("WebSocket client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::ProcessingStartedEvent;
    use chrono::Utc;

    #[test]
    fn ws_message_event_tags_like_the_domain_event() {
        let event = DomainEvent::ProcessingStarted(ProcessingStartedEvent {
            take_id: 1,
            scene_id: 1,
            detector_count: 1,
            timestamp: Utc::now(),
        });
        let msg = WsMessage::Event(event);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["payload"]["type"], "processing_started");
    }
}
