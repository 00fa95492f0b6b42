//! WebSocket client for the local danmaku-source servers.
//!
//! Each upstream platform runs a small source server that decodes the
//! platform's wire format and republishes canonical events over a local
//! WebSocket channel. The envelope is JSON: clients send
//! `{"cmd":"join_room","roomId":N}` / `{"cmd":"leave_room","roomId":N}`,
//! the server pushes `{"event":"danmaku","payload":{...}}` frames. Access
//! can be protected with a static shared secret sent as the `Authorization`
//! header during the upgrade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, trace, warn};

use crate::error::{DanmuError, Result};
use crate::event::DanmuEvent;
use crate::source::{DanmuSource, SourceConnection};

const MAX_ACTIVE_CONNECTIONS: usize = 256;

/// Configuration for a [`WsSource`].
#[derive(Debug, Clone)]
pub struct WsSourceConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8001`
    pub endpoint: String,
    /// Optional shared secret sent as the `Authorization` header
    pub auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ClientCommand {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: u64,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: u64,
    },
}

impl ClientCommand {
    fn to_message(&self) -> Result<Message> {
        let json = serde_json::to_string(self)
            .map_err(|e| DanmuError::protocol(format!("Failed to encode command: {e}")))?;
        Ok(Message::Text(json))
    }
}

/// Internal state for one WebSocket connection.
struct WsConnectionState {
    /// Event receiver fed by the pump task
    event_rx: mpsc::Receiver<DanmuEvent>,
    /// Pump task handle
    tasks: Vec<JoinHandle<()>>,
    /// Shutdown sender
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Limits total active connections if callers forget to disconnect.
    #[allow(dead_code)]
    connection_permit: OwnedSemaphorePermit,
}

impl WsConnectionState {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WsConnectionState {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Danmu source backed by a danmaku-source WebSocket server.
pub struct WsSource {
    source_id: String,
    config: WsSourceConfig,
    connections: RwLock<HashMap<String, Arc<Mutex<WsConnectionState>>>>,
    connection_semaphore: Arc<Semaphore>,
}

impl WsSource {
    /// Create a new source client for the given endpoint.
    pub fn new(source_id: impl Into<String>, config: WsSourceConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
            connections: RwLock::new(HashMap::new()),
            connection_semaphore: Arc::new(Semaphore::new(MAX_ACTIVE_CONNECTIONS)),
        }
    }

    /// Decode one server frame into an event, if it carries one.
    fn decode_frame(text: &str, source_id: &str, room_id: u64) -> Option<DanmuEvent> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Undecodable frame from {source_id}: {e}");
                return None;
            }
        };

        if value.get("event").and_then(|v| v.as_str()) != Some("danmaku") {
            trace!("Ignoring non-danmaku frame from {source_id}");
            return None;
        }

        let payload = value.get("payload")?.clone();
        match serde_json::from_value::<DanmuEvent>(payload) {
            Ok(mut event) => {
                if event.room_id != room_id {
                    // The server multiplexes every joined room over one
                    // channel; only forward the room this handle asked for.
                    return None;
                }
                event.source_id = source_id.to_string();
                Some(event)
            }
            Err(e) => {
                warn!("Undecodable danmaku payload from {source_id}: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl DanmuSource for WsSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn connect(&self, room_id: u64) -> Result<SourceConnection> {
        let connection_permit = self
            .connection_semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                DanmuError::connection(format!(
                    "Too many active connections (max {MAX_ACTIVE_CONNECTIONS})"
                ))
            })?;

        let connect_result = if let Some(token) = &self.config.auth_token {
            use tokio_tungstenite::tungstenite::handshake::client::generate_key;
            use tokio_tungstenite::tungstenite::http::Request;

            let uri: tokio_tungstenite::tungstenite::http::Uri = self
                .config
                .endpoint
                .parse()
                .map_err(|e| DanmuError::connection(format!("Invalid endpoint: {e}")))?;
            let host = uri.host().unwrap_or("localhost");
            let host_header = match uri.port_u16() {
                Some(p) => format!("{host}:{p}"),
                None => host.to_string(),
            };

            let request = Request::builder()
                .uri(&self.config.endpoint)
                .header("Host", host_header)
                .header("Connection", "Upgrade")
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Version", "13")
                .header("Sec-WebSocket-Key", generate_key())
                .header("Authorization", token)
                .body(())
                .map_err(|e| DanmuError::connection(format!("Failed to build request: {e}")))?;
            connect_async(request).await
        } else {
            connect_async(&self.config.endpoint).await
        };

        let (mut ws_stream, _) = connect_result
            .map_err(|e| DanmuError::connection(format!("WebSocket connect failed: {e}")))?;

        ws_stream
            .send(ClientCommand::JoinRoom { room_id }.to_message()?)
            .await
            .map_err(|e| DanmuError::connection(format!("Failed to join room {room_id}: {e}")))?;

        let connection_id = format!("{}-{}-{}", self.source_id, room_id, uuid::Uuid::new_v4());
        let (event_tx, event_rx) = mpsc::channel(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let source_id = self.source_id.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        if let Ok(msg) = (ClientCommand::LeaveRoom { room_id }).to_message() {
                            let _ = ws_stream.send(msg).await;
                        }
                        let _ = ws_stream.close(None).await;
                        break;
                    }

                    frame = ws_stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = WsSource::decode_frame(&text, &source_id, room_id) {
                                    if event_tx.send(event).await.is_err() {
                                        break; // Receiver dropped
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("Danmaku channel for {source_id} room {room_id} closed");
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping/pong and binary frames carry no events.
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {source_id} room {room_id}: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Pump task for {source_id} room {room_id} stopped");
        });

        let state = WsConnectionState {
            event_rx,
            tasks: vec![pump],
            shutdown_tx: Some(shutdown_tx),
            connection_permit,
        };

        self.connections
            .write()
            .await
            .insert(connection_id.clone(), Arc::new(Mutex::new(state)));

        let mut conn = SourceConnection::new(connection_id, &self.source_id, room_id);
        conn.set_connected();
        Ok(conn)
    }

    async fn disconnect(&self, connection: &mut SourceConnection) -> Result<()> {
        if let Some(state_arc) = self.connections.write().await.remove(&connection.id) {
            let mut state = state_arc.lock().await;
            if let Some(tx) = state.shutdown_tx.take() {
                let _ = tx.try_send(());
            }
            // Give the pump a moment to send leave_room before aborting.
            tokio::time::sleep(Duration::from_millis(50)).await;
            state.abort_tasks();
        }
        connection.set_disconnected();
        Ok(())
    }

    async fn receive(&self, connection: &SourceConnection) -> Result<Option<DanmuEvent>> {
        let state_arc = {
            let map = self.connections.read().await;
            map.get(&connection.id).cloned()
        };

        let Some(state_arc) = state_arc else {
            return Err(DanmuError::connection("Connection not found"));
        };

        let mut state = state_arc.lock().await;
        match tokio::time::timeout(Duration::from_millis(100), state.event_rx.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => {
                drop(state);
                let _ = self.connections.write().await.remove(&connection.id);
                Err(DanmuError::connection("Channel closed"))
            }
            Err(_) => Ok(None), // Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        let msg = ClientCommand::JoinRoom { room_id: 555 }.to_message().unwrap();
        match msg {
            Message::Text(text) => {
                assert_eq!(text, r#"{"cmd":"join_room","roomId":555}"#);
            }
            other => panic!("Expected text message, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_stamps_source() {
        let frame = r#"{
            "event": "danmaku",
            "payload": {
                "sender": {"uid": 1, "username": "a", "url": ""},
                "text": "hi",
                "timestamp": 1,
                "roomId": 10,
                "type": "danmaku"
            }
        }"#;

        let event = WsSource::decode_frame(frame, "douyu", 10).unwrap();
        assert_eq!(event.source_id, "douyu");
        assert_eq!(event.room_id, 10);
    }

    #[test]
    fn test_decode_frame_filters_other_rooms() {
        let frame = r#"{
            "event": "danmaku",
            "payload": {
                "sender": {"uid": 1, "username": "a", "url": ""},
                "text": "hi",
                "timestamp": 1,
                "roomId": 11,
                "type": "danmaku"
            }
        }"#;

        assert!(WsSource::decode_frame(frame, "douyu", 10).is_none());
    }

    #[test]
    fn test_decode_frame_ignores_unknown_events() {
        assert!(WsSource::decode_frame(r#"{"event":"heartbeat"}"#, "douyu", 1).is_none());
        assert!(WsSource::decode_frame("not json", "douyu", 1).is_none());
    }
}
