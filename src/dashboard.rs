use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;

use crate::error::PResult;
use crate::live_status::LiveStatus;
use crate::pipeline::{Command, DisplayEvent, DisplaySink};

/// Display events waiting per slow client before it starts losing them.
pub const CLIENT_BACKLOG: usize = 1024;

/// Fans serialized display events out to every websocket client.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl DisplaySink for BroadcastSink {
    fn deliver(&self, event: DisplayEvent) {
        match serde_json::to_string(&event) {
            // no connected clients is fine
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => log::warn!("[DASHBOARD] Failed to serialize event: {e}"),
        }
    }
}

#[derive(Clone)]
pub struct DashboardState {
    pub sink: BroadcastSink,
    pub commands: mpsc::Sender<Command>,
    pub status: Arc<RwLock<LiveStatus>>,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_dashboard(state: DashboardState, addr: SocketAddr) -> PResult<()> {
    log::info!("[DASHBOARD] Starting embedded server at http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("dashboard_static.html"))
}

async fn status_handler(State(state): State<DashboardState>) -> Json<LiveStatus> {
    Json(state.status.read().await.clone())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: DashboardState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.sink.subscribe();
    log::debug!("[DASHBOARD] Client connected");

    let current = DisplayEvent::Status(state.status.read().await.connection.clone());
    if let Ok(json) = serde_json::to_string(&current) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    let mut push = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("[DASHBOARD] Slow client skipped {missed} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let commands = state.commands.clone();
    let mut control = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match Command::parse(&text) {
                    Ok(command) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("[DASHBOARD] Ignoring command {text:?}: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut push => control.abort(),
        _ = &mut control => push.abort(),
    }
    log::debug!("[DASHBOARD] Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderStatus;

    #[test]
    fn test_sink_serializes_events() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.deliver(DisplayEvent::Recorder(RecorderStatus {
            active: true,
            rows: 3,
            started_at_ms: Some(10),
        }));
        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "recorder");
        assert_eq!(json["rows"], 3);
    }

    #[test]
    fn test_sink_without_clients() {
        let sink = BroadcastSink::new(4);
        sink.deliver(DisplayEvent::NothingToExport);
    }

    #[tokio::test]
    async fn test_status_handler() {
        let (commands, _rx) = mpsc::channel(1);
        let mut status = LiveStatus::new();
        status.device_id = "bench".to_string();
        let state = DashboardState {
            sink: BroadcastSink::new(4),
            commands,
            status: Arc::new(RwLock::new(status)),
        };
        let Json(body) = status_handler(State(state)).await;
        assert_eq!(body.device_id, "bench");
    }
}
