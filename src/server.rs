use crate::protocol::{ClientMessage, ServerMessage};
use crate::service::Workspace;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    sessions: usize,
}

async fn health(State(workspace): State<Arc<Workspace>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: workspace.broadcaster.connection_count(),
        sessions: workspace.sessions.len(),
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(workspace): State<Arc<Workspace>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, workspace))
}

async fn handle_socket(socket: WebSocket, workspace: Arc<Workspace>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection = workspace.open_connection(out_tx);
    let connection_id = connection.id;

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(connection = connection_id, error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                debug!(connection = connection_id, "Socket closed while writing");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection = connection_id, error = %e, "Socket read failed");
                break;
            }
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => workspace.dispatch(&connection, msg).await,
            Err(e) => {
                warn!(connection = connection_id, error = %e, "Rejected malformed message");
                connection.send(ServerMessage::error(None, format!("Invalid message: {}", e)));
            }
        }
    }

    workspace.close_connection(&connection).await;
    drop(connection);
    writer.abort();
}

pub fn router(workspace: Arc<Workspace>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(workspace)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown requested");
}

pub async fn serve(workspace: Arc<Workspace>) -> Result<()> {
    let addr = format!("{}:{}", workspace.config.server_host, workspace.config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "Listening for connections");
    axum::serve(listener, router(workspace))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
