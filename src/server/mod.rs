//! Dashboard HTTP + WebSocket server
//!
//! Serves the embedded dashboard page, upgrades `/ws` connections into the
//! broadcast stream, and exposes the snapshot history as JSON. Each client
//! gets one reader task (this handler) and one writer task fed from the bus
//! dispatcher; the dispatcher owns the client set.

pub mod broadcast;

pub use broadcast::{BroadcastBus, ConnectHook};

use crate::config::{ConfigUpdate, SharedConfig};
use crate::error::{Result, ScalerError};
use crate::history::SnapshotStore;
use crate::scaler::RuntimeState;
use crate::types::{kind, Broadcast, UtilizationSnapshot};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Dashboard page compiled into the binary
const CONSOLE_HTML: &str = include_str!("../../ui/console.html");

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub bus: BroadcastBus,
    pub config: SharedConfig,
    pub store: Arc<dyn SnapshotStore>,
    pub runtime: Arc<RuntimeState>,
}

/// Build the dashboard router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(console))
        .route("/ws", get(ws_upgrade))
        .route("/snapshots", get(snapshots))
        .layer(middleware::from_fn(cors))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// Serve the router until the shutdown signal flips
pub async fn run_server(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port = port, "Dashboard server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| ScalerError::Server(e.to_string()))
}

async fn console() -> Html<&'static str> {
    Html(CONSOLE_HTML)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut stream) = mpsc::channel::<String>(64);
    let client_id = state.bus.register(sink).await;

    // writer task: bus dispatcher -> socket
    let write_task = tokio::spawn(async move {
        while let Some(json) = stream.recv().await {
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // reader loop: socket -> live config updates
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_client_message(&state, &text),
            Ok(Message::Close(_)) => {
                debug!(client = client_id, "Client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(client = client_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.bus.deregister(client_id).await;
    write_task.abort();
}

/// Parse one inbound client frame; only `conf_update` is meaningful
fn handle_client_message(state: &AppState, text: &str) {
    let envelope: Broadcast = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed client message");
            return;
        }
    };

    match envelope.kind.as_str() {
        kind::CONF_UPDATE => {
            let update: ConfigUpdate = match serde_json::from_value(envelope.data) {
                Ok(update) => update,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed conf_update payload");
                    return;
                }
            };
            match state.config.apply_update(update) {
                Ok(config) => {
                    info!(
                        min = config.min_instances,
                        max = config.max_instances,
                        target = config.target_cpu_util,
                        "Live configuration updated"
                    );
                    state.bus.publish(Broadcast::new(kind::CONFIG, &config));
                }
                Err(e) => warn!(error = %e, "Rejected conf_update"),
            }
        }
        other => {
            warn!(kind = %other, "Ignoring unknown client message type");
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotsQuery {
    start: Option<String>,
}

/// Snapshot history plus the future-flagged prediction seed as JSON
async fn snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotsQuery>,
) -> std::result::Result<Json<Vec<UtilizationSnapshot>>, (StatusCode, String)> {
    let start = match query.start {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid start date: {e}")))?,
        None => Utc::now(),
    };

    let cluster = state.config.get().cluster_identifier;
    let mut snapshots = state
        .store
        .seed_history(&cluster, start)
        .await
        .map_err(internal_error)?;
    let predictions = state
        .store
        .prediction_snapshots(&cluster, start, state.runtime.plan_ahead.get())
        .await
        .map_err(internal_error)?;
    snapshots.extend(predictions);

    Ok(Json(snapshots))
}

fn internal_error(err: ScalerError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!(method = %method, path = %path, status = %response.status(), "Access log");
    response
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("GET"));
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, Config, ConfigCell};
    use crate::testing::MemorySnapshotStore;
    use clap::Parser;
    use std::time::Duration;

    fn test_state() -> (AppState, tokio::task::JoinHandle<()>) {
        let args = CliArgs::parse_from([
            "predictive-scaler",
            "--rdsClusterName",
            "demo",
            "--awsRegion",
            "eu-west-1",
        ]);
        let config = ConfigCell::new(Config::from_args(args).unwrap());
        let (bus, handle) = BroadcastBus::start();
        let state = AppState {
            bus,
            config,
            store: Arc::new(MemorySnapshotStore::new()),
            runtime: RuntimeState::new(Duration::from_secs(600)),
        };
        (state, handle)
    }

    #[tokio::test]
    async fn test_conf_update_applies_and_rebroadcasts() {
        let (state, handle) = test_state();
        let (sink, mut stream) = mpsc::channel(8);
        state.bus.register(sink).await;

        handle_client_message(
            &state,
            r#"{"type":"conf_update","data":{"min_instances":3,"max_instances":6,"boost_hours":[8,18]}}"#,
        );

        let config = state.config.get();
        assert_eq!(config.min_instances, 3);
        assert_eq!(config.max_instances, 6);
        assert!(config.boost_hours.contains(&8));
        assert!(config.boost_hours.contains(&18));
        let json = stream.recv().await.unwrap();
        assert!(json.contains("\"type\":\"config\""));

        state.bus.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_conf_update_is_rejected() {
        let (state, handle) = test_state();
        handle_client_message(
            &state,
            r#"{"type":"conf_update","data":{"min_instances":0}}"#,
        );
        assert_eq!(state.config.get().min_instances, 2);

        state.bus.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_ignored() {
        let (state, handle) = test_state();
        handle_client_message(&state, r#"{"type":"mystery","data":null}"#);
        handle_client_message(&state, "not even json");
        assert_eq!(state.config.get().min_instances, 2);

        state.bus.shutdown().await;
        handle.await.unwrap();
    }
}
