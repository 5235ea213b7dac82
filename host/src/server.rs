//! ==============================================================================
//! server.rs - web server and push channel
//! ==============================================================================
//!
//! routes:
//!     GET /ws            websocket: device-list on connect, then one update per tick
//!     GET /api/devices   full identity of every registered device
//!     GET /api/snapshot  latest snapshot set (or null before the first tick)
//!     GET /api/history   recent snapshot sets, `?limit=N`
//!     GET /api/health    liveness and counters
//!     everything else    static files from the assets directory
//!
//! connect protocol:
//!     the roster is written to the socket before the subscriber is registered,
//!     so no update can overtake it. on disconnect the subscriber is removed
//!     and its queue dropped.
//!
//! ==============================================================================

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::domain::{ServerMessage, SnapshotSet};
use crate::history::History;
use crate::registry::{Device, DeviceRegistry};
use crate::scheduler::BroadcastScheduler;
use crate::subscribers::SubscriberRegistry;

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub subscribers: Arc<SubscriberRegistry>,
    pub history: Arc<History>,
    pub scheduler: Arc<BroadcastScheduler>,
    pub queue_depth: usize,
}

pub fn router(state: AppState, assets_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/history", get(history_handler))
        .route("/api/health", get(health_handler))
        .fallback_service(ServeDir::new(assets_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let roster = state.registry.roster();
    let hello = match ServerMessage::DeviceList(&roster).to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode roster");
            return;
        }
    };
    if socket.send(Message::Text(hello)).await.is_err() {
        debug!("client left before roster was delivered");
        return;
    }

    let (id, mut updates) = state.subscribers.subscribe(state.queue_depth);
    info!(subscriber = %id, total = state.subscribers.len(), "subscriber connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(set) = update else { break };
                let Some(text) = encode_update(&set) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // the channel is push-only; client frames are ignored
                Some(Ok(_)) => {}
            },
        }
    }

    state.subscribers.remove(id);
    info!(subscriber = %id, total = state.subscribers.len(), "subscriber disconnected");
}

fn encode_update(set: &SnapshotSet) -> Option<String> {
    match ServerMessage::Update(&set.snapshots).to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(tick = set.tick, error = %e, "failed to encode update");
            None
        }
    }
}

async fn devices_handler(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.registry.devices().to_vec())
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<Option<Arc<SnapshotSet>>> {
    Json(state.history.latest().await)
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// GET /api/history?limit=N
async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Arc<SnapshotSet>>> {
    let limit = params.limit.unwrap_or(state.history.capacity());
    Json(state.history.recent(limit).await)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "devices": state.registry.len(),
        "subscribers": state.subscribers.len(),
        "ticks": state.scheduler.ticks(),
        "intervalMs": state.scheduler.interval().as_millis() as u64,
    }))
}
