//! Classboard relay server.
//!
//! Hosts the shared key-value/event store that relay-mode rooms live in.
//! Clients speak the JSON protocol in [`classboard_core::storage::wire`]
//! over a WebSocket at `/ws`: reads, writes and path subscriptions.
//!
//! A background sweeper drops action-log entries older than the retention
//! window, so rooms whose writers vanished do not grow forever.

mod connection;

use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use classboard_core::{MemoryStore, RoomRegistry};
use dashmap::DashMap;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

pub use connection::Connection;

pub const ENV_ADDR: &str = "CLASSBOARD_RELAY_ADDR";
pub const ENV_ACTION_RETENTION_MS: &str = "CLASSBOARD_ACTION_RETENTION_MS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "CLASSBOARD_SWEEP_INTERVAL_MS";

const DEFAULT_ADDR: &str = "0.0.0.0:3030";
const DEFAULT_ACTION_RETENTION_MS: u64 = 10_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

/// Server settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub action_retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            action_retention: Duration::from_millis(DEFAULT_ACTION_RETENTION_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unparsable values are logged
    /// and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let addr = match value(ENV_ADDR) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("Ignoring {}={:?}: {}, using {}", ENV_ADDR, raw, e, DEFAULT_ADDR);
                defaults.addr
            }),
            None => defaults.addr,
        };
        let millis = |key: &str, default: Duration| match value(key) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    warn!("Ignoring {}={:?}, using {:?}", key, raw, default);
                    default
                }
            },
            None => default,
        };

        Self {
            addr,
            action_retention: millis(ENV_ACTION_RETENTION_MS, defaults.action_retention),
            sweep_interval: millis(ENV_SWEEP_INTERVAL_MS, defaults.sweep_interval),
        }
    }
}

/// Shared application state.
pub struct AppState {
    store: Arc<MemoryStore>,
    /// Open client connections by id, with their peer address.
    connections: DashMap<String, SocketAddr>,
}

impl AppState {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connections: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    watchers: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "Classboard Relay Server - Connect via WebSocket at /ws"
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: state.connection_count(),
        watchers: state.store.watcher_count(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let id = uuid::Uuid::new_v4().to_string();
        state.connections.insert(id.clone(), addr);
        info!("New connection {} from {}", id, addr);
        Connection::new(id.clone(), state.store.clone()).run(socket).await;
        state.connections.remove(&id);
        info!("Connection closed: {}", id);
    })
}

/// Periodically prune expired action-log entries in every room.
pub fn spawn_sweeper(store: Arc<MemoryStore>, retention: Duration, every: Duration) -> JoinHandle<()> {
    let registry = RoomRegistry::new(store);
    let retention_ms = retention.as_millis() as u64;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep(&registry, retention_ms).await {
                Ok(0) => {}
                Ok(removed) => debug!("Pruned {} expired actions", removed),
                Err(e) => warn!("Action sweep failed: {}", e),
            }
        }
    })
}

/// One pass over every room. A room that cannot be pruned is logged and
/// skipped so the rest still are.
async fn sweep(registry: &RoomRegistry, retention_ms: u64) -> classboard_core::CollabResult<usize> {
    let mut removed = 0;
    for code in registry.room_codes().await? {
        match registry.prune_actions(&code, retention_ms).await {
            Ok(count) => removed += count,
            Err(e) => warn!("Skipping room {} in action sweep: {}", code, e),
        }
    }
    Ok(removed)
}

/// Serve on an already bound listener until the process ends.
pub async fn run(listener: TcpListener, config: &RelayConfig) -> std::io::Result<()> {
    let state = Arc::new(AppState::new(Arc::new(MemoryStore::new())));
    let sweeper = spawn_sweeper(state.store.clone(), config.action_retention, config.sweep_interval);

    let addr = listener.local_addr()?;
    info!("Classboard relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let result = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    sweeper.abort();
    result
}

/// Bind `config.addr` and serve.
pub async fn serve(config: RelayConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    run(listener, &config).await
}
