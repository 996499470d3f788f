//! Shared key-value/event store abstraction used by the relay transport.
//!
//! The store is a JSON tree addressed by slash-separated paths
//! (`rooms/ABC234/students`). Writing `null` deletes, and objects left empty
//! by a delete are pruned. Subscribers receive the full value at their path
//! once on subscribe and again on every change beneath it.

mod memory;
mod remote;
pub mod wire;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A change pushed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// The subscribed path.
    pub path: String,
    /// Current value at that path (`None` once deleted).
    pub value: Option<Value>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    path: String,
    rx: mpsc::UnboundedReceiver<StoreEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, path: String, rx: mpsc::UnboundedReceiver<StoreEvent>) -> Self {
        Self {
            id,
            path,
            rx,
            on_drop: None,
        }
    }

    pub(crate) fn with_drop_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change. `None` when the store went away.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Take a change that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Trait for relay store backends.
pub trait RelayStore: Send + Sync {
    /// Read the value at a path.
    fn get(&self, path: &str) -> BoxFuture<'_, StorageResult<Option<Value>>>;

    /// Replace the value at a path. `Value::Null` deletes.
    fn set(&self, path: &str, value: Value) -> BoxFuture<'_, StorageResult<()>>;

    /// Write several children of a path in one step. Keys may themselves be
    /// relative paths (`students/user_1/cursor`).
    fn update(&self, path: &str, fields: Map<String, Value>) -> BoxFuture<'_, StorageResult<()>>;

    /// Delete the value at a path.
    fn remove(&self, path: &str) -> BoxFuture<'_, StorageResult<()>>;

    /// Observe a path. The current value is delivered first.
    fn subscribe(&self, path: &str) -> BoxFuture<'_, StorageResult<Subscription>>;

    /// Check if a value exists at a path.
    fn exists(&self, path: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = path.to_string();
        Box::pin(async move { Ok(self.get(&path).await?.is_some()) })
    }
}

/// Split a path into its non-empty segments.
pub fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join two paths with exactly one separator.
pub fn join_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        child.to_string()
    } else if child.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{child}")
    }
}
