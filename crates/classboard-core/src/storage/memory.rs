//! In-memory relay store.
//!
//! Used directly by tests and by the teacher's local registry in direct mode,
//! and as the backing state of the relay server.

use super::{BoxFuture, RelayStore, StorageError, StorageResult, StoreEvent, Subscription, path_segments};
use serde_json::{Map, Value};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Watcher {
    id: u64,
    path: String,
    segments: Vec<String>,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

struct Inner {
    root: Value,
    watchers: Vec<Watcher>,
    next_id: u64,
}

/// In-memory JSON tree with push-on-change subscriptions.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                watchers: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))
    }

    /// Read synchronously.
    pub fn read(&self, path: &str) -> StorageResult<Option<Value>> {
        let inner = self.lock()?;
        Ok(value_at(&inner.root, &path_segments(path)).cloned())
    }

    /// Write synchronously. `None` or `Value::Null` deletes.
    pub fn write(&self, path: &str, value: Option<Value>) -> StorageResult<()> {
        let mut inner = self.lock()?;
        write_at(&mut inner.root, &path_segments(path), value.and_then(normalize));
        inner.notify();
        Ok(())
    }

    /// Apply several relative writes under one path, then notify once.
    pub fn write_many(&self, path: &str, fields: Map<String, Value>) -> StorageResult<()> {
        let base = path_segments(path);
        let mut inner = self.lock()?;
        for (key, value) in fields {
            let mut segments = base.clone();
            segments.extend(path_segments(&key));
            write_at(&mut inner.root, &segments, normalize(value));
        }
        inner.notify();
        Ok(())
    }

    /// Register a watcher and queue the current value as its first event.
    pub fn watch(&self, path: &str) -> StorageResult<Subscription> {
        let mut inner = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_id;
        inner.next_id += 1;
        let segments = path_segments(path);
        let current = value_at(&inner.root, &segments).cloned();
        let _ = tx.send(StoreEvent {
            path: path.to_string(),
            value: current.clone(),
        });
        inner.watchers.push(Watcher {
            id,
            path: path.to_string(),
            segments,
            last: current,
            tx,
        });
        Ok(Subscription::new(id, path.to_string(), rx))
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        self.lock()
            .map(|inner| inner.watchers.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Inner {
    /// Push the new value to every watcher whose path saw a change.
    fn notify(&mut self) {
        let root = &self.root;
        self.watchers.retain_mut(|watcher| {
            if watcher.tx.is_closed() {
                return false;
            }
            let current = value_at(root, &watcher.segments).cloned();
            if current == watcher.last {
                return true;
            }
            watcher.last = current.clone();
            let delivered = watcher
                .tx
                .send(StoreEvent {
                    path: watcher.path.clone(),
                    value: current,
                })
                .is_ok();
            if !delivered {
                log::debug!("Dropping closed watcher {}", watcher.id);
            }
            delivered
        });
    }
}

/// Strip nulls and empty objects. Returns `None` if nothing is left.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let found = segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))?;
    match found {
        Value::Object(map) if map.is_empty() => None,
        value => Some(value),
    }
}

fn write_at(node: &mut Value, segments: &[String], value: Option<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    };
    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                map.insert(head.clone(), v);
            }
            None => {
                map.remove(head);
            }
        }
        return;
    }
    if value.is_none() && !map.contains_key(head) {
        return;
    }
    let child = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    write_at(child, rest, value);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(head);
    }
}

impl RelayStore for MemoryStore {
    fn get(&self, path: &str) -> BoxFuture<'_, StorageResult<Option<Value>>> {
        let result = self.read(path);
        Box::pin(async move { result })
    }

    fn set(&self, path: &str, value: Value) -> BoxFuture<'_, StorageResult<()>> {
        let result = self.write(path, Some(value));
        Box::pin(async move { result })
    }

    fn update(&self, path: &str, fields: Map<String, Value>) -> BoxFuture<'_, StorageResult<()>> {
        let result = self.write_many(path, fields);
        Box::pin(async move { result })
    }

    fn remove(&self, path: &str) -> BoxFuture<'_, StorageResult<()>> {
        let result = self.write(path, None);
        Box::pin(async move { result })
    }

    fn subscribe(&self, path: &str) -> BoxFuture<'_, StorageResult<Subscription>> {
        let result = self.watch(path);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store.set("rooms/ABC234/name", json!("Maths")).await.unwrap();

        assert_eq!(
            store.get("rooms/ABC234").await.unwrap(),
            Some(json!({ "name": "Maths" }))
        );
        assert_eq!(store.get("rooms/ZZZZZZ").await.unwrap(), None);
        assert!(store.exists("rooms/ABC234/name").await.unwrap());
    }

    #[tokio::test]
    async fn test_null_deletes_and_prunes() {
        let store = MemoryStore::new();
        store.set("rooms/ABC234/students/u1", json!({ "name": "Ada" })).await.unwrap();
        store.remove("rooms/ABC234/students/u1").await.unwrap();

        assert_eq!(store.get("rooms").await.unwrap(), None);

        store
            .set("rooms/ABC234", json!({ "name": "x", "teacherCursor": null, "students": {} }))
            .await
            .unwrap();
        assert_eq!(store.get("rooms/ABC234").await.unwrap(), Some(json!({ "name": "x" })));
    }

    #[tokio::test]
    async fn test_update_multi_path() {
        let store = MemoryStore::new();
        store.set("rooms/R/name", json!("Art")).await.unwrap();

        let mut fields = Map::new();
        fields.insert("isLocked".into(), json!(true));
        fields.insert("students/u1/cursor".into(), json!({ "x": 1.0, "y": 2.0 }));
        fields.insert("name".into(), Value::Null);
        store.update("rooms/R", fields).await.unwrap();

        assert_eq!(
            store.get("rooms/R").await.unwrap(),
            Some(json!({ "isLocked": true, "students": { "u1": { "cursor": { "x": 1.0, "y": 2.0 } } } }))
        );
    }

    #[tokio::test]
    async fn test_subscription_receives_initial_and_changes() {
        let store = MemoryStore::new();
        store.set("rooms/R/name", json!("Art")).await.unwrap();

        let mut sub = store.subscribe("rooms/R").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.value, Some(json!({ "name": "Art" })));

        store.set("rooms/R/isLocked", json!(true)).await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.value, Some(json!({ "name": "Art", "isLocked": true })));

        store.remove("rooms/R").await.unwrap();
        assert_eq!(sub.next().await.unwrap().value, None);
    }

    #[tokio::test]
    async fn test_unrelated_and_unchanged_writes_are_silent() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("rooms/R").await.unwrap();
        assert_eq!(sub.try_next().unwrap().value, None);

        store.set("rooms/OTHER/name", json!("x")).await.unwrap();
        assert!(sub.try_next().is_none());

        store.set("rooms/R/name", json!("x")).await.unwrap();
        assert!(sub.try_next().is_some());
        store.set("rooms/R/name", json!("x")).await.unwrap();
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_parent_write_notifies_child_watcher() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("rooms/R/isLocked").await.unwrap();
        sub.try_next();

        store.set("rooms/R", json!({ "isLocked": true })).await.unwrap();
        assert_eq!(sub.try_next().unwrap().value, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_released() {
        let store = MemoryStore::new();
        let sub = store.subscribe("rooms/R").await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(sub);
        assert_eq!(store.watcher_count(), 0);
        store.set("rooms/R/name", json!("x")).await.unwrap();
        assert_eq!(store.lock().unwrap().watchers.len(), 0);
    }
}
