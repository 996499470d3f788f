//! WebSocket client for a `classboard-relay` server.

use super::wire::{StoreReply, StoreRequest};
use super::{BoxFuture, RelayStore, StorageError, StorageResult, StoreEvent, Subscription};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

type Reply = StorageResult<Option<Value>>;

#[derive(Default)]
struct Shared {
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    watchers: HashMap<u64, mpsc::UnboundedSender<StoreEvent>>,
    closed: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Relay store reached over a WebSocket.
///
/// One background task owns the socket. Requests are matched to replies by
/// id; subscription events are routed to their [`Subscription`].
pub struct RemoteStore {
    url: String,
    next_id: Arc<AtomicU64>,
    frames: mpsc::UnboundedSender<String>,
    shared: Arc<Mutex<Shared>>,
    task: JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to a relay server.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let parsed = Url::parse(url).map_err(|e| StorageError::Unavailable(format!("Invalid URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(StorageError::Unavailable(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed.scheme()
            )));
        }

        log::info!("Connecting to relay at {}", url);
        let (socket, response) = connect_async(parsed.as_str())
            .await
            .map_err(|e| StorageError::Unavailable(format!("Connection failed: {}", e)))?;
        log::info!("Relay connected, status: {}", response.status());

        let (frames, mut outbox) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let task_shared = shared.clone();
        let task_url = url.to_string();

        let task = tokio::spawn(async move {
            let (mut sink, mut stream) = socket.split();
            loop {
                tokio::select! {
                    frame = outbox.recv() => {
                        let Some(text) = frame else {
                            let _ = sink.close().await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            log::error!("Relay send error: {}", e);
                            break;
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<StoreReply>(&text) {
                                    Ok(reply) => dispatch(&task_shared, reply),
                                    Err(e) => log::warn!("Failed to parse relay message: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Relay closed the connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::error!("Relay read error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            let mut shared = lock(&task_shared);
            shared.closed = true;
            for (_, waiter) in shared.pending.drain() {
                let _ = waiter.send(Err(StorageError::Unavailable(format!("Connection to {} lost", task_url))));
            }
            // Dropping the senders ends every subscription stream
            shared.watchers.clear();
        });

        Ok(Self {
            url: url.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
            frames,
            shared,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket task is still running.
    pub fn is_connected(&self) -> bool {
        !lock(&self.shared).closed && !self.task.is_finished()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, request: StoreRequest) -> Reply {
        let (tx, rx) = oneshot::channel();
        let id = request.id();
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return Err(StorageError::Unavailable(format!("Connection to {} lost", self.url)));
            }
            shared.pending.insert(id, tx);
        }
        let text = serde_json::to_string(&request)?;
        if self.frames.send(text).is_err() {
            lock(&self.shared).pending.remove(&id);
            return Err(StorageError::Unavailable("Relay connection closed".to_string()));
        }
        rx.await
            .map_err(|_| StorageError::Unavailable("Relay connection closed".to_string()))?
    }

    async fn open_subscription(&self, path: String) -> StorageResult<Subscription> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first so the initial value is never missed
        lock(&self.shared).watchers.insert(id, tx);

        if let Err(e) = self.request(StoreRequest::Subscribe { id, path: path.clone() }).await {
            lock(&self.shared).watchers.remove(&id);
            return Err(e);
        }

        let frames = self.frames.clone();
        let shared = self.shared.clone();
        let next_id = self.next_id.clone();
        Ok(Subscription::new(id, path, rx).with_drop_hook(move || {
            lock(&shared).watchers.remove(&id);
            let request = StoreRequest::Unsubscribe {
                id: next_id.fetch_add(1, Ordering::Relaxed),
                subscription: id,
            };
            if let Ok(text) = serde_json::to_string(&request) {
                let _ = frames.send(text);
            }
        }))
    }
}

fn dispatch(shared: &Mutex<Shared>, reply: StoreReply) {
    let mut shared = lock(shared);
    let (id, result) = match reply {
        StoreReply::Value { id, value } => (id, Ok(value)),
        StoreReply::Done { id } => (id, Ok(None)),
        StoreReply::Error { id, message } => (id, Err(StorageError::Other(message))),
        StoreReply::Event {
            subscription,
            path,
            value,
        } => {
            let delivered = shared
                .watchers
                .get(&subscription)
                .is_some_and(|tx| tx.send(StoreEvent { path, value }).is_ok());
            if !delivered {
                shared.watchers.remove(&subscription);
            }
            return;
        }
    };
    if let Some(waiter) = shared.pending.remove(&id) {
        let _ = waiter.send(result);
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RelayStore for RemoteStore {
    fn get(&self, path: &str) -> BoxFuture<'_, StorageResult<Option<Value>>> {
        let request = StoreRequest::Get {
            id: self.next_id(),
            path: path.to_string(),
        };
        Box::pin(self.request(request))
    }

    fn set(&self, path: &str, value: Value) -> BoxFuture<'_, StorageResult<()>> {
        let request = StoreRequest::Set {
            id: self.next_id(),
            path: path.to_string(),
            value,
        };
        Box::pin(async move { self.request(request).await.map(|_| ()) })
    }

    fn update(&self, path: &str, fields: Map<String, Value>) -> BoxFuture<'_, StorageResult<()>> {
        let request = StoreRequest::Update {
            id: self.next_id(),
            path: path.to_string(),
            fields,
        };
        Box::pin(async move { self.request(request).await.map(|_| ()) })
    }

    fn remove(&self, path: &str) -> BoxFuture<'_, StorageResult<()>> {
        let request = StoreRequest::Remove {
            id: self.next_id(),
            path: path.to_string(),
        };
        Box::pin(async move { self.request(request).await.map(|_| ()) })
    }

    fn subscribe(&self, path: &str) -> BoxFuture<'_, StorageResult<Subscription>> {
        Box::pin(self.open_subscription(path.to_string()))
    }
}
