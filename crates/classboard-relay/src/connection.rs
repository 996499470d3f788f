//! One client connection: store requests in, replies and subscription
//! events out.

use axum::extract::ws::{Message, WebSocket};
use classboard_core::MemoryStore;
use classboard_core::storage::StorageResult;
use classboard_core::storage::wire::{StoreReply, StoreRequest};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Connection {
    id: String,
    store: Arc<MemoryStore>,
    outbox: mpsc::UnboundedSender<String>,
    frames: Option<mpsc::UnboundedReceiver<String>>,
    /// Forwarding task per subscription id.
    subscriptions: HashMap<u64, JoinHandle<()>>,
}

impl Connection {
    pub fn new(id: String, store: Arc<MemoryStore>) -> Self {
        let (outbox, frames) = mpsc::unbounded_channel();
        Self {
            id,
            store,
            outbox,
            frames: Some(frames),
            subscriptions: HashMap::new(),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Serve the socket until the client goes away.
    pub async fn run(mut self, socket: WebSocket) {
        let Some(mut frames) = self.frames.take() else {
            return;
        };
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(text) = frame else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let reply = self.handle_text(text.as_str());
                            self.queue(&reply);
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("Ignoring binary frame from {}", self.id);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error for {}: {}", self.id, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    fn queue(&self, reply: &StoreReply) {
        match serde_json::to_string(reply) {
            Ok(text) => {
                let _ = self.outbox.send(text);
            }
            Err(e) => warn!("Failed to encode reply for {}: {}", self.id, e),
        }
    }

    /// Decode and answer one text frame. Undecodable frames get an error
    /// reply with id 0.
    pub fn handle_text(&mut self, text: &str) -> StoreReply {
        match serde_json::from_str::<StoreRequest>(text) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!("Invalid message from {}: {}", self.id, e);
                StoreReply::Error {
                    id: 0,
                    message: format!("Invalid message: {}", e),
                }
            }
        }
    }

    pub fn handle(&mut self, request: StoreRequest) -> StoreReply {
        let id = request.id();
        let result = match request {
            StoreRequest::Get { path, .. } => self.store.read(&path).map(|value| StoreReply::Value { id, value }),
            StoreRequest::Set { path, value, .. } => self.store.write(&path, Some(value)).map(|_| StoreReply::Done { id }),
            StoreRequest::Update { path, fields, .. } => {
                self.store.write_many(&path, fields).map(|_| StoreReply::Done { id })
            }
            StoreRequest::Remove { path, .. } => self.store.write(&path, None).map(|_| StoreReply::Done { id }),
            StoreRequest::Subscribe { path, .. } => self.subscribe(id, path).map(|_| StoreReply::Done { id }),
            StoreRequest::Unsubscribe { subscription, .. } => {
                if let Some(task) = self.subscriptions.remove(&subscription) {
                    task.abort();
                    debug!("{} unsubscribed {}", self.id, subscription);
                }
                Ok(StoreReply::Done { id })
            }
        };
        result.unwrap_or_else(|e| StoreReply::Error {
            id,
            message: e.to_string(),
        })
    }

    fn subscribe(&mut self, id: u64, path: String) -> StorageResult<()> {
        let mut subscription = self.store.watch(&path)?;
        let outbox = self.outbox.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let reply = StoreReply::Event {
                    subscription: id,
                    path: event.path,
                    value: event.value,
                };
                let Ok(text) = serde_json::to_string(&reply) else {
                    continue;
                };
                if outbox.send(text).is_err() {
                    break;
                }
            }
        });
        debug!("{} subscribed to {} as {}", self.id, path, id);
        if let Some(previous) = self.subscriptions.insert(id, task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}
