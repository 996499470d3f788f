//! Relay store wire protocol (JSON text frames).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client → relay request. Every request carries a client-chosen id that the
/// reply echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRequest {
    Get { id: u64, path: String },
    Set { id: u64, path: String, value: Value },
    Update { id: u64, path: String, fields: Map<String, Value> },
    Remove { id: u64, path: String },
    /// The request id doubles as the subscription id.
    Subscribe { id: u64, path: String },
    Unsubscribe { id: u64, subscription: u64 },
}

impl StoreRequest {
    pub fn id(&self) -> u64 {
        match self {
            StoreRequest::Get { id, .. }
            | StoreRequest::Set { id, .. }
            | StoreRequest::Update { id, .. }
            | StoreRequest::Remove { id, .. }
            | StoreRequest::Subscribe { id, .. }
            | StoreRequest::Unsubscribe { id, .. } => *id,
        }
    }
}

/// Relay → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreReply {
    /// Result of a `get`.
    Value {
        id: u64,
        #[serde(default)]
        value: Option<Value>,
    },
    /// Acknowledges a write, subscribe or unsubscribe.
    Done { id: u64 },
    Error { id: u64, message: String },
    /// Pushed change for a subscription.
    Event {
        subscription: u64,
        path: String,
        #[serde(default)]
        value: Option<Value>,
    },
}
