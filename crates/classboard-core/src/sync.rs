//! Drawing actions and the events a session reports to the UI.

use crate::canvas::CanvasSnapshot;
use crate::error::{CollabError, CollabResult};
use crate::presence::RemoteCursor;
use crate::room::Participant;
use crate::shapes::Shape;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of a drawing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// A freehand stroke was completed.
    Draw,
    /// A single non-stroke object was added.
    Add,
    /// Full canvas snapshot.
    State,
    /// The canvas was cleared.
    Clear,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Draw => "draw",
            ActionKind::Add => "add",
            ActionKind::State => "state",
            ActionKind::Clear => "clear",
        }
    }
}

/// One discrete synchronized change.
///
/// `data` holds the serialized object for `draw`/`add`, the snapshot string
/// for `state`, and is null for `clear`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub data: Value,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: u64,
}

impl DrawingAction {
    fn new(kind: ActionKind, data: Value, origin: &Participant) -> Self {
        Self {
            kind,
            data,
            user_id: origin.id.clone(),
            user_name: origin.name.clone(),
            timestamp: now_millis(),
        }
    }

    /// `add` action for a non-stroke object.
    pub fn add(shape: &Shape, origin: &Participant) -> CollabResult<Self> {
        Ok(Self::new(ActionKind::Add, serde_json::to_value(shape)?, origin))
    }

    /// `draw` action for a freehand stroke.
    pub fn draw(shape: &Shape, origin: &Participant) -> CollabResult<Self> {
        Ok(Self::new(ActionKind::Draw, serde_json::to_value(shape)?, origin))
    }

    /// `add` or `draw` depending on the object.
    pub fn object(shape: &Shape, origin: &Participant) -> CollabResult<Self> {
        if shape.is_stroke() {
            Self::draw(shape, origin)
        } else {
            Self::add(shape, origin)
        }
    }

    pub fn state(snapshot: &CanvasSnapshot, origin: &Participant) -> CollabResult<Self> {
        let encoded = snapshot.encode()?;
        Ok(Self::new(ActionKind::State, Value::String(encoded), origin))
    }

    pub fn clear(origin: &Participant) -> Self {
        Self::new(ActionKind::Clear, Value::Null, origin)
    }

    /// Decode the object carried by a `draw` or `add` action.
    pub fn decode_object(&self) -> CollabResult<Shape> {
        match self.kind {
            ActionKind::Draw | ActionKind::Add => Ok(Shape::deserialize(&self.data)?),
            other => Err(CollabError::Deserialization(format!(
                "{} action carries no object",
                other.as_str()
            ))),
        }
    }

    /// The snapshot string carried by a `state` action.
    pub fn snapshot_str(&self) -> CollabResult<&str> {
        match (&self.kind, &self.data) {
            (ActionKind::State, Value::String(s)) => Ok(s.as_str()),
            (ActionKind::State, _) => Err(CollabError::Deserialization(
                "state action data is not a string".to_string(),
            )),
            (other, _) => Err(CollabError::Deserialization(format!(
                "{} action carries no snapshot",
                other.as_str()
            ))),
        }
    }

    pub fn decode_snapshot(&self) -> CollabResult<CanvasSnapshot> {
        Ok(CanvasSnapshot::decode(self.snapshot_str()?)?)
    }

    pub fn is_from(&self, participant_id: &str) -> bool {
        self.user_id == participant_id
    }
}

/// Cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped and one reconnect attempt is in progress.
    Reconnecting,
    /// Gave up; the session is over.
    Failed,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Events reported by a session to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A participant joined the room.
    PeerJoined(Participant),
    /// A participant left the room.
    PeerLeft { id: String },
    /// A remote action was applied to the local canvas.
    ActionApplied { kind: ActionKind, from: String },
    /// The teacher locked or unlocked the canvas.
    LockChanged(bool),
    CursorMoved(RemoteCursor),
    CursorRemoved { id: String },
    /// Connection status changed.
    StatusChanged(ConnectionState),
    /// The room was ended or deleted.
    RoomClosed,
    /// A non-fatal problem worth showing.
    Error { message: String },
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
