//! Classboard Core Library
//!
//! Canvas model and the real-time collaboration layer of the Classboard
//! whiteboard: rooms shared between a teacher and students, kept in sync over
//! a relay store or a direct teacher-hosted connection.

pub mod canvas;
pub mod collaboration;
pub mod config;
pub mod error;
pub mod presence;
pub mod registry;
pub mod room;
pub mod session;
pub mod shapes;
pub mod storage;
pub mod sync;
pub mod transport;

pub use canvas::{CanvasChange, CanvasDocument, CanvasSnapshot, CanvasSurface};
pub use collaboration::{ApplyOutcome, EngineState, OutgoingAction, SyncEngine};
pub use config::CollabConfig;
pub use error::{CollabError, CollabResult};
pub use presence::{CursorThrottle, PresenceTracker, RemoteCursor};
pub use registry::{LeaveOutcome, RoomRegistry};
pub use room::{Participant, Role, RoomCode, RoomRecord};
pub use session::{CollaborationSession, open_relay_store};
pub use shapes::{Color, Shape, ShapeId, ShapeStyle};
pub use storage::{MemoryStore, RelayStore, RemoteStore};
pub use sync::{ActionKind, ConnectionState, CursorPosition, DrawingAction, SyncEvent};
pub use transport::{DirectClient, DirectHost, RelayTransport, Transport, TransportEvent, TransportKind};
