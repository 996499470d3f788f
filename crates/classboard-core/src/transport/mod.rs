//! Transports carry drawing actions, cursors and presence between the
//! participants of a room.
//!
//! Two variants exist:
//! - [`RelayTransport`]: everyone reads and writes the room record in a
//!   shared relay store, which fans changes out to every subscriber.
//! - [`DirectHost`] / [`DirectClient`]: the teacher listens for WebSocket
//!   connections and relays between students (star topology).
//!
//! Neither guarantees delivery, nor ordering across different kinds of
//! messages.

mod direct;
mod relay;

pub use direct::{ControlFrame, DirectClient, DirectFrame, DirectHost, RejectCode};
pub use relay::RelayTransport;

use crate::collaboration::OutgoingAction;
use crate::error::CollabResult;
use crate::room::Participant;
use crate::storage::BoxFuture;
use crate::sync::{ConnectionState, CursorPosition, DrawingAction};

/// Which transport a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Relay,
    /// Teacher end of a direct session.
    DirectHost,
    /// Student end of a direct session.
    DirectClient,
}

/// Something a transport received.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A drawing action from another participant. `via` names the direct
    /// connection it arrived on, so the hub can skip it when forwarding.
    Action {
        action: DrawingAction,
        via: Option<String>,
    },
    PeerJoined {
        participant: Participant,
        via: Option<String>,
    },
    PeerLeft { id: String },
    /// Everyone currently in the room.
    Roster(Vec<Participant>),
    Cursor {
        id: String,
        name: String,
        position: CursorPosition,
    },
    LockChanged(bool),
    Status(ConnectionState),
    /// The room no longer exists.
    RoomClosed,
    /// A direct connection is due its one late-join snapshot.
    SnapshotDue { peer: String },
}

/// A connection to the other participants of one room.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Send a local action to every reachable participant.
    fn send<'a>(&'a mut self, outgoing: &'a OutgoingAction) -> BoxFuture<'a, CollabResult<()>>;

    /// Pass a remote action on to every peer except `except`.
    fn forward<'a>(&'a mut self, action: &'a DrawingAction, except: Option<&'a str>)
    -> BoxFuture<'a, CollabResult<()>>;

    /// Send an action to a single peer.
    fn send_to<'a>(&'a mut self, peer: &'a str, action: &'a DrawingAction) -> BoxFuture<'a, CollabResult<()>>;

    fn publish_cursor(&mut self, position: CursorPosition) -> BoxFuture<'_, CollabResult<()>>;

    /// Change the room lock. Owner only.
    fn publish_lock(&mut self, locked: bool) -> BoxFuture<'_, CollabResult<()>>;

    /// Wait for the next event. `None` once the transport has ended.
    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>>;

    /// Leave the room and release the connection. Pending sends are not
    /// awaited.
    fn close(&mut self) -> BoxFuture<'_, CollabResult<()>>;
}

/// Participants that appeared in and vanished from the roster, ignoring the
/// local participant.
pub(crate) fn roster_diff(
    previous: &[Participant],
    next: &[Participant],
    local_id: &str,
) -> (Vec<Participant>, Vec<String>) {
    let joined = next
        .iter()
        .filter(|p| p.id != local_id && !previous.iter().any(|q| q.id == p.id))
        .cloned()
        .collect();
    let left = previous
        .iter()
        .filter(|p| p.id != local_id && !next.iter().any(|q| q.id == p.id))
        .map(|p| p.id.clone())
        .collect();
    (joined, left)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_diff() {
        let me = Participant::student("Me");
        let teacher = Participant::teacher("T");
        let other = Participant::student("Other");

        let (joined, left) = roster_diff(&[teacher.clone()], &[teacher.clone(), me.clone(), other.clone()], &me.id);
        assert_eq!(joined, vec![other.clone()]);
        assert!(left.is_empty());

        let (joined, left) = roster_diff(&[teacher.clone(), me.clone(), other.clone()], &[me.clone()], &me.id);
        assert!(joined.is_empty());
        assert_eq!(left, vec![teacher.id.clone(), other.id.clone()]);
    }
}
