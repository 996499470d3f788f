//! Relay transport: the room record in a shared store is the channel.

use super::{Transport, TransportEvent, TransportKind, roster_diff};
use crate::collaboration::OutgoingAction;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::registry::{RoomRegistry, decode_room};
use crate::room::{Participant, RoomCode, RoomRecord};
use crate::storage::{BoxFuture, Subscription};
use crate::sync::{ActionKind, ConnectionState, CursorPosition, DrawingAction};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// Transport over a relay store subscription to `rooms/{code}`.
///
/// Successive room values are diffed into events. Own entries in the action
/// log are deleted once the retention window passes; that cleanup runs while
/// [`next_event`](Transport::next_event) is being awaited.
pub struct RelayTransport {
    registry: RoomRegistry,
    code: RoomCode,
    participant: Participant,
    subscription: Subscription,
    last: RoomRecord,
    /// Log keys already reported or present at subscribe time.
    seen: HashSet<String>,
    /// Own log entries, oldest first, with their write time.
    own_actions: VecDeque<(String, Instant)>,
    retention: Duration,
    pending: VecDeque<TransportEvent>,
    closed: bool,
}

impl RelayTransport {
    /// Subscribe to a room the participant has already created or joined.
    pub async fn open(
        registry: RoomRegistry,
        code: RoomCode,
        participant: Participant,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let mut subscription = registry.watch_room(&code).await?;
        let initial = subscription
            .next()
            .await
            .ok_or_else(|| CollabError::TransportUnavailable("relay subscription ended".to_string()))?;
        let last = decode_room(initial.value)?.ok_or_else(|| CollabError::RoomNotFound(code.to_string()))?;
        // The join snapshot covers whatever is already in the log
        let seen = last.actions.keys().cloned().collect();

        log::info!("Relay transport open for room {} as {}", code, participant.name);
        Ok(Self {
            registry,
            code,
            participant,
            subscription,
            last,
            seen,
            own_actions: VecDeque::new(),
            retention: config.action_retention(),
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// Most recent room value seen on the subscription.
    pub fn room(&self) -> &RoomRecord {
        &self.last
    }

    async fn push_own(&mut self, action: &DrawingAction) -> CollabResult<()> {
        let key = self.registry.push_action(&self.code, action).await?;
        self.seen.insert(key.clone());
        self.own_actions.push_back((key, Instant::now()));
        Ok(())
    }

    async fn deliver(&mut self, outgoing: &OutgoingAction) -> CollabResult<()> {
        let action = &outgoing.action;
        match action.kind {
            ActionKind::State => {
                let snapshot = action.snapshot_str()?;
                self.registry
                    .update_canvas_state(&self.code, Some(snapshot), &self.participant)
                    .await
            }
            ActionKind::Add | ActionKind::Draw => {
                self.push_own(action).await?;
                match &outgoing.snapshot {
                    Some(snapshot) => {
                        self.registry
                            .update_canvas_state(&self.code, Some(snapshot), &self.participant)
                            .await
                    }
                    None => Ok(()),
                }
            }
            ActionKind::Clear => {
                self.registry.clear_canvas(&self.code, &self.participant).await?;
                self.push_own(action).await
            }
        }
    }

    /// Delete own log entries older than the retention window.
    async fn expire_own_actions(&mut self) {
        let now = Instant::now();
        while let Some((key, written)) = self.own_actions.front() {
            if *written + self.retention > now {
                break;
            }
            let key = key.clone();
            // Pop only once the delete has resolved; a cancelled poll retries it
            if let Err(e) = self.registry.remove_action(&self.code, &key).await {
                log::debug!("Failed to expire action {}: {}", key, e);
            }
            self.own_actions.pop_front();
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.own_actions.front().map(|(_, written)| *written + self.retention)
    }

    /// Turn a new room value into events.
    fn observe(&mut self, value: Option<Value>) {
        let next = match decode_room(value) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::info!("Room {} was deleted", self.code);
                self.pending.push_back(TransportEvent::RoomClosed);
                self.closed = true;
                return;
            }
            Err(e) => {
                log::warn!("Ignoring malformed room record for {}: {}", self.code, e);
                return;
            }
        };
        let local_id = self.participant.id.clone();

        // New log entries, in key (write time) order
        for (key, action) in &next.actions {
            if self.seen.insert(key.clone()) && !action.is_from(&local_id) {
                self.pending.push_back(TransportEvent::Action {
                    action: action.clone(),
                    via: None,
                });
            }
        }
        self.seen.retain(|key| next.actions.contains_key(key));

        if next.canvas_state != self.last.canvas_state {
            let by = next.canvas_state_by.clone().unwrap_or_default();
            if by != local_id {
                let user_name = next
                    .participants()
                    .into_iter()
                    .find(|p| p.id == by)
                    .map(|p| p.name)
                    .unwrap_or_default();
                let (kind, data) = match &next.canvas_state {
                    Some(state) => (ActionKind::State, Value::String(state.clone())),
                    None => (ActionKind::Clear, Value::Null),
                };
                self.pending.push_back(TransportEvent::Action {
                    action: DrawingAction {
                        kind,
                        data,
                        user_id: by,
                        user_name,
                        timestamp: next.last_updated,
                    },
                    via: None,
                });
            }
        }

        if next.is_locked != self.last.is_locked {
            self.pending.push_back(TransportEvent::LockChanged(next.is_locked));
        }

        let previous = self.last.participants();
        let current = next.participants();
        let (joined, left) = roster_diff(&previous, &current, &local_id);
        let roster_changed = !joined.is_empty() || !left.is_empty();
        for participant in joined {
            self.pending.push_back(TransportEvent::PeerJoined { participant, via: None });
        }
        for id in left {
            self.pending.push_back(TransportEvent::PeerLeft { id });
        }
        if roster_changed {
            self.pending.push_back(TransportEvent::Roster(current));
        }

        if next.teacher_online && next.teacher_id != local_id && next.teacher_cursor != self.last.teacher_cursor {
            if let Some(position) = next.teacher_cursor {
                self.pending.push_back(TransportEvent::Cursor {
                    id: next.teacher_id.clone(),
                    name: next.teacher_name.clone(),
                    position,
                });
            }
        }
        for (id, student) in &next.students {
            if *id == local_id {
                continue;
            }
            let before = self.last.students.get(id).and_then(|s| s.cursor);
            if let Some(position) = student.cursor.filter(|c| Some(*c) != before) {
                self.pending.push_back(TransportEvent::Cursor {
                    id: id.clone(),
                    name: student.name.clone(),
                    position,
                });
            }
        }

        self.last = next;
    }

    async fn poll_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }
            let expiry = self.next_expiry();
            tokio::select! {
                change = self.subscription.next() => {
                    match change {
                        Some(change) => self.observe(change.value),
                        None => {
                            log::warn!("Relay subscription for {} ended", self.code);
                            self.closed = true;
                            return Some(TransportEvent::Status(ConnectionState::Failed));
                        }
                    }
                }
                _ = async {
                    match expiry {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.expire_own_actions().await;
                }
            }
        }
    }
}

fn send_failure(err: CollabError) -> CollabError {
    match err {
        CollabError::SendFailure(_) => err,
        other => CollabError::SendFailure(other.to_string()),
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn send<'a>(&'a mut self, outgoing: &'a OutgoingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(CollabError::NotConnected);
            }
            self.deliver(outgoing).await.map_err(send_failure)
        })
    }

    fn forward<'a>(
        &'a mut self,
        _action: &'a DrawingAction,
        _except: Option<&'a str>,
    ) -> BoxFuture<'a, CollabResult<()>> {
        // The store already fans out to every subscriber
        Box::pin(async { Ok(()) })
    }

    fn send_to<'a>(&'a mut self, _peer: &'a str, _action: &'a DrawingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn publish_cursor(&mut self, position: CursorPosition) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            let is_owner = self.last.is_owner(&self.participant.id);
            self.registry
                .update_cursor(&self.code, &self.participant, position, is_owner)
                .await
                .map_err(send_failure)
        })
    }

    fn publish_lock(&mut self, locked: bool) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move { self.registry.toggle_lock(&self.code, &self.participant, locked).await })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        Box::pin(self.poll_event())
    }

    fn close(&mut self) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            if self.closed && self.own_actions.is_empty() {
                return Ok(());
            }
            self.closed = true;
            self.pending.clear();
            for (key, _) in std::mem::take(&mut self.own_actions) {
                if let Err(e) = self.registry.remove_action(&self.code, &key).await {
                    log::debug!("Failed to remove action {}: {}", key, e);
                }
            }
            let outcome = self.registry.leave_room(&self.code, &self.participant).await?;
            log::info!("Left room {} ({:?})", self.code, outcome);
            Ok(())
        })
    }
}
