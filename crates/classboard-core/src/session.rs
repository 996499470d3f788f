//! Collaboration session: everything one participant holds while in a room.
//!
//! A session is created when a room is created or joined and torn down by
//! [`leave`](CollaborationSession::leave). The canvas is not owned by the
//! session; every call that touches it takes the surface explicitly, so the
//! UI keeps ownership and all mutation stays on the caller's task.

use crate::canvas::CanvasSurface;
use crate::collaboration::{ApplyOutcome, EngineStats, OutgoingAction, SyncEngine, ensure_can_draw};
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::presence::{CursorThrottle, PresenceTracker};
use crate::registry::RoomRegistry;
use crate::room::{Participant, RoomCode, RoomRecord};
use crate::storage::RemoteStore;
use crate::sync::{ConnectionState, CursorPosition, DrawingAction, SyncEvent};
use crate::transport::{DirectClient, DirectHost, RelayTransport, Transport, TransportEvent, TransportKind};
use std::sync::Arc;
use std::time::Instant;

/// Connect to the relay configured in `config`.
pub async fn open_relay_store(config: &CollabConfig) -> CollabResult<RoomRegistry> {
    let url = config.relay_endpoint()?;
    let store = RemoteStore::connect(url.as_str()).await?;
    Ok(RoomRegistry::new(Arc::new(store)))
}

pub struct CollaborationSession {
    participant: Participant,
    code: RoomCode,
    /// Cached copy of the room record; the store or host is authoritative.
    room: RoomRecord,
    roster: Vec<Participant>,
    engine: SyncEngine,
    presence: PresenceTracker,
    throttle: CursorThrottle,
    transport: Box<dyn Transport>,
    status: ConnectionState,
    /// Address students use to reach a direct host.
    endpoint: Option<String>,
}

impl CollaborationSession {
    fn assemble(
        participant: Participant,
        room: RoomRecord,
        transport: Box<dyn Transport>,
        surface: &mut dyn CanvasSurface,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let code = RoomCode::parse(&room.id)?;
        let mut engine = SyncEngine::new(participant.clone());
        engine.connect(surface, transport.kind() == TransportKind::DirectHost);
        engine.set_locked(room.is_locked);
        let presence = PresenceTracker::new(&participant, room.teacher_id.clone());
        Ok(Self {
            roster: room.participants(),
            participant,
            code,
            room,
            engine,
            presence,
            throttle: CursorThrottle::new(config.cursor_interval()),
            transport,
            status: ConnectionState::Connected,
            endpoint: None,
        })
    }

    /// Create a room on a relay and publish the current canvas as its
    /// initial snapshot.
    pub async fn create_relay(
        registry: RoomRegistry,
        teacher: Participant,
        room_name: &str,
        surface: &mut dyn CanvasSurface,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let room = registry.create_room(&teacher, room_name).await?;
        let code = RoomCode::parse(&room.id)?;
        let transport = match RelayTransport::open(registry.clone(), code.clone(), teacher.clone(), config).await {
            Ok(transport) => transport,
            Err(e) => {
                if let Err(cleanup) = registry.leave_room(&code, &teacher).await {
                    log::warn!("Failed to leave room {} after a failed open: {}", code, cleanup);
                }
                return Err(e);
            }
        };
        let mut session = Self::assemble(teacher, room, Box::new(transport), surface, config)?;
        session.publish_snapshot(surface).await?;
        Ok(session)
    }

    /// Join a relay room and replace the local canvas with its snapshot.
    pub async fn join_relay(
        registry: RoomRegistry,
        participant: Participant,
        code: &str,
        surface: &mut dyn CanvasSurface,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let room = registry.join_room(code, &participant).await?;
        let code = RoomCode::parse(&room.id)?;
        let transport = match RelayTransport::open(registry.clone(), code.clone(), participant.clone(), config).await
        {
            Ok(transport) => transport,
            Err(e) => {
                if let Err(cleanup) = registry.leave_room(&code, &participant).await {
                    log::warn!("Failed to leave room {} after a failed open: {}", code, cleanup);
                }
                return Err(e);
            }
        };
        let mut session = Self::assemble(participant, room, Box::new(transport), surface, config)?;
        session.reconcile(surface);
        Ok(session)
    }

    /// Host a room for students on the local network.
    pub async fn host_direct(
        teacher: Participant,
        room_name: &str,
        surface: &mut dyn CanvasSurface,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let host = DirectHost::bind(teacher.clone(), room_name, config).await?;
        let room = host
            .registry()
            .room(host.code())
            .await?
            .ok_or_else(|| CollabError::RoomNotFound(host.code().to_string()))?;
        let endpoint = host.url();
        let mut session = Self::assemble(teacher, room, Box::new(host), surface, config)?;
        session.endpoint = Some(endpoint);
        Ok(session)
    }

    /// Join a teacher hosting at `url`. The teacher sends its canvas shortly
    /// after the connection is accepted.
    pub async fn join_direct(
        url: &str,
        code: &str,
        participant: Participant,
        surface: &mut dyn CanvasSurface,
        config: &CollabConfig,
    ) -> CollabResult<Self> {
        let (client, room) = DirectClient::connect(url, code, participant.clone(), config).await?;
        let mut session = Self::assemble(participant, room, Box::new(client), surface, config)?;
        session.endpoint = Some(url.to_string());
        session.reconcile(surface);
        Ok(session)
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn room(&self) -> &RoomRecord {
        &self.room
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn status(&self) -> ConnectionState {
        self.status
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn is_locked(&self) -> bool {
        self.engine.is_locked()
    }

    /// Whether the local participant owns the room.
    pub fn is_owner(&self) -> bool {
        self.participant.is_teacher() && self.room.is_owner(&self.participant.id)
    }

    /// Check before starting a local drawing operation.
    pub fn ensure_can_draw(&self) -> CollabResult<()> {
        if !self.engine.is_connected() {
            return Err(CollabError::NotConnected);
        }
        ensure_can_draw(&self.engine)
    }

    fn reconcile(&mut self, surface: &mut dyn CanvasSurface) {
        if let Err(e) = self.engine.reconcile(surface, self.room.canvas_state.as_deref()) {
            log::warn!("Discarding unreadable room snapshot: {}", e);
        }
    }

    async fn deliver(&mut self, outgoing: &OutgoingAction) -> bool {
        match self.transport.send(outgoing).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send {} action: {}", outgoing.action.kind.as_str(), e);
                false
            }
        }
    }

    /// Send pending local changes. Send failures are logged and dropped.
    /// Returns how many actions went out.
    pub async fn flush(&mut self, surface: &mut dyn CanvasSurface) -> usize {
        let outgoing = self.engine.collect_outgoing(surface);
        let mut sent = 0;
        for item in &outgoing {
            if self.deliver(item).await {
                sent += 1;
            }
        }
        sent
    }

    /// Send the whole canvas as a `state` action.
    pub async fn publish_snapshot(&mut self, surface: &mut dyn CanvasSurface) -> CollabResult<()> {
        if !self.engine.is_connected() {
            return Err(CollabError::NotConnected);
        }
        let snapshot = surface.to_snapshot();
        let outgoing = OutgoingAction {
            action: DrawingAction::state(&snapshot, &self.participant)?,
            snapshot: Some(snapshot.encode()?),
        };
        self.deliver(&outgoing).await;
        Ok(())
    }

    /// Publish the local cursor, at most once per throttle interval. Returns
    /// whether it was sent.
    pub async fn move_cursor(&mut self, position: CursorPosition) -> CollabResult<bool> {
        if !self.engine.is_connected() {
            return Err(CollabError::NotConnected);
        }
        if !self.throttle.allow(Instant::now()) {
            return Ok(false);
        }
        match self.transport.publish_cursor(position).await {
            Ok(()) => Ok(true),
            Err(e) => {
                log::debug!("Cursor update dropped: {}", e);
                Ok(false)
            }
        }
    }

    /// Lock or unlock drawing for students. Anyone but the owner is ignored.
    pub async fn toggle_lock(&mut self, locked: bool) -> CollabResult<()> {
        if !self.is_owner() {
            log::warn!("Ignoring lock request from {}: not the room owner", self.participant.name);
            return Ok(());
        }
        self.transport.publish_lock(locked).await?;
        self.engine.set_locked(locked);
        self.room.is_locked = locked;
        log::info!("Room {} {}", self.code, if locked { "locked" } else { "unlocked" });
        Ok(())
    }

    /// Clear the canvas for everyone. Owner only.
    pub async fn clear_canvas(&mut self, surface: &mut dyn CanvasSurface) -> CollabResult<()> {
        if !self.is_owner() {
            return Err(CollabError::AuthorizationDenied(
                "only the teacher can clear the canvas".to_string(),
            ));
        }
        surface.clear();
        self.flush(surface).await;
        Ok(())
    }

    /// Wait for the next transport event. `None` once the transport ended.
    pub async fn next_input(&mut self) -> Option<TransportEvent> {
        self.transport.next_event().await
    }

    /// Apply one transport event and report what the UI should show.
    pub async fn handle_event(&mut self, surface: &mut dyn CanvasSurface, event: TransportEvent) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        match event {
            TransportEvent::Action { action, via } => match self.engine.apply_remote(surface, &action) {
                Ok(ApplyOutcome::Applied { forward }) => {
                    if forward {
                        if let Err(e) = self.transport.forward(&action, via.as_deref()).await {
                            log::warn!("Failed to forward {} action: {}", action.kind.as_str(), e);
                        }
                    }
                    events.push(SyncEvent::ActionApplied {
                        kind: action.kind,
                        from: action.user_id,
                    });
                }
                Ok(ApplyOutcome::Ignored) => {}
                Err(e) => log::warn!("Discarding {} action from {}: {}", action.kind.as_str(), action.user_name, e),
            },
            TransportEvent::PeerJoined { participant, .. } => {
                events.push(SyncEvent::PeerJoined(participant));
            }
            TransportEvent::PeerLeft { id } => {
                if self.presence.remove(&id) {
                    events.push(SyncEvent::CursorRemoved { id: id.clone() });
                }
                events.push(SyncEvent::PeerLeft { id });
            }
            TransportEvent::Roster(participants) => {
                for id in self.presence.sync_roster(&participants) {
                    events.push(SyncEvent::CursorRemoved { id });
                }
                self.roster = participants;
            }
            TransportEvent::Cursor { id, name, position } => {
                if let Some(cursor) = self.presence.observe_cursor(&id, &name, position) {
                    events.push(SyncEvent::CursorMoved(cursor));
                }
            }
            TransportEvent::LockChanged(locked) => {
                if locked != self.engine.is_locked() {
                    self.engine.set_locked(locked);
                    self.room.is_locked = locked;
                    events.push(SyncEvent::LockChanged(locked));
                }
            }
            TransportEvent::Status(status) => {
                self.status = status;
                if status == ConnectionState::Failed {
                    self.engine.disconnect();
                    self.presence.clear();
                }
                events.push(SyncEvent::StatusChanged(status));
            }
            TransportEvent::RoomClosed => {
                self.engine.disconnect();
                self.presence.clear();
                self.status = ConnectionState::Disconnected;
                events.push(SyncEvent::RoomClosed);
            }
            TransportEvent::SnapshotDue { peer } => {
                if let Err(e) = self.send_snapshot_to(surface, &peer).await {
                    log::warn!("Failed to send snapshot to {}: {}", peer, e);
                }
            }
        }
        events
    }

    async fn send_snapshot_to(&mut self, surface: &mut dyn CanvasSurface, peer: &str) -> CollabResult<()> {
        let action = DrawingAction::state(&surface.to_snapshot(), &self.participant)?;
        self.transport.send_to(peer, &action).await
    }

    /// Wait for one transport event and handle it. `None` once the transport
    /// ended.
    pub async fn process_next(&mut self, surface: &mut dyn CanvasSurface) -> Option<Vec<SyncEvent>> {
        let event = self.next_input().await?;
        Some(self.handle_event(surface, event).await)
    }

    /// Leave the room and close the transport.
    pub async fn leave(&mut self) -> CollabResult<()> {
        let was_connected = self.engine.is_connected();
        self.engine.disconnect();
        self.presence.clear();
        self.status = ConnectionState::Disconnected;
        self.transport.close().await?;
        if was_connected {
            log::info!("{} left room {}", self.participant.name, self.code);
        }
        Ok(())
    }
}
