//! Direct transport: the teacher hosts a WebSocket listener and every
//! student connects to it.
//!
//! The teacher validates each `hello` against a registry over a local
//! in-memory store, then relays actions between students. One task runs per
//! WebSocket link; links talk to the owning transport only through channels.

use super::{Transport, TransportEvent, TransportKind, roster_diff};
use crate::collaboration::OutgoingAction;
use crate::config::CollabConfig;
use crate::error::{CollabError, CollabResult};
use crate::registry::RoomRegistry;
use crate::room::{Participant, RoomCode, RoomRecord};
use crate::storage::{BoxFuture, MemoryStore};
use crate::sync::{ActionKind, ConnectionState, CursorPosition, DrawingAction};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use url::Url;
use uuid::Uuid;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the teacher refused a `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    RoomNotFound,
    Unauthorized,
    Unavailable,
}

/// Non-action frames of the direct protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// First frame of a student connection.
    Hello { room: String, participant: Participant },
    /// The teacher accepted the student.
    Welcome { room: RoomRecord },
    Rejected { code: RejectCode, message: String },
    Cursor {
        id: String,
        name: String,
        position: CursorPosition,
    },
    Lock { locked: bool },
    Roster { participants: Vec<Participant> },
}

/// One text frame on a direct link.
///
/// Actions travel in their own shape (`{type, data, userId, userName,
/// timestamp}`); everything else is a [`ControlFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum DirectFrame {
    Action(DrawingAction),
    Control(ControlFrame),
}

impl DirectFrame {
    pub fn encode(&self) -> CollabResult<String> {
        let text = match self {
            DirectFrame::Action(action) => serde_json::to_string(action)?,
            DirectFrame::Control(control) => serde_json::to_string(control)?,
        };
        Ok(text)
    }

    pub fn decode(text: &str) -> CollabResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let is_action = value
            .get("type")
            .is_some_and(|kind| serde_json::from_value::<ActionKind>(kind.clone()).is_ok());
        if is_action {
            Ok(DirectFrame::Action(serde_json::from_value(value)?))
        } else {
            Ok(DirectFrame::Control(serde_json::from_value(value)?))
        }
    }
}

impl From<ControlFrame> for DirectFrame {
    fn from(frame: ControlFrame) -> Self {
        DirectFrame::Control(frame)
    }
}

/// What a link task reports back.
enum LinkEvent {
    /// A WebSocket was accepted; frames for it go through `outbox`.
    Opened {
        link: String,
        outbox: mpsc::UnboundedSender<String>,
    },
    Text { link: String, text: String },
    /// The link ended. `graceful` is set when a close frame was exchanged.
    Closed { link: String, graceful: bool },
}

/// Pump one WebSocket until either side closes it. Dropping the outbox
/// sender closes the socket after queued frames are written.
async fn run_link<S>(
    socket: WebSocketStream<S>,
    link: String,
    mut outbox: mpsc::UnboundedReceiver<String>,
    inbox: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let graceful = loop {
        tokio::select! {
            frame = outbox.recv() => {
                let Some(text) = frame else {
                    let _ = sink.close().await;
                    break true;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::warn!("Direct link {} send error: {}", link, e);
                    break false;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let event = LinkEvent::Text { link: link.clone(), text: text.to_string() };
                        if inbox.send(event).is_err() {
                            break true;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Direct link {} read error: {}", link, e);
                        break false;
                    }
                    None => break false,
                }
            }
        }
    };
    log::debug!("Direct link {} closed (graceful: {})", link, graceful);
    let _ = inbox.send(LinkEvent::Closed { link, graceful });
}

async fn accept_loop(listener: TcpListener, inbox: mpsc::UnboundedSender<LinkEvent>, handshake: Duration) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Direct host accept error: {}", e);
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let inbox = inbox.clone();
        tokio::spawn(async move {
            let socket = match timeout(handshake, accept_async(stream)).await {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => {
                    log::debug!("WebSocket handshake with {} failed: {}", addr, e);
                    return;
                }
                Err(_) => {
                    log::debug!("WebSocket handshake with {} timed out", addr);
                    return;
                }
            };
            let link = Uuid::new_v4().to_string();
            let (outbox, outbox_rx) = mpsc::unbounded_channel();
            log::debug!("Direct link {} opened from {}", link, addr);
            if inbox
                .send(LinkEvent::Opened {
                    link: link.clone(),
                    outbox,
                })
                .is_err()
            {
                return;
            }
            run_link(socket, link, outbox_rx, inbox).await;
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

struct Peer {
    outbox: mpsc::UnboundedSender<String>,
    /// Set once the `hello` was accepted.
    participant: Option<Participant>,
    hello_deadline: Instant,
}

/// Teacher end of a direct session: the hub of the star.
///
/// Peers are keyed by connection id, so a student that reconnects never
/// evicts its own new link when the old one is reported closed.
pub struct DirectHost {
    participant: Participant,
    registry: RoomRegistry,
    code: RoomCode,
    local_addr: SocketAddr,
    peers: HashMap<String, Peer>,
    inbox: mpsc::UnboundedReceiver<LinkEvent>,
    accept_task: JoinHandle<()>,
    /// Connections waiting for their late-join snapshot.
    snapshot_due: VecDeque<(Instant, String)>,
    pending: VecDeque<TransportEvent>,
    locked: bool,
    handshake_timeout: Duration,
    snapshot_delay: Duration,
    closed: bool,
}

impl DirectHost {
    /// Create a room in a local registry and start listening on
    /// `config.direct_bind`.
    pub async fn bind(teacher: Participant, room_name: &str, config: &CollabConfig) -> CollabResult<Self> {
        let listener = TcpListener::bind(&config.direct_bind).await.map_err(|e| {
            CollabError::TransportUnavailable(format!("cannot listen on {}: {}", config.direct_bind, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CollabError::TransportUnavailable(e.to_string()))?;

        let registry = RoomRegistry::new(Arc::new(MemoryStore::new()));
        let record = registry.create_room(&teacher, room_name).await?;
        let code = RoomCode::parse(&record.id)?;

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, inbox_tx, config.handshake_timeout()));
        log::info!("Hosting room {} on ws://{}", code, local_addr);

        Ok(Self {
            participant: teacher,
            registry,
            code,
            local_addr,
            peers: HashMap::new(),
            inbox,
            accept_task,
            snapshot_due: VecDeque::new(),
            pending: VecDeque::new(),
            locked: false,
            handshake_timeout: config.handshake_timeout(),
            snapshot_delay: config.snapshot_delay(),
            closed: false,
        })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address students connect to. A wildcard bind needs the machine's
    /// reachable address instead.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// The local registry holding this room.
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Number of admitted students.
    pub fn peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.participant.is_some()).count()
    }

    fn send_frame(&self, link: &str, frame: &DirectFrame) -> CollabResult<()> {
        let peer = self
            .peers
            .get(link)
            .ok_or_else(|| CollabError::SendFailure(format!("no connection {}", link)))?;
        peer.outbox
            .send(frame.encode()?)
            .map_err(|_| CollabError::SendFailure(format!("connection {} is closed", link)))
    }

    fn broadcast(&self, frame: &DirectFrame, except: Option<&str>) -> CollabResult<()> {
        let text = frame.encode()?;
        for (link, peer) in &self.peers {
            if peer.participant.is_none() || except == Some(link.as_str()) {
                continue;
            }
            if peer.outbox.send(text.clone()).is_err() {
                log::debug!("Skipping closed connection {}", link);
            }
        }
        Ok(())
    }

    async fn broadcast_roster(&mut self) {
        let participants = match self.registry.room(&self.code).await {
            Ok(Some(room)) => room.participants(),
            Ok(None) => return,
            Err(e) => {
                log::warn!("Failed to read roster of {}: {}", self.code, e);
                return;
            }
        };
        let frame = DirectFrame::from(ControlFrame::Roster {
            participants: participants.clone(),
        });
        if let Err(e) = self.broadcast(&frame, None) {
            log::warn!("Failed to send roster: {}", e);
        }
        self.pending.push_back(TransportEvent::Roster(participants));
    }

    fn holds_participant(&self, id: &str) -> bool {
        self.peers
            .values()
            .any(|p| p.participant.as_ref().is_some_and(|q| q.id == id))
    }

    async fn admit(&mut self, link: String, room: String, participant: Participant) {
        match self.peers.get(&link) {
            Some(peer) if peer.participant.is_none() => {}
            _ => return,
        }
        let rejoining = self.holds_participant(&participant.id);

        match self.registry.join_room(&room, &participant).await {
            Ok(record) => {
                let welcome = DirectFrame::from(ControlFrame::Welcome { room: record });
                if let Err(e) = self.send_frame(&link, &welcome) {
                    log::warn!("Failed to welcome {}: {}", participant.name, e);
                }
                if let Some(peer) = self.peers.get_mut(&link) {
                    peer.participant = Some(participant.clone());
                }
                self.snapshot_due
                    .push_back((Instant::now() + self.snapshot_delay, link.clone()));
                log::info!("{} joined room {} over {}", participant.name, self.code, link);
                if !rejoining {
                    self.pending.push_back(TransportEvent::PeerJoined {
                        participant,
                        via: Some(link),
                    });
                }
                self.broadcast_roster().await;
            }
            Err(e) => {
                let code = match &e {
                    CollabError::RoomNotFound(_) => RejectCode::RoomNotFound,
                    CollabError::AuthorizationDenied(_) => RejectCode::Unauthorized,
                    _ => RejectCode::Unavailable,
                };
                log::info!("Rejected {} for room {}: {}", participant.name, room, e);
                let rejected = DirectFrame::from(ControlFrame::Rejected {
                    code,
                    message: e.to_string(),
                });
                if let Err(e) = self.send_frame(&link, &rejected) {
                    log::debug!("Failed to send rejection: {}", e);
                }
                self.peers.remove(&link);
            }
        }
    }

    async fn handle_frame(&mut self, link: String, frame: DirectFrame) {
        if let DirectFrame::Control(ControlFrame::Hello { room, participant }) = frame {
            self.admit(link, room, participant).await;
            return;
        }
        let Some(sender) = self.peers.get(&link).and_then(|p| p.participant.clone()) else {
            log::debug!("Ignoring frame from {} before hello", link);
            return;
        };
        match frame {
            DirectFrame::Action(action) => {
                if self.locked && !sender.is_teacher() {
                    log::debug!("Dropping action from {} while locked", sender.name);
                    return;
                }
                self.pending.push_back(TransportEvent::Action {
                    action,
                    via: Some(link),
                });
            }
            DirectFrame::Control(ControlFrame::Cursor { position, .. }) => {
                self.pending.push_back(TransportEvent::Cursor {
                    id: sender.id,
                    name: sender.name,
                    position,
                });
            }
            DirectFrame::Control(other) => {
                log::debug!("Ignoring unexpected frame from {}: {:?}", link, other);
            }
        }
    }

    async fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { link, outbox } => {
                self.peers.insert(
                    link,
                    Peer {
                        outbox,
                        participant: None,
                        hello_deadline: Instant::now() + self.handshake_timeout,
                    },
                );
            }
            LinkEvent::Text { link, text } => match DirectFrame::decode(&text) {
                Ok(frame) => self.handle_frame(link, frame).await,
                Err(e) => log::warn!("Malformed frame from {}: {}", link, e),
            },
            LinkEvent::Closed { link, .. } => {
                let Some(peer) = self.peers.remove(&link) else {
                    return;
                };
                self.snapshot_due.retain(|(_, due)| *due != link);
                let Some(participant) = peer.participant else {
                    return;
                };
                // A newer connection of the same student keeps them in the room
                if self.holds_participant(&participant.id) {
                    return;
                }
                if let Err(e) = self.registry.leave_room(&self.code, &participant).await {
                    log::warn!("Failed to record {} leaving: {}", participant.name, e);
                }
                log::info!("{} left room {}", participant.name, self.code);
                self.pending.push_back(TransportEvent::PeerLeft { id: participant.id });
                self.broadcast_roster().await;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let hello = self
            .peers
            .values()
            .filter(|p| p.participant.is_none())
            .map(|p| p.hello_deadline)
            .min();
        let snapshot = self.snapshot_due.front().map(|(at, _)| *at);
        match (hello, snapshot) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.snapshot_due.front() {
            if *at > now {
                break;
            }
            if let Some((_, link)) = self.snapshot_due.pop_front() {
                if self.peers.get(&link).is_some_and(|p| p.participant.is_some()) {
                    self.pending.push_back(TransportEvent::SnapshotDue { peer: link });
                }
            }
        }
        self.peers.retain(|link, peer| {
            let expired = peer.participant.is_none() && peer.hello_deadline <= now;
            if expired {
                log::debug!("Connection {} never said hello", link);
            }
            !expired
        });
    }

    async fn poll_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle_link(event).await,
                    None => {
                        self.closed = true;
                        return Some(TransportEvent::Status(ConnectionState::Failed));
                    }
                },
                _ = sleep_until_opt(deadline) => self.expire(Instant::now()),
            }
        }
    }
}

impl Drop for DirectHost {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Transport for DirectHost {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectHost
    }

    fn send<'a>(&'a mut self, outgoing: &'a OutgoingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async move { self.broadcast(&DirectFrame::Action(outgoing.action.clone()), None) })
    }

    fn forward<'a>(&'a mut self, action: &'a DrawingAction, except: Option<&'a str>) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async move { self.broadcast(&DirectFrame::Action(action.clone()), except) })
    }

    fn send_to<'a>(&'a mut self, peer: &'a str, action: &'a DrawingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async move { self.send_frame(peer, &DirectFrame::Action(action.clone())) })
    }

    fn publish_cursor(&mut self, position: CursorPosition) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            let frame = DirectFrame::from(ControlFrame::Cursor {
                id: self.participant.id.clone(),
                name: self.participant.name.clone(),
                position,
            });
            self.broadcast(&frame, None)
        })
    }

    fn publish_lock(&mut self, locked: bool) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            self.registry.toggle_lock(&self.code, &self.participant, locked).await?;
            self.locked = locked;
            self.broadcast(&DirectFrame::from(ControlFrame::Lock { locked }), None)
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        Box::pin(self.poll_event())
    }

    fn close(&mut self) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.accept_task.abort();
            self.pending.clear();
            self.snapshot_due.clear();
            // Dropping the outboxes closes every link after its queued frames
            self.peers.clear();
            self.registry.end_room(&self.code, &self.participant).await?;
            log::info!("Stopped hosting room {}", self.code);
            Ok(())
        })
    }
}

/// Read until the first text frame. `None` if the socket closes first.
async fn first_text<S>(socket: &mut WebSocketStream<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Connect, say hello and wait for the teacher's verdict.
async fn handshake(
    url: &str,
    code: &RoomCode,
    participant: &Participant,
    limit: Duration,
) -> CollabResult<(ClientSocket, RoomRecord)> {
    let (mut socket, _) = timeout(limit, connect_async(url))
        .await
        .map_err(|_| CollabError::TransportUnavailable(format!("timed out connecting to {}", url)))?
        .map_err(|e| CollabError::TransportUnavailable(format!("cannot reach {}: {}", url, e)))?;

    let hello = DirectFrame::from(ControlFrame::Hello {
        room: code.to_string(),
        participant: participant.clone(),
    })
    .encode()?;
    socket
        .send(Message::Text(hello.into()))
        .await
        .map_err(|e| CollabError::TransportUnavailable(e.to_string()))?;

    let reply = timeout(limit, first_text(&mut socket))
        .await
        .map_err(|_| CollabError::TransportUnavailable(format!("no answer from {}", url)))?
        .ok_or_else(|| CollabError::TransportUnavailable(format!("{} closed the connection", url)))?;

    match DirectFrame::decode(&reply)? {
        DirectFrame::Control(ControlFrame::Welcome { room }) => Ok((socket, room)),
        DirectFrame::Control(ControlFrame::Rejected { code: reason, message }) => Err(match reason {
            RejectCode::RoomNotFound => CollabError::RoomNotFound(code.to_string()),
            RejectCode::Unauthorized => CollabError::AuthorizationDenied(message),
            RejectCode::Unavailable => CollabError::TransportUnavailable(message),
        }),
        other => Err(CollabError::Deserialization(format!(
            "unexpected handshake reply: {:?}",
            other
        ))),
    }
}

struct Link {
    id: String,
    outbox: mpsc::UnboundedSender<String>,
}

/// Student end of a direct session.
///
/// A link that drops without a close frame is re-established once after a
/// backoff; a second loss ends the transport with `Failed`. A close from the
/// teacher ends it with `RoomClosed`.
pub struct DirectClient {
    url: String,
    participant: Participant,
    code: RoomCode,
    link: Option<Link>,
    inbox_tx: mpsc::UnboundedSender<LinkEvent>,
    inbox: mpsc::UnboundedReceiver<LinkEvent>,
    roster: Vec<Participant>,
    locked: bool,
    reconnected: bool,
    /// Backoff plus handshake of the one reconnect, run as its own task so a
    /// dropped `next_event` future never loses it.
    redial: Option<JoinHandle<CollabResult<(ClientSocket, RoomRecord)>>>,
    backoff: Duration,
    handshake_timeout: Duration,
    pending: VecDeque<TransportEvent>,
    closed: bool,
}

impl DirectClient {
    /// Connect to a teacher at `url` and join room `code`. Returns the room
    /// record from the teacher's welcome.
    pub async fn connect(
        url: &str,
        code: &str,
        participant: Participant,
        config: &CollabConfig,
    ) -> CollabResult<(Self, RoomRecord)> {
        let code = RoomCode::parse(code)?;
        let parsed = Url::parse(url)
            .map_err(|e| CollabError::TransportUnavailable(format!("invalid teacher address {}: {}", url, e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(CollabError::TransportUnavailable(format!(
                "teacher address must use ws:// or wss://, not {}://",
                parsed.scheme()
            )));
        }

        let limit = config.handshake_timeout();
        let (socket, record) = handshake(url, &code, &participant, limit).await?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let mut client = Self {
            url: url.to_string(),
            participant,
            code,
            link: None,
            inbox_tx,
            inbox,
            roster: record.participants(),
            locked: record.is_locked,
            reconnected: false,
            redial: None,
            backoff: config.reconnect_backoff(),
            handshake_timeout: limit,
            pending: VecDeque::new(),
            closed: false,
        };
        client.attach(socket);
        log::info!("Joined room {} at {}", client.code, client.url);
        Ok((client, record))
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn attach(&mut self, socket: ClientSocket) {
        let id = Uuid::new_v4().to_string();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(socket, id.clone(), outbox_rx, self.inbox_tx.clone()));
        self.link = Some(Link { id, outbox });
    }

    fn send_frame(&self, frame: &DirectFrame) -> CollabResult<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| CollabError::SendFailure("not connected to the teacher".to_string()))?;
        link.outbox
            .send(frame.encode()?)
            .map_err(|_| CollabError::SendFailure("link to the teacher is closed".to_string()))
    }

    fn update_roster(&mut self, participants: Vec<Participant>) {
        let (joined, left) = roster_diff(&self.roster, &participants, &self.participant.id);
        for participant in joined {
            self.pending.push_back(TransportEvent::PeerJoined { participant, via: None });
        }
        for id in left {
            self.pending.push_back(TransportEvent::PeerLeft { id });
        }
        self.roster = participants.clone();
        self.pending.push_back(TransportEvent::Roster(participants));
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match DirectFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Malformed frame from teacher: {}", e);
                return;
            }
        };
        match frame {
            DirectFrame::Action(action) => self.pending.push_back(TransportEvent::Action { action, via: None }),
            DirectFrame::Control(ControlFrame::Cursor { id, name, position }) => {
                self.pending.push_back(TransportEvent::Cursor { id, name, position });
            }
            DirectFrame::Control(ControlFrame::Lock { locked }) => {
                self.locked = locked;
                self.pending.push_back(TransportEvent::LockChanged(locked));
            }
            DirectFrame::Control(ControlFrame::Roster { participants }) => self.update_roster(participants),
            DirectFrame::Control(other) => log::debug!("Ignoring unexpected frame: {:?}", other),
        }
    }

    fn link_lost(&mut self, graceful: bool) {
        self.link = None;
        if graceful {
            log::info!("Teacher closed room {}", self.code);
            self.pending.push_back(TransportEvent::RoomClosed);
            self.closed = true;
        } else if self.reconnected {
            log::warn!("Lost the teacher again, giving up");
            self.pending.push_back(TransportEvent::Status(ConnectionState::Failed));
            self.closed = true;
        } else {
            log::warn!("Lost the teacher, reconnecting in {:?}", self.backoff);
            self.reconnected = true;
            self.pending.push_back(TransportEvent::Status(ConnectionState::Reconnecting));
            let url = self.url.clone();
            let code = self.code.clone();
            let participant = self.participant.clone();
            let (backoff, limit) = (self.backoff, self.handshake_timeout);
            self.redial = Some(tokio::spawn(async move {
                sleep(backoff).await;
                handshake(&url, &code, &participant, limit).await
            }));
        }
    }

    fn finish_reconnect(&mut self, outcome: CollabResult<(ClientSocket, RoomRecord)>) {
        match outcome {
            Ok((socket, record)) => {
                self.attach(socket);
                self.pending.push_back(TransportEvent::Status(ConnectionState::Connected));
                if record.is_locked != self.locked {
                    self.locked = record.is_locked;
                    self.pending.push_back(TransportEvent::LockChanged(record.is_locked));
                }
                self.update_roster(record.participants());
            }
            Err(e) => {
                log::warn!("Reconnect to {} failed: {}", self.url, e);
                self.pending.push_back(TransportEvent::Status(ConnectionState::Failed));
                self.closed = true;
            }
        }
    }

    async fn poll_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }
            if let Some(redial) = self.redial.as_mut() {
                let outcome = redial
                    .await
                    .map_err(|e| CollabError::TransportUnavailable(format!("reconnect task failed: {}", e)))
                    .and_then(|result| result);
                self.redial = None;
                self.finish_reconnect(outcome);
                continue;
            }
            let current = self.link.as_ref().map(|l| l.id.clone());
            match self.inbox.recv().await {
                Some(LinkEvent::Text { link, text }) if Some(&link) == current.as_ref() => self.handle_text(&text),
                Some(LinkEvent::Closed { link, graceful }) if Some(&link) == current.as_ref() => {
                    self.link_lost(graceful)
                }
                Some(_) => {}
                None => {
                    self.closed = true;
                    return Some(TransportEvent::Status(ConnectionState::Failed));
                }
            }
        }
    }
}

impl Drop for DirectClient {
    fn drop(&mut self) {
        if let Some(redial) = self.redial.take() {
            redial.abort();
        }
    }
}

impl Transport for DirectClient {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectClient
    }

    fn send<'a>(&'a mut self, outgoing: &'a OutgoingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async move { self.send_frame(&DirectFrame::Action(outgoing.action.clone())) })
    }

    fn forward<'a>(
        &'a mut self,
        _action: &'a DrawingAction,
        _except: Option<&'a str>,
    ) -> BoxFuture<'a, CollabResult<()>> {
        // Only the hub forwards
        Box::pin(async { Ok(()) })
    }

    fn send_to<'a>(&'a mut self, _peer: &'a str, _action: &'a DrawingAction) -> BoxFuture<'a, CollabResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn publish_cursor(&mut self, position: CursorPosition) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            self.send_frame(&DirectFrame::from(ControlFrame::Cursor {
                id: self.participant.id.clone(),
                name: self.participant.name.clone(),
                position,
            }))
        })
    }

    fn publish_lock(&mut self, _locked: bool) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async {
            Err(CollabError::AuthorizationDenied(
                "only the teacher can lock the canvas".to_string(),
            ))
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<TransportEvent>> {
        Box::pin(self.poll_event())
    }

    fn close(&mut self) -> BoxFuture<'_, CollabResult<()>> {
        Box::pin(async move {
            self.closed = true;
            if let Some(redial) = self.redial.take() {
                redial.abort();
            }
            self.pending.clear();
            // Dropping the outbox sends a close frame; the teacher records the leave
            self.link = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::CanvasSnapshot;
    use serde_json::json;

    fn config() -> CollabConfig {
        CollabConfig {
            snapshot_delay_ms: 20,
            reconnect_backoff_ms: 20,
            handshake_timeout_ms: 2_000,
            ..CollabConfig::default()
        }
    }

    async fn next(transport: &mut dyn Transport) -> TransportEvent {
        timeout(Duration::from_secs(5), transport.next_event())
            .await
            .expect("timed out waiting for an event")
            .expect("transport ended")
    }

    /// Skip events until one matches.
    async fn next_matching(
        transport: &mut dyn Transport,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> TransportEvent {
        loop {
            let event = next(transport).await;
            if pred(&event) {
                return event;
            }
        }
    }

    fn outgoing(action: DrawingAction) -> OutgoingAction {
        OutgoingAction {
            action,
            snapshot: Some(CanvasSnapshot::default().encode().unwrap()),
        }
    }

    #[test]
    fn test_frame_decoding() {
        let teacher = Participant::teacher("T");
        let action = DrawingAction::clear(&teacher);
        let text = DirectFrame::Action(action.clone()).encode().unwrap();
        assert_eq!(DirectFrame::decode(&text).unwrap(), DirectFrame::Action(action));

        let lock = DirectFrame::decode(r#"{"type":"lock","locked":true}"#).unwrap();
        assert_eq!(lock, DirectFrame::Control(ControlFrame::Lock { locked: true }));

        let rejected = serde_json::to_value(ControlFrame::Rejected {
            code: RejectCode::RoomNotFound,
            message: "x".into(),
        })
        .unwrap();
        assert_eq!(rejected["type"], json!("rejected"));
        assert_eq!(rejected["code"], json!("room_not_found"));

        assert!(DirectFrame::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(DirectFrame::decode("not json").is_err());
    }

    #[tokio::test]
    async fn test_wrong_code_is_rejected() {
        let config = config();
        let mut host = DirectHost::bind(Participant::teacher("T"), "Art", &config).await.unwrap();
        let url = host.url();
        let student = Participant::student("A");

        let join = tokio::spawn(async move { DirectClient::connect(&url, "ZZZZZZ", student, &config).await });
        // Drive the host until the rejection is sent
        let host_task = tokio::spawn(async move {
            let _ = timeout(Duration::from_millis(500), host.next_event()).await;
            host
        });
        let err = join.await.unwrap().err();
        assert!(matches!(err, Some(CollabError::RoomNotFound(_))));
        let host = host_task.await.unwrap();
        assert_eq!(host.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_relays_between_students() {
        let config = config();
        let teacher = Participant::teacher("T");
        let mut host = DirectHost::bind(teacher.clone(), "Art", &config).await.unwrap();
        let url = host.url();
        let code = host.code().to_string();

        let a = Participant::student("A");
        let b = Participant::student("B");
        let (url_a, code_a, a_clone, config_a) = (url.clone(), code.clone(), a.clone(), config.clone());
        let connect_a = tokio::spawn(async move { DirectClient::connect(&url_a, &code_a, a_clone, &config_a).await });
        let joined = next_matching(&mut host, |e| matches!(e, TransportEvent::PeerJoined { .. })).await;
        let (mut client_a, record) = connect_a.await.unwrap().unwrap();
        assert_eq!(record.id, code);
        let link_a = match joined {
            TransportEvent::PeerJoined { participant, via } => {
                assert_eq!(participant, a);
                via.unwrap()
            }
            _ => unreachable!(),
        };

        let (url_b, code_b, b_clone, config_b) = (url.clone(), code.clone(), b.clone(), config.clone());
        let connect_b = tokio::spawn(async move { DirectClient::connect(&url_b, &code_b, b_clone, &config_b).await });
        next_matching(&mut host, |e| matches!(e, TransportEvent::PeerJoined { .. })).await;
        let (mut client_b, _) = connect_b.await.unwrap().unwrap();
        assert_eq!(host.peer_count(), 2);

        // The snapshot timer fires for new connections
        next_matching(&mut host, |e| matches!(e, TransportEvent::SnapshotDue { .. })).await;

        // A's action reaches the hub tagged with A's link, and is forwarded to B only
        let action = DrawingAction::clear(&a);
        client_a.send(&outgoing(action.clone())).await.unwrap();
        let received = next_matching(&mut host, |e| matches!(e, TransportEvent::Action { .. })).await;
        assert_eq!(
            received,
            TransportEvent::Action {
                action: action.clone(),
                via: Some(link_a.clone())
            }
        );
        host.forward(&action, Some(&link_a)).await.unwrap();
        let forwarded = next_matching(&mut client_b, |e| matches!(e, TransportEvent::Action { .. })).await;
        assert_eq!(forwarded, TransportEvent::Action { action, via: None });

        // Lock reaches students
        host.publish_lock(true).await.unwrap();
        next_matching(&mut client_a, |e| *e == TransportEvent::LockChanged(true)).await;
        assert!(client_a.publish_lock(false).await.is_err());

        // B leaves; A sees the departure through the roster
        client_b.close().await.unwrap();
        let left = next_matching(&mut host, |e| matches!(e, TransportEvent::PeerLeft { .. })).await;
        assert_eq!(left, TransportEvent::PeerLeft { id: b.id.clone() });
        next_matching(&mut client_a, |e| *e == TransportEvent::PeerLeft { id: b.id.clone() }).await;

        // Teacher ends the session
        host.close().await.unwrap();
        next_matching(&mut client_a, |e| *e == TransportEvent::RoomClosed).await;
        assert!(client_a.next_event().await.is_none());
    }

    /// Minimal stand-in teacher: welcomes `sessions` connections and drops
    /// them without a close frame, except the last one if `keep_last`.
    async fn flaky_host(listener: TcpListener, sessions: usize, keep_last: bool) {
        let record: RoomRecord = serde_json::from_value(json!({
            "id": "ABC234", "name": "Art", "teacherId": "user_t",
            "teacherName": "T", "createdAt": 1, "teacherOnline": true
        }))
        .unwrap();
        let welcome = DirectFrame::from(ControlFrame::Welcome { room: record }).encode().unwrap();
        for session in 1..=sessions {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            first_text(&mut socket).await.unwrap();
            socket.send(Message::Text(welcome.clone().into())).await.unwrap();
            if keep_last && session == sessions {
                tokio::spawn(async move { while socket.next().await.is_some() {} });
            } else {
                drop(socket);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnects_once_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(flaky_host(listener, 2, true));

        let (mut client, _) = DirectClient::connect(&url, "abc234", Participant::student("A"), &config())
            .await
            .unwrap();
        assert_eq!(
            next(&mut client).await,
            TransportEvent::Status(ConnectionState::Reconnecting)
        );
        assert_eq!(next(&mut client).await, TransportEvent::Status(ConnectionState::Connected));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_second_failure_is_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        // One session, then the listener is gone
        tokio::spawn(flaky_host(listener, 1, false));

        let (mut client, _) = DirectClient::connect(&url, "ABC234", Participant::student("A"), &config())
            .await
            .unwrap();
        assert_eq!(
            next(&mut client).await,
            TransportEvent::Status(ConnectionState::Reconnecting)
        );
        assert_eq!(next(&mut client).await, TransportEvent::Status(ConnectionState::Failed));
        assert!(client.next_event().await.is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_survives_abandoned_polls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(flaky_host(listener, 2, true));

        let config = CollabConfig {
            reconnect_backoff_ms: 300,
            ..config()
        };
        let (mut client, _) = DirectClient::connect(&url, "ABC234", Participant::student("A"), &config)
            .await
            .unwrap();

        // Poll with a deadline shorter than the backoff, as a UI loop would
        let mut seen = Vec::new();
        for _ in 0..60 {
            if let Ok(event) = timeout(Duration::from_millis(50), client.next_event()).await {
                let done = event.is_none() || event == Some(TransportEvent::Status(ConnectionState::Connected));
                seen.push(event);
                if done {
                    break;
                }
            }
        }
        assert_eq!(
            seen,
            vec![
                Some(TransportEvent::Status(ConnectionState::Reconnecting)),
                Some(TransportEvent::Status(ConnectionState::Connected)),
            ]
        );
        assert!(client.is_connected());
    }
}
