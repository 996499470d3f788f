//! Room registry: maps room codes to room records in a relay store.

use crate::error::{CollabError, CollabResult};
use crate::room::{Participant, RoomCode, RoomRecord, StudentRecord, UserRecord};
use crate::storage::{RelayStore, Subscription};
use crate::sync::{CursorPosition, DrawingAction, now_millis};
use rand::Rng;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How many fresh codes to try before giving up on a collision streak.
const MAX_CODE_ATTEMPTS: usize = 16;

const ACTION_KEY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ACTION_KEY_SUFFIX_LEN: usize = 9;

pub fn room_path(code: &RoomCode) -> String {
    format!("rooms/{}", code)
}

pub fn user_path(participant_id: &str) -> String {
    format!("users/{}", participant_id)
}

/// Key for a new entry in a room's action log.
pub fn action_key() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ACTION_KEY_SUFFIX_LEN)
        .map(|_| ACTION_KEY_ALPHABET[rng.gen_range(0..ACTION_KEY_ALPHABET.len())] as char)
        .collect();
    format!("{}_{}", now_millis(), suffix)
}

/// Write time encoded in an action key.
fn action_key_millis(key: &str) -> Option<u64> {
    key.split('_').next()?.parse().ok()
}

/// A stray write racing a deletion can leave `rooms/{code}` holding only
/// children such as `actions`. Such a remnant is not a room.
fn is_remnant(value: &Value) -> bool {
    value.get("id").is_none() || value.get("teacherId").is_none()
}

/// Decode a stored room value. Remnants read as absent.
pub fn decode_room(value: Option<Value>) -> CollabResult<Option<RoomRecord>> {
    match value {
        Some(value) if is_remnant(&value) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Result of leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The room had nobody left and was deleted.
    RoomDeleted,
}

/// Room registry backed by a relay store.
///
/// Owner checks are cooperative: they compare the locally held role and id
/// against the record, and the store itself enforces nothing.
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn RelayStore>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    /// Create a room owned by `owner` and register the owner as present.
    pub async fn create_room(&self, owner: &Participant, room_name: &str) -> CollabResult<RoomRecord> {
        if !owner.is_teacher() {
            return Err(CollabError::AuthorizationDenied(
                "only a teacher can create a room".to_string(),
            ));
        }

        let mut code = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = RoomCode::generate();
            if !self.store.exists(&room_path(&candidate)).await? {
                code = Some(candidate);
                break;
            }
            log::debug!("Room code {} already taken, retrying", candidate);
        }
        let code = code.ok_or_else(|| {
            CollabError::TransportUnavailable("could not allocate a free room code".to_string())
        })?;

        let now = now_millis();
        let record = RoomRecord {
            id: code.to_string(),
            name: room_name.to_string(),
            teacher_id: owner.id.clone(),
            teacher_name: owner.name.clone(),
            canvas_state: None,
            canvas_state_by: None,
            is_locked: false,
            created_at: now,
            last_updated: now,
            teacher_online: true,
            teacher_cursor: None,
            students: BTreeMap::new(),
            actions: BTreeMap::new(),
        };
        self.store
            .set(&room_path(&code), serde_json::to_value(&record)?)
            .await?;
        self.write_user(owner, &code, true).await?;

        log::info!("Room {} created by {}", code, owner.name);
        Ok(record)
    }

    /// Join an existing room. Nothing is written when the code is unknown.
    pub async fn join_room(&self, code: &str, participant: &Participant) -> CollabResult<RoomRecord> {
        let code = RoomCode::parse(code)?;
        let room = self
            .room(&code)
            .await?
            .ok_or_else(|| CollabError::RoomNotFound(code.to_string()))?;

        let mut fields = Map::new();
        if room.is_owner(&participant.id) {
            fields.insert("teacherOnline".into(), Value::Bool(true));
        } else if participant.is_teacher() {
            return Err(CollabError::AuthorizationDenied(format!(
                "room {} belongs to another teacher",
                code
            )));
        } else {
            let student = StudentRecord {
                id: participant.id.clone(),
                name: participant.name.clone(),
                joined_at: now_millis(),
                cursor: None,
            };
            fields.insert(
                format!("students/{}", participant.id),
                serde_json::to_value(&student)?,
            );
        }
        fields.insert("lastUpdated".into(), json!(now_millis()));
        self.store.update(&room_path(&code), fields).await?;
        self.write_user(participant, &code, true).await?;

        log::info!("{} joined room {}", participant.name, code);
        self.room(&code)
            .await?
            .ok_or_else(|| CollabError::RoomNotFound(code.to_string()))
    }

    /// Leave a room. The room is deleted as soon as neither the owner nor any
    /// student remains.
    pub async fn leave_room(&self, code: &RoomCode, participant: &Participant) -> CollabResult<LeaveOutcome> {
        let path = room_path(code);
        let Some(room) = self.room(code).await? else {
            return Ok(LeaveOutcome::RoomDeleted);
        };

        let outcome = if room.is_owner(&participant.id) {
            if room.students.is_empty() {
                self.store.remove(&path).await?;
                LeaveOutcome::RoomDeleted
            } else {
                let mut fields = Map::new();
                fields.insert("teacherOnline".into(), Value::Bool(false));
                fields.insert("teacherCursor".into(), Value::Null);
                fields.insert("lastUpdated".into(), json!(now_millis()));
                self.store.update(&path, fields).await?;
                LeaveOutcome::Left
            }
        } else {
            let others = room.students.keys().filter(|id| **id != participant.id).count();
            if others == 0 && !room.teacher_online {
                self.store.remove(&path).await?;
                LeaveOutcome::RoomDeleted
            } else {
                let mut fields = Map::new();
                fields.insert(format!("students/{}", participant.id), Value::Null);
                fields.insert("lastUpdated".into(), json!(now_millis()));
                self.store.update(&path, fields).await?;
                LeaveOutcome::Left
            }
        };

        self.write_user(participant, code, false).await?;
        if outcome == LeaveOutcome::RoomDeleted {
            log::info!("Room {} deleted after {} left", code, participant.name);
        }
        Ok(outcome)
    }

    /// Explicit teardown by the owner.
    pub async fn end_room(&self, code: &RoomCode, requester: &Participant) -> CollabResult<()> {
        self.require_owner(code, requester, "end the room").await?;
        self.store.remove(&room_path(code)).await?;
        self.write_user(requester, code, false).await?;
        log::info!("Room {} ended by {}", code, requester.name);
        Ok(())
    }

    /// Set the drawing lock. Refused without mutation unless `requester` is
    /// the owning teacher.
    pub async fn toggle_lock(&self, code: &RoomCode, requester: &Participant, locked: bool) -> CollabResult<()> {
        self.require_owner(code, requester, "lock the canvas").await?;
        let mut fields = Map::new();
        fields.insert("isLocked".into(), Value::Bool(locked));
        fields.insert("lastUpdated".into(), json!(now_millis()));
        self.store.update(&room_path(code), fields).await?;
        Ok(())
    }

    /// Replace the room's authoritative snapshot. Any participant may write
    /// it; the last write wins.
    pub async fn update_canvas_state(
        &self,
        code: &RoomCode,
        state: Option<&str>,
        by: &Participant,
    ) -> CollabResult<()> {
        let mut fields = Map::new();
        fields.insert("canvasState".into(), state.map_or(Value::Null, |s| Value::String(s.to_string())));
        fields.insert("canvasStateBy".into(), Value::String(by.id.clone()));
        fields.insert("lastUpdated".into(), json!(now_millis()));
        self.store.update(&room_path(code), fields).await?;
        Ok(())
    }

    /// Wipe the snapshot and the action log. Teacher only.
    pub async fn clear_canvas(&self, code: &RoomCode, requester: &Participant) -> CollabResult<()> {
        self.require_owner(code, requester, "clear the canvas").await?;
        let mut fields = Map::new();
        fields.insert("canvasState".into(), Value::Null);
        fields.insert("canvasStateBy".into(), Value::String(requester.id.clone()));
        fields.insert("actions".into(), Value::Null);
        fields.insert("lastUpdated".into(), json!(now_millis()));
        self.store.update(&room_path(code), fields).await?;
        Ok(())
    }

    /// Append to the transient action log. Returns the entry key.
    pub async fn push_action(&self, code: &RoomCode, action: &DrawingAction) -> CollabResult<String> {
        let key = action_key();
        self.store
            .set(
                &format!("{}/actions/{}", room_path(code), key),
                serde_json::to_value(action)?,
            )
            .await?;
        Ok(key)
    }

    pub async fn remove_action(&self, code: &RoomCode, key: &str) -> CollabResult<()> {
        self.store
            .remove(&format!("{}/actions/{}", room_path(code), key))
            .await?;
        Ok(())
    }

    /// Drop log entries written more than `retention_ms` ago. Returns how many
    /// were removed. A remnant left at the room path is deleted outright.
    pub async fn prune_actions(&self, code: &RoomCode, retention_ms: u64) -> CollabResult<usize> {
        let path = room_path(code);
        let value = self.store.get(&path).await?;
        if let Some(remnant) = value.as_ref().filter(|v| is_remnant(v)) {
            let count = remnant
                .get("actions")
                .and_then(Value::as_object)
                .map_or(0, Map::len);
            log::info!("Removing remnant of deleted room {}", code);
            self.store.remove(&path).await?;
            return Ok(count);
        }
        let Some(room) = decode_room(value)? else {
            return Ok(0);
        };
        let cutoff = now_millis().saturating_sub(retention_ms);
        let expired: Map<String, Value> = room
            .actions
            .iter()
            .filter(|(key, action)| action_key_millis(key).unwrap_or(action.timestamp) <= cutoff)
            .map(|(key, _)| (format!("actions/{}", key), Value::Null))
            .collect();
        let count = expired.len();
        if count > 0 {
            self.store.update(&room_path(code), expired).await?;
        }
        Ok(count)
    }

    /// Publish a cursor position: `teacherCursor` for the owner,
    /// `students/{id}/cursor` for everyone else.
    pub async fn update_cursor(
        &self,
        code: &RoomCode,
        participant: &Participant,
        position: CursorPosition,
        is_owner: bool,
    ) -> CollabResult<()> {
        let key = if is_owner {
            "teacherCursor".to_string()
        } else {
            format!("students/{}/cursor", participant.id)
        };
        let mut fields = Map::new();
        fields.insert(key, serde_json::to_value(position)?);
        self.store.update(&room_path(code), fields).await?;
        Ok(())
    }

    /// Current room record, if the room exists.
    pub async fn room(&self, code: &RoomCode) -> CollabResult<Option<RoomRecord>> {
        decode_room(self.store.get(&room_path(code)).await?)
    }

    /// Codes of every registered room.
    pub async fn room_codes(&self) -> CollabResult<Vec<RoomCode>> {
        let Some(Value::Object(rooms)) = self.store.get("rooms").await? else {
            return Ok(Vec::new());
        };
        Ok(rooms
            .keys()
            .filter_map(|key| RoomCode::parse(key).ok())
            .collect())
    }

    /// Subscribe to every change of a room record.
    pub async fn watch_room(&self, code: &RoomCode) -> CollabResult<Subscription> {
        Ok(self.store.subscribe(&room_path(code)).await?)
    }

    async fn require_owner(&self, code: &RoomCode, requester: &Participant, what: &str) -> CollabResult<RoomRecord> {
        if !requester.is_teacher() {
            return Err(CollabError::AuthorizationDenied(format!("only the teacher can {}", what)));
        }
        let room = self
            .room(code)
            .await?
            .ok_or_else(|| CollabError::RoomNotFound(code.to_string()))?;
        if !room.is_owner(&requester.id) {
            return Err(CollabError::AuthorizationDenied(format!(
                "only the owner of room {} can {}",
                code, what
            )));
        }
        Ok(room)
    }

    async fn write_user(&self, participant: &Participant, code: &RoomCode, online: bool) -> CollabResult<()> {
        let record = UserRecord {
            id: participant.id.clone(),
            name: participant.name.clone(),
            room_id: code.to_string(),
            is_teacher: participant.is_teacher(),
            online,
            last_seen: now_millis(),
        };
        self.store
            .set(&user_path(&participant.id), serde_json::to_value(&record)?)
            .await?;
        Ok(())
    }
}
