//! Room codes, participants and the persisted room record.

use crate::error::CollabError;
use crate::sync::{CursorPosition, DrawingAction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Symbols a room code is drawn from (no 0/O, 1/I).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Short human-readable room identifier, always stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Draw a fresh random code. Not cryptographically secure.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        RoomCode(code)
    }

    /// Parse user input: trimmed, case-insensitive.
    pub fn parse(input: &str) -> Result<Self, CollabError> {
        let code = input.trim().to_ascii_uppercase();
        let valid = code.len() == ROOM_CODE_LEN
            && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));
        if valid {
            Ok(RoomCode(code))
        } else {
            Err(CollabError::RoomNotFound(input.trim().to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomCode::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = CollabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoomCode::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

/// A local participant. The id is generated locally and never verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            id: format!("user_{}", Uuid::new_v4().simple()),
            name: name.into(),
            role,
        }
    }

    pub fn teacher(name: impl Into<String>) -> Self {
        Self::new(name, Role::Teacher)
    }

    pub fn student(name: impl Into<String>) -> Self {
        Self::new(name, Role::Student)
    }

    pub fn is_teacher(&self) -> bool {
        self.role == Role::Teacher
    }
}

/// Entry under `rooms/{code}/students/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub joined_at: u64,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
}

/// Entry under `users/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub room_id: String,
    pub is_teacher: bool,
    pub online: bool,
    pub last_seen: u64,
}

/// Persisted room record at `rooms/{code}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub teacher_id: String,
    pub teacher_name: String,
    #[serde(default)]
    pub canvas_state: Option<String>,
    /// Participant that wrote `canvas_state` last.
    #[serde(default)]
    pub canvas_state_by: Option<String>,
    #[serde(default)]
    pub is_locked: bool,
    pub created_at: u64,
    #[serde(default)]
    pub last_updated: u64,
    #[serde(default)]
    pub teacher_online: bool,
    #[serde(default)]
    pub teacher_cursor: Option<CursorPosition>,
    #[serde(default)]
    pub students: BTreeMap<String, StudentRecord>,
    /// Transient action log, keyed `<millis>_<random>`.
    #[serde(default)]
    pub actions: BTreeMap<String, DrawingAction>,
}

impl RoomRecord {
    pub fn is_owner(&self, participant_id: &str) -> bool {
        self.teacher_id == participant_id
    }

    pub fn teacher(&self) -> Participant {
        Participant {
            id: self.teacher_id.clone(),
            name: self.teacher_name.clone(),
            role: Role::Teacher,
        }
    }

    /// Everyone currently in the room, owner first if present.
    pub fn participants(&self) -> Vec<Participant> {
        let owner = self.teacher_online.then(|| self.teacher());
        owner
            .into_iter()
            .chain(self.students.iter().map(|(id, s)| Participant {
                id: id.clone(),
                name: s.name.clone(),
                role: Role::Student,
            }))
            .collect()
    }
}
