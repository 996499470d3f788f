//! Cursor presence: rate-limited publishing and the remote cursor map.
//!
//! A teacher observes every student's cursor; a student observes only the
//! teacher's. Entries leave the map only when the roster no longer lists
//! their participant; there is no idle timeout.

use crate::room::{Participant, Role};
use crate::sync::CursorPosition;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default minimum interval between two cursor publishes.
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Allows at most one publish per interval.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(CURSOR_INTERVAL)
    }
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Returns `true` (and starts a new interval) if a publish is allowed at `now`.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Last known cursor of a remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub id: String,
    pub name: String,
    pub position: CursorPosition,
}

/// Remote participant id → cursor, filtered by the local role.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_id: String,
    local_role: Role,
    teacher_id: String,
    cursors: BTreeMap<String, RemoteCursor>,
}

impl PresenceTracker {
    pub fn new(local: &Participant, teacher_id: impl Into<String>) -> Self {
        Self {
            local_id: local.id.clone(),
            local_role: local.role,
            teacher_id: teacher_id.into(),
            cursors: BTreeMap::new(),
        }
    }

    /// Whether cursors of `id` are shown locally.
    pub fn observes(&self, id: &str) -> bool {
        if id == self.local_id {
            return false;
        }
        match self.local_role {
            Role::Teacher => true,
            Role::Student => id == self.teacher_id,
        }
    }

    /// Record a cursor update. Returns the stored cursor if it changed.
    pub fn observe_cursor(&mut self, id: &str, name: &str, position: CursorPosition) -> Option<RemoteCursor> {
        if !self.observes(id) {
            return None;
        }
        let cursor = RemoteCursor {
            id: id.to_string(),
            name: name.to_string(),
            position,
        };
        if self.cursors.get(id) == Some(&cursor) {
            return None;
        }
        self.cursors.insert(id.to_string(), cursor.clone());
        Some(cursor)
    }

    /// Drop cursors whose participant is no longer in the roster. Returns the
    /// removed ids.
    pub fn sync_roster(&mut self, roster: &[Participant]) -> Vec<String> {
        let stale: Vec<String> = self
            .cursors
            .keys()
            .filter(|id| !roster.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        for id in &stale {
            self.cursors.remove(id);
        }
        stale
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.cursors.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn cursor(&self, id: &str) -> Option<&RemoteCursor> {
        self.cursors.get(id)
    }

    /// Observed cursors ordered by participant id.
    pub fn cursors(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.cursors.values()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let start = Instant::now();
        assert!(throttle.allow(start));
        assert!(!throttle.allow(start + Duration::from_millis(10)));
        assert!(!throttle.allow(start + Duration::from_millis(49)));
        assert!(throttle.allow(start + Duration::from_millis(50)));
        assert!(!throttle.allow(start + Duration::from_millis(60)));
    }

    #[test]
    fn test_teacher_observes_every_student() {
        let teacher = Participant::teacher("T");
        let mut tracker = PresenceTracker::new(&teacher, teacher.id.clone());
        let a = Participant::student("A");
        let b = Participant::student("B");

        assert!(tracker.observe_cursor(&a.id, &a.name, CursorPosition::new(1.0, 1.0)).is_some());
        assert!(tracker.observe_cursor(&b.id, &b.name, CursorPosition::new(2.0, 2.0)).is_some());
        assert!(tracker.observe_cursor(&teacher.id, "T", CursorPosition::new(0.0, 0.0)).is_none());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_student_observes_only_teacher() {
        let teacher = Participant::teacher("T");
        let me = Participant::student("Me");
        let other = Participant::student("Other");
        let mut tracker = PresenceTracker::new(&me, teacher.id.clone());

        assert!(tracker.observe_cursor(&other.id, "Other", CursorPosition::new(1.0, 1.0)).is_none());
        assert!(tracker.observe_cursor(&teacher.id, "T", CursorPosition::new(5.0, 5.0)).is_some());
        // Same position again is not a change
        assert!(tracker.observe_cursor(&teacher.id, "T", CursorPosition::new(5.0, 5.0)).is_none());
        assert_eq!(tracker.cursor(&teacher.id).map(|c| c.position), Some(CursorPosition::new(5.0, 5.0)));
    }

    #[test]
    fn test_roster_removes_stale_entries() {
        let teacher = Participant::teacher("T");
        let mut tracker = PresenceTracker::new(&teacher, teacher.id.clone());
        let a = Participant::student("A");
        let b = Participant::student("B");
        tracker.observe_cursor(&a.id, "A", CursorPosition::default());
        tracker.observe_cursor(&b.id, "B", CursorPosition::default());

        let removed = tracker.sync_roster(&[teacher.clone(), a.clone()]);
        assert_eq!(removed, vec![b.id.clone()]);
        assert!(tracker.cursor(&a.id).is_some());
        assert!(tracker.sync_roster(&[a.clone()]).is_empty());

        assert!(tracker.remove(&a.id));
        assert!(tracker.is_empty());
    }
}
