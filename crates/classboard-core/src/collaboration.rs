//! Sync engine: turns local canvas changes into drawing actions and applies
//! remote actions without echoing them back.
//!
//! The engine is sans-IO. The session drains [`OutgoingAction`]s from it and
//! hands them to a transport, and feeds it actions the transport received.

use crate::canvas::{CanvasChange, CanvasSnapshot, CanvasSurface};
use crate::error::{CollabError, CollabResult};
use crate::room::Participant;
use crate::sync::{ActionKind, DrawingAction};

/// Per-participant sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not in a room.
    Idle,
    /// In a room; local changes are sent and remote ones applied.
    Connected,
    /// Applying one remote change. Changes produced now are never sent.
    Applying,
}

/// Scoped `Applying` state. Dropping the guard restores the previous state,
/// including on early returns and unwinding.
pub struct ApplyGuard<'a> {
    state: &'a mut EngineState,
    previous: EngineState,
}

impl<'a> ApplyGuard<'a> {
    pub fn enter(state: &'a mut EngineState) -> Self {
        let previous = *state;
        *state = EngineState::Applying;
        Self { state, previous }
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        *self.state = self.previous;
    }
}

/// An action ready for the transport, plus the canvas snapshot after it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingAction {
    pub action: DrawingAction,
    /// Encoded snapshot of the local canvas once this flush is applied.
    /// `None` while the local canvas is detached from the shared one.
    pub snapshot: Option<String>,
}

/// What happened to a remote action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied locally. `forward` asks the caller to pass it on to the other
    /// peers (teacher hub in direct mode).
    Applied { forward: bool },
    /// Own echo, or not connected.
    Ignored,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub sent: u64,
    pub applied: u64,
    pub ignored: u64,
    pub failed: u64,
    /// Local changes dropped because the engine was idle or locked.
    pub discarded: u64,
}

pub struct SyncEngine {
    participant: Participant,
    state: EngineState,
    locked: bool,
    fan_out: bool,
    /// Local changes that were pending when a remote action arrived.
    deferred: Vec<CanvasChange>,
    /// Set by a student's local clear. The local canvas no longer mirrors
    /// the room, so no snapshot of it may be published until the next full
    /// state or clear arrives.
    detached: bool,
    stats: EngineStats,
}

impl SyncEngine {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            state: EngineState::Idle,
            locked: false,
            fan_out: false,
            deferred: Vec::new(),
            detached: false,
            stats: EngineStats::default(),
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != EngineState::Idle
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Whether a local clear left this canvas out of step with the room.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// `Idle -> Connected`. Changes made while idle are dropped; the join or
    /// create snapshot covers them. `fan_out` marks the teacher hub of a
    /// direct session.
    pub fn connect(&mut self, surface: &mut dyn CanvasSurface, fan_out: bool) {
        let stale = surface.take_changes();
        if !stale.is_empty() {
            log::debug!("Dropping {} changes made before connecting", stale.len());
        }
        self.deferred.clear();
        self.detached = false;
        self.fan_out = fan_out;
        self.state = EngineState::Connected;
    }

    /// `Connected -> Idle`.
    pub fn disconnect(&mut self) {
        self.state = EngineState::Idle;
        self.locked = false;
        self.fan_out = false;
        self.deferred.clear();
        self.detached = false;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Teachers can always draw; students only while unlocked.
    pub fn can_draw(&self) -> bool {
        self.participant.is_teacher() || !self.locked
    }

    /// Drain local changes into actions.
    ///
    /// An added freehand stroke becomes `draw`, any other added object `add`.
    /// Modifications, removals and restores collapse into one trailing
    /// `state` snapshot. A clear becomes `clear` for the teacher and stays
    /// local for students; after it, that student's adds and draws still go
    /// out but no snapshot of their canvas does until it is re-synced.
    pub fn collect_outgoing(&mut self, surface: &mut dyn CanvasSurface) -> Vec<OutgoingAction> {
        let mut changes = std::mem::take(&mut self.deferred);
        changes.extend(surface.take_changes());
        if changes.is_empty() {
            return Vec::new();
        }
        if self.state != EngineState::Connected || !self.can_draw() {
            log::debug!(
                "Discarding {} local changes ({:?}, locked: {})",
                changes.len(),
                self.state,
                self.locked
            );
            self.stats.discarded += changes.len() as u64;
            return Vec::new();
        }

        let mut actions = Vec::new();
        let mut needs_state = false;
        for change in changes {
            match change {
                CanvasChange::Added(id) => {
                    let Some(shape) = surface.object(id) else {
                        continue;
                    };
                    match DrawingAction::object(shape, &self.participant) {
                        Ok(action) => actions.push(action),
                        Err(e) => log::warn!("Failed to encode object {}: {}", id, e),
                    }
                }
                CanvasChange::Modified(_) | CanvasChange::Removed(_) | CanvasChange::Restored => {
                    needs_state = true;
                }
                CanvasChange::Cleared if self.participant.is_teacher() => {
                    actions.push(DrawingAction::clear(&self.participant));
                }
                CanvasChange::Cleared => {
                    log::debug!("Student clear stays local");
                    self.detached = true;
                }
            }
        }

        let snapshot = surface.to_snapshot();
        if needs_state && self.detached {
            log::debug!("Canvas detached by a local clear, keeping edits local");
        } else if needs_state {
            match DrawingAction::state(&snapshot, &self.participant) {
                Ok(action) => actions.push(action),
                Err(e) => log::warn!("Failed to encode canvas state: {}", e),
            }
        }
        let encoded = if self.detached {
            None
        } else {
            match snapshot.encode() {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    log::warn!("Failed to encode canvas state: {}", e);
                    return Vec::new();
                }
            }
        };

        self.stats.sent += actions.len() as u64;
        actions
            .into_iter()
            .map(|action| OutgoingAction {
                action,
                snapshot: encoded.clone(),
            })
            .collect()
    }

    /// Apply a remote action. Own actions are ignored. Local changes pending
    /// at this point are kept for the next [`collect_outgoing`](Self::collect_outgoing);
    /// changes caused by the application itself are discarded.
    pub fn apply_remote(
        &mut self,
        surface: &mut dyn CanvasSurface,
        action: &DrawingAction,
    ) -> CollabResult<ApplyOutcome> {
        if action.is_from(&self.participant.id) || self.state == EngineState::Idle {
            self.stats.ignored += 1;
            return Ok(ApplyOutcome::Ignored);
        }

        self.deferred.extend(surface.take_changes());
        let result = {
            let _guard = ApplyGuard::enter(&mut self.state);
            let result = apply_action(surface, action);
            surface.take_changes();
            result
        };

        match result {
            Ok(()) => {
                if matches!(action.kind, ActionKind::State | ActionKind::Clear) {
                    self.detached = false;
                }
                self.stats.applied += 1;
                log::debug!("Applied {} from {}", action.kind.as_str(), action.user_name);
                Ok(ApplyOutcome::Applied {
                    forward: self.fan_out,
                })
            }
            Err(e) => {
                self.stats.failed += 1;
                Err(e)
            }
        }
    }

    /// Late-join catch-up: replace the whole canvas with the room snapshot.
    /// A missing snapshot leaves the canvas as it is.
    pub fn reconcile(&mut self, surface: &mut dyn CanvasSurface, snapshot: Option<&str>) -> CollabResult<()> {
        let Some(encoded) = snapshot else {
            return Ok(());
        };
        let snapshot = CanvasSnapshot::decode(encoded)?;
        let _guard = ApplyGuard::enter(&mut self.state);
        surface.load_snapshot(snapshot);
        surface.take_changes();
        self.detached = false;
        Ok(())
    }
}

fn apply_action(surface: &mut dyn CanvasSurface, action: &DrawingAction) -> CollabResult<()> {
    match action.kind {
        ActionKind::State => {
            let snapshot = action.decode_snapshot()?;
            surface.load_snapshot(snapshot);
        }
        ActionKind::Add | ActionKind::Draw => {
            let shape = action.decode_object()?;
            surface.add_object(shape);
        }
        ActionKind::Clear => surface.clear(),
    }
    Ok(())
}

/// Refuse a local drawing attempt while the canvas is locked for students.
pub fn ensure_can_draw(engine: &SyncEngine) -> CollabResult<()> {
    if engine.can_draw() {
        Ok(())
    } else {
        Err(CollabError::CanvasLocked)
    }
}
