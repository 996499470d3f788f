//! Canvas document and the surface contract the sync engine drives.

use crate::shapes::{Color, Shape, ShapeId};
use kurbo::{Affine, Vec2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum number of undo states to keep.
pub const MAX_UNDO_HISTORY: usize = 30;

/// A change observed on the surface since the last drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasChange {
    /// A new object was added.
    Added(ShapeId),
    /// An existing object was moved, resized, restyled or re-layered.
    Modified(ShapeId),
    /// An object was deleted.
    Removed(ShapeId),
    /// Every object was removed at once.
    Cleared,
    /// The whole content was replaced (undo, redo, snapshot load).
    Restored,
}

/// Full serialized state of the drawable surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    #[serde(default = "default_background")]
    pub background: Color,
    /// Objects in back-to-front order.
    #[serde(default)]
    pub objects: Vec<Shape>,
}

fn default_background() -> Color {
    Color::WHITE
}

impl Default for CanvasSnapshot {
    fn default() -> Self {
        Self {
            background: default_background(),
            objects: Vec::new(),
        }
    }
}

impl CanvasSnapshot {
    /// Serialize to the string form carried in `state` actions and room records.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// The drawable area the sync engine reads from and writes into.
///
/// Every mutation is recorded as a [`CanvasChange`] until drained with
/// [`take_changes`](CanvasSurface::take_changes).
pub trait CanvasSurface {
    /// Add an object. An object whose id is already present replaces the
    /// existing one in place; returns `false` in that case.
    fn add_object(&mut self, shape: Shape) -> bool;

    /// Mutate an object in place. Returns `false` if the id is unknown.
    fn modify_object(&mut self, id: ShapeId, edit: &mut dyn FnMut(&mut Shape)) -> bool;

    fn remove_object(&mut self, id: ShapeId) -> Option<Shape>;

    fn clear(&mut self);

    fn object(&self, id: ShapeId) -> Option<&Shape>;

    fn object_count(&self) -> usize;

    fn to_snapshot(&self) -> CanvasSnapshot;

    /// Replace the whole content with a snapshot.
    fn load_snapshot(&mut self, snapshot: CanvasSnapshot);

    /// Drain pending change events in the order they happened.
    fn take_changes(&mut self) -> Vec<CanvasChange>;
}

/// A snapshot of document state for undo/redo.
#[derive(Debug, Clone)]
struct DocumentSnapshot {
    shapes: HashMap<ShapeId, Shape>,
    z_order: Vec<ShapeId>,
}

/// A canvas document containing all shapes and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasDocument {
    /// Unique document identifier.
    pub id: String,
    /// Document name (tab title).
    pub name: String,
    pub background: Color,
    /// All shapes in the document, keyed by ID.
    pub shapes: HashMap<ShapeId, Shape>,
    /// Z-order of shapes (back to front).
    pub z_order: Vec<ShapeId>,
    #[serde(skip)]
    undo_stack: Vec<DocumentSnapshot>,
    #[serde(skip)]
    redo_stack: Vec<DocumentSnapshot>,
    #[serde(skip)]
    changes: Vec<CanvasChange>,
}

impl Default for CanvasDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "Untitled".to_string(),
            background: Color::WHITE,
            shapes: HashMap::new(),
            z_order: Vec::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            changes: Vec::new(),
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            shapes: self.shapes.clone(),
            z_order: self.z_order.clone(),
        }
    }

    fn restore(&mut self, snapshot: DocumentSnapshot) {
        self.shapes = snapshot.shapes;
        self.z_order = snapshot.z_order;
        self.changes.push(CanvasChange::Restored);
    }

    /// Push current state to undo stack (call before making changes).
    pub fn push_undo(&mut self) {
        let snapshot = self.snapshot();
        self.undo_stack.push(snapshot);
        self.redo_stack.clear();
        if self.undo_stack.len() > MAX_UNDO_HISTORY {
            self.undo_stack.remove(0);
        }
    }

    /// Undo the last change.
    /// Returns true if undo was performed, false if nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(snapshot) = self.undo_stack.pop() else {
            return false;
        };
        let current = self.snapshot();
        self.redo_stack.push(current);
        self.restore(snapshot);
        true
    }

    /// Redo the last undone change.
    /// Returns true if redo was performed, false if nothing to redo.
    pub fn redo(&mut self) -> bool {
        let Some(snapshot) = self.redo_stack.pop() else {
            return false;
        };
        let current = self.snapshot();
        self.undo_stack.push(current);
        self.restore(snapshot);
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Add a shape to the document.
    pub fn add_shape(&mut self, shape: Shape) -> bool {
        let id = shape.id();
        if self.shapes.insert(id, shape).is_some() {
            self.changes.push(CanvasChange::Modified(id));
            return false;
        }
        self.z_order.push(id);
        self.changes.push(CanvasChange::Added(id));
        true
    }

    /// Remove a shape from the document.
    pub fn remove_shape(&mut self, id: ShapeId) -> Option<Shape> {
        let removed = self.shapes.remove(&id)?;
        self.z_order.retain(|&shape_id| shape_id != id);
        self.changes.push(CanvasChange::Removed(id));
        Some(removed)
    }

    /// Clear all shapes from the document.
    pub fn clear(&mut self) {
        self.shapes.clear();
        self.z_order.clear();
        self.changes.push(CanvasChange::Cleared);
    }

    pub fn get_shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    /// Apply an edit to one shape and record it as a modification.
    pub fn update_shape(&mut self, id: ShapeId, edit: impl FnOnce(&mut Shape)) -> bool {
        let Some(shape) = self.shapes.get_mut(&id) else {
            return false;
        };
        edit(shape);
        self.changes.push(CanvasChange::Modified(id));
        true
    }

    /// Move a shape by a delta in world coordinates.
    pub fn translate_shape(&mut self, id: ShapeId, delta: Vec2) -> bool {
        self.update_shape(id, |shape| shape.transform(Affine::translate(delta)))
    }

    /// Get shapes in z-order (back to front).
    pub fn shapes_ordered(&self) -> impl Iterator<Item = &Shape> {
        self.z_order.iter().filter_map(|id| self.shapes.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

}

impl CanvasSurface for CanvasDocument {
    fn add_object(&mut self, shape: Shape) -> bool {
        self.add_shape(shape)
    }

    fn modify_object(&mut self, id: ShapeId, edit: &mut dyn FnMut(&mut Shape)) -> bool {
        self.update_shape(id, |shape| edit(shape))
    }

    fn remove_object(&mut self, id: ShapeId) -> Option<Shape> {
        self.remove_shape(id)
    }

    fn clear(&mut self) {
        CanvasDocument::clear(self)
    }

    fn object(&self, id: ShapeId) -> Option<&Shape> {
        self.get_shape(id)
    }

    fn object_count(&self) -> usize {
        self.len()
    }

    fn to_snapshot(&self) -> CanvasSnapshot {
        CanvasSnapshot {
            background: self.background,
            objects: self.shapes_ordered().cloned().collect(),
        }
    }

    fn load_snapshot(&mut self, snapshot: CanvasSnapshot) {
        self.background = snapshot.background;
        self.shapes.clear();
        self.z_order.clear();
        for shape in snapshot.objects {
            let id = shape.id();
            if self.shapes.insert(id, shape).is_none() {
                self.z_order.push(id);
            }
        }
        self.changes.push(CanvasChange::Restored);
    }

    fn take_changes(&mut self) -> Vec<CanvasChange> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{Ellipse, Freehand, Rectangle};
    use kurbo::Point;

    fn rect_at(x: f64) -> Shape {
        Rectangle::new(Point::new(x, 0.0), 10.0, 10.0).into()
    }

    #[test]
    fn test_document_creation() {
        let doc = CanvasDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.background, Color::WHITE);
    }

    #[test]
    fn test_add_records_change() {
        let mut doc = CanvasDocument::new();
        let shape = rect_at(0.0);
        let id = shape.id();
        assert!(doc.add_shape(shape));
        assert_eq!(doc.take_changes(), vec![CanvasChange::Added(id)]);
        assert!(doc.take_changes().is_empty());
    }

    #[test]
    fn test_add_same_id_replaces_in_place() {
        let mut doc = CanvasDocument::new();
        let shape = rect_at(0.0);
        let id = shape.id();
        doc.add_shape(shape.clone());
        doc.add_shape(rect_at(50.0));

        let mut moved = shape;
        moved.transform(Affine::translate(Vec2::new(5.0, 0.0)));
        assert!(!doc.add_shape(moved.clone()));
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.z_order[0], id);
        assert_eq!(doc.get_shape(id), Some(&moved));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut doc = CanvasDocument::new();
        let shape = rect_at(0.0);
        let id = shape.id();
        doc.add_shape(shape);
        doc.take_changes();

        assert!(doc.remove_shape(id).is_some());
        assert!(doc.remove_shape(id).is_none());
        doc.clear();
        assert_eq!(
            doc.take_changes(),
            vec![CanvasChange::Removed(id), CanvasChange::Cleared]
        );
    }

    #[test]
    fn test_translate_records_modified() {
        let mut doc = CanvasDocument::new();
        let shape = rect_at(0.0);
        let id = shape.id();
        doc.add_shape(shape);
        doc.take_changes();

        assert!(doc.translate_shape(id, Vec2::new(3.0, 4.0)));
        assert!(!doc.translate_shape(Uuid::new_v4(), Vec2::new(1.0, 1.0)));
        assert_eq!(doc.take_changes(), vec![CanvasChange::Modified(id)]);
        let moved = match doc.get_shape(id) {
            Some(Shape::Rectangle(rect)) => rect.position,
            other => panic!("expected the rectangle, got {:?}", other),
        };
        assert_eq!(moved, Point::new(3.0, 4.0));
    }

    #[test]
    fn test_undo_redo_records_restored() {
        let mut doc = CanvasDocument::new();
        doc.push_undo();
        doc.add_shape(rect_at(0.0));
        doc.take_changes();

        assert!(doc.undo());
        assert!(doc.is_empty());
        assert!(doc.redo());
        assert_eq!(doc.len(), 1);
        assert_eq!(
            doc.take_changes(),
            vec![CanvasChange::Restored, CanvasChange::Restored]
        );
    }

    #[test]
    fn test_undo_clears_redo() {
        let mut doc = CanvasDocument::new();
        doc.push_undo();
        doc.add_shape(rect_at(0.0));
        doc.undo();
        assert!(doc.can_redo());
        doc.push_undo();
        assert!(!doc.can_redo());
    }

    #[test]
    fn test_undo_history_is_bounded() {
        let mut doc = CanvasDocument::new();
        for i in 0..(MAX_UNDO_HISTORY + 5) {
            doc.push_undo();
            doc.add_shape(rect_at(i as f64));
        }
        let mut undone = 0;
        while doc.undo() {
            undone += 1;
        }
        assert_eq!(undone, MAX_UNDO_HISTORY);
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_undo_empty_stack() {
        let mut doc = CanvasDocument::new();
        assert!(!doc.undo());
        assert!(!doc.redo());
        assert!(doc.take_changes().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_order() {
        let mut doc = CanvasDocument::new();
        doc.add_shape(Ellipse::circle(Point::new(5.0, 5.0), 3.0).into());
        doc.add_shape(Freehand::from_points(vec![Point::ZERO, Point::new(4.0, 4.0)]).into());
        doc.add_shape(rect_at(8.0));

        let json = doc.to_snapshot().encode().unwrap();
        let mut other = CanvasDocument::new();
        other.load_snapshot(CanvasSnapshot::decode(&json).unwrap());
        assert_eq!(other.to_snapshot(), doc.to_snapshot());
        assert_eq!(other.z_order, doc.z_order);
        assert_eq!(other.take_changes(), vec![CanvasChange::Restored]);
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot = CanvasSnapshot::decode("{}").unwrap();
        assert_eq!(snapshot, CanvasSnapshot::default());
        assert!(CanvasSnapshot::decode("not json").is_err());
    }
}
