//! Closed polygon (triangles, stars and other outlines).

use super::{ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub(crate) id: ShapeId,
    /// Vertices in drawing order; the last connects back to the first.
    pub vertices: Vec<Point>,
    pub style: ShapeStyle,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self {
            id: Uuid::new_v4(),
            vertices,
            style: ShapeStyle::default(),
        }
    }
}

impl ShapeTrait for Polygon {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn transform(&mut self, affine: Affine) {
        for vertex in &mut self.vertices {
            *vertex = affine * *vertex;
        }
    }
}
