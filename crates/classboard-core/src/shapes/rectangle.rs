//! Rectangle shape.

use super::{ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An axis-aligned rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub(crate) id: ShapeId,
    /// Top-left corner position.
    pub position: Point,
    pub width: f64,
    pub height: f64,
    /// Style properties.
    pub style: ShapeStyle,
}

impl Rectangle {
    /// Create a new rectangle.
    pub fn new(position: Point, width: f64, height: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            width,
            height,
            style: ShapeStyle::default(),
        }
    }
}

impl ShapeTrait for Rectangle {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn transform(&mut self, affine: Affine) {
        self.position = affine * self.position;
        // Scale only; rotation and skew are not representable here
        let coeffs = affine.as_coeffs();
        self.width *= coeffs[0].abs();
        self.height *= coeffs[3].abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::Vec2;

    #[test]
    fn test_translate() {
        let mut rect = Rectangle::new(Point::new(10.0, 10.0), 20.0, 20.0);
        rect.transform(Affine::translate(Vec2::new(5.0, -5.0)));
        assert_eq!(rect.position, Point::new(15.0, 5.0));
        assert!((rect.width - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scale() {
        let mut rect = Rectangle::new(Point::new(10.0, 10.0), 20.0, 5.0);
        rect.transform(Affine::scale_non_uniform(2.0, 3.0));
        assert_eq!(rect.position, Point::new(20.0, 30.0));
        assert!((rect.width - 40.0).abs() < f64::EPSILON);
        assert!((rect.height - 15.0).abs() < f64::EPSILON);
    }
}
