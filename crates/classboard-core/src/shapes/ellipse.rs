//! Ellipse shape.

use super::{ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An axis-aligned ellipse. Circles are ellipses with equal radii.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    pub(crate) id: ShapeId,
    /// Center point.
    pub center: Point,
    /// Horizontal radius.
    pub radius_x: f64,
    /// Vertical radius.
    pub radius_y: f64,
    /// Style properties.
    pub style: ShapeStyle,
}

impl Ellipse {
    /// Create a new ellipse.
    pub fn new(center: Point, radius_x: f64, radius_y: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            center,
            radius_x,
            radius_y,
            style: ShapeStyle::default(),
        }
    }

    /// Create a circle.
    pub fn circle(center: Point, radius: f64) -> Self {
        Self::new(center, radius, radius)
    }
}

impl ShapeTrait for Ellipse {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn transform(&mut self, affine: Affine) {
        self.center = affine * self.center;
        let coeffs = affine.as_coeffs();
        self.radius_x *= coeffs[0].abs();
        self.radius_y *= coeffs[3].abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::Vec2;

    #[test]
    fn test_translate_keeps_radii() {
        let mut circle = Ellipse::circle(Point::new(50.0, 50.0), 10.0);
        circle.transform(Affine::translate(Vec2::new(-10.0, 5.0)));
        assert_eq!(circle.center, Point::new(40.0, 55.0));
        assert!((circle.radius_x - 10.0).abs() < f64::EPSILON);
        assert!((circle.radius_y - 10.0).abs() < f64::EPSILON);
    }
}
