//! A minimal point-cloud container for sensor integration.

use nalgebra::{Isometry3, Point3};

/// An ordered collection of sensor hit points in map coordinates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Point3<f64>>,
}

impl PointCloud {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, point: Point3<f64>) {
        self.points.push(point);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Point3<f64>> {
        self.points.iter()
    }

    /// Applies a rigid transform to every point in place.
    pub fn transform(&mut self, frame: &Isometry3<f64>) {
        for point in &mut self.points {
            *point = frame.transform_point(point);
        }
    }

    /// A copy of the cloud with `frame` applied.
    pub fn transformed(&self, frame: &Isometry3<f64>) -> Self {
        let mut cloud = self.clone();
        cloud.transform(frame);
        cloud
    }
}

impl From<Vec<Point3<f64>>> for PointCloud {
    #[inline]
    fn from(points: Vec<Point3<f64>>) -> Self {
        Self { points }
    }
}

impl FromIterator<Point3<f64>> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point3<f64>>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point3<f64>;
    type IntoIter = std::slice::Iter<'a, Point3<f64>>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn transform_translates_points() {
        let mut cloud: PointCloud = vec![Point3::new(1.0, 0.0, 0.0)].into();
        cloud.transform(&Isometry3::translation(0.0, 2.0, 0.0));

        assert_eq!(cloud.iter().next(), Some(&Point3::new(1.0, 2.0, 0.0)));
    }

    #[test]
    fn transform_rotates_about_the_frame_origin() {
        let mut cloud: PointCloud = vec![Point3::new(1.0, 0.0, 0.0)].into();
        let quarter_turn = Isometry3::rotation(Vector3::z() * std::f64::consts::FRAC_PI_2);
        cloud.transform(&quarter_turn);

        let point = cloud.iter().next().unwrap();
        assert_relative_eq!(point.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(point.y, 1.0, epsilon = 1e-12);
    }
}
