//! Axis-aligned boxes and the segment clipping used to keep sensor rays
//! inside an enabled bounding box.

use nalgebra::{Point3, Vector3};

/// An axis-aligned box stored as centre and half-extents.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    pub center: Point3<f64>,
    pub half_size: Vector3<f64>,
}

impl Aabb {
    #[inline]
    pub fn from_min_max(min: Point3<f64>, max: Point3<f64>) -> Self {
        let half_size = (max - min) / 2.0;
        Self {
            center: min + half_size,
            half_size,
        }
    }

    /// A cube centred at `center` with edge length `2 * half_size`. This is
    /// the shape of every octree node.
    #[inline]
    pub fn cube(center: Point3<f64>, half_size: f64) -> Self {
        Self {
            center,
            half_size: Vector3::repeat(half_size),
        }
    }

    #[inline]
    pub fn min(&self) -> Point3<f64> {
        self.center - self.half_size
    }

    #[inline]
    pub fn max(&self) -> Point3<f64> {
        self.center + self.half_size
    }

    #[inline]
    pub fn translate(&mut self, translation: Vector3<f64>) {
        self.center += translation;
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|i| {
            (self.center[i] - other.center[i]).abs() <= self.half_size[i] + other.half_size[i]
        })
    }

    #[inline]
    pub fn contains_point(&self, point: &Point3<f64>) -> bool {
        (0..3).all(|i| (point[i] - self.center[i]).abs() <= self.half_size[i])
    }
}

/// A union of axis-aligned boxes used to clip traversals, queries and file
/// output to a region of interest. An empty volume means "everywhere".
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingVolume {
    aabbs: Vec<Aabb>,
}

impl BoundingVolume {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, aabb: Aabb) {
        self.aabbs.push(aabb);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.aabbs.is_empty()
    }

    /// `true` if `aabb` intersects the volume. An empty volume intersects
    /// everything.
    #[inline]
    pub fn intersects(&self, aabb: &Aabb) -> bool {
        self.is_empty() || self.aabbs.iter().any(|a| a.intersects(aabb))
    }
}

impl From<Aabb> for BoundingVolume {
    #[inline]
    fn from(aabb: Aabb) -> Self {
        Self { aabbs: vec![aabb] }
    }
}

/// Moves `origin` and `end` onto the boundary of the box where the segment
/// enters and exits it. Returns `false` iff the segment lies entirely
/// outside the box, in which case the endpoints are untouched.
pub fn move_line_into_bbx(
    bbx_min: &Point3<f64>,
    bbx_max: &Point3<f64>,
    origin: &mut Point3<f64>,
    end: &mut Point3<f64>,
) -> bool {
    for i in 0..3 {
        if (origin[i] < bbx_min[i] && end[i] < bbx_min[i])
            || (origin[i] > bbx_max[i] && end[i] > bbx_max[i])
        {
            return false;
        }
    }

    let mut hits: [Point3<f64>; 2] = [*origin; 2];
    let mut num_hits = 0;
    for plane in [bbx_min, bbx_max] {
        for i in 0..3 {
            if num_hits == 2 {
                break;
            }
            if let Some(hit) = plane_intersection(origin[i] - plane[i], end[i] - plane[i], origin, end)
            {
                if on_face(&hit, i, bbx_min, bbx_max) {
                    hits[num_hits] = hit;
                    num_hits += 1;
                }
            }
        }
    }

    let inside = |p: &Point3<f64>| {
        (0..3).all(|i| bbx_min[i] <= p[i] && p[i] <= bbx_max[i])
    };

    match num_hits {
        1 => {
            if inside(origin) {
                *end = hits[0];
            } else {
                *origin = hits[0];
            }
        }
        2 => {
            // Assign hits to the endpoints that move the least.
            let straight = (*origin - hits[0]).norm_squared() + (*end - hits[1]).norm_squared();
            let crossed = (*origin - hits[1]).norm_squared() + (*end - hits[0]).norm_squared();
            if straight <= crossed {
                *origin = hits[0];
                *end = hits[1];
            } else {
                *origin = hits[1];
                *end = hits[0];
            }
        }
        _ => {}
    }

    true
}

/// Parametric intersection of the segment with an axis-aligned plane, given
/// the signed distances of the endpoints to the plane.
#[inline]
fn plane_intersection(
    d_1: f64,
    d_2: f64,
    p_1: &Point3<f64>,
    p_2: &Point3<f64>,
) -> Option<Point3<f64>> {
    if d_1 * d_2 >= 0.0 {
        return None;
    }
    Some(p_1 + (p_2 - p_1) * (-d_1 / (d_2 - d_1)))
}

/// Whether a point on an `axis`-aligned plane lies within the face of the
/// box on that plane. Boundary points count as inside so that segments
/// running along a face are still clipped.
#[inline]
fn on_face(point: &Point3<f64>, axis: usize, bbx_min: &Point3<f64>, bbx_max: &Point3<f64>) -> bool {
    let (a, b) = match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    bbx_min[a] <= point[a] && point[a] <= bbx_max[a] && bbx_min[b] <= point[b] && point[b] <= bbx_max[b]
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

    #[test]
    fn aabb_intersection_is_inclusive() {
        let a = Aabb::cube(Point3::new(0.0, 0.0, 0.0), 1.0);
        let b = Aabb::cube(Point3::new(2.0, 0.0, 0.0), 1.0);
        let c = Aabb::cube(Point3::new(2.1, 0.0, 0.0), 1.0);

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn empty_volume_intersects_everything() {
        let volume = BoundingVolume::new();
        assert!(volume.intersects(&Aabb::cube(Point3::new(1e9, 0.0, 0.0), 0.1)));
    }

    #[test]
    fn segment_outside_box_is_rejected() {
        let mut origin = Point3::new(-2.0, 5.0, 0.0);
        let mut end = Point3::new(2.0, 5.0, 0.0);
        assert!(!move_line_into_bbx(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 1.0, 1.0),
            &mut origin,
            &mut end,
        ));
        assert_eq!(origin, Point3::new(-2.0, 5.0, 0.0));
    }

    #[test]
    fn segment_crossing_box_is_clipped_on_both_sides() {
        let mut origin = Point3::new(-1.0, 0.5, 0.5);
        let mut end = Point3::new(2.0, 0.5, 0.5);
        assert!(move_line_into_bbx(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 1.0, 1.0),
            &mut origin,
            &mut end,
        ));
        assert_relative_eq!(origin.x, 0.0);
        assert_relative_eq!(end.x, 1.0);
    }

    #[test]
    fn segment_along_box_edge_is_clipped() {
        let mut origin = Point3::new(-1.0, 0.0, 0.0);
        let mut end = Point3::new(2.0, 0.0, 0.0);
        assert!(move_line_into_bbx(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 1.0, 1.0),
            &mut origin,
            &mut end,
        ));
        assert_relative_eq!(origin.x, 0.0);
        assert_relative_eq!(end.x, 1.0);
    }

    #[test]
    fn segment_ending_inside_moves_one_endpoint() {
        let mut origin = Point3::new(-1.0, 0.5, 0.5);
        let mut end = Point3::new(0.5, 0.5, 0.5);
        assert!(move_line_into_bbx(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 1.0, 1.0),
            &mut origin,
            &mut end,
        ));
        assert_relative_eq!(origin.x, 0.0);
        assert_relative_eq!(end.x, 0.5);
    }
}
