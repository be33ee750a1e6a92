//! Voxel traversal by the Amanatides–Woo algorithm, generalised to walk
//! the key grid at any depth of the tree.

use crate::key::Key;
use crate::layout::TreeLayout;

use nalgebra::{Point3, Vector3};

/// Walks every node of depth `depth` intersected by a segment. The caller
/// owns the termination policy; the traversal only reports the current key
/// and the parametric distance at which it will next cross a boundary.
pub(crate) struct RayTraversal {
    current: Key,
    ending: Key,
    // Either -1, 0 or +1 per axis.
    step: [i32; 3],
    // The distance along the ray between two boundary crossings per axis.
    t_delta: Vector3<f64>,
    // The distance at which the ray crosses the next boundary per axis.
    t_max: Vector3<f64>,
}

impl RayTraversal {
    /// `direction` must be the normalised direction from `origin` to `end`.
    pub fn new(
        layout: &TreeLayout,
        origin: &Point3<f64>,
        end: &Point3<f64>,
        direction: &Vector3<f64>,
        depth: u8,
    ) -> Self {
        let current = layout.coord_to_key(origin, depth);
        let ending = layout.coord_to_key(end, depth);

        let mut step = [0i32; 3];
        let mut t_delta = Vector3::repeat(f64::MAX);
        let mut t_max = Vector3::repeat(f64::MAX);

        if current != ending {
            let center = layout.key_to_coord(&current);
            for i in 0..3 {
                step[i] = if direction[i] > 0.0 {
                    1
                } else if direction[i] < 0.0 {
                    -1
                } else {
                    0
                };

                if step[i] != 0 {
                    t_delta[i] = layout.node_size(depth) / direction[i].abs();
                    let border = center[i] + f64::from(step[i]) * layout.node_half_size(depth);
                    t_max[i] = (border - origin[i]) / direction[i];
                }
            }
        }

        Self {
            current,
            ending,
            step,
            t_delta,
            t_max,
        }
    }

    #[inline]
    pub fn current(&self) -> Key {
        self.current
    }

    #[inline]
    pub fn at_end(&self) -> bool {
        self.current == self.ending
    }

    /// The distance along the ray at which the traversal leaves the
    /// current node.
    #[inline]
    pub fn min_t(&self) -> f64 {
        self.t_max.x.min(self.t_max.y).min(self.t_max.z)
    }

    /// Advances to the neighbouring node across the nearest boundary.
    #[inline]
    pub fn step(&mut self) {
        let axis = if self.t_max.x < self.t_max.y {
            if self.t_max.x < self.t_max.z {
                0
            } else {
                2
            }
        } else if self.t_max.y < self.t_max.z {
            1
        } else {
            2
        };

        self.current.step_axis(axis, self.step[axis]);
        self.t_max[axis] += self.t_delta[axis];
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
