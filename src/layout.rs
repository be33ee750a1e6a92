//! Conversions between metric coordinates, keys and node sizes.

use crate::key::Key;

use nalgebra::Point3;

/// The fixed discretisation of a map: voxel edge length, number of depth
/// levels, and the derived per-depth size tables. All conversions are pure;
/// the bounds-checked variants live on the tree, which also knows about the
/// optional bounding box.
#[derive(Clone, Debug)]
pub(crate) struct TreeLayout {
    resolution: f64,
    resolution_factor: f64,
    depth_levels: u8,
    max_value: u32,
    node_sizes: Vec<f64>,
    node_half_sizes: Vec<f64>,
}

impl TreeLayout {
    /// `resolution` and `depth_levels` must already be validated.
    pub fn new(resolution: f64, depth_levels: u8) -> Self {
        let mut node_sizes = Vec::with_capacity(depth_levels as usize + 1);
        let mut node_half_sizes = Vec::with_capacity(depth_levels as usize + 1);
        node_sizes.push(resolution);
        node_half_sizes.push(resolution / 2.0);
        for depth in 1..=depth_levels as usize {
            node_sizes.push(node_sizes[depth - 1] * 2.0);
            node_half_sizes.push(node_sizes[depth - 1]);
        }

        Self {
            resolution,
            resolution_factor: 1.0 / resolution,
            depth_levels,
            max_value: 1 << (depth_levels - 1),
            node_sizes,
            node_half_sizes,
        }
    }

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    #[inline]
    pub fn depth_levels(&self) -> u8 {
        self.depth_levels
    }

    #[inline]
    pub fn node_size(&self, depth: u8) -> f64 {
        self.node_sizes[depth as usize]
    }

    #[inline]
    pub fn node_half_size(&self, depth: u8) -> f64 {
        self.node_half_sizes[depth as usize]
    }

    /// The lowest coordinate the map can address, per axis.
    #[inline]
    pub fn min_coord(&self) -> Point3<f64> {
        let half_size = -self.node_half_size(self.depth_levels);
        Point3::new(half_size, half_size, half_size)
    }

    /// The highest coordinate the map can address, per axis.
    #[inline]
    pub fn max_coord(&self) -> Point3<f64> {
        let half_size = self.node_half_size(self.depth_levels);
        Point3::new(half_size, half_size, half_size)
    }

    #[inline]
    pub fn coord_to_key_axis(&self, coord: f64, depth: u8) -> u32 {
        let key_value = (self.resolution_factor * coord).floor() as i64;
        if depth == 0 {
            return (key_value + self.max_value as i64) as u32;
        }
        (((key_value >> depth) << depth) + (1 << (depth - 1)) + self.max_value as i64) as u32
    }

    #[inline]
    pub fn coord_to_key(&self, coord: &Point3<f64>, depth: u8) -> Key {
        Key::new(
            self.coord_to_key_axis(coord.x, depth),
            self.coord_to_key_axis(coord.y, depth),
            self.coord_to_key_axis(coord.z, depth),
            depth,
        )
    }

    #[inline]
    pub fn key_to_coord_axis(&self, key: u32, depth: u8) -> f64 {
        if depth == self.depth_levels {
            return 0.0;
        }

        let divider = f64::from(1u32 << depth);
        ((f64::from(key) - f64::from(self.max_value)) / divider).floor() * self.node_size(depth)
            + self.node_half_size(depth)
    }

    /// The centre of the node addressed by `key`, at the key's own depth.
    #[inline]
    pub fn key_to_coord(&self, key: &Key) -> Point3<f64> {
        self.key_to_coord_at(key, key.depth())
    }

    #[inline]
    pub fn key_to_coord_at(&self, key: &Key, depth: u8) -> Point3<f64> {
        Point3::new(
            self.key_to_coord_axis(key.x(), depth),
            self.key_to_coord_axis(key.y(), depth),
            self.key_to_coord_axis(key.z(), depth),
        )
    }
}

/// The centre of child `index` of a node centred at `parent` whose children
/// have half-extent `child_half_size`. The index uses the same x/y/z bit
/// order as Morton child indices.
#[inline]
pub(crate) fn child_center(
    parent: &Point3<f64>,
    child_half_size: f64,
    index: usize,
) -> Point3<f64> {
    let offset = |bit: usize| {
        if index & bit != 0 {
            child_half_size
        } else {
            -child_half_size
        }
    };

    Point3::new(
        parent.x + offset(1),
        parent.y + offset(2),
        parent.z + offset(4),
    )
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
