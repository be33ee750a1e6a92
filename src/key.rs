//! Discrete voxel addresses.
//!
//! A [`Key`] identifies one node of the octree by its three grid
//! coordinates and its depth. Depth-0 keys address single voxels; a key at
//! depth `d` addresses a cube of `8^d` voxels. The coordinates are offset
//! by half the addressable range so that the metric origin sits at the
//! centre of the index space.

use std::ops::{Index, IndexMut};

use fnv::{FnvHashMap, FnvHashSet};

/// Keys hash into small tables all over the hot paths, so use the same
/// small-key hasher as the rest of the crate.
pub type KeySet = FnvHashSet<Key>;
pub type KeyMap<T> = FnvHashMap<Key, T>;

/// The sequence of keys traversed by a ray.
pub type KeyRay = Vec<Key>;

/// The address of one octree node: grid coordinates plus depth.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Key {
    coords: [u32; 3],
    depth: u8,
}

impl Key {
    #[inline]
    pub fn new(x: u32, y: u32, z: u32, depth: u8) -> Self {
        Self {
            coords: [x, y, z],
            depth,
        }
    }

    #[inline]
    pub fn x(&self) -> u32 {
        self.coords[0]
    }

    #[inline]
    pub fn y(&self) -> u32 {
        self.coords[1]
    }

    #[inline]
    pub fn z(&self) -> u32 {
        self.coords[2]
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Offsets one coordinate by a signed number of nodes at this key's
    /// depth. Used by the ray traversal to step between neighbours.
    #[inline]
    pub(crate) fn step_axis(&mut self, axis: usize, step: i32) {
        let delta = (step as i64) << self.depth;
        self.coords[axis] = (self.coords[axis] as i64 + delta) as u32;
    }
}

impl Index<usize> for Key {
    type Output = u32;

    #[inline]
    fn index(&self, axis: usize) -> &u32 {
        &self.coords[axis]
    }
}

impl IndexMut<usize> for Key {
    #[inline]
    fn index_mut(&mut self, axis: usize) -> &mut u32 {
        &mut self.coords[axis]
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

    #[test]
    fn stepping_moves_by_whole_nodes() {
        let mut key = Key::new(32, 32, 32, 2);
        key.step_axis(0, 1);
        key.step_axis(2, -2);

        assert_eq!(key, Key::new(36, 32, 24, 2));
    }

    #[test]
    fn keys_with_different_depths_are_distinct() {
        let mut set = KeySet::default();
        set.insert(Key::new(1, 2, 3, 0));
        set.insert(Key::new(1, 2, 3, 1));

        assert_eq!(set.len(), 2);
    }
}
