//! Morton-coded node identifiers.
//!
//! A [`Code`] packs the three coordinates of a [`Key`] into a single
//! bit-interleaved word plus a depth tag, so that the path from the root
//! to a node can be read off three bits at a time. Codes are the canonical
//! hash-map key for batched sensor updates and for the change-detection
//! set.
//!
//! <https://en.wikipedia.org/wiki/Z-order_curve>

use crate::key::Key;

use bitintr::{Pdep, Pext};
use fnv::{FnvHashMap, FnvHashSet};
use std::fmt;

pub type CodeSet = FnvHashSet<Code>;
pub type CodeMap<T> = FnvHashMap<Code, T>;

/// A Morton-interleaved voxel identifier plus depth. Supports coordinates
/// up to 21 bits each, matching the deepest allowed tree.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Code {
    code: u64,
    depth: u8,
}

impl Code {
    // Only 21 bits can be set in each mask.
    const X_MASK: u64 =
        0b0001_0010_0100_1001_0010_0100_1001_0010_0100_1001_0010_0100_1001_0010_0100_1001;
    const Y_MASK: u64 = Self::X_MASK << 1;
    const Z_MASK: u64 = Self::X_MASK << 2;

    const COORD_BITS: u64 = (1 << 21) - 1;

    #[inline]
    pub fn new(code: u64, depth: u8) -> Self {
        Self { code, depth }
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.code
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The three bits selecting which child of the depth `depth + 1`
    /// ancestor leads towards this code.
    #[inline]
    pub fn child_index(&self, depth: u8) -> usize {
        ((self.code >> (3 * depth as u64)) & 0b111) as usize
    }

    /// Truncates the code to a shallower-or-equal ancestor depth.
    #[inline]
    pub fn to_depth(&self, depth: u8) -> Self {
        let shift = 3 * depth as u64;
        Self {
            code: (self.code >> shift) << shift,
            depth,
        }
    }

    /// Descends into child `index`. Only meaningful for codes above
    /// depth 0.
    #[inline]
    pub fn child(&self, index: usize) -> Self {
        debug_assert!(index < 8);
        let child_depth = self.depth - 1;
        Self {
            code: self.code | ((index as u64) << (3 * child_depth as u64)),
            depth: child_depth,
        }
    }

    /// The canonical key for this code. Coordinate bits below the code's
    /// depth are re-centred on the node, matching the keys produced by
    /// coordinate conversion.
    #[inline]
    pub fn to_key(&self) -> Key {
        let x = canonical(self.code.pext(Self::X_MASK) as u32, self.depth);
        let y = canonical(self.code.pext(Self::Y_MASK) as u32, self.depth);
        let z = canonical(self.code.pext(Self::Z_MASK) as u32, self.depth);

        Key::new(x, y, z, self.depth)
    }
}

#[inline]
fn canonical(coord: u32, depth: u8) -> u32 {
    if depth == 0 {
        coord
    } else {
        ((coord >> depth) << depth) + (1 << (depth - 1))
    }
}

impl From<Key> for Code {
    #[inline]
    fn from(key: Key) -> Self {
        let x = (key.x() as u64 & Code::COORD_BITS).pdep(Code::X_MASK);
        let y = (key.y() as u64 & Code::COORD_BITS).pdep(Code::Y_MASK);
        let z = (key.z() as u64 & Code::COORD_BITS).pdep(Code::Z_MASK);

        Self {
            code: x | y | z,
            depth: key.depth(),
        }
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({:b} @ {})", self.code, self.depth)
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

    use rand::Rng;

    #[test]
    fn key_code_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let key = Key::new(
                rng.gen_range(0..1 << 21),
                rng.gen_range(0..1 << 21),
                rng.gen_range(0..1 << 21),
                0,
            );

            assert_eq!(Code::from(key).to_key(), key);
        }
    }

    #[test]
    fn truncated_codes_produce_centred_keys() {
        let key = Key::new(0b1011, 0b0110, 0b0001, 0);
        let coarse = Code::from(key).to_depth(2).to_key();

        // Bits below depth 2 are replaced by the node-centre offset.
        assert_eq!(coarse, Key::new(0b1010, 0b0110, 0b0010, 2));
    }

    #[test]
    fn child_index_recovers_the_descent_path() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let key = Key::new(
                rng.gen_range(0..1 << 21),
                rng.gen_range(0..1 << 21),
                rng.gen_range(0..1 << 21),
                0,
            );
            let code = Code::from(key);

            for depth in 1..21u8 {
                let parent = code.to_depth(depth);
                let child = parent.child(code.child_index(depth - 1));
                assert_eq!(child.to_depth(depth - 1), code.to_depth(depth - 1));
            }
        }
    }

    #[test]
    fn siblings_are_contiguous_in_morton_space() {
        let parent = Code::from(Key::new(8, 8, 8, 0)).to_depth(1);
        let codes: Vec<u64> = (0..8).map(|i| parent.child(i).raw()).collect();

        for pair in codes.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
