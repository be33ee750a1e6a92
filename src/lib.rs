//! 3D probabilistic occupancy mapping with explicit unknown-space
//! semantics.
//!
//! An [`OccupancyMap`] discretises a cubic region of space into an octree
//! of voxels and maintains, for every voxel, a log-odds estimate of its
//! occupancy. Any voxel, at any depth, classifies as *occupied*, *free* or
//! *unknown* by comparing its log-odds to two thresholds. Uniform regions
//! are kept collapsed into single nodes, so free and unexplored space cost
//! almost nothing.
//!
//! The main entry points:
//!   - [`OccupancyMap::insert_point_cloud`] and
//!     [`OccupancyMap::insert_ray`]: integrate sensor data, updating every
//!     traversed voxel in one batch
//!   - [`OccupancyMap::is_occupied_at`] and friends: classify space
//!   - [`OccupancyMap::cast_ray`]: walk a ray until it hits occupied space
//!   - [`OccupancyMap::iter_leaves`]: visit known space, optionally
//!     clipped to a bounding volume
//!   - [`OccupancyMap::write`] / [`OccupancyMap::read`]: persist the map,
//!     optionally LZ4-compressed
//!
//! ```
//! use nalgebra::Point3;
//! use ufomap::prelude::*;
//!
//! let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
//!
//! // A sensor at the origin saw a surface 35 cm down the x axis.
//! map.insert_ray(
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(0.35, 0.0, 0.0),
//!     None,
//!     0,
//! );
//!
//! assert!(map.is_free_at(&Point3::new(0.15, 0.0, 0.0), 0));
//! assert!(map.is_occupied_at(&Point3::new(0.35, 0.0, 0.0), 0));
//! assert!(map.is_unknown_at(&Point3::new(0.0, 1.0, 0.0), 0));
//! ```
//!
//! [`OccupancyMap`]: tree::OccupancyMap
//! [`OccupancyMap::insert_point_cloud`]: tree::OccupancyMap::insert_point_cloud
//! [`OccupancyMap::insert_ray`]: tree::OccupancyMap::insert_ray
//! [`OccupancyMap::is_occupied_at`]: tree::OccupancyMap::is_occupied_at
//! [`OccupancyMap::cast_ray`]: tree::OccupancyMap::cast_ray
//! [`OccupancyMap::iter_leaves`]: tree::OccupancyMap::iter_leaves
//! [`OccupancyMap::write`]: tree::OccupancyMap::write
//! [`OccupancyMap::read`]: tree::OccupancyMap::read

pub mod code;
pub mod error;
pub mod geometry;
pub mod io;
pub mod iter;
pub mod key;
pub mod node;
pub mod point_cloud;
pub mod sensor_model;
pub mod tree;

mod layout;
mod ray;

pub use nalgebra;

pub mod prelude {
    pub use crate::code::{Code, CodeMap, CodeSet};
    pub use crate::error::MapError;
    pub use crate::geometry::{Aabb, BoundingVolume};
    pub use crate::io::{LeafCodec, StandardCodec, WriteOptions, FILE_HEADER, FILE_VERSION};
    pub use crate::iter::NodeFilter;
    pub use crate::key::{Key, KeyMap, KeyRay, KeySet};
    pub use crate::node::{InnerNode, OccupancyNode};
    pub use crate::point_cloud::PointCloud;
    pub use crate::sensor_model::{logit, probability};
    pub use crate::tree::{MapOptions, NodeView, OccupancyMap};
}
