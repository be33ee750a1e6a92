//! The occupancy octree engine.
//!
//! An [`OccupancyMap`] maintains a log-odds occupancy estimate for every
//! voxel of a cubic region centred on the origin. Large uniform regions are
//! kept collapsed into single nodes; sensor updates expand the tree lazily
//! along the touched paths and re-collapse it on the way back up. Queries
//! classify any node, at any depth, as occupied, free or unknown.

use crate::code::{Code, CodeMap, CodeSet};
use crate::error::MapError;
use crate::geometry::move_line_into_bbx;
use crate::io::{LeafCodec, StandardCodec};
use crate::key::{Key, KeyMap, KeyRay, KeySet};
use crate::layout::TreeLayout;
use crate::node::{Children, InnerNode, NodeCounts, OccupancyNode};
use crate::point_cloud::PointCloud;
use crate::ray::RayTraversal;
use crate::sensor_model::{logit, probability, SensorModel};

use fnv::FnvHashMap;
use nalgebra::{Isometry3, Point3, Vector3};

use std::collections::hash_map::Entry;
use std::mem;

/// The staging map is reused across point-cloud insertions; reserve it once
/// at a size that fits a dense scan without rehashing.
const STAGING_CAPACITY: usize = 100_003;

/// Construction parameters. Probabilities are given in the probability
/// domain and converted to log-odds internally.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MapOptions {
    /// Edge length of a depth-0 voxel, in metres.
    pub resolution: f64,
    /// Number of levels below the root; the root spans
    /// `resolution * 2^depth_levels` metres. Must be in `[2, 21]`.
    pub depth_levels: u8,
    /// Collapse uniform subtrees eagerly after every update.
    pub automatic_pruning: bool,
    /// A voxel with probability above this is occupied.
    pub occupancy_thres: f32,
    /// A voxel with probability below this is free.
    pub free_thres: f32,
    /// Probability update applied to the endpoint voxel of a ray.
    pub prob_hit: f32,
    /// Probability update applied to every voxel a ray passes through.
    pub prob_miss: f32,
    /// Lower clamping limit for stored probabilities.
    pub clamp_min: f32,
    /// Upper clamping limit for stored probabilities.
    pub clamp_max: f32,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            depth_levels: 16,
            automatic_pruning: true,
            occupancy_thres: 0.5,
            free_thres: 0.5,
            prob_hit: 0.7,
            prob_miss: 0.4,
            clamp_min: 0.1192,
            clamp_max: 0.971,
        }
    }
}

impl MapOptions {
    fn validate(&self) -> Result<SensorModel, MapError> {
        validate_geometry(self.resolution, self.depth_levels)?;

        for (name, value) in [
            ("occupancy_thres", self.occupancy_thres),
            ("free_thres", self.free_thres),
            ("prob_hit", self.prob_hit),
            ("prob_miss", self.prob_miss),
            ("clamp_min", self.clamp_min),
            ("clamp_max", self.clamp_max),
        ] {
            if !value.is_finite() || value <= 0.0 || value >= 1.0 {
                return Err(MapError::Config(format!(
                    "{} must be a probability in (0, 1), got {}",
                    name, value
                )));
            }
        }

        Ok(SensorModel {
            occupancy_thres_log: logit(self.occupancy_thres),
            free_thres_log: logit(self.free_thres),
            prob_hit_log: logit(self.prob_hit),
            prob_miss_log: logit(self.prob_miss),
            clamp_min_log: logit(self.clamp_min),
            clamp_max_log: logit(self.clamp_max),
        })
    }
}

pub(crate) fn validate_geometry(resolution: f64, depth_levels: u8) -> Result<(), MapError> {
    if !(2..=21).contains(&depth_levels) {
        return Err(MapError::Config(format!(
            "depth_levels must be in [2, 21], got {}",
            depth_levels
        )));
    }
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(MapError::Config(format!(
            "resolution must be positive, got {}",
            resolution
        )));
    }
    Ok(())
}

/// The node a query resolved to: either a depth-0 leaf or the deepest
/// materialised inner node on the path (which may be shallower than the
/// queried depth when the subtree is collapsed).
#[derive(Clone, Copy, Debug)]
pub enum NodeView<'a> {
    Leaf { node: &'a OccupancyNode, code: Code },
    Inner { node: &'a InnerNode, code: Code },
}

impl NodeView<'_> {
    #[inline]
    pub fn logit(&self) -> f32 {
        match self {
            NodeView::Leaf { node, .. } => node.logit(),
            NodeView::Inner { node, .. } => node.logit(),
        }
    }

    #[inline]
    pub fn probability(&self) -> f32 {
        probability(self.logit())
    }

    #[inline]
    pub fn code(&self) -> Code {
        match self {
            NodeView::Leaf { code, .. } | NodeView::Inner { code, .. } => *code,
        }
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.code().depth()
    }

    /// Whether the node behaves as a terminal: a true leaf or a collapsed
    /// inner node.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        match self {
            NodeView::Leaf { .. } => true,
            NodeView::Inner { node, .. } => !node.has_children(),
        }
    }
}

/// A probabilistic occupancy octree. See the crate documentation for an
/// overview; `C` selects the on-disk leaf encoding.
pub struct OccupancyMap<C: LeafCodec = StandardCodec> {
    pub(crate) codec: C,
    pub(crate) layout: TreeLayout,
    pub(crate) model: SensorModel,
    pub(crate) root: InnerNode,
    pub(crate) counts: NodeCounts,
    pub(crate) automatic_pruning: bool,

    bbx_limit_enabled: bool,
    bbx_min: Point3<f64>,
    bbx_max: Point3<f64>,

    change_detection_enabled: bool,
    changed_codes: CodeSet,

    // Per-scan `Code -> log-odds` staging area; hits overwrite misses,
    // misses never overwrite hits. Cleared but never dropped between scans.
    staging: CodeMap<f32>,
}

impl OccupancyMap<StandardCodec> {
    /// Creates an empty map. Fails with [`MapError::Config`] when the
    /// geometry or any probability parameter is out of range.
    pub fn new(options: MapOptions) -> Result<Self, MapError> {
        Self::with_codec(StandardCodec, options)
    }
}

impl<C: LeafCodec> OccupancyMap<C> {
    /// Creates an empty map that persists its leaves through `codec`.
    pub fn with_codec(codec: C, options: MapOptions) -> Result<Self, MapError> {
        let model = options.validate()?;
        let layout = TreeLayout::new(options.resolution, options.depth_levels);

        let mut root = InnerNode::default();
        root.refresh_leaf_flags(&model);

        Ok(Self {
            codec,
            layout,
            model,
            root,
            counts: NodeCounts::new(),
            automatic_pruning: options.automatic_pruning,
            bbx_limit_enabled: false,
            bbx_min: Point3::origin(),
            bbx_max: Point3::origin(),
            change_detection_enabled: false,
            changed_codes: CodeSet::default(),
            staging: FnvHashMap::with_capacity_and_hasher(STAGING_CAPACITY, Default::default()),
        })
    }

    //
    // Tree meta
    //

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.layout.resolution()
    }

    #[inline]
    pub fn depth_levels(&self) -> u8 {
        self.layout.depth_levels()
    }

    #[inline]
    pub fn node_size(&self, depth: u8) -> f64 {
        self.layout.node_size(depth)
    }

    #[inline]
    pub fn node_half_size(&self, depth: u8) -> f64 {
        self.layout.node_half_size(depth)
    }

    /// The lowest coordinate the map can address.
    #[inline]
    pub fn min_coord(&self) -> Point3<f64> {
        self.layout.min_coord()
    }

    /// The highest coordinate the map can address.
    #[inline]
    pub fn max_coord(&self) -> Point3<f64> {
        self.layout.max_coord()
    }

    /// Total number of nodes.
    #[inline]
    pub fn size(&self) -> usize {
        self.counts.inner + self.counts.inner_leaf + self.counts.leaf
    }

    #[inline]
    pub fn num_inner_nodes(&self) -> usize {
        self.counts.inner
    }

    #[inline]
    pub fn num_inner_leaf_nodes(&self) -> usize {
        self.counts.inner_leaf
    }

    #[inline]
    pub fn num_leaf_nodes(&self) -> usize {
        self.counts.leaf
    }

    /// Heap footprint of the node store, in bytes.
    pub fn memory_usage(&self) -> usize {
        (self.counts.inner + self.counts.inner_leaf) * mem::size_of::<InnerNode>()
            + self.counts.leaf * mem::size_of::<OccupancyNode>()
    }

    #[inline]
    pub fn set_automatic_pruning(&mut self, enable: bool) {
        self.automatic_pruning = enable;
    }

    #[inline]
    pub fn is_automatic_pruning_enabled(&self) -> bool {
        self.automatic_pruning
    }

    /// Collapses every uniform subtree, regardless of the automatic
    /// pruning setting.
    pub fn prune(&mut self) {
        let Self {
            root,
            counts,
            model,
            layout,
            ..
        } = self;
        prune_recurs(root, layout.depth_levels(), model, counts);
    }

    /// Empties the map, keeping its parameters.
    pub fn clear(&mut self) {
        self.reset(self.layout.resolution(), self.layout.depth_levels());
    }

    /// Empties the map and re-parameterises its geometry.
    pub fn clear_with(&mut self, resolution: f64, depth_levels: u8) -> Result<(), MapError> {
        validate_geometry(resolution, depth_levels)?;
        self.reset(resolution, depth_levels);
        Ok(())
    }

    fn reset(&mut self, resolution: f64, depth_levels: u8) {
        self.root = InnerNode::default();
        self.root.refresh_leaf_flags(&self.model);
        self.counts = NodeCounts::new();

        if resolution != self.layout.resolution() || depth_levels != self.layout.depth_levels() {
            self.layout = TreeLayout::new(resolution, depth_levels);
        }
    }

    //
    // Addressing
    //

    #[inline]
    pub fn coord_to_key(&self, coord: &Point3<f64>, depth: u8) -> Key {
        self.layout.coord_to_key(coord, depth)
    }

    /// Rejects coordinates outside the map extent, or outside the bounding
    /// box when the limit is enabled.
    #[inline]
    pub fn coord_to_key_checked(&self, coord: &Point3<f64>, depth: u8) -> Option<Key> {
        self.in_bbx(coord).then(|| self.coord_to_key(coord, depth))
    }

    /// The centre of the node addressed by `key`, at the key's own depth.
    #[inline]
    pub fn key_to_coord(&self, key: &Key) -> Point3<f64> {
        self.layout.key_to_coord(key)
    }

    /// The centre of `key` re-addressed at `depth`, which must not be
    /// deeper than the key itself.
    #[inline]
    pub fn key_to_coord_checked(&self, key: &Key, depth: u8) -> Option<Point3<f64>> {
        (key.depth() <= depth).then(|| self.layout.key_to_coord_at(key, depth))
    }

    //
    // Node access
    //

    /// The deepest stored node on the path towards `code`. Stops early at a
    /// collapsed subtree, in which case the returned view sits above the
    /// requested depth.
    pub fn get_node(&self, code: impl Into<Code>) -> NodeView<'_> {
        let code = code.into();
        let mut current = &self.root;
        let mut depth = self.layout.depth_levels();

        while depth > code.depth() {
            match &current.children {
                Children::None => {
                    return NodeView::Inner {
                        node: current,
                        code: code.to_depth(depth),
                    };
                }
                Children::Leaves(leaves) => {
                    return NodeView::Leaf {
                        node: &leaves[code.child_index(0)],
                        code,
                    };
                }
                Children::Inner(children) => {
                    depth -= 1;
                    current = &children[code.child_index(depth)];
                }
            }
        }

        NodeView::Inner {
            node: current,
            code,
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeView<'_> {
        NodeView::Inner {
            node: &self.root,
            code: Code::new(0, self.layout.depth_levels()),
        }
    }

    /// Resolves child `child_index` of `node`. Fails with
    /// [`MapError::Argument`] for an index above 7 or a depth-0 node.
    pub fn get_child(&self, node: &NodeView<'_>, child_index: usize) -> Result<NodeView<'_>, MapError> {
        if child_index > 7 {
            return Err(MapError::Argument(format!(
                "child index must be in 0..8, got {}",
                child_index
            )));
        }
        if node.depth() == 0 {
            return Err(MapError::Argument(
                "a depth-0 voxel has no children".to_string(),
            ));
        }
        Ok(self.get_node(node.code().child(child_index)))
    }

    //
    // Classification
    //

    #[inline]
    pub fn is_occupied(&self, code: impl Into<Code>) -> bool {
        self.model.is_occupied_logit(self.get_node(code).logit())
    }

    #[inline]
    pub fn is_free(&self, code: impl Into<Code>) -> bool {
        self.model.is_free_logit(self.get_node(code).logit())
    }

    #[inline]
    pub fn is_unknown(&self, code: impl Into<Code>) -> bool {
        self.model.is_unknown_logit(self.get_node(code).logit())
    }

    #[inline]
    pub fn is_occupied_at(&self, coord: &Point3<f64>, depth: u8) -> bool {
        self.is_occupied(self.coord_to_key(coord, depth))
    }

    #[inline]
    pub fn is_free_at(&self, coord: &Point3<f64>, depth: u8) -> bool {
        self.is_free(self.coord_to_key(coord, depth))
    }

    #[inline]
    pub fn is_unknown_at(&self, coord: &Point3<f64>, depth: u8) -> bool {
        self.is_unknown(self.coord_to_key(coord, depth))
    }

    /// Whether any voxel under the node is occupied. Because inner nodes
    /// carry the maximum log-odds of their descendants, this is the same
    /// test as [`is_occupied`](Self::is_occupied).
    #[inline]
    pub fn contains_occupied(&self, code: impl Into<Code>) -> bool {
        self.is_occupied(code)
    }

    /// Whether any voxel under the node is free, read from the cached
    /// summary bit without descending.
    pub fn contains_free(&self, code: impl Into<Code>) -> bool {
        match self.get_node(code) {
            NodeView::Leaf { node, .. } => self.model.is_free_logit(node.logit()),
            NodeView::Inner { node, .. } => node.contains_free(),
        }
    }

    /// Whether any voxel under the node is unknown, read from the cached
    /// summary bit without descending.
    pub fn contains_unknown(&self, code: impl Into<Code>) -> bool {
        match self.get_node(code) {
            NodeView::Leaf { node, .. } => self.model.is_unknown_logit(node.logit()),
            NodeView::Inner { node, .. } => node.contains_unknown(),
        }
    }

    //
    // Node value updates
    //

    /// Adds `update` to the node's log-odds, clamped to the clamping
    /// limits. Applied at a non-zero depth, the update is propagated into
    /// the whole subtree. No-op once the relevant clamp is reached.
    pub fn update_node_value(&mut self, code: impl Into<Code>, update: f32) {
        let code = code.into();
        if code.depth() > self.layout.depth_levels() {
            return;
        }

        let current = self.get_node(code).logit();
        if (update >= 0.0 && current >= self.model.clamp_max_log)
            || (update <= 0.0 && current <= self.model.clamp_min_log)
        {
            return;
        }

        self.apply_update(code, update, false);
    }

    /// Replaces the node's log-odds with `value`, clamped to the clamping
    /// limits.
    pub fn set_node_value(&mut self, code: impl Into<Code>, value: f32) {
        let code = code.into();
        if code.depth() > self.layout.depth_levels() {
            return;
        }

        let value = self.model.clamp(value);
        if self.get_node(code).logit() == value {
            return;
        }

        self.apply_update(code, value, true);
    }

    #[inline]
    pub fn update_node_value_at(&mut self, coord: &Point3<f64>, depth: u8, update: f32) {
        self.update_node_value(self.coord_to_key(coord, depth), update);
    }

    #[inline]
    pub fn set_node_value_at(&mut self, coord: &Point3<f64>, depth: u8, value: f32) {
        self.set_node_value(self.coord_to_key(coord, depth), value);
    }

    /// Applies the hit update to a single node.
    #[inline]
    pub fn integrate_hit(&mut self, code: impl Into<Code>) {
        let update = self.model.prob_hit_log;
        self.update_node_value(code, update);
    }

    /// Applies the miss update to a single node.
    #[inline]
    pub fn integrate_miss(&mut self, code: impl Into<Code>) {
        let update = self.model.prob_miss_log;
        self.update_node_value(code, update);
    }

    #[inline]
    pub fn integrate_hit_at(&mut self, coord: &Point3<f64>, depth: u8) {
        self.integrate_hit(self.coord_to_key(coord, depth));
    }

    #[inline]
    pub fn integrate_miss_at(&mut self, coord: &Point3<f64>, depth: u8) {
        self.integrate_miss(self.coord_to_key(coord, depth));
    }

    fn apply_update(&mut self, code: Code, value: f32, set_value: bool) {
        let Self {
            root,
            counts,
            changed_codes,
            model,
            automatic_pruning,
            change_detection_enabled,
            layout,
            ..
        } = self;

        let mut scratch = UpdateScratch {
            model,
            auto_prune: *automatic_pruning,
            counts,
            changes: change_detection_enabled.then_some(changed_codes),
        };
        update_recurs(
            &mut scratch,
            root,
            layout.depth_levels(),
            code,
            value,
            set_value,
        );
    }

    //
    // Sensor integration
    //

    /// Integrates one sensor ray: misses along the traversed voxels, a hit
    /// at the endpoint. The segment is clamped to `max_range` and clipped
    /// to the bounding box first; the hit lands on the clipped endpoint.
    pub fn insert_ray(
        &mut self,
        origin: Point3<f64>,
        end: Point3<f64>,
        max_range: Option<f64>,
        depth: u8,
    ) {
        let mut origin = origin;
        let mut end = end;
        if self.clip_ray(&mut origin, &mut end, max_range).is_none() {
            return;
        }

        self.insert_miss_on_ray(origin, end, max_range, depth);
        let hit_key = self.coord_to_key(&end, 0);
        self.integrate_hit(hit_key);
    }

    /// Integrates only the free space along a ray.
    pub fn insert_miss_on_ray(
        &mut self,
        origin: Point3<f64>,
        end: Point3<f64>,
        max_range: Option<f64>,
        depth: u8,
    ) {
        for key in self.compute_ray(origin, end, max_range, depth) {
            self.integrate_miss(key);
        }
    }

    /// Integrates a full scan in one batch: every endpoint voxel receives
    /// one hit, every traversed voxel one miss, with hits winning over
    /// misses within the scan.
    pub fn insert_point_cloud(
        &mut self,
        sensor_origin: Point3<f64>,
        cloud: &PointCloud,
        max_range: Option<f64>,
    ) {
        self.compute_update(sensor_origin, cloud, max_range);
        self.apply_staged_updates();
    }

    /// [`insert_point_cloud`](Self::insert_point_cloud) with `frame`
    /// applied to the cloud first.
    pub fn insert_point_cloud_transformed(
        &mut self,
        sensor_origin: Point3<f64>,
        cloud: &PointCloud,
        frame: &Isometry3<f64>,
        max_range: Option<f64>,
    ) {
        let cloud = cloud.transformed(frame);
        self.insert_point_cloud(sensor_origin, &cloud, max_range);
    }

    /// Discretised scan integration: endpoints are deduplicated to one
    /// voxel-centred hit each, and the free-space rays are walked at the
    /// coarse `depth`, refining towards depth 0 near the endpoints. `n`
    /// controls how many coarse steps remain before refining. Trades
    /// fidelity near the endpoint for throughput.
    pub fn insert_point_cloud_discrete(
        &mut self,
        sensor_origin: Point3<f64>,
        cloud: &PointCloud,
        max_range: Option<f64>,
        n: u32,
        depth: u8,
    ) {
        let mut discrete_map: KeyMap<Vec<Key>> = KeyMap::default();
        let mut discrete: Vec<Key> = Vec::new();
        let mut seen = KeySet::default();
        let mut immediate_hits: Vec<Key> = Vec::new();

        {
            let (bbx_min, bbx_max) = self.active_bbx();
            let Self {
                staging,
                layout,
                model,
                ..
            } = self;
            let hit = model.prob_hit_log;

            for point in cloud {
                let point_key = layout.coord_to_key(point, 0);
                if !seen.insert(point_key) {
                    continue;
                }
                let voxel_center = layout.key_to_coord(&point_key);

                let mut origin = sensor_origin;
                let delta = voxel_center - origin;
                let distance = delta.norm();
                let direction = if distance > 0.0 {
                    delta / distance
                } else {
                    Vector3::zeros()
                };
                let mut end = voxel_center;
                if let Some(range) = max_range {
                    if range >= 0.0 && distance > range {
                        end = origin + direction * range;
                    }
                }

                if !move_line_into_bbx(&bbx_min, &bbx_max, &mut origin, &mut end) {
                    continue;
                }

                let end_key = layout.coord_to_key(&end, 0);
                if voxel_center == end {
                    if n == 0 && depth != 0 {
                        immediate_hits.push(end_key);
                    } else {
                        match staging.entry(Code::from(end_key)) {
                            Entry::Occupied(_) => continue,
                            Entry::Vacant(entry) => {
                                entry.insert(hit);
                            }
                        }
                    }
                }

                discrete.push(end_key);
            }
        }

        for key in immediate_hits {
            self.integrate_hit(key);
        }

        if depth != 0 {
            let mut previous: Vec<Key> = Vec::new();
            let start = if n == 0 { depth } else { 1 };
            for d in start..=depth {
                mem::swap(&mut previous, &mut discrete);
                discrete.clear();
                for key in &previous {
                    let key_at_depth = Code::from(*key).to_depth(d).to_key();
                    let children = discrete_map.entry(key_at_depth).or_default();
                    if children.is_empty() {
                        discrete.push(key_at_depth);
                    }
                    children.push(*key);
                }
            }
        }

        {
            let Self {
                staging,
                layout,
                model,
                ..
            } = self;
            compute_update_discrete(
                staging,
                layout,
                model,
                sensor_origin,
                &discrete,
                &discrete_map,
                n,
            );
        }

        self.apply_staged_updates();
    }

    /// [`insert_point_cloud_discrete`](Self::insert_point_cloud_discrete)
    /// with `frame` applied to the cloud first.
    pub fn insert_point_cloud_discrete_transformed(
        &mut self,
        sensor_origin: Point3<f64>,
        cloud: &PointCloud,
        frame: &Isometry3<f64>,
        max_range: Option<f64>,
        n: u32,
        depth: u8,
    ) {
        let cloud = cloud.transformed(frame);
        self.insert_point_cloud_discrete(sensor_origin, &cloud, max_range, n, depth);
    }

    /// Sets every voxel of an axis-aligned region to the minimum clamping
    /// value, carving it free.
    pub fn clear_area_bbx(&mut self, bbx_min: &Point3<f64>, bbx_max: &Point3<f64>, depth: u8) {
        let min_key = self.coord_to_key(bbx_min, depth);
        let max_key = self.coord_to_key(bbx_max, depth);
        let value = self.model.clamp_min_log;
        let inc = 1u32 << depth;

        let mut x = min_key.x();
        while x <= max_key.x() {
            let mut y = min_key.y();
            while y <= max_key.y() {
                let mut z = min_key.z();
                while z <= max_key.z() {
                    self.set_node_value(Key::new(x, y, z, depth), value);
                    z += inc;
                }
                y += inc;
            }
            x += inc;
        }
    }

    /// Deduplicates a cloud to one voxel-centred point per depth-`depth`
    /// key.
    pub fn get_discrete_cloud(&self, cloud: &PointCloud, depth: u8) -> PointCloud {
        let mut discrete = PointCloud::with_capacity(cloud.len());
        let mut seen = KeySet::default();
        for point in cloud {
            let key = self.coord_to_key(point, depth);
            if seen.insert(key) {
                discrete.push(self.key_to_coord(&key));
            }
        }
        discrete
    }

    fn compute_update(
        &mut self,
        sensor_origin: Point3<f64>,
        cloud: &PointCloud,
        max_range: Option<f64>,
    ) {
        let (bbx_min, bbx_max) = self.active_bbx();
        let Self {
            staging,
            layout,
            model,
            ..
        } = self;
        let hit = model.prob_hit_log;
        let miss = model.prob_miss_log;

        for point in cloud {
            let mut origin = sensor_origin;
            let delta = *point - origin;
            let distance = delta.norm();
            let direction = if distance > 0.0 {
                delta / distance
            } else {
                Vector3::zeros()
            };
            let mut end = *point;
            if let Some(range) = max_range {
                if range >= 0.0 && distance > range {
                    end = origin + direction * range;
                }
            }

            if !move_line_into_bbx(&bbx_min, &bbx_max, &mut origin, &mut end) {
                continue;
            }

            if *point == end {
                staging.insert(Code::from(layout.coord_to_key(&end, 0)), hit);
            }

            let mut traversal = RayTraversal::new(layout, &origin, &end, &direction, 0);
            while !traversal.at_end() && traversal.min_t() <= distance {
                staging
                    .entry(Code::from(traversal.current()))
                    .or_insert(miss);
                traversal.step();
            }
        }
    }

    fn apply_staged_updates(&mut self) {
        let mut staging = mem::take(&mut self.staging);
        log::trace!("applying {} staged voxel updates", staging.len());
        for (&code, &value) in &staging {
            self.update_node_value(code, value);
        }
        staging.clear();
        self.staging = staging;
    }

    //
    // Ray tracing
    //

    /// Walks a ray until an occupied voxel is entered, returning its
    /// centre. Returns `None` when the ray leaves the map or its range, or
    /// enters unknown space with `ignore_unknown == false`.
    pub fn cast_ray(
        &self,
        origin: Point3<f64>,
        direction: Vector3<f64>,
        ignore_unknown: bool,
        max_range: Option<f64>,
        depth: u8,
    ) -> Option<Point3<f64>> {
        let max_range = max_range
            .filter(|range| *range >= 0.0)
            .unwrap_or_else(|| (self.max_coord() - self.min_coord()).norm());

        let direction = direction.normalize();
        let mut origin = origin;
        let mut end = origin + direction * max_range;
        if !self.move_line_into_bbx(&mut origin, &mut end) {
            return None;
        }

        let mut traversal = RayTraversal::new(&self.layout, &origin, &end, &direction, depth);
        while !traversal.at_end()
            && traversal.min_t() <= max_range
            && !self.is_occupied(traversal.current())
            && (ignore_unknown || !self.is_unknown(traversal.current()))
        {
            traversal.step();
        }

        let key = traversal.current();
        self.is_occupied(key).then(|| self.key_to_coord(&key))
    }

    /// Every key of depth `depth` traversed by the segment, after range
    /// clamping and bounding-box clipping. The endpoint's own node is not
    /// included.
    pub fn compute_ray(
        &self,
        origin: Point3<f64>,
        end: Point3<f64>,
        max_range: Option<f64>,
        depth: u8,
    ) -> KeyRay {
        let mut ray = KeyRay::new();

        let mut origin = origin;
        let mut end = end;
        let Some(direction) = self.clip_ray(&mut origin, &mut end, max_range) else {
            return ray;
        };

        let bound = max_range
            .filter(|range| *range >= 0.0)
            .unwrap_or(f64::INFINITY);
        let mut traversal = RayTraversal::new(&self.layout, &origin, &end, &direction, depth);
        while !traversal.at_end() && traversal.min_t() <= bound {
            ray.push(traversal.current());
            traversal.step();
        }

        ray
    }

    /// Clamps the segment to `max_range` and clips it to the active
    /// bounding box. Returns the normalised direction, or `None` when the
    /// segment lies entirely outside the box.
    fn clip_ray(
        &self,
        origin: &mut Point3<f64>,
        end: &mut Point3<f64>,
        max_range: Option<f64>,
    ) -> Option<Vector3<f64>> {
        let delta = *end - *origin;
        let distance = delta.norm();
        let direction = if distance > 0.0 {
            delta / distance
        } else {
            Vector3::zeros()
        };

        if let Some(range) = max_range {
            if range >= 0.0 && distance > range {
                *end = *origin + direction * range;
            }
        }

        self.move_line_into_bbx(origin, end).then_some(direction)
    }

    //
    // Bounding box limit
    //

    #[inline]
    pub fn set_bbx_min(&mut self, min: Point3<f64>) {
        self.bbx_min = min;
    }

    #[inline]
    pub fn set_bbx_max(&mut self, max: Point3<f64>) {
        self.bbx_max = max;
    }

    #[inline]
    pub fn bbx_min(&self) -> Point3<f64> {
        self.bbx_min
    }

    #[inline]
    pub fn bbx_max(&self) -> Point3<f64> {
        self.bbx_max
    }

    #[inline]
    pub fn bbx_center(&self) -> Point3<f64> {
        self.bbx_min + (self.bbx_max - self.bbx_min) / 2.0
    }

    #[inline]
    pub fn enable_bbx_limit(&mut self, enable: bool) {
        self.bbx_limit_enabled = enable;
    }

    #[inline]
    pub fn is_bbx_limit_enabled(&self) -> bool {
        self.bbx_limit_enabled
    }

    /// Whether a coordinate lies inside the active bounding box, which
    /// defaults to the full map extent when the limit is disabled.
    pub fn in_bbx(&self, coord: &Point3<f64>) -> bool {
        let (min, max) = self.active_bbx();
        (0..3).all(|i| min[i] <= coord[i] && coord[i] <= max[i])
    }

    /// Key-space version of [`in_bbx`](Self::in_bbx).
    pub fn key_in_bbx(&self, key: &Key) -> bool {
        let (min, max) = self.active_bbx();
        let min_key = self.coord_to_key(&min, 0);
        let max_key = self.coord_to_key(&max, 0);
        (0..3).all(|i| min_key[i] <= key[i] && key[i] <= max_key[i])
    }

    /// Moves the segment endpoints onto the active bounding box. Returns
    /// `false` iff the segment lies entirely outside it.
    pub fn move_line_into_bbx(&self, origin: &mut Point3<f64>, end: &mut Point3<f64>) -> bool {
        let (min, max) = self.active_bbx();
        move_line_into_bbx(&min, &max, origin, end)
    }

    fn active_bbx(&self) -> (Point3<f64>, Point3<f64>) {
        if self.bbx_limit_enabled {
            (self.bbx_min, self.bbx_max)
        } else {
            (self.min_coord(), self.max_coord())
        }
    }

    //
    // Metrics over known space
    //

    /// Lower corner of the bounding box of all known (occupied or free)
    /// space, scanned at `depth`.
    pub fn metric_min(&self, depth: u8) -> Point3<f64> {
        let mut min = self.max_coord();
        for node in self.iter_leaves(crate::iter::NodeFilter::default().min_depth(depth)) {
            for i in 0..3 {
                min[i] = min[i].min(node.center()[i] - node.half_size());
            }
        }
        min
    }

    /// Upper corner of the bounding box of all known space, scanned at
    /// `depth`.
    pub fn metric_max(&self, depth: u8) -> Point3<f64> {
        let mut max = self.min_coord();
        for node in self.iter_leaves(crate::iter::NodeFilter::default().min_depth(depth)) {
            for i in 0..3 {
                max[i] = max[i].max(node.center()[i] + node.half_size());
            }
        }
        max
    }

    /// Extent of all known space per axis.
    pub fn metric_size(&self, depth: u8) -> Vector3<f64> {
        self.metric_max(depth) - self.metric_min(depth)
    }

    /// Volume of the known-space bounding box, in cubic metres.
    pub fn volume(&self) -> f64 {
        let size = self.metric_size(0);
        size.x * size.y * size.z
    }

    //
    // Change detection
    //

    #[inline]
    pub fn enable_change_detection(&mut self, enable: bool) {
        self.change_detection_enabled = enable;
    }

    #[inline]
    pub fn is_change_detection_enabled(&self) -> bool {
        self.change_detection_enabled
    }

    #[inline]
    pub fn reset_change_detection(&mut self) {
        self.changed_codes.clear();
    }

    #[inline]
    pub fn num_changes_detected(&self) -> usize {
        self.changed_codes.len()
    }

    /// The codes of every node whose stored fields were mutated since the
    /// last reset.
    #[inline]
    pub fn changed_codes(&self) -> &CodeSet {
        &self.changed_codes
    }

    //
    // Sensor model
    //

    #[inline]
    pub fn occupancy_thres(&self) -> f32 {
        probability(self.model.occupancy_thres_log)
    }

    #[inline]
    pub fn occupancy_thres_log(&self) -> f32 {
        self.model.occupancy_thres_log
    }

    #[inline]
    pub fn free_thres(&self) -> f32 {
        probability(self.model.free_thres_log)
    }

    #[inline]
    pub fn free_thres_log(&self) -> f32 {
        self.model.free_thres_log
    }

    #[inline]
    pub fn prob_hit(&self) -> f32 {
        probability(self.model.prob_hit_log)
    }

    #[inline]
    pub fn prob_hit_log(&self) -> f32 {
        self.model.prob_hit_log
    }

    #[inline]
    pub fn prob_miss(&self) -> f32 {
        probability(self.model.prob_miss_log)
    }

    #[inline]
    pub fn prob_miss_log(&self) -> f32 {
        self.model.prob_miss_log
    }

    #[inline]
    pub fn clamping_thres_min(&self) -> f32 {
        probability(self.model.clamp_min_log)
    }

    #[inline]
    pub fn clamping_thres_min_log(&self) -> f32 {
        self.model.clamp_min_log
    }

    #[inline]
    pub fn clamping_thres_max(&self) -> f32 {
        probability(self.model.clamp_max_log)
    }

    #[inline]
    pub fn clamping_thres_max_log(&self) -> f32 {
        self.model.clamp_max_log
    }

    /// Changes the occupancy threshold and recomputes the summary bits of
    /// every inner node, which is linear in the stored tree.
    pub fn set_occupancy_thres(&mut self, probability: f32) {
        self.set_occupancy_thres_log(logit(probability));
    }

    pub fn set_occupancy_thres_log(&mut self, value: f32) {
        self.model.occupancy_thres_log = value;
        self.refresh_summaries();
    }

    /// Changes the free threshold and recomputes the summary bits of every
    /// inner node.
    pub fn set_free_thres(&mut self, probability: f32) {
        self.set_free_thres_log(logit(probability));
    }

    pub fn set_free_thres_log(&mut self, value: f32) {
        self.model.free_thres_log = value;
        self.refresh_summaries();
    }

    pub fn set_prob_hit(&mut self, probability: f32) {
        self.model.prob_hit_log = logit(probability);
    }

    pub fn set_prob_hit_log(&mut self, value: f32) {
        self.model.prob_hit_log = value;
    }

    pub fn set_prob_miss(&mut self, probability: f32) {
        self.model.prob_miss_log = logit(probability);
    }

    pub fn set_prob_miss_log(&mut self, value: f32) {
        self.model.prob_miss_log = value;
    }

    pub fn set_clamping_thres_min(&mut self, probability: f32) {
        self.model.clamp_min_log = logit(probability);
    }

    pub fn set_clamping_thres_min_log(&mut self, value: f32) {
        self.model.clamp_min_log = value;
    }

    pub fn set_clamping_thres_max(&mut self, probability: f32) {
        self.model.clamp_max_log = logit(probability);
    }

    pub fn set_clamping_thres_max_log(&mut self, value: f32) {
        self.model.clamp_max_log = value;
    }

    fn refresh_summaries(&mut self) {
        let Self {
            root,
            counts,
            model,
            automatic_pruning,
            layout,
            ..
        } = self;
        refresh_recurs(root, layout.depth_levels(), *automatic_pruning, model, counts);
    }
}

/// Mutable context threaded through the update recursion; keeps the borrow
/// of the tree's bookkeeping separate from the borrow of the nodes.
struct UpdateScratch<'a> {
    model: &'a SensorModel,
    auto_prune: bool,
    counts: &'a mut NodeCounts,
    changes: Option<&'a mut CodeSet>,
}

impl UpdateScratch<'_> {
    #[inline]
    fn record(&mut self, code: Code) {
        if let Some(changes) = self.changes.as_deref_mut() {
            changes.insert(code);
        }
    }
}

#[inline]
fn apply_leaf(model: &SensorModel, leaf: &mut OccupancyNode, value: f32, set_value: bool) {
    leaf.logit = model.clamp(if set_value { value } else { leaf.logit + value });
}

/// Walks from `node` down to the code's depth, expanding collapsed nodes on
/// the way, applies the update at the target, and rolls the summaries back
/// up. Returns whether `node`'s stored fields changed.
fn update_recurs(
    scratch: &mut UpdateScratch<'_>,
    node: &mut InnerNode,
    current_depth: u8,
    code: Code,
    value: f32,
    set_value: bool,
) -> bool {
    if current_depth > code.depth() {
        node.expand(current_depth, scratch.counts);

        let child_depth = current_depth - 1;
        let child_index = code.child_index(child_depth);

        let child_changed = if child_depth == 0 {
            let leaf = &mut node.leaf_children_mut()[child_index];
            apply_leaf(scratch.model, leaf, value, set_value);
            scratch.record(code);
            true
        } else {
            update_recurs(
                scratch,
                &mut node.inner_children_mut()[child_index],
                child_depth,
                code,
                value,
                set_value,
            )
        };

        if !child_changed {
            return false;
        }

        let changed =
            node.update_from_children(current_depth, scratch.auto_prune, scratch.model, scratch.counts);
        if changed {
            scratch.record(code.to_depth(current_depth));
        }
        changed
    } else {
        apply_at_target(scratch, node, current_depth, code, value, set_value);
        true
    }
}

/// Applies the update to a node at the target depth. A non-occupied result
/// collapses the subtree (subject to the pruning policy); otherwise the
/// update flows into every child so the inner summaries stay exact.
fn apply_at_target(
    scratch: &mut UpdateScratch<'_>,
    node: &mut InnerNode,
    depth: u8,
    code: Code,
    value: f32,
    set_value: bool,
) {
    node.node.logit = scratch
        .model
        .clamp(if set_value { value } else { node.node.logit + value });

    if depth > 0 {
        if set_value || !scratch.model.is_occupied_logit(node.node.logit) {
            node.prune(depth, false, scratch.auto_prune, scratch.model, scratch.counts);
        }

        if node.has_children() {
            let child_depth = depth - 1;
            if child_depth == 0 {
                for (index, leaf) in node.leaf_children_mut().iter_mut().enumerate() {
                    apply_leaf(scratch.model, leaf, value, set_value);
                    scratch.record(code.child(index));
                }
            } else {
                for index in 0..8 {
                    apply_at_target(
                        scratch,
                        &mut node.inner_children_mut()[index],
                        child_depth,
                        code.child(index),
                        value,
                        set_value,
                    );
                }
            }
            node.update_from_children(depth, scratch.auto_prune, scratch.model, scratch.counts);
        }
    }

    if !node.has_children() {
        node.refresh_leaf_flags(scratch.model);
    }

    scratch.record(code);
}

fn refresh_recurs(
    node: &mut InnerNode,
    depth: u8,
    auto_prune: bool,
    model: &SensorModel,
    counts: &mut NodeCounts,
) {
    match &mut node.children {
        Children::None => {
            node.refresh_leaf_flags(model);
            return;
        }
        Children::Leaves(_) => {}
        Children::Inner(children) => {
            for child in children.iter_mut() {
                refresh_recurs(child, depth - 1, auto_prune, model, counts);
            }
        }
    }
    node.update_from_children(depth, auto_prune, model, counts);
}

fn prune_recurs(node: &mut InnerNode, depth: u8, model: &SensorModel, counts: &mut NodeCounts) {
    if let Children::Inner(children) = &mut node.children {
        for child in children.iter_mut() {
            prune_recurs(child, depth - 1, model, counts);
        }
    }

    if node.children_collapsible() {
        node.node.logit = node.first_child_logit();
        node.prune(depth, true, false, model, counts);
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_update_discrete(
    staging: &mut CodeMap<f32>,
    layout: &TreeLayout,
    model: &SensorModel,
    sensor_origin: Point3<f64>,
    current: &[Key],
    discrete_map: &KeyMap<Vec<Key>>,
    n: u32,
) {
    for key in current {
        let origin = sensor_origin;
        let target = layout.key_to_coord(key);
        let delta = target - sensor_origin;
        let distance = delta.norm();
        let direction = if distance > 0.0 {
            delta / distance
        } else {
            Vector3::zeros()
        };
        let end = origin + direction * distance;

        if key.depth() == 0 {
            let mut traversal = RayTraversal::new(layout, &origin, &end, &direction, 0);
            while !traversal.at_end() && traversal.min_t() <= distance {
                staging
                    .entry(Code::from(traversal.current()))
                    .or_insert(model.prob_miss_log);
                traversal.step();
            }
        } else {
            let node_size = layout.node_size(key.depth());
            let num_steps = (distance / node_size) as i64 - n as i64;
            let value = model.prob_miss_log / (2.0 * f32::from(key.depth()) + 1.0);

            let mut current_point = origin;
            let mut last = current_point;
            let mut current_key = layout.coord_to_key(&current_point, key.depth());
            let mut step: i64 = 0;
            while current_key != *key && step <= num_steps {
                last = current_point;
                staging.entry(Code::from(current_key)).or_insert(value);
                current_point += direction * node_size;
                current_key = layout.coord_to_key(&current_point, key.depth());
                step += 1;
            }

            if n == 0 {
                staging.entry(Code::from(current_key)).or_insert(value);
            } else if let Some(children) = discrete_map.get(key) {
                compute_update_discrete(staging, layout, model, last, children, discrete_map, n);
            }
        }
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
    use rand::Rng;

    fn origin() -> Point3<f64> {
        Point3::new(0.0, 0.0, 0.0)
    }

    fn x_point(x: f64) -> Point3<f64> {
        Point3::new(x, 0.0, 0.0)
    }

    /// Walks the whole tree and checks that every inner node carries the
    /// maximum of its children, that the summary bits match the classified
    /// states below, that values are clamped, and that the node counts are
    /// exact.
    fn check_invariants(map: &OccupancyMap) {
        fn recurs(
            model: &SensorModel,
            node: &InnerNode,
            counted: &mut NodeCounts,
        ) -> (f32, bool, bool) {
            let result = match &node.children {
                Children::None => {
                    counted.inner_leaf += 1;
                    let logit = node.logit();
                    (
                        logit,
                        model.is_free_logit(logit),
                        model.is_unknown_logit(logit),
                    )
                }
                Children::Leaves(leaves) => {
                    counted.inner += 1;
                    counted.leaf += 8;
                    let mut max = f32::MIN;
                    let mut free = false;
                    let mut unknown = false;
                    for leaf in leaves.iter() {
                        assert!(model.clamp(leaf.logit()) == leaf.logit(), "leaf not clamped");
                        max = max.max(leaf.logit());
                        free |= model.is_free_logit(leaf.logit());
                        unknown |= model.is_unknown_logit(leaf.logit());
                    }
                    (max, free, unknown)
                }
                Children::Inner(children) => {
                    counted.inner += 1;
                    let mut max = f32::MIN;
                    let mut free = false;
                    let mut unknown = false;
                    for child in children.iter() {
                        let (child_max, child_free, child_unknown) = recurs(model, child, counted);
                        max = max.max(child_max);
                        free |= child_free;
                        unknown |= child_unknown;
                    }
                    (max, free, unknown)
                }
            };

            let (max, free, unknown) = result;
            assert_eq!(node.logit(), max, "inner value is not the max child value");
            assert_eq!(node.contains_free(), free, "stale contains_free");
            assert_eq!(node.contains_unknown(), unknown, "stale contains_unknown");
            assert!(model.clamp(node.logit()) == node.logit(), "node not clamped");

            result
        }

        let mut counted = NodeCounts {
            inner: 0,
            inner_leaf: 0,
            leaf: 0,
        };
        recurs(&map.model, &map.root, &mut counted);
        assert_eq!(counted, map.counts, "node counts drifted");
    }

    #[test]
    fn ray_insertion_frees_the_path_and_occupies_the_end() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.insert_ray(origin(), x_point(0.35), None, 0);

        assert!(map.is_free_at(&x_point(0.05), 0));
        assert!(map.is_free_at(&x_point(0.15), 0));
        assert!(map.is_free_at(&x_point(0.25), 0));
        assert!(map.is_occupied_at(&x_point(0.35), 0));
        check_invariants(&map);
    }

    #[test]
    fn traversed_voxels_receive_exactly_one_miss() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let miss = map.prob_miss_log();

        let ray = map.compute_ray(origin(), x_point(0.35), None, 0);
        map.insert_ray(origin(), x_point(0.35), None, 0);

        assert_eq!(ray.len(), 3);
        for key in ray {
            assert_eq!(map.get_node(key).logit(), miss);
        }
    }

    #[test]
    fn repeated_hits_converge_to_the_clamp_and_stop() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let target = Point3::new(1.0, 1.0, 1.0);

        for _ in 0..50 {
            map.integrate_hit_at(&target, 0);
        }
        assert_eq!(
            map.get_node(map.coord_to_key(&target, 0)).logit(),
            map.clamping_thres_max_log()
        );

        let size_before = map.size();
        map.integrate_hit_at(&target, 0);
        assert_eq!(map.size(), size_before);
        check_invariants(&map);
    }

    #[test]
    fn bbx_limit_clips_inserted_rays() {
        let mut clipped = OccupancyMap::new(MapOptions::default()).unwrap();
        clipped.set_bbx_min(Point3::new(0.0, 0.0, 0.0));
        clipped.set_bbx_max(Point3::new(1.0, 1.0, 1.0));
        clipped.enable_bbx_limit(true);
        clipped.insert_ray(x_point(-1.0), x_point(2.0), None, 0);

        let mut direct = OccupancyMap::new(MapOptions::default()).unwrap();
        direct.insert_ray(origin(), x_point(1.0), None, 0);

        for i in -12..14 {
            let x = 0.05 + f64::from(i) * 0.1;
            assert_eq!(
                clipped.is_free_at(&x_point(x), 0),
                direct.is_free_at(&x_point(x), 0),
                "free mismatch at {}",
                x
            );
            assert_eq!(
                clipped.is_occupied_at(&x_point(x), 0),
                direct.is_occupied_at(&x_point(x), 0),
                "occupied mismatch at {}",
                x
            );
        }
        assert_eq!(clipped.size(), direct.size());
        check_invariants(&clipped);
    }

    #[test]
    fn cast_ray_stops_at_the_first_occupied_voxel() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.integrate_hit_at(&x_point(0.55), 0);

        let end = map
            .cast_ray(origin(), Vector3::x(), true, None, 0)
            .expect("ray should hit the occupied voxel");
        assert_relative_eq!(end.x, 0.55, epsilon = 1e-9);
        assert!(end.y.abs() <= map.node_half_size(0) + 1e-9);
        assert!(end.z.abs() <= map.node_half_size(0) + 1e-9);
    }

    #[test]
    fn cast_ray_is_blocked_by_unknown_space_unless_ignored() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.integrate_hit_at(&x_point(0.55), 0);

        assert!(map.cast_ray(origin(), Vector3::x(), false, None, 0).is_none());
    }

    #[test]
    fn uniform_siblings_collapse_into_the_parent() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let base = map.coord_to_key(&x_point(0.05), 0);

        let siblings: Vec<Key> = (0..8)
            .map(|i| {
                Key::new(
                    base.x() + (i & 1),
                    base.y() + ((i >> 1) & 1),
                    base.z() + ((i >> 2) & 1),
                    0,
                )
            })
            .collect();

        for key in &siblings[..7] {
            map.set_node_value(*key, -2.0);
        }
        let leaves_before = map.num_leaf_nodes();
        assert_eq!(leaves_before, 8);

        map.set_node_value(siblings[7], -2.0);
        assert_eq!(map.num_leaf_nodes(), leaves_before - 8);

        let parent = map.get_node(Code::from(base).to_depth(1));
        assert!(parent.is_leaf());
        assert_eq!(parent.depth(), 1);
        assert_eq!(parent.logit(), map.clamping_thres_min_log());
        check_invariants(&map);
    }

    #[test]
    fn collapsing_requires_automatic_pruning() {
        let mut map = OccupancyMap::new(MapOptions {
            automatic_pruning: false,
            ..Default::default()
        })
        .unwrap();
        let base = map.coord_to_key(&x_point(0.05), 0);

        for i in 0..8u32 {
            let key = Key::new(
                base.x() + (i & 1),
                base.y() + ((i >> 1) & 1),
                base.z() + ((i >> 2) & 1),
                0,
            );
            map.set_node_value(key, -2.0);
        }

        assert_eq!(map.num_leaf_nodes(), 8);
        assert!(!map.get_node(Code::from(base).to_depth(1)).is_leaf());
        check_invariants(&map);

        // A manual prune collapses regardless of the setting.
        map.prune();
        assert_eq!(map.num_leaf_nodes(), 0);
        assert!(map.get_node(Code::from(base).to_depth(1)).is_leaf());
        check_invariants(&map);
    }

    #[test]
    fn bulk_update_at_an_inner_depth_reaches_every_descendant() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        // Differentiate two sibling voxels first so the subtree is expanded.
        map.integrate_hit_at(&x_point(0.05), 0);
        map.integrate_miss_at(&x_point(0.15), 0);

        let coarse = map.coord_to_key(&x_point(0.05), 2);
        map.update_node_value(coarse, map.prob_hit_log());

        let hit = map.prob_hit_log();
        let miss = map.prob_miss_log();
        assert_eq!(
            map.get_node(map.coord_to_key(&x_point(0.05), 0)).logit(),
            hit + hit
        );
        assert_eq!(
            map.get_node(map.coord_to_key(&x_point(0.15), 0)).logit(),
            miss + hit
        );
        check_invariants(&map);
    }

    #[test]
    fn point_cloud_hits_win_over_misses_in_the_same_scan() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        // The ray to the far point passes straight through the near one.
        let cloud: PointCloud = vec![x_point(0.35), x_point(0.75)].into();
        map.insert_point_cloud(origin(), &cloud, None);

        assert!(map.is_occupied_at(&x_point(0.35), 0));
        assert!(map.is_occupied_at(&x_point(0.75), 0));
        assert!(map.is_free_at(&x_point(0.15), 0));
        assert!(map.is_free_at(&x_point(0.55), 0));
        check_invariants(&map);
    }

    #[test]
    fn point_cloud_respects_max_range() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let cloud: PointCloud = vec![x_point(2.0)].into();
        map.insert_point_cloud(origin(), &cloud, Some(1.0));

        assert!(map.is_free_at(&x_point(0.55), 0));
        assert!(!map.is_occupied_at(&x_point(2.0), 0));
        check_invariants(&map);
    }

    #[test]
    fn discrete_insertion_deduplicates_endpoints() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let cloud: PointCloud = std::iter::repeat(x_point(0.75)).take(10).collect();
        map.insert_point_cloud_discrete(origin(), &cloud, None, 0, 0);

        // One hit, not ten.
        assert_eq!(
            map.get_node(map.coord_to_key(&x_point(0.75), 0)).logit(),
            map.prob_hit_log()
        );
        check_invariants(&map);
    }

    #[test]
    fn discrete_insertion_at_a_coarse_depth_marks_the_endpoint() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let cloud: PointCloud = vec![Point3::new(1.55, 0.35, 0.0), x_point(0.95)].into();
        map.insert_point_cloud_discrete(origin(), &cloud, None, 1, 2);

        assert!(map.is_occupied_at(&Point3::new(1.55, 0.35, 0.0), 0));
        assert!(map.is_occupied_at(&x_point(0.95), 0));
        check_invariants(&map);
    }

    #[test]
    fn transformed_insertion_moves_the_cloud() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let cloud: PointCloud = vec![x_point(0.55)].into();
        let shift = Isometry3::translation(0.0, 1.0, 0.0);
        map.insert_point_cloud_transformed(origin(), &cloud, &shift, None);

        assert!(map.is_occupied_at(&Point3::new(0.55, 1.0, 0.0), 0));
        assert!(!map.is_occupied_at(&x_point(0.55), 0));
        check_invariants(&map);
    }

    #[test]
    fn clearing_an_area_carves_it_free() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.integrate_hit_at(&x_point(0.25), 0);
        map.clear_area_bbx(&Point3::new(0.2, -0.1, -0.1), &Point3::new(0.3, 0.1, 0.1), 0);

        assert!(map.is_free_at(&x_point(0.25), 0));
        check_invariants(&map);
    }

    #[test]
    fn change_detection_records_touched_codes() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.enable_change_detection(true);
        map.integrate_hit_at(&x_point(0.35), 0);

        let code = Code::from(map.coord_to_key(&x_point(0.35), 0));
        assert!(map.changed_codes().contains(&code));
        assert!(map.num_changes_detected() > 1, "ancestors also changed");

        map.reset_change_detection();
        assert_eq!(map.num_changes_detected(), 0);

        map.enable_change_detection(false);
        map.integrate_hit_at(&x_point(0.35), 0);
        assert_eq!(map.num_changes_detected(), 0);
    }

    #[test]
    fn metric_bounds_cover_exactly_the_known_space() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.insert_ray(origin(), x_point(0.35), None, 0);

        let min = map.metric_min(0);
        let max = map.metric_max(0);
        assert_relative_eq!(min.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(min.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(max.x, 0.4, epsilon = 1e-9);
        assert_relative_eq!(max.y, 0.1, epsilon = 1e-9);

        let size = map.metric_size(0);
        assert_relative_eq!(size.x, 0.4, epsilon = 1e-9);
    }

    #[test]
    fn threshold_changes_reclassify_without_rewriting_values() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.integrate_hit_at(&x_point(0.35), 0);
        assert!(map.is_occupied_at(&x_point(0.35), 0));

        // One hit is p = 0.7; raising the threshold above it flips the
        // classification while the stored value stays put.
        let stored = map.get_node(map.coord_to_key(&x_point(0.35), 0)).logit();
        map.set_occupancy_thres(0.9);
        assert!(!map.is_occupied_at(&x_point(0.35), 0));
        assert_eq!(
            map.get_node(map.coord_to_key(&x_point(0.35), 0)).logit(),
            stored
        );
        check_invariants(&map);
    }

    #[test]
    fn sensor_model_setters_convert_their_arguments() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.set_prob_miss(0.3);
        map.set_prob_hit(0.8);

        assert_relative_eq!(map.prob_miss(), 0.3, epsilon = 1e-6);
        assert_relative_eq!(map.prob_hit(), 0.8, epsilon = 1e-6);
    }

    #[test]
    fn construction_rejects_bad_parameters() {
        assert!(matches!(
            OccupancyMap::new(MapOptions {
                depth_levels: 1,
                ..Default::default()
            }),
            Err(MapError::Config(_))
        ));
        assert!(matches!(
            OccupancyMap::new(MapOptions {
                depth_levels: 22,
                ..Default::default()
            }),
            Err(MapError::Config(_))
        ));
        assert!(matches!(
            OccupancyMap::new(MapOptions {
                resolution: 0.0,
                ..Default::default()
            }),
            Err(MapError::Config(_))
        ));
        assert!(matches!(
            OccupancyMap::new(MapOptions {
                occupancy_thres: f32::NAN,
                ..Default::default()
            }),
            Err(MapError::Config(_))
        ));

        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        assert!(matches!(
            map.clear_with(0.1, 25),
            Err(MapError::Config(_))
        ));
    }

    #[test]
    fn queries_outside_the_map_fall_through_to_unknown() {
        let map = OccupancyMap::new(MapOptions::default()).unwrap();
        let far = Point3::new(1.0e7, -1.0e7, 1.0e7);

        assert!(map.is_unknown_at(&far, 0));
        assert!(map.coord_to_key_checked(&far, 0).is_none());
    }

    #[test]
    fn get_child_validates_its_arguments() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.integrate_hit_at(&x_point(0.35), 0);

        let root = map.root();
        assert!(map.get_child(&root, 8).is_err());
        assert!(map.get_child(&root, 3).is_ok());

        let voxel = map.get_node(map.coord_to_key(&x_point(0.35), 0));
        assert!(map.get_child(&voxel, 0).is_err());
    }

    #[test]
    fn clear_resets_to_a_single_unknown_root() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.insert_ray(origin(), x_point(0.35), None, 0);
        assert!(map.size() > 1);

        map.clear();
        assert_eq!(map.size(), 1);
        assert_eq!(map.num_inner_leaf_nodes(), 1);
        assert!(map.is_unknown_at(&x_point(0.35), 0));
        assert!(map.contains_unknown(Code::new(0, map.depth_levels())));
    }

    #[test]
    fn memory_usage_tracks_the_node_counts() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let empty = map.memory_usage();
        map.insert_ray(origin(), x_point(0.35), None, 0);

        assert!(map.memory_usage() > empty);
        assert_eq!(
            map.size(),
            map.num_inner_nodes() + map.num_inner_leaf_nodes() + map.num_leaf_nodes()
        );
    }

    #[test]
    fn random_workload_preserves_every_invariant() {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let end = Point3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
            );
            map.insert_ray(origin(), end, None, 0);
        }

        let cloud: PointCloud = (0..100)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-2.0..2.0),
                )
            })
            .collect();
        map.insert_point_cloud(Point3::new(0.05, 0.05, 0.05), &cloud, Some(3.0));

        check_invariants(&map);
    }
}
