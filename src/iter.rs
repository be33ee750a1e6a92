//! Depth-bounded, state-filtered traversal.
//!
//! Two traversals are exposed: [`iter_nodes`](OccupancyMap::iter_nodes)
//! visits every inner node encountered at depth ≥ `min_depth`, and
//! [`iter_leaves`](OccupancyMap::iter_leaves) visits only terminal nodes,
//! true leaves or collapsed subtrees. Both prune whole subtrees using the
//! inner summary bits and an optional bounding volume, and visit children
//! in index order.

use crate::code::Code;
use crate::geometry::{Aabb, BoundingVolume};
use crate::io::LeafCodec;
use crate::node::{Children, InnerNode, OccupancyNode};
use crate::sensor_model::{probability, SensorModel};
use crate::tree::OccupancyMap;

use nalgebra::Point3;

/// Which nodes a traversal yields. The defaults visit all known space:
/// occupied and free nodes, no unknown nodes, from depth 0 up.
#[derive(Clone, Debug)]
pub struct NodeFilter {
    occupied: bool,
    free: bool,
    unknown: bool,
    contains: bool,
    min_depth: u8,
    volume: BoundingVolume,
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self {
            occupied: true,
            free: true,
            unknown: false,
            contains: false,
            min_depth: 0,
            volume: BoundingVolume::new(),
        }
    }
}

impl NodeFilter {
    #[inline]
    pub fn occupied(mut self, yes: bool) -> Self {
        self.occupied = yes;
        self
    }

    #[inline]
    pub fn free(mut self, yes: bool) -> Self {
        self.free = yes;
        self
    }

    #[inline]
    pub fn unknown(mut self, yes: bool) -> Self {
        self.unknown = yes;
        self
    }

    /// Match nodes that merely *contain* a selected state somewhere in
    /// their subtree, instead of nodes whose own value is in the state.
    #[inline]
    pub fn contains(mut self, yes: bool) -> Self {
        self.contains = yes;
        self
    }

    /// Do not descend below this depth; nodes at `min_depth` are treated
    /// as terminal.
    #[inline]
    pub fn min_depth(mut self, depth: u8) -> Self {
        self.min_depth = depth;
        self
    }

    /// Skip subtrees whose axis-aligned box does not intersect `volume`.
    #[inline]
    pub fn bounded(mut self, volume: impl Into<BoundingVolume>) -> Self {
        self.volume = volume.into();
        self
    }

    fn matches_leaf(&self, model: &SensorModel, logit: f32) -> bool {
        (self.occupied && model.is_occupied_logit(logit))
            || (self.free && model.is_free_logit(logit))
            || (self.unknown && model.is_unknown_logit(logit))
    }

    fn matches_inner(&self, model: &SensorModel, node: &InnerNode) -> bool {
        if self.contains {
            self.could_contain(model, node)
        } else {
            self.matches_leaf(model, node.logit())
        }
    }

    /// Whether the subtree can hold any node of a selected state; read
    /// from the rolled-up maximum and the cached summary bits.
    fn could_contain(&self, model: &SensorModel, node: &InnerNode) -> bool {
        (self.occupied && model.is_occupied_logit(node.logit()))
            || (self.free && node.contains_free())
            || (self.unknown && node.contains_unknown())
    }
}

/// One node yielded by a traversal.
#[derive(Clone, Copy, Debug)]
pub struct VisitedNode {
    code: Code,
    logit: f32,
    center: Point3<f64>,
    half_size: f64,
    is_leaf: bool,
}

impl VisitedNode {
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.code.depth()
    }

    #[inline]
    pub fn logit(&self) -> f32 {
        self.logit
    }

    #[inline]
    pub fn probability(&self) -> f32 {
        probability(self.logit)
    }

    /// Centre of the node in map coordinates.
    #[inline]
    pub fn center(&self) -> Point3<f64> {
        self.center
    }

    /// Half of the node's edge length.
    #[inline]
    pub fn half_size(&self) -> f64 {
        self.half_size
    }

    #[inline]
    pub fn size(&self) -> f64 {
        2.0 * self.half_size
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        Aabb::cube(self.center, self.half_size)
    }

    /// Whether the node is terminal: a true leaf or a collapsed subtree.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }
}

enum Frame<'a> {
    Inner(&'a InnerNode, Code),
    Leaf(&'a OccupancyNode, Code),
}

impl<C: LeafCodec> OccupancyMap<C> {
    /// Iterates over terminal nodes matching `filter`: depth-0 leaves,
    /// collapsed subtrees, and expanded nodes at the filter's `min_depth`.
    pub fn iter_leaves(&self, filter: NodeFilter) -> LeafIter<'_, C> {
        LeafIter {
            walker: Walker::new(self, filter),
        }
    }

    /// Iterates over every inner node encountered at depth ≥ the filter's
    /// `min_depth`, in preorder.
    pub fn iter_nodes(&self, filter: NodeFilter) -> TreeIter<'_, C> {
        TreeIter {
            walker: Walker::new(self, filter),
        }
    }
}

struct Walker<'a, C: LeafCodec> {
    map: &'a OccupancyMap<C>,
    filter: NodeFilter,
    stack: Vec<Frame<'a>>,
}

impl<'a, C: LeafCodec> Walker<'a, C> {
    fn new(map: &'a OccupancyMap<C>, filter: NodeFilter) -> Self {
        let root_code = Code::new(0, map.depth_levels());
        Self {
            map,
            filter,
            stack: vec![Frame::Inner(&map.root, root_code)],
        }
    }

    fn entry(&self, code: Code, logit: f32, is_leaf: bool) -> VisitedNode {
        VisitedNode {
            code,
            logit,
            center: self.map.key_to_coord(&code.to_key()),
            half_size: self.map.node_half_size(code.depth()),
            is_leaf,
        }
    }

    fn in_volume(&self, code: Code) -> bool {
        self.filter.volume.intersects(&Aabb::cube(
            self.map.key_to_coord(&code.to_key()),
            self.map.node_half_size(code.depth()),
        ))
    }

    /// Pushes the children of `node` in reverse index order so they pop in
    /// index order. `leaves` controls whether depth-0 leaves are pushed.
    fn push_children(&mut self, node: &'a InnerNode, code: Code, leaves: bool) {
        match &node.children {
            Children::None => {}
            Children::Leaves(children) => {
                if leaves {
                    for index in (0..8).rev() {
                        self.stack
                            .push(Frame::Leaf(&children[index], code.child(index)));
                    }
                }
            }
            Children::Inner(children) => {
                for index in (0..8).rev() {
                    self.stack
                        .push(Frame::Inner(&children[index], code.child(index)));
                }
            }
        }
    }
}

/// Forward, single-pass iterator over terminal nodes.
pub struct LeafIter<'a, C: LeafCodec> {
    walker: Walker<'a, C>,
}

impl<C: LeafCodec> Iterator for LeafIter<'_, C> {
    type Item = VisitedNode;

    fn next(&mut self) -> Option<VisitedNode> {
        while let Some(frame) = self.walker.stack.pop() {
            match frame {
                Frame::Leaf(leaf, code) => {
                    if self.walker.in_volume(code)
                        && self
                            .walker
                            .filter
                            .matches_leaf(&self.walker.map.model, leaf.logit())
                    {
                        return Some(self.walker.entry(code, leaf.logit(), true));
                    }
                }
                Frame::Inner(node, code) => {
                    if !self.walker.in_volume(code) {
                        continue;
                    }
                    let depth = code.depth();
                    if !node.has_children() || depth <= self.walker.filter.min_depth {
                        if self
                            .walker
                            .filter
                            .matches_inner(&self.walker.map.model, node)
                        {
                            return Some(self.walker.entry(code, node.logit(), true));
                        }
                    } else if self
                        .walker
                        .filter
                        .could_contain(&self.walker.map.model, node)
                    {
                        self.walker.push_children(node, code, true);
                    }
                }
            }
        }
        None
    }
}

/// Forward, single-pass preorder iterator over inner nodes.
pub struct TreeIter<'a, C: LeafCodec> {
    walker: Walker<'a, C>,
}

impl<C: LeafCodec> Iterator for TreeIter<'_, C> {
    type Item = VisitedNode;

    fn next(&mut self) -> Option<VisitedNode> {
        while let Some(frame) = self.walker.stack.pop() {
            let Frame::Inner(node, code) = frame else {
                continue;
            };
            if !self.walker.in_volume(code) {
                continue;
            }

            let depth = code.depth();
            if depth > self.walker.filter.min_depth
                && node.has_children()
                && self
                    .walker
                    .filter
                    .could_contain(&self.walker.map.model, node)
            {
                self.walker.push_children(node, code, false);
            }

            if depth >= self.walker.filter.min_depth
                && self
                    .walker
                    .filter
                    .matches_inner(&self.walker.map.model, node)
            {
                return Some(self.walker.entry(code, node.logit(), !node.has_children()));
            }
        }
        None
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
    use crate::tree::{MapOptions, OccupancyMap};

    fn map_with_one_ray() -> OccupancyMap {
        let mut map = OccupancyMap::new(MapOptions::default()).unwrap();
        map.insert_ray(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.35, 0.0, 0.0),
            None,
            0,
        );
        map
    }

    #[test]
    fn leaf_iteration_visits_known_space_once() {
        let map = map_with_one_ray();

        let occupied: Vec<_> = map
            .iter_leaves(NodeFilter::default().free(false))
            .collect();
        let free: Vec<_> = map
            .iter_leaves(NodeFilter::default().occupied(false))
            .collect();

        assert_eq!(occupied.len(), 1);
        assert_eq!(free.len(), 3);
        assert!(occupied[0].is_leaf());
        assert_eq!(occupied[0].depth(), 0);
    }

    #[test]
    fn unknown_space_is_skipped_by_default() {
        let map = map_with_one_ray();

        for node in map.iter_leaves(NodeFilter::default()) {
            let logit = node.logit();
            assert!(logit != 0.0, "unknown node yielded at {:?}", node.code());
        }
    }

    #[test]
    fn volume_filter_prunes_subtrees() {
        let map = map_with_one_ray();

        let near_origin = Aabb::from_min_max(
            Point3::new(0.0, -0.05, -0.05),
            Point3::new(0.18, 0.05, 0.05),
        );
        let keys: Vec<_> = map
            .iter_leaves(NodeFilter::default().bounded(near_origin))
            .map(|n| n.center().x)
            .collect();

        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|&x| x < 0.2));
    }

    #[test]
    fn min_depth_yields_coarse_nodes() {
        let map = map_with_one_ray();

        for node in map.iter_leaves(NodeFilter::default().min_depth(2)) {
            assert!(node.depth() >= 2);
        }
    }

    #[test]
    fn tree_iteration_is_preorder_and_includes_ancestors() {
        let map = map_with_one_ray();

        let nodes: Vec<_> = map.iter_nodes(NodeFilter::default().contains(true)).collect();

        assert!(!nodes.is_empty());
        // The first node is the root, which spans every descendant.
        assert_eq!(nodes[0].depth(), map.depth_levels());
        for pair in nodes.windows(2) {
            assert!(pair[1].depth() < map.depth_levels());
        }
    }
}
