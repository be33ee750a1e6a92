//! Octree node storage.
//!
//! An [`InnerNode`] owns its children outright: either eight leaves (when
//! it sits at depth 1) or eight inner nodes. A node with no materialised
//! children represents a uniform cube of its own log-odds value; that is
//! the collapsed form the pruning pass tries to reach. The tag of
//! [`Children`] is always derivable from the node's depth, which the tree
//! threads through every call.

use crate::sensor_model::SensorModel;

/// A single voxel estimate: occupancy log-odds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OccupancyNode {
    pub(crate) logit: f32,
}

impl OccupancyNode {
    #[inline]
    pub fn logit(&self) -> f32 {
        self.logit
    }

    /// Replaces the stored log-odds. Only meant for leaf codecs while
    /// deserialising; the tree re-establishes its invariants afterwards.
    #[inline]
    pub fn set_logit(&mut self, logit: f32) {
        self.logit = logit;
    }
}

/// The children of an inner node, if materialised.
#[derive(Clone, Debug, Default)]
pub(crate) enum Children {
    #[default]
    None,
    Leaves(Box<[OccupancyNode; 8]>),
    Inner(Box<[InnerNode; 8]>),
}

/// An inner octree node: a leaf estimate (the maximum over its
/// descendants), two summary bits and the optionally owned children.
#[derive(Clone, Debug, Default)]
pub struct InnerNode {
    pub(crate) node: OccupancyNode,
    pub(crate) contains_free: bool,
    pub(crate) contains_unknown: bool,
    pub(crate) children: Children,
}

/// Exact node counts, maintained on every expansion and release. A fresh
/// tree consists of the root alone, which counts as one inner leaf node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct NodeCounts {
    pub inner: usize,
    pub inner_leaf: usize,
    pub leaf: usize,
}

impl NodeCounts {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: 0,
            inner_leaf: 1,
            leaf: 0,
        }
    }
}

impl InnerNode {
    #[inline]
    pub fn logit(&self) -> f32 {
        self.node.logit
    }

    /// Whether some descendant leaf is classified free. For a collapsed
    /// node this reflects the node's own value.
    #[inline]
    pub fn contains_free(&self) -> bool {
        self.contains_free
    }

    /// Whether some descendant leaf is classified unknown.
    #[inline]
    pub fn contains_unknown(&self) -> bool {
        self.contains_unknown
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        !matches!(self.children, Children::None)
    }

    pub(crate) fn leaf_children(&self) -> &[OccupancyNode; 8] {
        match &self.children {
            Children::Leaves(leaves) => leaves,
            _ => unreachable!("leaf children only exist at depth 1"),
        }
    }

    pub(crate) fn leaf_children_mut(&mut self) -> &mut [OccupancyNode; 8] {
        match &mut self.children {
            Children::Leaves(leaves) => leaves,
            _ => unreachable!("leaf children only exist at depth 1"),
        }
    }

    pub(crate) fn inner_children(&self) -> &[InnerNode; 8] {
        match &self.children {
            Children::Inner(inner) => inner,
            _ => unreachable!("inner children only exist above depth 1"),
        }
    }

    pub(crate) fn inner_children_mut(&mut self) -> &mut [InnerNode; 8] {
        match &mut self.children {
            Children::Inner(inner) => inner,
            _ => unreachable!("inner children only exist above depth 1"),
        }
    }

    /// Materialises the children of a collapsed node, copying the node's
    /// value and summary bits into each child. Idempotent.
    pub(crate) fn expand(&mut self, depth: u8, counts: &mut NodeCounts) -> bool {
        if self.has_children() {
            return false;
        }
        debug_assert!(depth >= 1);

        if depth == 1 {
            self.children = Children::Leaves(Box::new([self.node; 8]));
            counts.leaf += 8;
            counts.inner_leaf -= 1;
            counts.inner += 1;
        } else {
            let child = InnerNode {
                node: self.node,
                contains_free: self.contains_free,
                contains_unknown: self.contains_unknown,
                children: Children::None,
            };
            self.children = Children::Inner(Box::new(std::array::from_fn(|_| child.clone())));
            counts.inner_leaf += 7;
            counts.inner += 1;
        }

        true
    }

    /// Releases the children array (recursively for inner children) and
    /// keeps the node counts exact.
    pub(crate) fn delete_children(&mut self, depth: u8, counts: &mut NodeCounts) {
        match std::mem::take(&mut self.children) {
            Children::None => {}
            Children::Leaves(_) => {
                counts.leaf -= 8;
                counts.inner_leaf += 1;
                counts.inner -= 1;
            }
            Children::Inner(mut children) => {
                for child in children.iter_mut() {
                    child.delete_children(depth - 1, counts);
                }
                counts.inner_leaf -= 7;
                counts.inner -= 1;
            }
        }
    }

    /// Collapses the node to a uniform cube of its own value. Skipped (and
    /// `false` returned) when automatic pruning is disabled and the prune
    /// was not requested manually.
    pub(crate) fn prune(
        &mut self,
        depth: u8,
        manual: bool,
        auto_enabled: bool,
        model: &SensorModel,
        counts: &mut NodeCounts,
    ) -> bool {
        if !manual && !auto_enabled {
            return false;
        }

        self.delete_children(depth, counts);
        self.refresh_leaf_flags(model);
        true
    }

    /// Recomputes the summary bits of a node from its own value, as if it
    /// were a leaf. Valid for collapsed nodes only.
    pub(crate) fn refresh_leaf_flags(&mut self, model: &SensorModel) {
        self.contains_free = model.is_free_logit(self.node.logit);
        self.contains_unknown = model.is_unknown_logit(self.node.logit);
    }

    /// The value of child 0, or the node's own value when collapsed.
    pub(crate) fn first_child_logit(&self) -> f32 {
        match &self.children {
            Children::None => self.node.logit,
            Children::Leaves(leaves) => leaves[0].logit,
            Children::Inner(inner) => inner[0].node.logit,
        }
    }

    /// Whether the children can be replaced by a single value: all eight
    /// hold the same log-odds, and inner children are themselves collapsed.
    pub(crate) fn children_collapsible(&self) -> bool {
        match &self.children {
            Children::None => false,
            Children::Leaves(leaves) => leaves.iter().all(|l| l.logit == leaves[0].logit),
            Children::Inner(inner) => inner
                .iter()
                .all(|c| !c.has_children() && c.node.logit == inner[0].node.logit),
        }
    }

    /// Recomputes this node from its children: collapse them if they are
    /// uniform (subject to the pruning policy), otherwise roll up the
    /// maximum value and the two summary bits. Returns whether any stored
    /// field changed, so the caller can stop rolling up early.
    pub(crate) fn update_from_children(
        &mut self,
        depth: u8,
        auto_prune: bool,
        model: &SensorModel,
        counts: &mut NodeCounts,
    ) -> bool {
        if !self.has_children() {
            return false;
        }

        let old = (self.node.logit, self.contains_free, self.contains_unknown);

        if self.children_collapsible() {
            self.node.logit = self.first_child_logit();
            if self.prune(depth, false, auto_prune, model, counts) {
                return true;
            }
        }

        let (new_logit, new_contains_free, new_contains_unknown) = match &self.children {
            Children::Leaves(leaves) => {
                let mut max = leaves[0].logit;
                let mut contains_free = false;
                let mut contains_unknown = false;
                for leaf in leaves.iter() {
                    max = max.max(leaf.logit);
                    if model.is_free_logit(leaf.logit) {
                        contains_free = true;
                    } else if model.is_unknown_logit(leaf.logit) {
                        contains_unknown = true;
                    }
                }
                (max, contains_free, contains_unknown)
            }
            Children::Inner(inner) => {
                let mut max = inner[0].node.logit;
                let mut contains_free = false;
                let mut contains_unknown = false;
                for child in inner.iter() {
                    max = max.max(child.node.logit);
                    contains_free |= child.contains_free;
                    contains_unknown |= child.contains_unknown;
                }
                (max, contains_free, contains_unknown)
            }
            Children::None => unreachable!(),
        };

        self.node.logit = new_logit;
        self.contains_free = new_contains_free;
        self.contains_unknown = new_contains_unknown;

        old != (new_logit, new_contains_free, new_contains_unknown)
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
    use crate::sensor_model::logit;

    fn model() -> SensorModel {
        SensorModel {
            occupancy_thres_log: logit(0.5),
            free_thres_log: logit(0.5),
            prob_hit_log: logit(0.7),
            prob_miss_log: logit(0.4),
            clamp_min_log: logit(0.1192),
            clamp_max_log: logit(0.971),
        }
    }

    #[test]
    fn expand_copies_the_value_into_children() {
        let mut counts = NodeCounts::new();
        let mut node = InnerNode {
            node: OccupancyNode { logit: 1.5 },
            contains_free: false,
            contains_unknown: false,
            children: Children::None,
        };

        assert!(node.expand(1, &mut counts));
        assert!(!node.expand(1, &mut counts));
        assert!(node.leaf_children().iter().all(|l| l.logit == 1.5));
        assert_eq!(counts.leaf, 8);
        assert_eq!(counts.inner, 1);
        assert_eq!(counts.inner_leaf, 0);
    }

    #[test]
    fn expand_then_prune_restores_the_counts() {
        let mut counts = NodeCounts::new();
        let mut node = InnerNode::default();
        node.expand(3, &mut counts);
        node.inner_children_mut()[2].expand(2, &mut counts);

        node.prune(3, true, false, &model(), &mut counts);

        assert_eq!(counts, NodeCounts::new());
        assert!(!node.has_children());
    }

    #[test]
    fn prune_respects_the_automatic_pruning_switch() {
        let mut counts = NodeCounts::new();
        let mut node = InnerNode::default();
        node.expand(1, &mut counts);

        assert!(!node.prune(1, false, false, &model(), &mut counts));
        assert!(node.has_children());
        assert!(node.prune(1, false, true, &model(), &mut counts));
        assert!(!node.has_children());
    }

    #[test]
    fn uniform_children_collapse_on_update() {
        let mut counts = NodeCounts::new();
        let mut node = InnerNode::default();
        node.expand(1, &mut counts);
        for leaf in node.leaf_children_mut() {
            leaf.logit = -2.0;
        }

        assert!(node.update_from_children(1, true, &model(), &mut counts));
        assert!(!node.has_children());
        assert_eq!(node.logit(), -2.0);
        assert!(node.contains_free());
        assert_eq!(counts, NodeCounts::new());
    }

    #[test]
    fn mixed_children_roll_up_max_and_summary_bits() {
        let mut counts = NodeCounts::new();
        let mut node = InnerNode::default();
        node.expand(1, &mut counts);
        node.leaf_children_mut()[0].logit = 2.0;
        node.leaf_children_mut()[1].logit = -1.0;

        assert!(node.update_from_children(1, true, &model(), &mut counts));
        assert!(node.has_children());
        assert_eq!(node.logit(), 2.0);
        assert!(node.contains_free());
        assert!(node.contains_unknown());
    }
}
