//! Concept nodes: the vertices of the hierarchy, holding per-attribute
//! counts plus the tree-structural links that make them a node.
//!
//! Counting logic (`increment_counts`, `update_counts_from_node`) is pure
//! data manipulation and needs no access to the arena; `is_exact_match`
//! takes a read-only slice of the context-handle arena solely to resolve
//! `CTX` handles to the concept they currently target (see its doc comment).
//! Structural operations that allocate or discard nodes
//! (`create_new_child`, `insert_parent_with_current_counts`, `merge`,
//! `split`) need arena-wide bookkeeping and live on
//! [`crate::tree::ContextualCobwebTree`] instead, which is the only thing
//! that owns the `Vec<ConceptNode>` arena.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::accumulator::ContinuousValue;
use crate::context::{ContextHandleId, ContextHandleState};
use crate::value::{AttrName, AttrValue, Instance, NominalValue};

/// A stable id for a [`ConceptNode`] inside
/// [`crate::tree::ContextualCobwebTree`]'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// The per-value counts recorded for a single attribute at a node.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrCounts {
    /// A running mean/variance accumulator, for numeric attributes.
    Numeric(ContinuousValue),
    /// A value-to-count map, for categorical attributes.
    Nominal(BTreeMap<NominalValue, u64>),
    /// A handle-to-count multiset, for the reserved contextual attribute.
    Context(HashMap<ContextHandleId, u64>),
}

impl AttrCounts {
    /// Total count recorded under this attribute, used to check invariant
    /// (I3)/(I4): this should equal the owning node's `count` for
    /// non-contextual attributes.
    #[must_use]
    pub fn total(&self) -> u64 {
        match self {
            Self::Numeric(cv) => cv.num(),
            Self::Nominal(counts) => counts.values().sum(),
            Self::Context(counts) => counts.values().sum(),
        }
    }
}

/// A node in the concept tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptNode {
    /// Total instances accumulated into this node (including descendants).
    pub count: u64,
    /// Per-attribute value counts. A `BTreeMap` so iteration order (and
    /// hence anything derived from it, such as `to_json`) is deterministic.
    pub av_counts: BTreeMap<AttrName, AttrCounts>,
    /// Sum over all `CTX` counts: the number of context slots accumulated.
    pub context_size: u64,
    /// Ordered child list; empty iff this node is a leaf.
    pub children: Vec<NodeId>,
    /// Back-reference to the parent; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Leaf nodes reachable beneath this node (includes `self` when this
    /// node is itself a leaf). A `BTreeSet` for deterministic iteration.
    pub descendants: BTreeSet<NodeId>,
}

impl ConceptNode {
    /// A fresh, empty root.
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            count: 0,
            av_counts: BTreeMap::new(),
            context_size: 0,
            children: Vec::new(),
            parent: None,
            descendants: BTreeSet::new(),
        }
    }

    /// A fresh, empty leaf under `parent`. The caller is responsible for
    /// registering this node's id in its own `descendants` set once it has
    /// one (the node doesn't know its own id).
    #[must_use]
    pub fn new_leaf(parent: Option<NodeId>) -> Self {
        Self {
            count: 0,
            av_counts: BTreeMap::new(),
            context_size: 0,
            children: Vec::new(),
            parent,
            descendants: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Adds `instance`'s attribute counts into `self.av_counts` and bumps
    /// `count` by one. Does not touch `descendants`: the caller registers
    /// leaf membership separately, since only the committing leaf itself
    /// (not every ancestor) gains a new descendant.
    pub fn increment_counts(&mut self, instance: &Instance) {
        self.count += 1;

        for (attr, value) in instance {
            match value {
                AttrValue::Numeric(v) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Numeric(ContinuousValue::new()));
                    if let AttrCounts::Numeric(cv) = entry {
                        cv.update(*v);
                    }
                }
                AttrValue::Nominal(v) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Nominal(BTreeMap::new()));
                    if let AttrCounts::Nominal(counts) = entry {
                        *counts.entry(v.clone()).or_insert(0) += 1;
                    }
                }
                AttrValue::Context(handles) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Context(HashMap::new()));
                    if let AttrCounts::Context(counts) = entry {
                        for handle in handles {
                            *counts.entry(*handle).or_insert(0) += 1;
                        }
                    }
                    self.context_size += handles.len() as u64;
                }
            }
        }
    }

    /// Sums `other`'s counts and descendants into `self`. Used by
    /// fringe-split (copying a leaf's counts into its new parent) and merge
    /// (combining two children's counts into their new shared parent).
    pub fn update_counts_from_node(&mut self, other: &ConceptNode) {
        self.count += other.count;
        self.context_size += other.context_size;
        self.descendants.extend(other.descendants.iter().copied());

        for (attr, other_counts) in &other.av_counts {
            match other_counts {
                AttrCounts::Numeric(other_cv) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Numeric(ContinuousValue::new()));
                    if let AttrCounts::Numeric(cv) = entry {
                        cv.combine(other_cv);
                    }
                }
                AttrCounts::Nominal(other_map) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Nominal(BTreeMap::new()));
                    if let AttrCounts::Nominal(map) = entry {
                        for (value, count) in other_map {
                            *map.entry(value.clone()).or_insert(0) += count;
                        }
                    }
                }
                AttrCounts::Context(other_map) => {
                    let entry = self
                        .av_counts
                        .entry(attr.clone())
                        .or_insert_with(|| AttrCounts::Context(HashMap::new()));
                    if let AttrCounts::Context(map) = entry {
                        for (handle, count) in other_map {
                            *map.entry(*handle).or_insert(0) += count;
                        }
                    }
                }
            }
        }
    }

    /// Whether `instance` matches this node's distribution exactly: every
    /// non-reserved, non-hidden attribute present with a single value whose
    /// count equals `self.count` (numeric attributes with zero variance and
    /// a matching mean), and — if `CTX` is present — the set of concepts the
    /// `CTX` handles resolve to is identical on both sides.
    ///
    /// Context handles are compared by the concept they currently resolve
    /// to (via `context_handles`), not by raw handle id: two instances
    /// never share a literal handle (each names the *other* as its
    /// neighbor), so identity comparison would make this branch unreachable
    /// for any node with more than one committed instance. Comparing by
    /// resolved target is what makes two truly-identical instances collapse
    /// into one leaf instead of always fringe-splitting.
    #[must_use]
    pub fn is_exact_match(
        &self,
        instance: &Instance,
        context_handles: &[ContextHandleState],
    ) -> bool {
        let relevant = |attr: &&AttrName| !attr.is_hidden() && !attr.is_ctx();

        let self_attrs: BTreeSet<&AttrName> =
            self.av_counts.keys().filter(relevant).collect();
        let instance_attrs: BTreeSet<&AttrName> =
            instance.keys().filter(relevant).collect();
        if self_attrs != instance_attrs {
            return false;
        }

        for attr in self_attrs {
            let value = &instance[attr];
            let counts = &self.av_counts[attr];
            match (value, counts) {
                (AttrValue::Numeric(v), AttrCounts::Numeric(cv)) => {
                    if cv.num() != self.count {
                        return false;
                    }
                    if cv.unbiased_std() != 0.0 {
                        return false;
                    }
                    if (cv.unbiased_mean() - v).abs() > f64::EPSILON {
                        return false;
                    }
                }
                (AttrValue::Nominal(v), AttrCounts::Nominal(map)) => {
                    if map.len() != 1 {
                        return false;
                    }
                    match map.get(v) {
                        Some(&count) if count == self.count => {}
                        _ => return false,
                    }
                }
                _ => return false,
            }
        }

        if let Some(AttrValue::Context(handles)) = instance.get(&AttrName::ctx()) {
            match self.av_counts.get(&AttrName::ctx()) {
                Some(AttrCounts::Context(map)) => {
                    // Only the *set* of resolved targets is compared, not
                    // per-target magnitudes: a single commit can contribute
                    // more than one handle resolving to the same target
                    // (whenever `context_size > 1`), so a target's recorded
                    // count is not expected to track `self.count`
                    // one-for-one the way a single-valued nominal
                    // attribute's count does.
                    let instance_targets: BTreeSet<NodeId> = handles
                        .iter()
                        .map(|h| context_handles[h.0].current())
                        .collect();
                    let node_targets: BTreeSet<NodeId> = map
                        .keys()
                        .map(|h| context_handles[h.0].current())
                        .collect();
                    if instance_targets != node_targets {
                        return false;
                    }
                }
                _ => return false,
            }
        } else if self.av_counts.contains_key(&AttrName::ctx()) {
            return false;
        }

        true
    }
}

/// Walks from `start` to the root, calling [`ConceptNode::increment_counts`]
/// at every node along the way (including `start` itself).
pub fn increment_all_counts(arena: &mut [ConceptNode], start: NodeId, instance: &Instance) {
    let mut current = Some(start);
    while let Some(node_id) = current {
        let node = &mut arena[node_id.0];
        node.increment_counts(instance);
        current = node.parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(pairs: &[(&str, AttrValue)]) -> Instance {
        pairs
            .iter()
            .map(|(k, v)| (AttrName::new(*k), v.clone()))
            .collect()
    }

    #[test]
    fn increment_counts_bumps_count_and_nominal_map() {
        let mut node = ConceptNode::new_root();
        node.increment_counts(&instance(&[("shape", AttrValue::Nominal("square".into()))]));
        node.increment_counts(&instance(&[("shape", AttrValue::Nominal("square".into()))]));

        assert_eq!(node.count, 2);
        match &node.av_counts[&AttrName::new("shape")] {
            AttrCounts::Nominal(map) => {
                assert_eq!(map[&NominalValue::new("square")], 2);
            }
            _ => panic!("expected nominal counts"),
        }
    }

    #[test]
    fn increment_counts_updates_numeric_accumulator() {
        let mut node = ConceptNode::new_root();
        node.increment_counts(&instance(&[("size", AttrValue::Numeric(1.0))]));
        node.increment_counts(&instance(&[("size", AttrValue::Numeric(3.0))]));

        match &node.av_counts[&AttrName::new("size")] {
            AttrCounts::Numeric(cv) => {
                assert_eq!(cv.num(), 2);
                assert!((cv.unbiased_mean() - 2.0).abs() < 1e-9);
            }
            _ => panic!("expected numeric counts"),
        }
    }

    #[test]
    fn is_exact_match_true_for_single_matching_nominal_instance() {
        let inst = instance(&[("shape", AttrValue::Nominal("square".into()))]);
        let mut node = ConceptNode::new_root();
        node.increment_counts(&inst);
        assert!(node.is_exact_match(&inst, &[]));
    }

    #[test]
    fn is_exact_match_false_once_node_has_two_distinct_values() {
        let mut node = ConceptNode::new_root();
        node.increment_counts(&instance(&[("shape", AttrValue::Nominal("square".into()))]));
        node.increment_counts(&instance(&[("shape", AttrValue::Nominal("circle".into()))]));
        assert!(!node.is_exact_match(
            &instance(&[("shape", AttrValue::Nominal("square".into()))]),
            &[],
        ));
    }

    #[test]
    fn is_exact_match_ignores_hidden_attributes() {
        let mut node = ConceptNode::new_root();
        node.increment_counts(&instance(&[
            ("shape", AttrValue::Nominal("square".into())),
            ("_source", AttrValue::Nominal("sensor-1".into())),
        ]));
        assert!(node.is_exact_match(
            &instance(&[
                ("shape", AttrValue::Nominal("square".into())),
                ("_source", AttrValue::Nominal("sensor-2".into())),
            ]),
            &[],
        ));
    }

    #[test]
    fn update_counts_from_node_sums_counts_and_descendants() {
        let mut a = ConceptNode::new_root();
        a.increment_counts(&instance(&[("shape", AttrValue::Nominal("square".into()))]));
        a.descendants.insert(NodeId(1));

        let mut b = ConceptNode::new_root();
        b.increment_counts(&instance(&[("shape", AttrValue::Nominal("circle".into()))]));
        b.descendants.insert(NodeId(2));

        a.update_counts_from_node(&b);
        assert_eq!(a.count, 2);
        assert_eq!(a.descendants, BTreeSet::from([NodeId(1), NodeId(2)]));
    }
}
