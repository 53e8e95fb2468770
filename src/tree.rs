//! The tree/window driver: owns the node and context-handle arenas and runs
//! the contextual stabilization loop.

use std::collections::{BTreeMap, HashSet, VecDeque};

use log::{debug, info, trace, warn};

use crate::accumulator::ContinuousValue;
use crate::context::{is_descendant_of, is_unadded_leaf_of, ContextHandleId, ContextHandleState};
use crate::cu::Operation;
use crate::error::ContextualCobwebError;
use crate::node::{ConceptNode, NodeId};
use crate::value::{AttrName, AttrValue, Instance, NominalValue};

/// How the contextual window around an instance is constructed. Only
/// `SymmetricWindow` is implemented; the other variants are rejected at the
/// public entry points with [`ContextualCobwebError::InvalidContextKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKey {
    /// `context_size` instances on either side of the anchor.
    SymmetricWindow,
    /// `context_size` instances to the left of the anchor. Not implemented.
    PastWindow,
    /// `context_size` instances to the right of the anchor. Not implemented.
    FutureWindow,
}

/// How `merge_contexts` decides that two committed leaves' context handles
/// are structurally equivalent and can be collapsed into one representative
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeContextEquivalence {
    /// Any descendant leaf in the subtree with a non-null (unconsolidated)
    /// context handle is considered equivalent. This is the original
    /// design's rule; it is loose; it conflates unrelated instances that
    /// happen to land in the same subtree.
    #[default]
    AnyNonNull,
    /// Requires the leaves to share the same sibling-order path prefix down
    /// to the compaction root, a stricter alternative for callers who need
    /// to avoid the conflation `AnyNonNull` accepts.
    SamePathPrefix,
}

/// Tunable parameters for a [`ContextualCobwebTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Weight of the contextual attribute in category utility.
    pub ctxt_weight: f64,
    /// Numeric std scaling target; `None` disables scaling.
    pub scaling: Option<f64>,
    /// Whether to key numeric scaling by the innermost component of
    /// tuple-structured attribute names.
    pub inner_attr_scaling: bool,
    /// `merge_contexts` structural-equivalence rule.
    pub merge_context_equivalence: MergeContextEquivalence,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            ctxt_weight: 1.0,
            scaling: Some(0.5),
            inner_attr_scaling: true,
            merge_context_equivalence: MergeContextEquivalence::default(),
        }
    }
}

impl TreeConfig {
    /// Cap on recursion depth for the contextual category-utility descent.
    pub const DEPTH_CAP: u64 = 6;
    /// Compaction depth for `merge_contexts`.
    pub const MERGE_DEPTH: u64 = Self::DEPTH_CAP + 2;
    /// Commits between automatic `merge_contexts` calls.
    pub const COMPACTION_PERIOD: u64 = 200;
}

/// Per-decision-point bookkeeping recorded by `cobweb_path_and_restructurings`,
/// enough to later ask whether a `merge` or `split` at that level would
/// improve category utility.
#[derive(Debug, Clone)]
pub(crate) struct PendingAction {
    pub current: NodeId,
    pub action_cu: f64,
    pub best1_cu: f64,
    pub best2: Option<NodeId>,
    pub best1: NodeId,
}

/// An incremental hierarchical concept-formation tree over instances whose
/// descriptions may include a contextual attribute referencing neighboring
/// instances.
#[derive(Debug, Clone)]
pub struct ContextualCobwebTree {
    pub(crate) nodes: Vec<ConceptNode>,
    pub(crate) context_handles: Vec<ContextHandleState>,
    pub(crate) root: NodeId,
    pub(crate) config: TreeConfig,
    pub(crate) attr_scales: BTreeMap<AttrName, ContinuousValue>,
}

impl ContextualCobwebTree {
    /// Builds a fresh, empty tree.
    #[must_use]
    pub fn new(config: TreeConfig) -> Self {
        let root = ConceptNode::new_root();
        Self {
            nodes: vec![root],
            context_handles: Vec::new(),
            root: NodeId(0),
            config,
            attr_scales: BTreeMap::new(),
        }
    }

    /// Resets the tree's concepts, preserving scaling/weight parameters.
    pub fn clear(&mut self) {
        info!("clearing tree, preserving configuration");
        self.nodes = vec![ConceptNode::new_root()];
        self.context_handles.clear();
        self.root = NodeId(0);
        self.attr_scales.clear();
    }

    /// A read-only view of the root node.
    #[must_use]
    pub fn root_node(&self) -> &ConceptNode {
        &self.nodes[self.root.0]
    }

    /// The current root's id. This changes across the tree's lifetime
    /// whenever a fringe split pushes a new parent above the previous
    /// root (see [`Self::insert_parent_with_current_counts`]), so callers
    /// that need a stable handle on "the root" should re-fetch this after
    /// every mutating call rather than caching it.
    #[must_use]
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &ConceptNode {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    fn inner_attr(&self, attr: &AttrName) -> AttrName {
        if self.config.inner_attr_scaling {
            AttrName::new(attr.inner())
        } else {
            attr.clone()
        }
    }

    fn update_attr_scales(&mut self, instance: &Instance) {
        for (attr, value) in instance {
            if let AttrValue::Numeric(v) = value {
                let key = self.inner_attr(attr);
                self.attr_scales
                    .entry(key)
                    .or_insert_with(ContinuousValue::new)
                    .update(*v);
            }
        }
    }

    // ---- arena-mutating node operations ----

    pub(crate) fn create_new_child(&mut self, parent: NodeId, instance: &Instance) -> NodeId {
        let mut leaf = ConceptNode::new_leaf(Some(parent));
        leaf.increment_counts(instance);
        leaf.descendants.insert(NodeId(self.nodes.len()));
        let id = NodeId(self.nodes.len());
        self.nodes.push(leaf);
        self.nodes[parent.0].children.push(id);

        let mut ancestor = Some(parent);
        while let Some(node_id) = ancestor {
            self.nodes[node_id.0].descendants.insert(id);
            ancestor = self.nodes[node_id.0].parent;
        }
        id
    }

    pub(crate) fn insert_parent_with_current_counts(&mut self, node: NodeId) -> NodeId {
        debug_assert!(self.nodes[node.0].count > 0);

        let mut new_parent = ConceptNode::new_leaf(self.nodes[node.0].parent);
        new_parent.update_counts_from_node(&self.nodes[node.0]);
        let new_id = NodeId(self.nodes.len());
        self.nodes.push(new_parent);

        let old_parent = self.nodes[node.0].parent;
        match old_parent {
            Some(p) => {
                let idx = self.nodes[p.0]
                    .children
                    .iter()
                    .position(|&c| c == node)
                    .expect("node must be a child of its recorded parent");
                self.nodes[p.0].children[idx] = new_id;
            }
            None => {
                self.root = new_id;
            }
        }

        self.nodes[new_id.0].children.push(node);
        self.nodes[node.0].parent = Some(new_id);
        new_id
    }

    pub(crate) fn create_new_leaf(&mut self, parent: NodeId, instance: &Instance, ctx: ContextHandleId) -> NodeId {
        let leaf = self.create_new_child(parent, instance);
        self.context_handles[ctx.0].set_instance(leaf);
        leaf
    }

    pub(crate) fn merge(&mut self, parent: NodeId, best1: NodeId, best2: NodeId) -> NodeId {
        let mut merged = ConceptNode::new_leaf(Some(parent));
        merged.update_counts_from_node(&self.nodes[best1.0]);
        merged.update_counts_from_node(&self.nodes[best2.0]);
        merged.children = vec![best1, best2];

        let merge_id = NodeId(self.nodes.len());
        self.nodes.push(merged);

        self.nodes[parent.0]
            .children
            .retain(|&c| c != best1 && c != best2);
        self.nodes[parent.0].children.push(merge_id);
        self.nodes[best1.0].parent = Some(merge_id);
        self.nodes[best2.0].parent = Some(merge_id);
        merge_id
    }

    pub(crate) fn split(&mut self, parent: NodeId, best1: NodeId) {
        let children = std::mem::take(&mut self.nodes[best1.0].children);
        for &child in &children {
            self.nodes[child.0].parent = Some(parent);
        }
        self.nodes[parent.0].children.retain(|&c| c != best1);
        self.nodes[parent.0].children.extend(children);
    }

    // ---- public API ----

    /// Incrementally fits new instances into the tree, returning the nodes
    /// they were committed to. Rejects unsupported `context_key`s at entry.
    /// `context_size == 0` is a legitimate, supported window radius (no
    /// context).
    pub fn contextual_ifit(
        &mut self,
        instances: Vec<Instance>,
        context_size: usize,
        context_key: ContextKey,
    ) -> Result<Vec<NodeId>, ContextualCobwebError> {
        if context_key != ContextKey::SymmetricWindow {
            return Err(ContextualCobwebError::InvalidContextKey);
        }
        self.contextual_cobweb(instances, context_size, context_key, true)
    }

    /// Categorizes `instances` (one of which must be `None`, the anchor to
    /// predict) and returns the predicted value of `anchor_attr` at the
    /// categorized leaf. The contextual attribute itself can never be
    /// predicted.
    pub fn infer_from_context(
        &mut self,
        mut instances: Vec<Option<Instance>>,
        anchor_attr: &AttrName,
        context_size: usize,
        context_key: ContextKey,
    ) -> Result<AttrValue, ContextualCobwebError> {
        if anchor_attr.is_ctx() {
            return Err(ContextualCobwebError::ContextPredictionUnsupported);
        }
        if instances.len() < 2 {
            return Err(ContextualCobwebError::EmptyInferenceInput);
        }
        if context_key != ContextKey::SymmetricWindow {
            return Err(ContextualCobwebError::InvalidContextKey);
        }

        let missing: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.is_none())
            .map(|(i, _)| i)
            .collect();
        let pred_ind = match missing.as_slice() {
            [] => return Err(ContextualCobwebError::MissingAnchorNotFound),
            [only] => *only,
            _ => return Err(ContextualCobwebError::MultipleAnchorsMissing),
        };
        instances.remove(pred_ind);
        let instances: Vec<Instance> = instances.into_iter().map(|i| i.unwrap()).collect();

        let contexts = self.contextual_cobweb(instances, context_size, context_key, false)?;

        let lo = pred_ind.saturating_sub(context_size);
        let hi = (pred_ind + context_size).min(contexts.len());
        let neighbor_handles: Vec<ContextHandleId> = contexts[lo..hi]
            .iter()
            .map(|&node_id| self.commit_as_handle(node_id))
            .collect();

        let mut synthetic = Instance::new();
        synthetic.insert(AttrName::ctx(), AttrValue::Context(neighbor_handles));

        let path = self.cobweb_path(&synthetic);
        let leaf = *path.last().expect("cobweb_path never returns an empty path");
        self.predict(leaf, anchor_attr)
    }

    fn commit_as_handle(&mut self, node: NodeId) -> ContextHandleId {
        self.context_handles
            .push(ContextHandleState::Committed(node));
        ContextHandleId(self.context_handles.len() - 1)
    }

    /// Predicts the most likely value of `attr` at `node` (the nominal
    /// value, or numeric mean, with the highest count). Refuses to predict
    /// the contextual attribute.
    pub fn predict(
        &self,
        node: NodeId,
        attr: &AttrName,
    ) -> Result<AttrValue, ContextualCobwebError> {
        if attr.is_ctx() {
            return Err(ContextualCobwebError::ContextPredictionUnsupported);
        }

        let counts = match self.nodes[node.0].av_counts.get(attr) {
            Some(counts) => counts,
            None => return Ok(AttrValue::Nominal(NominalValue::new(""))),
        };

        match counts {
            crate::node::AttrCounts::Numeric(cv) => Ok(AttrValue::Numeric(cv.unbiased_mean())),
            crate::node::AttrCounts::Nominal(map) => {
                let best = map
                    .iter()
                    .max_by_key(|(_, &count)| count)
                    .map(|(value, _)| value.clone())
                    .unwrap_or_else(|| NominalValue::new(""));
                Ok(AttrValue::Nominal(best))
            }
            crate::node::AttrCounts::Context(_) => {
                Err(ContextualCobwebError::ContextPredictionUnsupported)
            }
        }
    }

    /// Exports the tree as a read-only JSON value: each node becomes
    /// `{name, size, children, counts}`, recursively from the root.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        crate::json::node_to_json(self, self.root)
    }
}

impl ContextualCobwebTree {
    /// Returns the best-guess insertion path for `instance`, descending
    /// while `best` beats `new`. Leaves terminate the descent immediately.
    pub(crate) fn cobweb_path(&self, instance: &Instance) -> Vec<NodeId> {
        let mut current = self.root;
        let mut path = Vec::new();

        loop {
            path.push(current);
            if self.nodes[current.0].is_leaf() {
                break;
            }

            let (best1_cu, best1, best2) = self.two_best_children(current, instance);
            let (_, action) = self.get_best_operation(
                current,
                instance,
                best1,
                best2,
                best1_cu,
                &[Operation::Best, Operation::New],
            );

            match action {
                Operation::Best => current = best1,
                Operation::New => break,
                _ => unreachable!("cobweb_path only entertains best/new"),
            }
        }

        path
    }

    /// Same descent as [`Self::cobweb_path`], additionally recording enough
    /// information at each level to later ask whether `merge`/`split` would
    /// improve category utility there.
    pub(crate) fn cobweb_path_and_restructurings(
        &self,
        instance: &Instance,
    ) -> (Vec<NodeId>, Vec<PendingAction>) {
        let mut current = self.root;
        let mut path = Vec::new();
        let mut actions = Vec::new();

        loop {
            path.push(current);
            if self.nodes[current.0].is_leaf() {
                break;
            }

            let (best1_cu, best1, best2) = self.two_best_children(current, instance);
            let (action_cu, action) = self.get_best_operation(
                current,
                instance,
                best1,
                best2,
                best1_cu,
                &[Operation::Best, Operation::New],
            );

            actions.push(PendingAction {
                current,
                action_cu,
                best1_cu,
                best2,
                best1,
            });
            current = best1;
            if action == Operation::New {
                break;
            }
        }

        (path, actions)
    }

    /// The core context-aware algorithm: categorizes and, if `learning`, adds
    /// instances to the tree. Returns the committed (or, without learning,
    /// final tentative) leaf for each input instance, in input order.
    pub(crate) fn contextual_cobweb(
        &mut self,
        instances: Vec<Instance>,
        context_size: usize,
        context_key: ContextKey,
        learning: bool,
    ) -> Result<Vec<NodeId>, ContextualCobwebError> {
        if context_key != ContextKey::SymmetricWindow {
            return Err(ContextualCobwebError::InvalidContextKey);
        }

        let mut fixed = Vec::new();
        if instances.is_empty() {
            return Ok(fixed);
        }

        let initial_len = (context_size + 1).min(instances.len());
        let mut window: VecDeque<(Instance, ContextHandleId)> = VecDeque::new();
        let mut initial_handles = Vec::with_capacity(initial_len);
        for inst in &instances[..initial_len] {
            let path = self.cobweb_path(inst);
            initial_handles.push(self.push_tentative_handle(path));
        }
        for (i, inst) in instances[..initial_len].iter().enumerate() {
            let mut inst = inst.clone();
            let neighbors: Vec<ContextHandleId> = initial_handles
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &h)| h)
                .collect();
            inst.insert(AttrName::ctx(), AttrValue::Context(neighbors));
            window.push_back((inst, initial_handles[i]));
        }

        let mut next_to_initialize = initial_len;

        while !window.is_empty() {
            if next_to_initialize as u64 % TreeConfig::COMPACTION_PERIOD == 0 {
                self.merge_contexts(TreeConfig::MERGE_DEPTH);
            }

            let max_iterations = 1000 * (context_size as u64 + 1);
            let mut actions: Vec<PendingAction> = Vec::new();
            let mut last_changed = window.len() - 1;
            let mut looped = false;
            let mut records: HashSet<Vec<NodeId>> = HashSet::new();
            let mut iterations: u64 = 0;

            'stabilize: loop {
                for index in 0..window.len() {
                    let inst_ptr = window[index].0.clone();
                    let ctx_id = window[index].1;

                    let (path, new_actions) = if index == 0 {
                        iterations += 1;
                        let record: Vec<NodeId> = window
                            .iter()
                            .map(|(_, h)| self.context_handles[h.0].current())
                            .collect();
                        if !records.insert(record) {
                            looped = true;
                        }

                        let (path, new_actions) =
                            self.cobweb_path_and_restructurings(&inst_ptr);
                        (path, Some(new_actions))
                    } else {
                        (self.cobweb_path(&inst_ptr), None)
                    };

                    let unchanged = Self::path_eq(
                        self.context_handles[ctx_id.0].tentative_path(),
                        &path,
                    );

                    if looped {
                        if !unchanged && self.update_if_better(&window, &path, ctx_id) {
                            if let Some(new_actions) = new_actions {
                                actions = new_actions;
                            }
                            last_changed = index;
                        } else if last_changed == index {
                            break 'stabilize;
                        }
                    } else if !unchanged {
                        self.context_handles[ctx_id.0].set_path(path);
                        if let Some(new_actions) = new_actions {
                            actions = new_actions;
                        }
                        last_changed = index;
                    } else if last_changed == index {
                        break 'stabilize;
                    }

                    if iterations >= max_iterations {
                        warn!(
                            "stabilization loop forced to converge after {iterations} sweeps; \
                             committing best-known paths for window starting at commit {next_to_initialize}",
                        );
                        break 'stabilize;
                    }
                }
            }
            trace!("window stabilized after {iterations} iterations");

            let (instance, ctx_id) = window.pop_front().unwrap();
            if learning {
                let leaf = self.add_by_path(instance, ctx_id, &actions, &window);
                debug!("committed instance {next_to_initialize} to node {leaf:?}");
                fixed.push(leaf);
            } else {
                fixed.push(self.context_handles[ctx_id.0].current());
            }

            if next_to_initialize < instances.len() {
                let mut inst = instances[next_to_initialize].clone();
                let neighbors: Vec<ContextHandleId> =
                    window.iter().map(|(_, h)| *h).collect();
                inst.insert(AttrName::ctx(), AttrValue::Context(neighbors));
                let path = self.cobweb_path(&inst);
                let new_ctx = self.push_tentative_handle(path);
                for (existing, _) in window.iter_mut() {
                    if let Some(AttrValue::Context(handles)) =
                        existing.get_mut(&AttrName::ctx())
                    {
                        handles.push(new_ctx);
                    }
                }
                window.push_back((inst, new_ctx));
                next_to_initialize += 1;
            }
        }

        Ok(fixed)
    }

    fn push_tentative_handle(&mut self, path: Vec<NodeId>) -> ContextHandleId {
        self.context_handles.push(ContextHandleState::tentative(path));
        ContextHandleId(self.context_handles.len() - 1)
    }

    fn path_eq(set_path: Option<&[NodeId]>, tup_path: &[NodeId]) -> bool {
        match set_path {
            Some(set_path) => {
                tup_path.len() == set_path.len()
                    && tup_path.iter().all(|n| set_path.contains(n))
            }
            None => false,
        }
    }

    fn window_cu(&self, window: &VecDeque<(Instance, ContextHandleId)>) -> f64 {
        window
            .iter()
            .map(|(inst, ctx_id)| {
                let leaf = self.context_handles[ctx_id.0].current();
                self.cu_for_new_child(leaf, inst)
            })
            .sum()
    }

    fn update_if_better(
        &mut self,
        window: &VecDeque<(Instance, ContextHandleId)>,
        new_path: &[NodeId],
        ctx_id: ContextHandleId,
    ) -> bool {
        let old_state = self.context_handles[ctx_id.0].clone();
        let old_cu = self.window_cu(window);
        self.context_handles[ctx_id.0].set_path(new_path.to_vec());
        let new_cu = self.window_cu(window);

        if new_cu > old_cu {
            true
        } else {
            self.context_handles[ctx_id.0] = old_state;
            false
        }
    }

    /// Commits `instance` (held by `ctx_id`) into the tree, performing a
    /// fringe split if necessary, then runs `increment_and_restructure`.
    pub(crate) fn add_by_path(
        &mut self,
        instance: Instance,
        ctx_id: ContextHandleId,
        actions: &[PendingAction],
        unadded_window: &VecDeque<(Instance, ContextHandleId)>,
    ) -> NodeId {
        let where_to_add = self.context_handles[ctx_id.0].current();

        if !self.nodes[where_to_add.0].children.is_empty() {
            let leaf = self.create_new_leaf(where_to_add, &instance, ctx_id);
            self.increment_and_restructure(&instance, where_to_add, actions, unadded_window);
            return leaf;
        }

        if self.nodes[where_to_add.0].count == 0
            || self.nodes[where_to_add.0].is_exact_match(&instance, &self.context_handles)
        {
            // Only the still-empty root ever reaches this branch with
            // `count == 0`: every other leaf is born through
            // `create_new_child`, which already registers itself.
            self.nodes[where_to_add.0].descendants.insert(where_to_add);
            self.context_handles[ctx_id.0].set_instance(where_to_add);
            self.increment_and_restructure(&instance, where_to_add, actions, unadded_window);
            return where_to_add;
        }

        // Fringe split.
        let new_parent = self.insert_parent_with_current_counts(where_to_add);
        let leaf = self.create_new_leaf(new_parent, &instance, ctx_id);
        self.fringe_split_update(where_to_add, new_parent, unadded_window);

        let mut actions = actions.to_vec();
        if let Some(last) = actions.last_mut() {
            last.best1 = new_parent;
        }

        self.increment_and_restructure(&instance, new_parent, &actions, unadded_window);
        leaf
    }

    fn increment_and_restructure(
        &mut self,
        instance: &Instance,
        where_to_add: NodeId,
        actions: &[PendingAction],
        unadded_window: &VecDeque<(Instance, ContextHandleId)>,
    ) {
        self.update_attr_scales(instance);
        crate::node::increment_all_counts(&mut self.nodes, where_to_add, instance);

        for action in actions.iter().rev() {
            let current_children = self.nodes[action.current.0].children.len();
            let best1_is_leaf = self.nodes[action.best1.0].is_leaf();
            if current_children <= 2 && best1_is_leaf {
                continue;
            }

            let (new_action_cu, new_action) = self.get_best_operation(
                action.current,
                &Instance::new(),
                action.best1,
                action.best2,
                action.best1_cu,
                &[Operation::Split, Operation::Merge],
            );

            if new_action_cu <= action.action_cu {
                continue;
            }

            match new_action {
                Operation::Merge => {
                    let best2 = action
                        .best2
                        .expect("merge requires a second-best child");
                    debug_assert!(self.nodes[action.current.0].children.len() > 2);
                    let merge_id = self.merge(action.current, action.best1, best2);
                    self.merge_update(action.best1, best2, merge_id, unadded_window);
                }
                Operation::Split => {
                    debug_assert!(self.nodes[action.best1.0].children.len() > 1);
                    self.split(action.current, action.best1);
                    self.split_update(action.best1, action.current, unadded_window);
                }
                _ => unreachable!("increment_and_restructure only entertains split/merge"),
            }
        }
    }

    fn merge_update(
        &mut self,
        node1: NodeId,
        node2: NodeId,
        merge_parent: NodeId,
        unadded_window: &VecDeque<(Instance, ContextHandleId)>,
    ) {
        for (_, ctx_id) in unadded_window {
            let handle = &self.context_handles[ctx_id.0];
            debug_assert!(!handle.is_committed());
            if is_descendant_of(handle, node1, &self.nodes)
                || is_descendant_of(handle, node2, &self.nodes)
            {
                self.context_handles[ctx_id.0].insert_into_path(merge_parent);
            }
        }
    }

    fn split_update(
        &mut self,
        dead_node: NodeId,
        new_home: NodeId,
        unadded_window: &VecDeque<(Instance, ContextHandleId)>,
    ) {
        for (_, ctx_id) in unadded_window {
            let handle = &self.context_handles[ctx_id.0];
            debug_assert!(!handle.is_committed());
            if is_unadded_leaf_of(handle, dead_node) {
                self.context_handles[ctx_id.0].set_path(
                    self.context_handles[ctx_id.0]
                        .tentative_path()
                        .unwrap()
                        .iter()
                        .map(|&n| if n == dead_node { new_home } else { n })
                        .collect(),
                );
            }
        }
    }

    fn fringe_split_update(
        &mut self,
        fringe_leaf: NodeId,
        new_parent: NodeId,
        unadded_window: &VecDeque<(Instance, ContextHandleId)>,
    ) {
        for (_, ctx_id) in unadded_window {
            let handle = &self.context_handles[ctx_id.0];
            debug_assert!(!handle.is_committed());
            if is_unadded_leaf_of(handle, fringe_leaf) {
                self.context_handles[ctx_id.0].insert_into_path(new_parent);
                self.context_handles[ctx_id.0].set_path(
                    self.context_handles[ctx_id.0]
                        .tentative_path()
                        .unwrap()
                        .iter()
                        .map(|&n| if n == fringe_leaf { new_parent } else { n })
                        .collect(),
                );
            }
        }
    }

    /// Periodic compaction: descends to `depth_left` levels and
    /// collapses context handles the configured
    /// [`MergeContextEquivalence`] rule treats as equivalent, rewriting
    /// `CTX` counts throughout the tree accordingly.
    pub(crate) fn merge_contexts(&mut self, depth_left: u64) {
        let root = self.root;
        let mapping = self.merge_context_helper(root, depth_left);
        if mapping.is_empty() {
            return;
        }
        info!("merge_contexts collapsed {} context handles", mapping.len());

        for node in &mut self.nodes {
            if let Some(crate::node::AttrCounts::Context(counts)) =
                node.av_counts.get_mut(&AttrName::ctx())
            {
                let mut rewritten: std::collections::HashMap<ContextHandleId, u64> =
                    std::collections::HashMap::new();
                for (handle, count) in counts.drain() {
                    let target = mapping.get(&handle).copied().unwrap_or(handle);
                    *rewritten.entry(target).or_insert(0) += count;
                }
                *counts = rewritten;
            }
        }
    }

    fn merge_context_helper(
        &self,
        node: NodeId,
        depth_left: u64,
    ) -> std::collections::HashMap<ContextHandleId, ContextHandleId> {
        let mut mapping = std::collections::HashMap::new();
        if depth_left == 0 {
            return mapping;
        }

        match self.config.merge_context_equivalence {
            MergeContextEquivalence::AnyNonNull => {
                let mut representative = None;
                for &leaf in &self.nodes[node.0].descendants {
                    for (handle_id, handle) in self.context_handles.iter().enumerate() {
                        if let ContextHandleState::Committed(target) = handle {
                            if *target == leaf {
                                match representative {
                                    None => representative = Some(ContextHandleId(handle_id)),
                                    Some(rep) => {
                                        mapping.insert(ContextHandleId(handle_id), rep);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            MergeContextEquivalence::SamePathPrefix => {
                // Only collapse handles whose committed leaves are themselves
                // identical nodes (the strictest possible path-prefix
                // agreement at this depth); a weaker but still conservative
                // rule than AnyNonNull.
                let mut by_leaf: std::collections::HashMap<NodeId, ContextHandleId> =
                    std::collections::HashMap::new();
                for &leaf in &self.nodes[node.0].descendants {
                    for (handle_id, handle) in self.context_handles.iter().enumerate() {
                        if let ContextHandleState::Committed(target) = handle {
                            if *target == leaf {
                                by_leaf
                                    .entry(leaf)
                                    .and_modify(|rep| {
                                        mapping.insert(ContextHandleId(handle_id), *rep);
                                    })
                                    .or_insert(ContextHandleId(handle_id));
                            }
                        }
                    }
                }
            }
        }

        for &child in &self.nodes[node.0].children {
            mapping.extend(self.merge_context_helper(child, depth_left - 1));
        }

        mapping
    }
}
