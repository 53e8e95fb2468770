//! Category utility: the "is this instance well categorized here" score,
//! extended with a contextual term computed by a depth-first descent of
//! the tree.
//!
//! Category utility here is the raw expected-correct-guesses sum, as
//! defined in the glossary: comparisons between candidate operations at a
//! single decision point always share the same baseline parent, so it
//! cancels and is never computed explicitly.

use std::collections::HashMap;
use std::f64::consts::PI;

use itertools::Itertools;

use crate::context::{is_descendant_of, is_unadded_leaf_of, ContextHandleId};
use crate::node::{AttrCounts, ConceptNode, NodeId};
use crate::tree::{ContextualCobwebTree, TreeConfig};
use crate::value::{AttrName, Instance};

/// One of the four restructuring operations `get_best_operation` chooses
/// between. Tie-break priority (highest first) is `Best > New > Split >
/// Merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Merge,
    Split,
    New,
    Best,
}

impl Operation {
    fn priority(self) -> u8 {
        match self {
            Self::Merge => 0,
            Self::Split => 1,
            Self::New => 2,
            Self::Best => 3,
        }
    }
}

/// Weighted average of children's expected-correct-guesses, normalized by
/// the number of children in the candidate partition. `parent_count` is the
/// total count the partition's children sum to (the parent's count *after*
/// whatever operation produced this partition).
fn cu_of_partition(parent_count: u64, children: &[(u64, f64)]) -> f64 {
    if parent_count == 0 || children.is_empty() {
        return 0.0;
    }
    let m = children.len() as f64;
    children
        .iter()
        .map(|&(count, ec)| (count as f64 / parent_count as f64) * ec)
        .sum::<f64>()
        / m
}

impl ContextualCobwebTree {
    /// The expected proportion of attribute values correctly guessed at
    /// `node`, averaged over attributes (including the contextual attribute,
    /// weighted by `ctxt_weight`, if present).
    pub(crate) fn expected_correct_guesses(&self, node: &ConceptNode) -> f64 {
        let mut correct_guesses = 0.0;
        let mut attr_count = 0.0;

        for (attr, counts) in &node.av_counts {
            if attr.is_ctx() {
                attr_count += self.config.ctxt_weight;
                if let AttrCounts::Context(map) = counts {
                    correct_guesses +=
                        self.expected_contextual(map, node.context_size) * self.config.ctxt_weight;
                }
                continue;
            }

            attr_count += 1.0;

            match counts {
                AttrCounts::Numeric(cv) => {
                    let scale = self.numeric_scale(attr);
                    let scaled_std = cv.scaled_unbiased_std(scale);
                    let std = (scaled_std * scaled_std + 1.0 / (4.0 * PI)).sqrt();
                    let prob_attr = cv.num() as f64 / node.count as f64;
                    correct_guesses += (prob_attr * prob_attr) * (1.0 / (2.0 * PI.sqrt() * std));
                }
                AttrCounts::Nominal(map) => {
                    for &count in map.values() {
                        let prob = count as f64 / node.count as f64;
                        correct_guesses += prob * prob;
                    }
                }
                AttrCounts::Context(_) => unreachable!("handled above"),
            }
        }

        if attr_count == 0.0 {
            0.0
        } else {
            correct_guesses / attr_count
        }
    }

    fn numeric_scale(&self, attr: &AttrName) -> f64 {
        let scaling = match self.config.scaling {
            Some(scaling) => scaling,
            None => return 1.0,
        };
        let inner = if self.config.inner_attr_scaling {
            AttrName::new(attr.inner())
        } else {
            attr.clone()
        };
        match self.attr_scales.get(&inner) {
            Some(population) => (1.0 / scaling) * population.unbiased_std(),
            None => 1.0,
        }
    }

    fn expected_contextual(&self, ctxt_counts: &HashMap<ContextHandleId, u64>, context_size: u64) -> f64 {
        if context_size == 0 {
            return 0.0;
        }
        let items: Vec<(ContextHandleId, u64)> =
            ctxt_counts.iter().map(|(&k, &v)| (k, v)).collect();
        self.exp_ctxt_helper(self.root, 0, 0, &items) / (context_size * context_size) as f64
    }

    fn exp_ctxt_helper(
        &self,
        cur: NodeId,
        partial_guesses: u64,
        partial_len: u64,
        ctxt: &[(ContextHandleId, u64)],
    ) -> f64 {
        let mut squared_ualeaf_count: u64 = 0;
        let mut cum_ualeaf_count: u64 = 0;
        let mut added_leaf_count: u64 = 0;
        let mut extra_guesses: u64 = 0;
        let mut descendants: Vec<(ContextHandleId, u64)> = Vec::new();

        for &(handle_id, count) in ctxt {
            let handle = &self.context_handles[handle_id.0];
            if is_descendant_of(handle, cur, &self.nodes) {
                descendants.push((handle_id, count));
                extra_guesses += count;
                if is_unadded_leaf_of(handle, cur) {
                    squared_ualeaf_count += count * count;
                    cum_ualeaf_count += count;
                } else {
                    added_leaf_count = count;
                }
            }
        }

        if extra_guesses == 0 {
            return 0.0;
        }

        let new_partial_guesses = partial_guesses + extra_guesses;
        let new_partial_len = partial_len + 1;

        let mut partial_cu = if cum_ualeaf_count > 0 {
            (cum_ualeaf_count as f64 * new_partial_guesses as f64 + squared_ualeaf_count as f64)
                / (new_partial_len as f64 + 1.0)
        } else {
            0.0
        };

        let node = &self.nodes[cur.0];
        if partial_len >= TreeConfig::DEPTH_CAP || node.is_leaf() {
            return added_leaf_count as f64 * new_partial_guesses as f64 / new_partial_len as f64
                + partial_cu;
        }

        for &child in &node.children {
            partial_cu += self.exp_ctxt_helper(child, new_partial_guesses, new_partial_len, &descendants);
        }
        partial_cu
    }

    /// Category utility of inserting `instance` into each of `parent`'s
    /// children, returning the best two (the second is `None` if `parent`
    /// has only one child). Ties are broken by child count, descending.
    pub(crate) fn two_best_children(
        &self,
        parent: NodeId,
        instance: &Instance,
    ) -> (f64, NodeId, Option<NodeId>) {
        let children = self.nodes[parent.0].children.clone();
        assert!(!children.is_empty(), "two_best_children requires at least one child");

        let trial_parent_count = self.nodes[parent.0].count + 1;

        let mut scored: Vec<(f64, u64, NodeId)> = Vec::with_capacity(children.len());
        for &candidate in &children {
            let mut trial = self.nodes[candidate.0].clone();
            trial.increment_counts(instance);
            let trial_ec = self.expected_correct_guesses(&trial);

            let partition: Vec<(u64, f64)> = children
                .iter()
                .map(|&child| {
                    if child == candidate {
                        (trial.count, trial_ec)
                    } else {
                        (
                            self.nodes[child.0].count,
                            self.expected_correct_guesses(&self.nodes[child.0]),
                        )
                    }
                })
                .collect();

            let cu = cu_of_partition(trial_parent_count, &partition);
            scored.push((cu, self.nodes[candidate.0].count, candidate));
        }

        let scored: Vec<_> = scored
            .into_iter()
            .sorted_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.1.cmp(&a.1))
            })
            .collect();

        let best1 = scored[0];
        let best2 = scored.get(1).copied();
        (best1.0, best1.2, best2.map(|b| b.2))
    }

    pub(crate) fn cu_for_new_child(&self, parent: NodeId, instance: &Instance) -> f64 {
        let parent_node = &self.nodes[parent.0];
        let trial_parent_count = parent_node.count + 1;

        let mut new_leaf = ConceptNode::new_leaf(Some(parent));
        new_leaf.increment_counts(instance);
        let new_leaf_ec = self.expected_correct_guesses(&new_leaf);

        let mut partition: Vec<(u64, f64)> = parent_node
            .children
            .iter()
            .map(|&child| {
                (
                    self.nodes[child.0].count,
                    self.expected_correct_guesses(&self.nodes[child.0]),
                )
            })
            .collect();
        partition.push((new_leaf.count, new_leaf_ec));

        cu_of_partition(trial_parent_count, &partition)
    }

    fn cu_for_merge(&self, parent: NodeId, best1: NodeId, best2: NodeId) -> f64 {
        let parent_node = &self.nodes[parent.0];
        let parent_count = parent_node.count;

        let mut merged = self.nodes[best1.0].clone();
        merged.update_counts_from_node(&self.nodes[best2.0]);
        let merged_ec = self.expected_correct_guesses(&merged);

        let mut partition: Vec<(u64, f64)> = parent_node
            .children
            .iter()
            .filter(|&&child| child != best1 && child != best2)
            .map(|&child| {
                (
                    self.nodes[child.0].count,
                    self.expected_correct_guesses(&self.nodes[child.0]),
                )
            })
            .collect();
        partition.push((merged.count, merged_ec));

        cu_of_partition(parent_count, &partition)
    }

    fn cu_for_split(&self, parent: NodeId, best1: NodeId) -> f64 {
        let parent_node = &self.nodes[parent.0];
        let parent_count = parent_node.count;

        let mut partition: Vec<(u64, f64)> = parent_node
            .children
            .iter()
            .filter(|&&child| child != best1)
            .map(|&child| {
                (
                    self.nodes[child.0].count,
                    self.expected_correct_guesses(&self.nodes[child.0]),
                )
            })
            .collect();
        for &grandchild in &self.nodes[best1.0].children {
            partition.push((
                self.nodes[grandchild.0].count,
                self.expected_correct_guesses(&self.nodes[grandchild.0]),
            ));
        }

        cu_of_partition(parent_count, &partition)
    }

    /// Scores the requested subset of `{best, new, merge, split}` for
    /// `instance` at `parent`, returning the winning operation's category
    /// utility and name. Ties broken `best > new > split > merge`.
    pub(crate) fn get_best_operation(
        &self,
        parent: NodeId,
        instance: &Instance,
        best1: NodeId,
        best2: Option<NodeId>,
        best1_cu: f64,
        possible_ops: &[Operation],
    ) -> (f64, Operation) {
        let mut candidates: Vec<(f64, Operation)> = Vec::new();

        if possible_ops.contains(&Operation::Best) {
            candidates.push((best1_cu, Operation::Best));
        }
        if possible_ops.contains(&Operation::New) {
            candidates.push((self.cu_for_new_child(parent, instance), Operation::New));
        }
        if possible_ops.contains(&Operation::Merge)
            && self.nodes[parent.0].children.len() > 2
            && best2.is_some()
        {
            candidates.push((
                self.cu_for_merge(parent, best1, best2.unwrap()),
                Operation::Merge,
            ));
        }
        if possible_ops.contains(&Operation::Split) && !self.nodes[best1.0].children.is_empty() {
            candidates.push((self.cu_for_split(parent, best1), Operation::Split));
        }

        assert!(!candidates.is_empty(), "no operation was entertained");

        candidates
            .into_iter()
            .max_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.priority().cmp(&b.1.priority()))
            })
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::value::{AttrValue, NominalValue};

    fn inst(attr: &str, val: &str) -> Instance {
        let mut m = Instance::new();
        m.insert(AttrName::new(attr), AttrValue::Nominal(NominalValue::new(val)));
        m
    }

    #[test]
    fn identical_instance_scores_higher_best_than_new() {
        let mut tree = ContextualCobwebTree::new(TreeConfig::default());
        tree.contextual_ifit(vec![inst("a", "1")], 1, crate::tree::ContextKey::SymmetricWindow)
            .unwrap();

        let (best1_cu, best1, best2) = tree.two_best_children(tree.root, &inst("a", "1"));
        assert!(best2.is_none());
        let (_, action) = tree.get_best_operation(
            tree.root,
            &inst("a", "1"),
            best1,
            best2,
            best1_cu,
            &[Operation::Best, Operation::New],
        );
        assert_eq!(action, Operation::Best);
    }

    #[test]
    fn distinct_instance_prefers_new_child() {
        let mut tree = ContextualCobwebTree::new(TreeConfig::default());
        tree.contextual_ifit(vec![inst("a", "1")], 1, crate::tree::ContextKey::SymmetricWindow)
            .unwrap();

        let (best1_cu, best1, best2) = tree.two_best_children(tree.root, &inst("a", "2"));
        let (_, action) = tree.get_best_operation(
            tree.root,
            &inst("a", "2"),
            best1,
            best2,
            best1_cu,
            &[Operation::Best, Operation::New],
        );
        assert_eq!(action, Operation::New);
    }

    #[test]
    fn expected_correct_guesses_is_one_for_a_pure_single_valued_leaf() {
        let mut tree = ContextualCobwebTree::new(TreeConfig::default());
        tree.contextual_ifit(
            vec![inst("a", "1"), inst("a", "1")],
            1,
            crate::tree::ContextKey::SymmetricWindow,
        )
        .unwrap();
        let ec = tree.expected_correct_guesses(tree.root_node());
        assert_abs_diff_eq!(ec, 1.0, epsilon = 1e-9);
    }
}
