use std::collections::BTreeSet;

use contextual_cobweb::error::ContextualCobwebError;
use contextual_cobweb::node::{AttrCounts, NodeId};
use contextual_cobweb::tree::{ContextKey, ContextualCobwebTree, TreeConfig};
use contextual_cobweb::value::{AttrName, AttrValue, Instance, NominalValue};

fn nominal(attr: &str, val: &str) -> (AttrName, AttrValue) {
    (AttrName::new(attr), AttrValue::Nominal(NominalValue::new(val)))
}

fn inst(pairs: &[(&str, &str)]) -> Instance {
    pairs
        .iter()
        .map(|&(a, v)| nominal(a, v))
        .collect()
}

/// Walks every node in the tree and checks (P1)-(P4): count/children-sum
/// agreement, descendant-set agreement, and per-attribute count totals.
fn assert_invariants(tree: &ContextualCobwebTree, root: NodeId) {
    let node = tree.node(root);

    if !node.children.is_empty() {
        let children_count: u64 = node.children.iter().map(|&c| tree.node(c).count).sum();
        assert_eq!(node.count, children_count, "(P1) count == sum(children.count)");

        let children_descendants: BTreeSet<NodeId> = node
            .children
            .iter()
            .flat_map(|&c| tree.node(c).descendants.iter().copied())
            .collect();
        assert_eq!(node.descendants, children_descendants, "(P2) descendants == union(children.descendants)");
    } else {
        assert_eq!(node.descendants, BTreeSet::from([root]), "a leaf's descendants is itself");
    }

    for (attr, counts) in &node.av_counts {
        if attr.is_ctx() {
            if let AttrCounts::Context(map) = counts {
                let total: u64 = map.values().sum();
                assert_eq!(total, node.context_size, "(P4) sum(CTX counts) == context_size");
            }
        } else {
            assert_eq!(counts.total(), node.count, "(P3) attribute counts sum to node.count");
        }
    }

    for &child in &node.children {
        assert_invariants(tree, child);
    }
}

#[test]
fn scenario_1_empty_start_one_instance() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let result = tree
        .contextual_ifit(vec![inst(&[("a", "1")])], 0, ContextKey::SymmetricWindow)
        .unwrap();

    assert_eq!(result.len(), 1);
    let root = tree.root_node();
    assert_eq!(root.count, 1);
    match &root.av_counts[&AttrName::new("a")] {
        AttrCounts::Nominal(map) => assert_eq!(map[&NominalValue::new("1")], 1),
        _ => panic!("expected nominal counts"),
    }
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn scenario_2_two_identical_instances_no_fringe_split() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    tree.contextual_ifit(
        vec![inst(&[("a", "1")]), inst(&[("a", "1")])],
        1,
        ContextKey::SymmetricWindow,
    )
    .unwrap();

    let root = tree.root_node();
    assert!(root.is_leaf());
    assert_eq!(root.count, 2);
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn scenario_3_two_distinct_instances_split_into_children() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    tree.contextual_ifit(
        vec![inst(&[("a", "1")]), inst(&[("a", "2")])],
        1,
        ContextKey::SymmetricWindow,
    )
    .unwrap();

    let root = tree.root_node();
    assert_eq!(root.count, 2);
    assert_eq!(root.children.len(), 2);
    for &child in &root.children {
        assert_eq!(tree.node(child).count, 1);
    }
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn scenario_4_fringe_split_pushes_leaf_down() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    tree.contextual_ifit(
        vec![inst(&[("a", "1")]), inst(&[("a", "1")])],
        1,
        ContextKey::SymmetricWindow,
    )
    .unwrap();
    assert!(tree.root_node().is_leaf());

    tree.contextual_ifit(vec![inst(&[("a", "2")])], 1, ContextKey::SymmetricWindow)
        .unwrap();

    let root = tree.root_node();
    assert!(!root.is_leaf(), "a fringe split must have occurred");
    assert_eq!(root.count, 3);
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn scenario_5_context_interaction_separates_repeated_tokens() {
    let mut tree = ContextualCobwebTree::new(TreeConfig {
        ctxt_weight: 1.0,
        ..TreeConfig::default()
    });
    let instances = vec![
        inst(&[("a", "x")]),
        inst(&[("a", "y")]),
        inst(&[("a", "x")]),
        inst(&[("a", "y")]),
    ];
    let leaves = tree
        .contextual_ifit(instances, 1, ContextKey::SymmetricWindow)
        .unwrap();
    assert_eq!(leaves.len(), 4);

    // Repeated tokens end up in distinct leaves from each other.
    assert_ne!(leaves[0], leaves[1]);
    assert_eq!(leaves[0], leaves[2], "both x's should categorize to the same leaf");
    assert_eq!(leaves[1], leaves[3], "both y's should categorize to the same leaf");

    assert_invariants(&tree, tree.root_id());

    let found_both_neighbors = tree.node(leaves[1]).av_counts.get(&AttrName::ctx()).is_some();
    assert!(found_both_neighbors, "the y leaf should carry CTX counts");
}

#[test]
fn scenario_6_no_learning_inference_predicts_anchor() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let mut training = Vec::new();
    for _ in 0..3 {
        training.push(inst(&[("a", "x"), ("Anchor", "y")]));
        training.push(inst(&[("a", "y"), ("Anchor", "x")]));
    }
    tree.contextual_ifit(training, 1, ContextKey::SymmetricWindow)
        .unwrap();

    let query = vec![
        Some(inst(&[("a", "x"), ("Anchor", "y")])),
        None,
        Some(inst(&[("a", "x"), ("Anchor", "y")])),
    ];
    let prediction = tree
        .infer_from_context(query, &AttrName::new("Anchor"), 1, ContextKey::SymmetricWindow)
        .unwrap();
    assert!(matches!(prediction, AttrValue::Nominal(_)));
}

#[test]
fn boundary_b1_short_input_commits_as_single_window() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let result = tree
        .contextual_ifit(vec![inst(&[("a", "1")]), inst(&[("a", "2")])], 4, ContextKey::SymmetricWindow)
        .unwrap();
    assert_eq!(result.len(), 2);
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn boundary_b2_all_identical_instances_single_leaf_no_splits() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let instances = vec![inst(&[("a", "1")]); 10];
    tree.contextual_ifit(instances, 2, ContextKey::SymmetricWindow)
        .unwrap();

    let root = tree.root_node();
    assert!(root.is_leaf());
    assert_eq!(root.count, 10);
}

#[test]
fn boundary_b3_zero_context_weight_ignores_contextual_term() {
    let mut tree = ContextualCobwebTree::new(TreeConfig {
        ctxt_weight: 0.0,
        ..TreeConfig::default()
    });
    let instances = vec![
        inst(&[("a", "x")]),
        inst(&[("a", "y")]),
        inst(&[("a", "x")]),
        inst(&[("a", "y")]),
    ];
    tree.contextual_ifit(instances, 1, ContextKey::SymmetricWindow)
        .unwrap();
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn determinism_d1_repeated_runs_are_bit_identical() {
    let instances = vec![
        inst(&[("a", "x")]),
        inst(&[("a", "y")]),
        inst(&[("a", "x")]),
        inst(&[("a", "z")]),
        inst(&[("a", "y")]),
    ];

    let mut tree_a = ContextualCobwebTree::new(TreeConfig::default());
    tree_a
        .contextual_ifit(instances.clone(), 2, ContextKey::SymmetricWindow)
        .unwrap();

    let mut tree_b = ContextualCobwebTree::new(TreeConfig::default());
    tree_b
        .contextual_ifit(instances, 2, ContextKey::SymmetricWindow)
        .unwrap();

    assert_eq!(tree_a.root_node().count, tree_b.root_node().count);
    assert_eq!(tree_a.root_node().children.len(), tree_b.root_node().children.len());
    assert_eq!(tree_a.to_json(), tree_b.to_json());
}

#[test]
fn zero_context_size_is_a_supported_window_radius() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let result = tree.contextual_ifit(
        vec![inst(&[("a", "1")]), inst(&[("a", "2")])],
        0,
        ContextKey::SymmetricWindow,
    );
    assert_eq!(result.unwrap().len(), 2);
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn context_prediction_is_refused() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    tree.contextual_ifit(vec![inst(&[("a", "1")]), inst(&[("a", "2")])], 1, ContextKey::SymmetricWindow)
        .unwrap();
    let root = tree.root_id();
    let result = tree.predict(root, &AttrName::ctx());
    assert!(matches!(result, Err(ContextualCobwebError::ContextPredictionUnsupported)));
}

#[test]
fn infer_from_context_rejects_multiple_missing_anchors() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    tree.contextual_ifit(vec![inst(&[("a", "1")]), inst(&[("a", "2")])], 1, ContextKey::SymmetricWindow)
        .unwrap();

    let query = vec![None, None, Some(inst(&[("a", "1")]))];
    let result = tree.infer_from_context(query, &AttrName::new("a"), 1, ContextKey::SymmetricWindow);
    assert!(matches!(result, Err(ContextualCobwebError::MultipleAnchorsMissing)));
}

#[test_log::test]
fn larger_sequence_compacts_via_merge_contexts_without_breaking_invariants() {
    let mut tree = ContextualCobwebTree::new(TreeConfig::default());
    let alphabet = ["alpha", "beta", "gamma"];
    let instances: Vec<Instance> = (0..450)
        .map(|i| inst(&[("token", alphabet[i % alphabet.len()])]))
        .collect();

    let committed = tree
        .contextual_ifit(instances, 3, ContextKey::SymmetricWindow)
        .unwrap();
    assert_eq!(committed.len(), 450);
    assert_invariants(&tree, tree.root_id());
}

#[test]
fn clear_resets_tree_but_keeps_config() {
    let mut tree = ContextualCobwebTree::new(TreeConfig {
        ctxt_weight: 0.5,
        ..TreeConfig::default()
    });
    tree.contextual_ifit(vec![inst(&[("a", "1")]), inst(&[("a", "2")])], 1, ContextKey::SymmetricWindow)
        .unwrap();
    assert!(tree.root_node().count > 0);

    tree.clear();
    assert_eq!(tree.root_node().count, 0);
    assert_eq!(tree.config().ctxt_weight, 0.5);
}
