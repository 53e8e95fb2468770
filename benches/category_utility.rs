use contextual_cobweb::tree::{ContextKey, ContextualCobwebTree, TreeConfig};
use contextual_cobweb::value::{AttrName, AttrValue, Instance, NominalValue};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

/// Many distinct tokens keep the tree wide (large `children` lists at the
/// root), which is the shape that makes `two_best_children`'s per-child
/// category-utility scan the dominant cost rather than tree descent depth.
fn wide_branching_sequence(len: usize, distinct_tokens: usize) -> Vec<Instance> {
    (0..len)
        .map(|i| {
            let mut inst = Instance::new();
            inst.insert(
                AttrName::new("token"),
                AttrValue::Nominal(NominalValue::new(format!("t{}", i % distinct_tokens))),
            );
            inst
        })
        .collect()
}

fn insert_into_wide_tree(c: &mut Criterion) {
    c.bench_function("category utility scan over 40 siblings", |b| {
        b.iter_batched_ref(
            || {
                let mut tree = ContextualCobwebTree::new(TreeConfig::default());
                let instances = wide_branching_sequence(200, 40);
                tree.contextual_ifit(instances, 2, ContextKey::SymmetricWindow)
                    .unwrap();
                (tree, wide_branching_sequence(20, 40))
            },
            |(tree, instances)| {
                tree.contextual_ifit(instances.clone(), 2, ContextKey::SymmetricWindow)
                    .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

fn contextual_term_with_large_window(c: &mut Criterion) {
    c.bench_function("contextual CU term, window 12", |b| {
        b.iter_batched_ref(
            || {
                let config = TreeConfig {
                    ctxt_weight: 1.0,
                    ..TreeConfig::default()
                };
                (
                    ContextualCobwebTree::new(config),
                    wide_branching_sequence(60, 6),
                )
            },
            |(tree, instances)| {
                tree.contextual_ifit(instances.clone(), 12, ContextKey::SymmetricWindow)
                    .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    insert_into_wide_tree,
    contextual_term_with_large_window
);
criterion_main!(benches);
