//! Read-only JSON export of the concept tree.

use serde_json::{json, Value};

use crate::node::{AttrCounts, NodeId};
use crate::tree::ContextualCobwebTree;

/// Recursively renders `node` (and its subtree) as `{name, size, children,
/// counts}`.
pub(crate) fn node_to_json(tree: &ContextualCobwebTree, node: NodeId) -> Value {
    let concept = tree.node(node);

    let mut counts = serde_json::Map::new();
    for (attr, attr_counts) in &concept.av_counts {
        let value = match attr_counts {
            AttrCounts::Numeric(cv) => json!({
                "num": cv.num(),
                "mean": cv.unbiased_mean(),
                "std": cv.unbiased_std(),
            }),
            AttrCounts::Nominal(map) => {
                let mut m = serde_json::Map::new();
                for (value, count) in map {
                    m.insert(value.as_str().to_string(), json!(count));
                }
                Value::Object(m)
            }
            AttrCounts::Context(map) => json!({ "context_slots": map.len() }),
        };
        counts.insert(attr.as_str().to_string(), value);
    }

    json!({
        "name": format!("node-{}", node.0),
        "size": concept.count,
        "children": concept.children.iter().map(|&c| node_to_json(tree, c)).collect::<Vec<_>>(),
        "counts": counts,
    })
}
