//! Context handles: the mutable reference an instance holds to "where it
//! currently sits in the tree."
//!
//! A handle is either *unadded* (tentative: it holds the root-to-candidate
//! path `cobweb_path` last computed for it) or *committed* (its owning
//! instance has been added via `add_by_path`, and it now names a single
//! leaf). Handles never own a node; they store [`NodeId`]s into the tree's
//! node arena, so rewriting a handle after a merge/split is just replacing
//! ids, never chasing a live reference.

use crate::node::{ConceptNode, NodeId};

/// A stable id for a [`ContextHandleState`] inside
/// [`crate::tree::ContextualCobwebTree`]'s context-handle arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextHandleId(pub usize);

/// The state of a single context handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextHandleState {
    /// Not yet committed: `path` is the root-to-candidate chain last
    /// computed by `cobweb_path`/`cobweb_path_and_restructurings`, and
    /// `current` is its last element (the node under which a new child
    /// would be created for this instance, or the leaf it currently
    /// occupies).
    Tentative {
        path: Vec<NodeId>,
        current: NodeId,
    },
    /// Committed to a leaf currently in the tree.
    Committed(NodeId),
}

impl ContextHandleState {
    /// Builds a fresh tentative handle for a path just computed by
    /// `cobweb_path`. Panics if `path` is empty: every computed path
    /// contains at least the root.
    #[must_use]
    pub fn tentative(path: Vec<NodeId>) -> Self {
        let current = *path.last().expect("cobweb_path never returns an empty path");
        Self::Tentative { path, current }
    }

    /// Replaces the tentative path wholesale, updating `current` to the new
    /// last element. No-op (logically) on a committed handle is a
    /// programmer error; callers only call this on unadded handles.
    pub fn set_path(&mut self, path: Vec<NodeId>) {
        let current = *path.last().expect("set_path requires a nonempty path");
        *self = Self::Tentative { path, current };
    }

    /// Adds `node` to the tentative path set, used when a merge creates a
    /// new common ancestor that must now be considered "on the path" for
    /// descendant queries. Leaves `current` untouched.
    pub fn insert_into_path(&mut self, node: NodeId) {
        if let Self::Tentative { path, .. } = self {
            if !path.contains(&node) {
                path.push(node);
            }
        }
    }

    /// Commits the handle to a leaf.
    pub fn set_instance(&mut self, node: NodeId) {
        *self = Self::Committed(node);
    }

    /// The node this handle currently targets: for a tentative handle, the
    /// candidate leaf/insertion-point; for a committed handle, the leaf
    /// itself.
    #[must_use]
    pub fn current(&self) -> NodeId {
        match self {
            Self::Tentative { current, .. } => *current,
            Self::Committed(node) => *node,
        }
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// The tentative path, if unadded.
    #[must_use]
    pub fn tentative_path(&self) -> Option<&[NodeId]> {
        match self {
            Self::Tentative { path, .. } => Some(path),
            Self::Committed(_) => None,
        }
    }
}

/// Whether `handle` is "on" `node`: for an unadded handle, `node` appears in
/// its tentative path; for a committed handle, `node` is `handle`'s leaf or
/// an ancestor of it.
#[must_use]
pub fn is_descendant_of(handle: &ContextHandleState, node: NodeId, arena: &[ConceptNode]) -> bool {
    match handle {
        ContextHandleState::Tentative { path, .. } => path.contains(&node),
        ContextHandleState::Committed(leaf) => is_ancestor_or_self(node, *leaf, arena),
    }
}

/// Whether `handle` is an unadded handle whose candidate insertion point is
/// exactly `node`.
#[must_use]
pub fn is_unadded_leaf_of(handle: &ContextHandleState, node: NodeId) -> bool {
    match handle {
        ContextHandleState::Tentative { current, .. } => *current == node,
        ContextHandleState::Committed(_) => false,
    }
}

fn is_ancestor_or_self(ancestor: NodeId, mut node: NodeId, arena: &[ConceptNode]) -> bool {
    loop {
        if node == ancestor {
            return true;
        }
        match arena[node.0].parent {
            Some(parent) => node = parent,
            None => return false,
        }
    }
}
