#![warn(missing_docs)]

//! contextual-cobweb is an incremental hierarchical concept-formation
//! engine that learns a probabilistic concept tree over a sequence of
//! instances whose descriptions include contextual references to
//! neighboring instances.
//!
//! It solves two interlocking problems simultaneously: categorizing each
//! instance into the concept hierarchy by maximizing category utility, and
//! resolving the mutual dependency that an instance's contextual attribute
//! is the set of concept-paths of its neighbors, which themselves depend on
//! their own contexts.
//!
//! This is based on the Cobweb/Cobweb3 family of concept-formation
//! algorithms, extended with a sliding-window stabilization loop over the
//! contextual attribute.

/// Online mean/variance accumulator for numeric attributes.
pub mod accumulator;
/// Mutable references an instance holds to its position in the tree.
pub mod context;
mod cu;
/// Error types for the public entry points of the tree driver.
pub mod error;
mod json;
/// Nodes of the concept tree and their counting operations.
pub mod node;
/// The tree/window driver: `ContextualCobwebTree` and `TreeConfig`.
pub mod tree;
/// Instance and attribute-value representation.
pub mod value;
