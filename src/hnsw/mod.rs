//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor
//! index.
//!
//! The graph is adjacency-only: nodes are stable u32 indices whose vectors
//! live in the store and are resolved through [`NodeVectors`]. Deleted and
//! overwritten records linger as ghost nodes — still traversed for
//! connectivity, never returned — until the graph is rebuilt at open or an
//! explicit reindex.

/// Graph structure, configuration, and level generation.
pub mod graph;
/// Insertion with heuristic neighbor selection and cap pruning.
pub mod insert;
/// Single-layer beam search, layered descent, and the per-pass visit ledger.
pub mod search;

pub use graph::{HnswConfig, HnswGraph};
pub use insert::insert;
pub use search::{search, search_layer, Traversal};

/// Resolves a node's vector from wherever the store keeps it.
///
/// Implementations copy the (possibly decoded) vector into `out` and return
/// true, or return false when the node cannot be resolved.
pub trait NodeVectors {
    fn vector_into(&self, node: u32, out: &mut Vec<f32>) -> bool;
}
