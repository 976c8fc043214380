//! HNSW graph structure and tuning parameters.
//!
//! The graph stores adjacency only: per-node, per-level neighbor arrays plus
//! level assignments and ghost flags. Vector payloads live in the store; the
//! engine resolves them through the [`NodeVectors`](crate::hnsw::NodeVectors)
//! trait. Edges are plain u32 indices into the node table, so the cyclic
//! neighborhood structure involves no ownership cycles.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::config;

/// Tuning parameters for the HNSW index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Target bidirectional links per node above level 0.
    pub m: usize,
    /// Link cap at level 0, conventionally `2 * m`.
    pub m_max0: usize,
    /// Candidate pool size during insertion.
    pub ef_construction: usize,
    /// Default candidate pool size during search.
    pub ef_search: usize,
    /// Cap on the level any node may draw.
    pub ml_max: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            m_max0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            ml_max: config::HNSW_DEFAULT_ML_MAX,
        }
    }
}

impl HnswConfig {
    /// Reject parameter combinations the graph cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(Error::shape("hnsw m must be at least 2"));
        }
        if self.m_max0 < self.m {
            return Err(Error::shape("hnsw m_max0 must be at least m"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(Error::shape("hnsw ef parameters must be positive"));
        }
        if self.ml_max == 0 || self.ml_max > u8::MAX as usize {
            return Err(Error::shape("hnsw ml_max must be in 1..=255"));
        }
        Ok(())
    }
}

/// Layered proximity graph over internal node ids.
#[derive(Debug)]
pub struct HnswGraph {
    pub(crate) config: HnswConfig,
    /// `neighbors[node][level]` is that node's neighbor list at `level`.
    pub(crate) neighbors: Vec<Vec<Vec<u32>>>,
    /// Top level assigned to each node.
    pub(crate) levels: Vec<u8>,
    /// Ghost flags: deleted or overwritten nodes kept for connectivity.
    pub(crate) ghosts: Vec<bool>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_level: usize,
    live: usize,
}

impl HnswGraph {
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            neighbors: Vec::new(),
            levels: Vec::new(),
            ghosts: Vec::new(),
            entry_point: None,
            max_level: 0,
            live: 0,
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Total nodes, ghosts included. Also the next internal id.
    pub fn node_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Nodes that are not ghosts.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    #[inline]
    pub fn is_ghost(&self, node: u32) -> bool {
        self.ghosts[node as usize]
    }

    /// Flag a node as a ghost. Returns false if it already was one.
    pub fn mark_ghost(&mut self, node: u32) -> bool {
        let slot = &mut self.ghosts[node as usize];
        if *slot {
            false
        } else {
            *slot = true;
            self.live -= 1;
            true
        }
    }

    #[inline]
    pub fn level_of(&self, node: u32) -> usize {
        self.levels[node as usize] as usize
    }

    /// Neighbor list of `node` at `level`; empty above the node's level.
    #[inline]
    pub fn neighbors(&self, node: u32, level: usize) -> &[u32] {
        self.neighbors[node as usize]
            .get(level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Draw a level from the geometric distribution `⌊−ln(U) / ln(M)⌋`,
    /// capped at `ml_max`.
    pub fn random_level(&self) -> usize {
        let ml = 1.0 / (self.config.m as f64).ln();
        let u: f64 = rand::random();
        ((-u.ln() * ml).floor() as usize).min(self.config.ml_max)
    }

    /// Append a node with empty neighbor lists up to `level`. Returns its id.
    pub(crate) fn push_node(&mut self, level: usize) -> u32 {
        let id = self.levels.len() as u32;
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.levels.push(level as u8);
        self.ghosts.push(false);
        self.live += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(HnswConfig::default().validate().is_ok());
        assert!(HnswConfig { m: 1, ..Default::default() }.validate().is_err());
        assert!(HnswConfig { m_max0: 4, m: 8, ..Default::default() }.validate().is_err());
        assert!(HnswConfig { ef_search: 0, ..Default::default() }.validate().is_err());
        assert!(HnswConfig { ml_max: 0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_push_and_ghost_counts() {
        let mut g = HnswGraph::new(HnswConfig::default());
        assert!(g.is_empty());
        let a = g.push_node(0);
        let b = g.push_node(2);
        assert_eq!((a, b), (0, 1));
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.live_count(), 2);
        assert_eq!(g.level_of(b), 2);

        assert!(g.mark_ghost(a));
        assert!(!g.mark_ghost(a), "second ghost mark is a no-op");
        assert_eq!(g.live_count(), 1);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_neighbors_above_level_are_empty() {
        let mut g = HnswGraph::new(HnswConfig::default());
        let a = g.push_node(1);
        assert!(g.neighbors(a, 0).is_empty());
        assert!(g.neighbors(a, 5).is_empty());
    }

    #[test]
    fn test_random_level_respects_cap() {
        let g = HnswGraph::new(HnswConfig { ml_max: 3, ..Default::default() });
        for _ in 0..500 {
            assert!(g.random_level() <= 3);
        }
    }

    #[test]
    fn test_random_level_mostly_zero() {
        // With M=16 roughly 1/16 of draws exceed level 0.
        let g = HnswGraph::new(HnswConfig::default());
        let zeros = (0..1000).filter(|_| g.random_level() == 0).count();
        assert!(zeros > 800, "geometric distribution should favor level 0, got {zeros}/1000");
    }
}
