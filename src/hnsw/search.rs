//! Beam search over the layered graph.
//!
//! `search_layer` is the core primitive: a best-first expansion bounded by a
//! candidate pool of size `ef`, with a min-heap of nodes to expand and a
//! max-heap of current results. Ghost nodes are traversed for navigation but
//! never surface in results. Distances come from a caller-supplied closure,
//! so the same code path serves raw vectors, PQ asymmetric tables, and test
//! fixtures.

use crate::hnsw::graph::HnswGraph;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Per-pass visit ledger for beam traversal.
///
/// Each node's slot holds the epoch of the pass that last touched it, so a
/// node counts as visited only when its mark equals the current epoch and
/// starting a new pass is an epoch bump, not a table wipe. The table is
/// sized from the graph at the start of every pass, which keeps one ledger
/// valid across inserts on the writer path as the node space grows.
#[derive(Debug, Default)]
pub struct Traversal {
    marks: Vec<u32>,
    epoch: u32,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh pass over `graph`: advance the epoch and widen the mark
    /// table to cover every node currently in the graph. Slots are zeroed
    /// only if the u32 epoch ever wraps.
    pub fn begin_for(&mut self, graph: &HnswGraph) {
        if self.epoch == u32::MAX {
            self.marks.fill(0);
            self.epoch = 0;
        }
        self.epoch += 1;
        let nodes = graph.node_count() as usize;
        if self.marks.len() < nodes {
            self.marks.resize(nodes, 0);
        }
    }

    /// Record a visit; true exactly once per node per pass.
    #[inline]
    pub fn first_visit(&mut self, node: u32) -> bool {
        let mark = &mut self.marks[node as usize];
        if *mark == self.epoch {
            false
        } else {
            *mark = self.epoch;
            true
        }
    }
}

/// Expansion frontier entry: negated distance makes the max-heap pop nearest
/// first.
#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    node: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.neg_distance
            .cmp(&other.neg_distance)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Result-set entry: a max-heap by distance, so the worst result pops first
/// when trimming to `ef`.
#[derive(Debug, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    node: u32,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Search one level, returning up to `ef` live nodes sorted by ascending
/// distance. `dist` evaluates the query-to-node distance.
pub fn search_layer(
    graph: &HnswGraph,
    dist: &mut dyn FnMut(u32) -> f32,
    entry_points: &[u32],
    ef: usize,
    level: usize,
    traversal: &mut Traversal,
) -> Vec<(f32, u32)> {
    traversal.begin_for(graph);
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst accepted distance; avoids a heap peek per neighbor.
    let mut worst = f32::MAX;

    for &ep in entry_points {
        if !traversal.first_visit(ep) {
            continue;
        }
        let d = dist(ep);
        candidates.push(Candidate {
            neg_distance: OrderedFloat(-d),
            node: ep,
        });
        if !graph.is_ghost(ep) {
            results.push(ResultEntry {
                distance: OrderedFloat(d),
                node: ep,
            });
            if results.len() >= ef {
                worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
            }
        }
    }

    while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;
        if results.len() >= ef && c_dist > worst {
            break;
        }
        for &neighbor in graph.neighbors(candidate.node, level) {
            if !traversal.first_visit(neighbor) {
                continue;
            }
            let d = dist(neighbor);
            if results.len() >= ef && d >= worst {
                continue;
            }
            candidates.push(Candidate {
                neg_distance: OrderedFloat(-d),
                node: neighbor,
            });
            if !graph.is_ghost(neighbor) {
                results.push(ResultEntry {
                    distance: OrderedFloat(d),
                    node: neighbor,
                });
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.node))
        .collect()
}

/// Full layered search: greedy descent to level 1, then a beam of size `ef`
/// at level 0. Returns the level-0 pool (up to `ef` live nodes) sorted by
/// ascending distance; the caller trims to `k` after any reranking.
pub fn search(
    graph: &HnswGraph,
    dist: &mut dyn FnMut(u32) -> f32,
    ef: usize,
    traversal: &mut Traversal,
) -> Vec<(f32, u32)> {
    let Some(entry) = graph.entry_point() else {
        return Vec::new();
    };
    let mut current = entry;
    for level in (1..=graph.max_level()).rev() {
        let nearest = search_layer(graph, dist, &[current], 1, level, traversal);
        if let Some(&(_, node)) = nearest.first() {
            current = node;
        }
    }
    search_layer(graph, dist, &[current], ef, 0, traversal)
}
