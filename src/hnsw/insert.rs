//! Graph insertion with diversity-preserving neighbor selection.
//!
//! Insertion descends greedily from the entry point to the new node's level,
//! then runs an `ef_construction` beam per level and wires bidirectional
//! edges. Neighbors are chosen by the heuristic selector (Algorithm 4 of the
//! HNSW paper): a candidate is accepted only if it is closer to the new node
//! than to every neighbor already accepted, which keeps long-range edges
//! alive instead of clustering all links on near-duplicates.

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::search::{search_layer, Traversal};
use crate::hnsw::NodeVectors;
use crate::metric::Metric;

/// Insert a node into the graph.
///
/// `internal_id` must equal `graph.node_count()`; the caller registers the
/// vector with its store *before* calling so that `vectors` can resolve the
/// new id during reverse-edge pruning. `vector` is the new node's payload.
pub fn insert(
    graph: &mut HnswGraph,
    vectors: &dyn NodeVectors,
    metric: Metric,
    internal_id: u32,
    vector: &[f32],
    traversal: &mut Traversal,
) {
    debug_assert_eq!(internal_id, graph.node_count());
    let level = graph.random_level();

    // First node becomes the entry point outright.
    if graph.entry_point().is_none() {
        graph.push_node(level);
        graph.entry_point = Some(internal_id);
        graph.max_level = level;
        return;
    }
    let entry = graph
        .entry_point()
        .expect("entry point exists after the emptiness guard");

    let mut scratch = Vec::with_capacity(vector.len());
    let mut dist_to_new = |node: u32| -> f32 {
        if vectors.vector_into(node, &mut scratch) {
            metric.distance(vector, &scratch)
        } else {
            f32::MAX
        }
    };

    // Phase 1: greedy descent through the levels above the node's own.
    let mut current = entry;
    for l in ((level + 1)..=graph.max_level()).rev() {
        let nearest = search_layer(graph, &mut dist_to_new, &[current], 1, l, traversal);
        if let Some(&(_, node)) = nearest.first() {
            current = node;
        }
    }

    // Phase 2: per-level candidate pools and neighbor selection.
    let top = level.min(graph.max_level());
    let mut per_level: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
    let mut entry_points = vec![current];
    for l in (0..=top).rev() {
        let pool = search_layer(
            graph,
            &mut dist_to_new,
            &entry_points,
            graph.config().ef_construction,
            l,
            traversal,
        );
        let cap = if l == 0 { graph.config().m_max0 } else { graph.config().m };
        per_level[l] = select_neighbors(vectors, metric, &pool, cap)
            .into_iter()
            .map(|(_, node)| node)
            .collect();
        if !pool.is_empty() {
            entry_points.clear();
            entry_points.extend(pool.iter().map(|&(_, node)| node));
        }
    }
    drop(dist_to_new);

    // Phase 3: materialize the node and wire bidirectional edges.
    graph.push_node(level);
    let mut base = Vec::with_capacity(vector.len());
    let mut cand = Vec::with_capacity(vector.len());
    for (l, chosen) in per_level.iter().enumerate() {
        let cap = if l == 0 { graph.config().m_max0 } else { graph.config().m };
        graph.neighbors[internal_id as usize][l] = chosen.clone();
        for &neighbor in chosen {
            let slot = &mut graph.neighbors[neighbor as usize];
            while slot.len() <= l {
                slot.push(Vec::new());
            }
            slot[l].push(internal_id);

            if slot[l].len() > cap {
                // Re-select the neighbor's list under the same heuristic,
                // with distances measured from the neighbor itself.
                let list = slot[l].clone();
                if !vectors.vector_into(neighbor, &mut base) {
                    continue;
                }
                let mut scored = Vec::with_capacity(list.len());
                for &other in &list {
                    if vectors.vector_into(other, &mut cand) {
                        scored.push((metric.distance(&base, &cand), other));
                    }
                }
                let pruned = select_neighbors(vectors, metric, &scored, cap);
                graph.neighbors[neighbor as usize][l] =
                    pruned.into_iter().map(|(_, node)| node).collect();
            }
        }
    }

    if level > graph.max_level() {
        graph.max_level = level;
        graph.entry_point = Some(internal_id);
    }
}

/// Heuristic neighbor selection: walk candidates in ascending distance to the
/// base and accept one only if it is strictly closer to the base than to
/// every neighbor accepted so far. Remaining slots are backfilled with the
/// closest rejected candidates so the node is never left under-connected.
fn select_neighbors(
    vectors: &dyn NodeVectors,
    metric: Metric,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    sorted.dedup_by_key(|&mut (_, node)| node);

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    let mut selected_vecs: Vec<Vec<f32>> = Vec::with_capacity(m);
    let mut cand = Vec::new();

    for &(dist_to_base, node) in &sorted {
        if selected.len() >= m {
            break;
        }
        if !vectors.vector_into(node, &mut cand) {
            continue;
        }
        let diverse = selected_vecs
            .iter()
            .all(|sel| dist_to_base < metric.distance(&cand, sel));
        if diverse {
            selected.push((dist_to_base, node));
            selected_vecs.push(cand.clone());
        }
    }

    if selected.len() < m {
        for &(dist, node) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !selected.iter().any(|&(_, s)| s == node) {
                selected.push((dist, node));
            }
        }
        selected.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::HnswConfig;
    use crate::hnsw::search;

    /// Plain in-memory vector table for exercising the graph alone.
    struct VecTable(Vec<Vec<f32>>);

    impl NodeVectors for VecTable {
        fn vector_into(&self, node: u32, out: &mut Vec<f32>) -> bool {
            match self.0.get(node as usize) {
                Some(v) => {
                    out.clear();
                    out.extend_from_slice(v);
                    true
                }
                None => false,
            }
        }
    }

    fn build_graph(points: &[Vec<f32>], config: HnswConfig) -> (HnswGraph, VecTable) {
        let mut graph = HnswGraph::new(config);
        let mut table = VecTable(Vec::new());
        let mut traversal = Traversal::new();
        for (i, p) in points.iter().enumerate() {
            table.0.push(p.clone());
            insert(&mut graph, &table, Metric::Euclidean, i as u32, p, &mut traversal);
        }
        (graph, table)
    }

    fn grid_points(n: usize, dim: usize) -> Vec<Vec<f32>> {
        // 509 is prime and larger than any n used here, so the first
        // coordinate alone is injective: no duplicate points, no NN ties.
        (0..n)
            .map(|i| (0..dim).map(|j| ((i * 53 + j * 19) % 509) as f32 / 509.0).collect())
            .collect()
    }

    #[test]
    fn test_first_insert_becomes_entry() {
        let points = vec![vec![1.0, 2.0]];
        let (graph, _) = build_graph(&points, HnswConfig::default());
        assert_eq!(graph.entry_point(), Some(0));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_edges_are_symmetric_modulo_caps() {
        let points = grid_points(120, 4);
        let (graph, _) = build_graph(&points, HnswConfig { m: 4, m_max0: 8, ..Default::default() });

        for node in 0..graph.node_count() {
            for level in 0..=graph.level_of(node) {
                let cap = if level == 0 { 8 } else { 4 };
                assert!(
                    graph.neighbors(node, level).len() <= cap,
                    "node {node} exceeds cap at level {level}"
                );
                for &nb in graph.neighbors(node, level) {
                    let back = graph.neighbors(nb, level).contains(&node);
                    // Asymmetry is only legal when the reverse side is full
                    // (a shrink pruned the back-edge).
                    if !back {
                        assert_eq!(
                            graph.neighbors(nb, level).len(),
                            cap,
                            "missing back-edge ({node}->{nb}) without a full list"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_neighbors_stay_within_levels() {
        let points = grid_points(60, 3);
        let (graph, _) = build_graph(&points, HnswConfig::default());
        for node in 0..graph.node_count() {
            for level in 0..=graph.level_of(node) {
                for &nb in graph.neighbors(node, level) {
                    assert!(
                        graph.level_of(nb) >= level,
                        "neighbor {nb} linked above its own level"
                    );
                }
            }
        }
    }

    #[test]
    fn test_search_finds_exact_match() {
        let points = grid_points(200, 4);
        let (graph, table) = build_graph(&points, HnswConfig::default());
        let mut traversal = Traversal::new();
        for probe in [0usize, 17, 99, 150] {
            let query = points[probe].clone();
            let mut scratch = Vec::new();
            let mut d = |n: u32| {
                table.vector_into(n, &mut scratch);
                Metric::Euclidean.distance(&query, &scratch)
            };
            let results = search::search(&graph, &mut d, 10, &mut traversal);
            assert_eq!(results[0].1 as usize, probe, "self-query must return the node");
            assert!(results[0].0 < 1e-6);
        }
    }

    #[test]
    fn test_recall_against_exact_scan() {
        let points = grid_points(300, 8);
        let (graph, table) = build_graph(&points, HnswConfig::default());
        let mut traversal = Traversal::new();
        let k = 5;

        let mut hits = 0usize;
        let mut total = 0usize;
        for probe in (0..300).step_by(29) {
            let query: Vec<f32> = points[probe].iter().map(|x| x + 0.003).collect();
            let mut exact: Vec<(f32, u32)> = points
                .iter()
                .enumerate()
                .map(|(i, p)| (Metric::Euclidean.distance(&query, p), i as u32))
                .collect();
            exact.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            let truth: Vec<u32> = exact.iter().take(k).map(|&(_, i)| i).collect();

            let mut scratch = Vec::new();
            let mut d = |n: u32| {
                table.vector_into(n, &mut scratch);
                Metric::Euclidean.distance(&query, &scratch)
            };
            let got = search::search(&graph, &mut d, 10 * k, &mut traversal);
            let got: Vec<u32> = got.iter().take(k).map(|&(_, n)| n).collect();

            total += k;
            hits += truth.iter().filter(|t| got.contains(t)).count();
        }
        let recall = hits as f64 / total as f64;
        assert!(recall >= 0.9, "recall@{k} = {recall}, expected >= 0.9");
    }

    #[test]
    fn test_ghosts_never_surface_after_delete() {
        let points = grid_points(50, 4);
        let (mut graph, table) = build_graph(&points, HnswConfig::default());
        for ghost in [3u32, 20, 41] {
            graph.mark_ghost(ghost);
        }
        let mut traversal = Traversal::new();
        let query = points[20].clone();
        let mut scratch = Vec::new();
        let mut d = |n: u32| {
            table.vector_into(n, &mut scratch);
            Metric::Euclidean.distance(&query, &scratch)
        };
        let results = search::search(&graph, &mut d, 20, &mut traversal);
        assert!(!results.is_empty());
        for &(_, n) in &results {
            assert!(![3u32, 20, 41].contains(&n), "ghost {n} surfaced");
        }
    }

    #[test]
    fn test_select_neighbors_prefers_diversity() {
        // Base at origin; two near-duplicates and one distant-but-diverse
        // candidate. With m=2 the heuristic must take one duplicate and the
        // diverse point, not both duplicates.
        let table = VecTable(vec![
            vec![1.0, 0.0],   // 0: close
            vec![1.01, 0.0],  // 1: near-duplicate of 0
            vec![0.0, 3.0],   // 2: farther but diverse
        ]);
        let base = vec![0.0, 0.0];
        let candidates: Vec<(f32, u32)> = (0..3u32)
            .map(|n| {
                let mut v = Vec::new();
                table.vector_into(n, &mut v);
                (Metric::Euclidean.distance(&base, &v), n)
            })
            .collect();
        let selected = select_neighbors(&table, Metric::Euclidean, &candidates, 2);
        let ids: Vec<u32> = selected.iter().map(|&(_, n)| n).collect();
        assert!(ids.contains(&0));
        assert!(ids.contains(&2), "diverse candidate must beat the duplicate, got {ids:?}");
    }
}
