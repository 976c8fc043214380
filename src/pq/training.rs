//! Codebook training: per-subspace k-means with k-means++ initialization.
//!
//! Each subspace is clustered independently. The RNG is seeded from a fixed
//! constant so identical training corpora reproduce identical codebooks
//! (and therefore identical content hashes).

use crate::config;
use crate::error::{Error, Result};
use crate::pq::PqCodebook;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Train a PQ codebook on `samples`.
///
/// `m` must divide `dim`; `nbits` must be in `1..=8` so codes fit in a byte.
/// Fails with [`Error::InsufficientTrainingData`] when a subspace holds fewer
/// than `2^nbits` distinct points, and [`Error::InvalidShape`] on parameter or
/// sample-dimension mismatches. `max_iters` caps the Lloyd iterations.
pub fn train(
    samples: &[Vec<f32>],
    dim: usize,
    m: usize,
    nbits: u8,
    max_iters: usize,
) -> Result<PqCodebook> {
    if nbits == 0 || nbits > 8 {
        return Err(Error::shape(format!("nbits must be in 1..=8, got {nbits}")));
    }
    if m == 0 || dim == 0 || dim % m != 0 {
        return Err(Error::shape(format!(
            "dimension {dim} must be divisible by subspace count {m}"
        )));
    }
    if let Some(bad) = samples.iter().find(|s| s.len() != dim) {
        return Err(Error::shape(format!(
            "training sample has dimension {}, engine dimension is {dim}",
            bad.len()
        )));
    }
    let k = 1usize << nbits;
    let sub_dim = dim / m;
    let n = samples.len();

    let mut centroids = vec![0.0f32; m * k * sub_dim];
    for sub in 0..m {
        // Gather this subspace's points into a contiguous arena.
        let mut points = vec![0.0f32; n * sub_dim];
        for (i, s) in samples.iter().enumerate() {
            points[i * sub_dim..(i + 1) * sub_dim]
                .copy_from_slice(&s[sub * sub_dim..(sub + 1) * sub_dim]);
        }

        let distinct = count_distinct(&points, sub_dim);
        if distinct < k {
            return Err(Error::InsufficientTrainingData {
                subspace: sub,
                distinct,
                required: k,
            });
        }

        let sub_centroids = kmeans(&points, sub_dim, k, max_iters, config::PQ_TRAIN_SEED ^ sub as u64);
        let out = sub * k * sub_dim;
        centroids[out..out + k * sub_dim].copy_from_slice(&sub_centroids);
    }

    let codebook = PqCodebook::from_parts(dim, m, nbits, centroids);
    tracing::info!(
        dim,
        m,
        nbits,
        samples = n,
        hash = %codebook.hash_hex(),
        "trained PQ codebook"
    );
    Ok(codebook)
}

/// Count bitwise-distinct points in a flat point arena.
fn count_distinct(points: &[f32], sub_dim: usize) -> usize {
    let mut seen: HashSet<Vec<u32>> = HashSet::new();
    for p in points.chunks_exact(sub_dim) {
        seen.insert(p.iter().map(|v| v.to_bits()).collect());
    }
    seen.len()
}

/// Lloyd's algorithm with k-means++ seeding. Returns `k * sub_dim` centroids.
fn kmeans(points: &[f32], sub_dim: usize, k: usize, max_iters: usize, seed: u64) -> Vec<f32> {
    let n = points.len() / sub_dim;
    debug_assert!(n >= k);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = vec![0.0f32; k * sub_dim];

    // k-means++: first centroid uniform, the rest weighted by squared
    // distance to the nearest chosen centroid.
    let first = rng.gen_range(0..n);
    centroids[..sub_dim].copy_from_slice(&points[first * sub_dim..(first + 1) * sub_dim]);
    let mut min_dists = vec![f32::MAX; n];
    for c in 1..k {
        let last = &centroids[(c - 1) * sub_dim..c * sub_dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let p = &points[i * sub_dim..(i + 1) * sub_dim];
            let d = sq_dist(p, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut pick = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    pick = i;
                    break;
                }
            }
            pick
        };
        centroids[c * sub_dim..(c + 1) * sub_dim]
            .copy_from_slice(&points[chosen * sub_dim..(chosen + 1) * sub_dim]);
    }

    // Lloyd iterations, stopping early once assignments stabilize.
    let mut assignments = vec![0usize; n];
    for _ in 0..max_iters {
        let mut changed = false;
        for i in 0..n {
            let p = &points[i * sub_dim..(i + 1) * sub_dim];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for c in 0..k {
                let d = sq_dist(p, &centroids[c * sub_dim..(c + 1) * sub_dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * sub_dim];
        for i in 0..n {
            let c = assignments[i];
            counts[c] += 1;
            let p = &points[i * sub_dim..(i + 1) * sub_dim];
            let s = &mut sums[c * sub_dim..(c + 1) * sub_dim];
            for d in 0..sub_dim {
                s[d] += p[d];
            }
        }
        for c in 0..k {
            // An empty cluster keeps its previous centroid.
            if counts[c] > 0 {
                let inv = 1.0 / counts[c] as f32;
                let s = &sums[c * sub_dim..(c + 1) * sub_dim];
                let out = &mut centroids[c * sub_dim..(c + 1) * sub_dim];
                for d in 0..sub_dim {
                    out[d] = s[d] * inv;
                }
            }
        }
    }

    centroids
}

#[inline]
fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}
