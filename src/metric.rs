//! Distance metrics for vector similarity.
//!
//! Five metrics are supported: euclidean, cosine, manhattan, dot product, and
//! angular. All of them return a value where **lower is closer**, so a single
//! ascending sort order works across the engine. Dispatch is a tagged enum
//! rather than a trait object; the variant set is closed and small.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Distance metric used for vector similarity computation.
///
/// All metrics sort ascending (smaller = more similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Euclidean (L2) distance: `‖u − v‖₂`. Range \[0, ∞).
    Euclidean,
    /// Cosine distance: `1 − u·v/(‖u‖‖v‖)`. A pair involving a zero vector
    /// has distance 1. Range \[0, 2\].
    Cosine,
    /// Manhattan (L1) distance: `Σ|uᵢ − vᵢ|`. Range \[0, ∞).
    Manhattan,
    /// Negated dot product: `−u·v`, so that larger similarity sorts first.
    Dot,
    /// Angular distance: `arccos(clamp(cos_sim, −1, 1)) / π`. A pair
    /// involving a zero vector has distance 0.5. Range \[0, 1\].
    Angular,
}

impl Metric {
    /// Pairwise distance between two vectors of equal dimension.
    pub fn distance(&self, u: &[f32], v: &[f32]) -> f32 {
        debug_assert_eq!(u.len(), v.len());
        match self {
            Metric::Euclidean => euclidean(u, v),
            Metric::Cosine => cosine(u, v),
            Metric::Manhattan => manhattan(u, v),
            Metric::Dot => -dot(u, v),
            Metric::Angular => angular(u, v),
        }
    }

    /// Batched distance from one query to many vectors.
    ///
    /// Dispatches on the metric tag once, then runs the same scalar kernel as
    /// [`distance`](Metric::distance), so results are bitwise equal to
    /// repeated pairwise calls.
    pub fn distance_batch(&self, q: &[f32], vs: &[Vec<f32>]) -> Vec<f32> {
        match self {
            Metric::Euclidean => vs.iter().map(|v| euclidean(q, v)).collect(),
            Metric::Cosine => vs.iter().map(|v| cosine(q, v)).collect(),
            Metric::Manhattan => vs.iter().map(|v| manhattan(q, v)).collect(),
            Metric::Dot => vs.iter().map(|v| -dot(q, v)).collect(),
            Metric::Angular => vs.iter().map(|v| angular(q, v)).collect(),
        }
    }

    /// Monotone lower bound on [`distance`](Metric::distance), for beam-search
    /// admission tests. Currently the exact distance.
    pub fn lower_bound(&self, u: &[f32], v: &[f32]) -> f32 {
        self.distance(u, v)
    }

    /// Whether asymmetric distance over PQ codes needs a stored per-record
    /// vector norm. True for the metrics whose definition divides by `‖v‖`.
    pub(crate) fn needs_stored_norm(&self) -> bool {
        matches!(self, Metric::Cosine | Metric::Angular)
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            "manhattan" => Ok(Metric::Manhattan),
            "dot" => Ok(Metric::Dot),
            "angular" => Ok(Metric::Angular),
            other => Err(format!(
                "unsupported metric '{other}' (expected euclidean, cosine, manhattan, dot, or angular)"
            )),
        }
    }
}

fn dot(u: &[f32], v: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..u.len() {
        sum += u[i] * v[i];
    }
    sum
}

fn norm(u: &[f32]) -> f32 {
    dot(u, u).sqrt()
}

fn euclidean(u: &[f32], v: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..u.len() {
        let d = u[i] - v[i];
        sum += d * d;
    }
    sum.sqrt()
}

fn manhattan(u: &[f32], v: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..u.len() {
        sum += (u[i] - v[i]).abs();
    }
    sum
}

fn cosine(u: &[f32], v: &[f32]) -> f32 {
    let nu = norm(u);
    let nv = norm(v);
    if nu == 0.0 || nv == 0.0 {
        return 1.0;
    }
    1.0 - dot(u, v) / (nu * nv)
}

/// Similarity mapped to an angle in \[0, 1\]. Zero vectors land on the
/// orthogonal midpoint, mirroring the cosine convention above.
fn angular(u: &[f32], v: &[f32]) -> f32 {
    let nu = norm(u);
    let nv = norm(v);
    let sim = if nu == 0.0 || nv == 0.0 {
        0.0
    } else {
        (dot(u, v) / (nu * nv)).clamp(-1.0, 1.0)
    };
    sim.acos() / std::f32::consts::PI
}

/// Cosine-style distance from a precomputed dot product and two norms.
///
/// Shared by the PQ asymmetric distance tables, which reconstruct the
/// numerator from centroid lookups instead of touching the full vector.
pub(crate) fn similarity_distance(metric: Metric, dot: f32, query_norm: f32, stored_norm: f32) -> f32 {
    let sim = if query_norm == 0.0 || stored_norm == 0.0 {
        0.0
    } else {
        (dot / (query_norm * stored_norm)).clamp(-1.0, 1.0)
    };
    match metric {
        Metric::Cosine => 1.0 - sim,
        Metric::Angular => sim.acos() / std::f32::consts::PI,
        _ => unreachable!("similarity_distance is only defined for cosine and angular"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Metric; 5] = [
        Metric::Euclidean,
        Metric::Cosine,
        Metric::Manhattan,
        Metric::Dot,
        Metric::Angular,
    ];

    #[test]
    fn test_euclidean_known_value() {
        let d = Metric::Euclidean.distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]);
        assert!((d - 5.0).abs() < 1e-6, "3-4-5 triangle, got {d}");
    }

    #[test]
    fn test_manhattan_known_value() {
        let d = Metric::Manhattan.distance(&[1.0, 2.0], &[4.0, -2.0]);
        assert!((d - 7.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_cosine_orthogonal_is_one() {
        let d = Metric::Cosine.distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_cosine_zero_vector_is_one() {
        let d = Metric::Cosine.distance(&[0.0, 0.0], &[1.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_angular_orthogonal_is_half() {
        let d = Metric::Angular.distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 0.5).abs() < 1e-5, "got {d}");
    }

    #[test]
    fn test_angular_zero_vector_is_half() {
        let d = Metric::Angular.distance(&[0.0, 0.0], &[1.0, 0.0]);
        assert!((d - 0.5).abs() < 1e-5, "got {d}");
    }

    #[test]
    fn test_dot_negated() {
        let d = Metric::Dot.distance(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert!((d - (-32.0)).abs() < 1e-5, "got {d}");
    }

    #[test]
    fn test_self_distance_zero() {
        let v = vec![0.3, -1.2, 4.5, 0.01];
        for m in [Metric::Euclidean, Metric::Cosine, Metric::Manhattan, Metric::Angular] {
            let d = m.distance(&v, &v);
            assert!(d.abs() < 1e-3, "{m:?} self-distance should be ~0, got {d}");
        }
    }

    #[test]
    fn test_symmetry() {
        let u = vec![0.7, -0.2, 1.5];
        let v = vec![-1.0, 0.4, 0.9];
        for m in ALL {
            let a = m.distance(&u, &v);
            let b = m.distance(&v, &u);
            assert_eq!(a, b, "{m:?} must be symmetric");
        }
    }

    #[test]
    fn test_non_negativity_except_dot() {
        let u = vec![2.0, 3.0];
        let v = vec![1.0, 5.0];
        for m in [Metric::Euclidean, Metric::Cosine, Metric::Manhattan, Metric::Angular] {
            assert!(m.distance(&u, &v) >= 0.0, "{m:?} must be non-negative");
        }
        // dot may go negative; that is its point
        assert!(Metric::Dot.distance(&u, &v) < 0.0);
    }

    #[test]
    fn test_batch_bitwise_equals_scalar() {
        let q = vec![0.1, 0.9, -0.4, 2.2];
        let vs: Vec<Vec<f32>> = (0..16)
            .map(|i| (0..4).map(|j| ((i * 7 + j * 3) % 11) as f32 - 5.0).collect())
            .collect();
        for m in ALL {
            let batch = m.distance_batch(&q, &vs);
            for (i, v) in vs.iter().enumerate() {
                let scalar = m.distance(&q, v);
                assert_eq!(
                    batch[i].to_bits(),
                    scalar.to_bits(),
                    "{m:?} batch result {i} differs from scalar call"
                );
            }
        }
    }

    #[test]
    fn test_lower_bound_never_exceeds_distance() {
        let u = vec![1.0, -2.0, 0.5];
        let v = vec![0.0, 3.0, -1.5];
        for m in ALL {
            assert!(m.lower_bound(&u, &v) <= m.distance(&u, &v));
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!("angular".parse::<Metric>().unwrap(), Metric::Angular);
        assert!("l2".parse::<Metric>().is_err());
    }
}
