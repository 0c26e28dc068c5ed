//! Exact nearest-neighbour scan over an online vector view.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Euclidean distance.
    #[default]
    L2,
    /// `1 - cos(a, b)`.
    Cosine,
    /// Negated dot product.
    InnerProduct,
}

impl SimilarityMetric {
    /// Distance between two equally long vectors; smaller is more similar.
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SimilarityMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            SimilarityMetric::Cosine => {
                let dot = dot(a, b);
                let norm = dot_self(a).sqrt() * dot_self(b).sqrt();
                if norm == 0.0 { 1.0 } else { 1.0 - dot / norm }
            }
            SimilarityMetric::InnerProduct => -dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn dot_self(a: &[f32]) -> f32 {
    dot(a, a)
}

/// One ranked hit: the candidate's position in the input slice and its distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// Ranks `candidates` by ascending distance to `query`, breaking ties by
/// ascending key, and keeps the first `top_k`.
///
/// Callers must ensure every candidate vector has the query's length.
#[must_use]
pub fn top_k<K>(
    metric: SimilarityMetric,
    query: &[f32],
    candidates: &[(K, &[f32])],
    top_k: usize,
) -> Vec<Neighbor>
where
    K: Ord + Sync,
{
    if top_k == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<Neighbor> = candidates
        .par_iter()
        .enumerate()
        .map(|(position, (_, vector))| Neighbor {
            position,
            distance: metric.distance(query, vector),
        })
        .collect();

    let order = |a: &Neighbor, b: &Neighbor| -> Ordering {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| candidates[a.position].0.cmp(&candidates[b.position].0))
    };

    if scored.len() > top_k {
        scored.select_nth_unstable_by(top_k - 1, order);
        scored.truncate(top_k);
    }
    scored.sort_unstable_by(order);
    scored
}
