//! Exact cosine-similarity ranking.
//!
//! Candidates are scored in parallel but collected back in candidate order
//! before a stable sort, so the ordering is deterministic including
//! tie-breaks (first-seen candidate order preserved).

use rayon::prelude::*;

/// A candidate scored against the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    /// Index into the caller's candidate list.
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("dimension mismatch: query has {query}, candidate {index} has {got}")]
    DimensionMismatch {
        query: usize,
        index: usize,
        got: usize,
    },
}

/// Cosine similarity, defined as exactly 0.0 when either norm is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Score and order all candidates against the query.
pub fn rank(query: &[f32], candidates: &[Vec<f32>]) -> Result<Vec<Scored>, RankError> {
    for (index, v) in candidates.iter().enumerate() {
        if v.len() != query.len() {
            return Err(RankError::DimensionMismatch {
                query: query.len(),
                index,
                got: v.len(),
            });
        }
    }

    let mut scored: Vec<Scored> = candidates
        .par_iter()
        .enumerate()
        .map(|(index, v)| Scored {
            index,
            score: cosine(query, v),
        })
        .collect();

    // stable: equal scores keep candidate order
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(scored)
}
