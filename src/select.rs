//! Candidate selection for large collections.
//!
//! Narrows the candidate set before exact scoring:
//! - hash pre-filter: sign-quantized fingerprints ranked by Hamming distance
//! - ANN: HNSW cosine index, approximate top-k
//!
//! Every mode is correctness-equivalent (the survivors are always re-scored
//! exactly by the ranker); modes only trade recall for latency.

use hnsw_rs::prelude::*;

use crate::config::SelectorConfig;

/// Selection strategy. `Auto` picks per collection size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorMode {
    Auto,
    Ann,
    HashFilter,
    Exact,
}

impl SelectorMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "ann" => Some(Self::Ann),
            "hashfilter" => Some(Self::HashFilter),
            "exact" => Some(Self::Exact),
            _ => None,
        }
    }
}

/// Indices (into the caller's candidate list) that survive pre-selection.
#[derive(Debug)]
pub struct Selection {
    pub indices: Vec<usize>,
    /// The mode actually used after resolving `Auto`.
    pub mode: SelectorMode,
}

/// Narrow `vectors` to the candidates worth exact-scoring against `query`.
pub fn select(
    query: &[f32],
    vectors: &[Vec<f32>],
    top_k: usize,
    config: &SelectorConfig,
) -> Selection {
    let mode = SelectorMode::parse(&config.mode).unwrap_or(SelectorMode::Auto);
    let n = vectors.len();

    let resolved = match mode {
        SelectorMode::Auto => {
            if n > config.ann_threshold && !query.is_empty() {
                SelectorMode::Ann
            } else if n > config.preselect {
                SelectorMode::HashFilter
            } else {
                SelectorMode::Exact
            }
        }
        explicit => explicit,
    };

    match resolved {
        SelectorMode::Exact | SelectorMode::Auto => Selection {
            indices: (0..n).collect(),
            mode: SelectorMode::Exact,
        },
        SelectorMode::HashFilter => Selection {
            indices: hash_prefilter(query, vectors, config.preselect),
            mode: SelectorMode::HashFilter,
        },
        SelectorMode::Ann => Selection {
            indices: ann_top_k(query, vectors, top_k.max(config.preselect), config),
            mode: SelectorMode::Ann,
        },
    }
}

/// Sign-quantize a vector into a 64-bit fingerprint (first 64 components).
fn sign_fingerprint(v: &[f32]) -> u64 {
    let mut bits = 0u64;
    for (i, &x) in v.iter().take(64).enumerate() {
        if x > 0.0 {
            bits |= 1u64 << i;
        }
    }
    bits
}

/// Rank by Hamming distance to the quantized query and keep the closest
/// `preselect` candidates. Ties keep candidate order.
fn hash_prefilter(query: &[f32], vectors: &[Vec<f32>], preselect: usize) -> Vec<usize> {
    let anchor = sign_fingerprint(query);

    let mut ranked: Vec<(u32, usize)> = vectors
        .iter()
        .enumerate()
        .map(|(idx, v)| ((sign_fingerprint(v) ^ anchor).count_ones(), idx))
        .collect();

    ranked.sort_by_key(|&(dist, idx)| (dist, idx));
    ranked.truncate(preselect);
    ranked.into_iter().map(|(_, idx)| idx).collect()
}

/// Approximate top-k through an HNSW cosine index built over the candidates.
fn ann_top_k(query: &[f32], vectors: &[Vec<f32>], k: usize, config: &SelectorConfig) -> Vec<usize> {
    let hnsw = Hnsw::<f32, DistCosine>::new(
        config.hnsw_max_connections,
        vectors.len(),
        16,
        config.hnsw_ef_construction,
        DistCosine {},
    );

    for (idx, v) in vectors.iter().enumerate() {
        hnsw.insert((v, idx));
    }

    let neighbours = hnsw.search(query, k.min(vectors.len()), config.hnsw_ef_search);
    neighbours.into_iter().map(|n| n.d_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: &str) -> SelectorConfig {
        SelectorConfig {
            mode: mode.to_string(),
            preselect: 4,
            ann_threshold: 100,
            hnsw_max_connections: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
        }
    }

    fn axis_vectors(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let angle = (i as f32) * 0.05;
                vec![angle.cos(), angle.sin(), 0.0, 0.0]
            })
            .collect()
    }

    #[test]
    fn test_exact_keeps_everything() {
        let vectors = axis_vectors(10);
        let sel = select(&[1.0, 0.0, 0.0, 0.0], &vectors, 5, &config("exact"));
        assert_eq!(sel.mode, SelectorMode::Exact);
        assert_eq!(sel.indices.len(), 10);
    }

    #[test]
    fn test_auto_small_collection_is_exact() {
        let vectors = axis_vectors(3);
        let sel = select(&[1.0, 0.0, 0.0, 0.0], &vectors, 5, &config("auto"));
        assert_eq!(sel.mode, SelectorMode::Exact);
    }

    #[test]
    fn test_auto_medium_collection_uses_hash_prefilter() {
        let vectors = axis_vectors(20);
        let sel = select(&[1.0, 0.0, 0.0, 0.0], &vectors, 5, &config("auto"));
        assert_eq!(sel.mode, SelectorMode::HashFilter);
        assert_eq!(sel.indices.len(), 4);
    }

    #[test]
    fn test_hash_prefilter_prefers_matching_signs() {
        let query = vec![1.0, 1.0, -1.0, -1.0];
        let vectors = vec![
            vec![-1.0, -1.0, 1.0, 1.0], // opposite signs, furthest
            vec![1.0, 1.0, -1.0, -1.0], // identical signs
            vec![1.0, -1.0, -1.0, -1.0],
        ];
        let indices = hash_prefilter(&query, &vectors, 2);
        assert_eq!(indices[0], 1);
        assert!(!indices.contains(&0));
    }

    #[test]
    fn test_hash_prefilter_tie_break_is_candidate_order() {
        let query = vec![1.0, 1.0];
        let vectors = vec![vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0, 1.0]];
        let indices = hash_prefilter(&query, &vectors, 2);
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_ann_finds_nearest() {
        let vectors = axis_vectors(200);
        let query = vectors[7].clone();
        let sel = select(&query, &vectors, 5, &config("ann"));
        assert_eq!(sel.mode, SelectorMode::Ann);
        assert!(sel.indices.contains(&7));
    }

    #[test]
    fn test_unknown_mode_falls_back_to_auto() {
        let vectors = axis_vectors(3);
        let sel = select(&[1.0, 0.0, 0.0, 0.0], &vectors, 5, &config("wat"));
        assert_eq!(sel.mode, SelectorMode::Exact);
    }
}
