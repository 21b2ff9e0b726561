//! Perceptual-hash embedding backend.
//!
//! Lowest rung of the fallback ladder: a 64-bit difference hash of the image,
//! exposed as a ±1.0 vector so Hamming distance maps directly onto cosine
//! similarity (cos = (64 − 2·hamming) / 64). No model download, no network.
//! Text queries hash their tokens into bit positions, which is crude but
//! deterministic; this backend trades quality for always being available.

use std::path::Path;

use image::imageops::FilterType;

use crate::embed::{EmbedBackend, EmbedError};

pub const BACKEND_ID: &str = "phash:dhash64";

/// Number of bits in the fingerprint and length of the embedding.
pub const BITS: usize = 64;

pub struct PerceptualHashEmbedder;

impl PerceptualHashEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PerceptualHashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the 64-bit dHash of an image: 9x8 grayscale, each bit set when a
/// pixel is brighter than its right-hand neighbor.
pub fn dhash(img: &image::DynamicImage) -> u64 {
    let small = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();

    let mut hash = 0u64;
    let mut bit = 0;
    for y in 0..8 {
        for x in 0..8 {
            if small.get_pixel(x, y)[0] > small.get_pixel(x + 1, y)[0] {
                hash |= 1u64 << bit;
            }
            bit += 1;
        }
    }
    hash
}

/// Hash query tokens into fingerprint bit positions.
pub fn text_fingerprint(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut fingerprint = 0u64;
    for token in text
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        let h = hasher.finish();
        // each token contributes two bits
        fingerprint |= 1u64 << (h % 64);
        fingerprint |= 1u64 << ((h >> 8) % 64);
    }
    fingerprint
}

/// Expand a fingerprint into a ±1.0 vector of length `BITS`.
pub fn fingerprint_to_vector(fingerprint: u64) -> Vec<f32> {
    (0..BITS)
        .map(|bit| {
            if fingerprint & (1u64 << bit) != 0 {
                1.0
            } else {
                -1.0
            }
        })
        .collect()
}

impl EmbedBackend for PerceptualHashEmbedder {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn dimensions(&self) -> usize {
        BITS
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(fingerprint_to_vector(text_fingerprint(text)))
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let img = image::open(path)
            .map_err(|e| EmbedError::Engine(format!("{}: {e}", path.display())))?;
        Ok(fingerprint_to_vector(dhash(&img)))
    }
}
