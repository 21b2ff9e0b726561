//! Embedding backends and the fallback ladder.
//!
//! One capability trait over a closed set of variants:
//! - `remote`: external embedding service over a synthesized text description
//! - `offline`: local CLIP joint text/image model via fastembed
//! - `phash`: perceptual-hash fingerprint, lowest quality, zero dependency
//!
//! The ladder is evaluated once per pipeline instance; the chosen backend id
//! is recorded with every stored vector so comparisons are never cross-backend.

pub mod offline;
pub mod phash;
pub mod remote;

use std::path::Path;

use crate::config::EmbedderConfig;

/// Error type for embedding operations.
///
/// The kind decides fallback vs. abort: `Configuration` moves the ladder to
/// the next rung, `Engine` is a runtime failure of an otherwise working
/// backend.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("backend not configured: {0}")]
    Configuration(String),

    #[error("embedding failed: {0}")]
    Engine(String),
}

/// Capability set shared by all embedding backends.
pub trait EmbedBackend: Send + Sync {
    /// Stable backend/model identifier, stored alongside every vector.
    fn id(&self) -> &str;

    /// Embedding dimensionality for this backend.
    fn dimensions(&self) -> usize;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError>;
}

/// Evaluate the fallback ladder once and pick a backend.
///
/// `auto` tries remote, then offline, then perceptual hash. An explicit
/// backend name tries only that rung. Returns `None` when nothing is
/// available ("no-embedding" degraded mode) or when the config says `none`.
pub fn select_backend(config: &EmbedderConfig, base_dir: &Path) -> Option<Box<dyn EmbedBackend>> {
    let auto = config.backend == "auto";

    if config.backend == "none" {
        log::info!("embedding disabled by config, running degraded");
        return None;
    }

    if auto || config.backend == "remote" {
        match remote::RemoteTextEmbedder::new(&config.remote) {
            Ok(backend) => {
                log::info!("using remote embedding backend '{}'", backend.id());
                return Some(Box::new(backend));
            }
            Err(e) => log::warn!("remote embedding backend unavailable: {e}"),
        }
        if !auto {
            return None;
        }
    }

    if auto || config.backend == "offline" {
        match offline::OfflineMultimodalEmbedder::new(base_dir) {
            Ok(backend) => {
                log::info!("using offline embedding backend '{}'", backend.id());
                return Some(Box::new(backend));
            }
            Err(e) => log::warn!("offline embedding backend unavailable: {e}"),
        }
        if !auto {
            return None;
        }
    }

    if auto || config.backend == "phash" {
        log::info!("falling back to perceptual-hash embedding backend");
        return Some(Box::new(phash::PerceptualHashEmbedder::new()));
    }

    log::warn!("unknown embedding backend '{}', running degraded", config.backend);
    None
}

/// Synthesize a text description of a photo from its path and mtime.
///
/// Used by text-only backends: file stem and parent folder name with
/// separators expanded to words, plus the modified year as lightweight shot
/// metadata.
pub fn synthesize_description(path: &Path, mtime: std::time::SystemTime) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let folder = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let mut parts: Vec<String> = Vec::new();
    let words = |s: &str| {
        s.split(['-', '_', '.', ' '])
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let stem_words = words(stem);
    if !stem_words.is_empty() {
        parts.push(format!("photo {stem_words}"));
    }
    let folder_words = words(folder);
    if !folder_words.is_empty() {
        parts.push(format!("from {folder_words}"));
    }
    if let Ok(secs) = mtime.duration_since(std::time::UNIX_EPOCH) {
        // days-since-epoch to year, good enough for shot metadata
        let year = 1970 + secs.as_secs() / 31_557_600;
        parts.push(format!("taken {year}"));
    }

    parts.join(", ")
}
