//! Content-addressed verdict cache.
//!
//! One JSON file per (preprocessed-image hash, query hash) key. Entries are
//! immutable once written: the verdict is a pure function of the key, so
//! concurrent writers of the same key are last-writer-wins safe and no
//! expiry logic exists. A corrupt entry is a miss and gets recomputed.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::verify::judge::Verdict;

pub struct VerdictCache {
    dir: PathBuf,
}

/// Cache key: sha256(sha256(image bytes) ++ sha256(query)).
pub fn cache_key(image_bytes: &[u8], query: &str) -> String {
    let image_hash: [u8; 32] = Sha256::digest(image_bytes).into();
    let query_hash: [u8; 32] = Sha256::digest(query.trim().as_bytes()).into();

    let mut hasher = Sha256::new();
    hasher.update(image_hash);
    hasher.update(query_hash);
    let key: [u8; 32] = hasher.finalize().into();

    key.iter().map(|b| format!("{b:02x}")).collect()
}

impl VerdictCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up a verdict. Unreadable or malformed entries count as misses.
    pub fn get(&self, key: &str) -> Option<Verdict> {
        let path = self.entry_path(key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                log::warn!("corrupt verdict cache entry {key}: {e}");
                None
            }
        }
    }

    /// Persist a verdict. Failures are logged, never surfaced: the cache is
    /// an optimization, not a correctness requirement.
    pub fn put(&self, key: &str, verdict: &Verdict) {
        if let Err(e) = self.try_put(key, verdict) {
            log::warn!("failed to write verdict cache entry {key}: {e}");
        }
    }

    fn try_put(&self, key: &str, verdict: &Verdict) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.entry_path(key);
        let temp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec(verdict)?;

        std::fs::write(&temp_path, &bytes)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Delete the whole cache directory (forces recomputation).
    pub fn clear(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
