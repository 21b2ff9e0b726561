//! Media items and content signatures.
//!
//! A `MediaItem` identifies one photo on disk. Its signature covers the
//! path, the last-modified time and the embedding backend id, so a stored
//! vector goes stale whenever the file changes or the backend changes.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Image extensions the pipeline accepts (the file layer filters to these).
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff"];

/// One photo in the collection.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub path: PathBuf,
    pub mtime: SystemTime,
}

impl MediaItem {
    /// Build an item from a path, reading the file's mtime.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let mtime = std::fs::metadata(path)?.modified()?;
        Ok(Self {
            path: path.to_path_buf(),
            mtime,
        })
    }

    /// Content signature: path + mtime seconds + backend id.
    ///
    /// Two items with equal signatures have, as far as the store can tell,
    /// identical embeddable content for the given backend.
    pub fn signature(&self, backend_id: &str) -> u64 {
        use std::hash::{Hash, Hasher};

        let mtime_secs = self
            .mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.path.hash(&mut hasher);
        mtime_secs.hash(&mut hasher);
        backend_id.hash(&mut hasher);
        hasher.finish()
    }
}

/// Check whether a path has a supported image extension.
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            SUPPORTED_EXTENSIONS.iter().any(|s| *s == e)
        })
        .unwrap_or(false)
}

/// Recursively collect supported image paths under a directory, sorted for
/// deterministic candidate order.
pub fn collect_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_into(dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_into(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            // unreadable subdirectories are skipped, not fatal
            if let Err(e) = collect_into(&path, out) {
                log::warn!("skipping {}: {e}", path.display());
            }
        } else if is_supported_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}
