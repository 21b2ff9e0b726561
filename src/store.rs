//! Persistent, content-keyed vector store.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the backend id)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - path_len: u16 (little-endian), then path bytes (UTF-8)
//! - signature: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! The store is an opaque cache: any unreadable or incompatible file is
//! replaced by a fresh empty store, never surfaced as a fatal error.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::embed::EmbedBackend;
use crate::media::MediaItem;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error("version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("model mismatch: file was written by a different backend")]
    ModelMismatch,

    #[error("checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

/// A stored embedding with the signature it was computed from.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub signature: u64,
    pub vector: Vec<f32>,
}

/// Embedding store for one backend. Owns all embedding records.
pub struct VectorStore {
    path: PathBuf,
    model_id: [u8; 32],
    dimensions: usize,
    records: HashMap<PathBuf, EmbeddingRecord>,
}

impl VectorStore {
    /// Open the store file for the given backend, or start fresh.
    ///
    /// A file written by a different backend, an unsupported version or a
    /// corrupt file all mean "start fresh and recompute" (the cache is
    /// disposable by contract).
    pub fn open(path: PathBuf, backend_id: &str, dimensions: usize) -> Self {
        let model_id = model_id_hash(backend_id);

        let records = if path.exists() {
            match load_records(&path, &model_id, dimensions) {
                Ok(records) => {
                    log::info!("loaded {} embeddings from {}", records.len(), path.display());
                    records
                }
                Err(StoreError::ModelMismatch) => {
                    log::warn!("embedding backend changed, starting a fresh store");
                    HashMap::new()
                }
                Err(e) => {
                    log::warn!("unreadable embedding store ({e}), starting fresh");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Self {
            path,
            model_id,
            dimensions,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Recompute and store the embedding only if the stored signature
    /// differs from the item's current one.
    ///
    /// Returns true when the record is up to date afterwards (including the
    /// no-op case). An embedding failure leaves any previous record intact
    /// and returns false.
    pub fn upsert(&mut self, item: &MediaItem, backend: &dyn EmbedBackend) -> bool {
        let signature = item.signature(backend.id());

        if let Some(record) = self.records.get(&item.path) {
            if record.signature == signature {
                return true;
            }
        }

        match backend.embed_image(&item.path) {
            Ok(vector) => {
                if vector.len() != self.dimensions {
                    log::warn!(
                        "{}: backend returned {} dims, expected {}",
                        item.path.display(),
                        vector.len(),
                        self.dimensions
                    );
                    return false;
                }
                self.records
                    .insert(item.path.clone(), EmbeddingRecord { signature, vector });
                true
            }
            Err(e) => {
                log::warn!("failed to embed {}: {e}", item.path.display());
                false
            }
        }
    }

    pub fn get(&self, path: &Path) -> Option<&[f32]> {
        self.records.get(path).map(|r| r.vector.as_slice())
    }

    /// Save to disk. Atomic: temp file -> fsync -> rename.
    pub fn save(&self) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Delete the backing file at `path`; the next open starts fresh.
    /// Returns whether a file was actually removed.
    pub fn remove(path: &Path) -> std::io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write_to_file(&self, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        // the entry count goes into the header, so unwritable records must
        // be excluded before it is emitted
        let writable: Vec<(&PathBuf, &EmbeddingRecord)> = self
            .records
            .iter()
            .filter(|(path, _)| {
                let fits = path.to_string_lossy().len() <= u16::MAX as usize;
                if !fits {
                    log::warn!("skipping absurdly long path: {}", path.display());
                }
                fits
            })
            .collect();

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(&self.model_id);
        header_bytes[33..35].copy_from_slice(&(self.dimensions as u16).to_le_bytes());
        header_bytes[35..43].copy_from_slice(&(writable.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        for (path, record) in writable {
            let path_str = path.to_string_lossy();
            let path_bytes = path_str.as_bytes();
            writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
            writer.write_all(path_bytes)?;
            writer.write_all(&record.signature.to_le_bytes())?;
            for &value in &record.vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(())
    }
}

/// SHA256 of the backend id, stored in the header so vectors from different
/// backends are never mixed.
pub fn model_id_hash(backend_id: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(backend_id.as_bytes());
    hasher.finalize().into()
}

fn load_records(
    path: &Path,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<HashMap<PathBuf, EmbeddingRecord>, StoreError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(StoreError::ChecksumMismatch);
    }

    if header_bytes[1..33] != expected_model_id[..] {
        return Err(StoreError::ModelMismatch);
    }

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]) as usize;
    if dimensions != expected_dimensions {
        return Err(StoreError::InvalidFormat(format!(
            "dimension mismatch: expected {expected_dimensions}, file has {dimensions}"
        )));
    }

    let entry_count = u64::from_le_bytes(header_bytes[35..43].try_into().unwrap());

    let mut records = HashMap::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let mut len_bytes = [0u8; 2];
        reader.read_exact(&mut len_bytes)?;
        let path_len = u16::from_le_bytes(len_bytes) as usize;

        let mut path_bytes = vec![0u8; path_len];
        reader.read_exact(&mut path_bytes)?;
        let path_str = String::from_utf8(path_bytes)
            .map_err(|e| StoreError::InvalidFormat(format!("non-utf8 path: {e}")))?;

        let mut sig_bytes = [0u8; 8];
        reader.read_exact(&mut sig_bytes)?;
        let signature = u64::from_le_bytes(sig_bytes);

        let mut vector = Vec::with_capacity(dimensions);
        let mut float_bytes = [0u8; 4];
        for _ in 0..dimensions {
            reader.read_exact(&mut float_bytes)?;
            vector.push(f32::from_le_bytes(float_bytes));
        }

        records.insert(PathBuf::from(path_str), EmbeddingRecord { signature, vector });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedError;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "fotoseek-store-test-{}-{}.bin",
            std::process::id(),
            counter
        ))
    }

    /// Backend that counts invocations and can be told to fail.
    struct CountingBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingBackend {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl EmbedBackend for CountingBackend {
        fn id(&self) -> &str {
            "test:counting"
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn embed_text(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        fn embed_image(&self, _path: &Path) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EmbedError::Engine("engine down".to_string()))
            } else {
                Ok(vec![0.0, 1.0, 0.0])
            }
        }
    }

    fn test_item(path: &str, secs: u64) -> MediaItem {
        MediaItem {
            path: PathBuf::from(path),
            mtime: UNIX_EPOCH + std::time::Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_upsert_idempotent() {
        let mut store = VectorStore::open(temp_path(), "test:counting", 3);
        let backend = CountingBackend::new(false);
        let item = test_item("/photos/cat.jpg", 1000);

        assert!(store.upsert(&item, &backend));
        assert!(store.upsert(&item, &backend));

        // unchanged file: the embedder ran at most once
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_recomputes_on_mtime_change() {
        let mut store = VectorStore::open(temp_path(), "test:counting", 3);
        let backend = CountingBackend::new(false);

        assert!(store.upsert(&test_item("/photos/cat.jpg", 1000), &backend));
        assert!(store.upsert(&test_item("/photos/cat.jpg", 2000), &backend));

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_failure_keeps_previous_record() {
        let mut store = VectorStore::open(temp_path(), "test:counting", 3);
        let item_v1 = test_item("/photos/cat.jpg", 1000);
        let item_v2 = test_item("/photos/cat.jpg", 2000);

        let ok_backend = CountingBackend::new(false);
        assert!(store.upsert(&item_v1, &ok_backend));
        let stored = store.get(Path::new("/photos/cat.jpg")).unwrap().to_vec();

        let failing = CountingBackend::new(true);
        assert!(!store.upsert(&item_v2, &failing));

        // previous vector is untouched
        assert_eq!(store.get(Path::new("/photos/cat.jpg")).unwrap(), &stored[..]);
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path();
        let backend = CountingBackend::new(false);

        {
            let mut store = VectorStore::open(path.clone(), "test:counting", 3);
            store.upsert(&test_item("/photos/a.jpg", 10), &backend);
            store.upsert(&test_item("/photos/b.jpg", 20), &backend);
            store.save().unwrap();
        }

        let store = VectorStore::open(path.clone(), "test:counting", 3);
        assert_eq!(store.len(), 2);
        assert!(store.get(Path::new("/photos/a.jpg")).is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_skips_overlong_path_without_desync() {
        let path = temp_path();
        let backend = CountingBackend::new(false);

        {
            let mut store = VectorStore::open(path.clone(), "test:counting", 3);
            store.upsert(&test_item("/photos/a.jpg", 10), &backend);
            let long = format!("/photos/{}.jpg", "x".repeat(70_000));
            store.upsert(&test_item(&long, 20), &backend);
            store.save().unwrap();
        }

        // the skipped entry must not be counted in the header: the file
        // stays readable and the normal record survives
        let store = VectorStore::open(path.clone(), "test:counting", 3);
        assert_eq!(store.len(), 1);
        assert!(store.get(Path::new("/photos/a.jpg")).is_some());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_remove_deletes_backing_file() {
        let path = temp_path();
        let backend = CountingBackend::new(false);

        {
            let mut store = VectorStore::open(path.clone(), "test:counting", 3);
            store.upsert(&test_item("/photos/a.jpg", 10), &backend);
            store.save().unwrap();
        }

        assert!(VectorStore::remove(&path).unwrap());
        assert!(!VectorStore::remove(&path).unwrap());
        assert!(VectorStore::open(path, "test:counting", 3).is_empty());
    }

    #[test]
    fn test_backend_change_starts_fresh() {
        let path = temp_path();
        let backend = CountingBackend::new(false);

        {
            let mut store = VectorStore::open(path.clone(), "test:counting", 3);
            store.upsert(&test_item("/photos/a.jpg", 10), &backend);
            store.save().unwrap();
        }

        let store = VectorStore::open(path.clone(), "other:backend", 3);
        assert!(store.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let path = temp_path();
        let backend = CountingBackend::new(false);

        {
            let mut store = VectorStore::open(path.clone(), "test:counting", 3);
            store.upsert(&test_item("/photos/a.jpg", 10), &backend);
            store.save().unwrap();
        }

        // flip a byte inside the header
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        // corruption is a cache miss, not an error
        let store = VectorStore::open(path.clone(), "test:counting", 3);
        assert!(store.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_cleans_up_temp_on_error() {
        let path = PathBuf::from("/nonexistent/directory/embeddings.bin");
        let store = VectorStore::open(path.clone(), "test:counting", 3);

        assert!(store.save().is_err());
        assert!(!path.with_extension("tmp").exists());
    }
}
