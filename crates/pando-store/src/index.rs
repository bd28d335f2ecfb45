//! The file index.
//!
//! Maps file digests to their records and tracks how many record references
//! each chunk has. The index persists as `index.json`: writers always
//! produce a fully-formed replacement that is renamed over the previous
//! file, so a concurrent reader never observes a torn state. Readers take
//! cheap snapshots; writers serialize under a single lock held for the
//! in-memory update and the file replace.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use pando_core::Digest;
use pando_proto::FileRecord;

use crate::blob::write_atomic;
use crate::StoreError;

/// On-disk format version accepted by this build.
pub const INDEX_VERSION: u32 = 1;

/// Digest algorithm recorded in the header.
pub const DIGEST_ALGO: &str = "sha-256";

/// The serialized shape of `index.json`.
///
/// The header pins the digest algorithm and chunking unit so a future
/// format change cannot silently corrupt an old store.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    digest_algo: String,
    chunk_size: u32,
    files: BTreeMap<String, FileRecord>,
}

#[derive(Debug, Default)]
struct IndexState {
    files: HashMap<Digest, FileRecord>,
    refcounts: HashMap<Digest, u32>,
}

impl IndexState {
    fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            for digest in record.all_chunks() {
                *state.refcounts.entry(*digest).or_insert(0) += 1;
            }
            state.files.insert(record.file_digest, record);
        }
        state
    }
}

/// Mapping from file digest to record, persisted atomically.
pub struct FileIndex {
    path: PathBuf,
    chunk_size: u32,
    state: RwLock<Arc<IndexState>>,
    // Serializes writers; never held while a reader snapshots.
    write_lock: Mutex<()>,
}

impl FileIndex {
    /// Opens the index at `path`, creating an empty one if absent.
    ///
    /// An unreadable file or an incompatible header surfaces as
    /// `StoreError::Corrupt`; the store never silently discards an index.
    pub fn open(path: PathBuf, chunk_size: u32) -> Result<Self, StoreError> {
        let state = match fs::read(&path) {
            Ok(bytes) => {
                let file: IndexFile = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                if file.version != INDEX_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported index version {}",
                        file.version
                    )));
                }
                if file.digest_algo != DIGEST_ALGO {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported digest algorithm {:?}",
                        file.digest_algo
                    )));
                }
                IndexState::from_records(file.files.into_values())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => IndexState::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(files = state.files.len(), path = %path.display(), "opened file index");
        Ok(Self {
            path,
            chunk_size,
            state: RwLock::new(Arc::new(state)),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the record for a file digest.
    pub fn get(&self, digest: &Digest) -> Option<FileRecord> {
        self.snapshot().files.get(digest).cloned()
    }

    /// Returns true if a record exists for `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.snapshot().files.contains_key(digest)
    }

    /// Returns every record.
    pub fn records(&self) -> Vec<FileRecord> {
        self.snapshot().files.values().cloned().collect()
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.snapshot().files.len()
    }

    /// Returns true if the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the reference count of a chunk.
    pub fn refcount(&self, digest: &Digest) -> u32 {
        self.snapshot().refcounts.get(digest).copied().unwrap_or(0)
    }

    /// Inserts a new record and increments the reference count of every
    /// chunk it names, once per occurrence.
    ///
    /// The caller guarantees the digest is not already present; use
    /// [`FileIndex::touch`] for an idempotent re-store.
    pub fn insert(&self, record: FileRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut next = self.clone_state();
        for digest in record.all_chunks() {
            *next.refcounts.entry(*digest).or_insert(0) += 1;
        }
        next.files.insert(record.file_digest, record);
        self.commit(next)
    }

    /// Bumps a record's `accessed_at` to now.
    pub fn touch(&self, digest: &Digest) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut next = self.clone_state();
        let record = next
            .files
            .get_mut(digest)
            .ok_or(StoreError::FileNotFound(*digest))?;
        record.accessed_at = pando_core::Timestamp::now();
        self.commit(next)
    }

    /// Removes a record, decrementing reference counts.
    ///
    /// Returns the digests of chunks whose count reached zero; the caller
    /// removes their blobs.
    pub fn remove(&self, digest: &Digest) -> Result<Vec<Digest>, StoreError> {
        let _guard = self.write_lock.lock();
        let mut next = self.clone_state();
        let record = next
            .files
            .remove(digest)
            .ok_or(StoreError::FileNotFound(*digest))?;

        let mut orphaned = Vec::new();
        for chunk in record.all_chunks() {
            match next.refcounts.get_mut(chunk) {
                Some(count) if *count > 1 => *count -= 1,
                _ => {
                    if next.refcounts.remove(chunk).is_some() && !orphaned.contains(chunk) {
                        orphaned.push(*chunk);
                    }
                }
            }
        }
        self.commit(next)?;
        Ok(orphaned)
    }

    fn snapshot(&self) -> Arc<IndexState> {
        self.state.read().clone()
    }

    fn clone_state(&self) -> IndexState {
        let current = self.snapshot();
        IndexState {
            files: current.files.clone(),
            refcounts: current.refcounts.clone(),
        }
    }

    /// Persists `next` and swaps it in. On persist failure the in-memory
    /// state is left unchanged, keeping memory and disk in step.
    fn commit(&self, next: IndexState) -> Result<(), StoreError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            digest_algo: DIGEST_ALGO.to_string(),
            chunk_size: self.chunk_size,
            files: next
                .files
                .values()
                .map(|r| (r.file_digest.to_hex(), r.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        *self.state.write() = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pando_core::Timestamp;
    use tempfile::TempDir;

    fn sample_record(tag: u8, chunks: &[Digest]) -> FileRecord {
        let now = Timestamp::now();
        FileRecord {
            file_digest: Digest::of(&[tag]),
            original_name: Some(format!("file-{tag}")),
            size: chunks.len() as u64 * 16,
            k: chunks.len().max(1),
            m: 0,
            chunk_size: 16,
            data_chunks: chunks.to_vec(),
            parity_chunks: vec![],
            created_at: now,
            accessed_at: now,
        }
    }

    fn open_index(dir: &TempDir) -> FileIndex {
        FileIndex::open(dir.path().join("index.json"), 16).unwrap()
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let chunks = vec![Digest::of(b"c1"), Digest::of(b"c2")];
        let record = sample_record(1, &chunks);
        index.insert(record.clone()).unwrap();

        assert_eq!(index.get(&record.file_digest).unwrap(), record);
        assert_eq!(index.refcount(&chunks[0]), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let record = sample_record(2, &[Digest::of(b"persist")]);

        {
            let index = open_index(&dir);
            index.insert(record.clone()).unwrap();
        }

        let index = open_index(&dir);
        assert_eq!(index.get(&record.file_digest).unwrap(), record);
        assert_eq!(index.refcount(&Digest::of(b"persist")), 1);
    }

    #[test]
    fn test_shared_chunk_refcounting() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let shared = Digest::of(b"shared");
        index.insert(sample_record(1, &[shared])).unwrap();
        index.insert(sample_record(2, &[shared])).unwrap();
        assert_eq!(index.refcount(&shared), 2);

        // First delete keeps the chunk alive.
        let orphaned = index.remove(&Digest::of(&[1])).unwrap();
        assert!(orphaned.is_empty());
        assert_eq!(index.refcount(&shared), 1);

        // Second delete orphans it.
        let orphaned = index.remove(&Digest::of(&[2])).unwrap();
        assert_eq!(orphaned, vec![shared]);
        assert_eq!(index.refcount(&shared), 0);
    }

    #[test]
    fn test_duplicate_chunks_within_one_record() {
        // Zero-padding chunks repeat the same digest inside a single
        // record; each occurrence counts.
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let pad = Digest::of(&[0u8; 16]);
        index.insert(sample_record(3, &[pad, pad, pad])).unwrap();
        assert_eq!(index.refcount(&pad), 3);

        let orphaned = index.remove(&Digest::of(&[3])).unwrap();
        assert_eq!(orphaned, vec![pad]);
    }

    #[test]
    fn test_touch_updates_only_accessed_at() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        let mut record = sample_record(4, &[Digest::of(b"t")]);
        record.accessed_at = Timestamp::new(record.created_at.0);
        index.insert(record.clone()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        index.touch(&record.file_digest).unwrap();

        let after = index.get(&record.file_digest).unwrap();
        assert_eq!(after.created_at, record.created_at);
        assert!(after.accessed_at.0 >= record.accessed_at.0);
    }

    #[test]
    fn test_remove_unknown_file() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);
        assert!(matches!(
            index.remove(&Digest::of(b"nope")),
            Err(StoreError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_index_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.json"), b"not json {").unwrap();
        assert!(matches!(
            FileIndex::open(dir.path().join("index.json"), 16),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_future_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let contents = serde_json::json!({
            "version": 2,
            "digest_algo": "sha-256",
            "chunk_size": 16,
            "files": {}
        });
        fs::write(
            dir.path().join("index.json"),
            serde_json::to_vec(&contents).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            FileIndex::open(dir.path().join("index.json"), 16),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_index_file_always_parses() {
        // After any sequence of operations the on-disk file parses as a
        // complete index.
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir);

        for tag in 0..5u8 {
            index
                .insert(sample_record(tag, &[Digest::of(&[tag, tag])]))
                .unwrap();
        }
        index.remove(&Digest::of(&[2])).unwrap();
        index.touch(&Digest::of(&[3])).unwrap();

        let bytes = fs::read(dir.path().join("index.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["digest_algo"], "sha-256");
        assert_eq!(parsed["files"].as_object().unwrap().len(), 4);
    }
}
