//! Chunk blob storage.
//!
//! Each chunk lives as a raw file named by the lowercase hex of its digest,
//! directly under the storage directory. Names are content digests, so
//! concurrent writes of the same digest are idempotent and the last
//! completer wins the rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use pando_core::Digest;
use tracing::{debug, warn};

use crate::config::{StoreConfig, INDEX_FILE, TMP_SUFFIX};
use crate::StoreError;

/// Statistics for the blob store.
#[derive(Debug, Default, Clone)]
pub struct BlobStoreStats {
    /// Blobs written since open.
    pub chunks_stored: u64,
    /// Bytes written since open.
    pub bytes_stored: u64,
    /// Successful reads.
    pub hits: u64,
    /// Reads of absent blobs.
    pub misses: u64,
}

/// Digest-named chunk blobs on disk.
pub struct BlobStore {
    config: StoreConfig,
    stats: RwLock<BlobStoreStats>,
}

impl BlobStore {
    /// Opens the blob store, creating the directory and sweeping any
    /// transient files a crashed writer left behind.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.create_dirs()?;
        let store = Self {
            config,
            stats: RwLock::new(BlobStoreStats::default()),
        };
        store.sweep_temp_files()?;
        Ok(store)
    }

    /// Returns the blob path for a digest.
    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.config.blob_path(&digest.to_hex())
    }

    /// Writes a chunk iff its bytes hash to `digest`.
    ///
    /// A blob already on disk is left untouched (deduplication). The write
    /// goes to a temp file renamed into place; one transient IO failure is
    /// retried before surfacing.
    pub fn write(&self, digest: &Digest, bytes: &[u8]) -> Result<(), StoreError> {
        let actual = Digest::of(bytes);
        if actual != *digest {
            return Err(StoreError::DigestMismatch {
                expected: *digest,
                actual,
            });
        }

        let path = self.path_of(digest);
        if path.exists() {
            debug!(digest = %digest, "chunk already present, skipping write");
            return Ok(());
        }

        if let Err(first) = write_atomic(&path, bytes) {
            warn!(digest = %digest, error = %first, "chunk write failed, retrying once");
            write_atomic(&path, bytes)?;
        }

        let mut stats = self.stats.write();
        stats.chunks_stored += 1;
        stats.bytes_stored += bytes.len() as u64;
        debug!(digest = %digest, size = bytes.len(), "stored chunk");
        Ok(())
    }

    /// Reads a chunk's bytes.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_of(digest)) {
            Ok(bytes) => {
                self.stats.write().hits += 1;
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.stats.write().misses += 1;
                Err(StoreError::ChunkNotFound(*digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if a blob for `digest` is on disk.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.path_of(digest).exists()
    }

    /// Removes a blob; absent blobs are fine.
    pub fn remove(&self, digest: &Digest) -> Result<(), StoreError> {
        match fs::remove_file(self.path_of(digest)) {
            Ok(()) => {
                debug!(digest = %digest, "deleted chunk");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerates the digests of every blob in the storage directory
    /// without loading their contents.
    pub fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let mut digests = Vec::new();
        for entry in fs::read_dir(&self.config.storage_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == INDEX_FILE || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            if let Ok(digest) = Digest::from_hex(&name) {
                digests.push(digest);
            }
        }
        Ok(digests)
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> BlobStoreStats {
        self.stats.read().clone()
    }

    fn sweep_temp_files(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.config.storage_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(file = %name.to_string_lossy(), "removing stale temp file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Writes `bytes` to `path` via a temp sibling and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = crate::config::tmp_path(path);
    fs::write(&tmp, bytes)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}
