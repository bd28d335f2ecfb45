//! The chunk store.
//!
//! Composes blob storage, the file index and the erasure codec into the
//! store/retrieve operations: deterministic chunking with stripe-aligned
//! zero padding, per-stripe parity, digest-named blobs and an atomically
//! committed record.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use pando_codec::ErasureCodec;
use pando_core::{Digest, Timestamp};
use pando_proto::FileRecord;

use crate::blob::{BlobStore, BlobStoreStats};
use crate::config::{tmp_path, StoreConfig};
use crate::index::FileIndex;
use crate::StoreError;

/// Content-addressable chunk store.
pub struct ChunkStore {
    config: StoreConfig,
    blobs: BlobStore,
    index: FileIndex,
}

impl ChunkStore {
    /// Opens the store rooted at the configured directory.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let blobs = BlobStore::open(config.clone())?;
        let index = FileIndex::open(config.index_path(), config.chunk_size)?;
        info!(
            dir = %config.storage_dir.display(),
            files = index.len(),
            "opened chunk store"
        );
        Ok(Self {
            config,
            blobs,
            index,
        })
    }

    /// Returns the configured chunk size.
    pub fn chunk_size(&self) -> u32 {
        self.config.chunk_size
    }

    /// Reads a file at `path`, chunks and erasure-encodes it, and commits
    /// the resulting record. Returns the file digest.
    ///
    /// Storing bytes that are already present is an idempotent success:
    /// the record's `accessed_at` is bumped and nothing is rewritten.
    pub fn store(
        &self,
        path: &Path,
        k: usize,
        m: usize,
        original_name: Option<String>,
    ) -> Result<Digest, StoreError> {
        if k < 1 || k + m > 255 {
            return Err(StoreError::InvalidParameters(format!("k={k}, m={m}")));
        }
        let codec = ErasureCodec::new(k, m)?;
        let chunk_size = self.config.chunk_size as usize;

        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut data_chunks: Vec<Digest> = Vec::new();
        let mut parity_chunks: Vec<Digest> = Vec::new();
        // Blobs written by this call, removed again if the commit fails.
        let mut written: Vec<Digest> = Vec::new();

        let mut stripe_buf = vec![0u8; k * chunk_size];
        loop {
            let n = read_up_to(&mut file, &mut stripe_buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&stripe_buf[..n]);
            size += n as u64;
            // Zero the tail so padding chunks are deterministic.
            stripe_buf[n..].fill(0);

            let shards: Vec<Vec<u8>> = stripe_buf
                .chunks(chunk_size)
                .map(|c| c.to_vec())
                .collect();
            let parity = codec.encode(&shards)?;

            let result = (|| -> Result<(), StoreError> {
                for shard in &shards {
                    let digest = Digest::of(shard);
                    self.write_new_blob(&digest, shard, &mut written)?;
                    data_chunks.push(digest);
                }
                for shard in &parity {
                    let digest = Digest::of(shard);
                    self.write_new_blob(&digest, shard, &mut written)?;
                    parity_chunks.push(digest);
                }
                Ok(())
            })();
            if let Err(e) = result {
                self.discard_blobs(&written);
                return Err(e);
            }

            if n < stripe_buf.len() {
                break;
            }
        }

        let file_digest = Digest::new(hasher.finalize().into());

        if self.index.contains(&file_digest) {
            debug!(file = %file_digest, "file already stored");
            self.index.touch(&file_digest)?;
            return Ok(file_digest);
        }

        let now = Timestamp::now();
        let record = FileRecord {
            file_digest,
            original_name,
            size,
            k,
            m,
            chunk_size: self.config.chunk_size,
            data_chunks,
            parity_chunks,
            created_at: now,
            accessed_at: now,
        };

        if let Err(e) = self.index.insert(record) {
            self.discard_blobs(&written);
            return Err(e);
        }

        info!(file = %file_digest, size, k, m, "stored file");
        Ok(file_digest)
    }

    /// Reassembles a stored file to `out_path`.
    ///
    /// Concatenates the data chunks in order, truncates the stripe padding
    /// and renames the result into place atomically. A data chunk absent
    /// from local storage surfaces as `MissingChunk`; the caller may then
    /// fetch it from the network and retry.
    pub fn retrieve(&self, file_digest: &Digest, out_path: &Path) -> Result<(), StoreError> {
        let record = self
            .index
            .get(file_digest)
            .ok_or(StoreError::FileNotFound(*file_digest))?;

        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = tmp_path(out_path);
        let result = self.write_assembled(&record, &tmp);
        match result {
            Ok(()) => {
                fs::rename(&tmp, out_path)?;
                self.index.touch(file_digest)?;
                debug!(file = %file_digest, out = %out_path.display(), "retrieved file");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn write_assembled(&self, record: &FileRecord, tmp: &Path) -> Result<(), StoreError> {
        let mut out = fs::File::create(tmp)?;
        let mut hasher = Sha256::new();
        let mut remaining = record.size;

        for digest in &record.data_chunks {
            if remaining == 0 {
                break;
            }
            let bytes = self.blobs.read(digest).map_err(|e| match e {
                StoreError::ChunkNotFound(d) => StoreError::MissingChunk(d),
                other => other,
            })?;
            if !digest.matches(&bytes) {
                return Err(StoreError::DigestMismatch {
                    expected: *digest,
                    actual: Digest::of(&bytes),
                });
            }
            let take = remaining.min(bytes.len() as u64) as usize;
            out.write_all(&bytes[..take])?;
            hasher.update(&bytes[..take]);
            remaining -= take as u64;
        }
        out.flush()?;

        let assembled = Digest::new(hasher.finalize().into());
        if assembled != record.file_digest {
            return Err(StoreError::DigestMismatch {
                expected: record.file_digest,
                actual: assembled,
            });
        }
        Ok(())
    }

    /// Reads one chunk's bytes.
    pub fn read_chunk(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        self.blobs.read(digest)
    }

    /// Writes one chunk iff its bytes hash to `digest`.
    pub fn write_chunk(&self, digest: &Digest, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.write(digest, bytes)
    }

    /// Returns true if the chunk blob is present locally.
    pub fn has_chunk(&self, digest: &Digest) -> bool {
        self.blobs.contains(digest)
    }

    /// Enumerates every chunk blob present locally.
    pub fn list_local_chunks(&self) -> Result<Vec<Digest>, StoreError> {
        self.blobs.list()
    }

    /// Returns every file record.
    pub fn list_files(&self) -> Vec<FileRecord> {
        self.index.records()
    }

    /// Returns the record for a file digest.
    pub fn get_record(&self, digest: &Digest) -> Option<FileRecord> {
        self.index.get(digest)
    }

    /// Commits a record learned from the network.
    ///
    /// Used after a fetch so the node becomes a holder of the file; already
    /// present records are an idempotent success.
    pub fn adopt_record(&self, record: FileRecord) -> Result<(), StoreError> {
        if !record.is_well_formed() {
            return Err(StoreError::InvalidParameters(
                "malformed file record".to_string(),
            ));
        }
        if self.index.contains(&record.file_digest) {
            return Ok(());
        }
        self.index.insert(record)
    }

    /// Deletes a file record, physically removing any chunk whose last
    /// reference it held.
    pub fn delete(&self, file_digest: &Digest) -> Result<(), StoreError> {
        let orphaned = self.index.remove(file_digest)?;
        for digest in &orphaned {
            self.blobs.remove(digest)?;
        }
        info!(file = %file_digest, orphaned = orphaned.len(), "deleted file");
        Ok(())
    }

    /// Returns blob-level counters.
    pub fn stats(&self) -> BlobStoreStats {
        self.blobs.stats()
    }

    fn write_new_blob(
        &self,
        digest: &Digest,
        bytes: &[u8],
        written: &mut Vec<Digest>,
    ) -> Result<(), StoreError> {
        let fresh = !self.blobs.contains(digest);
        self.blobs.write(digest, bytes)?;
        if fresh && !written.contains(digest) {
            written.push(*digest);
        }
        Ok(())
    }

    /// Best-effort rollback of blobs written by a failed store call; only
    /// blobs no record references are touched.
    fn discard_blobs(&self, written: &[Digest]) {
        for digest in written {
            if self.index.refcount(digest) == 0 {
                let _ = self.blobs.remove(digest);
            }
        }
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
