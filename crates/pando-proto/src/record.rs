//! File metadata records.

use serde::{Deserialize, Serialize};

use pando_core::{Digest, Timestamp};

/// Metadata for a complete stored file.
///
/// The record is keyed by `file_digest` (the hash of the original bytes)
/// and lists every data and parity chunk produced at store time. The same
/// JSON shape is used in the local index, in `FILE_METADATA` wire responses
/// and in `file:<digest>` DHT values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Digest of the concatenated original bytes. Unique primary key.
    pub file_digest: Digest,
    /// Optional display name. Never used for lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    /// Exact byte length of the original file.
    pub size: u64,
    /// Erasure data shard count per stripe.
    pub k: usize,
    /// Erasure parity shard count per stripe.
    pub m: usize,
    /// Chunking unit used at store time.
    pub chunk_size: u32,
    /// Ordered data chunk digests. Length is a multiple of `k`.
    pub data_chunks: Vec<Digest>,
    /// Ordered parity chunk digests. Length is `m * stripe_count`.
    pub parity_chunks: Vec<Digest>,
    /// When the record was created.
    pub created_at: Timestamp,
    /// Last access time; only this field is ever updated.
    pub accessed_at: Timestamp,
}

impl FileRecord {
    /// Number of data chunks a file of `size` bytes produces.
    ///
    /// ceil(size / chunk_size) rounded up to a multiple of `k`; zero for an
    /// empty file.
    pub fn expected_data_chunks(size: u64, chunk_size: u32, k: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let raw = size.div_ceil(chunk_size as u64) as usize;
        raw.div_ceil(k) * k
    }

    /// Number of `k + m` stripes in the file.
    pub fn stripe_count(&self) -> usize {
        if self.k == 0 {
            return 0;
        }
        self.data_chunks.len() / self.k
    }

    /// Iterates over every chunk digest, data first then parity.
    pub fn all_chunks(&self) -> impl Iterator<Item = &Digest> {
        self.data_chunks.iter().chain(self.parity_chunks.iter())
    }

    /// The data chunk digests of stripe `i`.
    pub fn data_stripe(&self, i: usize) -> &[Digest] {
        &self.data_chunks[i * self.k..(i + 1) * self.k]
    }

    /// The parity chunk digests of stripe `i`.
    pub fn parity_stripe(&self, i: usize) -> &[Digest] {
        &self.parity_chunks[i * self.m..(i + 1) * self.m]
    }

    /// Checks the structural invariants of the record.
    pub fn is_well_formed(&self) -> bool {
        if self.k < 1 || self.k + self.m > 255 || self.chunk_size == 0 {
            return false;
        }
        if self.data_chunks.len()
            != Self::expected_data_chunks(self.size, self.chunk_size, self.k)
        {
            return false;
        }
        if self.k != 0 && self.data_chunks.len() % self.k != 0 {
            return false;
        }
        if self.parity_chunks.len() != self.m * self.stripe_count() {
            return false;
        }
        self.created_at.0 <= self.accessed_at.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u64, k: usize, m: usize, chunk_size: u32) -> FileRecord {
        let data = FileRecord::expected_data_chunks(size, chunk_size, k);
        let stripes = data / k.max(1);
        let now = Timestamp::now();
        FileRecord {
            file_digest: Digest::of(&size.to_be_bytes()),
            original_name: Some("sample.bin".to_string()),
            size,
            k,
            m,
            chunk_size,
            data_chunks: (0..data as u64).map(|i| Digest::of(&i.to_be_bytes())).collect(),
            parity_chunks: (0..(m * stripes) as u64)
                .map(|i| Digest::of(&(1000 + i).to_be_bytes()))
                .collect(),
            created_at: now,
            accessed_at: now,
        }
    }

    #[test]
    fn test_expected_data_chunks() {
        // Empty file: no chunks at all.
        assert_eq!(FileRecord::expected_data_chunks(0, 65536, 4), 0);
        // 40 bytes with k=4: one real chunk, padded out to a full stripe.
        assert_eq!(FileRecord::expected_data_chunks(40, 65536, 4), 4);
        // Exactly k * chunk_size: one stripe, no padding.
        assert_eq!(FileRecord::expected_data_chunks(4 * 65536, 65536, 4), 4);
        // One byte over: a second stripe.
        assert_eq!(FileRecord::expected_data_chunks(4 * 65536 + 1, 65536, 4), 8);
    }

    #[test]
    fn test_stripe_accessors() {
        let r = record(2 * 4 * 1024, 4, 2, 1024);
        assert_eq!(r.stripe_count(), 2);
        assert_eq!(r.data_stripe(0).len(), 4);
        assert_eq!(r.parity_stripe(1).len(), 2);
        assert_eq!(r.all_chunks().count(), 8 + 4);
    }

    #[test]
    fn test_well_formed() {
        assert!(record(200_000, 4, 1, 65536).is_well_formed());
        assert!(record(0, 4, 1, 65536).is_well_formed());

        let mut bad = record(200_000, 4, 1, 65536);
        bad.parity_chunks.pop();
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn test_json_roundtrip_ignores_unknown_fields() {
        let r = record(1024, 2, 1, 512);
        let mut value = serde_json::to_value(&r).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("future_field".to_string(), serde_json::json!(42));
        let back: FileRecord = serde_json::from_value(value).unwrap();
        assert_eq!(r, back);
    }
}
