//! Pando Codec - Reed-Solomon erasure coding.
//!
//! A `(k, m)` codec over GF(2^8): `encode` turns `k` equal-length data
//! shards into `m` parity shards, and `decode` reconstructs the data shards
//! from any `k` of the `k + m`. Encoding is deterministic and the codec is
//! pure, so a single instance may be shared freely between tasks.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Maximum total shard count representable in a GF(2^8) code.
pub const MAX_TOTAL_SHARDS: usize = 255;

/// Errors from erasure coding operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid (k, m) parameters
    #[error("invalid erasure parameters: k={k}, m={m}")]
    InvalidParameters {
        /// Data shard count
        k: usize,
        /// Parity shard count
        m: usize,
    },

    /// Shards have inconsistent lengths or counts
    #[error("shard shape mismatch: {0}")]
    ShardMismatch(String),

    /// Too few shards survive to reconstruct the stripe
    #[error("unrecoverable: {available} of {required} required shards available")]
    Unrecoverable {
        /// Shards present
        available: usize,
        /// Shards needed
        required: usize,
    },

    /// Error from the underlying Reed-Solomon implementation
    #[error("reed-solomon error: {0}")]
    ReedSolomon(String),
}

impl From<reed_solomon_erasure::Error> for CodecError {
    fn from(e: reed_solomon_erasure::Error) -> Self {
        CodecError::ReedSolomon(e.to_string())
    }
}

/// A `(k, m)` Reed-Solomon encoder/decoder.
pub struct ErasureCodec {
    k: usize,
    m: usize,
    // Absent when m == 0: the GF(2^8) matrix needs at least one parity
    // shard, and a (k, 0) code is a plain passthrough.
    inner: Option<ReedSolomon>,
}

impl ErasureCodec {
    /// Creates a codec for `k` data shards and `m` parity shards.
    ///
    /// Requires `k >= 1`, `m >= 0` and `k + m <= 255`.
    pub fn new(k: usize, m: usize) -> Result<Self, CodecError> {
        if k < 1 || k + m > MAX_TOTAL_SHARDS {
            return Err(CodecError::InvalidParameters { k, m });
        }
        let inner = if m == 0 {
            None
        } else {
            Some(ReedSolomon::new(k, m)?)
        };
        Ok(Self { k, m, inner })
    }

    /// Returns the data shard count.
    pub fn data_shards(&self) -> usize {
        self.k
    }

    /// Returns the parity shard count.
    pub fn parity_shards(&self) -> usize {
        self.m
    }

    /// Returns the total shard count per stripe.
    pub fn total_shards(&self) -> usize {
        self.k + self.m
    }

    /// Encodes `k` data shards into `m` parity shards.
    ///
    /// All input shards must have equal length. Inputs are not modified;
    /// the returned vector holds the parity shards in position order.
    pub fn encode(&self, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, CodecError> {
        if data.len() != self.k {
            return Err(CodecError::ShardMismatch(format!(
                "expected {} data shards, got {}",
                self.k,
                data.len()
            )));
        }
        let shard_len = data[0].len();
        if data.iter().any(|s| s.len() != shard_len) {
            return Err(CodecError::ShardMismatch(
                "data shards have unequal lengths".to_string(),
            ));
        }

        let Some(rs) = &self.inner else {
            return Ok(Vec::new());
        };

        let mut shards: Vec<Vec<u8>> = data.to_vec();
        shards.extend((0..self.m).map(|_| vec![0u8; shard_len]));
        rs.encode(&mut shards)?;
        Ok(shards.split_off(self.k))
    }

    /// Reconstructs the `k` data shards from any `k` of the `k + m`.
    ///
    /// `shards` holds one slot per position (data shards first, then
    /// parity); missing shards are `None`. On success every data slot is
    /// filled and returned in order.
    pub fn decode(&self, shards: &mut Vec<Option<Vec<u8>>>) -> Result<Vec<Vec<u8>>, CodecError> {
        if shards.len() != self.total_shards() {
            return Err(CodecError::ShardMismatch(format!(
                "expected {} shard slots, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.k {
            return Err(CodecError::Unrecoverable {
                available,
                required: self.k,
            });
        }

        match &self.inner {
            // m == 0: every data shard must already be present.
            None => shards
                .iter()
                .map(|s| {
                    s.clone().ok_or(CodecError::Unrecoverable {
                        available,
                        required: self.k,
                    })
                })
                .collect(),
            Some(rs) => {
                rs.reconstruct_data(shards)?;
                shards
                    .iter()
                    .take(self.k)
                    .map(|s| {
                        s.clone().ok_or_else(|| {
                            CodecError::ReedSolomon("reconstruction left a hole".to_string())
                        })
                    })
                    .collect()
            }
        }
    }

    /// Returns true if a stripe with shards present at `available_positions`
    /// can be reconstructed.
    ///
    /// Cheap predicate for fetch planning; positions outside `0..k+m` are
    /// ignored, duplicates count once.
    pub fn can_reconstruct(&self, available_positions: &[usize]) -> bool {
        let total = self.total_shards();
        let mut seen = vec![false; total];
        for &p in available_positions {
            if p < total {
                seen[p] = true;
            }
        }
        let available = seen.iter().filter(|&&s| s).count();
        if self.m == 0 {
            // No parity: all data positions must be present.
            seen.iter().take(self.k).all(|&s| s)
        } else {
            available >= self.k
        }
    }
}
