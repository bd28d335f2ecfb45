//! The download path: discovery-driven parallel fetch with erasure
//! recovery.
//!
//! A file is fetched stripe by stripe: data shards are preferred, parity
//! shards are pulled only when data cannot be completed, and the moment a
//! stripe holds k valid shards its remaining in-flight fetches are
//! cancelled. Every received chunk is digest-verified by the wire client
//! before it is written; a mismatch just moves on to the next holder.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pando_codec::ErasureCodec;
use pando_core::{Digest, PeerHandle};
use pando_proto::FileRecord;

use crate::engine::PeerEngine;
use crate::EngineError;

/// Lifecycle of one chunk fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Planned,
    Dialing,
    Done,
    Failed,
}

/// Shard completion tracking for one stripe.
struct StripeTracker {
    index: usize,
    required: usize,
    have: Mutex<HashSet<usize>>,
    /// Fires once k shards are in hand; cancels fetches the stripe no
    /// longer needs.
    satisfied: CancellationToken,
}

impl StripeTracker {
    fn new(index: usize, required: usize, local: HashSet<usize>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            index,
            required,
            have: Mutex::new(local),
            satisfied: CancellationToken::new(),
        });
        tracker.check();
        tracker
    }

    fn add(&self, position: usize) {
        self.have.lock().insert(position);
        self.check();
    }

    fn check(&self) {
        if self.have.lock().len() >= self.required {
            self.satisfied.cancel();
        }
    }

    fn count(&self) -> usize {
        self.have.lock().len()
    }

    fn is_satisfied(&self) -> bool {
        self.satisfied.is_cancelled()
    }
}

impl PeerEngine {
    /// Fetches a file from the network into `out_path`.
    ///
    /// Consults the DHT for the file record and per-chunk holders, fetches
    /// in parallel bounded by `max_inflight`, reconstructs stripes through
    /// the erasure codec when data shards are unobtainable, and assembles
    /// the file through the local store.
    pub async fn fetch_file(
        &self,
        file_digest: Digest,
        out_path: PathBuf,
    ) -> Result<(), EngineError> {
        let cancel = self.cancel.child_token();
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.fetch_file_inner(file_digest, out_path, &cancel) => result,
        }
    }

    async fn fetch_file_inner(
        &self,
        file_digest: Digest,
        out_path: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let record = self
            .lookup_record(&file_digest)
            .await
            .ok_or(EngineError::FileNotFound(file_digest))?;
        info!(
            file = %file_digest,
            size = record.size,
            stripes = record.stripe_count(),
            "fetching file"
        );

        if !self.missing_chunks(&record).await?.is_empty() {
            self.fetch_chunks(&record, cancel).await?;
        }

        // Commit the record and assemble the output.
        let store = self.store.clone();
        let adopted = record.clone();
        tokio::task::spawn_blocking(move || {
            store.adopt_record(adopted)?;
            store.retrieve(&file_digest, &out_path)
        })
        .await??;

        // The node now holds the file; advertise it like any local
        // content.
        if let Some(engine) = self.strong() {
            tokio::spawn(async move { engine.announce_record(&record).await });
        }
        Ok(())
    }

    /// Data chunk digests of `record` absent from local storage.
    async fn missing_chunks(&self, record: &FileRecord) -> Result<Vec<Digest>, EngineError> {
        let store = self.store.clone();
        let digests: Vec<Digest> = record.data_chunks.clone();
        Ok(tokio::task::spawn_blocking(move || {
            digests
                .into_iter()
                .filter(|d| !store.has_chunk(d))
                .collect()
        })
        .await?)
    }

    /// Obtains at least k valid shards for every stripe, then decodes any
    /// stripe that is still missing data shards.
    async fn fetch_chunks(
        &self,
        record: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let holders = self.lookup_all_holders(record, cancel).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight));

        // Per-stripe position -> digest maps and completion trackers.
        let mut stripes: Vec<(Arc<StripeTracker>, Vec<(usize, Digest)>)> = Vec::new();
        for i in 0..record.stripe_count() {
            let positions: Vec<(usize, Digest)> = record
                .data_stripe(i)
                .iter()
                .chain(record.parity_stripe(i).iter())
                .copied()
                .enumerate()
                .collect();

            let store = self.store.clone();
            let digests: Vec<(usize, Digest)> = positions.clone();
            let local: HashSet<usize> = tokio::task::spawn_blocking(move || {
                digests
                    .into_iter()
                    .filter(|(_, d)| store.has_chunk(d))
                    .map(|(p, _)| p)
                    .collect()
            })
            .await?;

            stripes.push((StripeTracker::new(i, record.k, local), positions));
        }

        // First pass: data shards only. Second pass: whatever else the
        // unsatisfied stripes can still reach.
        self.run_fetch_pass(&stripes, &holders, &semaphore, cancel, |pos, k| pos < k, record.k)
            .await?;
        self.run_fetch_pass(&stripes, &holders, &semaphore, cancel, |_, _| true, record.k)
            .await?;

        for (tracker, _) in &stripes {
            if tracker.count() < record.k {
                warn!(stripe = tracker.index, have = tracker.count(), "stripe unrecoverable");
                return Err(EngineError::Unrecoverable {
                    stripe: tracker.index,
                    available: tracker.count(),
                    required: record.k,
                });
            }
        }

        self.reconstruct_missing(record).await
    }

    /// Spawns a bounded fetch worker for every still-needed position that
    /// `select` admits, and waits for the pass to finish.
    async fn run_fetch_pass(
        &self,
        stripes: &[(Arc<StripeTracker>, Vec<(usize, Digest)>)],
        holders: &HashMap<Digest, Vec<PeerHandle>>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        select: impl Fn(usize, usize) -> bool,
        k: usize,
    ) -> Result<(), EngineError> {
        let this = self.strong().ok_or(EngineError::Cancelled)?;
        let mut workers = JoinSet::new();
        for (tracker, positions) in stripes {
            if tracker.is_satisfied() {
                continue;
            }
            for (position, digest) in positions {
                if !select(*position, k) || tracker.have.lock().contains(position) {
                    continue;
                }
                let candidates = holders.get(digest).cloned().unwrap_or_default();
                let engine = this.clone();
                let tracker = tracker.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let position = *position;
                let digest = *digest;
                workers.spawn(async move {
                    engine
                        .fetch_one(digest, position, candidates, tracker, semaphore, cancel)
                        .await
                });
            }
        }

        while let Some(result) = workers.join_next().await {
            if cancel.is_cancelled() {
                workers.abort_all();
                return Err(EngineError::Cancelled);
            }
            let _ = result;
        }
        Ok(())
    }

    /// Fetches one chunk, trying candidate holders in order.
    ///
    /// `Planned -> Dialing -> {Done, Retry(next peer), Failed}`; the wire
    /// client folds receive and verify into the dial, and `Failed` is
    /// reached only after every candidate has been tried once.
    async fn fetch_one(
        self: Arc<Self>,
        digest: Digest,
        position: usize,
        candidates: Vec<PeerHandle>,
        tracker: Arc<StripeTracker>,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> FetchState {
        let mut state = FetchState::Planned;

        // Wait for a slot unless the stripe completes or the fetch is
        // cancelled first.
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return state,
            _ = tracker.satisfied.cancelled() => return state,
            permit = semaphore.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return state,
            },
        };

        // Another stripe's worker may have fetched this digest already
        // (padding chunks repeat).
        if self.store.has_chunk(&digest) {
            tracker.add(position);
            return FetchState::Done;
        }

        for peer in &candidates {
            state = FetchState::Dialing;
            debug!(chunk = %digest, peer = %peer, "dialing holder");

            let endpoint = peer.endpoint();
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return state,
                _ = tracker.satisfied.cancelled() => {
                    debug!(chunk = %digest, "stripe satisfied, abandoning fetch");
                    return state;
                }
                result = self.client.fetch_chunk(&endpoint, &digest) => result,
            };

            match fetched {
                Ok(bytes) => {
                    let store = self.store.clone();
                    let write =
                        tokio::task::spawn_blocking(move || store.write_chunk(&digest, &bytes))
                            .await;
                    match write {
                        Ok(Ok(())) => {
                            tracker.add(position);
                            debug!(chunk = %digest, stripe = tracker.index, "chunk fetched");
                            return FetchState::Done;
                        }
                        other => {
                            warn!(chunk = %digest, ?other, "failed to persist fetched chunk");
                        }
                    }
                }
                Err(e) => {
                    // DigestMismatch, timeout, short read, refusal: all
                    // mean "try the next peer".
                    debug!(chunk = %digest, peer = %peer, error = %e, "holder failed, retrying");
                }
            }
        }

        debug!(chunk = %digest, tried = candidates.len(), "no holder could supply chunk");
        FetchState::Failed
    }

    /// Concurrent holder lookups for every distinct chunk of the record.
    async fn lookup_all_holders(
        &self,
        record: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Digest, Vec<PeerHandle>>, EngineError> {
        let distinct: HashSet<Digest> = record.all_chunks().copied().collect();
        let this = self.strong().ok_or(EngineError::Cancelled)?;
        let mut lookups = JoinSet::new();
        for digest in distinct {
            let engine = this.clone();
            lookups.spawn(async move {
                let holders = engine.lookup_holders(&digest).await;
                (digest, holders)
            });
        }

        let mut holders = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    lookups.abort_all();
                    return Err(EngineError::Cancelled);
                }
                next = lookups.join_next() => match next {
                    Some(Ok((digest, list))) => {
                        debug!(chunk = %digest, holders = list.len(), "resolved holders");
                        holders.insert(digest, list);
                    }
                    Some(Err(_)) => {}
                    None => break,
                },
            }
        }
        Ok(holders)
    }

    /// Decodes every stripe still missing data shards and persists the
    /// recovered chunks, digest-verified.
    async fn reconstruct_missing(&self, record: &FileRecord) -> Result<(), EngineError> {
        let store = self.store.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let codec = ErasureCodec::new(record.k, record.m).map_err(pando_store::StoreError::from)?;
            for i in 0..record.stripe_count() {
                let data = record.data_stripe(i);
                if data.iter().all(|d| store.has_chunk(d)) {
                    continue;
                }

                let mut shards: Vec<Option<Vec<u8>>> = data
                    .iter()
                    .chain(record.parity_stripe(i).iter())
                    .map(|d| store.read_chunk(d).ok())
                    .collect();
                let recovered = codec
                    .decode(&mut shards)
                    .map_err(pando_store::StoreError::from)?;

                for (digest, bytes) in data.iter().zip(recovered.iter()) {
                    // write_chunk re-verifies the digest of the decoded
                    // shard before anything touches disk.
                    store.write_chunk(digest, bytes)?;
                }
                info!(stripe = i, "reconstructed stripe from parity");
            }
            Ok(())
        })
        .await?
    }
}
