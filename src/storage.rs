// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage engine adapter.
//!
//! The replicator treats the embedded storage engine as an external
//! collaborator behind the [`Storage`] trait: it assigns monotonic
//! per-database sequence numbers to writes and can read back the ordered
//! batch log from any sequence.
//!
//! [`MemStorage`] is the in-memory implementation shipped with the crate.
//! It keeps an ordered key view plus the batch log and is what the tests
//! replicate against; embedders wrap their real engine in the same trait.
//!
//! # Sequence Accounting
//!
//! Every *operation* consumes one sequence number. A batch of two puts
//! advances `latest_seq` by two, and the batch's sequence is the sequence
//! of its first operation. `updates_since(seq)` only accepts batch
//! boundaries: batches never straddle or skip.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::{Op, WriteBatch, WriteOptions};
use crate::error::{ReplicationError, Result};

/// Adapter over an embedded ordered key-value engine.
///
/// Implementations must be internally synchronized; the replicator calls
/// them from multiple tasks.
pub trait Storage: Send + Sync + 'static {
    /// Commit a batch originated locally. Returns the sequence assigned to
    /// the batch's first operation.
    fn write(&self, options: &WriteOptions, batch: &WriteBatch) -> Result<u64>;

    /// Sequence of the most recently committed operation (0 when empty).
    fn latest_seq(&self) -> u64;

    /// Read committed batches starting at `seq`, at most `max_batches`.
    ///
    /// Returns the batches (each paired with its first-op sequence) and
    /// `next_seq`, the sequence immediately after the last returned
    /// operation. `seq` must be a batch boundary or past the end.
    fn updates_since(&self, seq: u64, max_batches: usize) -> Result<(Vec<(u64, WriteBatch)>, u64)>;

    /// Commit a batch replicated from upstream. `expected_seq` is the
    /// sequence the batch's first operation must receive; fails with
    /// [`ReplicationError::ApplyMismatch`] if the local log is not at
    /// `expected_seq - 1`. Returns the new latest sequence.
    fn apply(&self, batch: &WriteBatch, expected_seq: u64) -> Result<u64>;

    /// Point lookup, used by embedders and tests to inspect contents.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

struct MemInner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Batch log in commit order; each entry keeps its first-op sequence.
    log: Vec<(u64, WriteBatch)>,
    latest: u64,
}

/// In-memory ordered KV engine with a batch log.
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MemInner {
                map: BTreeMap::new(),
                log: Vec::new(),
                latest: 0,
            }),
        })
    }

    fn commit(inner: &mut MemInner, batch: &WriteBatch) -> u64 {
        let first_seq = inner.latest + 1;
        for op in batch.ops() {
            match op {
                Op::Put { key, value } => {
                    inner.map.insert(key.clone(), value.clone());
                }
                Op::Delete { key } => {
                    inner.map.remove(key);
                }
            }
        }
        inner.latest += batch.count();
        inner.log.push((first_seq, batch.clone()));
        first_seq
    }
}

impl Storage for MemStorage {
    fn write(&self, _options: &WriteOptions, batch: &WriteBatch) -> Result<u64> {
        if batch.is_empty() {
            return Err(ReplicationError::WriteError("empty batch".to_string()));
        }
        let mut inner = self.inner.lock();
        Ok(Self::commit(&mut inner, batch))
    }

    fn latest_seq(&self) -> u64 {
        self.inner.lock().latest
    }

    fn updates_since(&self, seq: u64, max_batches: usize) -> Result<(Vec<(u64, WriteBatch)>, u64)> {
        let inner = self.inner.lock();
        if seq > inner.latest {
            return Ok((Vec::new(), seq));
        }

        let start = inner.log.partition_point(|(first, _)| *first < seq);
        match inner.log.get(start) {
            Some((first, _)) if *first != seq => {
                // A boundary before `seq` spans it; serving from here would
                // skip operations.
                return Err(ReplicationError::Internal(format!(
                    "sequence {} is not a batch boundary",
                    seq
                )));
            }
            None => {
                return Err(ReplicationError::Internal(format!(
                    "sequence {} is not a batch boundary",
                    seq
                )));
            }
            _ => {}
        }

        let mut batches = Vec::new();
        let mut next_seq = seq;
        for (first, batch) in inner.log[start..].iter().take(max_batches) {
            next_seq = first + batch.count();
            batches.push((*first, batch.clone()));
        }
        Ok((batches, next_seq))
    }

    fn apply(&self, batch: &WriteBatch, expected_seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.latest + 1 != expected_seq {
            return Err(ReplicationError::ApplyMismatch {
                expected: expected_seq,
                actual: inner.latest + 1,
            });
        }
        Self::commit(&mut inner, batch);
        Ok(inner.latest)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().map.get(key).cloned()
    }
}
