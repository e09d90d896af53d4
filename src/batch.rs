//! Write batches: the unit of replication.
//!
//! A [`WriteBatch`] is an ordered group of put/delete operations committed
//! together. Each *operation* consumes one sequence number, so a batch of
//! two puts advances the database sequence by two; the batch's own sequence
//! is the sequence assigned to its first operation.
//!
//! Batches serialize to a self-contained payload so the wire layer can ship
//! them between peers without inspecting their contents.

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

/// One operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Op {
    /// The key this operation touches.
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Put { key, .. } => key,
            Op::Delete { key } => key,
        }
    }
}

/// An ordered group of operations committed at one point in the sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<Op>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a put.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(Op::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
        self
    }

    /// Append a delete.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(Op::Delete {
            key: key.as_ref().to_vec(),
        });
        self
    }

    /// Number of operations, i.e. how many sequence numbers this batch
    /// consumes.
    pub fn count(&self) -> u64 {
        self.ops.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in commit order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Serialize to an opaque wire payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| ReplicationError::Internal(format!("batch encode: {}", e)))
    }

    /// Deserialize from a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|e| ReplicationError::Protocol(format!("batch decode: {}", e)))
    }
}

/// Options controlling one write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Ask the storage engine to make the write durable before returning.
    pub sync: bool,
}
