// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull protocol wire format.
//!
//! The only externally visible protocol in the core: a request/response
//! pair carried over a single TCP connection per peer address. Payloads are
//! bincode; frames are length-prefixed and tagged with a call id so many
//! long-polls can be in flight on one connection at once:
//!
//! ```text
//! [len: u32 BE][call_id: u64 BE][bincode payload]
//! ```
//!
//! `len` covers the call id and the payload. The call id is assigned by the
//! client and echoed by the server; responses may arrive in any order.
//! Frames above [`MAX_FRAME_LEN`] are a protocol error and close the
//! connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::db::ReplicaRole;
use crate::error::{ReplicationError, Result};

/// Upper bound on one frame (call id + payload).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Request for a range of updates, long-polling if none are available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub db_name: String,
    /// First sequence the caller wants (its own latest + 1).
    pub from_seq: u64,
    /// How long the server may hold the request waiting for new updates.
    pub max_wait_ms: u32,
    /// The caller's latest applied sequence, piggybacked as an ack.
    pub include_ack_seq: u64,
    /// The caller's role; observer acks never count toward write quorum.
    pub peer_role: ReplicaRole,
}

/// One batch on the wire: the sequence of its first operation plus the
/// encoded [`WriteBatch`](crate::WriteBatch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqBatch {
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Outcome of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    Ok,
    /// The server does not host the requested database.
    DbNotFound,
    /// The server is a non-leader that has no updates at all yet.
    WaitingOnUpstream,
    ServerError,
}

/// Response to a [`PullRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub status: PullStatus,
    /// Strictly ordered, contiguous batches starting at `from_seq`.
    pub batches: Vec<SeqBatch>,
    /// Sequence immediately after the last returned operation; equals the
    /// request's `from_seq` when `batches` is empty.
    pub next_seq: u64,
    /// The serving database's role, used by upstream-reset detection.
    pub server_role: ReplicaRole,
}

impl PullResponse {
    /// Error response carrying no updates.
    pub fn status_only(status: PullStatus, from_seq: u64, server_role: ReplicaRole) -> Self {
        Self {
            status,
            batches: Vec::new(),
            next_seq: from_seq,
            server_role,
        }
    }
}

pub fn encode_request(req: &PullRequest) -> Result<Vec<u8>> {
    bincode::serialize(req).map_err(|e| ReplicationError::Protocol(format!("encode request: {}", e)))
}

pub fn decode_request(payload: &[u8]) -> Result<PullRequest> {
    bincode::deserialize(payload)
        .map_err(|e| ReplicationError::Protocol(format!("decode request: {}", e)))
}

pub fn encode_response(resp: &PullResponse) -> Result<Vec<u8>> {
    bincode::serialize(resp)
        .map_err(|e| ReplicationError::Protocol(format!("encode response: {}", e)))
}

pub fn decode_response(payload: &[u8]) -> Result<PullResponse> {
    bincode::deserialize(payload)
        .map_err(|e| ReplicationError::Protocol(format!("decode response: {}", e)))
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, call_id: u64, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = 8 + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(ReplicationError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    writer.write_u32(len as u32).await?;
    writer.write_u64(call_id).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns the call id and the payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u64, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len < 8 || len > MAX_FRAME_LEN {
        return Err(ReplicationError::Protocol(format!(
            "invalid frame length {}",
            len
        )));
    }
    let call_id = reader.read_u64().await?;
    let mut payload = vec![0u8; len - 8];
    reader.read_exact(&mut payload).await?;
    Ok((call_id, payload))
}
