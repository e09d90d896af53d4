// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replicated database: the per-database state machine.
//!
//! One [`ReplicatedDb`] exists per (host, database). It owns the storage
//! handle and, depending on role, runs the relevant halves of the protocol:
//!
//! - **LEADER**: accepts writes; in mode 2 each write parks on a pending-ack
//!   entry until a non-observer peer's piggybacked ack covers it or the
//!   current (possibly degraded) timeout expires.
//! - **FOLLOWER / OBSERVER**: runs a continuous pull loop against the
//!   upstream, applies returned batches in sequence, and piggybacks its
//!   latest applied sequence as an ack on every pull.
//! - **Any role** serves inbound pulls: returns committed batches from the
//!   requested sequence, long-polling up to the server wait budget when the
//!   caller is caught up.
//!
//! # Adaptive Timeout
//!
//! The mode-2 ack timeout is a two-state machine:
//!
//! ```text
//! Normal --(N consecutive ack timeouts)--> Degraded
//! Degraded --(any successful ack)--> Normal
//! ```
//!
//! Degradation keeps a leader whose follower set collapsed serving writes
//! with fast failures instead of stalling every write for the full timeout.
//! The state is per database; one shard degrading never affects another.
//!
//! # Upstream Reset
//!
//! A non-leader whose upstream keeps answering "nothing new" while itself
//! not being a leader is in a broken topology (pulling from itself, or two
//! followers pulling from each other). After a configured run of such
//! responses the database asks its [`UpstreamResolver`] for a fresh address
//! and switches if one is returned. Leaders never reset.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::batch::{WriteBatch, WriteOptions};
use crate::client::ClientPool;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resolver::UpstreamResolver;
use crate::storage::Storage;
use crate::wire::{PullRequest, PullResponse, PullStatus, SeqBatch};

/// Role a database plays on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Accepts writes; never pulls.
    Leader,
    /// Pulls from upstream; its acks count toward the mode-2 quorum.
    Follower,
    /// Pulls from upstream; its acks never count.
    Observer,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaRole::Leader => write!(f, "LEADER"),
            ReplicaRole::Follower => write!(f, "FOLLOWER"),
            ReplicaRole::Observer => write!(f, "OBSERVER"),
        }
    }
}

/// A mode-2 write parked until a follower ack covers its sequence.
struct PendingAck {
    deadline: Instant,
    tx: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Normal,
    Degraded,
}

struct AckTimeoutState {
    mode: AckMode,
    consecutive_timeouts: u32,
}

/// Per-database replication state machine. See module docs.
pub struct ReplicatedDb {
    name: String,
    role: ReplicaRole,
    storage: Arc<dyn Storage>,
    config: Arc<ReplicatorConfig>,
    resolver: Arc<dyn UpstreamResolver>,
    upstream: RwLock<Option<SocketAddr>>,

    /// Latest committed sequence; mirrors the storage engine except while a
    /// batch is mid-apply.
    cur_seq: AtomicU64,
    /// Woken on every local write and every applied batch.
    update_notify: Notify,
    pending_acks: Mutex<BTreeMap<u64, PendingAck>>,
    ack_timeout: Mutex<AckTimeoutState>,

    consecutive_no_updates: AtomicU64,
    reset_upstream_attempts: AtomicU64,

    /// Set on a fatal apply mismatch; the pull loop parks until removal.
    poisoned: AtomicBool,
    /// Set by removal; refuses new work and wakes long-polls.
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ReplicatedDb {
    pub(crate) fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        role: ReplicaRole,
        upstream: Option<SocketAddr>,
        config: Arc<ReplicatorConfig>,
        resolver: Arc<dyn UpstreamResolver>,
    ) -> Arc<Self> {
        let cur_seq = storage.latest_seq();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            role,
            storage,
            config,
            resolver,
            upstream: RwLock::new(upstream),
            cur_seq: AtomicU64::new(cur_seq),
            update_notify: Notify::new(),
            pending_acks: Mutex::new(BTreeMap::new()),
            ack_timeout: Mutex::new(AckTimeoutState {
                mode: AckMode::Normal,
                consecutive_timeouts: 0,
            }),
            consecutive_no_updates: AtomicU64::new(0),
            reset_upstream_attempts: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    /// Latest committed sequence.
    pub fn cur_seq(&self) -> u64 {
        self.cur_seq.load(Ordering::Acquire)
    }

    /// Current upstream address, if any.
    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        *self.upstream.read()
    }

    /// The mode-2 ack timeout currently in effect (ms).
    pub fn current_timeout_ms(&self) -> u64 {
        match self.ack_timeout.lock().mode {
            AckMode::Normal => self.config.timeout_ms,
            AckMode::Degraded => self.config.timeout_degraded_ms,
        }
    }

    /// How many upstream resets this database has requested.
    pub fn reset_upstream_attempts(&self) -> u64 {
        self.reset_upstream_attempts.load(Ordering::Acquire)
    }

    /// Consecutive pulls that returned no updates.
    pub fn consecutive_no_updates(&self) -> u64 {
        self.consecutive_no_updates.load(Ordering::Acquire)
    }

    /// Whether a fatal apply mismatch stopped replication for this database.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Structured-text state dump.
    pub fn introspect(&self) -> String {
        let upstream = match self.upstream_addr() {
            Some(addr) => addr.ip().to_string(),
            None => "uninitialized_addr".to_string(),
        };
        format!(
            "ReplicatedDB:\n  name: {}\n  ReplicaRole: {}\n  upstream_addr: {}\n  cur_seq_no: {}\n  current_replicator_timeout_ms_: {}\n",
            self.name,
            self.role,
            upstream,
            self.cur_seq(),
            self.current_timeout_ms()
        )
    }

    /// Refuse new work and wake everything parked on this database.
    ///
    /// Called by removal; the pull loop exits at its next boundary and
    /// long-polls return `DbNotFound`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // send_replace stores the flag even when the pull loop has not
        // subscribed yet, so a racing add/remove cannot strand the loop.
        self.stop_tx.send_replace(true);
        self.pending_acks.lock().clear();
        self.update_notify.notify_waiters();
    }

    // =========================================================================
    // Write path (LEADER)
    // =========================================================================

    pub(crate) async fn write(&self, options: &WriteOptions, batch: &WriteBatch) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicationError::DbNotFound);
        }
        if self.role != ReplicaRole::Leader {
            metrics::record_write_rejected(&self.name);
            return Err(ReplicationError::WriteToFollower);
        }

        let started = Instant::now();
        let seq = self.storage.write(options, batch)?;
        let last_seq = seq + batch.count().saturating_sub(1);
        self.cur_seq.fetch_max(last_seq, Ordering::AcqRel);

        if self.config.replication_mode < 2 {
            self.update_notify.notify_waiters();
            metrics::record_write(&self.name, true, started.elapsed());
            return Ok(seq);
        }

        // Mode 2: park until a non-observer peer acks `last_seq` or the
        // current timeout expires. The pending entry must exist before the
        // notify so an immediately-woken puller cannot ack past us.
        let timeout = Duration::from_millis(self.current_timeout_ms());
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(
            last_seq,
            PendingAck {
                deadline: Instant::now() + timeout,
                tx,
            },
        );
        self.update_notify.notify_waiters();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                self.on_ack_success();
                metrics::record_write(&self.name, true, started.elapsed());
                Ok(seq)
            }
            _ => {
                self.pending_acks.lock().remove(&last_seq);
                self.on_ack_timeout();
                metrics::record_write_ack_timeout(&self.name);
                metrics::record_write(&self.name, false, started.elapsed());
                Err(ReplicationError::Timeout(
                    "Failed to receive ack from follower".to_string(),
                ))
            }
        }
    }

    fn on_ack_success(&self) {
        let mut state = self.ack_timeout.lock();
        if state.mode == AckMode::Degraded {
            info!(db = %self.name, "write-ack timeout recovered to normal");
            metrics::record_degradation_recovered(&self.name);
        }
        state.mode = AckMode::Normal;
        state.consecutive_timeouts = 0;
    }

    fn on_ack_timeout(&self) {
        let mut state = self.ack_timeout.lock();
        state.consecutive_timeouts = state.consecutive_timeouts.saturating_add(1);
        if state.mode == AckMode::Normal
            && state.consecutive_timeouts >= self.config.consecutive_ack_timeouts_before_degradation
        {
            warn!(
                db = %self.name,
                consecutive = state.consecutive_timeouts,
                degraded_ms = self.config.timeout_degraded_ms,
                "write-ack timeout degraded"
            );
            metrics::record_degradation_entered(&self.name);
            state.mode = AckMode::Degraded;
        }
    }

    // =========================================================================
    // Serve path (any role)
    // =========================================================================

    /// Serve one inbound pull: resolve the piggybacked ack, then return
    /// batches from `from_seq`, long-polling up to the clamped wait budget
    /// when the caller is caught up.
    pub(crate) async fn serve_pull(
        &self,
        from_seq: u64,
        max_wait_ms: u32,
        peer_ack: u64,
        peer_role: ReplicaRole,
    ) -> PullResponse {
        let started = Instant::now();
        self.resolve_acks(peer_ack, peer_role);

        if self.closed.load(Ordering::Acquire) {
            return PullResponse::status_only(PullStatus::DbNotFound, from_seq, self.role);
        }

        let wait = Duration::from_millis((max_wait_ms as u64).min(self.config.max_server_wait_time_ms));
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.update_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.storage.latest_seq() >= from_seq || self.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        if self.closed.load(Ordering::Acquire) {
            return PullResponse::status_only(PullStatus::DbNotFound, from_seq, self.role);
        }

        let response = match self.storage.updates_since(from_seq, self.config.max_batches_per_pull) {
            Ok((batches, _)) if batches.is_empty() => {
                if self.role != ReplicaRole::Leader && self.storage.latest_seq() == 0 {
                    PullResponse::status_only(PullStatus::WaitingOnUpstream, from_seq, self.role)
                } else {
                    PullResponse::status_only(PullStatus::Ok, from_seq, self.role)
                }
            }
            Ok((batches, next_seq)) => {
                let mut wire_batches = Vec::with_capacity(batches.len());
                let mut encode_failed = false;
                let mut served_ops = 0u64;
                for (seq, batch) in &batches {
                    match batch.encode() {
                        Ok(payload) => {
                            served_ops += batch.count();
                            wire_batches.push(SeqBatch { seq: *seq, payload });
                        }
                        Err(e) => {
                            error!(db = %self.name, error = %e, "failed to encode batch");
                            encode_failed = true;
                            break;
                        }
                    }
                }
                if encode_failed {
                    PullResponse::status_only(PullStatus::ServerError, from_seq, self.role)
                } else {
                    metrics::record_updates_served(&self.name, served_ops);
                    PullResponse {
                        status: PullStatus::Ok,
                        batches: wire_batches,
                        next_seq,
                        server_role: self.role,
                    }
                }
            }
            Err(e) => {
                warn!(db = %self.name, from_seq, error = %e, "updates_since failed");
                PullResponse::status_only(PullStatus::ServerError, from_seq, self.role)
            }
        };

        metrics::record_serve_latency(&self.name, started.elapsed());
        response
    }

    /// Resolve pending mode-2 writes covered by a peer's ack. Observer acks
    /// never resolve anything.
    fn resolve_acks(&self, peer_ack: u64, peer_role: ReplicaRole) {
        if peer_role == ReplicaRole::Observer {
            metrics::record_observer_request(&self.name);
            return;
        }
        if peer_ack == 0 {
            return;
        }
        let resolved: Vec<PendingAck> = {
            let mut pending = self.pending_acks.lock();
            if pending.is_empty() {
                return;
            }
            let keep = pending.split_off(&(peer_ack + 1));
            std::mem::replace(&mut *pending, keep).into_values().collect()
        };
        for ack in resolved {
            let _ = ack.tx.send(());
        }
    }

    /// Drop pending-ack entries past their deadline or whose writer is
    /// gone. Called by the sweeper; returns how many were removed.
    pub(crate) fn expire_pending_acks(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending_acks.lock();
        let before = pending.len();
        pending.retain(|_, ack| now < ack.deadline && !ack.tx.is_closed());
        before - pending.len()
    }

    // =========================================================================
    // Pull loop (FOLLOWER, OBSERVER)
    // =========================================================================

    pub(crate) async fn run_pull_loop(self: Arc<Self>, pool: Arc<ClientPool>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let err_delay = self.config.pull_error_delay();
        info!(db = %self.name, role = %self.role, "pull loop starting");

        loop {
            if *stop_rx.borrow() {
                break;
            }
            if self.poisoned.load(Ordering::Acquire) {
                // Nothing to do but wait for removal.
                if stop_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            let Some(addr) = self.upstream_addr() else {
                if !self.sleep_or_stop(err_delay, &mut stop_rx).await {
                    break;
                }
                continue;
            };

            let cur = self.cur_seq();
            let req = PullRequest {
                db_name: self.name.clone(),
                from_seq: cur + 1,
                max_wait_ms: self.config.server_wait_budget_ms() as u32,
                include_ack_seq: cur,
                peer_role: self.role,
            };
            let started = Instant::now();
            match pool.call(addr, req, self.config.pull_call_timeout()).await {
                Ok(resp) => {
                    metrics::record_pull_latency(&self.name, started.elapsed());
                    self.handle_pull_response(resp, addr, err_delay, &mut stop_rx)
                        .await;
                }
                Err(e) => {
                    debug!(db = %self.name, upstream = %addr, error = %e, "pull failed");
                    metrics::record_pull(&self.name, "failure");
                    if !self.sleep_or_stop(err_delay, &mut stop_rx).await {
                        break;
                    }
                }
            }
        }
        info!(db = %self.name, "pull loop stopped");
    }

    async fn handle_pull_response(
        &self,
        resp: PullResponse,
        addr: SocketAddr,
        err_delay: Duration,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        match resp.status {
            PullStatus::Ok if !resp.batches.is_empty() => {
                match self.apply_batches(&resp.batches) {
                    Ok(()) => {
                        self.consecutive_no_updates.store(0, Ordering::Release);
                        metrics::record_pull(&self.name, "success");
                    }
                    Err(ReplicationError::ApplyMismatch { expected, actual }) => {
                        error!(
                            db = %self.name,
                            upstream = %addr,
                            expected,
                            actual,
                            "sequence gap from upstream; replication stopped until this database is removed and re-added"
                        );
                        self.poisoned.store(true, Ordering::Release);
                        metrics::record_pull(&self.name, "failure");
                    }
                    Err(e) => {
                        warn!(db = %self.name, upstream = %addr, error = %e, "failed to apply batch");
                        metrics::record_pull(&self.name, "failure");
                        self.sleep_or_stop(err_delay, stop_rx).await;
                    }
                }
            }
            PullStatus::Ok | PullStatus::WaitingOnUpstream => {
                self.note_no_updates(resp.server_role);
            }
            PullStatus::DbNotFound => {
                debug!(db = %self.name, upstream = %addr, "upstream does not host this database");
                metrics::record_pull(&self.name, "failure");
                self.sleep_or_stop(err_delay, stop_rx).await;
            }
            PullStatus::ServerError => {
                warn!(db = %self.name, upstream = %addr, "upstream reported a server error");
                metrics::record_pull(&self.name, "failure");
                self.sleep_or_stop(err_delay, stop_rx).await;
            }
        }
    }

    fn apply_batches(&self, batches: &[SeqBatch]) -> Result<()> {
        let mut applied_ops = 0u64;
        for wire_batch in batches {
            let batch = WriteBatch::decode(&wire_batch.payload)?;
            let latest = self.storage.apply(&batch, wire_batch.seq)?;
            self.cur_seq.store(latest, Ordering::Release);
            applied_ops += batch.count();
        }
        metrics::record_updates_applied(&self.name, applied_ops);
        // Wake downstream pullers and local long-polls.
        self.update_notify.notify_waiters();
        Ok(())
    }

    /// Account one empty pull; kick upstream-reset detection when the
    /// upstream is itself not a leader.
    fn note_no_updates(&self, server_role: ReplicaRole) {
        let n = self.consecutive_no_updates.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_pull(&self.name, "no_updates");
        if server_role != ReplicaRole::Leader {
            metrics::record_pull_from_non_leader(&self.name);
        }

        if self.config.reset_upstream_on_empty_updates_from_non_leader
            && self.role != ReplicaRole::Leader
            && server_role != ReplicaRole::Leader
            && n > self.config.max_consecutive_no_updates_before_upstream_reset
        {
            self.attempt_upstream_reset();
            self.consecutive_no_updates.store(0, Ordering::Release);
        }
    }

    fn attempt_upstream_reset(&self) {
        let attempts = self.reset_upstream_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_upstream_reset_attempt(&self.name);
        let current = self.upstream_addr();
        match self.resolver.resolve(&self.name) {
            Some(new_addr) if Some(new_addr) != current => {
                info!(
                    db = %self.name,
                    old = ?current,
                    new = %new_addr,
                    attempts,
                    "switching to resolved upstream"
                );
                *self.upstream.write() = Some(new_addr);
            }
            Some(_) => {
                debug!(db = %self.name, attempts, "resolver confirmed current upstream");
            }
            None => {
                debug!(db = %self.name, attempts, "resolver has no upstream for this database");
            }
        }
    }

    /// Sleep for `delay`, returning early with `false` if the stop flag
    /// fires first.
    async fn sleep_or_stop(&self, delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop_rx.changed() => !*stop_rx.borrow(),
        }
    }
}
