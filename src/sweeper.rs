// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cleanup sweeper.
//!
//! A periodic task that garbage-collects expired in-flight state: mode-2
//! pending acks whose deadline passed (or whose writer is gone), and client
//! connections that have been idle with nothing in flight. The write path
//! removes its own entry on timeout; the sweeper is the backstop for
//! abandoned waiters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::client::ClientPool;
use crate::metrics;
use crate::registry::DbRegistry;

/// Idle time after which an unused client connection is released.
const CLIENT_IDLE_TTL: Duration = Duration::from_secs(60);

pub(crate) async fn run_sweeper(
    registry: Arc<DbRegistry>,
    pool: Arc<ClientPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let mut expired = 0;
                for db in registry.all() {
                    expired += db.expire_pending_acks();
                }
                let released = pool.sweep_idle(CLIENT_IDLE_TTL);
                if expired > 0 || released > 0 {
                    debug!(expired_acks = expired, released_clients = released, "sweeper pass");
                }
                metrics::set_registered_dbs(registry.len());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("sweeper stopping");
                    break;
                }
            }
        }
    }
}
