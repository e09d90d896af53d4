// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replicator host.
//!
//! One [`Replicator`] per process port: it owns the thread pools, the
//! registry, the client pool, the inbound service, and the sweeper, and
//! exposes the public API the rest of the process calls. Construct it at
//! process start; tests that need several hosts in one process bind each to
//! a distinct port.
//!
//! Two runtimes, sized independently:
//!
//! - a CPU executor (floor 16 workers, `rptor-worker-` threads) running
//!   pull loops, applies, and mode-2 write waits;
//! - an I/O pool (`rptor-svr-io-` threads) running the accept loop,
//!   connection sessions, and the client pool's socket tasks.
//!
//! The public API is synchronous: a mode-2 `write` blocks its caller until
//! the follower ack arrives or the current timeout expires, and
//! `remove_database` blocks until no shared references to the database
//! remain anywhere in the host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::batch::{WriteBatch, WriteOptions};
use crate::client::ClientPool;
use crate::config::ReplicatorConfig;
use crate::db::{ReplicaRole, ReplicatedDb};
use crate::error::{ReplicationError, Result};
use crate::registry::DbRegistry;
use crate::resolver::{NoOpResolver, UpstreamResolver};
use crate::service;
use crate::storage::Storage;
use crate::sweeper;

/// Floor on CPU executor workers.
const MIN_EXECUTOR_THREADS: usize = 16;

/// How long removal waits between reference-drain checks.
const REMOVE_DRAIN_WAIT: Duration = Duration::from_millis(200);

/// Container wiring the replication core for one process. See module docs.
pub struct Replicator {
    config: Arc<ReplicatorConfig>,
    registry: Arc<DbRegistry>,
    pool: Arc<ClientPool>,
    cpu: tokio::runtime::Runtime,
    // Dropped after `cpu` per field order; holds the service sockets.
    io: tokio::runtime::Runtime,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Replicator {
    /// Build the host: spin up both runtimes, bind the service port, start
    /// the accept loop and the sweeper.
    ///
    /// Fails if the configuration is invalid or the port cannot be bound.
    pub fn new(config: ReplicatorConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let cpu = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.executor_threads.max(MIN_EXECUTOR_THREADS))
            .thread_name("rptor-worker-")
            .enable_all()
            .build()?;
        let io = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("rptor-svr-io-")
            .enable_all()
            .build()?;

        let listener = io.block_on(TcpListener::bind(("0.0.0.0", config.port)))?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(DbRegistry::new());
        let pool = Arc::new(ClientPool::new(io.handle().clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        io.spawn(service::run_service(
            listener,
            Arc::clone(&registry),
            shutdown_rx.clone(),
        ));
        cpu.spawn(sweeper::run_sweeper(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.sweeper_interval(),
            shutdown_rx,
        ));

        info!(addr = %local_addr, mode = config.replication_mode, "replicator host started");
        Ok(Self {
            config,
            registry,
            pool,
            cpu,
            io,
            local_addr,
            shutdown_tx,
        })
    }

    /// Address the pull service is bound to. With `port: 0` in the config
    /// this is the ephemeral port the OS picked.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a database with the default (no-op) upstream resolver.
    pub fn add_database(
        &self,
        name: &str,
        storage: Arc<dyn Storage>,
        role: ReplicaRole,
        upstream_addr: Option<SocketAddr>,
    ) -> Result<()> {
        self.add_database_with_resolver(name, storage, role, upstream_addr, Arc::new(NoOpResolver))
    }

    /// Register a database. Non-leaders start their pull loop immediately;
    /// the resolver is consulted when upstream-reset detection fires.
    pub fn add_database_with_resolver(
        &self,
        name: &str,
        storage: Arc<dyn Storage>,
        role: ReplicaRole,
        upstream_addr: Option<SocketAddr>,
        resolver: Arc<dyn UpstreamResolver>,
    ) -> Result<()> {
        let db = ReplicatedDb::new(
            name,
            storage,
            role,
            upstream_addr,
            Arc::clone(&self.config),
            resolver,
        );

        if !self.registry.add(Arc::clone(&db)) {
            return Err(ReplicationError::DbPreExist);
        }

        if role != ReplicaRole::Leader {
            self.cpu
                .spawn(Arc::clone(&db).run_pull_loop(Arc::clone(&self.pool)));
        }

        info!(db = %name, role = %role, upstream = ?upstream_addr, "database added");
        Ok(())
    }

    /// Unregister a database and block until every shared reference to it
    /// has drained. After this returns, no network or storage activity for
    /// the database remains.
    pub fn remove_database(&self, name: &str) -> Result<()> {
        let db = self.registry.remove(name).ok_or(ReplicationError::DbNotFound)?;
        db.close();

        let weak = Arc::downgrade(&db);
        drop(db);
        while weak.strong_count() > 0 {
            info!(
                db = %name,
                wait_ms = REMOVE_DRAIN_WAIT.as_millis() as u64,
                "database still held by others, waiting"
            );
            std::thread::sleep(REMOVE_DRAIN_WAIT);
        }

        info!(db = %name, "database removed");
        Ok(())
    }

    /// Write a batch to a LEADER database. In mode 2 this blocks until a
    /// non-observer peer acks the write or the database's current timeout
    /// expires. Returns the sequence assigned to the batch's first
    /// operation.
    pub fn write(&self, name: &str, options: WriteOptions, batch: &WriteBatch) -> Result<u64> {
        let db = self.registry.get(name).ok_or(ReplicationError::DbNotFound)?;
        self.cpu.block_on(db.write(&options, batch))
    }

    /// Shared handle to a registered database, for introspection.
    pub fn db(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.registry.get(name)
    }

    /// Number of registered databases.
    pub fn db_count(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for db in self.registry.all() {
            db.close();
        }
    }
}
