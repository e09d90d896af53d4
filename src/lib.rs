//! # logship
//!
//! Log-shipping replication between processes hosting an embedded, ordered
//! key-value storage engine. Each host plays one role per named database —
//! LEADER, FOLLOWER, or OBSERVER — and followers/observers converge on
//! their leader's update sequence by continuously pulling ordered batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Replicator (host)                         │
//! │                                                                      │
//! │  ┌────────────┐   ┌─────────────────────────────┐   ┌────────────┐  │
//! │  │  service   │──►│  DbRegistry                 │◄──│  sweeper   │  │
//! │  │ (TCP pull) │   │  name → ReplicatedDb        │   │ (GC pass)  │  │
//! │  └────────────┘   │   ├ write path + pending ack│   └────────────┘  │
//! │                   │   ├ serve-pull long-poll    │                    │
//! │                   │   └ pull loop ──────────────┼──► ClientPool ──► peers
//! │                   └──────────┬──────────────────┘                    │
//! │                              ▼                                       │
//! │                     Storage (embedded engine)                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes enter a LEADER database and go to its storage engine; in
//! replication mode 2 the caller blocks until a follower's piggybacked ack
//! covers the write or an adaptive timeout expires. Non-leaders long-poll
//! their upstream for ordered batches and apply them in sequence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use logship::{MemStorage, ReplicaRole, Replicator, ReplicatorConfig, WriteBatch, WriteOptions};
//!
//! let host = Replicator::new(ReplicatorConfig::default()).unwrap();
//! host.add_database("shard1", MemStorage::new(), ReplicaRole::Leader, None)
//!     .unwrap();
//!
//! let mut batch = WriteBatch::new();
//! batch.put("key", "value");
//! let seq = host.write("shard1", WriteOptions::default(), &batch).unwrap();
//! assert_eq!(seq, 1);
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod storage;
pub mod sweeper;
pub mod wire;

mod host;

// Re-exports for convenience
pub use batch::{Op, WriteBatch, WriteOptions};
pub use client::ClientPool;
pub use config::ReplicatorConfig;
pub use db::{ReplicaRole, ReplicatedDb};
pub use error::{ReplicationError, Result};
pub use host::Replicator;
pub use registry::DbRegistry;
pub use resolver::{NoOpResolver, StaticResolver, UpstreamResolver};
pub use storage::{MemStorage, Storage};
