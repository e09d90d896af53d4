//! Configuration for the replicator host.
//!
//! All tunables for one host live in [`ReplicatorConfig`]. The struct can be
//! constructed programmatically or deserialized from YAML/JSON; every field
//! has a serde default so partial configs work.
//!
//! # Quick Start
//!
//! ```rust
//! use logship::ReplicatorConfig;
//!
//! let config = ReplicatorConfig {
//!     port: 9091,
//!     replication_mode: 2,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Timeout Layering
//!
//! ```text
//! server wait budget  = min(timeout_ms, max_server_wait_time_ms)
//! client call timeout = server wait budget + client_server_timeout_difference_ms
//! ```
//!
//! The client-side timeout is always strictly greater than the server-side
//! long-poll budget, so a well-behaved server responds before the client
//! gives up on the call.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReplicationError, Result};

/// Configuration for one replicator host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// TCP port the pull service listens on. Port 0 binds an ephemeral port
    /// (useful for tests); the bound address is available via
    /// [`Replicator::local_addr`](crate::Replicator::local_addr).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Size of the I/O pool shared by the service and the client pool.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Size of the CPU executor running pull loops, applies, and write
    /// waits. Floored at 16 workers when the host is built.
    #[serde(default = "default_executor_threads")]
    pub executor_threads: usize,

    /// Replication mode: 1 = async, 2 = wait for one non-observer ack.
    #[serde(default = "default_replication_mode")]
    pub replication_mode: u8,

    /// Normal write-ack timeout and the default pull server-wait (ms).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Degraded write-ack timeout used after repeated ack timeouts (ms).
    #[serde(default = "default_timeout_degraded_ms")]
    pub timeout_degraded_ms: u64,

    /// Consecutive ack timeouts before a leader switches to the degraded
    /// timeout.
    #[serde(default = "default_ack_timeouts_before_degradation")]
    pub consecutive_ack_timeouts_before_degradation: u32,

    /// Cap on the server-side long-poll (ms).
    #[serde(default = "default_max_server_wait_time_ms")]
    pub max_server_wait_time_ms: u64,

    /// Required slack between the client call timeout and the server wait
    /// budget (ms). Must be greater than zero.
    #[serde(default = "default_client_server_timeout_difference_ms")]
    pub client_server_timeout_difference_ms: u64,

    /// Enable upstream reset when a non-leader upstream keeps returning
    /// empty responses (self-loop / follower-cycle detection).
    #[serde(default)]
    pub reset_upstream_on_empty_updates_from_non_leader: bool,

    /// Consecutive empty pulls from a non-leader upstream before an
    /// upstream reset is attempted.
    #[serde(default = "default_max_consecutive_no_updates")]
    pub max_consecutive_no_updates_before_upstream_reset: u64,

    /// Backoff between failed pulls (ms).
    #[serde(default = "default_pull_delay_on_error_ms")]
    pub pull_delay_on_error_ms: u64,

    /// Maximum batches returned by one pull response.
    #[serde(default = "default_max_batches_per_pull")]
    pub max_batches_per_pull: usize,

    /// Interval between cleanup sweeper passes (ms).
    #[serde(default = "default_sweeper_interval_ms")]
    pub sweeper_interval_ms: u64,
}

fn default_port() -> u16 {
    9091
}

fn default_io_threads() -> usize {
    8
}

fn default_executor_threads() -> usize {
    32
}

fn default_replication_mode() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_timeout_degraded_ms() -> u64 {
    10
}

fn default_ack_timeouts_before_degradation() -> u32 {
    30
}

fn default_max_server_wait_time_ms() -> u64 {
    5000
}

fn default_client_server_timeout_difference_ms() -> u64 {
    1000
}

fn default_max_consecutive_no_updates() -> u64 {
    10
}

fn default_pull_delay_on_error_ms() -> u64 {
    1000
}

fn default_max_batches_per_pull() -> usize {
    1024
}

fn default_sweeper_interval_ms() -> u64 {
    1000
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            io_threads: default_io_threads(),
            executor_threads: default_executor_threads(),
            replication_mode: default_replication_mode(),
            timeout_ms: default_timeout_ms(),
            timeout_degraded_ms: default_timeout_degraded_ms(),
            consecutive_ack_timeouts_before_degradation: default_ack_timeouts_before_degradation(),
            max_server_wait_time_ms: default_max_server_wait_time_ms(),
            client_server_timeout_difference_ms: default_client_server_timeout_difference_ms(),
            reset_upstream_on_empty_updates_from_non_leader: false,
            max_consecutive_no_updates_before_upstream_reset: default_max_consecutive_no_updates(),
            pull_delay_on_error_ms: default_pull_delay_on_error_ms(),
            max_batches_per_pull: default_max_batches_per_pull(),
            sweeper_interval_ms: default_sweeper_interval_ms(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a config for tests: ephemeral port, small pools, short
    /// timeouts so failure paths resolve quickly.
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            io_threads: 2,
            executor_threads: 2,
            timeout_ms: 1000,
            max_server_wait_time_ms: 100,
            client_server_timeout_difference_ms: 100,
            pull_delay_on_error_ms: 50,
            sweeper_interval_ms: 100,
            ..Default::default()
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.replication_mode != 1 && self.replication_mode != 2 {
            return Err(ReplicationError::Config(format!(
                "replication_mode must be 1 or 2, got {}",
                self.replication_mode
            )));
        }
        if self.client_server_timeout_difference_ms == 0 {
            return Err(ReplicationError::Config(
                "client_server_timeout_difference_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ReplicationError::Config(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Server-side wait budget for outbound pulls (ms).
    pub fn server_wait_budget_ms(&self) -> u64 {
        self.timeout_ms.min(self.max_server_wait_time_ms)
    }

    /// Client-side timeout for one pull call.
    pub fn pull_call_timeout(&self) -> Duration {
        Duration::from_millis(self.server_wait_budget_ms() + self.client_server_timeout_difference_ms)
    }

    /// Backoff between failed pulls.
    pub fn pull_error_delay(&self) -> Duration {
        Duration::from_millis(self.pull_delay_on_error_ms)
    }

    /// Normal write-ack timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sweeper pass interval.
    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_millis(self.sweeper_interval_ms)
    }
}
