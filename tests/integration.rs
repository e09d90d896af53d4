// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: multi-host replication topologies.
//!
//! Every test runs real hosts in-process, each bound to an ephemeral port,
//! talking to each other over loopback TCP. No external services required.
//!
//! # Test Organization
//! - `basics` - admission, write routing, introspection on one host
//! - `one_master_*` / `tree_*` / `chain_*` - convergence topologies
//! - `self_loop_*` / `follower_cycle_*` - upstream-reset detection
//! - `mode2_*` / `observer_*` - write-ack quorum and timeout degradation
//! - `stress_*` - many shards across a few hosts

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use logship::{
    MemStorage, ReplicaRole, ReplicationError, Replicator, ReplicatorConfig, Storage, WriteBatch,
    WriteOptions,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn quick_config() -> ReplicatorConfig {
    ReplicatorConfig::for_testing()
}

fn new_host(config: ReplicatorConfig) -> Replicator {
    Replicator::new(config).expect("failed to start host")
}

/// Loopback address of a host's pull service.
fn pull_addr(host: &Replicator) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), host.local_addr().port())
}

fn one_put(key: &str, value: &str) -> WriteBatch {
    let mut batch = WriteBatch::new();
    batch.put(key, value);
    batch
}

/// Poll `cond` until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

// =============================================================================
// Basics
// =============================================================================

#[test]
fn basics() {
    init_tracing();
    let mut config = quick_config();
    config.timeout_ms = 2000;
    let host = new_host(config);

    assert!(matches!(
        host.remove_database("non_exist_db"),
        Err(ReplicationError::DbNotFound)
    ));
    assert!(matches!(
        host.write("non_exist_db", WriteOptions::default(), &one_put("key", "value")),
        Err(ReplicationError::DbNotFound)
    ));

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave: Arc<dyn Storage> = MemStorage::new();
    let addr = pull_addr(&host);

    host.add_database("master", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    assert!(matches!(
        host.add_database("master", Arc::clone(&db_master), ReplicaRole::Leader, None),
        Err(ReplicationError::DbPreExist)
    ));
    host.add_database("slave", Arc::clone(&db_slave), ReplicaRole::Follower, Some(addr))
        .unwrap();

    assert!(matches!(
        host.write("slave", WriteOptions::default(), &one_put("key", "value")),
        Err(ReplicationError::WriteToFollower)
    ));
    assert_eq!(
        host.write("master", WriteOptions::default(), &one_put("key", "value"))
            .unwrap(),
        1
    );
    assert_eq!(
        host.write("master", WriteOptions::default(), &one_put("key", "value"))
            .unwrap(),
        2
    );

    let master = host.db("master").unwrap();
    let slave = host.db("slave").unwrap();
    assert_eq!(
        master.introspect(),
        "ReplicatedDB:\n  name: master\n  ReplicaRole: LEADER\n  upstream_addr: uninitialized_addr\n  cur_seq_no: 2\n  current_replicator_timeout_ms_: 2000\n"
    );
    assert_eq!(
        slave.introspect(),
        "ReplicatedDB:\n  name: slave\n  ReplicaRole: FOLLOWER\n  upstream_addr: 127.0.0.1\n  cur_seq_no: 0\n  current_replicator_timeout_ms_: 2000\n"
    );

    assert_eq!(master.role(), ReplicaRole::Leader);
    assert_eq!(slave.role(), ReplicaRole::Follower);
    assert_eq!(master.consecutive_no_updates(), 0);
    drop(master);
    drop(slave);

    host.remove_database("slave").unwrap();
    host.remove_database("master").unwrap();
    assert!(matches!(
        host.remove_database("master"),
        Err(ReplicationError::DbNotFound)
    ));
    assert!(matches!(
        host.write("slave", WriteOptions::default(), &one_put("key", "value")),
        Err(ReplicationError::DbNotFound)
    ));
    assert!(matches!(
        host.write("master", WriteOptions::default(), &one_put("key", "value")),
        Err(ReplicationError::DbNotFound)
    ));
}

// =============================================================================
// Convergence Topologies
// =============================================================================

#[test]
fn one_master_one_slave() {
    init_tracing();
    let master = new_host(quick_config());
    let slave = new_host(quick_config());

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    slave
        .add_database(
            "shard1",
            Arc::clone(&db_slave),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();

    assert_eq!(db_master.latest_seq(), 0);
    assert_eq!(db_slave.latest_seq(), 0);

    let n_keys = 100u64;
    for i in 0..n_keys {
        let mut batch = WriteBatch::new();
        batch.put(format!("{}key", i), format!("{}value", i));
        batch.put(format!("{}key2", i), format!("{}value2", i));
        master
            .write("shard1", WriteOptions::default(), &batch)
            .unwrap();
        assert_eq!(db_master.latest_seq(), (i + 1) * 2);
    }

    assert!(
        wait_until(Duration::from_secs(10), || db_slave.latest_seq() >= n_keys * 2),
        "slave never caught up: at {}",
        db_slave.latest_seq()
    );
    assert_eq!(db_slave.latest_seq(), n_keys * 2);
    for i in 0..n_keys {
        assert_eq!(
            db_slave.get(format!("{}key", i).as_bytes()),
            Some(format!("{}value", i).into_bytes())
        );
        assert_eq!(
            db_slave.get(format!("{}key2", i).as_bytes()),
            Some(format!("{}value2", i).into_bytes())
        );
    }

    // Remove the master db from replication and write straight to its
    // storage engine: the slave must not receive the new keys.
    master.remove_database("shard1").unwrap();
    for i in 0..n_keys {
        let mut batch = WriteBatch::new();
        batch.put(format!("{}new_key", i), format!("{}new_value", i));
        db_master.write(&WriteOptions::default(), &batch).unwrap();
        assert_eq!(db_master.latest_seq(), i + 1 + n_keys * 2);
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(db_slave.latest_seq(), n_keys * 2);
}

#[test]
fn tree_one_master_two_slaves() {
    init_tracing();
    let master = new_host(quick_config());
    let slave_1 = new_host(quick_config());
    let slave_2 = new_host(quick_config());

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave_1: Arc<dyn Storage> = MemStorage::new();
    let db_slave_2: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    slave_1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_1),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();
    slave_2
        .add_database(
            "shard1",
            Arc::clone(&db_slave_2),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();

    let n_keys = 100u64;
    for i in 0..n_keys {
        master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}key", i), &format!("{}value", i)),
            )
            .unwrap();
        assert_eq!(db_master.latest_seq(), i + 1);
    }

    assert!(wait_until(Duration::from_secs(10), || {
        db_slave_1.latest_seq() >= n_keys && db_slave_2.latest_seq() >= n_keys
    }));
    assert_eq!(db_slave_1.latest_seq(), n_keys);
    assert_eq!(db_slave_2.latest_seq(), n_keys);
    for i in 0..n_keys {
        let key = format!("{}key", i);
        let value = Some(format!("{}value", i).into_bytes());
        assert_eq!(db_slave_1.get(key.as_bytes()), value);
        assert_eq!(db_slave_2.get(key.as_bytes()), value);
    }
}

#[test]
fn chain_remove_and_readd_middle() {
    init_tracing();
    let master = new_host(quick_config());
    let slave_1 = new_host(quick_config());
    let slave_2 = new_host(quick_config());

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave_1: Arc<dyn Storage> = MemStorage::new();
    let db_slave_2: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    slave_1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_1),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();
    // slave_2 roots at slave_1, forming a chain.
    slave_2
        .add_database(
            "shard1",
            Arc::clone(&db_slave_2),
            ReplicaRole::Follower,
            Some(pull_addr(&slave_1)),
        )
        .unwrap();

    let n_keys = 100u64;
    for i in 0..n_keys {
        master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}key", i), &format!("{}value", i)),
            )
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        db_slave_2.latest_seq() >= n_keys
    }));
    assert_eq!(db_slave_1.latest_seq(), n_keys);
    assert_eq!(db_slave_2.latest_seq(), n_keys);

    // Drop the middle node and push more writes; neither slave advances.
    slave_1.remove_database("shard1").unwrap();
    for i in 0..n_keys {
        master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}new_key", i), &format!("{}new_value", i)),
            )
            .unwrap();
        assert_eq!(db_master.latest_seq(), i + n_keys + 1);
    }
    thread::sleep(Duration::from_millis(300));
    assert_eq!(db_slave_1.latest_seq(), n_keys);
    assert_eq!(db_slave_2.latest_seq(), n_keys);

    // Re-add the middle node; the whole chain converges on the new keys.
    slave_1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_1),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        db_slave_2.latest_seq() >= 2 * n_keys
    }));
    assert_eq!(db_slave_1.latest_seq(), 2 * n_keys);
    assert_eq!(db_slave_2.latest_seq(), 2 * n_keys);
    for i in 0..n_keys {
        let key = format!("{}new_key", i);
        let value = Some(format!("{}new_value", i).into_bytes());
        assert_eq!(db_slave_1.get(key.as_bytes()), value);
        assert_eq!(db_slave_2.get(key.as_bytes()), value);
    }
}

// =============================================================================
// Upstream-Reset Detection
// =============================================================================

fn reset_detection_config() -> ReplicatorConfig {
    let mut config = quick_config();
    config.timeout_ms = 100;
    config.max_server_wait_time_ms = 100;
    config.client_server_timeout_difference_ms = 100;
    config.reset_upstream_on_empty_updates_from_non_leader = true;
    config.max_consecutive_no_updates_before_upstream_reset = 1;
    config
}

#[test]
fn self_loop_triggers_upstream_reset() {
    init_tracing();
    let master = new_host(reset_detection_config());
    let slave = new_host(reset_detection_config());

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    // The follower points at its own host: it can never receive updates
    // unless its upstream is reset to the real leader.
    let slave_self_addr = pull_addr(&slave);
    slave
        .add_database(
            "shard1",
            Arc::clone(&db_slave),
            ReplicaRole::Follower,
            Some(slave_self_addr),
        )
        .unwrap();

    let n_keys = 100u64;
    for i in 0..n_keys {
        let mut batch = WriteBatch::new();
        batch.put(format!("{}key", i), format!("{}value", i));
        batch.put(format!("{}key2", i), format!("{}value2", i));
        master
            .write("shard1", WriteOptions::default(), &batch)
            .unwrap();
    }

    let slave_db = slave.db("shard1").unwrap();
    let master_db = master.db("shard1").unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || slave_db.reset_upstream_attempts() > 0),
        "follower never attempted an upstream reset"
    );
    assert_eq!(master_db.reset_upstream_attempts(), 0);

    // The default resolver knows no upstream, so the reset cannot succeed
    // and the follower stays empty.
    assert_eq!(db_slave.latest_seq(), 0);
}

#[test]
fn follower_cycle_triggers_upstream_reset() {
    init_tracing();
    let master = new_host(reset_detection_config());
    let slave_1 = new_host(reset_detection_config());
    let slave_2 = new_host(reset_detection_config());

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_slave_1: Arc<dyn Storage> = MemStorage::new();
    let db_slave_2: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    // The two followers point at each other; neither can make progress.
    slave_1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_1),
            ReplicaRole::Follower,
            Some(pull_addr(&slave_2)),
        )
        .unwrap();
    slave_2
        .add_database(
            "shard1",
            Arc::clone(&db_slave_2),
            ReplicaRole::Follower,
            Some(pull_addr(&slave_1)),
        )
        .unwrap();

    let n_keys = 100u64;
    for i in 0..n_keys {
        master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}key", i), &format!("{}value", i)),
            )
            .unwrap();
    }

    let slave_1_db = slave_1.db("shard1").unwrap();
    let slave_2_db = slave_2.db("shard1").unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        slave_1_db.reset_upstream_attempts() > 0 && slave_2_db.reset_upstream_attempts() > 0
    }));
    assert_eq!(master.db("shard1").unwrap().reset_upstream_attempts(), 0);

    assert_eq!(db_slave_1.latest_seq(), 0);
    assert_eq!(db_slave_2.latest_seq(), 0);
}

// =============================================================================
// Mode 2: Write-Ack Quorum and Degradation
// =============================================================================

fn mode2_config() -> ReplicatorConfig {
    let mut config = quick_config();
    config.replication_mode = 2;
    config.timeout_ms = 100;
    config.timeout_degraded_ms = 5;
    config.consecutive_ack_timeouts_before_degradation = 30;
    config
}

#[test]
fn mode2_degradation_per_shard() {
    init_tracing();
    let master = new_host(mode2_config());
    let slave_shard1 = new_host(mode2_config());
    let slave_shard2 = new_host(mode2_config());

    let db_master_shard1: Arc<dyn Storage> = MemStorage::new();
    let db_master_shard2: Arc<dyn Storage> = MemStorage::new();
    let db_slave_shard1: Arc<dyn Storage> = MemStorage::new();
    let db_slave_shard2: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard1", Arc::clone(&db_master_shard1), ReplicaRole::Leader, None)
        .unwrap();
    master
        .add_database("shard2", Arc::clone(&db_master_shard2), ReplicaRole::Leader, None)
        .unwrap();
    slave_shard1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_shard1),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();
    slave_shard2
        .add_database(
            "shard2",
            Arc::clone(&db_slave_shard2),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();

    // With followers attached, mode-2 writes succeed on both shards.
    let n_keys = 10u64;
    for i in 0..n_keys {
        let mut batch = WriteBatch::new();
        batch.put(format!("{}key", i), format!("{}value", i));
        batch.put(format!("{}key2", i), format!("{}value2", i));
        master
            .write("shard1", WriteOptions::default(), &batch)
            .unwrap();
        master
            .write("shard2", WriteOptions::default(), &batch)
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        db_slave_shard1.latest_seq() >= n_keys * 2 && db_slave_shard2.latest_seq() >= n_keys * 2
    }));

    let master_shard1 = master.db("shard1").unwrap();
    let master_shard2 = master.db("shard2").unwrap();

    // Remove shard1's follower: every write times out waiting for an ack,
    // though the write itself still lands in storage.
    slave_shard1.remove_database("shard1").unwrap();
    for i in 0..n_keys {
        let err = master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}new_key", i), &format!("{}new_value", i)),
            )
            .unwrap_err();
        match err {
            ReplicationError::Timeout(msg) => {
                assert_eq!(msg, "Failed to receive ack from follower")
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert_eq!(db_master_shard1.latest_seq(), i + 1 + n_keys * 2);
    }
    assert_eq!(db_slave_shard1.latest_seq(), n_keys * 2);
    assert_eq!(master_shard1.current_timeout_ms(), 100);

    // Cross the degradation threshold.
    for i in 0..30 {
        let err = master
            .write(
                "shard1",
                WriteOptions::default(),
                &one_put(&format!("{}degraded_key", i), "value"),
            )
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)));
    }
    assert_eq!(master_shard1.current_timeout_ms(), 5);

    // shard2 is unaffected.
    master
        .write("shard2", WriteOptions::default(), &one_put("new_key", "new_value"))
        .unwrap();
    assert_eq!(master_shard2.current_timeout_ms(), 100);

    // Re-add shard1's follower, let it catch up, and the next write both
    // succeeds and restores the normal timeout.
    slave_shard1
        .add_database(
            "shard1",
            Arc::clone(&db_slave_shard1),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        db_slave_shard1.latest_seq() >= db_master_shard1.latest_seq()
    }));
    master
        .write("shard1", WriteOptions::default(), &one_put("recovered_key", "value"))
        .unwrap();
    assert_eq!(master_shard1.current_timeout_ms(), 100);
}

#[test]
fn observer_ack_does_not_count() {
    init_tracing();
    let mut config = mode2_config();
    config.consecutive_ack_timeouts_before_degradation = 1000;
    let master = new_host(config.clone());
    let observer = new_host(config.clone());
    let follower = new_host(config);

    let db_master: Arc<dyn Storage> = MemStorage::new();
    let db_observer: Arc<dyn Storage> = MemStorage::new();
    let db_follower: Arc<dyn Storage> = MemStorage::new();

    master
        .add_database("shard", Arc::clone(&db_master), ReplicaRole::Leader, None)
        .unwrap();
    observer
        .add_database(
            "shard",
            Arc::clone(&db_observer),
            ReplicaRole::Observer,
            Some(pull_addr(&master)),
        )
        .unwrap();

    // Only an observer is attached: writes land but time out on the ack.
    for i in 0..5 {
        let err = master
            .write(
                "shard",
                WriteOptions::default(),
                &one_put(&format!("{}key", i), &format!("{}value", i)),
            )
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)), "write {}", i);
    }
    // The observer still replicates the data.
    assert!(wait_until(Duration::from_secs(5), || {
        db_observer.latest_seq() >= 5
    }));

    // Attach a follower: once it catches up, writes succeed.
    follower
        .add_database(
            "shard",
            Arc::clone(&db_follower),
            ReplicaRole::Follower,
            Some(pull_addr(&master)),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        db_follower.latest_seq() >= db_master.latest_seq()
    }));
    master
        .write("shard", WriteOptions::default(), &one_put("acked_key", "value"))
        .unwrap();
}

// =============================================================================
// Stress
// =============================================================================

#[test]
fn stress_many_shards() {
    init_tracing();
    let host_1 = new_host(quick_config());
    let host_2 = new_host(quick_config());
    let host_3 = new_host(quick_config());
    let hosts = [&host_1, &host_2, &host_3];
    let addresses = [pull_addr(&host_1), pull_addr(&host_2), pull_addr(&host_3)];

    let n_shards = 20usize;
    let n_keys = 100u64;

    let mut db_masters = Vec::new();
    let mut db_slaves_1 = Vec::new();
    let mut db_slaves_2 = Vec::new();
    for i in 0..n_shards {
        let shard = format!("shard{}", i);
        let start = i % hosts.len();
        let db_master: Arc<dyn Storage> = MemStorage::new();
        let db_slave_1: Arc<dyn Storage> = MemStorage::new();
        let db_slave_2: Arc<dyn Storage> = MemStorage::new();

        hosts[start]
            .add_database(&shard, Arc::clone(&db_master), ReplicaRole::Leader, None)
            .unwrap();
        hosts[(start + 1) % hosts.len()]
            .add_database(
                &shard,
                Arc::clone(&db_slave_1),
                ReplicaRole::Follower,
                Some(addresses[start]),
            )
            .unwrap();
        hosts[(start + 2) % hosts.len()]
            .add_database(
                &shard,
                Arc::clone(&db_slave_2),
                ReplicaRole::Follower,
                Some(addresses[start]),
            )
            .unwrap();

        db_masters.push(db_master);
        db_slaves_1.push(db_slave_1);
        db_slaves_2.push(db_slave_2);
    }

    // Every host is asked to write every shard; only the shard's leader
    // accepts, the rest reject with WriteToFollower.
    for i in 0..n_keys {
        for j in 0..n_shards {
            let shard = format!("shard{}", j);
            let batch = one_put(&format!("{}key", i), &format!("{}value", i));
            for host in hosts {
                match host.write(&shard, WriteOptions::default(), &batch) {
                    Ok(_) => {}
                    Err(ReplicationError::WriteToFollower) => {}
                    Err(other) => panic!("unexpected write error: {:?}", other),
                }
            }
        }
    }

    for i in 0..n_shards {
        assert_eq!(db_masters[i].latest_seq(), n_keys, "shard{} master", i);
        assert!(
            wait_until(Duration::from_secs(15), || {
                db_slaves_1[i].latest_seq() >= n_keys && db_slaves_2[i].latest_seq() >= n_keys
            }),
            "shard{} slaves never converged ({} / {})",
            i,
            db_slaves_1[i].latest_seq(),
            db_slaves_2[i].latest_seq()
        );

        for j in (0..n_keys).step_by(10) {
            let key = format!("{}key", j);
            let value = Some(format!("{}value", j).into_bytes());
            assert_eq!(db_masters[i].get(key.as_bytes()), value);
            assert_eq!(db_slaves_1[i].get(key.as_bytes()), value);
            assert_eq!(db_slaves_2[i].get(key.as_bytes()), value);
        }
    }
}
