// Copyright 2025 Granite Project Authors. Licensed under Apache-2.0.

//! Recognized tunables, with the defaults the hosting binaries ship.

use std::time::Duration;

/// Consensus-side knobs for the peer driver.
#[derive(Clone, Debug)]
pub struct ConsensusOptions {
    /// Timeout used for all consensus internal RPC communications.
    pub consensus_rpc_timeout: Duration,
    pub raft_heartbeat_interval: Duration,
    /// Timeout for retrieving node instance data over RPC.
    pub raft_get_node_instance_timeout: Duration,
    /// Whether the leader initiates tablet copy for followers that
    /// are out of date or missing the tablet.
    pub enable_tablet_copy: bool,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        ConsensusOptions {
            consensus_rpc_timeout: Duration::from_millis(30_000),
            raft_heartbeat_interval: Duration::from_millis(500),
            raft_get_node_instance_timeout: Duration::from_millis(30_000),
            enable_tablet_copy: true,
        }
    }
}

/// Maintenance scheduling knobs.
#[derive(Clone, Debug)]
pub struct MaintenanceOptions {
    /// Size at which MRS/DMS flushes are triggered. A memstore can
    /// still flush below this if it has not flushed in a while.
    pub flush_threshold_mb: u64,
    /// Seconds after which a non-empty memstore becomes flushable
    /// even if it is not large.
    pub flush_threshold_secs: u64,
    /// Milliseconds after which the time-based flush score reaches
    /// its maximum.
    pub flush_upper_bound_ms: u64,
    pub enable_flush_memrowset: bool,
    pub enable_flush_deltamemstores: bool,
    pub enable_log_gc: bool,
    pub num_maintenance_threads: usize,
    pub polling_interval: Duration,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        MaintenanceOptions {
            flush_threshold_mb: 1024,
            flush_threshold_secs: 120,
            flush_upper_bound_ms: 60 * 60 * 1000,
            enable_flush_memrowset: true,
            enable_flush_deltamemstores: true,
            enable_log_gc: true,
            num_maintenance_threads: 1,
            polling_interval: Duration::from_millis(250),
        }
    }
}
