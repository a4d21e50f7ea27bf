//! Engine and per-query configuration.

use std::time::Instant;

/// Node-level configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Replicas per shard across the cluster.
    pub replica_n: usize,
    /// Cap on mutating calls per request. `None` is permissive.
    pub max_writes_per_request: Option<u64>,
    /// Per-shard retry budget for retriable transport failures.
    pub shard_retry_budget: u32,
    /// Bound on concurrently executing local shard kernels. Defaults to
    /// available parallelism.
    pub local_parallelism: Option<usize>,
    /// Bound on concurrently outstanding peer RPCs.
    pub rpc_parallelism: usize,
    /// Default per-query buffer cap when the query sets none.
    pub default_max_memory: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replica_n: 1,
            max_writes_per_request: None,
            shard_retry_budget: 2,
            local_parallelism: None,
            rpc_parallelism: 16,
            default_max_memory: None,
        }
    }
}

impl Config {
    pub fn local_workers(&self) -> usize {
        self.local_parallelism
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
            .max(1)
    }
}

/// Options for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub deadline: Option<Instant>,
    /// Cap on bytes buffered by Extract/Sort/GroupBy for this query.
    pub max_memory: Option<u64>,
}
