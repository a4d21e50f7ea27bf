//! Cluster membership view, shard placement and the internal RPC seam.
//!
//! Membership itself (gossip, joins, failures) is owned elsewhere; the
//! executor only needs a stable node list, a deterministic shard→replica
//! placement, and a transport. The transport is the [`InternalClient`]
//! trait; [`LoopbackClient`] is the in-process implementation used by tests
//! and single-node deployments.

use crate::error::RpcError;
use crate::executor::{Executor, Partial};
use crate::pql::Call;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub uri: String,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let uri = format!("pilcrow://{id}");
        Self { id, uri }
    }
}

/// The membership view one node holds.
pub struct Cluster {
    nodes: Vec<Node>,
    self_id: String,
    replica_n: usize,
    down: RwLock<HashSet<String>>,
}

impl Cluster {
    pub fn new(mut nodes: Vec<Node>, self_id: impl Into<String>, replica_n: usize) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            nodes,
            self_id: self_id.into(),
            replica_n: replica_n.max(1),
            down: RwLock::new(HashSet::new()),
        }
    }

    pub fn single(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        Self::new(vec![Node::new(self_id.clone())], self_id, 1)
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn replica_n(&self) -> usize {
        self.replica_n.min(self.nodes.len())
    }

    /// Health hints from the membership layer. Down nodes are deprioritized
    /// for reads, not excluded: a retry may still land on one if every
    /// replica is marked down.
    pub fn mark_down(&self, node: &str) {
        self.down.write().insert(node.to_owned());
    }

    pub fn mark_up(&self, node: &str) {
        self.down.write().remove(node);
    }

    fn is_down(&self, node: &str) -> bool {
        self.down.read().contains(node)
    }

    /// The replica set owning `shard`, deterministic across every node that
    /// shares the membership view.
    pub fn replicas(&self, index: &str, shard: u64) -> Vec<&str> {
        let n = self.nodes.len();
        let start = (placement_hash(index, shard) % n as u64) as usize;
        (0..self.replica_n())
            .map(|i| self.nodes[(start + i) % n].id.as_str())
            .collect()
    }

    pub fn is_local_replica(&self, index: &str, shard: u64) -> bool {
        self.replicas(index, shard).contains(&self.self_id.as_str())
    }

    /// Replica preference order for a read of `shard`: self first when this
    /// node is a replica, otherwise round-robin by shard over healthy peers,
    /// with down peers last as a final resort.
    pub fn read_candidates(&self, index: &str, shard: u64) -> Vec<String> {
        let replicas = self.replicas(index, shard);
        let mut order: Vec<&str> = Vec::with_capacity(replicas.len());
        if let Some(pos) = replicas.iter().position(|id| *id == self.self_id) {
            order.push(replicas[pos]);
            order.extend(replicas.iter().enumerate().filter(|(i, _)| *i != pos).map(|(_, id)| *id));
        } else {
            let rot = (shard as usize) % replicas.len();
            order.extend(replicas[rot..].iter().chain(replicas[..rot].iter()));
        }
        let (up, down): (Vec<&str>, Vec<&str>) = order.into_iter().partition(|id| !self.is_down(id));
        up.into_iter().chain(down).map(str::to_owned).collect()
    }
}

fn placement_hash(index: &str, shard: u64) -> u64 {
    // FNV-1a; placement must agree across nodes, so no per-process seeds.
    let mut h: u64 = 0xcbf29ce484222325;
    for b in index.as_bytes().iter().copied().chain(shard.to_le_bytes()) {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// One shard-scoped unit of remote work.
#[derive(Debug, Clone)]
pub struct ShardRequest {
    pub index: String,
    pub call: Call,
    pub shards: Vec<u64>,
}

/// A partial result tagged with the shard that produced it.
#[derive(Debug)]
pub struct ShardPartial {
    pub shard: u64,
    pub partial: Partial,
}

/// The internal transport. Real deployments put gRPC behind this; the
/// executor only sees the trait.
#[async_trait]
pub trait InternalClient: Send + Sync {
    async fn query_shards(&self, node: &str, req: ShardRequest) -> Result<Vec<ShardPartial>, RpcError>;
}

/// In-process transport: routes requests straight into peer executors.
#[derive(Default)]
pub struct LoopbackClient {
    peers: RwLock<FxHashMap<String, Arc<Executor>>>,
    broken: RwLock<HashSet<String>>,
}

impl LoopbackClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &str, exec: Arc<Executor>) {
        self.peers.write().insert(node.to_owned(), exec);
    }

    /// Simulates a transport failure toward `node` until healed.
    pub fn break_node(&self, node: &str) {
        self.broken.write().insert(node.to_owned());
    }

    pub fn heal_node(&self, node: &str) {
        self.broken.write().remove(node);
    }
}

#[async_trait]
impl InternalClient for LoopbackClient {
    async fn query_shards(&self, node: &str, req: ShardRequest) -> Result<Vec<ShardPartial>, RpcError> {
        if self.broken.read().contains(node) {
            return Err(RpcError::Unavailable { node: node.to_owned(), detail: "connection refused".into() });
        }
        let peer = self.peers.read().get(node).cloned();
        let Some(peer) = peer else {
            return Err(RpcError::Unavailable { node: node.to_owned(), detail: "unknown peer".into() });
        };
        peer.execute_shards_local(req)
            .await
            .map_err(|e| RpcError::Remote { node: node.to_owned(), source: Box::new(e) })
    }
}
