//! Pilcrow: the distributed query execution core of a bitmap-index
//! database. Sparse boolean matrices are partitioned by column into
//! fixed-width shards and spread across nodes with replication; a
//! composable call tree is planned, fanned out per shard and reduced with
//! operator-specific merge semantics.

pub mod bsi;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod execution_context;
pub mod executor;
pub mod pql;
pub mod result;
pub mod row;
pub mod translate;

pub use cluster::{Cluster, InternalClient, LoopbackClient, Node};
pub use config::{Config, QueryOptions};
pub use error::{ErrorKind, ExecError};
pub use executor::Executor;
pub use pql::{Arg, Call, CmpOp, Condition, Literal};
pub use result::{QueryResponse, QueryResult};
pub use row::Row;
