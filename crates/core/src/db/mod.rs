//! The node-local data layer: schema definitions and the in-memory shard
//! store the executor reads through per-query snapshot views.

pub mod datastore;
pub mod schema;

pub use datastore::{ShardView, Store};
pub use schema::{CacheType, FieldDef, FieldType, IndexDef, Schema};
