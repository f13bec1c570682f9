//! Node storage: per-shard node logs, shards, and the sharded store.

pub mod node_log;
pub mod shard;
pub mod store;

pub use shard::{Inserted, NodeShard, ShardBackend, ShardRead};
pub use store::{NodeStore, ShardStats};
