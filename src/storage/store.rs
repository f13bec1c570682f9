//! Sharded node store.
//!
//! Routes every node to a shard by the high half of its id, assigns the
//! store-wide `created_at` sequence and, for on-disk engines, keeps one
//! node log per shard.
//!
//! Directory layout:
//! ```text
//! <db_path>/
//! +-- engine_config.json     # EngineConfig (shard_count, bloom shape, ...)
//! +-- shards/
//! |   +-- 00/nodes.log       # Shard 0
//! |   +-- 01/nodes.log       # Shard 1
//! |   +-- ...
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::error::{AncestryError, Result};
use crate::router::ShardPlanner;
use crate::storage::shard::{Inserted, NodeShard, ShardBackend};
use crate::types::{compute_node_id, Node, NodeId, ShardId};

fn shard_dir(db_path: &Path, shard_id: ShardId) -> PathBuf {
    db_path.join("shards").join(format!("{:02}", shard_id))
}

// ── Shard Stats ────────────────────────────────────────────────────

/// Per-shard statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub node_count: usize,
    pub log_bytes: u64,
    pub available: bool,
    pub reads_served: u64,
}

// ── Node Store ─────────────────────────────────────────────────────

pub struct NodeStore {
    db_path: Option<PathBuf>,
    planner: ShardPlanner,
    shards: Vec<Arc<NodeShard>>,
    next_seq: AtomicU64,
}

impl NodeStore {
    pub fn ephemeral(config: &EngineConfig) -> Self {
        let shards = (0..config.shard_count)
            .map(|i| Arc::new(NodeShard::ephemeral(i)))
            .collect();
        Self {
            db_path: None,
            planner: ShardPlanner::new(config.shard_count),
            shards,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create a new store on disk. Writes `engine_config.json`.
    pub fn create(db_path: &Path, config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(db_path)?;
        config.write_to(db_path)?;

        let mut shards = Vec::with_capacity(config.shard_count as usize);
        for i in 0..config.shard_count {
            let shard = NodeShard::create(&shard_dir(db_path, i), i, config.sync_on_append)?;
            shards.push(Arc::new(shard));
        }

        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            planner: ShardPlanner::new(config.shard_count),
            shards,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Open an existing store, replaying every shard's log in parallel.
    ///
    /// Returns the store and all replayed nodes ordered by `created_at`,
    /// which is a valid parents-first order for nodes appended locally.
    pub fn open(db_path: &Path, config: &EngineConfig) -> Result<(Self, Vec<Node>)> {
        let opened: Vec<Result<(NodeShard, Vec<Node>)>> = (0..config.shard_count)
            .into_par_iter()
            .map(|i| NodeShard::open(&shard_dir(db_path, i), i, config.sync_on_append))
            .collect();

        let mut shards = Vec::with_capacity(opened.len());
        let mut replayed = Vec::new();
        for result in opened {
            let (shard, nodes) = result?;
            shards.push(Arc::new(shard));
            replayed.extend(nodes);
        }
        replayed.sort_by_key(|n| n.created_at);

        let next_seq = replayed.last().map_or(0, |n| n.created_at + 1);
        tracing::info!(
            path = %db_path.display(),
            shards = shards.len(),
            nodes = replayed.len(),
            "opened node store"
        );

        let store = Self {
            db_path: Some(db_path.to_path_buf()),
            planner: ShardPlanner::new(config.shard_count),
            shards,
            next_seq: AtomicU64::new(next_seq),
        };
        Ok((store, replayed))
    }

    fn shard_for(&self, id: NodeId) -> &Arc<NodeShard> {
        &self.shards[self.planner.compute_shard_id(id) as usize]
    }

    /// Append a node with the given parents and payload.
    ///
    /// The id is the content hash of `(parents, payload)`; appending the
    /// same content twice returns the existing node.
    pub fn append(&self, parents: &[NodeId], payload: &[u8]) -> Result<Inserted> {
        let id = compute_node_id(parents, payload);
        self.shard_for(id).insert_with(id, || Node {
            id,
            parents: parents.to_vec(),
            created_at: self.next_seq.fetch_add(1, Ordering::SeqCst),
        })
    }

    /// Insert a node produced elsewhere (replication, import), keeping its
    /// id and parents. The local sequence number is assigned here.
    pub fn insert_existing(&self, id: NodeId, parents: Vec<NodeId>) -> Result<Inserted> {
        self.shard_for(id).insert_with(id, || Node {
            id,
            parents,
            created_at: self.next_seq.fetch_add(1, Ordering::SeqCst),
        })
    }

    pub fn get(&self, id: NodeId) -> Result<Arc<Node>> {
        self.shard_for(id).get(id).ok_or(AncestryError::NodeNotFound(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.shard_for(id).contains(id)
    }

    /// Look up many ids, grouped per shard. Unknown ids are skipped.
    pub fn batch_get(&self, ids: &[NodeId]) -> HashMap<NodeId, Arc<Node>> {
        let mut out = HashMap::with_capacity(ids.len());
        for (shard_id, group) in self.planner.plan(ids) {
            let shard = &self.shards[shard_id as usize];
            for id in group {
                if let Some(node) = shard.get(id) {
                    out.insert(id, node);
                }
            }
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn shard_count(&self) -> u16 {
        self.planner.shard_count()
    }

    pub fn planner(&self) -> ShardPlanner {
        self.planner
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<&Arc<NodeShard>> {
        self.shards.get(shard_id as usize)
    }

    /// Shards as router backends, indexed by shard id.
    pub fn backends(&self) -> Vec<Arc<dyn ShardBackend>> {
        self.shards
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ShardBackend>)
            .collect()
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.shards
            .iter()
            .map(|s| ShardStats {
                shard_id: s.shard_id(),
                node_count: s.len(),
                log_bytes: s.log_bytes(),
                available: s.is_available(),
                reads_served: s.reads_served(),
            })
            .collect()
    }

    pub fn sync(&self) -> Result<()> {
        for shard in &self.shards {
            shard.sync()?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(shards: u16) -> EngineConfig {
        EngineConfig::default().with_shard_count(shards)
    }

    #[test]
    fn test_append_is_content_addressed() {
        let store = NodeStore::ephemeral(&config(4));
        let a = store.append(&[], b"root").unwrap();
        let again = store.append(&[], b"root").unwrap();
        assert!(a.created);
        assert!(!again.created);
        assert_eq!(a.node.id, again.node.id);
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_created_at_is_sequential() {
        let store = NodeStore::ephemeral(&config(3));
        let a = store.append(&[], b"a").unwrap().node;
        let b = store.append(&[a.id], b"b").unwrap().node;
        let _dup = store.append(&[a.id], b"b").unwrap();
        let c = store.append(&[b.id], b"c").unwrap().node;
        assert_eq!((a.created_at, b.created_at, c.created_at), (0, 1, 2));
    }

    #[test]
    fn test_nodes_land_on_planned_shard() {
        let store = NodeStore::ephemeral(&config(8));
        let planner = ShardPlanner::new(8);
        for i in 0..64u32 {
            let id = store.append(&[], &i.to_le_bytes()).unwrap().node.id;
            let shard = store.shard(planner.compute_shard_id(id)).unwrap();
            assert!(shard.contains(id));
        }
        let stats = store.shard_stats();
        assert_eq!(stats.len(), 8);
        assert_eq!(stats.iter().map(|s| s.node_count).sum::<usize>(), 64);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = NodeStore::ephemeral(&config(2));
        let err = store.get(NodeId(12345)).unwrap_err();
        assert_eq!(err.code(), "NODE_NOT_FOUND");
    }

    #[test]
    fn test_batch_get_skips_unknown() {
        let store = NodeStore::ephemeral(&config(4));
        let a = store.append(&[], b"a").unwrap().node.id;
        let b = store.append(&[a], b"b").unwrap().node.id;
        let found = store.batch_get(&[a, NodeId(1), b]);
        assert_eq!(found.len(), 2);
        assert!(found.contains_key(&a) && found.contains_key(&b));
    }

    #[test]
    fn test_reopen_restores_nodes_and_sequence() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        let cfg = config(4);

        let ids: Vec<NodeId> = {
            let store = NodeStore::create(&db, &cfg).unwrap();
            let mut ids = vec![store.append(&[], b"root").unwrap().node.id];
            for i in 0..20u32 {
                let parent = *ids.last().unwrap();
                ids.push(store.append(&[parent], &i.to_le_bytes()).unwrap().node.id);
            }
            store.sync().unwrap();
            ids
        };

        let (store, replayed) = NodeStore::open(&db, &cfg).unwrap();
        assert_eq!(store.node_count(), ids.len());
        let order: Vec<NodeId> = replayed.iter().map(|n| n.id).collect();
        assert_eq!(order, ids, "replay must follow append order");

        let next = store.append(&[ids[0]], b"after-reopen").unwrap().node;
        assert_eq!(next.created_at, ids.len() as u64);
    }
}
