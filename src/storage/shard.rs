//! Single node shard: the unit the router fans reads out to.
//!
//! A shard holds an in-memory map of the nodes routed to it and, for
//! on-disk engines, an append-only node log replayed on open.
//!
//! Write path: node -> log append -> map insert
//! Read path:  batch of ids -> map lookups
//!
//! Shards can be marked unavailable and given an artificial read latency,
//! which stand in for partitions and slow remote shards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::{AncestryError, Result};
use crate::storage::node_log::{self, NodeLogWriter, LOG_FILE_NAME};
use crate::types::{Node, NodeId, ShardId};

// ── Backend trait ───────────────────────────────────────────────────

/// Nodes served by one shard read.
#[derive(Debug, Default)]
pub struct ShardRead {
    pub found: Vec<Arc<Node>>,
    /// Requested ids this shard has no record of.
    pub missing: Vec<NodeId>,
}

/// Read side of a shard as seen by the router.
///
/// `read_batch` is blocking; the router runs it on the blocking pool.
pub trait ShardBackend: Send + Sync {
    fn shard_id(&self) -> ShardId;

    /// Read a batch of ids. Fails with `ShardUnavailable` when the shard
    /// cannot serve reads right now.
    fn read_batch(&self, ids: &[NodeId]) -> Result<ShardRead>;
}

// ── NodeShard ───────────────────────────────────────────────────────

/// Outcome of inserting a node into a shard.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub node: Arc<Node>,
    /// False when the id was already present (content-addressed dedup).
    pub created: bool,
}

pub struct NodeShard {
    shard_id: ShardId,
    path: Option<PathBuf>,
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    log: Option<Mutex<NodeLogWriter>>,
    available: AtomicBool,
    read_latency_us: AtomicU64,
    reads_served: AtomicU64,
}

impl NodeShard {
    /// In-memory shard with no log.
    pub fn ephemeral(shard_id: ShardId) -> Self {
        Self::with_log(shard_id, None, None, HashMap::new())
    }

    /// Create an empty shard directory with a fresh node log.
    pub fn create(dir: &Path, shard_id: ShardId, sync_on_append: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let writer = NodeLogWriter::create(&dir.join(LOG_FILE_NAME), shard_id, sync_on_append)?;
        Ok(Self::with_log(shard_id, Some(dir.to_path_buf()), Some(writer), HashMap::new()))
    }

    /// Open an existing shard, replaying its log. Returns the shard and
    /// the replayed nodes in log order.
    pub fn open(dir: &Path, shard_id: ShardId, sync_on_append: bool) -> Result<(Self, Vec<Node>)> {
        let log_path = dir.join(LOG_FILE_NAME);
        if !log_path.exists() {
            return Ok((Self::create(dir, shard_id, sync_on_append)?, Vec::new()));
        }

        let replay = node_log::replay(&log_path, shard_id)?;
        if replay.torn_bytes > 0 {
            tracing::warn!(
                shard_id,
                torn_bytes = replay.torn_bytes,
                "truncating torn tail of node log"
            );
        }
        let writer =
            NodeLogWriter::open_append(&log_path, shard_id, replay.valid_len, sync_on_append)?;

        let nodes: HashMap<NodeId, Arc<Node>> = replay
            .nodes
            .iter()
            .map(|n| (n.id, Arc::new(n.clone())))
            .collect();
        let shard = Self::with_log(shard_id, Some(dir.to_path_buf()), Some(writer), nodes);
        Ok((shard, replay.nodes))
    }

    fn with_log(
        shard_id: ShardId,
        path: Option<PathBuf>,
        log: Option<NodeLogWriter>,
        nodes: HashMap<NodeId, Arc<Node>>,
    ) -> Self {
        Self {
            shard_id,
            path,
            nodes: RwLock::new(nodes),
            log: log.map(Mutex::new),
            available: AtomicBool::new(true),
            read_latency_us: AtomicU64::new(0),
            reads_served: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Arc<Node>>> {
        self.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Arc<Node>>> {
        self.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert the node built by `make` unless `id` is already present.
    ///
    /// `make` runs under the shard's write lock, so it is called at most
    /// once per id. The log append happens before the node becomes
    /// readable.
    pub fn insert_with<F>(&self, id: NodeId, make: F) -> Result<Inserted>
    where
        F: FnOnce() -> Node,
    {
        let mut nodes = self.write();
        if let Some(existing) = nodes.get(&id) {
            return Ok(Inserted { node: Arc::clone(existing), created: false });
        }
        let node = make();
        debug_assert_eq!(node.id, id);
        if let Some(log) = &self.log {
            log.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .append(&node)?;
        }
        let node = Arc::new(node);
        nodes.insert(id, Arc::clone(&node));
        Ok(Inserted { node, created: true })
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn log_bytes(&self) -> u64 {
        self.log
            .as_ref()
            .map(|log| log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .unwrap_or(0)
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(log) = &self.log {
            log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).sync()?;
        }
        Ok(())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn reads_served(&self) -> u64 {
        self.reads_served.load(Ordering::Relaxed)
    }
}

impl ShardBackend for NodeShard {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn read_batch(&self, ids: &[NodeId]) -> Result<ShardRead> {
        let latency = self.read_latency_us.load(Ordering::Relaxed);
        if latency > 0 {
            std::thread::sleep(Duration::from_micros(latency));
        }
        if !self.is_available() {
            return Err(AncestryError::ShardUnavailable { shard: self.shard_id, ids: ids.len() });
        }

        let nodes = self.read();
        let mut out = ShardRead::default();
        for id in ids {
            match nodes.get(id) {
                Some(node) => out.found.push(Arc::clone(node)),
                None => out.missing.push(*id),
            }
        }
        self.reads_served.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }
}
