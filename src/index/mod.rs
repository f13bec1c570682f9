//! Derived per-node indices: generation numbers and ancestry filters.
//!
//! Both live in one [`IndexCatalog`] entry so a node's generation and its
//! filter become visible together. Entries are write-once: a published
//! entry never changes, and a node is published only after all of its
//! parents have been.

pub mod generation;
pub mod summary;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::types::NodeId;

pub use generation::GenerationIndex;
pub use summary::{AncestryFilter, BloomParams, SummaryIndex};

/// Derived data for one indexed node.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// 0 for roots, otherwise 1 + max parent generation.
    pub generation: u64,
    pub filter: AncestryFilter,
}

/// Write-once map from node id to its derived indices.
///
/// Readers take a shared lock per lookup. The ingest worker publishes
/// whole waves under a single write lock, then bumps the watch counter
/// so `wait_for` callers re-check.
pub struct IndexCatalog {
    entries: RwLock<HashMap<NodeId, Arc<IndexEntry>>>,
    params: BloomParams,
    published: watch::Sender<u64>,
}

impl IndexCatalog {
    pub fn new(params: BloomParams) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            params,
            published,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Arc<IndexEntry>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Arc<IndexEntry>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn params(&self) -> BloomParams {
        self.params
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<IndexEntry>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn generation(&self, id: NodeId) -> Option<u64> {
        self.read().get(&id).map(|e| e.generation)
    }

    /// Fetch several entries under one read lock. Absent ids are skipped.
    pub fn get_many(&self, ids: &[NodeId]) -> Vec<(NodeId, Arc<IndexEntry>)> {
        let entries = self.read();
        ids.iter()
            .filter_map(|id| entries.get(id).map(|e| (*id, Arc::clone(e))))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish a wave of entries. Ids already present keep their
    /// original entry. Returns how many entries were new.
    pub fn publish_wave(&self, wave: Vec<(NodeId, IndexEntry)>) -> usize {
        let mut added = 0;
        {
            let mut entries = self.write();
            for (id, entry) in wave {
                if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(id) {
                    slot.insert(Arc::new(entry));
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.published.send_modify(|n| *n += added as u64);
        }
        added
    }

    /// Wait until `id` is indexed or `timeout` elapses.
    pub async fn wait_for(&self, id: NodeId, timeout: Duration) -> bool {
        let mut rx = self.published.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.contains(id) {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.contains(id),
            }
        }
    }
}
