//! Shard routing and batched node fetch.
//!
//! `ShardPlanner` maps node ids to shards deterministically. `ShardRouter`
//! takes a set of ids, groups them per shard, splits each group into
//! batches and issues every batch in parallel, retrying transient shard
//! failures with exponential backoff inside the caller's deadline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::time::Instant;

use crate::config::RetryPolicy;
use crate::error::{AncestryError, Result};
use crate::metrics::Metrics;
use crate::storage::ShardBackend;
use crate::types::{Node, NodeId, ShardId};

// ── Shard Planner ──────────────────────────────────────────────────

/// Deterministic shard planner: node id -> shard id.
///
/// Uses the high 64 bits of the id. Ids are BLAKE3 output, so this is
/// uniform without re-hashing, and independent of the low half that
/// seeds bloom probes.
#[derive(Debug, Clone, Copy)]
pub struct ShardPlanner {
    shard_count: u16,
}

impl ShardPlanner {
    /// Create a planner for the given number of shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is 0.
    pub fn new(shard_count: u16) -> Self {
        assert!(shard_count > 0, "shard_count must be > 0");
        Self { shard_count }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    #[inline]
    pub fn compute_shard_id(&self, id: NodeId) -> ShardId {
        (id.high64() % self.shard_count as u64) as ShardId
    }

    /// Group ids by shard. Every input id appears in exactly one group;
    /// order within a group follows input order.
    pub fn plan(&self, ids: &[NodeId]) -> HashMap<ShardId, Vec<NodeId>> {
        let mut result: HashMap<ShardId, Vec<NodeId>> = HashMap::new();
        for id in ids {
            result.entry(self.compute_shard_id(*id)).or_default().push(*id);
        }
        result
    }
}

// ── Node Cache ─────────────────────────────────────────────────────

/// Bounded FIFO cache of fetched nodes. Nodes are immutable, so entries
/// never go stale.
struct NodeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    nodes: HashMap<NodeId, Arc<Node>>,
    order: VecDeque<NodeId>,
}

impl NodeCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(CacheInner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Split `ids` into cached nodes and ids still to fetch.
    fn lookup(&self, ids: &[NodeId]) -> (HashMap<NodeId, Arc<Node>>, Vec<NodeId>) {
        if self.capacity == 0 {
            return (HashMap::new(), ids.to_vec());
        }
        let inner = self.lock();
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for id in ids {
            match inner.nodes.get(id) {
                Some(node) => {
                    hits.insert(*id, Arc::clone(node));
                }
                None => misses.push(*id),
            }
        }
        (hits, misses)
    }

    fn insert_all<'a, I: IntoIterator<Item = &'a Arc<Node>>>(&self, nodes: I) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        for node in nodes {
            if inner.nodes.contains_key(&node.id) {
                continue;
            }
            if inner.order.len() >= self.capacity {
                if let Some(old) = inner.order.pop_front() {
                    inner.nodes.remove(&old);
                }
            }
            inner.order.push_back(node.id);
            inner.nodes.insert(node.id, Arc::clone(node));
        }
    }

    fn len(&self) -> usize {
        self.lock().nodes.len()
    }
}

// ── Batch Fetch ────────────────────────────────────────────────────

/// Result of a batched fetch. Every requested id lands in exactly one of
/// the three buckets.
#[derive(Debug, Default)]
pub struct BatchFetch {
    pub nodes: HashMap<NodeId, Arc<Node>>,
    /// Ids no shard has a record of.
    pub missing: HashSet<NodeId>,
    /// Ids whose shard stayed unavailable through all retries.
    pub unavailable: HashMap<NodeId, ShardId>,
}

impl BatchFetch {
    pub fn get(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(&id)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unavailable.is_empty()
    }

    /// Some shard that could not be reached, if any.
    pub fn first_unavailable_shard(&self) -> Option<ShardId> {
        self.unavailable.values().min().copied()
    }
}

/// Outcome of one shard batch after retries.
enum BatchOutcome {
    Served { found: Vec<Arc<Node>>, missing: Vec<NodeId>, retries: u64 },
    Unavailable { shard: ShardId, ids: Vec<NodeId>, retries: u64 },
}

// ── Shard Router ───────────────────────────────────────────────────

pub struct ShardRouter {
    planner: ShardPlanner,
    backends: Vec<Arc<dyn ShardBackend>>,
    batch_size: usize,
    retry: RetryPolicy,
    cache: NodeCache,
    metrics: Arc<Metrics>,
}

impl ShardRouter {
    /// `backends[i]` must serve shard `i`, one backend per planned shard.
    pub fn new(
        planner: ShardPlanner,
        backends: Vec<Arc<dyn ShardBackend>>,
        batch_size: usize,
        cache_capacity: usize,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if backends.len() != planner.shard_count() as usize {
            return Err(AncestryError::Config(format!(
                "planner expects {} shards, got {} backends",
                planner.shard_count(),
                backends.len()
            )));
        }
        Ok(Self {
            planner,
            backends,
            batch_size: batch_size.max(1),
            retry,
            cache: NodeCache::new(cache_capacity),
            metrics,
        })
    }

    pub fn planner(&self) -> &ShardPlanner {
        &self.planner
    }

    pub fn locate(&self, id: NodeId) -> ShardId {
        self.planner.compute_shard_id(id)
    }

    pub fn batch_locate(&self, ids: &[NodeId]) -> HashMap<NodeId, ShardId> {
        ids.iter().map(|id| (*id, self.locate(*id))).collect()
    }

    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// Fetch `ids` from their shards.
    ///
    /// Cached nodes are served locally. The rest are grouped per shard,
    /// chunked to `batch_size`, and all chunks are issued concurrently.
    /// Retries never sleep past `deadline`.
    pub async fn fetch_batch(&self, ids: &[NodeId], deadline: Option<Instant>) -> BatchFetch {
        let mut unique: Vec<NodeId> = Vec::with_capacity(ids.len());
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if seen.insert(*id) {
                unique.push(*id);
            }
        }

        let (hits, to_fetch) = self.cache.lookup(&unique);
        if !hits.is_empty() {
            self.metrics.record_cache_hits(hits.len() as u64);
        }
        let mut out = BatchFetch { nodes: hits, ..Default::default() };
        if to_fetch.is_empty() {
            return out;
        }

        let mut calls = Vec::new();
        for (shard_id, group) in self.planner.plan(&to_fetch) {
            for chunk in group.chunks(self.batch_size) {
                calls.push(self.fetch_from_shard(shard_id, chunk.to_vec(), deadline));
            }
        }
        self.metrics.record_batches(calls.len() as u64);

        for outcome in join_all(calls).await {
            match outcome {
                BatchOutcome::Served { found, missing, retries } => {
                    self.record_retries(retries);
                    self.cache.insert_all(found.iter());
                    out.nodes.extend(found.into_iter().map(|n| (n.id, n)));
                    out.missing.extend(missing);
                }
                BatchOutcome::Unavailable { shard, ids, retries } => {
                    self.record_retries(retries);
                    out.unavailable.extend(ids.into_iter().map(|id| (id, shard)));
                }
            }
        }
        out
    }

    fn record_retries(&self, retries: u64) {
        for _ in 0..retries {
            self.metrics.record_shard_retry();
        }
    }

    async fn fetch_from_shard(
        &self,
        shard_id: ShardId,
        ids: Vec<NodeId>,
        deadline: Option<Instant>,
    ) -> BatchOutcome {
        let backend = Arc::clone(&self.backends[shard_id as usize]);
        let ids = Arc::new(ids);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call = {
                let backend = Arc::clone(&backend);
                let ids = Arc::clone(&ids);
                tokio::task::spawn_blocking(move || backend.read_batch(&ids))
            };
            let retries = u64::from(attempt - 1);

            let failure = match call.await {
                Ok(Ok(read)) => {
                    return BatchOutcome::Served {
                        found: read.found,
                        missing: read.missing,
                        retries,
                    }
                }
                Ok(Err(AncestryError::ShardUnavailable { .. })) => "unavailable".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(join_err) => {
                    tracing::error!(shard_id, error = %join_err, "shard read task failed");
                    format!("task failed: {}", join_err)
                }
            };

            let delay = self.retry.delay_for(attempt);
            let out_of_time = deadline.is_some_and(|d| Instant::now() + delay >= d);
            if attempt >= self.retry.max_attempts || out_of_time {
                tracing::warn!(
                    shard_id,
                    attempts = attempt,
                    ids = ids.len(),
                    reason = %failure,
                    "giving up on shard batch"
                );
                let ids = Arc::try_unwrap(ids).unwrap_or_else(|shared| (*shared).clone());
                return BatchOutcome::Unavailable { shard: shard_id, ids, retries };
            }

            tracing::debug!(shard_id, attempt, delay_ms = delay.as_millis() as u64, "retrying shard batch");
            tokio::time::sleep(delay).await;
        }
    }
}
