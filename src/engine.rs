//! `AncestryEngine`: the public face of the crate.
//!
//! Ties the node store, the ingest pipeline and the indices together and
//! answers ancestry queries through the strategy cascade. Writes are
//! synchronous; index visibility is eventual (see `wait_indexed` and
//! `settle`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::coordinator::{
    Ancestry, CoordinatorSettings, MergeBase, Query, Resolution, StrategyCoordinator, Verdict,
};
use crate::error::{AncestryError, Result};
use crate::index::{GenerationIndex, IndexCatalog, SummaryIndex};
use crate::ingest::IngestPipeline;
use crate::metrics::{ops, Metrics};
use crate::router::ShardRouter;
use crate::storage::{Inserted, NodeStore, ShardStats};
use crate::types::{compute_node_id, Node, NodeId, ShardId};

pub struct AncestryEngine {
    config: EngineConfig,
    store: Arc<NodeStore>,
    catalog: Arc<IndexCatalog>,
    generations: GenerationIndex,
    summaries: SummaryIndex,
    router: ShardRouter,
    ingest: IngestPipeline,
    metrics: Arc<Metrics>,
}

impl AncestryEngine {
    // ── Lifecycle ───────────────────────────────────────────────────

    /// In-memory engine. Nothing touches disk.
    pub fn ephemeral(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = NodeStore::ephemeral(&config);
        Self::assemble(config, store)
    }

    /// Create a new engine at `db_path`. Writes `engine_config.json`.
    pub fn create(db_path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = NodeStore::create(db_path, &config)?;
        Self::assemble(config, store)
    }

    /// Open an existing engine, replaying every shard log and rebuilding
    /// the indices before returning.
    pub fn open(db_path: &Path) -> Result<Self> {
        let config = EngineConfig::read_from(db_path)?.ok_or_else(|| {
            AncestryError::InvalidFormat(format!("no engine config in {}", db_path.display()))
        })?;
        let (store, replayed) = NodeStore::open(db_path, &config)?;
        let engine = Self::assemble(config, store)?;

        let count = replayed.len();
        for node in replayed {
            engine.ingest.submit(Arc::new(node))?;
        }
        engine.ingest.settle()?;
        tracing::info!(
            path = %db_path.display(),
            nodes = count,
            indexed = engine.catalog.len(),
            pending = engine.ingest.pending(),
            "engine opened"
        );
        Ok(engine)
    }

    /// Open `db_path` if it holds an engine, otherwise create one there.
    pub fn open_or_create(db_path: &Path, config: EngineConfig) -> Result<Self> {
        if EngineConfig::read_from(db_path)?.is_some() {
            Self::open(db_path)
        } else {
            Self::create(db_path, config)
        }
    }

    fn assemble(config: EngineConfig, store: NodeStore) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let catalog = Arc::new(IndexCatalog::new(config.bloom));
        let router = ShardRouter::new(
            store.planner(),
            store.backends(),
            config.batch_size,
            config.cache_capacity,
            config.retry,
            Arc::clone(&metrics),
        )?;
        let ingest = IngestPipeline::start(Arc::clone(&catalog), Arc::clone(&metrics), config.ingest_threads)?;

        Ok(Self {
            generations: GenerationIndex::new(Arc::clone(&catalog)),
            summaries: SummaryIndex::new(Arc::clone(&catalog)),
            store: Arc::new(store),
            catalog,
            router,
            ingest,
            metrics,
            config,
        })
    }

    /// Flush logs and stop the ingest worker.
    pub fn shutdown(&self) -> Result<()> {
        self.store.sync()?;
        self.ingest.shutdown();
        Ok(())
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Append a node. Idempotent: the same `(parents, payload)` always
    /// yields the same id and is stored once.
    ///
    /// Parents need not exist yet; the node is indexed once they do.
    pub fn append(&self, parents: &[NodeId], payload: &[u8]) -> Result<NodeId> {
        let start = Instant::now();
        let id = compute_node_id(parents, payload);
        self.ingest.check_parents(id, parents)?;

        let inserted = self.store.append(parents, payload)?;
        self.after_insert(&inserted)?;

        self.metrics.record_query(ops::APPEND, start.elapsed().as_millis() as u64);
        Ok(id)
    }

    /// Insert a node whose id was computed elsewhere (replication).
    pub fn ingest_node(&self, id: NodeId, parents: Vec<NodeId>) -> Result<NodeId> {
        let start = Instant::now();
        self.ingest.check_parents(id, &parents)?;

        let inserted = self.store.insert_existing(id, parents)?;
        self.after_insert(&inserted)?;

        self.metrics.record_query(ops::APPEND, start.elapsed().as_millis() as u64);
        Ok(id)
    }

    fn after_insert(&self, inserted: &Inserted) -> Result<()> {
        if inserted.created {
            self.ingest.submit(Arc::clone(&inserted.node))?;
        }
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: NodeId) -> Result<Arc<Node>> {
        self.store.get(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.store.contains(id)
    }

    /// Fetch many nodes at once. Unknown ids are left out of the map.
    pub fn batch_get(&self, ids: &[NodeId]) -> HashMap<NodeId, Arc<Node>> {
        let start = Instant::now();
        let found = self.store.batch_get(ids);
        self.metrics.record_query(ops::BATCH_GET, start.elapsed().as_millis() as u64);
        found
    }

    pub fn generation(&self, id: NodeId) -> Result<u64> {
        self.generations.generation(id)
    }

    pub fn might_be_ancestor(&self, candidate: NodeId, descendant: NodeId) -> Result<bool> {
        self.summaries.might_be_ancestor(candidate, descendant)
    }

    pub fn filters_might_overlap(&self, a: NodeId, b: NodeId) -> Result<bool> {
        self.summaries.filters_might_overlap(a, b)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Lowest common ancestor of `a` and `b`, within `deadline` (or the
    /// configured default).
    pub async fn find_common_ancestor(
        &self,
        a: NodeId,
        b: NodeId,
        deadline: Option<Duration>,
    ) -> Result<MergeBase> {
        let start = Instant::now();
        self.check_endpoint(a)?;
        self.check_endpoint(b)?;

        let query = Query::merge_base(a, b, deadline.unwrap_or_else(|| self.config.default_deadline()));
        let resolution = self.resolve(&query).await;
        let answer = match resolution.verdict {
            Verdict::Positive(id) => MergeBase::Found(id),
            Verdict::Negative => MergeBase::NoCommonAncestor,
            Verdict::Inconclusive(inc) => MergeBase::Inconclusive(inc),
        };

        self.metrics
            .record_query(ops::FIND_COMMON_ANCESTOR, start.elapsed().as_millis() as u64);
        Ok(answer)
    }

    /// Is `candidate` an ancestor of `descendant`? A node counts as its
    /// own ancestor.
    pub async fn is_ancestor(
        &self,
        candidate: NodeId,
        descendant: NodeId,
        deadline: Option<Duration>,
    ) -> Result<Ancestry> {
        let start = Instant::now();
        self.check_endpoint(candidate)?;
        self.check_endpoint(descendant)?;

        let query = Query::ancestry(
            candidate,
            descendant,
            deadline.unwrap_or_else(|| self.config.default_deadline()),
        );
        let resolution = self.resolve(&query).await;
        let answer = match resolution.verdict {
            Verdict::Positive(_) => Ancestry::Ancestor,
            Verdict::Negative => Ancestry::NotAncestor,
            Verdict::Inconclusive(inc) => Ancestry::Inconclusive(inc),
        };

        self.metrics
            .record_query(ops::IS_ANCESTOR, start.elapsed().as_millis() as u64);
        Ok(answer)
    }

    async fn resolve(&self, query: &Query) -> Resolution {
        let settings = CoordinatorSettings {
            max_visited: self.config.max_visited,
            alignment_slack: self.config.alignment_slack,
        };
        let coordinator =
            StrategyCoordinator::new(&self.router, &self.generations, &self.summaries, &self.metrics, settings);
        let resolution = coordinator.resolve(query).await;
        tracing::debug!(
            kind = ?query.kind,
            left = %query.left,
            right = %query.right,
            stage = ?resolution.stage,
            rounds = resolution.search.rounds,
            visited = resolution.search.visited,
            "query resolved"
        );
        resolution
    }

    fn check_endpoint(&self, id: NodeId) -> Result<()> {
        if !self.store.contains(id) {
            return Err(AncestryError::NodeNotFound(id));
        }
        if self.ingest.is_quarantined(id) {
            return Err(AncestryError::CorruptSubgraph(id));
        }
        Ok(())
    }

    // ── Index visibility ────────────────────────────────────────────

    /// Wait until `id` is indexed. Returns false on timeout.
    pub async fn wait_indexed(&self, id: NodeId, timeout: Duration) -> bool {
        self.catalog.wait_for(id, timeout).await
    }

    /// Block until every node appended so far has gone through ingest.
    pub fn settle(&self) -> Result<()> {
        self.ingest.settle()
    }

    pub fn is_indexed(&self, id: NodeId) -> bool {
        self.catalog.contains(id)
    }

    pub fn is_quarantined(&self, id: NodeId) -> bool {
        self.ingest.is_quarantined(id)
    }

    pub fn quarantined_count(&self) -> usize {
        self.ingest.quarantined_count()
    }

    /// Nodes waiting on a parent that is not indexed (or not stored) yet.
    pub fn pending_index_count(&self) -> usize {
        self.ingest.pending()
    }

    // ── Introspection and fault injection ───────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn node_count(&self) -> usize {
        self.store.node_count()
    }

    pub fn indexed_count(&self) -> usize {
        self.catalog.len()
    }

    pub fn shard_of(&self, id: NodeId) -> ShardId {
        self.router.locate(id)
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.store.shard_stats()
    }

    /// Mark a shard up or down for reads.
    pub fn set_shard_available(&self, shard: ShardId, available: bool) -> Result<()> {
        self.shard(shard)?.set_available(available);
        Ok(())
    }

    /// Add artificial latency to every read on a shard.
    pub fn set_shard_latency(&self, shard: ShardId, latency: Duration) -> Result<()> {
        self.shard(shard)?.set_read_latency(latency);
        Ok(())
    }

    fn shard(&self, shard: ShardId) -> Result<&Arc<crate::storage::NodeShard>> {
        self.store
            .shard(shard)
            .ok_or_else(|| AncestryError::Config(format!("no shard {shard}")))
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}
