//! Asynchronous index maintenance.
//!
//! Appended nodes are handed to a dedicated worker thread over a channel.
//! The worker parks each node until all of its parents are indexed, then
//! publishes ready nodes in waves: every node of a wave has its parents
//! already in the catalog, so the whole wave is built in parallel and
//! published under one write lock. Publishing a wave releases its parked
//! dependents into the next wave.
//!
//! Parent links that loop back on themselves can only come from corrupt
//! or hostile input. Such nodes never become ready; the worker finds the
//! loop, quarantines it together with everything parked behind it, and
//! later appends on top of a quarantined node are refused.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{self as channel, Receiver, Sender};
use rayon::prelude::*;

use crate::error::{AncestryError, Result};
use crate::index::generation::next_generation;
use crate::index::{AncestryFilter, BloomParams, IndexCatalog, IndexEntry};
use crate::metrics::Metrics;
use crate::types::{Node, NodeId};

/// Max messages drained from the channel before building a wave.
const MAX_DRAIN: usize = 4096;

enum IngestMsg {
    Node(Arc<Node>),
    Barrier(Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct IngestShared {
    quarantined: RwLock<HashSet<NodeId>>,
    pending: AtomicUsize,
}

impl IngestShared {
    fn quarantined(&self) -> RwLockReadGuard<'_, HashSet<NodeId>> {
        self.quarantined.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn quarantined_mut(&self) -> RwLockWriteGuard<'_, HashSet<NodeId>> {
        self.quarantined.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Pipeline handle ─────────────────────────────────────────────────

/// Handle to the ingest worker. Dropping it stops the worker.
pub struct IngestPipeline {
    tx: Sender<IngestMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<IngestShared>,
}

impl IngestPipeline {
    /// Spawn the worker. `threads` sizes the pool that builds waves.
    pub fn start(catalog: Arc<IndexCatalog>, metrics: Arc<Metrics>, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("mergebase-index-{i}"))
            .build()
            .map_err(|e| AncestryError::Config(format!("rayon pool: {e}")))?;

        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(IngestShared::default());
        let mut builder = IndexBuilder {
            catalog,
            metrics,
            shared: Arc::clone(&shared),
            pool,
            pending: HashMap::new(),
            waiters: HashMap::new(),
        };
        let worker = std::thread::Builder::new()
            .name("mergebase-ingest".into())
            .spawn(move || builder.run(rx))?;

        Ok(Self { tx, worker: Mutex::new(Some(worker)), shared })
    }

    /// Queue a stored node for indexing.
    pub fn submit(&self, node: Arc<Node>) -> Result<()> {
        self.tx
            .send(IngestMsg::Node(node))
            .map_err(|_| AncestryError::IngestStopped)
    }

    /// Block until every node submitted before this call has been
    /// processed (indexed, parked on a missing parent, or quarantined).
    pub fn settle(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(IngestMsg::Barrier(ack_tx))
            .map_err(|_| AncestryError::IngestStopped)?;
        ack_rx.recv().map_err(|_| AncestryError::IngestStopped)
    }

    pub fn is_quarantined(&self, id: NodeId) -> bool {
        self.shared.quarantined().contains(&id)
    }

    /// Refuse a new node whose parents include a quarantined node.
    pub fn check_parents(&self, id: NodeId, parents: &[NodeId]) -> Result<()> {
        let quarantined = self.shared.quarantined();
        if parents.iter().any(|p| quarantined.contains(p)) {
            return Err(AncestryError::CorruptSubgraph(id));
        }
        Ok(())
    }

    /// Nodes parked on a parent that is not indexed yet.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    pub fn quarantined_count(&self) -> usize {
        self.shared.quarantined().len()
    }

    /// Stop the worker and wait for it. Nodes queued after this point are
    /// rejected with `IngestStopped`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(IngestMsg::Shutdown);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("ingest worker panicked");
            }
        }
    }
}

impl Drop for IngestPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Worker ──────────────────────────────────────────────────────────

struct PendingNode {
    node: Arc<Node>,
    /// Distinct parents not indexed yet.
    missing: usize,
}

struct IndexBuilder {
    catalog: Arc<IndexCatalog>,
    metrics: Arc<Metrics>,
    shared: Arc<IngestShared>,
    pool: rayon::ThreadPool,
    pending: HashMap<NodeId, PendingNode>,
    /// Missing parent -> parked nodes waiting on it.
    waiters: HashMap<NodeId, Vec<NodeId>>,
}

impl IndexBuilder {
    fn run(&mut self, rx: Receiver<IngestMsg>) {
        while let Ok(first) = rx.recv() {
            let mut batch = Vec::new();
            let mut acks = Vec::new();
            let mut stop = false;

            let mut next = Some(first);
            while let Some(msg) = next.take() {
                match msg {
                    IngestMsg::Node(node) => batch.push(node),
                    IngestMsg::Barrier(ack) => acks.push(ack),
                    IngestMsg::Shutdown => {
                        stop = true;
                        break;
                    }
                }
                if batch.len() >= MAX_DRAIN {
                    break;
                }
                next = rx.try_recv().ok();
            }

            if !batch.is_empty() {
                self.accept(batch);
            }
            for ack in acks {
                let _ = ack.send(());
            }
            if stop {
                break;
            }
        }
        tracing::debug!(pending = self.pending.len(), "ingest worker stopped");
    }

    fn accept(&mut self, batch: Vec<Arc<Node>>) {
        let mut ready = Vec::new();
        let mut ready_ids = HashSet::new();
        let mut rejected = Vec::new();
        let mut parked = Vec::new();

        for node in batch {
            let id = node.id;
            if self.catalog.contains(id)
                || self.pending.contains_key(&id)
                || ready_ids.contains(&id)
                || self.shared.quarantined().contains(&id)
            {
                continue;
            }
            if node.parents.contains(&id) {
                tracing::error!(node = %id, "node lists itself as a parent; quarantining");
                rejected.push(id);
                continue;
            }
            if self.has_quarantined_parent(&node) {
                tracing::warn!(node = %id, "node descends from a quarantined subgraph");
                rejected.push(id);
                continue;
            }

            let mut missing: Vec<NodeId> = node
                .parents
                .iter()
                .copied()
                .filter(|p| !self.catalog.contains(*p))
                .collect();
            missing.sort_unstable();
            missing.dedup();

            if missing.is_empty() {
                ready_ids.insert(id);
                ready.push(node);
            } else {
                for parent in &missing {
                    self.waiters.entry(*parent).or_default().push(id);
                }
                self.pending.insert(id, PendingNode { node, missing: missing.len() });
                parked.push(id);
            }
        }

        self.quarantine(rejected);
        self.run_waves(ready);
        if !parked.is_empty() && !self.pending.is_empty() {
            for cycle in find_cycles(&self.pending, &parked) {
                tracing::error!(
                    node = %cycle[0],
                    len = cycle.len(),
                    "cycle in parent links; quarantining subgraph"
                );
                self.quarantine(cycle);
            }
        }
        self.shared.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    fn has_quarantined_parent(&self, node: &Node) -> bool {
        let quarantined = self.shared.quarantined();
        !quarantined.is_empty() && node.parents.iter().any(|p| quarantined.contains(p))
    }

    /// Build and publish ready nodes wave by wave until nothing new
    /// becomes ready.
    fn run_waves(&mut self, mut wave: Vec<Arc<Node>>) {
        let params = self.catalog.params();
        while !wave.is_empty() {
            let started = Instant::now();
            let catalog = &self.catalog;
            let built: Vec<(NodeId, Option<IndexEntry>)> = self.pool.install(|| {
                wave.par_iter()
                    .map(|node| (node.id, build_entry(catalog, node, params)))
                    .collect()
            });

            let mut entries = Vec::with_capacity(built.len());
            for (id, entry) in built {
                match entry {
                    Some(entry) => entries.push((id, entry)),
                    None => tracing::error!(node = %id, "parent index missing for ready node"),
                }
            }
            let published: Vec<NodeId> = entries.iter().map(|(id, _)| *id).collect();
            let added = self.catalog.publish_wave(entries);
            self.metrics
                .record_index_wave(started.elapsed().as_millis() as u64, added as u64);

            let mut next = Vec::new();
            for id in published {
                let Some(dependents) = self.waiters.remove(&id) else {
                    continue;
                };
                for dependent in dependents {
                    let now_ready = match self.pending.get_mut(&dependent) {
                        Some(parked) => {
                            parked.missing = parked.missing.saturating_sub(1);
                            parked.missing == 0
                        }
                        None => false,
                    };
                    if now_ready {
                        if let Some(parked) = self.pending.remove(&dependent) {
                            next.push(parked.node);
                        }
                    }
                }
            }
            wave = next;
        }
    }

    /// Quarantine `roots` and every parked node that waits on them.
    fn quarantine(&mut self, roots: Vec<NodeId>) {
        if roots.is_empty() {
            return;
        }
        let mut count = 0u64;
        let mut stack = roots;
        let mut quarantined = self.shared.quarantined_mut();
        while let Some(id) = stack.pop() {
            if !quarantined.insert(id) {
                continue;
            }
            count += 1;
            self.pending.remove(&id);
            if let Some(dependents) = self.waiters.remove(&id) {
                stack.extend(dependents);
            }
        }
        drop(quarantined);
        self.metrics.record_quarantined(count);
    }
}

/// Index entry for a node whose parents are all indexed.
fn build_entry(catalog: &IndexCatalog, node: &Node, params: BloomParams) -> Option<IndexEntry> {
    let parents = catalog.get_many(&node.parents);
    if parents.len() < node.parents.len() {
        return None;
    }
    let generation = next_generation(parents.iter().map(|(_, e)| e.generation));
    let filter = AncestryFilter::for_node(node.id, parents.iter().map(|(_, e)| &e.filter), params);
    Some(IndexEntry { generation, filter })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Open,
    Done,
}

/// Find loops among parked nodes reachable from `from`, following parent
/// links that stay inside the parked set. A loop closed by a batch runs
/// through a node that batch parked, so only those need to be walked.
/// Iterative DFS; each loop is reported once as the list of nodes on it.
fn find_cycles(pending: &HashMap<NodeId, PendingNode>, from: &[NodeId]) -> Vec<Vec<NodeId>> {
    let mut starts: Vec<NodeId> = from.to_vec();
    starts.sort_unstable();

    let mut marks: HashMap<NodeId, Mark> = HashMap::with_capacity(pending.len());
    let mut cycles = Vec::new();

    for start in starts {
        if marks.contains_key(&start) {
            continue;
        }
        marks.insert(start, Mark::Open);
        let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];

        while let Some(top) = stack.last_mut() {
            let id = top.0;
            let parents = match pending.get(&id) {
                Some(parked) => &parked.node.parents,
                None => {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                }
            };
            if top.1 >= parents.len() {
                marks.insert(id, Mark::Done);
                stack.pop();
                continue;
            }
            let parent = parents[top.1];
            top.1 += 1;
            if !pending.contains_key(&parent) {
                continue;
            }
            match marks.get(&parent) {
                None => {
                    marks.insert(parent, Mark::Open);
                    stack.push((parent, 0));
                }
                Some(Mark::Open) => {
                    if let Some(pos) = stack.iter().position(|(n, _)| *n == parent) {
                        cycles.push(stack[pos..].iter().map(|(n, _)| *n).collect());
                    }
                }
                Some(Mark::Done) => {}
            }
        }
    }
    cycles
}
