//! Performance metrics for the ancestry engine
//!
//! Lightweight, thread-safe counters shared by every query and by the
//! ingest worker. Metrics are collected per engine instance.
//!
//! # Overview
//!
//! Tracks:
//! - Query latencies with percentile calculations (p50, p95, p99)
//! - Slow query detection
//! - Per-operation statistics (merge-base, is-ancestor, append, ...)
//! - Cascade counters: cache hits, bloom fast-rejects, generation
//!   rejects, batches issued, shard retries, timeouts
//! - Ingest counters: nodes indexed, index waves, quarantined nodes
//!
//! # Design Decisions
//!
//! - **Thread-safe**: counters are `AtomicU64`, lock-free increments
//! - **Bounded memory**: fixed-size latency window and slow query ring
//! - **O(1) per-operation**: recording a query is O(1) amortized
//!
//! # Example
//!
//! ```no_run
//! use mergebase::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_query("FindCommonAncestor", 15);
//!
//! let stats = metrics.snapshot();
//! println!("p50: {}ms", stats.query_p50_ms);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Maximum number of query latencies retained for percentile calculation.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Maximum number of slow queries retained for reporting.
const MAX_SLOW_QUERIES: usize = 10;

/// Slow query threshold in milliseconds.
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

/// Operation names accepted by [`Metrics::record_query`].
pub mod ops {
    pub const FIND_COMMON_ANCESTOR: &str = "FindCommonAncestor";
    pub const IS_ANCESTOR: &str = "IsAncestor";
    pub const APPEND: &str = "Append";
    pub const BATCH_GET: &str = "BatchGet";
}

/// Thread-safe performance metrics collector.
///
/// One instance per engine, shared via `Arc` with the router, the
/// coordinator and the ingest worker.
pub struct Metrics {
    // ========================================================================
    // Query Metrics
    // ========================================================================
    query_count: AtomicU64,
    slow_query_count: AtomicU64,

    /// Rolling window of recent query latencies.
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,

    op_counts: OperationCounters,
    op_latency_sums: OperationCounters,

    // ========================================================================
    // Cascade Counters
    // ========================================================================
    cache_hits: AtomicU64,
    bloom_rejects: AtomicU64,
    generation_rejects: AtomicU64,
    batches_issued: AtomicU64,
    shard_retries: AtomicU64,
    timeouts: AtomicU64,
    inconclusive: AtomicU64,

    // ========================================================================
    // Ingest Metrics
    // ========================================================================
    nodes_indexed: AtomicU64,
    index_waves: AtomicU64,
    index_total_ms: AtomicU64,
    quarantined: AtomicU64,

    slow_queries: Mutex<VecDeque<SlowQuery>>,

    started_at: Instant,
}

/// Per-operation atomic slots (used for both counts and latency sums).
#[derive(Default)]
pub struct OperationCounters {
    pub find_common_ancestor: AtomicU64,
    pub is_ancestor: AtomicU64,
    pub append: AtomicU64,
    pub batch_get: AtomicU64,
    pub other: AtomicU64,
}

impl OperationCounters {
    fn slot(&self, operation: &str) -> &AtomicU64 {
        match operation {
            ops::FIND_COMMON_ANCESTOR => &self.find_common_ancestor,
            ops::IS_ANCESTOR => &self.is_ancestor,
            ops::APPEND => &self.append,
            ops::BATCH_GET => &self.batch_get,
            _ => &self.other,
        }
    }

    fn pairs(&self) -> [(&'static str, &AtomicU64); 5] {
        [
            (ops::FIND_COMMON_ANCESTOR, &self.find_common_ancestor),
            (ops::IS_ANCESTOR, &self.is_ancestor),
            (ops::APPEND, &self.append),
            (ops::BATCH_GET, &self.batch_get),
            ("Other", &self.other),
        ]
    }
}

/// A recorded slow query.
#[derive(Clone, Debug, PartialEq)]
pub struct SlowQuery {
    pub operation: String,
    pub duration_ms: u64,
    /// When the query occurred (ms since metrics started)
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all metrics. Plain values, no atomics.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub query_count: u64,
    pub slow_query_count: u64,
    pub query_p50_ms: u64,
    pub query_p95_ms: u64,
    pub query_p99_ms: u64,
    pub query_avg_ms: u64,

    pub cache_hits: u64,
    pub bloom_rejects: u64,
    pub generation_rejects: u64,
    pub batches_issued: u64,
    pub shard_retries: u64,
    pub timeouts: u64,
    pub inconclusive: u64,

    pub nodes_indexed: u64,
    pub index_waves: u64,
    pub index_avg_wave_ms: u64,
    pub quarantined: u64,

    pub top_slow_queries: Vec<SlowQuery>,
    pub uptime_secs: u64,

    /// Top operations by count
    pub op_stats: Vec<OperationStat>,
}

/// Statistics for a single operation type.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationStat {
    pub operation: String,
    pub count: u64,
    pub avg_ms: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            query_count: AtomicU64::new(0),
            slow_query_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            op_counts: OperationCounters::default(),
            op_latency_sums: OperationCounters::default(),
            cache_hits: AtomicU64::new(0),
            bloom_rejects: AtomicU64::new(0),
            generation_rejects: AtomicU64::new(0),
            batches_issued: AtomicU64::new(0),
            shard_retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            inconclusive: AtomicU64::new(0),
            nodes_indexed: AtomicU64::new(0),
            index_waves: AtomicU64::new(0),
            index_total_ms: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            slow_queries: Mutex::new(VecDeque::with_capacity(MAX_SLOW_QUERIES)),
            started_at: Instant::now(),
        }
    }

    /// Record a completed query.
    ///
    /// Updates the total count, the per-operation counters, the latency
    /// window and (past the threshold) the slow query ring.
    pub fn record_query(&self, operation: &str, duration_ms: u64) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.op_counts.slot(operation).fetch_add(1, Ordering::Relaxed);
        self.op_latency_sums
            .slot(operation)
            .fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut latencies = lock(&self.latencies_ms);
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_QUERY_THRESHOLD_MS {
            self.slow_query_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation, duration_ms, "slow ancestry query");

            let slow_query = SlowQuery {
                operation: operation.to_string(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };

            let mut slow_queries = lock(&self.slow_queries);
            if slow_queries.len() >= MAX_SLOW_QUERIES {
                slow_queries.pop_front();
            }
            slow_queries.push_back(slow_query);
        }
    }

    pub fn record_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bloom_reject(&self) {
        self.bloom_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation_reject(&self) {
        self.generation_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batches(&self, n: u64) {
        self.batches_issued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_shard_retry(&self) {
        self.shard_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inconclusive(&self) {
        self.inconclusive.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one published index wave.
    pub fn record_index_wave(&self, duration_ms: u64, nodes: u64) {
        self.index_waves.fetch_add(1, Ordering::Relaxed);
        self.index_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.nodes_indexed.fetch_add(nodes, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self, n: u64) {
        self.quarantined.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time snapshot.
    ///
    /// O(LATENCY_WINDOW_SIZE) for the percentile sort.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = lock(&self.latencies_ms);
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (p50, p95, p99, avg)
            }
        };

        let index_waves = self.index_waves.load(Ordering::Relaxed);
        let index_avg_wave_ms = if index_waves > 0 {
            self.index_total_ms.load(Ordering::Relaxed) / index_waves
        } else {
            0
        };

        let top_slow_queries = lock(&self.slow_queries).iter().cloned().collect();

        MetricsSnapshot {
            query_count: self.query_count.load(Ordering::Relaxed),
            slow_query_count: self.slow_query_count.load(Ordering::Relaxed),
            query_p50_ms: p50,
            query_p95_ms: p95,
            query_p99_ms: p99,
            query_avg_ms: avg,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            bloom_rejects: self.bloom_rejects.load(Ordering::Relaxed),
            generation_rejects: self.generation_rejects.load(Ordering::Relaxed),
            batches_issued: self.batches_issued.load(Ordering::Relaxed),
            shard_retries: self.shard_retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            inconclusive: self.inconclusive.load(Ordering::Relaxed),
            nodes_indexed: self.nodes_indexed.load(Ordering::Relaxed),
            index_waves,
            index_avg_wave_ms,
            quarantined: self.quarantined.load(Ordering::Relaxed),
            top_slow_queries,
            uptime_secs: self.started_at.elapsed().as_secs(),
            op_stats: self.top_operations(5),
        }
    }

    fn top_operations(&self, n: usize) -> Vec<OperationStat> {
        let sums = self.op_latency_sums.pairs();
        let mut stats: Vec<OperationStat> = self
            .op_counts
            .pairs()
            .iter()
            .zip(sums.iter())
            .map(|((name, count), (_, sum))| {
                (name, count.load(Ordering::Relaxed), sum.load(Ordering::Relaxed))
            })
            .filter(|(_, count, _)| *count > 0)
            .map(|(name, count, sum)| OperationStat {
                operation: name.to_string(),
                count,
                avg_ms: sum / count,
            })
            .collect();

        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats.truncate(n);
        stats
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
