//! System resource detection and adaptive tuning.
//!
//! Detects available RAM and CPU cores, then computes tuning parameters
//! (shard count, fetch batch size, node cache size, ingest parallelism)
//! that fit the engine to the host machine. Stateless: each call to
//! `ResourceManager::auto_tune()` re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const GB: u64 = 1024 * 1024 * 1024;

/// Estimated resident bytes per cached node (id, parent vec, Arc, map slot).
const BYTES_PER_CACHED_NODE: usize = 160;

/// Node cache floor.
const CACHE_MIN_NODES: usize = 10_000;

/// Node cache ceiling.
const CACHE_MAX_NODES: usize = 1_000_000;

/// Fraction of available memory given to the router's node cache.
const CACHE_FRACTION: f64 = 0.01;

/// Memory pressure at which the node cache is halved.
const HIGH_PRESSURE: f64 = 0.8;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    ///
    /// Formula: `1.0 - (available / total)`.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Adaptive parameters computed from system resources.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    /// Number of node shards.
    pub shard_count: u16,
    /// Max ids per shard read issued by the router.
    pub batch_size: usize,
    /// Router node cache capacity (nodes).
    pub cache_capacity: usize,
    /// Worker threads for building index waves.
    pub ingest_threads: usize,
    /// Memory pressure at detection time (0.0 = no pressure, 1.0 = critical).
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// Compute a tuning profile from detected resources.
    ///
    /// Heuristics:
    /// - `shard_count`: `min(16, next_power_of_two(cpu_count))` if RAM >= 2 GB, else 1.
    /// - `batch_size`: RAM < 4 GB -> 128, < 16 GB -> 512, else 1024.
    /// - `cache_capacity`: `clamp(available * 0.01 / 160, 10k, 1M)` nodes,
    ///   halved before clamping when memory pressure is at least 0.8.
    /// - `ingest_threads`: RAM < 4 GB -> 1, else `clamp(cpu / 2, 1, 8)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;

        let shard_count = if res.total_memory_bytes >= 2 * GB {
            let raw = res.cpu_count.next_power_of_two();
            raw.min(16) as u16
        } else {
            1
        };

        let batch_size = if total_gb < 4.0 {
            128
        } else if total_gb < 16.0 {
            512
        } else {
            1024
        };

        let memory_pressure = res.memory_pressure();
        let cache_bytes = (res.available_memory_bytes as f64 * CACHE_FRACTION) as usize;
        let mut cache_nodes = cache_bytes / BYTES_PER_CACHED_NODE;
        if memory_pressure >= HIGH_PRESSURE {
            cache_nodes /= 2;
        }
        let cache_capacity = cache_nodes.clamp(CACHE_MIN_NODES, CACHE_MAX_NODES);

        let ingest_threads = if total_gb < 4.0 {
            1
        } else {
            (res.cpu_count / 2).clamp(1, 8)
        };

        Self {
            shard_count,
            batch_size,
            cache_capacity,
            ingest_threads,
            memory_pressure,
        }
    }
}

impl Default for TuningProfile {
    /// Conservative defaults suitable for tests and unknown environments.
    fn default() -> Self {
        Self {
            shard_count: 4,
            batch_size: 256,
            cache_capacity: 50_000,
            ingest_threads: 2,
            memory_pressure: 0.0,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

/// Stateless utility: detect system resources and compute tuning profile.
pub struct ResourceManager;

impl ResourceManager {
    /// Probe the system and return an adaptive tuning profile.
    pub fn auto_tune() -> TuningProfile {
        let resources = SystemResources::detect();
        let profile = TuningProfile::from_resources(&resources);
        tracing::debug!(
            cpus = resources.cpu_count,
            total_mb = resources.total_memory_bytes / (1024 * 1024),
            shard_count = profile.shard_count,
            batch_size = profile.batch_size,
            cache_capacity = profile.cache_capacity,
            memory_pressure = profile.memory_pressure,
            "auto-tuned engine profile"
        );
        profile
    }
}

// ── Tests ───────────────────────────────────────────────────────────
