//! Engine configuration.
//!
//! Persisted as `engine_config.json` at the database root when the engine
//! is created on disk, and read back on every open so shard routing and
//! filter shape stay stable across restarts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AncestryError, Result};
use crate::index::BloomParams;
use crate::resource::{ResourceManager, TuningProfile};

pub const CONFIG_FILE_NAME: &str = "engine_config.json";

// ── Retry Policy ───────────────────────────────────────────────────

/// Exponential backoff for transient shard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per shard call, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// No retries; one attempt per shard call.
    pub fn none() -> Self {
        Self { max_attempts: 1, base_delay_ms: 0, max_delay_ms: 0 }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 5, max_delay_ms: 100 }
    }
}

// ── Engine Config ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of node shards. Fixed at creation time.
    pub shard_count: u16,
    /// Shape of every ancestry filter. Fixed at creation time.
    pub bloom: BloomParams,
    /// Budget applied when a query passes no deadline.
    pub default_deadline_ms: u64,
    /// Max ids per shard read.
    pub batch_size: usize,
    /// Router node cache capacity; 0 disables caching.
    pub cache_capacity: usize,
    /// Generation gap tolerated before the search forces the higher
    /// frontier to expand.
    pub alignment_slack: u64,
    /// Visited-node budget per exact search.
    pub max_visited: usize,
    pub retry: RetryPolicy,
    /// Threads used to build index waves.
    pub ingest_threads: usize,
    /// fsync the node log after every append.
    pub sync_on_append: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_profile(&TuningProfile::default())
    }
}

impl EngineConfig {
    /// Config derived from a tuning profile; non-tunable fields take their
    /// defaults.
    pub fn from_profile(profile: &TuningProfile) -> Self {
        Self {
            shard_count: profile.shard_count.max(1),
            bloom: BloomParams::default(),
            default_deadline_ms: 1_000,
            batch_size: profile.batch_size.max(1),
            cache_capacity: profile.cache_capacity,
            alignment_slack: 2,
            max_visited: 1_000_000,
            retry: RetryPolicy::default(),
            ingest_threads: profile.ingest_threads.max(1),
            sync_on_append: false,
        }
    }

    /// Config tuned to the current host.
    pub fn auto_tuned() -> Self {
        Self::from_profile(&ResourceManager::auto_tune())
    }

    pub fn with_shard_count(mut self, shard_count: u16) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(AncestryError::Config("shard_count must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(AncestryError::Config("batch_size must be > 0".into()));
        }
        if self.max_visited == 0 {
            return Err(AncestryError::Config("max_visited must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AncestryError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.ingest_threads == 0 {
            return Err(AncestryError::Config("ingest_threads must be > 0".into()));
        }
        self.bloom.validate()
    }

    /// Read config from database root. Returns None if file doesn't exist.
    pub fn read_from(db_path: &Path) -> Result<Option<Self>> {
        let path = db_path.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write config to database root.
    pub fn write_to(&self, db_path: &Path) -> Result<()> {
        let path = db_path.join(CONFIG_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}
