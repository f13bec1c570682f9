//! Mergebase - ancestry queries over sharded, content-addressed commit graphs.
//!
//! Nodes are immutable and identified by the BLAKE3 hash of their parents
//! and payload. The engine answers "what is the merge base of A and B?"
//! and "is A an ancestor of B?" within a latency budget, using
//! generation numbers and ancestry bloom filters to avoid walking history
//! where possible.
//!
//! ```no_run
//! # async fn demo() -> mergebase::Result<()> {
//! use mergebase::{AncestryEngine, EngineConfig, MergeBase};
//!
//! let engine = AncestryEngine::ephemeral(EngineConfig::default())?;
//! let root = engine.append(&[], b"root")?;
//! let left = engine.append(&[root], b"left")?;
//! let right = engine.append(&[root], b"right")?;
//! engine.settle()?;
//!
//! let base = engine.find_common_ancestor(left, right, None).await?;
//! assert_eq!(base, MergeBase::Found(root));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod resource;
pub mod router;
pub mod search;
pub mod storage;
pub mod types;

pub use config::{EngineConfig, RetryPolicy};
pub use coordinator::{Ancestry, Inconclusive, MergeBase, Stage};
pub use engine::AncestryEngine;
pub use error::{AncestryError, Result};
pub use index::BloomParams;
pub use metrics::{Metrics, MetricsSnapshot};
pub use search::InconclusiveReason;
pub use storage::ShardStats;
pub use types::{compute_node_id, Node, NodeId, ShardId};
