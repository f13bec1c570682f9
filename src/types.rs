//! Core graph types: node identifiers and immutable node records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shard identifier (index into the shard table).
pub type ShardId = u16;

/// 128-bit content hash identifying a node.
///
/// Derived from BLAKE3 over the node's parents and payload, so ids are
/// uniformly distributed and can be used directly as bloom probe seeds
/// and shard routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u128);

impl NodeId {
    /// Low 64 bits.
    #[inline]
    pub fn low64(self) -> u64 {
        self.0 as u64
    }

    /// High 64 bits.
    #[inline]
    pub fn high64(self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(NodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for NodeId {
    fn from(v: u128) -> Self {
        NodeId(v)
    }
}

/// Compute the content address of a node.
///
/// Hash input: `[parent_count: u32 LE] [parent ids: u128 LE ...] [payload]`.
/// Parent order is significant (first parent is the mainline).
pub fn compute_node_id(parents: &[NodeId], payload: &[u8]) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(parents.len() as u32).to_le_bytes());
    for parent in parents {
        hasher.update(&parent.0.to_le_bytes());
    }
    hasher.update(payload);
    let hash = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[0..16]);
    NodeId(u128::from_le_bytes(bytes))
}

/// Immutable graph node.
///
/// `created_at` is the store-wide append sequence number. The node's
/// generation number lives in the index catalog and becomes visible
/// together with its ancestry filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parents: Vec<NodeId>,
    pub created_at: u64,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}
