//! Generation numbers: roots are 0, every other node is one more than
//! its highest parent. Along any parent edge the generation strictly
//! decreases, which gives the search a cheap reachability bound.

use std::sync::Arc;

use crate::error::{AncestryError, Result};
use crate::index::IndexCatalog;
use crate::types::NodeId;

/// Generation of a node from its parents' generations.
pub fn next_generation<I: IntoIterator<Item = u64>>(parent_generations: I) -> u64 {
    parent_generations
        .into_iter()
        .max()
        .map_or(0, |g| g + 1)
}

/// Can a node at generation `candidate` be a strict ancestor of a node at
/// generation `descendant`?
#[inline]
pub fn may_precede(candidate: u64, descendant: u64) -> bool {
    candidate < descendant
}

/// Read view over the catalog's generation numbers.
#[derive(Clone)]
pub struct GenerationIndex {
    catalog: Arc<IndexCatalog>,
}

impl GenerationIndex {
    pub fn new(catalog: Arc<IndexCatalog>) -> Self {
        Self { catalog }
    }

    /// Generation of `id`; `IndexInconsistent` until the node is indexed.
    pub fn generation(&self, id: NodeId) -> Result<u64> {
        self.catalog
            .generation(id)
            .ok_or(AncestryError::IndexInconsistent(id))
    }

    pub fn try_generation(&self, id: NodeId) -> Option<u64> {
        self.catalog.generation(id)
    }

    /// Highest known generation among `ids`. `None` if any id is not
    /// indexed yet, since the bound would not be sound.
    pub fn max_generation(&self, ids: &[NodeId]) -> Option<u64> {
        let entries = self.catalog.get_many(ids);
        if entries.len() < ids.len() {
            return None;
        }
        entries.iter().map(|(_, e)| e.generation).max()
    }
}
