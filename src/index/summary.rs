//! Ancestry summaries: fixed-size bloom filters over ancestor sets.
//!
//! Every indexed node carries a filter containing its own id and the
//! ids of all of its ancestors. A node's filter is the bitwise OR of its
//! parents' filters plus itself, so all filters in one engine share the
//! same [`BloomParams`].
//!
//! Keys are node ids, which are already BLAKE3 hashes. Instead of
//! re-hashing, the 128-bit key is split into two 64-bit halves (h1, h2)
//! and probe positions are derived with enhanced double-hashing.
//!
//! Answers are one-sided: `false` is definitive, `true` means "maybe".

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AncestryError, Result};
use crate::index::{IndexCatalog, IndexEntry};
use crate::types::NodeId;

/// Default filter width in bits (1 KiB per node).
pub const DEFAULT_FILTER_BITS: usize = 8192;

/// Default number of probes per key.
pub const DEFAULT_FILTER_HASHES: usize = 6;

/// Upper bound on probes; more only burns CPU once filters saturate.
const MAX_FILTER_HASHES: usize = 16;

// ── BloomParams ─────────────────────────────────────────────────────

/// Shape shared by every filter in an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomParams {
    pub num_bits: usize,
    pub num_hashes: usize,
}

impl BloomParams {
    /// Build params, rounding the bit count up to a multiple of 64
    /// (minimum 64) and clamping the probe count to `1..=16`.
    pub fn new(num_bits: usize, num_hashes: usize) -> Self {
        let min_bits = num_bits.max(64);
        Self {
            num_bits: (min_bits + 63) & !63,
            num_hashes: num_hashes.clamp(1, MAX_FILTER_HASHES),
        }
    }

    /// Size filters for ancestor sets of about `expected_ancestors` ids at
    /// the given false-positive rate.
    ///
    /// Standard sizing: `m = -n ln p / (ln 2)^2`, `k = (m / n) ln 2`.
    pub fn for_capacity(expected_ancestors: usize, target_fpr: f64) -> Self {
        let n = expected_ancestors.max(1) as f64;
        let p = target_fpr.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil();
        let k = ((m / n) * ln2).round();
        Self::new(m as usize, k as usize)
    }

    /// Theoretical false-positive rate once `inserted` ids are in a filter.
    pub fn expected_fpr(&self, inserted: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * inserted as f64 / m).exp()).powf(k)
    }

    pub fn word_count(&self) -> usize {
        self.num_bits / 64
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_bits == 0 || self.num_bits % 64 != 0 {
            return Err(AncestryError::Config(format!(
                "bloom num_bits must be a positive multiple of 64, got {}",
                self.num_bits
            )));
        }
        if self.num_hashes == 0 || self.num_hashes > MAX_FILTER_HASHES {
            return Err(AncestryError::Config(format!(
                "bloom num_hashes must be in 1..={}, got {}",
                MAX_FILTER_HASHES, self.num_hashes
            )));
        }
        Ok(())
    }
}

impl Default for BloomParams {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_BITS, DEFAULT_FILTER_HASHES)
    }
}

// ── AncestryFilter ──────────────────────────────────────────────────

/// Compute probe positions using key-split enhanced double-hashing.
///
/// h2 is forced odd so it is coprime with power-of-two bit counts.
fn probe_positions(key: NodeId, num_hashes: usize, num_bits: usize) -> impl Iterator<Item = usize> {
    let h1 = key.low64();
    let h2 = key.high64() | 1;
    (0..num_hashes as u64)
        .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % (num_bits as u64)) as usize)
}

/// Bloom filter over a node's ancestor set (the node itself included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestryFilter {
    bits: Box<[u64]>,
    num_hashes: usize,
}

impl AncestryFilter {
    pub fn empty(params: BloomParams) -> Self {
        Self {
            bits: vec![0u64; params.word_count()].into_boxed_slice(),
            num_hashes: params.num_hashes,
        }
    }

    /// Filter for a node given its parents' filters: union of the parents
    /// plus the node's own id.
    pub fn for_node<'a, I>(id: NodeId, parents: I, params: BloomParams) -> Self
    where
        I: IntoIterator<Item = &'a AncestryFilter>,
    {
        let mut filter = Self::empty(params);
        for parent in parents {
            filter.union_with(parent);
        }
        filter.insert(id);
        filter
    }

    pub fn insert(&mut self, key: NodeId) {
        let num_bits = self.num_bits();
        for pos in probe_positions(key, self.num_hashes, num_bits) {
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// `false` → definitely not an ancestor. `true` → maybe.
    pub fn maybe_contains(&self, key: NodeId) -> bool {
        probe_positions(key, self.num_hashes, self.num_bits())
            .all(|pos| self.bits[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    /// OR `other` into `self`. Filters of a different width are ignored
    /// word-for-word past the shorter length, which never happens inside
    /// one engine.
    pub fn union_with(&mut self, other: &AncestryFilter) {
        debug_assert_eq!(self.bits.len(), other.bits.len());
        for (word, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word |= *theirs;
        }
    }

    /// True if the two filters share at least one set bit.
    ///
    /// Disjoint filters mean the ancestor sets are disjoint, so the two
    /// nodes have no common ancestor.
    pub fn intersects(&self, other: &AncestryFilter) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len() * 64
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Fraction of bits set. Filters near 1.0 no longer reject anything.
    pub fn fill_ratio(&self) -> f64 {
        self.count_ones() as f64 / self.num_bits() as f64
    }

    /// Estimated false-positive rate from the actual fill.
    pub fn estimated_fpr(&self) -> f64 {
        self.fill_ratio().powi(self.num_hashes as i32)
    }
}

// ── SummaryIndex ────────────────────────────────────────────────────

/// Read view over the catalog's ancestry filters.
#[derive(Clone)]
pub struct SummaryIndex {
    catalog: Arc<IndexCatalog>,
}

impl SummaryIndex {
    pub fn new(catalog: Arc<IndexCatalog>) -> Self {
        Self { catalog }
    }

    pub fn entry(&self, id: NodeId) -> Option<Arc<IndexEntry>> {
        self.catalog.get(id)
    }

    /// May `candidate` be an ancestor of (or equal to) `descendant`?
    ///
    /// Fails with `IndexInconsistent` if the descendant is not indexed yet.
    pub fn might_be_ancestor(&self, candidate: NodeId, descendant: NodeId) -> Result<bool> {
        if candidate == descendant {
            return Ok(true);
        }
        let entry = self
            .catalog
            .get(descendant)
            .ok_or(AncestryError::IndexInconsistent(descendant))?;
        Ok(entry.filter.maybe_contains(candidate))
    }

    /// May the ancestor sets of `a` and `b` intersect?
    pub fn filters_might_overlap(&self, a: NodeId, b: NodeId) -> Result<bool> {
        let left = self.catalog.get(a).ok_or(AncestryError::IndexInconsistent(a))?;
        let right = self.catalog.get(b).ok_or(AncestryError::IndexInconsistent(b))?;
        Ok(left.filter.intersects(&right.filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::compute_node_id;

    fn key(i: u64) -> NodeId {
        compute_node_id(&[], &i.to_le_bytes())
    }

    #[test]
    fn test_params_rounding() {
        let p = BloomParams::new(100, 0);
        assert_eq!(p.num_bits, 128);
        assert_eq!(p.num_hashes, 1);
        assert_eq!(BloomParams::new(0, 99).num_bits, 64);
        assert_eq!(BloomParams::new(0, 99).num_hashes, MAX_FILTER_HASHES);
        assert!(BloomParams::default().validate().is_ok());
    }

    #[test]
    fn test_params_for_capacity() {
        let p = BloomParams::for_capacity(1000, 0.01);
        // ~9.6 bits per key, ~7 probes
        assert!(p.num_bits >= 9_536 && p.num_bits <= 9_664, "bits = {}", p.num_bits);
        assert_eq!(p.num_hashes, 7);
        assert!(p.expected_fpr(1000) < 0.011);
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let bad = BloomParams { num_bits: 100, num_hashes: 3 };
        assert!(bad.validate().is_err());
        let bad = BloomParams { num_bits: 128, num_hashes: 0 };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_filter_empty() {
        let f = AncestryFilter::empty(BloomParams::default());
        assert_eq!(f.count_ones(), 0);
        for i in 0..100 {
            assert!(!f.maybe_contains(key(i)));
        }
    }

    #[test]
    fn test_filter_no_false_negatives() {
        let mut f = AncestryFilter::empty(BloomParams::default());
        for i in 0..500 {
            f.insert(key(i));
        }
        for i in 0..500 {
            assert!(f.maybe_contains(key(i)), "false negative for key {}", i);
        }
    }

    #[test]
    fn test_filter_fpr_reasonable() {
        let params = BloomParams::for_capacity(1000, 0.01);
        let mut f = AncestryFilter::empty(params);
        for i in 0..1000 {
            f.insert(key(i));
        }
        let fp = (10_000..110_000u64).filter(|i| f.maybe_contains(key(*i))).count();
        let rate = fp as f64 / 100_000.0;
        assert!(rate < 0.03, "false positive rate too high: {}", rate);
        assert!(f.estimated_fpr() < 0.03);
    }

    #[test]
    fn test_for_node_contains_parents_and_self() {
        let params = BloomParams::default();
        let root = AncestryFilter::for_node(key(1), std::iter::empty(), params);
        let side = AncestryFilter::for_node(key(2), std::iter::empty(), params);
        let merge = AncestryFilter::for_node(key(3), [&root, &side], params);

        assert!(merge.maybe_contains(key(1)));
        assert!(merge.maybe_contains(key(2)));
        assert!(merge.maybe_contains(key(3)));
        assert!(merge.intersects(&root));
        assert!(merge.count_ones() >= root.count_ones());
    }

    #[test]
    fn test_disjoint_filters_do_not_intersect() {
        let params = BloomParams::new(1 << 16, 2);
        let a = AncestryFilter::for_node(key(10), std::iter::empty(), params);
        let b = AncestryFilter::for_node(key(11), std::iter::empty(), params);
        // Two single-key filters in 64k bits collide with negligible probability.
        assert!(!a.intersects(&b));
    }

    #[test]
    fn test_union_is_monotonic() {
        let params = BloomParams::default();
        let mut acc = AncestryFilter::empty(params);
        let mut last = 0;
        for i in 0..50 {
            let f = AncestryFilter::for_node(key(i), std::iter::empty(), params);
            acc.union_with(&f);
            assert!(acc.count_ones() >= last);
            last = acc.count_ones();
        }
        assert!(acc.fill_ratio() > 0.0 && acc.fill_ratio() < 1.0);
    }
}
