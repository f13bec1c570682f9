//! Exact ancestry search over the sharded store.
//!
//! `merge_base` runs two breadth-first frontiers, one from each endpoint.
//! A node reached from both sides is a candidate; the search keeps going
//! while either frontier still holds nodes above the candidate's
//! generation, since only those can lead to a lower one. Every round
//! expands one whole frontier with a single batched fetch, so the number
//! of shard round-trips tracks the search depth rather than the number of
//! nodes touched.
//!
//! All state lives in a [`SearchState`] owned by the call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::Instant;

use crate::index::{GenerationIndex, IndexEntry, SummaryIndex};
use crate::router::ShardRouter;
use crate::types::{NodeId, ShardId};

/// Why a query could not be answered definitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InconclusiveReason {
    DeadlineExceeded,
    BudgetExhausted,
    ShardUnavailable(ShardId),
    /// Some ancestor records are absent from the store, and no meeting
    /// point was found among the history that is present.
    TruncatedHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Common ancestor (merge base), or for `reaches` the candidate itself.
    Met(NodeId),
    /// The searched histories are complete and never meet.
    Disjoint,
    Aborted(InconclusiveReason),
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub deadline: Option<Instant>,
    pub max_visited: usize,
    /// Generation gap tolerated before the higher frontier is forced to
    /// expand.
    pub alignment_slack: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub rounds: u32,
    pub visited: usize,
    pub fetched: usize,
    /// Nodes not expanded because they cannot lead to an answer.
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchReport {
    pub outcome: SearchOutcome,
    pub stats: SearchStats,
}

// ── Per-query state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn bit(self) -> u8 {
        match self {
            Side::Left => 0b01,
            Side::Right => 0b10,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

#[derive(Debug, Default)]
struct Frontier {
    ids: Vec<NodeId>,
    /// Some visited node's record was missing from the store.
    truncated: bool,
}

/// Arena for one `merge_base` call.
struct SearchState {
    /// id -> bitmask of sides that reached it.
    visited: HashMap<NodeId, u8>,
    left: Frontier,
    right: Frontier,
    /// Index entries of the two endpoints, when already published.
    left_entry: Option<Arc<IndexEntry>>,
    right_entry: Option<Arc<IndexEntry>>,
    last: Option<Side>,
}

impl SearchState {
    fn new(left: NodeId, right: NodeId, summaries: &SummaryIndex) -> Self {
        let mut visited = HashMap::new();
        visited.insert(left, Side::Left.bit());
        visited.insert(right, Side::Right.bit());
        Self {
            visited,
            left: Frontier { ids: vec![left], truncated: false },
            right: Frontier { ids: vec![right], truncated: false },
            left_entry: summaries.entry(left),
            right_entry: summaries.entry(right),
            last: None,
        }
    }

    fn frontier_mut(&mut self, side: Side) -> &mut Frontier {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Endpoint entry of the side opposite to `side`.
    fn opposite_entry(&self, side: Side) -> Option<&Arc<IndexEntry>> {
        match side {
            Side::Left => self.right_entry.as_ref(),
            Side::Right => self.left_entry.as_ref(),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.left.ids.is_empty() && self.right.ids.is_empty()
    }

    /// Drop frontier nodes at or below `floor`. Unindexed nodes stay.
    fn retain_above(&mut self, floor: u64, generations: &GenerationIndex) {
        for frontier in [&mut self.left, &mut self.right] {
            frontier
                .ids
                .retain(|id| generations.try_generation(*id).map_or(true, |g| g > floor));
        }
    }

    fn choose_side(&self, generations: &GenerationIndex, slack: u64) -> Side {
        if self.left.ids.is_empty() {
            return Side::Right;
        }
        if self.right.ids.is_empty() {
            return Side::Left;
        }

        let left_max = generations.max_generation(&self.left.ids);
        let right_max = generations.max_generation(&self.right.ids);
        if let (Some(l), Some(r)) = (left_max, right_max) {
            if l > r.saturating_add(slack) {
                return Side::Left;
            }
            if r > l.saturating_add(slack) {
                return Side::Right;
            }
        }

        let (l, r) = (self.left.ids.len(), self.right.ids.len());
        if l < r {
            Side::Left
        } else if r < l {
            Side::Right
        } else {
            self.last.map_or(Side::Left, Side::other)
        }
    }
}

// ── Search ─────────────────────────────────────────────────────────

pub struct BidirectionalSearch<'a> {
    router: &'a ShardRouter,
    generations: &'a GenerationIndex,
    summaries: &'a SummaryIndex,
    options: SearchOptions,
}

impl<'a> BidirectionalSearch<'a> {
    pub fn new(
        router: &'a ShardRouter,
        generations: &'a GenerationIndex,
        summaries: &'a SummaryIndex,
        options: SearchOptions,
    ) -> Self {
        Self { router, generations, summaries, options }
    }

    fn deadline_passed(&self) -> bool {
        self.options.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Highest-generation meeting point; earlier entries win ties.
    fn best_meeting(&self, meetings: &[NodeId]) -> (NodeId, Option<u64>) {
        let mut best = meetings[0];
        let mut best_generation = self.generations.try_generation(best);
        for id in &meetings[1..] {
            let generation = self.generations.try_generation(*id);
            if generation > best_generation {
                best = *id;
                best_generation = generation;
            }
        }
        (best, best_generation)
    }

    /// True when `id`'s ancestry provably shares nothing with the
    /// ancestry of `endpoint`. Unindexed nodes are never pruned.
    fn cannot_meet(&self, id: NodeId, endpoint: Option<&Arc<IndexEntry>>) -> bool {
        let Some(endpoint) = endpoint else {
            return false;
        };
        match self.summaries.entry(id) {
            Some(entry) => !entry.filter.intersects(&endpoint.filter),
            None => false,
        }
    }

    /// Find the lowest common ancestor of `a` and `b`.
    ///
    /// Among incomparable candidates of equal generation the first one
    /// met wins. The pair is ordered by id first, so swapping the
    /// arguments runs the identical search.
    pub async fn merge_base(&self, a: NodeId, b: NodeId) -> SearchReport {
        let mut stats = SearchStats::default();
        if a == b {
            return SearchReport { outcome: SearchOutcome::Met(a), stats };
        }
        let (left, right) = if a < b { (a, b) } else { (b, a) };
        let mut state = SearchState::new(left, right, self.summaries);
        let mut best: Option<(NodeId, Option<u64>)> = None;

        let outcome = loop {
            if let Some((candidate, generation)) = best {
                // Without a generation nothing can be ruled out.
                let Some(floor) = generation else {
                    break SearchOutcome::Met(candidate);
                };
                state.retain_above(floor, self.generations);
                if state.is_exhausted() {
                    break SearchOutcome::Met(candidate);
                }
            }
            if state.is_exhausted() {
                let truncated = state.left.truncated || state.right.truncated;
                break if truncated {
                    SearchOutcome::Aborted(InconclusiveReason::TruncatedHistory)
                } else {
                    SearchOutcome::Disjoint
                };
            }
            if self.deadline_passed() {
                break SearchOutcome::Aborted(InconclusiveReason::DeadlineExceeded);
            }
            if state.visited.len() > self.options.max_visited {
                break SearchOutcome::Aborted(InconclusiveReason::BudgetExhausted);
            }

            let side = state.choose_side(self.generations, self.options.alignment_slack);
            state.last = Some(side);
            let frontier = std::mem::take(&mut state.frontier_mut(side).ids);

            let fetch = self.router.fetch_batch(&frontier, self.options.deadline).await;
            stats.rounds += 1;
            stats.fetched += fetch.nodes.len();
            if let Some(shard) = fetch.first_unavailable_shard() {
                break SearchOutcome::Aborted(InconclusiveReason::ShardUnavailable(shard));
            }

            let opposite = state.opposite_entry(side).cloned();
            let mut meetings = Vec::new();
            let mut next = Vec::new();
            let mut truncated = false;
            for id in &frontier {
                let marks = state.visited.get(id).copied().unwrap_or(0);
                if marks & side.other().bit() != 0 {
                    meetings.push(*id);
                    continue;
                }
                let Some(node) = fetch.get(*id) else {
                    truncated = true;
                    continue;
                };
                for parent in &node.parents {
                    let marks = state.visited.entry(*parent).or_insert(0);
                    if *marks & side.bit() != 0 {
                        continue;
                    }
                    *marks |= side.bit();
                    if *marks & side.other().bit() != 0 {
                        meetings.push(*parent);
                    } else if self.cannot_meet(*parent, opposite.as_ref()) {
                        stats.pruned += 1;
                    } else {
                        next.push(*parent);
                    }
                }
            }

            if !meetings.is_empty() {
                let (id, generation) = self.best_meeting(&meetings);
                let improves = match best {
                    None => true,
                    Some((_, current)) => generation.is_none() || generation > current,
                };
                if improves {
                    best = Some((id, generation));
                }
            }

            let current = state.frontier_mut(side);
            current.truncated |= truncated;
            current.ids = next;
        };

        stats.visited = state.visited.len();
        tracing::trace!(
            rounds = stats.rounds,
            visited = stats.visited,
            fetched = stats.fetched,
            pruned = stats.pruned,
            ?outcome,
            "merge-base search finished"
        );
        SearchReport { outcome, stats }
    }

    /// Is `candidate` an ancestor of (or equal to) `descendant`?
    ///
    /// Single breadth-first walk up from `descendant`. Branches whose
    /// generation is at or below the candidate's cannot contain it and
    /// are not expanded.
    pub async fn reaches(&self, candidate: NodeId, descendant: NodeId) -> SearchReport {
        let mut stats = SearchStats::default();
        if candidate == descendant {
            return SearchReport { outcome: SearchOutcome::Met(candidate), stats };
        }
        let candidate_generation = self.generations.try_generation(candidate);

        let mut visited = HashSet::new();
        visited.insert(descendant);
        let mut frontier = vec![descendant];
        let mut truncated = false;

        let outcome = loop {
            if frontier.is_empty() {
                break if truncated {
                    SearchOutcome::Aborted(InconclusiveReason::TruncatedHistory)
                } else {
                    SearchOutcome::Disjoint
                };
            }
            if self.deadline_passed() {
                break SearchOutcome::Aborted(InconclusiveReason::DeadlineExceeded);
            }
            if visited.len() > self.options.max_visited {
                break SearchOutcome::Aborted(InconclusiveReason::BudgetExhausted);
            }

            let fetch = self.router.fetch_batch(&frontier, self.options.deadline).await;
            stats.rounds += 1;
            stats.fetched += fetch.nodes.len();
            if let Some(shard) = fetch.first_unavailable_shard() {
                break SearchOutcome::Aborted(InconclusiveReason::ShardUnavailable(shard));
            }

            let mut next = Vec::new();
            let mut found = false;
            'expand: for id in &frontier {
                let Some(node) = fetch.get(*id) else {
                    truncated = true;
                    continue;
                };
                for parent in &node.parents {
                    if *parent == candidate {
                        found = true;
                        break 'expand;
                    }
                    if !visited.insert(*parent) {
                        continue;
                    }
                    let below = match (candidate_generation, self.generations.try_generation(*parent)) {
                        (Some(c), Some(p)) => p <= c,
                        _ => false,
                    };
                    if below {
                        stats.pruned += 1;
                    } else {
                        next.push(*parent);
                    }
                }
            }
            if found {
                break SearchOutcome::Met(candidate);
            }
            frontier = next;
        };

        stats.visited = visited.len();
        SearchReport { outcome, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::index::{AncestryFilter, BloomParams, IndexCatalog};
    use crate::metrics::Metrics;
    use crate::router::ShardPlanner;
    use crate::storage::{NodeShard, ShardBackend};
    use crate::types::Node;

    /// Small in-process graph: nodes are indexed in insertion order, which
    /// must be parents-first.
    struct Graph {
        shards: Vec<Arc<NodeShard>>,
        catalog: Arc<IndexCatalog>,
        generations: GenerationIndex,
        summaries: SummaryIndex,
        router: ShardRouter,
    }

    impl Graph {
        fn new(nodes: &[(u128, &[u128])]) -> Self {
            Self::with_index(nodes, nodes.len())
        }

        /// Only the first `indexed` nodes get index entries.
        fn with_index(nodes: &[(u128, &[u128])], indexed: usize) -> Self {
            let shards: Vec<Arc<NodeShard>> = (0..3).map(|i| Arc::new(NodeShard::ephemeral(i))).collect();
            let catalog = Arc::new(IndexCatalog::new(BloomParams::default()));
            let params = catalog.params();
            let router = ShardRouter::new(
                ShardPlanner::new(3),
                shards.iter().map(|s| Arc::clone(s) as Arc<dyn ShardBackend>).collect(),
                4,
                0,
                RetryPolicy::none(),
                Arc::new(Metrics::new()),
            )
            .unwrap();
            for (i, (id, parents)) in nodes.iter().enumerate() {
                let node = Node {
                    id: NodeId(*id),
                    parents: parents.iter().copied().map(NodeId).collect(),
                    created_at: i as u64,
                };
                let shard = &shards[router.locate(node.id) as usize];
                shard.insert_with(node.id, || node.clone()).unwrap();
                if i < indexed {
                    let entries = catalog.get_many(&node.parents);
                    let generation =
                        crate::index::generation::next_generation(entries.iter().map(|(_, e)| e.generation));
                    let filter =
                        AncestryFilter::for_node(node.id, entries.iter().map(|(_, e)| &e.filter), params);
                    catalog.publish_wave(vec![(node.id, IndexEntry { generation, filter })]);
                }
            }
            let generations = GenerationIndex::new(Arc::clone(&catalog));
            let summaries = SummaryIndex::new(Arc::clone(&catalog));
            Self { shards, catalog, generations, summaries, router }
        }

        fn search_with(&self, options: SearchOptions) -> BidirectionalSearch<'_> {
            BidirectionalSearch::new(&self.router, &self.generations, &self.summaries, options)
        }

        fn search(&self) -> BidirectionalSearch<'_> {
            self.search_with(SearchOptions { deadline: None, max_visited: 10_000, alignment_slack: 2 })
        }

        async fn merge_base(&self, a: u128, b: u128) -> SearchOutcome {
            self.search().merge_base(NodeId(a), NodeId(b)).await.outcome
        }
    }

    // A <- B <- C <- D, C <- E
    const FORK: &[(u128, &[u128])] = &[(1, &[]), (2, &[1]), (3, &[2]), (4, &[3]), (5, &[3])];

    #[tokio::test]
    async fn test_fork_meets_at_branch_point() {
        let g = Graph::new(FORK);
        assert_eq!(g.merge_base(4, 5).await, SearchOutcome::Met(NodeId(3)));
        assert_eq!(g.merge_base(5, 4).await, SearchOutcome::Met(NodeId(3)));
    }

    #[tokio::test]
    async fn test_ancestor_endpoint_is_the_merge_base() {
        let g = Graph::new(FORK);
        assert_eq!(g.merge_base(4, 1).await, SearchOutcome::Met(NodeId(1)));
        assert_eq!(g.merge_base(2, 5).await, SearchOutcome::Met(NodeId(2)));
        assert_eq!(g.merge_base(3, 3).await, SearchOutcome::Met(NodeId(3)));
    }

    #[tokio::test]
    async fn test_ancestor_endpoint_beats_shortcut_to_its_parent() {
        // 1 <- a <- x1 <- ... <- xk <- b, and b also names 1 directly.
        for k in [1u128, 3, 5, 8] {
            for (a, b) in [(2u128, 50u128), (60, 50)] {
                let mut nodes: Vec<(u128, Vec<u128>)> = vec![(1, vec![]), (a, vec![1])];
                let mut prev = a;
                for x in 10..10 + k {
                    nodes.push((x, vec![prev]));
                    prev = x;
                }
                nodes.push((b, vec![prev, 1]));
                let shape: Vec<(u128, &[u128])> = nodes.iter().map(|(id, p)| (*id, p.as_slice())).collect();
                let g = Graph::new(&shape);
                assert_eq!(g.merge_base(a, b).await, SearchOutcome::Met(NodeId(a)), "k = {}", k);
                assert_eq!(g.merge_base(b, a).await, SearchOutcome::Met(NodeId(a)), "k = {}", k);
            }
        }
    }

    #[tokio::test]
    async fn test_lower_meeting_replaces_earlier_candidate() {
        // 4 and 9 share 3 and, through 3, the root 1. 9 also names 1 directly.
        let g = Graph::new(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[3]), (7, &[3]), (8, &[7]), (9, &[8, 1])]);
        let report = g.search().merge_base(NodeId(4), NodeId(9)).await;
        assert_eq!(report.outcome, SearchOutcome::Met(NodeId(3)));
    }

    #[tokio::test]
    async fn test_disjoint_roots() {
        let g = Graph::new(&[(1, &[]), (2, &[1]), (10, &[]), (11, &[10])]);
        assert_eq!(g.merge_base(2, 11).await, SearchOutcome::Disjoint);
    }

    #[tokio::test]
    async fn test_missing_history_is_not_disjoint() {
        // 2's parent 99 was never stored.
        let g = Graph::new(&[(2, &[99]), (10, &[]), (11, &[10])]);
        assert_eq!(
            g.merge_base(2, 11).await,
            SearchOutcome::Aborted(InconclusiveReason::TruncatedHistory)
        );
    }

    #[tokio::test]
    async fn test_unindexed_nodes_still_searchable() {
        let g = Graph::with_index(FORK, 2);
        assert_eq!(g.merge_base(4, 5).await, SearchOutcome::Met(NodeId(3)));
    }

    #[tokio::test]
    async fn test_alignment_walks_the_deep_side_first() {
        // Long chain 100..=160 off root 1; short branch 2 <- 3 off root 1.
        let mut nodes: Vec<(u128, Vec<u128>)> = vec![(1, vec![]), (2, vec![1]), (3, vec![2])];
        let mut prev = 1u128;
        for id in 100..=160u128 {
            nodes.push((id, vec![prev]));
            prev = id;
        }
        let shape: Vec<(u128, &[u128])> = nodes.iter().map(|(id, p)| (*id, p.as_slice())).collect();
        let g = Graph::new(&shape);
        let report = g.search().merge_base(NodeId(3), NodeId(160)).await;
        assert_eq!(report.outcome, SearchOutcome::Met(NodeId(1)));
        assert!(report.stats.rounds <= 70, "rounds = {}", report.stats.rounds);
    }

    #[tokio::test]
    async fn test_disjoint_branch_is_pruned() {
        // 20 merges 2 (off root 1) with the tip of an unrelated chain 30..=39.
        let mut nodes: Vec<(u128, Vec<u128>)> =
            vec![(1, vec![]), (2, vec![1]), (3, vec![1]), (30, vec![])];
        for id in 31..=39u128 {
            nodes.push((id, vec![id - 1]));
        }
        nodes.push((20, vec![2, 39]));
        let shape: Vec<(u128, &[u128])> = nodes.iter().map(|(id, p)| (*id, p.as_slice())).collect();
        let g = Graph::new(&shape);

        let report = g.search().merge_base(NodeId(20), NodeId(3)).await;
        assert_eq!(report.outcome, SearchOutcome::Met(NodeId(1)));
        assert_eq!(report.stats.pruned, 1);
        assert!(report.stats.fetched < 8, "walked the unrelated chain");
    }

    #[tokio::test]
    async fn test_highest_generation_meeting_wins() {
        // Criss-cross: 4 and 5 both merge 2 and 3.
        let g = Graph::new(&[(1, &[]), (2, &[1]), (3, &[1]), (4, &[2, 3]), (5, &[3, 2])]);
        let outcome = g.merge_base(4, 5).await;
        assert!(matches!(outcome, SearchOutcome::Met(NodeId(2)) | SearchOutcome::Met(NodeId(3))));
        assert_eq!(outcome, g.merge_base(5, 4).await);
    }

    #[tokio::test]
    async fn test_zero_deadline_aborts() {
        let g = Graph::new(FORK);
        let options = SearchOptions {
            deadline: Some(Instant::now()),
            max_visited: 10_000,
            alignment_slack: 2,
        };
        let report = g.search_with(options).merge_base(NodeId(4), NodeId(5)).await;
        assert_eq!(report.outcome, SearchOutcome::Aborted(InconclusiveReason::DeadlineExceeded));
        assert_eq!(report.stats.rounds, 0);
    }

    #[tokio::test]
    async fn test_visit_budget_aborts() {
        let g = Graph::new(FORK);
        let options = SearchOptions { deadline: None, max_visited: 1, alignment_slack: 2 };
        let report = g.search_with(options).merge_base(NodeId(4), NodeId(5)).await;
        assert_eq!(report.outcome, SearchOutcome::Aborted(InconclusiveReason::BudgetExhausted));
    }

    #[tokio::test]
    async fn test_unavailable_shard_aborts() {
        let g = Graph::new(FORK);
        for shard in &g.shards {
            shard.set_available(false);
        }
        let outcome = g.merge_base(4, 5).await;
        assert!(matches!(
            outcome,
            SearchOutcome::Aborted(InconclusiveReason::ShardUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reaches() {
        let g = Graph::new(FORK);
        let search = g.search();
        assert_eq!(search.reaches(NodeId(1), NodeId(4)).await.outcome, SearchOutcome::Met(NodeId(1)));
        assert_eq!(search.reaches(NodeId(4), NodeId(5)).await.outcome, SearchOutcome::Disjoint);
        assert_eq!(search.reaches(NodeId(5), NodeId(5)).await.outcome, SearchOutcome::Met(NodeId(5)));
        assert!(g.catalog.len() == FORK.len());
    }

    #[tokio::test]
    async fn test_reaches_prunes_by_generation() {
        // 5 sits at generation 3; walking up from 4 stops at generation 3.
        let g = Graph::new(FORK);
        let report = g.search().reaches(NodeId(5), NodeId(4)).await;
        assert_eq!(report.outcome, SearchOutcome::Disjoint);
        assert_eq!(report.stats.rounds, 1);
    }
}
