//! Latency-budgeted strategy cascade.
//!
//! Every query walks the same ordered list of stages, cheapest first:
//!
//! 1. `GenerationScreen`: identity, generation hints, generation-order
//!    rejection for ancestry checks
//! 2. `BloomReject`: definitive negatives from ancestry filters
//! 3. `ExactSearch`: batched breadth-first search within the remaining budget
//! 4. `TimeoutFallback`: `Inconclusive` with a suggested retry budget
//!
//! A stage either answers or hands over to the next one. Stages never go
//! back, and the fallback never invents an answer.

use std::time::Duration;

use tokio::time::Instant;

use crate::index::generation::may_precede;
use crate::index::{GenerationIndex, SummaryIndex};
use crate::metrics::Metrics;
use crate::router::ShardRouter;
use crate::search::{
    BidirectionalSearch, InconclusiveReason, SearchOptions, SearchOutcome, SearchStats,
};
use crate::types::NodeId;

/// Floor for the suggested retry budget.
const MIN_RETRY_BUDGET: Duration = Duration::from_millis(10);

// ── Results ────────────────────────────────────────────────────────

/// A query that ran out of budget or could not reach its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inconclusive {
    pub reason: InconclusiveReason,
    /// Budget worth retrying with (twice the one that was spent).
    pub retry_budget: Duration,
}

/// Answer to `find_common_ancestor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBase {
    Found(NodeId),
    NoCommonAncestor,
    Inconclusive(Inconclusive),
}

impl MergeBase {
    pub fn found(&self) -> Option<NodeId> {
        match self {
            MergeBase::Found(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, MergeBase::Inconclusive(_))
    }
}

/// Answer to `is_ancestor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    Ancestor,
    NotAncestor,
    Inconclusive(Inconclusive),
}

impl Ancestry {
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Ancestry::Inconclusive(_))
    }
}

// ── Queries and stages ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Common ancestor of `left` and `right`.
    MergeBase,
    /// Is `left` an ancestor of `right`?
    Ancestry,
}

#[derive(Debug, Clone, Copy)]
pub struct Query {
    pub kind: QueryKind,
    pub left: NodeId,
    pub right: NodeId,
    pub budget: Duration,
    pub deadline: Instant,
}

impl Query {
    pub fn merge_base(a: NodeId, b: NodeId, budget: Duration) -> Self {
        Self::new(QueryKind::MergeBase, a, b, budget)
    }

    pub fn ancestry(candidate: NodeId, descendant: NodeId, budget: Duration) -> Self {
        Self::new(QueryKind::Ancestry, candidate, descendant, budget)
    }

    fn new(kind: QueryKind, left: NodeId, right: NodeId, budget: Duration) -> Self {
        Self { kind, left, right, budget, deadline: Instant::now() + budget }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GenerationScreen,
    BloomReject,
    ExactSearch,
    TimeoutFallback,
}

/// Order in which stages run for every query.
pub const CASCADE: [Stage; 4] = [
    Stage::GenerationScreen,
    Stage::BloomReject,
    Stage::ExactSearch,
    Stage::TimeoutFallback,
];

/// Kind-neutral answer; the engine maps it to `MergeBase` or `Ancestry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Merge base found, or the candidate is an ancestor.
    Positive(NodeId),
    Negative,
    Inconclusive(Inconclusive),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Answer(Verdict),
    Continue,
}

/// Final answer plus the stage that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub stage: Stage,
    pub search: SearchStats,
}

/// Facts gathered by earlier stages for later ones.
#[derive(Debug, Default)]
struct StageContext {
    left_generation: Option<u64>,
    right_generation: Option<u64>,
    summaries_usable: bool,
    last_reason: Option<InconclusiveReason>,
    search: SearchStats,
}

// ── Coordinator ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub max_visited: usize,
    pub alignment_slack: u64,
}

pub struct StrategyCoordinator<'a> {
    router: &'a ShardRouter,
    generations: &'a GenerationIndex,
    summaries: &'a SummaryIndex,
    metrics: &'a Metrics,
    settings: CoordinatorSettings,
}

impl<'a> StrategyCoordinator<'a> {
    pub fn new(
        router: &'a ShardRouter,
        generations: &'a GenerationIndex,
        summaries: &'a SummaryIndex,
        metrics: &'a Metrics,
        settings: CoordinatorSettings,
    ) -> Self {
        Self { router, generations, summaries, metrics, settings }
    }

    pub async fn resolve(&self, query: &Query) -> Resolution {
        let mut ctx = StageContext::default();
        for stage in CASCADE {
            let remaining = query.remaining();
            if let StageOutcome::Answer(verdict) = self.run_stage(stage, query, &mut ctx, remaining).await {
                return Resolution { verdict, stage, search: ctx.search };
            }
        }
        // TimeoutFallback always answers; this only guards the loop shape.
        Resolution {
            verdict: Verdict::Inconclusive(self.give_up(query, &ctx)),
            stage: Stage::TimeoutFallback,
            search: ctx.search,
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        query: &Query,
        ctx: &mut StageContext,
        remaining: Duration,
    ) -> StageOutcome {
        match stage {
            Stage::GenerationScreen => self.generation_screen(query, ctx),
            Stage::BloomReject => self.bloom_reject(query, ctx),
            Stage::ExactSearch => self.exact_search(query, ctx, remaining).await,
            Stage::TimeoutFallback => {
                StageOutcome::Answer(Verdict::Inconclusive(self.give_up(query, ctx)))
            }
        }
    }

    fn generation_screen(&self, query: &Query, ctx: &mut StageContext) -> StageOutcome {
        if query.left == query.right {
            return StageOutcome::Answer(Verdict::Positive(query.left));
        }
        ctx.left_generation = self.generations.try_generation(query.left);
        ctx.right_generation = self.generations.try_generation(query.right);
        ctx.summaries_usable = ctx.left_generation.is_some() && ctx.right_generation.is_some();

        if query.kind == QueryKind::Ancestry {
            if let (Some(candidate), Some(descendant)) = (ctx.left_generation, ctx.right_generation) {
                if !may_precede(candidate, descendant) {
                    self.metrics.record_generation_reject();
                    return StageOutcome::Answer(Verdict::Negative);
                }
            }
        }
        StageOutcome::Continue
    }

    fn bloom_reject(&self, query: &Query, ctx: &StageContext) -> StageOutcome {
        if !ctx.summaries_usable {
            return StageOutcome::Continue;
        }
        let maybe = match query.kind {
            QueryKind::MergeBase => self.summaries.filters_might_overlap(query.left, query.right),
            QueryKind::Ancestry => self.summaries.might_be_ancestor(query.left, query.right),
        };
        match maybe {
            Ok(false) => {
                self.metrics.record_bloom_reject();
                StageOutcome::Answer(Verdict::Negative)
            }
            Ok(true) => StageOutcome::Continue,
            Err(e) => {
                tracing::debug!(error = %e, "bloom stage skipped");
                StageOutcome::Continue
            }
        }
    }

    async fn exact_search(&self, query: &Query, ctx: &mut StageContext, remaining: Duration) -> StageOutcome {
        if remaining.is_zero() {
            ctx.last_reason = Some(InconclusiveReason::DeadlineExceeded);
            return StageOutcome::Continue;
        }
        let options = SearchOptions {
            deadline: Some(query.deadline),
            max_visited: self.settings.max_visited,
            alignment_slack: self.settings.alignment_slack,
        };
        let search = BidirectionalSearch::new(self.router, self.generations, self.summaries, options);
        let report = match query.kind {
            QueryKind::MergeBase => search.merge_base(query.left, query.right).await,
            QueryKind::Ancestry => search.reaches(query.left, query.right).await,
        };
        ctx.search = report.stats;

        match report.outcome {
            SearchOutcome::Met(id) => StageOutcome::Answer(Verdict::Positive(id)),
            SearchOutcome::Disjoint => StageOutcome::Answer(Verdict::Negative),
            SearchOutcome::Aborted(reason) => {
                ctx.last_reason = Some(reason);
                StageOutcome::Continue
            }
        }
    }

    fn give_up(&self, query: &Query, ctx: &StageContext) -> Inconclusive {
        let reason = ctx.last_reason.unwrap_or(InconclusiveReason::DeadlineExceeded);
        if reason == InconclusiveReason::DeadlineExceeded {
            self.metrics.record_timeout();
        }
        self.metrics.record_inconclusive();
        let retry_budget = query.budget.saturating_mul(2).max(MIN_RETRY_BUDGET);
        tracing::debug!(
            left = %query.left,
            right = %query.right,
            ?reason,
            retry_budget_ms = retry_budget.as_millis() as u64,
            "query inconclusive"
        );
        Inconclusive { reason, retry_budget }
    }
}
