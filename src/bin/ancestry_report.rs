//! Ancestry report: query latency on a synthetic commit history.
//!
//! Builds a mainline with periodic feature branches and merges back,
//! then times merge-base and ancestry queries at several depths and
//! prints a table plus the engine's metrics.
//!
//! Run: RUST_LOG=mergebase=debug cargo run --release --bin ancestry_report

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use mergebase::{Ancestry, AncestryEngine, EngineConfig, MergeBase, NodeId};
use tracing_subscriber::EnvFilter;

const BRANCH_EVERY: usize = 50;
const BRANCH_LEN: usize = 20;
const QUERIES_PER_SIZE: usize = 200;

// ── Synthetic history ──────────────────────────────────────────────────

struct History {
    mainline: Vec<NodeId>,
    /// Tips of branches that were never merged.
    open_tips: Vec<NodeId>,
}

fn build_history(engine: &AncestryEngine, commits: usize) -> anyhow::Result<History> {
    let mut mainline = Vec::with_capacity(commits);
    let mut open_tips = Vec::new();
    let mut tip = engine.append(&[], b"root")?;
    mainline.push(tip);

    for i in 1..commits {
        if i % BRANCH_EVERY == 0 {
            let mut branch = tip;
            for j in 0..BRANCH_LEN {
                branch = engine.append(&[branch], format!("feature-{i}-{j}").as_bytes())?;
            }
            if (i / BRANCH_EVERY) % 2 == 0 {
                tip = engine.append(&[tip, branch], format!("merge-{i}").as_bytes())?;
                mainline.push(tip);
                continue;
            }
            open_tips.push(branch);
        }
        tip = engine.append(&[tip], format!("main-{i}").as_bytes())?;
        mainline.push(tip);
    }
    Ok(History { mainline, open_tips })
}

// ── Measurement ────────────────────────────────────────────────────────

struct Timing {
    total: Duration,
    worst: Duration,
    inconclusive: usize,
}

async fn time_merge_bases(engine: &AncestryEngine, history: &History) -> anyhow::Result<Timing> {
    let mut timing = Timing { total: Duration::ZERO, worst: Duration::ZERO, inconclusive: 0 };
    let head = *history.mainline.last().context("empty history")?;
    for i in 0..QUERIES_PER_SIZE {
        let Some(&tip) = history.open_tips.get(i % history.open_tips.len().max(1)) else {
            break;
        };
        let start = Instant::now();
        let result = engine.find_common_ancestor(head, tip, None).await?;
        let elapsed = start.elapsed();
        timing.total += elapsed;
        timing.worst = timing.worst.max(elapsed);
        match result {
            MergeBase::Found(_) => {}
            MergeBase::Inconclusive(_) => timing.inconclusive += 1,
            MergeBase::NoCommonAncestor => bail!("history lost its root for tip {tip}"),
        }
    }
    Ok(timing)
}

async fn time_ancestry(engine: &AncestryEngine, history: &History) -> anyhow::Result<Timing> {
    let mut timing = Timing { total: Duration::ZERO, worst: Duration::ZERO, inconclusive: 0 };
    let len = history.mainline.len();
    for i in 0..QUERIES_PER_SIZE {
        let lo = history.mainline[(i * 7919) % len];
        let hi = history.mainline[len - 1 - (i * 104_729) % len];
        let start = Instant::now();
        let result = engine.is_ancestor(lo, hi, None).await?;
        let elapsed = start.elapsed();
        timing.total += elapsed;
        timing.worst = timing.worst.max(elapsed);
        if let Ancestry::Inconclusive(_) = result {
            timing.inconclusive += 1;
        }
    }
    Ok(timing)
}

fn avg_us(timing: &Timing) -> f64 {
    timing.total.as_secs_f64() * 1e6 / QUERIES_PER_SIZE as f64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::auto_tuned();
    println!("Mergebase Ancestry Report");
    println!("=========================");
    println!(
        "shards={} batch_size={} cache={} bloom={}x{}",
        config.shard_count,
        config.batch_size,
        config.cache_capacity,
        config.bloom.num_bits,
        config.bloom.num_hashes
    );
    println!();
    println!(
        "{:<10} {:>10} {:>14} {:>14} {:>14} {:>8}",
        "Commits", "Build ms", "MB avg (us)", "MB worst (us)", "Anc avg (us)", "Incon."
    );
    println!("{:-<75}", "");

    let mut last = None;
    for size in [1_000, 10_000, 50_000] {
        eprint!("Measuring {}... ", size);
        let engine = AncestryEngine::ephemeral(config.clone())?;

        let start = Instant::now();
        let history = build_history(&engine, size)?;
        engine.settle()?;
        let build_ms = start.elapsed().as_millis();

        let merge_bases = time_merge_bases(&engine, &history).await?;
        let ancestry = time_ancestry(&engine, &history).await?;

        println!(
            "{:<10} {:>10} {:>14.1} {:>14.1} {:>14.1} {:>8}",
            engine.node_count(),
            build_ms,
            avg_us(&merge_bases),
            merge_bases.worst.as_secs_f64() * 1e6,
            avg_us(&ancestry),
            merge_bases.inconclusive + ancestry.inconclusive
        );
        eprintln!("done");
        last = Some(engine);
    }

    let Some(engine) = last else {
        return Ok(());
    };
    let snap = engine.metrics().snapshot();
    println!();
    println!("Metrics (largest graph)");
    println!("{:-<40}", "");
    println!("{:<24} {:>14}", "queries", snap.query_count);
    println!("{:<24} {:>14}", "p50 / p99 ms", format!("{} / {}", snap.query_p50_ms, snap.query_p99_ms));
    println!("{:<24} {:>14}", "bloom rejects", snap.bloom_rejects);
    println!("{:<24} {:>14}", "generation rejects", snap.generation_rejects);
    println!("{:<24} {:>14}", "batches issued", snap.batches_issued);
    println!("{:<24} {:>14}", "cache hits", snap.cache_hits);
    println!("{:<24} {:>14}", "timeouts", snap.timeouts);
    println!("{:<24} {:>14}", "nodes indexed", snap.nodes_indexed);
    println!("{:<24} {:>14}", "index waves", snap.index_waves);
    for stat in &snap.op_stats {
        println!("{:<24} {:>8} x {:>3} ms", stat.operation, stat.count, stat.avg_ms);
    }
    for shard in engine.shard_stats() {
        println!("shard {:02}: {:>8} nodes, {:>8} reads", shard.shard_id, shard.node_count, shard.reads_served);
    }
    Ok(())
}
