//! Integration test: merge-base scenarios on small, hand-built histories.
//!
//! Validates that:
//! - Forks resolve to the fork point, merges to the shared ancestor
//! - An endpoint that is an ancestor of the other is the merge base, even
//!   when a shortcut edge reaches an older common ancestor first
//! - Disjoint histories report no common ancestor
//! - A zero deadline returns Inconclusive promptly instead of blocking
//! - Newly appended leaves become queryable
//! - Answers do not depend on argument order

use std::time::{Duration, Instant};

use mergebase::{
    Ancestry, AncestryEngine, EngineConfig, InconclusiveReason, MergeBase, NodeId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn engine() -> AncestryEngine {
    AncestryEngine::ephemeral(EngineConfig::default()).unwrap()
}

/// `A <- B <- C <- D` and `C <- E`.
struct Fork {
    a: NodeId,
    b: NodeId,
    c: NodeId,
    d: NodeId,
    e: NodeId,
}

fn fork(engine: &AncestryEngine) -> Fork {
    let a = engine.append(&[], b"A").unwrap();
    let b = engine.append(&[a], b"B").unwrap();
    let c = engine.append(&[b], b"C").unwrap();
    let d = engine.append(&[c], b"D").unwrap();
    let e = engine.append(&[c], b"E").unwrap();
    engine.settle().unwrap();
    Fork { a, b, c, d, e }
}

// ---------------------------------------------------------------------------
// Tests: Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fork_resolves_to_fork_point() {
    let engine = engine();
    let g = fork(&engine);

    let result = engine.find_common_ancestor(g.d, g.e, None).await.unwrap();
    assert_eq!(result, MergeBase::Found(g.c));
}

#[tokio::test]
async fn disjoint_roots_have_no_common_ancestor() {
    let engine = engine();
    let a = engine.append(&[], b"A").unwrap();
    let b = engine.append(&[a], b"B").unwrap();
    let x = engine.append(&[], b"X").unwrap();
    let y = engine.append(&[x], b"Y").unwrap();
    engine.settle().unwrap();

    let result = engine.find_common_ancestor(b, y, None).await.unwrap();
    assert_eq!(result, MergeBase::NoCommonAncestor);
    assert_eq!(engine.is_ancestor(a, y, None).await.unwrap(), Ancestry::NotAncestor);
}

#[tokio::test]
async fn merge_node_against_root() {
    let engine = engine();
    let g = fork(&engine);
    let m = engine.append(&[g.d, g.e], b"M").unwrap();
    engine.settle().unwrap();

    let result = engine.find_common_ancestor(m, g.a, None).await.unwrap();
    assert_eq!(result, MergeBase::Found(g.a));
    assert_eq!(engine.generation(m).unwrap(), 4);
    assert_eq!(engine.is_ancestor(g.e, m, None).await.unwrap(), Ancestry::Ancestor);
}

#[tokio::test]
async fn zero_deadline_is_inconclusive_and_prompt() {
    let engine = engine();
    let root = engine.append(&[], b"root").unwrap();
    let mut left = root;
    let mut right = root;
    for i in 0..2_000 {
        left = engine.append(&[left], format!("L{i}").as_bytes()).unwrap();
        right = engine.append(&[right], format!("R{i}").as_bytes()).unwrap();
    }
    engine.settle().unwrap();

    let start = Instant::now();
    let result = engine
        .find_common_ancestor(left, right, Some(Duration::ZERO))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    match result {
        MergeBase::Inconclusive(inc) => {
            assert_eq!(inc.reason, InconclusiveReason::DeadlineExceeded);
            assert!(inc.retry_budget > Duration::ZERO);
        }
        other => panic!("expected Inconclusive, got {:?}", other),
    }
    assert!(elapsed < Duration::from_millis(500), "zero-deadline query took {:?}", elapsed);
    assert_eq!(engine.metrics().snapshot().timeouts, 1);

    // With a real budget the same query resolves.
    let result = engine
        .find_common_ancestor(left, right, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(result, MergeBase::Found(root));
}

#[tokio::test]
async fn new_leaf_becomes_visible() {
    let engine = engine();
    let g = fork(&engine);

    let leaf = engine.append(&[g.e], b"leaf").unwrap();
    // Exact search works off the store even before the leaf is indexed.
    assert_eq!(
        engine.find_common_ancestor(leaf, g.d, None).await.unwrap(),
        MergeBase::Found(g.c)
    );

    assert!(engine.wait_indexed(leaf, Duration::from_secs(5)).await);
    assert_eq!(engine.generation(leaf).unwrap(), 4);
    assert!(engine.might_be_ancestor(g.b, leaf).unwrap());
    assert_eq!(engine.is_ancestor(g.b, leaf, None).await.unwrap(), Ancestry::Ancestor);
    assert_eq!(
        engine.find_common_ancestor(leaf, g.d, None).await.unwrap(),
        MergeBase::Found(g.c)
    );
}

// ---------------------------------------------------------------------------
// Tests: Symmetry and identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_is_own_merge_base() {
    let engine = engine();
    let g = fork(&engine);
    for id in [g.a, g.b, g.c, g.d, g.e] {
        assert_eq!(engine.find_common_ancestor(id, id, None).await.unwrap(), MergeBase::Found(id));
        assert_eq!(engine.is_ancestor(id, id, None).await.unwrap(), Ancestry::Ancestor);
    }
}

#[tokio::test]
async fn ancestor_endpoint_is_merge_base() {
    let engine = engine();
    let g = fork(&engine);
    assert_eq!(engine.find_common_ancestor(g.b, g.d, None).await.unwrap(), MergeBase::Found(g.b));
    assert_eq!(engine.find_common_ancestor(g.d, g.b, None).await.unwrap(), MergeBase::Found(g.b));
}

#[tokio::test]
async fn ancestor_endpoint_wins_over_shortcut_edge() {
    // p <- a <- x1 <- ... <- xk <- b, where b also names p directly.
    for k in [3, 5, 8] {
        for salt in 0..6 {
            let engine = engine();
            let p = engine.append(&[], format!("p-{salt}").as_bytes()).unwrap();
            let a = engine.append(&[p], format!("a-{salt}").as_bytes()).unwrap();
            let mut tip = a;
            for i in 0..k {
                tip = engine.append(&[tip], format!("x{i}-{salt}").as_bytes()).unwrap();
            }
            let b = engine.append(&[tip, p], format!("b-{salt}").as_bytes()).unwrap();
            engine.settle().unwrap();

            assert_eq!(engine.is_ancestor(a, b, None).await.unwrap(), Ancestry::Ancestor);
            assert_eq!(
                engine.find_common_ancestor(a, b, None).await.unwrap(),
                MergeBase::Found(a),
                "k = {k}, salt = {salt}"
            );
            assert_eq!(
                engine.find_common_ancestor(b, a, None).await.unwrap(),
                MergeBase::Found(a),
                "k = {k}, salt = {salt}"
            );
        }
    }
}

#[tokio::test]
async fn criss_cross_is_symmetric() {
    let engine = engine();
    let base = engine.append(&[], b"base").unwrap();
    let b1 = engine.append(&[base], b"b1").unwrap();
    let b2 = engine.append(&[base], b"b2").unwrap();
    let m1 = engine.append(&[b1, b2], b"m1").unwrap();
    let m2 = engine.append(&[b2, b1], b"m2").unwrap();
    engine.settle().unwrap();

    let forward = engine.find_common_ancestor(m1, m2, None).await.unwrap();
    let backward = engine.find_common_ancestor(m2, m1, None).await.unwrap();
    assert_eq!(forward, backward);
    let found = forward.found().expect("criss-cross has common ancestors");
    assert!(found == b1 || found == b2, "expected a maximal common ancestor");
}

#[tokio::test]
async fn all_pairs_symmetric_on_small_history() {
    let engine = engine();
    let g = fork(&engine);
    let m = engine.append(&[g.d, g.e], b"M").unwrap();
    let stray = engine.append(&[], b"stray").unwrap();
    engine.settle().unwrap();

    let ids = [g.a, g.b, g.c, g.d, g.e, m, stray];
    for x in ids {
        for y in ids {
            let xy = engine.find_common_ancestor(x, y, None).await.unwrap();
            let yx = engine.find_common_ancestor(y, x, None).await.unwrap();
            assert_eq!(xy, yx, "asymmetric result for {x} / {y}");
        }
    }
}
