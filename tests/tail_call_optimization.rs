//! Tail call tests
//!
//! A call whose continuation is `Return` reuses the caller's continuation
//! instead of pushing a new one, so a tail-recursive loop runs with a
//! bounded continuation chain however many times it iterates. Calls in
//! non-tail position still grow the chain and hit the call-depth limit.

use braid::test_support::{counting_loop, even_odd, run_graph_with, test_sites};
use braid::{Arg, Def, EngineConfig, EngineError, GraphBuilder, RunOutcome, Value};

fn tight_config() -> EngineConfig {
    EngineConfig::default()
        .with_max_call_depth(8)
        .with_max_tokens(64)
        .with_gc_interval(10_000)
}

// ============================================================================
// Direct Tail Recursion
// ============================================================================

#[test]
fn tco_countdown_one_million() {
    let report = run_graph_with(tight_config(), test_sites(), counting_loop(1_000_000));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::str("done")]);
    let stats = report.stats;
    assert!(stats.peak_call_depth <= 2, "call depth grew to {}", stats.peak_call_depth);
    assert!(stats.peak_tokens <= 4, "peak tokens {}", stats.peak_tokens);
    assert!(stats.heap.collections > 0);
    // Frames of finished iterations are reclaimed as the loop runs
    assert!(stats.heap.frames < 40_000, "{} frames still live", stats.heap.frames);
}

#[test]
fn tco_countdown_zero() {
    let report = run_graph_with(tight_config(), test_sites(), counting_loop(0));
    assert_eq!(report.published, vec![Value::str("done")]);
}

// ============================================================================
// Mutual Recursion
// ============================================================================

#[test]
fn tco_mutual_recursion() {
    let report = run_graph_with(tight_config(), test_sites(), even_odd(100_001));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::Bool(false)]);
    assert!(report.stats.peak_call_depth <= 2);
}

#[test]
fn tco_mutual_recursion_even() {
    let report = run_graph_with(tight_config(), test_sites(), even_odd(10));
    assert_eq!(report.published, vec![Value::Bool(true)]);
}

// ============================================================================
// Non-Tail Recursion
// ============================================================================

/// `def down(n) = IsZero(n) >> 0 | Pred(n) >m> down(m) >r> Let(r)`: the
/// recursive call continues at `Bind`, not `Return`
fn non_tail_countdown(n: i64) -> braid::Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let ret = g.ret();

    let zero_value = g.load(Arg::lit(0), ret);
    let zero = g.call(Arg::site("IsZero"), vec![Arg::var(0)], zero_value);
    // After binding m: 0 = m, 1 = n, 2 = down
    let pass_on = g.call(Arg::site("Let"), vec![Arg::var(0)], ret);
    let bind_r = g.bind(pass_on);
    let recurse = g.call(Arg::var(2), vec![Arg::var(0)], bind_r);
    let bind_m = g.bind(recurse);
    let pred = g.call(Arg::site("Pred"), vec![Arg::var(0)], bind_m);
    let body = g.fork(zero, pred);

    let start = g.call(Arg::var(0), vec![Arg::lit(n)], publish);
    let root = g.defs(vec![Def::named("down", 1, body)], start);
    g.finish(root)
}

#[test]
fn non_tail_recursion_within_the_limit_completes() {
    let report = run_graph_with(tight_config(), test_sites(), non_tail_countdown(5));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::Int(0)]);
    assert_eq!(report.stats.peak_call_depth, 6);
}

#[test]
fn non_tail_recursion_past_the_limit_is_fatal() {
    let report = run_graph_with(tight_config(), test_sites(), non_tail_countdown(100));
    assert_eq!(report.outcome, Err(EngineError::CallDepthExceeded { limit: 8 }));
    assert!(report.published.is_empty());
    assert_eq!(report.stats.live_tokens, 0);
}
