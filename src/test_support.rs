//! Test support for exercising the engine.
//!
//! This module provides:
//! - Graph fixtures for the combinators (fork, pruning, otherwise, catch,
//!   recursive loops)
//! - Extra test sites (`IsZero`, `Pred`, `Hold`, `Boom`) on top of the prelude
//! - Helpers that run a graph to the end, optionally under a caller-chosen
//!   interleaving, and collect what it published
//!
//! # Philosophy
//! Most behaviour of the engine is only visible through what a run publishes
//! and what it leaves behind. The helpers here report both: the publications
//! and uncaught errors, and the engine's final counters, so tests can assert
//! on leaks (live tokens, open regions, cell waiters) as well as on results.

use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::errors::{EngineError, SiteError};
use crate::eval::{Engine, EngineStats, RunOutcome, StepOutcome};
use crate::graph::{Arg, Def, Graph, GraphBuilder, Literal, NodeId};
use crate::prelude;
use crate::site::{FnSite, ReturnHandle, Site, SiteOutcome, SiteTable};
use crate::sink::BufferSink;
use crate::value::Value;

// ============================================================================
// Test Sites
// ============================================================================

/// A site that never answers on its own. Handles are kept so a test can
/// answer them later or check that they were cancelled.
#[derive(Clone, Default)]
pub struct HoldSite {
    held: Arc<Mutex<Vec<ReturnHandle>>>,
}

impl HoldSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// How many held calls belong to tokens that have been cancelled
    pub fn cancelled(&self) -> usize {
        self.held
            .lock()
            .map(|h| h.iter().filter(|r| r.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// Answer every held call with `value`
    pub fn release_all(&self, value: Value) {
        let handles: Vec<ReturnHandle> = match self.held.lock() {
            Ok(mut held) => held.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.resume(value.clone());
        }
    }
}

impl Site for HoldSite {
    fn name(&self) -> &str {
        "Hold"
    }

    fn invoke(&self, _args: &[Value], ret: ReturnHandle) {
        if let Ok(mut held) = self.held.lock() {
            held.push(ret);
        }
    }
}

/// The prelude plus the sites the fixtures below call
pub fn test_sites() -> SiteTable {
    let mut sites = prelude::site_table();
    sites.register(FnSite::new("IsZero", |args| match args {
        [Value::Int(0)] => SiteOutcome::Resume(Value::Signal),
        _ => SiteOutcome::Halt,
    }));
    sites.register(FnSite::new("Pred", |args| match args {
        [Value::Int(n)] if *n > 0 => SiteOutcome::Resume(Value::Int(n - 1)),
        _ => SiteOutcome::Halt,
    }));
    sites.register(FnSite::new("Boom", |args| {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("boom")
            .to_string();
        SiteOutcome::Raise(SiteError::Custom(message).to_value())
    }));
    sites
}

/// `test_sites` plus a `Hold` site whose handles the caller can inspect
pub fn test_sites_with_hold() -> (SiteTable, HoldSite) {
    let mut sites = test_sites();
    let hold = HoldSite::new();
    sites.register(hold.clone());
    (sites, hold)
}

// ============================================================================
// Graph Fixtures
// ============================================================================

/// `Publish(a) | Publish(b)`
pub fn fork_publish(a: impl Into<Value>, b: impl Into<Value>) -> Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let left = constant(&mut g, a.into(), publish);
    let right = constant(&mut g, b.into(), publish);
    let root = g.fork(left, right);
    g.finish(root)
}

/// `x <x< (v1 | v2 | ...)` followed by publishing `x`: the producer forks
/// one branch per value and every branch stores
pub fn pruning_first_of(values: &[i64]) -> Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let left = g.load(Arg::var(0), publish);
    let store = g.store();
    let right = fan_out(&mut g, values, store);
    let root = g.pruning(left, right);
    g.finish(root)
}

/// `(left values, published in parallel) ; Publish(fallback)`
pub fn otherwise_fixture(left: &[i64], fallback: i64) -> Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let leave = g.leave(publish);
    let left_entry = if left.is_empty() {
        g.stop()
    } else {
        fan_out(&mut g, left, leave)
    };
    let right = g.load(Arg::lit(fallback), publish);
    let root = g.otherwise(left_entry, right);
    g.finish(root)
}

/// `def loop(n) = IsZero(n) >> "done" | Pred(n) >m> loop(m)`, called with
/// `n` and its result published. The recursive call is in tail position.
pub fn counting_loop(n: i64) -> Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let ret = g.ret();

    // Body environment: 0 = n, 1 = loop
    let done = g.load(Arg::lit("done"), ret);
    let zero = g.call(Arg::site("IsZero"), vec![Arg::var(0)], done);
    // After binding m: 0 = m, 1 = n, 2 = loop
    let recurse = g.call(Arg::var(2), vec![Arg::var(0)], ret);
    let bind = g.bind(recurse);
    let pred = g.call(Arg::site("Pred"), vec![Arg::var(0)], bind);
    let body = g.fork(zero, pred);

    let start = g.call(Arg::var(0), vec![Arg::lit(n)], publish);
    let root = g.defs(vec![Def::named("loop", 1, body)], start);
    g.finish(root)
}

/// Mutually recursive `even`/`odd` over `n`, publishing `true` or `false`
pub fn even_odd(n: i64) -> Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let ret = g.ret();
    // Group environment: 0 = odd, 1 = even. Bodies add n at index 0.
    let even_body = parity_body(&mut g, true, 1, ret);
    let odd_body = parity_body(&mut g, false, 2, ret);
    let start = g.call(Arg::var(1), vec![Arg::lit(n)], publish);
    let root = g.defs(
        vec![Def::named("even", 1, even_body), Def::named("odd", 1, odd_body)],
        start,
    );
    g.finish(root)
}

/// `IsZero(n) >> base | Pred(n) >m> other(m)` where `other` sits at
/// `other_index` once `m` is bound
fn parity_body(g: &mut GraphBuilder, base: bool, other_index: usize, ret: NodeId) -> NodeId {
    let at_zero = g.load(Arg::lit(base), ret);
    let zero = g.call(Arg::site("IsZero"), vec![Arg::var(0)], at_zero);
    let recurse = g.call(Arg::var(other_index + 1), vec![Arg::var(0)], ret);
    let bind = g.bind(recurse);
    let pred = g.call(Arg::site("Pred"), vec![Arg::var(0)], bind);
    g.fork(zero, pred)
}

/// A fork tree evaluating every value in `values` and continuing at `next`
pub fn fan_out(g: &mut GraphBuilder, values: &[i64], next: NodeId) -> NodeId {
    match values {
        [] => g.stop(),
        [one] => g.load(Arg::lit(*one), next),
        many => {
            let (left, right) = many.split_at(many.len() / 2);
            let left = fan_out(g, left, next);
            let right = fan_out(g, right, next);
            g.fork(left, right)
        }
    }
}

fn constant(g: &mut GraphBuilder, value: Value, next: NodeId) -> NodeId {
    match value {
        Value::Int(n) => g.load(Arg::lit(n), next),
        Value::Bool(b) => g.load(Arg::lit(b), next),
        Value::Str(s) => g.load(Arg::lit(&*s), next),
        _ => g.load(Arg::Lit(Literal::Signal), next),
    }
}

// ============================================================================
// Running
// ============================================================================

/// Everything a finished run left behind
#[derive(Debug)]
pub struct RunReport {
    pub outcome: Result<RunOutcome, EngineError>,
    pub published: Vec<Value>,
    pub uncaught: Vec<Value>,
    pub stats: EngineStats,
    pub open_regions: usize,
    pub cell_waiters: usize,
}

impl RunReport {
    fn collect(engine: &Engine, sink: &BufferSink, outcome: Result<RunOutcome, EngineError>) -> Self {
        Self {
            outcome,
            published: sink.published(),
            uncaught: sink.uncaught(),
            stats: engine.stats(),
            open_regions: engine.open_regions(),
            cell_waiters: engine.cell_waiters(),
        }
    }

    /// Publications rendered and sorted, for order-insensitive comparison
    pub fn published_sorted(&self) -> Vec<String> {
        sorted(&self.published)
    }
}

/// Render values and sort them, so multisets can be compared
pub fn sorted(values: &[Value]) -> Vec<String> {
    let mut out: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    out.sort();
    out
}

/// Start an engine over `graph` with a buffer sink
pub fn start_engine(config: EngineConfig, sites: SiteTable, graph: Graph) -> (Engine, BufferSink) {
    let sink = BufferSink::new();
    let mut engine = Engine::new(config, sites, sink.clone());
    if let Err(err) = engine.start(graph) {
        panic!("graph failed to start: {err}");
    }
    (engine, sink)
}

/// Run `graph` with the test sites and default configuration
pub fn run_graph(graph: Graph) -> RunReport {
    run_graph_with(EngineConfig::default(), test_sites(), graph)
}

pub fn run_graph_with(config: EngineConfig, sites: SiteTable, graph: Graph) -> RunReport {
    let (mut engine, sink) = start_engine(config, sites, graph);
    let outcome = engine.run();
    RunReport::collect(&engine, &sink, outcome)
}

/// Run `graph` choosing which ready token to step from `choices`, cycling
/// through them. Site answers must be synchronous.
pub fn run_interleaved(graph: Graph, sites: SiteTable, choices: &[usize]) -> RunReport {
    let (mut engine, sink) = start_engine(EngineConfig::default(), sites, graph);
    let outcome = drive_interleaved(&mut engine, choices);
    RunReport::collect(&engine, &sink, outcome)
}

/// Step `engine` with `step_nth`, taking choices round-robin from `choices`
pub fn drive_interleaved(engine: &mut Engine, choices: &[usize]) -> Result<RunOutcome, EngineError> {
    let mut turn = 0usize;
    loop {
        let choice = if choices.is_empty() {
            0
        } else {
            choices[turn % choices.len()]
        };
        turn += 1;
        match engine.step_nth(choice)? {
            StepOutcome::Progressed => {}
            StepOutcome::Finished => return Ok(RunOutcome::Completed),
            StepOutcome::Idle | StepOutcome::Paused => {
                return Ok(RunOutcome::Quiescent {
                    parked: engine.live_tokens(),
                })
            }
        }
    }
}
