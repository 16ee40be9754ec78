//! Engine lifecycle: budgets, pause/resume/terminate, asynchronous sites
//! and uncaught errors.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use braid::test_support::{
    fan_out, run_graph, run_graph_with, start_engine, test_sites, test_sites_with_hold,
};
use braid::{
    prelude, Arg, Capability, Def, EngineConfig, EngineError, GraphBuilder, ReturnHandle,
    RunOutcome, Site, StepOutcome, Value,
};

// ============================================================================
// Budgets
// ============================================================================

#[test]
fn token_budget_exhaustion_is_fatal() {
    let mut g = GraphBuilder::new();
    let stop = g.stop();
    let values: Vec<i64> = (0..16).collect();
    let root = fan_out(&mut g, &values, stop);
    let config = EngineConfig::default().with_max_tokens(4);

    let report = run_graph_with(config, test_sites(), g.finish(root));
    assert_eq!(report.outcome, Err(EngineError::TokenLimitExceeded { limit: 4 }));
    assert_eq!(report.stats.live_tokens, 0);
    assert!(report.stats.peak_tokens <= 4);
}

#[test]
fn fatal_error_is_reported_by_every_later_step() {
    let mut g = GraphBuilder::new();
    let stop = g.stop();
    let root = fan_out(&mut g, &[1, 2, 3, 4], stop);
    let config = EngineConfig::default().with_max_tokens(2);
    let (mut engine, _sink) = start_engine(config, test_sites(), g.finish(root));

    let err = engine.run().unwrap_err();
    assert_eq!(err, EngineError::TokenLimitExceeded { limit: 2 });
    assert_eq!(engine.step(), Err(err.clone()));
    assert_eq!(engine.run(), Err(err));
}

#[test]
fn unguarded_recursion_runs_into_the_token_budget() {
    // def spin() = spin() | spin(): every call forks, nothing is ever
    // published, and only the budget stops it
    let mut g = GraphBuilder::new();
    let ret = g.ret();
    let stop = g.stop();
    let left = g.call(Arg::var(0), vec![], ret);
    let right = g.call(Arg::var(0), vec![], ret);
    let body = g.fork(left, right);
    let start = g.call(Arg::var(0), vec![], stop);
    let root = g.defs(vec![Def::named("spin", 0, body)], start);
    let config = EngineConfig::default().with_max_tokens(1_000);

    let report = run_graph_with(config, test_sites(), g.finish(root));
    assert_eq!(
        report.outcome,
        Err(EngineError::TokenLimitExceeded { limit: 1_000 })
    );
}

#[test]
fn publication_limit_stops_the_run() {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let root = fan_out(&mut g, &[1, 2, 3, 4, 5], publish);
    let config = EngineConfig::default().with_max_publications(2);

    let report = run_graph_with(config, test_sites(), g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::PublicationLimit));
    assert_eq!(report.published.len(), 2);
    assert_eq!(report.stats.publications, 2);
    assert_eq!(report.stats.live_tokens, 0);
}

#[test]
fn publication_limit_cancels_calls_in_flight() {
    let (sites, hold) = test_sites_with_hold();
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let held = g.call(Arg::site("Hold"), vec![], publish);
    let now = g.load(Arg::lit(1), publish);
    let root = g.fork(held, now);
    let config = EngineConfig::default().with_max_publications(1);
    let (mut engine, sink) = start_engine(config, sites, g.finish(root));

    assert_eq!(engine.run(), Ok(RunOutcome::PublicationLimit));
    assert_eq!(sink.published(), vec![Value::Int(1)]);
    assert_eq!(hold.held(), 1);
    assert_eq!(hold.cancelled(), 1);
    assert_eq!(engine.outstanding_site_calls(), 0);
}

#[test]
fn unreached_publication_limit_completes_normally() {
    let config = EngineConfig::default().with_max_publications(3);
    let report = run_graph_with(config, test_sites(), braid::test_support::fork_publish(1, 2));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published.len(), 2);
}

// ============================================================================
// Pause / Resume / Terminate
// ============================================================================

#[test]
fn paused_engine_does_not_step() {
    let (mut engine, sink) = start_engine(
        EngineConfig::default(),
        test_sites(),
        braid::test_support::fork_publish(1, 2),
    );
    engine.pause();
    assert_eq!(engine.step(), Ok(StepOutcome::Paused));
    assert_eq!(engine.step(), Ok(StepOutcome::Paused));
    assert!(sink.published().is_empty());
    assert_eq!(engine.stats().steps, 0);

    engine.resume();
    assert_eq!(engine.run(), Ok(RunOutcome::Completed));
    assert_eq!(sink.published().len(), 2);
}

#[test]
fn resume_from_another_thread_unblocks_run() {
    let (mut engine, sink) = start_engine(
        EngineConfig::default(),
        test_sites(),
        braid::test_support::fork_publish(1, 2),
    );
    let handle = engine.handle();
    handle.pause();
    let remote = handle.clone();
    let resumer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        remote.resume();
    });

    assert_eq!(engine.run(), Ok(RunOutcome::Completed));
    assert_eq!(sink.published().len(), 2);
    resumer.join().unwrap();
}

#[test]
fn terminate_from_another_thread_stops_a_waiting_run() {
    let (sites, hold) = test_sites_with_hold();
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let root = g.call(Arg::site("Hold"), vec![], publish);
    let (mut engine, sink) = start_engine(EngineConfig::default(), sites, g.finish(root));

    let handle = engine.handle();
    let terminator = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.terminate();
    });

    assert_eq!(engine.run(), Ok(RunOutcome::Terminated));
    assert!(sink.published().is_empty());
    assert_eq!(hold.cancelled(), 1);
    assert_eq!(engine.live_tokens(), 0);
    terminator.join().unwrap();
}

#[test]
fn terminate_wins_over_pause() {
    let (mut engine, _sink) = start_engine(
        EngineConfig::default(),
        test_sites(),
        braid::test_support::fork_publish(1, 2),
    );
    let handle = engine.handle();
    handle.pause();
    handle.terminate();
    assert_eq!(engine.run(), Ok(RunOutcome::Terminated));
}

// ============================================================================
// Asynchronous Sites
// ============================================================================

#[test]
fn timer_answers_after_the_immediate_branch() {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let a = g.call(Arg::site("Rwait"), vec![Arg::lit(20)], publish);
    let b = g.load(Arg::lit("first"), publish);
    let root = g.fork(a, b);
    let report = run_graph(g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    // The timer answers after the immediate branch has published
    assert_eq!(report.published, vec![Value::str("first"), Value::Signal]);
    assert_eq!(report.stats.site_calls, 1);
}

#[test]
fn disabled_capability_raises_instead_of_calling() {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let root = g.call(Arg::site("Rwait"), vec![Arg::lit(1)], publish);
    let config = EngineConfig::default().with_capabilities([Capability::Pure]);
    let report = run_graph_with(config, prelude::site_table(), g.finish(root));
    assert!(report.published.is_empty());
    assert_eq!(report.uncaught.len(), 1);
    assert!(matches!(&report.uncaught[0], Value::Tagged { tag, .. } if &**tag == "CapabilityDenied"));
}

#[test]
fn concurrent_waits_overlap_on_one_worker() {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let mut root = g.call(Arg::site("Rwait"), vec![Arg::lit(200)], publish);
    for _ in 0..3 {
        let wait = g.call(Arg::site("Rwait"), vec![Arg::lit(200)], publish);
        root = g.fork(wait, root);
    }
    let config = EngineConfig::default().with_blocking_workers(1);

    let started = Instant::now();
    let report = run_graph_with(config, prelude::site_table(), g.finish(root));
    let elapsed = started.elapsed();
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::Signal; 4]);
    assert!(elapsed < Duration::from_millis(600), "four waits took {elapsed:?}");
}

#[test]
fn cancelled_wait_does_not_hold_the_run() {
    // Rwait(10000) <x< loses to the immediate branch; the run must end
    // long before the wait would have
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let left = g.load(Arg::var(0), publish);
    let store = g.store();
    let slow = g.call(Arg::site("Rwait"), vec![Arg::lit(10_000)], store);
    let fast = g.load(Arg::lit("fast"), store);
    let right = g.fork(slow, fast);
    let root = g.pruning(left, right);

    let started = Instant::now();
    let report = run_graph(g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::str("fast")]);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Keeps the last value it was given and hands it back when called with no
/// arguments
#[derive(Clone, Default)]
struct Stash {
    slot: Arc<Mutex<Option<Value>>>,
}

impl Site for Stash {
    fn name(&self) -> &str {
        "Stash"
    }

    fn invoke(&self, args: &[Value], ret: ReturnHandle) {
        let Ok(mut slot) = self.slot.lock() else {
            ret.halt();
            return;
        };
        match args {
            [value] => {
                *slot = Some(value.clone());
                ret.resume(Value::Signal);
            }
            _ => match slot.clone() {
                Some(value) => ret.resume(value),
                None => ret.halt(),
            },
        }
    }
}

#[test]
fn closure_kept_by_a_site_survives_collection() {
    // (def f(x) = x; Stash(f) >> stop) | (Rwait(50) >> Stash() >g> g(7))
    // f is unreachable from any token once the left branch dies, and a
    // collection runs on every step
    let mut sites = prelude::site_table();
    sites.register(Stash::default());
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let stop = g.stop();
    let ret = g.ret();

    let identity = g.load(Arg::var(0), ret);
    let stash = g.call(Arg::site("Stash"), vec![Arg::var(0)], stop);
    let left = g.defs(vec![Def::named("f", 1, identity)], stash);

    let call_back = g.call(Arg::var(0), vec![Arg::lit(7)], publish);
    let bind_back = g.bind(call_back);
    let fetch = g.call(Arg::site("Stash"), vec![], bind_back);
    let bind_wait = g.bind(fetch);
    let right = g.call(Arg::site("Rwait"), vec![Arg::lit(50)], bind_wait);
    let root = g.fork(left, right);
    let config = EngineConfig::default().with_gc_interval(1);

    let report = run_graph_with(config, sites, g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::Int(7)]);
    assert!(report.stats.heap.collections > 0);
    assert_eq!(report.stats.heap.escaped, 1);
}

/// Drops its return handle without answering
struct Forgetful;

impl Site for Forgetful {
    fn name(&self) -> &str {
        "Forget"
    }

    fn invoke(&self, _args: &[Value], ret: ReturnHandle) {
        drop(ret);
    }
}

#[test]
fn dropped_return_handle_halts_the_caller() {
    let mut sites = test_sites();
    sites.register(Forgetful);
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let root = g.call(Arg::site("Forget"), vec![], publish);
    let report = run_graph_with(EngineConfig::default(), sites, g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert!(report.published.is_empty());
    assert!(report.uncaught.is_empty());
    assert_eq!(report.stats.live_tokens, 0);
}

#[test]
fn idle_engine_waits_for_outstanding_calls() {
    // The reader parks on the cell while the producer sits in a site call
    // that is answered only after the engine has gone idle
    let (sites, hold) = test_sites_with_hold();
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let left = g.load(Arg::var(0), publish);
    let store = g.store();
    let right = g.call(Arg::site("Hold"), vec![], store);
    let root = g.pruning(left, right);
    let (mut engine, sink) = start_engine(EngineConfig::default(), sites, g.finish(root));

    while engine.step() == Ok(StepOutcome::Progressed) {}
    assert!(!engine.is_quiescent());
    assert_eq!(engine.step(), Ok(StepOutcome::Idle));
    assert_eq!(engine.outstanding_site_calls(), 1);
    assert_eq!(engine.cell_waiters(), 1);

    hold.release_all(Value::Int(3));
    assert_eq!(engine.run(), Ok(RunOutcome::Completed));
    assert_eq!(sink.published(), vec![Value::Int(3)]);
    assert!(engine.is_quiescent());
}

// ============================================================================
// Uncaught Errors
// ============================================================================

#[test]
fn uncaught_error_kills_only_its_branch() {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let boom = g.call(Arg::site("Boom"), vec![Arg::lit("left failed")], publish);
    let fine = g.load(Arg::lit(1), publish);
    let root = g.fork(boom, fine);
    let report = run_graph(g.finish(root));
    assert_eq!(report.outcome, Ok(RunOutcome::Completed));
    assert_eq!(report.published, vec![Value::Int(1)]);
    assert_eq!(report.uncaught.len(), 1);
    assert_eq!(report.stats.uncaught_errors, 1);
}

#[test]
fn throw_inside_a_closure_reaches_the_caller_handler() {
    // def fail() = throw "inner"; catch (e -> e) { fail() }
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let ret = g.ret();
    let fail_body = g.throw(Arg::lit("inner"));
    let handler_body = g.load(Arg::var(0), ret);
    let pop = g.pop_handler(publish);
    let call = g.call(Arg::var(0), vec![], pop);
    let catch = g.catch(Def::new(1, handler_body), call, publish);
    let root = g.defs(vec![Def::named("fail", 0, fail_body)], catch);
    let report = run_graph(g.finish(root));
    assert_eq!(report.published, vec![Value::str("inner")]);
    assert!(report.uncaught.is_empty());
}
