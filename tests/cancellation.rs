//! Structured cancellation
//!
//! Cancelling a region must reach every token under it, wherever it is
//! parked: in the ready queue, on a cell, or inside a site call. Site calls
//! of cancelled tokens see their cancel flag set, and late answers are
//! dropped. None of it may depend on the order in which a cancellation
//! visits child regions and tokens.

use proptest::prelude::*;

use braid::test_support::{drive_interleaved, start_engine, test_sites_with_hold};
use braid::{
    Arg, Def, Engine, EngineConfig, GraphBuilder, NodeId, RunOutcome, StepOutcome, Value,
};

/// `x <x< (Hold() >> Store | ... | 7 >> Store)` publishing `x`, with
/// `held` branches calling the never-answering `Hold` site
fn pruning_over_held_calls(held: usize) -> braid::Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let left = g.load(Arg::var(0), publish);
    let store = g.store();
    let mut right = g.load(Arg::lit(7), store);
    for _ in 0..held {
        let hold = g.call(Arg::site("Hold"), vec![], store);
        right = g.fork(hold, right);
    }
    let root = g.pruning(left, right);
    g.finish(root)
}

/// A producer that nests a second pruning whose own producer only holds.
/// The inner reader parks on the inner cell until the outer store cancels
/// everything.
fn nested_pruning(held: usize) -> braid::Graph {
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let outer_left = g.load(Arg::var(0), publish);
    let store = g.store();

    let inner_reader = g.load(Arg::var(0), store);
    let mut inner_right: NodeId = g.call(Arg::site("Hold"), vec![], store);
    for _ in 1..held.max(1) {
        let hold = g.call(Arg::site("Hold"), vec![], store);
        inner_right = g.fork(hold, inner_right);
    }
    let inner = g.pruning(inner_reader, inner_right);

    let winner = g.load(Arg::lit(5), store);
    let outer_right = g.fork(inner, winner);
    let root = g.pruning(outer_left, outer_right);
    g.finish(root)
}

/// Nested scopes `depth` levels deep. Every level forks `width` ways into a
/// pruning, an otherwise and a catch in turn, and every leaf calls `Hold`
/// and continues at `done`.
fn region_tree(g: &mut GraphBuilder, depth: usize, width: usize, done: NodeId) -> NodeId {
    if depth == 0 {
        return g.call(Arg::site("Hold"), vec![], done);
    }
    let mut branches = Vec::with_capacity(width);
    for i in 0..width {
        let branch = match i % 3 {
            0 => {
                let stop = g.stop();
                let reader = g.load(Arg::var(0), stop);
                let store = g.store();
                let producer = region_tree(g, depth - 1, width, store);
                g.pruning(reader, producer)
            }
            1 => {
                let publish = g.publish();
                let leave = g.leave(publish);
                let left = region_tree(g, depth - 1, width, leave);
                let fallback = g.load(Arg::lit(0), publish);
                g.otherwise(left, fallback)
            }
            _ => {
                let publish = g.publish();
                let ret = g.ret();
                let handler = g.load(Arg::var(0), ret);
                let pop = g.pop_handler(publish);
                let body = region_tree(g, depth - 1, width, pop);
                g.catch(Def::new(1, handler), body, publish)
            }
        };
        branches.push(branch);
    }
    let mut entry = branches.pop().unwrap_or(done);
    while let Some(branch) = branches.pop() {
        entry = g.fork(branch, entry);
    }
    entry
}

/// A Fisher-Yates shuffle drawing its swaps from `seeds`, cycling
fn seeded_order(seeds: Vec<usize>) -> impl FnMut(&mut [usize]) {
    let mut next = 0usize;
    move |order: &mut [usize]| {
        for i in (1..order.len()).rev() {
            let seed = seeds.get(next % seeds.len().max(1)).copied().unwrap_or(0);
            next += 1;
            order.swap(i, seed % (i + 1));
        }
    }
}

fn run_until_idle(engine: &mut Engine) {
    while engine.step() == Ok(StepOutcome::Progressed) {}
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn terminate_is_complete_in_any_visit_order(
        depth in 1usize..4,
        width in 1usize..4,
        seeds in proptest::collection::vec(any::<usize>(), 1..16),
    ) {
        let (sites, hold) = test_sites_with_hold();
        let mut g = GraphBuilder::new();
        let publish = g.publish();
        let root = region_tree(&mut g, depth, width, publish);
        let (mut engine, sink) = start_engine(EngineConfig::default(), sites, g.finish(root));
        run_until_idle(&mut engine);
        prop_assert_eq!(hold.held(), width.pow(depth as u32));

        engine.set_visit_order(seeded_order(seeds));
        engine.terminate();

        prop_assert_eq!(engine.live_tokens(), 0);
        prop_assert_eq!(engine.cell_waiters(), 0);
        prop_assert_eq!(engine.outstanding_site_calls(), 0);
        prop_assert_eq!(hold.cancelled(), hold.held());
        prop_assert!(engine.is_finished());
        prop_assert_eq!(engine.open_regions(), 1);
        let stats = engine.stats();
        // Every region, the root included, ran its close hook exactly once
        prop_assert_eq!(stats.regions_closed, stats.regions_opened);
        prop_assert_eq!(engine.run(), Ok(RunOutcome::Terminated));
        prop_assert!(sink.published().is_empty());
    }

    #[test]
    fn store_cancels_a_region_tree_in_any_visit_order(
        depth in 1usize..4,
        width in 1usize..4,
        seeds in proptest::collection::vec(any::<usize>(), 1..16),
        choices in proptest::collection::vec(0usize..16, 1..24),
    ) {
        let (sites, hold) = test_sites_with_hold();
        let mut g = GraphBuilder::new();
        let publish = g.publish();
        let left = g.load(Arg::var(0), publish);
        let store = g.store();
        let tree = region_tree(&mut g, depth, width, store);
        let winner = g.load(Arg::lit(5), store);
        let right = g.fork(tree, winner);
        let root = g.pruning(left, right);
        let (mut engine, sink) = start_engine(EngineConfig::default(), sites, g.finish(root));
        engine.set_visit_order(seeded_order(seeds));

        let outcome = drive_interleaved(&mut engine, &choices);
        prop_assert_eq!(outcome, Ok(RunOutcome::Completed));
        prop_assert_eq!(sink.published(), vec![Value::Int(5)]);
        prop_assert_eq!(engine.live_tokens(), 0);
        prop_assert_eq!(engine.cell_waiters(), 0);
        prop_assert_eq!(engine.outstanding_site_calls(), 0);
        prop_assert_eq!(hold.cancelled(), hold.held());
        prop_assert_eq!(engine.open_regions(), 1);
        let stats = engine.stats();
        prop_assert_eq!(stats.regions_closed, stats.regions_opened);
    }

    #[test]
    fn store_cancels_every_held_call(
        held in 0usize..12,
        choices in proptest::collection::vec(0usize..16, 1..24),
    ) {
        let (sites, hold) = test_sites_with_hold();
        let (mut engine, sink) =
            start_engine(EngineConfig::default(), sites, pruning_over_held_calls(held));
        let outcome = drive_interleaved(&mut engine, &choices);

        prop_assert_eq!(outcome, Ok(RunOutcome::Completed));
        prop_assert_eq!(sink.published(), vec![Value::Int(7)]);
        prop_assert_eq!(engine.live_tokens(), 0);
        prop_assert_eq!(engine.outstanding_site_calls(), 0);
        prop_assert_eq!(engine.open_regions(), 1);
        // Whatever reached Hold before the store saw its cancel flag set
        prop_assert_eq!(hold.cancelled(), hold.held());
    }

    #[test]
    fn outer_store_cancels_nested_regions(
        held in 1usize..6,
        choices in proptest::collection::vec(0usize..16, 1..24),
    ) {
        let (sites, hold) = test_sites_with_hold();
        let (mut engine, sink) =
            start_engine(EngineConfig::default(), sites, nested_pruning(held));
        let outcome = drive_interleaved(&mut engine, &choices);

        prop_assert_eq!(outcome, Ok(RunOutcome::Completed));
        prop_assert_eq!(sink.published(), vec![Value::Int(5)]);
        prop_assert_eq!(engine.live_tokens(), 0);
        prop_assert_eq!(engine.cell_waiters(), 0);
        prop_assert_eq!(engine.open_regions(), 1);
        prop_assert_eq!(hold.cancelled(), hold.held());
    }
}

#[test]
fn late_answers_to_cancelled_calls_are_dropped() {
    let (sites, hold) = test_sites_with_hold();
    let (mut engine, sink) =
        start_engine(EngineConfig::default(), sites, pruning_over_held_calls(3));
    assert_eq!(engine.run(), Ok(RunOutcome::Completed));
    let reached = hold.held();
    assert_eq!(hold.cancelled(), reached);

    hold.release_all(Value::Int(99));
    assert_eq!(engine.step(), Ok(braid::StepOutcome::Finished));
    assert_eq!(sink.published(), vec![Value::Int(7)]);
}

#[test]
fn terminate_cancels_everything_in_flight() {
    let (sites, hold) = test_sites_with_hold();
    let mut g = GraphBuilder::new();
    let publish = g.publish();
    let a = g.call(Arg::site("Hold"), vec![], publish);
    let b = g.call(Arg::site("Hold"), vec![], publish);
    let root = g.fork(a, b);
    let (mut engine, sink) = start_engine(EngineConfig::default(), sites, g.finish(root));

    for _ in 0..3 {
        engine.step().unwrap();
    }
    assert_eq!(hold.held(), 2);
    assert_eq!(engine.outstanding_site_calls(), 2);

    engine.terminate();
    assert_eq!(engine.live_tokens(), 0);
    assert_eq!(hold.cancelled(), 2);
    assert!(engine.is_finished());
    assert_eq!(engine.run(), Ok(RunOutcome::Terminated));
    assert!(sink.published().is_empty());
}
