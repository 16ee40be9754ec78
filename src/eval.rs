//! The engine: drives tokens through the execution graph
//!
//! One `step` takes one ready token and executes the node it sits on. The
//! node either moves the token on (it goes to the back of the ready queue),
//! parks it on a cell, a site or a fallback, or kills it. Forks and
//! combinators admit new tokens; every token lives in exactly one region.
//!
//! Everything here runs on the engine's thread. Sites answer through a
//! channel, and the engine picks the answers up at the start of each step.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::blocking_pool::SharedPool;
use crate::cell::{CellTable, Read, Resolution};
use crate::config::EngineConfig;
use crate::control::EngineHandle;
use crate::env::{Env, Heap, HeapStats, Marker};
use crate::errors::{EngineError, SiteError};
use crate::graph::{Arg, Graph, Node, NodeId};
use crate::region::{reorder, ClosedRegion, RegionId, RegionKind, RegionState, RegionTable};
use crate::runtime::{Scheduler, TokenId};
use crate::site::{ReturnHandle, SiteOutcome, SiteReply, SiteTable};
use crate::sink::PublicationSink;
use crate::timer::SharedTimer;
use crate::token::{Blocker, Continuation, HandlerFrame, Token, TokenState};
use crate::value::{CellId, Value};

/// Result of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A token was processed
    Progressed,
    /// No token is ready; parked tokens may still be woken by site replies
    Idle,
    /// The engine is paused
    Paused,
    /// The root region is done; nothing will ever run again
    Finished,
}

/// How a call to [`Engine::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every token died and the root region closed
    Completed,
    /// Nothing is ready and no site call is outstanding, but `parked` tokens
    /// are still waiting on cells or fallbacks that can never be released
    Quiescent { parked: usize },
    /// The run was terminated
    Terminated,
    /// `max_publications` values were published and the run was stopped
    PublicationLimit,
}

/// Counters describing a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub steps: u64,
    pub live_tokens: usize,
    pub peak_tokens: usize,
    pub spawned_tokens: u64,
    pub peak_call_depth: usize,
    pub publications: u64,
    pub uncaught_errors: u64,
    pub site_calls: u64,
    pub regions: usize,
    /// Regions ever opened, the root included
    pub regions_opened: u64,
    /// Regions whose close hook has run
    pub regions_closed: u64,
    pub cells: usize,
    pub heap: HeapStats,
}

/// What happens to the token after its node ran
enum Flow {
    /// Still ready; goes to the back of the queue
    Continue,
    /// Parked or handed off; something else will wake it
    Parked,
    /// Dies
    Die,
}

/// Outcome of forcing futures among a node's operands
enum Forced {
    Ready(Vec<Value>),
    Parked(CellId),
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    steps: u64,
    peak_call_depth: usize,
    publications: u64,
    uncaught_errors: u64,
    site_calls: u64,
    regions_closed: u64,
}

/// Reorders the indices of what a cancellation is about to visit
pub type VisitOrder = Box<dyn FnMut(&mut [usize])>;

pub struct Engine {
    config: EngineConfig,
    graph: Option<Rc<Graph>>,
    heap: Heap,
    cells: CellTable,
    regions: RegionTable,
    scheduler: Scheduler,
    sites: SiteTable,
    sink: Box<dyn PublicationSink>,
    root: Option<RegionId>,
    /// Cancel flags of tokens waiting on a site reply
    pending: HashMap<TokenId, Arc<AtomicBool>>,
    reply_tx: Sender<SiteReply>,
    reply_rx: Receiver<SiteReply>,
    pool: SharedPool,
    timer: SharedTimer,
    control: EngineHandle,
    counters: Counters,
    fatal: Option<EngineError>,
    terminated: bool,
    /// Set when the publication limit stopped the run
    capped: bool,
    visit_order: Option<VisitOrder>,
}

impl Engine {
    pub fn new(config: EngineConfig, sites: SiteTable, sink: impl PublicationSink + 'static) -> Self {
        let (reply_tx, reply_rx) = mpsc::channel();
        let pool = SharedPool::new(config.blocking_workers);
        Self {
            scheduler: Scheduler::new(config.max_tokens),
            config,
            graph: None,
            heap: Heap::new(),
            cells: CellTable::new(),
            regions: RegionTable::new(),
            sites,
            sink: Box::new(sink),
            root: None,
            pending: HashMap::new(),
            reply_tx,
            reply_rx,
            pool,
            timer: SharedTimer::new(),
            control: EngineHandle::new(),
            counters: Counters::default(),
            fatal: None,
            terminated: false,
            capped: false,
            visit_order: None,
        }
    }

    /// Validate `graph` against the site table and admit the root token
    pub fn start(&mut self, graph: Graph) -> Result<(), EngineError> {
        if self.graph.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        graph.validate(|name| self.sites.contains(name))?;
        let root = self.regions.root();
        let entry = graph.root;
        tracing::info!(nodes = graph.len(), sites = self.sites.len(), "engine started");
        self.graph = Some(Rc::new(graph));
        self.root = Some(root);
        let admitted = self.spawn_in(Token::root(entry, root));
        self.guard(admitted).map(|_| ())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A handle for pausing, resuming or terminating from other threads
    pub fn handle(&self) -> EngineHandle {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Cancel the root region, killing every token, and finish the run
    pub fn terminate(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        if self.terminated {
            return;
        }
        self.terminated = true;
        tracing::info!(live = self.scheduler.live(), "terminating run");
        self.cancel_region(root);
    }

    /// Permute the order in which cancellations visit child regions and
    /// kill tokens. The outcome of a cancellation must not depend on it.
    pub fn set_visit_order(&mut self, order: impl FnMut(&mut [usize]) + 'static) {
        self.visit_order = Some(Box::new(order));
    }

    /// True when nothing can happen without outside input: no token is
    /// ready and no site call is outstanding
    pub fn is_quiescent(&self) -> bool {
        !self.scheduler.has_ready() && self.pending.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.root
            .map_or(false, |r| self.regions.state(r) == Some(RegionState::Done))
    }

    pub fn root_region(&self) -> Option<RegionId> {
        self.root
    }

    pub fn region_state(&self, region: RegionId) -> Option<RegionState> {
        self.regions.state(region)
    }

    /// Regions still open, the root included
    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    /// Tokens queued on unresolved cells
    pub fn cell_waiters(&self) -> usize {
        self.cells.total_waiters()
    }

    pub fn live_tokens(&self) -> usize {
        self.scheduler.live()
    }

    /// Site calls that have not been answered yet
    pub fn outstanding_site_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            steps: self.counters.steps,
            live_tokens: self.scheduler.live(),
            peak_tokens: self.scheduler.peak(),
            spawned_tokens: self.scheduler.spawned(),
            peak_call_depth: self.counters.peak_call_depth,
            publications: self.counters.publications,
            uncaught_errors: self.counters.uncaught_errors,
            site_calls: self.counters.site_calls,
            regions: self.regions.len(),
            regions_opened: self.regions.opened(),
            regions_closed: self.counters.regions_closed,
            cells: self.cells.len(),
            heap: self.heap.stats(),
        }
    }

    /// Process the token at the head of the ready queue
    pub fn step(&mut self) -> Result<StepOutcome, EngineError> {
        self.step_with(|s| s.next_ready())
    }

    /// Process the `n`-th ready token (wrapping) instead of the head
    pub fn step_nth(&mut self, n: usize) -> Result<StepOutcome, EngineError> {
        self.step_with(move |s| s.nth_ready(n))
    }

    fn step_with(
        &mut self,
        pick: impl FnOnce(&mut Scheduler) -> Option<TokenId>,
    ) -> Result<StepOutcome, EngineError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }
        if self.graph.is_none() {
            return Err(EngineError::NotStarted);
        }
        if self.control.terminate_requested() {
            self.terminate();
        }
        if self.control.is_paused() && !self.terminated {
            return Ok(StepOutcome::Paused);
        }
        let drained = self.drain_replies();
        self.guard(drained)?;

        let Some(id) = pick(&mut self.scheduler) else {
            return Ok(if self.is_finished() {
                StepOutcome::Finished
            } else {
                StepOutcome::Idle
            });
        };
        self.counters.steps += 1;
        let processed = self.process(id);
        self.guard(processed)?;
        self.maybe_collect();
        Ok(StepOutcome::Progressed)
    }

    /// Step until the run completes, goes quiescent or is terminated.
    ///
    /// While site calls are outstanding and nothing is ready this blocks on
    /// the reply channel, waking every `idle_poll_ms` to observe control
    /// requests. While paused it waits for a resume.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        let poll = Duration::from_millis(self.config.idle_poll_ms.max(1));
        loop {
            match self.step()? {
                StepOutcome::Progressed => {}
                StepOutcome::Finished => {
                    let outcome = if self.capped {
                        RunOutcome::PublicationLimit
                    } else if self.terminated {
                        RunOutcome::Terminated
                    } else {
                        RunOutcome::Completed
                    };
                    tracing::info!(?outcome, steps = self.counters.steps, "run finished");
                    return Ok(outcome);
                }
                StepOutcome::Paused => self.control.wait_while_paused(poll),
                StepOutcome::Idle => {
                    if self.pending.is_empty() {
                        let parked = self.scheduler.live();
                        tracing::info!(parked, "run quiescent");
                        return Ok(RunOutcome::Quiescent { parked });
                    }
                    match self.reply_rx.recv_timeout(poll) {
                        Ok(reply) => {
                            let delivered = self.deliver(reply);
                            self.guard(delivered)?;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            let err =
                                EngineError::Invariant("site reply channel disconnected".into());
                            return Err(self.fail(err));
                        }
                    }
                }
            }
        }
    }

    /// Run a collection now
    pub fn collect_garbage(&mut self) {
        let mut roots = Marker::new();
        for (_, token) in self.scheduler.iter() {
            roots.env(token.env);
            roots.value(&token.result);
            mark_continuations(&mut roots, token.caller.as_deref());
            let mut frame = token.handlers.as_deref();
            while let Some(f) = frame {
                roots.closure(f.handler);
                roots.env(f.env);
                mark_continuations(&mut roots, f.caller.as_deref());
                frame = f.parent.as_deref();
            }
        }
        for cell in self.regions.pruning_cells() {
            roots.cell(cell);
        }
        let before = self.heap.stats();
        let reachable = self.heap.collect(roots, |cell| self.cells.value(cell));
        let freed_cells = self.cells.sweep(&reachable);
        let after = self.heap.stats();
        tracing::debug!(
            frames = after.frames,
            closures = after.closures,
            reclaimed = after.reclaimed - before.reclaimed,
            freed_cells,
            "collected"
        );
    }

    fn maybe_collect(&mut self) {
        let interval = self.config.gc_interval;
        if interval > 0 && self.heap.allocated_since_collect() >= interval {
            self.collect_garbage();
        }
    }

    /// Record a fatal error and take the whole run down
    fn fail(&mut self, err: EngineError) -> EngineError {
        tracing::error!(error = %err, "run failed");
        self.fatal = Some(err.clone());
        if let Some(root) = self.root {
            self.cancel_region(root);
        }
        err
    }

    fn guard<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        result.map_err(|err| self.fail(err))
    }

    // ------------------------------------------------------------------
    // Node processing
    // ------------------------------------------------------------------

    fn process(&mut self, id: TokenId) -> Result<(), EngineError> {
        let graph = self.graph.clone().ok_or(EngineError::NotStarted)?;
        let at = self.token(id)?.node;
        let node = graph
            .node(at)
            .ok_or_else(|| EngineError::Invariant(format!("token positioned at missing node {at}")))?;
        tracing::trace!(token = ?id, node = %at, "step");

        let flow = match node {
            Node::Call { callee, args, next } => {
                let env = self.token(id)?.env;
                let mut operands = Vec::with_capacity(args.len() + 1);
                operands.push(self.operand(env, callee, at)?);
                for arg in args {
                    operands.push(self.operand(env, arg, at)?);
                }
                match self.force(id, operands) {
                    Forced::Ready(mut values) => {
                        let target = values.remove(0);
                        self.invoke(&graph, id, target, values, *next)?
                    }
                    Forced::Parked(cell) => self.park_on(id, cell),
                    Forced::Stopped => Flow::Die,
                }
            }

            Node::Fork { left, right } => {
                let copy = self.token(id)?.fork_at(*right);
                self.spawn_in(copy)?;
                self.token_mut(id)?.node = *left;
                Flow::Continue
            }

            Node::Bind { next } => {
                let token = self.token(id)?;
                let (env, value) = (token.env, token.result.clone());
                let env = self.heap.bind(env, value);
                let token = self.token_mut(id)?;
                token.env = env;
                token.node = *next;
                Flow::Continue
            }

            Node::Unwind { width, next } => {
                let env = self.heap.unwind(self.token(id)?.env, *width).ok_or_else(|| {
                    EngineError::Invariant(format!("{at}: cannot unwind {width} frames"))
                })?;
                let token = self.token_mut(id)?;
                token.env = env;
                token.node = *next;
                Flow::Continue
            }

            Node::Load { value, next } => {
                let v = self.operand(self.token(id)?.env, value, at)?;
                match self.force(id, vec![v]) {
                    Forced::Ready(mut values) => {
                        let token = self.token_mut(id)?;
                        token.result = values.pop().unwrap_or(Value::Signal);
                        token.node = *next;
                        Flow::Continue
                    }
                    Forced::Parked(cell) => self.park_on(id, cell),
                    Forced::Stopped => Flow::Die,
                }
            }

            Node::Pruning { left, right } => {
                let outer = self.token(id)?.region;
                let cell = self.cells.alloc();
                let inner = self
                    .regions
                    .spawn_child(outer, RegionKind::Pruning { cell })
                    .ok_or_else(|| inactive_region(at))?;
                let mut producer = self.token(id)?.fork_at(*right);
                producer.region = inner;
                self.spawn_in(producer)?;

                let env = self.token(id)?.env;
                let env = self.heap.bind(env, Value::Future(cell));
                let token = self.token_mut(id)?;
                token.env = env;
                token.node = *left;
                Flow::Continue
            }

            Node::Store => {
                let token = self.token(id)?;
                let value = token.result.clone();
                let (region, cell) = self
                    .enclosing(token.region, |kind| match kind {
                        RegionKind::Pruning { cell } => Some(*cell),
                        _ => None,
                    })
                    .ok_or_else(|| EngineError::Invariant(format!("{at}: store outside a pruning")))?;
                if let Resolution::Released(waiters) = self.cells.write(cell, value) {
                    tracing::trace!(cell = ?cell, waiters = waiters.len(), "cell bound");
                    for waiter in waiters {
                        self.scheduler.wake(waiter);
                    }
                }
                self.cancel_region(region);
                Flow::Die
            }

            Node::Otherwise { left, right } => {
                let outer = self.token(id)?.region;
                let inner = self
                    .regions
                    .spawn_child(outer, RegionKind::Otherwise { fallback: None })
                    .ok_or_else(|| inactive_region(at))?;
                let mut fallback = self.token(id)?.fork_at(*right);
                fallback.state = TokenState::Parked(Blocker::Fallback(inner));
                if let Some(fallback_id) = self.spawn_in(fallback)? {
                    if let Some(RegionKind::Otherwise { fallback }) = self.regions.kind_mut(inner) {
                        *fallback = Some(fallback_id);
                    }
                }
                if self.move_token(id, inner)? {
                    self.token_mut(id)?.node = *left;
                    Flow::Continue
                } else {
                    Flow::Die
                }
            }

            Node::Leave { next } => {
                let token = self.token(id)?;
                let (region, ()) = self
                    .enclosing(token.region, |kind| {
                        matches!(kind, RegionKind::Otherwise { .. }).then_some(())
                    })
                    .ok_or_else(|| {
                        EngineError::Invariant(format!("{at}: leave outside an otherwise"))
                    })?;
                if let Some(fallback) = self.regions.suppress_fallback(region) {
                    tracing::trace!(region = ?region, "left side published; fallback suppressed");
                    self.kill(fallback);
                }
                let parent = self
                    .regions
                    .parent(region)
                    .ok_or_else(|| inactive_region(at))?;
                if self.move_token(id, parent)? {
                    self.token_mut(id)?.node = *next;
                    Flow::Continue
                } else {
                    Flow::Die
                }
            }

            Node::Defs { defs, next } => {
                let env = self.token(id)?.env;
                let (env, _) = self.heap.alloc_group(defs, env);
                let token = self.token_mut(id)?;
                token.env = env;
                token.node = *next;
                Flow::Continue
            }

            Node::Return => {
                let token = self.token_mut(id)?;
                let cont = token
                    .caller
                    .take()
                    .ok_or_else(|| EngineError::Invariant(format!("{at}: return with no caller")))?;
                token.node = cont.next;
                token.env = cont.env;
                token.caller = cont.parent.clone();
                Flow::Continue
            }

            Node::Catch {
                handler,
                body,
                next,
            } => {
                let token = self.token(id)?;
                let (env, outer) = (token.env, token.region);
                let closure = self.heap.alloc_closure(handler.clone(), env);
                let inner = self
                    .regions
                    .spawn_child(outer, RegionKind::Catch)
                    .ok_or_else(|| inactive_region(at))?;
                let token = self.token_mut(id)?;
                let frame = HandlerFrame {
                    handler: closure,
                    next: *next,
                    env,
                    caller: token.caller.clone(),
                    region: outer,
                    parent: token.handlers.take(),
                };
                token.handlers = Some(Rc::new(frame));
                if self.move_token(id, inner)? {
                    self.token_mut(id)?.node = *body;
                    Flow::Continue
                } else {
                    Flow::Die
                }
            }

            Node::PopHandler { next } => {
                let token = self.token_mut(id)?;
                let frame = token
                    .handlers
                    .take()
                    .ok_or_else(|| EngineError::Invariant(format!("{at}: no handler to pop")))?;
                token.handlers = frame.parent.clone();
                if self.move_token(id, frame.region)? {
                    self.token_mut(id)?.node = *next;
                    Flow::Continue
                } else {
                    Flow::Die
                }
            }

            Node::Throw { value } => {
                let v = self.operand(self.token(id)?.env, value, at)?;
                match self.force(id, vec![v]) {
                    Forced::Ready(mut values) => {
                        let error = values.pop().unwrap_or(Value::Signal);
                        self.throw(id, error)?
                    }
                    Forced::Parked(cell) => self.park_on(id, cell),
                    Forced::Stopped => Flow::Die,
                }
            }

            Node::Publish => {
                let value = self.token(id)?.result.clone();
                tracing::debug!(value = %value, "publish");
                self.counters.publications += 1;
                self.sink.on_publish(value);
                let limit = self.config.max_publications;
                if limit > 0 && self.counters.publications == limit {
                    tracing::info!(limit, "publication limit reached; stopping run");
                    self.capped = true;
                    self.terminate();
                }
                Flow::Die
            }

            Node::Stop => Flow::Die,
        };

        match flow {
            Flow::Continue => self.scheduler.requeue(id),
            Flow::Parked => {}
            Flow::Die => self.kill(id),
        }
        Ok(())
    }

    /// Apply a resolved callee to resolved arguments
    fn invoke(
        &mut self,
        graph: &Graph,
        id: TokenId,
        target: Value,
        args: Vec<Value>,
        next: NodeId,
    ) -> Result<Flow, EngineError> {
        match target {
            Value::Closure(closure_id) => {
                let closure = self.heap.closure(closure_id).ok_or_else(|| {
                    EngineError::Invariant(format!("call of reclaimed closure {closure_id:?}"))
                })?;
                let def = closure.def.clone();
                let mut env = closure.captured();
                if def.arity != args.len() {
                    let err = SiteError::ArityMismatch {
                        callee: def.name.unwrap_or_else(|| "closure".into()),
                        expected: def.arity,
                        got: args.len(),
                    };
                    return self.throw(id, err.to_value());
                }
                for arg in args {
                    env = self.heap.bind(env, arg);
                }

                let token = self.token(id)?;
                let caller = match graph.node(next) {
                    // The callee's return is the caller's return.
                    Some(Node::Return) => token.caller.clone(),
                    // Nothing ever continues past the callee.
                    Some(Node::Stop) => Some(Continuation::push(next, token.env, None)),
                    _ => Some(Continuation::push(next, token.env, token.caller.clone())),
                };
                let depth = caller.as_ref().map_or(0, |c| c.depth);
                if depth > self.config.max_call_depth {
                    return Err(EngineError::CallDepthExceeded {
                        limit: self.config.max_call_depth,
                    });
                }
                self.counters.peak_call_depth = self.counters.peak_call_depth.max(depth);

                let token = self.token_mut(id)?;
                token.node = def.body;
                token.env = env;
                token.caller = caller;
                Ok(Flow::Continue)
            }

            Value::Site(site_id) => {
                let (site, name) = match (self.sites.get(site_id), self.sites.name_of(site_id)) {
                    (Some(site), Some(name)) => (Arc::clone(site), name),
                    _ => {
                        return Err(EngineError::Invariant(format!(
                            "unregistered site {site_id:?}"
                        )))
                    }
                };
                let capability = site.capability();
                if !self.config.allows(capability) {
                    let err = SiteError::CapabilityDenied {
                        site: name.to_string(),
                        capability: capability.to_string(),
                    };
                    tracing::debug!(site = %name, %capability, "site call denied");
                    return self.throw(id, err.to_value());
                }

                for arg in &args {
                    self.heap.escape(arg);
                }
                let cancelled = Arc::new(AtomicBool::new(false));
                self.pending.insert(id, Arc::clone(&cancelled));
                self.token_mut(id)?.node = next;
                self.scheduler.park(id, Blocker::Site);
                self.counters.site_calls += 1;

                let handle = ReturnHandle::new(
                    id,
                    name,
                    self.reply_tx.clone(),
                    cancelled,
                    self.pool.clone(),
                    self.timer.clone(),
                );
                site.invoke(&args, handle);
                Ok(Flow::Parked)
            }

            other => self.throw(id, SiteError::NotCallable(other.type_name()).to_value()),
        }
    }

    /// Unwind `id` to its nearest handler. The thrower always dies; the
    /// handler runs as a fresh token in the region that installed it.
    fn throw(&mut self, id: TokenId, error: Value) -> Result<Flow, EngineError> {
        let Some(frame) = self.token(id)?.handlers.clone() else {
            tracing::warn!(token = ?id, error = %error, "uncaught error");
            self.counters.uncaught_errors += 1;
            self.sink.on_uncaught(&error);
            return Ok(Flow::Die);
        };
        let closure = self.heap.closure(frame.handler).ok_or_else(|| {
            EngineError::Invariant(format!("handler closure {:?} was reclaimed", frame.handler))
        })?;
        let body = closure.def.body;
        let env = closure.captured();
        let env = self.heap.bind(env, error);
        let handler = Token {
            node: body,
            env,
            region: frame.region,
            caller: Some(Continuation::push(frame.next, frame.env, frame.caller.clone())),
            handlers: frame.parent.clone(),
            result: Value::Signal,
            state: TokenState::Ready,
        };
        tracing::trace!(token = ?id, "error caught");
        self.spawn_in(handler)?;
        Ok(Flow::Die)
    }

    // ------------------------------------------------------------------
    // Operands and futures
    // ------------------------------------------------------------------

    fn operand(&self, env: Env, arg: &Arg, at: NodeId) -> Result<Value, EngineError> {
        match arg {
            Arg::Var(index) => self.heap.lookup(env, *index).cloned().ok_or_else(|| {
                EngineError::Invariant(format!("{at}: variable {index} is not bound"))
            }),
            Arg::Lit(lit) => Ok(lit.to_value()),
            Arg::Site(name) => self
                .sites
                .lookup(name)
                .map(Value::Site)
                .ok_or_else(|| EngineError::Invariant(format!("{at}: unknown site `{name}`"))),
        }
    }

    /// Replace every future among `values` with its bound value, queueing
    /// the token on the first unbound one
    fn force(&mut self, id: TokenId, mut values: Vec<Value>) -> Forced {
        for value in values.iter_mut() {
            while let Value::Future(cell) = *value {
                match self.cells.read(cell, id) {
                    Read::Ready(bound) => *value = bound,
                    Read::Parked => return Forced::Parked(cell),
                    Read::Stopped => return Forced::Stopped,
                }
            }
        }
        Forced::Ready(values)
    }

    fn park_on(&mut self, id: TokenId, cell: CellId) -> Flow {
        self.scheduler.park(id, Blocker::Cell(cell));
        Flow::Parked
    }

    // ------------------------------------------------------------------
    // Site replies
    // ------------------------------------------------------------------

    fn drain_replies(&mut self) -> Result<(), EngineError> {
        while let Ok(reply) = self.reply_rx.try_recv() {
            self.deliver(reply)?;
        }
        Ok(())
    }

    fn deliver(&mut self, reply: SiteReply) -> Result<(), EngineError> {
        let SiteReply { token: id, outcome } = reply;
        if self.pending.remove(&id).is_none() {
            tracing::trace!(token = ?id, "dropping reply for a dead token");
            return Ok(());
        }
        match outcome {
            SiteOutcome::Resume(value) => {
                self.token_mut(id)?.result = value;
                self.scheduler.wake(id);
            }
            SiteOutcome::Halt => self.kill(id),
            SiteOutcome::Raise(error) => {
                if let Flow::Die = self.throw(id, error)? {
                    self.kill(id);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tokens and regions
    // ------------------------------------------------------------------

    fn token(&self, id: TokenId) -> Result<&Token, EngineError> {
        self.scheduler
            .get(id)
            .ok_or_else(|| EngineError::Invariant(format!("token {id:?} is not live")))
    }

    fn token_mut(&mut self, id: TokenId) -> Result<&mut Token, EngineError> {
        self.scheduler
            .get_mut(id)
            .ok_or_else(|| EngineError::Invariant(format!("token {id:?} is not live")))
    }

    /// Admit `token` into its region. Returns `None` if the region has
    /// already closed, in which case the token is dropped.
    fn spawn_in(&mut self, token: Token) -> Result<Option<TokenId>, EngineError> {
        let region = token.region;
        if !self.regions.is_active(region) {
            return Ok(None);
        }
        let id = self.scheduler.spawn(token)?;
        self.regions.add_token(region, id);
        Ok(Some(id))
    }

    /// Move a token into `to`. Returns false if `to` has closed, in which
    /// case the token must die.
    fn move_token(&mut self, id: TokenId, to: RegionId) -> Result<bool, EngineError> {
        let from = self.token(id)?.region;
        match self.regions.migrate(id, from, to) {
            Some(closed) => {
                self.token_mut(id)?.region = to;
                self.on_closed(closed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Nearest region at or above `start` whose kind `select` accepts
    fn enclosing<T>(
        &self,
        start: RegionId,
        select: impl Fn(&RegionKind) -> Option<T>,
    ) -> Option<(RegionId, T)> {
        let mut current = Some(start);
        while let Some(id) = current {
            let region = self.regions.get(id)?;
            if let Some(found) = select(&region.kind) {
                return Some((id, found));
            }
            current = region.parent;
        }
        None
    }

    fn kill(&mut self, id: TokenId) {
        let closed = self.detach(id);
        self.on_closed(closed);
    }

    /// Remove a token from the scheduler and its region, returning any
    /// regions its departure closed
    fn detach(&mut self, id: TokenId) -> Vec<ClosedRegion> {
        let Some(token) = self.scheduler.remove(id) else {
            return Vec::new();
        };
        if let Some(flag) = self.pending.remove(&id) {
            flag.store(true, Ordering::Release);
        }
        if let TokenState::Parked(Blocker::Cell(cell)) = token.state {
            self.cells.forget(cell, id);
        }
        self.regions.remove_token(token.region, id)
    }

    fn cancel_region(&mut self, region: RegionId) {
        let mut order = self.visit_order.take();
        let cancellation = match order.as_mut() {
            Some(visit) => self.regions.cancel_with(region, &mut **visit),
            None => self.regions.cancel(region),
        };
        let Some(mut cancellation) = cancellation else {
            self.visit_order = order;
            return;
        };
        if let Some(visit) = order.as_mut() {
            reorder(&mut cancellation.tokens, &mut **visit);
        }
        self.visit_order = order;
        tracing::debug!(
            region = ?region,
            tokens = cancellation.tokens.len(),
            regions = cancellation.closed.len(),
            "region cancelled"
        );
        let mut closed = cancellation.closed;
        for token in cancellation.tokens {
            closed.extend(self.detach(token));
        }
        self.on_closed(closed);
    }

    /// Run the close hook of every region that just reached `Done`
    fn on_closed(&mut self, closed: Vec<ClosedRegion>) {
        let mut work: VecDeque<ClosedRegion> = closed.into();
        while let Some(region) = work.pop_front() {
            self.counters.regions_closed += 1;
            match region.kind {
                RegionKind::Root => {
                    tracing::debug!(cancelled = region.cancelled, "root region done");
                }
                RegionKind::Pruning { cell } => {
                    if let Resolution::Released(waiters) = self.cells.stop(cell) {
                        tracing::trace!(cell = ?cell, waiters = waiters.len(), "producer halted silently");
                        for waiter in waiters {
                            work.extend(self.detach(waiter));
                        }
                    }
                }
                RegionKind::Otherwise {
                    fallback: Some(fallback),
                } => {
                    if region.cancelled {
                        work.extend(self.detach(fallback));
                    } else {
                        tracing::trace!(region = ?region.id, "left side halted silently; starting fallback");
                        self.scheduler.wake(fallback);
                    }
                }
                RegionKind::Otherwise { fallback: None } | RegionKind::Catch => {}
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("started", &self.graph.is_some())
            .field("live_tokens", &self.scheduler.live())
            .field("regions", &self.regions.len())
            .field("pending_sites", &self.pending.len())
            .field("fatal", &self.fatal)
            .finish()
    }
}

fn mark_continuations(roots: &mut Marker, mut cont: Option<&Continuation>) {
    while let Some(c) = cont {
        roots.env(c.env);
        cont = c.parent.as_deref();
    }
}

fn inactive_region(at: NodeId) -> EngineError {
    EngineError::Invariant(format!("{at}: token's region is no longer active"))
}
