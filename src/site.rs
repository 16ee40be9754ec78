//! Sites: external operations invoked by `Call`
//!
//! A site receives its resolved arguments and a [`ReturnHandle`]. It must
//! eventually answer exactly once, by resuming with a value, halting, or
//! raising an error value. It may answer before `invoke` returns (a
//! synchronous site) or later from any thread (an asynchronous one). Sites
//! that block must not do so on the engine thread; [`BlockingSite`] runs its
//! work on the blocking pool instead, and a site that only needs to wait can
//! hand its answer to the timer with [`ReturnHandle::answer_after`].
//!
//! The handle is consumed by whichever answer is given, so a second answer is
//! a compile error. Dropping it unanswered counts as a halt.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blocking_pool::SharedPool;
use crate::errors::SiteError;
use crate::runtime::TokenId;
use crate::timer::SharedTimer;
use crate::value::{SiteId, Value};

/// Category of effect a site has; the engine only invokes sites whose
/// capability is enabled in its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// No observable effect beyond the answer
    Pure,
    /// Waits on the clock
    Time,
    /// Touches files, sockets or the console
    Io,
    /// Spawns or signals operating-system processes
    Process,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Pure,
        Capability::Time,
        Capability::Io,
        Capability::Process,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Pure => "pure",
            Capability::Time => "time",
            Capability::Io => "io",
            Capability::Process => "process",
        };
        write!(f, "{}", name)
    }
}

/// A site's answer to one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteOutcome {
    /// Publish a value to the caller
    Resume(Value),
    /// Produce nothing; the calling token dies
    Halt,
    /// Throw an error value at the calling token
    Raise(Value),
}

impl From<Result<Value, SiteError>> for SiteOutcome {
    fn from(result: Result<Value, SiteError>) -> Self {
        match result {
            Ok(v) => SiteOutcome::Resume(v),
            Err(e) => SiteOutcome::Raise(e.to_value()),
        }
    }
}

/// An answer addressed to a parked token
#[derive(Debug)]
pub struct SiteReply {
    pub token: TokenId,
    pub outcome: SiteOutcome,
}

/// The one-shot channel back to the calling token
pub struct ReturnHandle {
    token: TokenId,
    site: Arc<str>,
    sender: Option<Sender<SiteReply>>,
    cancelled: Arc<AtomicBool>,
    pool: SharedPool,
    timer: SharedTimer,
}

impl ReturnHandle {
    pub(crate) fn new(
        token: TokenId,
        site: Arc<str>,
        sender: Sender<SiteReply>,
        cancelled: Arc<AtomicBool>,
        pool: SharedPool,
        timer: SharedTimer,
    ) -> Self {
        Self {
            token,
            site,
            sender: Some(sender),
            cancelled,
            pool,
            timer,
        }
    }

    pub fn resume(mut self, value: Value) {
        self.send(SiteOutcome::Resume(value));
    }

    pub fn halt(mut self) {
        self.send(SiteOutcome::Halt);
    }

    pub fn raise(mut self, error: Value) {
        self.send(SiteOutcome::Raise(error));
    }

    pub fn answer(mut self, outcome: SiteOutcome) {
        self.send(outcome);
    }

    /// True once the calling token has been cancelled; its answer will be
    /// dropped, so long-running work may stop early
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Name of the site this handle answers for
    pub fn site_name(&self) -> &str {
        &self.site
    }

    /// Run `work` on the blocking pool and answer with its outcome
    pub fn spawn_blocking<F>(self, work: F)
    where
        F: FnOnce() -> SiteOutcome + Send + 'static,
    {
        let pool = self.pool.clone();
        pool.get().execute(Box::new(move || {
            if self.is_cancelled() {
                self.halt();
            } else {
                self.answer(work());
            }
        }));
    }

    /// Answer with `outcome` once `delay` has passed. No thread is held
    /// while waiting, and the wait ends early with a halt if the caller is
    /// cancelled.
    pub fn answer_after(self, delay: Duration, outcome: SiteOutcome) {
        let timer = self.timer.clone();
        timer.get().schedule(delay, self, outcome);
    }

    fn send(&mut self, outcome: SiteOutcome) {
        if let Some(sender) = self.sender.take() {
            // The engine may be gone; a reply nobody waits for is dropped.
            let _ = sender.send(SiteReply {
                token: self.token,
                outcome,
            });
        }
    }
}

impl Drop for ReturnHandle {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::debug!(site = %self.site, "return handle dropped unanswered; halting caller");
            self.send(SiteOutcome::Halt);
        }
    }
}

impl fmt::Debug for ReturnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnHandle")
            .field("token", &self.token)
            .field("site", &self.site)
            .field("answered", &self.sender.is_none())
            .finish()
    }
}

/// An external operation callable from the graph
pub trait Site: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability {
        Capability::Pure
    }

    fn invoke(&self, args: &[Value], ret: ReturnHandle);
}

type SyncFn = dyn Fn(&[Value]) -> SiteOutcome + Send + Sync;

/// A synchronous site built from a closure
pub struct FnSite {
    name: String,
    capability: Capability,
    func: Box<SyncFn>,
}

impl FnSite {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> SiteOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capability: Capability::Pure,
            func: Box::new(func),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }
}

impl Site for FnSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn invoke(&self, args: &[Value], ret: ReturnHandle) {
        ret.answer((self.func)(args));
    }
}

type BlockingFn = dyn Fn(Vec<Value>) -> SiteOutcome + Send + Sync;

/// An asynchronous site whose work runs on the blocking pool
pub struct BlockingSite {
    name: String,
    capability: Capability,
    func: Arc<BlockingFn>,
}

impl BlockingSite {
    pub fn new<F>(name: impl Into<String>, capability: Capability, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> SiteOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capability,
            func: Arc::new(func),
        }
    }
}

impl Site for BlockingSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn invoke(&self, args: &[Value], ret: ReturnHandle) {
        let func = Arc::clone(&self.func);
        let args = args.to_vec();
        ret.spawn_blocking(move || func(args));
    }
}

/// Name-indexed table of sites available to a run
#[derive(Default)]
pub struct SiteTable {
    sites: Vec<Arc<dyn Site>>,
    names: Vec<Arc<str>>,
    by_name: HashMap<String, SiteId>,
}

impl SiteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site, replacing any earlier site with the same name
    pub fn register(&mut self, site: impl Site + 'static) -> SiteId {
        self.register_arc(Arc::new(site))
    }

    pub fn register_arc(&mut self, site: Arc<dyn Site>) -> SiteId {
        let name = site.name().to_string();
        if let Some(&id) = self.by_name.get(&name) {
            self.sites[id.0] = site;
            return id;
        }
        let id = SiteId(self.sites.len());
        self.sites.push(site);
        self.names.push(Arc::from(name.as_str()));
        self.by_name.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SiteId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SiteId) -> Option<&Arc<dyn Site>> {
        self.sites.get(id.0)
    }

    /// Shared copy of a site's name, for handles and diagnostics
    pub fn name_of(&self, id: SiteId) -> Option<Arc<str>> {
        self.names.get(id.0).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for SiteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteTable")
            .field("sites", &self.names())
            .finish()
    }
}
