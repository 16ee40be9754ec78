//! Tokens: the unit of execution
//!
//! A token is a position in the graph plus everything needed to continue from
//! there: its environment, the region it belongs to, the return linkage of the
//! call it is inside, the exception handlers installed around it, and the
//! value produced by the last node. Tokens are cheap to copy; forking copies
//! the handles, never the data behind them.

use std::rc::Rc;

use crate::env::Env;
use crate::graph::NodeId;
use crate::region::RegionId;
use crate::value::{CellId, ClosureId, Value};

/// A return address: where a call continues once the callee publishes.
///
/// Continuations form a persistent linked list. A tail call reuses the
/// caller's continuation instead of pushing a new one, which keeps
/// self-recursive and mutually recursive loops in constant space.
#[derive(Debug)]
pub struct Continuation {
    pub next: NodeId,
    pub env: Env,
    pub parent: Option<Rc<Continuation>>,
    /// Number of continuations in this chain, this one included
    pub depth: usize,
}

impl Continuation {
    pub fn push(next: NodeId, env: Env, parent: Option<Rc<Continuation>>) -> Rc<Continuation> {
        let depth = parent.as_ref().map_or(0, |p| p.depth) + 1;
        Rc::new(Continuation {
            next,
            env,
            parent,
            depth,
        })
    }
}

// Deep non-tail recursion builds long chains; unlink them iteratively so
// dropping one cannot overflow the host stack.
impl Drop for Continuation {
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(rc) = next {
            match Rc::try_unwrap(rc) {
                Ok(mut cont) => next = cont.parent.take(),
                Err(_) => break,
            }
        }
    }
}

/// An installed exception handler
#[derive(Debug)]
pub struct HandlerFrame {
    pub handler: ClosureId,
    /// Where the handler's publications continue
    pub next: NodeId,
    /// Environment, caller and region of the token that installed the handler
    pub env: Env,
    pub caller: Option<Rc<Continuation>>,
    pub region: RegionId,
    pub parent: Option<Rc<HandlerFrame>>,
}

/// Why a parked token is not in the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// Waiting for a cell to be resolved
    Cell(CellId),
    /// Waiting for a site to reply
    Site,
    /// Fallback branch of an otherwise, waiting for the left side to finish
    Fallback(RegionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Ready,
    Parked(Blocker),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub node: NodeId,
    pub env: Env,
    pub region: RegionId,
    pub caller: Option<Rc<Continuation>>,
    pub handlers: Option<Rc<HandlerFrame>>,
    pub result: Value,
    pub state: TokenState,
}

impl Token {
    /// A fresh root token with nothing bound and no caller
    pub fn root(node: NodeId, region: RegionId) -> Self {
        Self {
            node,
            env: Env::EMPTY,
            region,
            caller: None,
            handlers: None,
            result: Value::Signal,
            state: TokenState::Ready,
        }
    }

    /// Copy this token to a new position
    pub fn fork_at(&self, node: NodeId) -> Self {
        Self {
            node,
            state: TokenState::Ready,
            ..self.clone()
        }
    }

    /// Length of the return linkage chain
    pub fn call_depth(&self) -> usize {
        self.caller.as_ref().map_or(0, |c| c.depth)
    }
}
