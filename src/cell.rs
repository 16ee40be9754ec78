//! Futures (cells)
//!
//! A cell is written at most once. Until then it queues the tokens that tried
//! to read it. The first `write` binds it and hands back every waiter in the
//! order it queued; `stop` ends it with no value and hands back the waiters so
//! the engine can kill them. Any later `write` or `stop` changes nothing.

use std::collections::{HashSet, VecDeque};

use crate::arena::Arena;
use crate::runtime::TokenId;
use crate::value::{CellId, Value};

#[derive(Debug)]
pub enum CellState {
    Unbound { waiters: VecDeque<TokenId> },
    Bound(Value),
    Stopped,
}

/// Result of reading a cell on behalf of a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Read {
    /// The cell is bound
    Ready(Value),
    /// The token was queued as a waiter; the caller must not requeue it
    Parked,
    /// The cell will never be bound; the reader should die
    Stopped,
}

/// Outcome of a `write` or `stop`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This call resolved the cell; these tokens were waiting, oldest first
    Released(Vec<TokenId>),
    /// The cell was already resolved; nothing happened
    AlreadyResolved,
}

#[derive(Debug, Default)]
pub struct CellTable {
    cells: Arena<CellState>,
}

impl CellTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> CellId {
        CellId(self.cells.insert(CellState::Unbound {
            waiters: VecDeque::new(),
        }))
    }

    pub fn state(&self, id: CellId) -> Option<&CellState> {
        self.cells.get(id.0)
    }

    /// The bound value, if any
    pub fn value(&self, id: CellId) -> Option<Value> {
        match self.cells.get(id.0)? {
            CellState::Bound(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Read on behalf of `token`, queueing it if the cell is unbound.
    /// A reclaimed cell reads as stopped.
    pub fn read(&mut self, id: CellId, token: TokenId) -> Read {
        match self.cells.get_mut(id.0) {
            Some(CellState::Bound(v)) => Read::Ready(v.clone()),
            Some(CellState::Unbound { waiters }) => {
                waiters.push_back(token);
                Read::Parked
            }
            Some(CellState::Stopped) | None => Read::Stopped,
        }
    }

    /// Bind the cell. Only the first resolution takes effect.
    pub fn write(&mut self, id: CellId, value: Value) -> Resolution {
        self.resolve(id, CellState::Bound(value))
    }

    /// End the cell without a value. Only the first resolution takes effect.
    pub fn stop(&mut self, id: CellId) -> Resolution {
        self.resolve(id, CellState::Stopped)
    }

    fn resolve(&mut self, id: CellId, terminal: CellState) -> Resolution {
        let Some(state) = self.cells.get_mut(id.0) else {
            return Resolution::AlreadyResolved;
        };
        if !matches!(state, CellState::Unbound { .. }) {
            return Resolution::AlreadyResolved;
        }
        match std::mem::replace(state, terminal) {
            CellState::Unbound { waiters } => Resolution::Released(waiters.into()),
            _ => unreachable!("checked unbound above"),
        }
    }

    /// Number of tokens queued on the cell
    pub fn waiter_count(&self, id: CellId) -> usize {
        match self.cells.get(id.0) {
            Some(CellState::Unbound { waiters }) => waiters.len(),
            _ => 0,
        }
    }

    /// Drop a waiter that died before the cell was resolved
    pub fn forget(&mut self, id: CellId, token: TokenId) {
        if let Some(CellState::Unbound { waiters }) = self.cells.get_mut(id.0) {
            waiters.retain(|t| *t != token);
        }
    }

    /// Tokens queued across every cell
    pub fn total_waiters(&self) -> usize {
        self.cells
            .iter()
            .map(|(_, state)| match state {
                CellState::Unbound { waiters } => waiters.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Free every cell not in `reachable`
    pub fn sweep(&mut self, reachable: &HashSet<CellId>) -> usize {
        self.cells.retain(|idx, _| reachable.contains(&CellId(idx)))
    }
}
