//! Runtime: token storage and the ready queue

use std::collections::VecDeque;

use crate::arena::{Arena, ArenaIndex};
use crate::errors::EngineError;
use crate::token::{Blocker, Token, TokenState};

/// Unique token identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(pub(crate) ArenaIndex);

/// The token scheduler
///
/// Every live token, ready or parked, lives in one arena, so the arena's
/// length is the live count the budget is checked against. The ready queue
/// may hold ids of tokens that have since died or parked; those are skipped
/// when dequeuing.
#[derive(Debug)]
pub struct Scheduler {
    tokens: Arena<Token>,
    ready: VecDeque<TokenId>,
    max_tokens: usize,
    peak: usize,
    spawned: u64,
}

impl Scheduler {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            tokens: Arena::new(),
            ready: VecDeque::new(),
            max_tokens,
            peak: 0,
            spawned: 0,
        }
    }

    /// Admit a token. A ready token is queued; a parked one waits to be woken.
    pub fn spawn(&mut self, token: Token) -> Result<TokenId, EngineError> {
        if self.tokens.len() >= self.max_tokens {
            return Err(EngineError::TokenLimitExceeded {
                limit: self.max_tokens,
            });
        }
        let ready = token.state == TokenState::Ready;
        let id = TokenId(self.tokens.insert(token));
        if ready {
            self.ready.push_back(id);
        }
        self.spawned += 1;
        self.peak = self.peak.max(self.tokens.len());
        Ok(id)
    }

    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id.0)
    }

    pub fn get_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.get_mut(id.0)
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.tokens.contains(id.0)
    }

    /// Take a token out of the scheduler for good
    pub fn remove(&mut self, id: TokenId) -> Option<Token> {
        self.tokens.remove(id.0)
    }

    /// Dequeue the next ready token
    pub fn next_ready(&mut self) -> Option<TokenId> {
        while let Some(id) = self.ready.pop_front() {
            if self.is_ready(id) {
                return Some(id);
            }
        }
        None
    }

    /// Dequeue the `n`-th ready token (wrapping), leaving the others in order
    pub fn nth_ready(&mut self, n: usize) -> Option<TokenId> {
        self.compact();
        if self.ready.is_empty() {
            return None;
        }
        let at = n % self.ready.len();
        self.ready.remove(at)
    }

    /// Put a token that is still ready at the back of the queue
    pub fn requeue(&mut self, id: TokenId) {
        if self.is_ready(id) {
            self.ready.push_back(id);
        }
    }

    pub fn park(&mut self, id: TokenId, blocker: Blocker) {
        if let Some(token) = self.tokens.get_mut(id.0) {
            token.state = TokenState::Parked(blocker);
        }
    }

    /// Make a parked token ready again. Returns false if it is gone or was
    /// not parked.
    pub fn wake(&mut self, id: TokenId) -> bool {
        match self.tokens.get_mut(id.0) {
            Some(token) if matches!(token.state, TokenState::Parked(_)) => {
                token.state = TokenState::Ready;
                self.ready.push_back(id);
                true
            }
            _ => false,
        }
    }

    fn is_ready(&self, id: TokenId) -> bool {
        matches!(self.tokens.get(id.0), Some(t) if t.state == TokenState::Ready)
    }

    fn compact(&mut self) {
        let tokens = &self.tokens;
        self.ready
            .retain(|id| matches!(tokens.get(id.0), Some(t) if t.state == TokenState::Ready));
    }

    /// Number of live tokens, ready and parked
    pub fn live(&self) -> usize {
        self.tokens.len()
    }

    pub fn ready_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|(_, t)| t.state == TokenState::Ready)
            .count()
    }

    pub fn parked_count(&self) -> usize {
        self.live() - self.ready_count()
    }

    pub fn has_ready(&self) -> bool {
        self.ready.iter().any(|id| self.is_ready(*id))
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = (TokenId, &Token)> {
        self.tokens.iter().map(|(idx, t)| (TokenId(idx), t))
    }
}
