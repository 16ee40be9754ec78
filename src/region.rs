//! Regions: the structured-concurrency tree
//!
//! Every token belongs to exactly one region, and regions nest. Combinators
//! that need scoped cancellation or completion detection open a child region:
//! pruning runs its producer in one, otherwise runs its left side in one, and
//! catch runs its protected body in one.
//!
//! State machine:
//! ```text
//! Active ──(last token / child leaves)──────────────▶ Done
//!   │                                                  ▲
//!   └──(cancel)──▶ Cancelling ──(children cancelled)───┘
//! ```
//! A region leaves `Active` exactly once, so natural completion and
//! cancellation can never both take effect. This table only does the
//! bookkeeping; the engine kills the tokens and runs the close hooks that
//! [`RegionTable::cancel`] and [`RegionTable::remove_token`] hand back.

use std::collections::BTreeSet;

use crate::arena::{Arena, ArenaIndex};
use crate::runtime::TokenId;
use crate::value::CellId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub(crate) ArenaIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Active,
    Cancelling,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// The whole run
    Root,
    /// Producer side of a pruning combinator, tied to the cell it resolves
    Pruning { cell: CellId },
    /// Left side of an otherwise combinator
    Otherwise {
        /// Parked right-hand token, present until it is started or suppressed
        fallback: Option<TokenId>,
    },
    /// Protected body of a catch
    Catch,
}

#[derive(Debug)]
pub struct Region {
    pub parent: Option<RegionId>,
    pub kind: RegionKind,
    pub state: RegionState,
    tokens: BTreeSet<TokenId>,
    children: BTreeSet<RegionId>,
}

impl Region {
    fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.children.is_empty()
    }
}

/// A region that just reached `Done`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedRegion {
    pub id: RegionId,
    pub kind: RegionKind,
    /// True if it was cancelled, false if its last inhabitant left
    pub cancelled: bool,
}

/// Everything a cancellation took down
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Cancellation {
    /// Tokens that were inside the cancelled subtree; the engine must discard
    /// them without processing
    pub tokens: Vec<TokenId>,
    /// Regions closed by the cancellation itself, and then any ancestors that
    /// completed naturally because the subtree went away
    pub closed: Vec<ClosedRegion>,
}

#[derive(Debug, Default)]
pub struct RegionTable {
    regions: Arena<Region>,
    opened: u64,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&mut self) -> RegionId {
        self.opened += 1;
        RegionId(self.regions.insert(Region {
            parent: None,
            kind: RegionKind::Root,
            state: RegionState::Active,
            tokens: BTreeSet::new(),
            children: BTreeSet::new(),
        }))
    }

    /// Open a child scope. Returns `None` if the parent is no longer active.
    pub fn spawn_child(&mut self, parent: RegionId, kind: RegionKind) -> Option<RegionId> {
        if self.state(parent) != Some(RegionState::Active) {
            return None;
        }
        self.opened += 1;
        let id = RegionId(self.regions.insert(Region {
            parent: Some(parent),
            kind,
            state: RegionState::Active,
            tokens: BTreeSet::new(),
            children: BTreeSet::new(),
        }));
        if let Some(p) = self.regions.get_mut(parent.0) {
            p.children.insert(id);
        }
        Some(id)
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(id.0)
    }

    pub fn state(&self, id: RegionId) -> Option<RegionState> {
        self.regions.get(id.0).map(|r| r.state)
    }

    pub fn is_active(&self, id: RegionId) -> bool {
        self.state(id) == Some(RegionState::Active)
    }

    pub fn kind_mut(&mut self, id: RegionId) -> Option<&mut RegionKind> {
        self.regions.get_mut(id.0).map(|r| &mut r.kind)
    }

    pub fn parent(&self, id: RegionId) -> Option<RegionId> {
        self.regions.get(id.0).and_then(|r| r.parent)
    }

    /// Number of regions still held by the table (the root is kept after it
    /// closes)
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions ever opened, the root included
    pub fn opened(&self) -> u64 {
        self.opened
    }

    /// Enter `token` into `region`. Returns false if the region is no longer
    /// active, in which case the token must die.
    pub fn add_token(&mut self, region: RegionId, token: TokenId) -> bool {
        match self.regions.get_mut(region.0) {
            Some(r) if r.state == RegionState::Active => {
                r.tokens.insert(token);
                true
            }
            _ => false,
        }
    }

    /// Take `token` out of `region`, closing the region (and then any
    /// ancestors) if that left it empty.
    pub fn remove_token(&mut self, region: RegionId, token: TokenId) -> Vec<ClosedRegion> {
        let Some(r) = self.regions.get_mut(region.0) else {
            return Vec::new();
        };
        if !r.tokens.remove(&token) || r.state != RegionState::Active {
            return Vec::new();
        }
        let mut closed = Vec::new();
        self.close_if_empty(region, &mut closed);
        closed
    }

    /// Move `token` from one region to another. The token is entered into
    /// `to` before it leaves `from`, so an enclosing region never sees a
    /// moment where it looks empty. Returns `None` if `to` is not active.
    pub fn migrate(
        &mut self,
        token: TokenId,
        from: RegionId,
        to: RegionId,
    ) -> Option<Vec<ClosedRegion>> {
        if !self.add_token(to, token) {
            return None;
        }
        Some(self.remove_token(from, token))
    }

    /// Take the fallback token of an otherwise region whose left side has
    /// published. Idempotent: only the first call can return a token.
    pub fn suppress_fallback(&mut self, region: RegionId) -> Option<TokenId> {
        match self.kind_mut(region) {
            Some(RegionKind::Otherwise { fallback }) => fallback.take(),
            _ => None,
        }
    }

    /// Cancel `region` and everything under it.
    ///
    /// Returns `None` if the region is already cancelling or done, so racing
    /// cancellations of the same region take effect once.
    pub fn cancel(&mut self, region: RegionId) -> Option<Cancellation> {
        self.cancel_with(region, &mut |_: &mut [usize]| {})
    }

    /// [`cancel`](Self::cancel), visiting the children of each region in
    /// the order `visit` leaves their indices in
    pub fn cancel_with(
        &mut self,
        region: RegionId,
        visit: &mut dyn FnMut(&mut [usize]),
    ) -> Option<Cancellation> {
        if !self.is_active(region) {
            return None;
        }
        let mut out = Cancellation::default();
        self.cancel_subtree(region, &mut out, visit);

        if let Some(parent) = self.parent(region) {
            self.regions.remove(region.0);
            if let Some(p) = self.regions.get_mut(parent.0) {
                p.children.remove(&region);
                if p.state == RegionState::Active {
                    self.close_if_empty(parent, &mut out.closed);
                }
            }
        }
        Some(out)
    }

    fn cancel_subtree(
        &mut self,
        region: RegionId,
        out: &mut Cancellation,
        visit: &mut dyn FnMut(&mut [usize]),
    ) {
        let (tokens, children) = match self.regions.get_mut(region.0) {
            Some(r) if r.state == RegionState::Active => {
                r.state = RegionState::Cancelling;
                (
                    std::mem::take(&mut r.tokens),
                    std::mem::take(&mut r.children),
                )
            }
            _ => return,
        };
        out.tokens.extend(tokens);
        let mut children: Vec<RegionId> = children.into_iter().collect();
        reorder(&mut children, visit);
        for child in children {
            self.cancel_subtree(child, out, visit);
            self.regions.remove(child.0);
        }
        // Children are fully cancelled before this region reports done.
        if let Some(r) = self.regions.get_mut(region.0) {
            r.state = RegionState::Done;
            out.closed.push(ClosedRegion {
                id: region,
                kind: r.kind.clone(),
                cancelled: true,
            });
        }
    }

    fn close_if_empty(&mut self, start: RegionId, closed: &mut Vec<ClosedRegion>) {
        let mut current = start;
        loop {
            let Some(r) = self.regions.get_mut(current.0) else {
                return;
            };
            if r.state != RegionState::Active || !r.is_empty() {
                return;
            }
            r.state = RegionState::Done;
            closed.push(ClosedRegion {
                id: current,
                kind: r.kind.clone(),
                cancelled: false,
            });
            let parent = r.parent;
            // The root stays in the table so its final state stays observable.
            let Some(parent) = parent else {
                return;
            };
            self.regions.remove(current.0);
            match self.regions.get_mut(parent.0) {
                Some(p) => {
                    p.children.remove(&current);
                }
                None => return,
            }
            current = parent;
        }
    }

    /// Cells owned by pruning regions that are still open
    pub fn pruning_cells(&self) -> Vec<CellId> {
        self.regions
            .iter()
            .filter_map(|(_, r)| match r.kind {
                RegionKind::Pruning { cell } if r.state == RegionState::Active => Some(cell),
                _ => None,
            })
            .collect()
    }
}

/// Apply a visit order to `items`. Orders that are not a permutation of
/// the indices are ignored.
pub(crate) fn reorder<T: Copy>(items: &mut Vec<T>, visit: &mut dyn FnMut(&mut [usize])) {
    if items.len() < 2 {
        return;
    }
    let mut order: Vec<usize> = (0..items.len()).collect();
    visit(&mut order);
    let mut seen = vec![false; items.len()];
    let valid = order.iter().all(|&i| i < seen.len() && !std::mem::replace(&mut seen[i], true));
    if valid {
        *items = order.iter().map(|&i| items[i]).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(n: u32) -> TokenId {
        TokenId(ArenaIndex::new(n, 0))
    }

    /// Tokens in `region` and everything below it
    fn tokens_under(regions: &RegionTable, region: RegionId) -> Vec<TokenId> {
        let mut out = Vec::new();
        let mut stack = vec![region];
        while let Some(id) = stack.pop() {
            if let Some(r) = regions.get(id) {
                out.extend(r.tokens.iter().copied());
                stack.extend(r.children.iter().copied());
            }
        }
        out
    }

    #[test]
    fn last_token_leaving_closes_region_and_parent() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let child = regions.spawn_child(root, RegionKind::Catch).unwrap();
        assert!(regions.add_token(child, tok(1)));
        assert!(regions.add_token(child, tok(2)));

        assert!(regions.remove_token(child, tok(1)).is_empty());
        let closed = regions.remove_token(child, tok(2));
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].id, child);
        assert!(!closed[0].cancelled);
        assert_eq!(closed[1].id, root);
        assert_eq!(regions.state(root), Some(RegionState::Done));
        assert_eq!(regions.state(child), None);
    }

    #[test]
    fn cancel_collects_whole_subtree_once() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        regions.add_token(root, tok(0));
        let a = regions.spawn_child(root, RegionKind::Catch).unwrap();
        let b = regions.spawn_child(a, RegionKind::Catch).unwrap();
        regions.add_token(a, tok(1));
        regions.add_token(b, tok(2));
        regions.add_token(b, tok(3));

        let cancellation = regions.cancel(a).unwrap();
        let mut tokens = cancellation.tokens.clone();
        tokens.sort();
        assert_eq!(tokens, vec![tok(1), tok(2), tok(3)]);
        assert_eq!(cancellation.closed.len(), 2);
        assert!(cancellation.closed.iter().all(|c| c.cancelled));

        assert_eq!(regions.cancel(a), None);
        assert_eq!(regions.cancel(b), None);
        assert_eq!(tokens_under(&regions, root), vec![tok(0)]);
        assert!(regions.is_active(root));
    }

    #[test]
    fn cancelling_last_child_completes_parent() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let child = regions.spawn_child(root, RegionKind::Catch).unwrap();
        regions.add_token(child, tok(1));
        let cancellation = regions.cancel(child).unwrap();
        assert_eq!(cancellation.closed.last().map(|c| c.id), Some(root));
        assert_eq!(regions.state(root), Some(RegionState::Done));
    }

    #[test]
    fn remove_after_cancel_is_a_no_op() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let child = regions.spawn_child(root, RegionKind::Catch).unwrap();
        regions.add_token(root, tok(9));
        regions.add_token(child, tok(1));
        regions.cancel(child);
        assert!(regions.remove_token(child, tok(1)).is_empty());
        assert!(!regions.add_token(child, tok(2)));
    }

    #[test]
    fn migrate_never_exposes_empty_parent() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let child = regions.spawn_child(root, RegionKind::Catch).unwrap();
        regions.add_token(child, tok(1));
        let closed = regions.migrate(tok(1), child, root).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, child);
        assert!(regions.is_active(root));
        assert_eq!(tokens_under(&regions, root), vec![tok(1)]);
    }

    #[test]
    fn fallback_is_taken_once() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let semi = regions
            .spawn_child(
                root,
                RegionKind::Otherwise {
                    fallback: Some(tok(5)),
                },
            )
            .unwrap();
        assert_eq!(regions.suppress_fallback(semi), Some(tok(5)));
        assert_eq!(regions.suppress_fallback(semi), None);
        assert_eq!(
            regions.get(semi).map(|r| r.kind.clone()),
            Some(RegionKind::Otherwise { fallback: None })
        );
    }

    #[test]
    fn cancel_with_visits_children_in_the_given_order() {
        let mut regions = RegionTable::new();
        let root = regions.root();
        let top = regions.spawn_child(root, RegionKind::Catch).unwrap();
        let kids: Vec<RegionId> = (0..3)
            .map(|n| {
                let kid = regions.spawn_child(top, RegionKind::Catch).unwrap();
                regions.add_token(kid, tok(n));
                kid
            })
            .collect();
        regions.add_token(root, tok(9));

        let cancellation = regions.cancel_with(top, &mut |order: &mut [usize]| order.reverse()).unwrap();
        assert_eq!(cancellation.tokens, vec![tok(2), tok(1), tok(0)]);
        let closed: Vec<RegionId> = cancellation.closed.iter().map(|c| c.id).collect();
        assert_eq!(closed, vec![kids[2], kids[1], kids[0], top]);
        assert_eq!(regions.opened(), 5);
        assert!(regions.is_active(root));
    }
}
