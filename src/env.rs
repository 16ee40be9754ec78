//! Environments and closures
//!
//! An environment is a position in an append-only chain of frames. Binding a
//! variable prepends a frame; nothing is ever mutated in place, so any number
//! of tokens and closures can share a tail.
//!
//! Frames and closures live in the [`Heap`], addressed by generation-checked
//! handles. A group of mutually recursive closures refers to the frame that
//! binds them, which refers back to the closures. That cycle is just a pair
//! of indices here, and is reclaimed by the mark-sweep collector once nothing
//! outside the group reaches it.
//!
//! Closures and cells handed to a site escape the engine's view: the site
//! may keep them and give them back at any later point. They are pinned on
//! the way out and stay roots for the rest of the run.

use std::collections::HashSet;

use crate::arena::{Arena, ArenaIndex};
use crate::graph::Def;
use crate::value::{CellId, ClosureId, HeapRef, Value};

/// Handle to an environment frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) ArenaIndex);

/// A token's environment: the head of a frame chain, or empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Env(pub(crate) Option<FrameId>);

impl Env {
    pub const EMPTY: Env = Env(None);

    pub fn is_empty(self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug)]
struct Frame {
    slot: Value,
    parent: Env,
}

/// A callable value pairing a definition with the environment it captured
#[derive(Debug, Clone)]
pub struct Closure {
    pub def: Def,
    /// `None` only while a closure group is still being built
    captured: Option<Env>,
}

impl Closure {
    pub fn captured(&self) -> Env {
        self.captured.unwrap_or_default()
    }
}

/// Sizes reported by [`Heap::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub frames: usize,
    pub closures: usize,
    /// Closures and cells pinned because a site was given them
    pub escaped: usize,
    pub collections: u64,
    pub reclaimed: u64,
}

/// Arena storage for frames and closures
#[derive(Debug, Default)]
pub struct Heap {
    frames: Arena<Frame>,
    closures: Arena<Closure>,
    escaped: HashSet<HeapRef>,
    allocated_since_collect: usize,
    collections: u64,
    reclaimed: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a frame holding `value` to `env`
    pub fn bind(&mut self, env: Env, value: Value) -> Env {
        self.allocated_since_collect += 1;
        let id = self.frames.insert(Frame { slot: value, parent: env });
        Env(Some(FrameId(id)))
    }

    /// Look up De Bruijn index `index`; `None` if the chain is too short or
    /// refers to a reclaimed frame
    pub fn lookup(&self, env: Env, index: usize) -> Option<&Value> {
        let mut cur = env.0?;
        for _ in 0..index {
            cur = self.frames.get(cur.0)?.parent.0?;
        }
        self.frames.get(cur.0).map(|f| &f.slot)
    }

    /// Drop `width` frames from the front of `env`
    pub fn unwind(&self, env: Env, width: usize) -> Option<Env> {
        let mut cur = env;
        for _ in 0..width {
            let id = cur.0?;
            cur = self.frames.get(id.0)?.parent;
        }
        Some(cur)
    }

    /// Allocate a closure capturing `env`
    pub fn alloc_closure(&mut self, def: Def, env: Env) -> ClosureId {
        self.allocated_since_collect += 1;
        ClosureId(self.closures.insert(Closure {
            def,
            captured: Some(env),
        }))
    }

    /// Build a group of mutually recursive closures over `env`.
    ///
    /// Every closure is allocated with no environment, the closures are bound
    /// in order (so the last definition ends up at index 0), and then every
    /// closure's environment is patched to the extended one. Each body can
    /// therefore see every member of its own group.
    pub fn alloc_group(&mut self, defs: &[Def], env: Env) -> (Env, Vec<ClosureId>) {
        let ids: Vec<ClosureId> = defs
            .iter()
            .map(|def| {
                self.allocated_since_collect += 1;
                ClosureId(self.closures.insert(Closure {
                    def: def.clone(),
                    captured: None,
                }))
            })
            .collect();
        let mut extended = env;
        for id in &ids {
            extended = self.bind(extended, Value::Closure(*id));
        }
        for id in &ids {
            if let Some(closure) = self.closures.get_mut(id.0) {
                closure.captured = Some(extended);
            }
        }
        (extended, ids)
    }

    pub fn closure(&self, id: ClosureId) -> Option<&Closure> {
        self.closures.get(id.0)
    }

    /// Pin every closure and cell reachable from `value`
    pub fn escape(&mut self, value: &Value) {
        value.visit_refs(&mut |r| {
            self.escaped.insert(r);
        });
    }

    pub fn allocated_since_collect(&self) -> usize {
        self.allocated_since_collect
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            frames: self.frames.len(),
            closures: self.closures.len(),
            escaped: self.escaped.len(),
            collections: self.collections,
            reclaimed: self.reclaimed,
        }
    }

    /// Mark every frame and closure reachable from `roots`, then free the
    /// rest. `cell_value` returns the bound value of a cell so marking can
    /// follow futures into their contents. Returns the reachable cells so
    /// the caller can sweep its cell table with the same marks.
    pub fn collect(
        &mut self,
        roots: Marker,
        cell_value: impl Fn(CellId) -> Option<Value>,
    ) -> HashSet<CellId> {
        let Marker {
            mut frames,
            mut closures,
            mut cells,
            mut pending,
        } = roots;
        pending.extend(self.escaped.iter().map(|r| match *r {
            HeapRef::Closure(id) => Pending::Closure(id),
            HeapRef::Cell(id) => Pending::Cell(id),
        }));

        while let Some(item) = pending.pop() {
            match item {
                Pending::Env(env) => {
                    let mut cur = env.0;
                    while let Some(id) = cur {
                        if !frames.insert(id) {
                            break;
                        }
                        match self.frames.get(id.0) {
                            Some(frame) => {
                                push_value_refs(&frame.slot, &mut pending);
                                cur = frame.parent.0;
                            }
                            None => break,
                        }
                    }
                }
                Pending::Closure(id) => {
                    if closures.insert(id) {
                        if let Some(closure) = self.closures.get(id.0) {
                            if let Some(env) = closure.captured {
                                pending.push(Pending::Env(env));
                            }
                        }
                    }
                }
                Pending::Cell(id) => {
                    if cells.insert(id) {
                        if let Some(value) = cell_value(id) {
                            push_value_refs(&value, &mut pending);
                        }
                    }
                }
            }
        }

        let freed = self.frames.retain(|idx, _| frames.contains(&FrameId(idx)))
            + self.closures.retain(|idx, _| closures.contains(&ClosureId(idx)));
        self.collections += 1;
        self.reclaimed += freed as u64;
        self.allocated_since_collect = 0;
        cells
    }
}

#[derive(Debug)]
enum Pending {
    Env(Env),
    Closure(ClosureId),
    Cell(CellId),
}

fn push_value_refs(value: &Value, pending: &mut Vec<Pending>) {
    value.visit_refs(&mut |r| match r {
        HeapRef::Closure(id) => pending.push(Pending::Closure(id)),
        HeapRef::Cell(id) => pending.push(Pending::Cell(id)),
    });
}

/// Root set for a collection, filled in by the engine
#[derive(Debug, Default)]
pub struct Marker {
    frames: HashSet<FrameId>,
    closures: HashSet<ClosureId>,
    cells: HashSet<CellId>,
    pending: Vec<Pending>,
}

impl Marker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(&mut self, env: Env) {
        self.pending.push(Pending::Env(env));
    }

    pub fn value(&mut self, value: &Value) {
        push_value_refs(value, &mut self.pending);
    }

    pub fn closure(&mut self, id: ClosureId) {
        self.pending.push(Pending::Closure(id));
    }

    pub fn cell(&mut self, id: CellId) {
        self.pending.push(Pending::Cell(id));
    }
}
