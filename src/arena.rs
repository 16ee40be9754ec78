//! Generational arena backing every engine-owned record.
//!
//! Frames, closures, cells, regions and tokens are all stored in arenas and
//! referred to by `ArenaIndex`. A slot's generation is bumped whenever it is
//! freed, so a stale index can never observe the record that later reuses the
//! slot.

use std::fmt;

/// An index into an arena with a generation counter for ABA safety.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex {
    index: u32,
    generation: u32,
}

impl ArenaIndex {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// A vector of slots with a free list and per-slot generations.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, reusing a freed slot when one is available
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        match self.free_head {
            Some(free) => {
                let slot = &mut self.slots[free as usize];
                let (next_free, generation) = match slot {
                    Slot::Vacant {
                        next_free,
                        generation,
                    } => (*next_free, *generation),
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                self.free_head = next_free;
                *slot = Slot::Occupied { value, generation };
                ArenaIndex::new(free, generation)
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("arena exceeded u32 slots");
                self.slots.push(Slot::Occupied {
                    value,
                    generation: 0,
                });
                ArenaIndex::new(index, 0)
            }
        }
    }

    /// Remove the value at `index`, or `None` if the index is stale
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == index.generation => {
                let vacant = Slot::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let old = std::mem::replace(slot, vacant);
                self.free_head = Some(index.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.index as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.index as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterate over occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { value, generation } => Some((ArenaIndex::new(i as u32, *generation), value)),
            Slot::Vacant { .. } => None,
        })
    }

    /// Free every occupied slot for which `keep` returns false.
    ///
    /// Returns the number of slots freed. This is the sweep half of the heap's
    /// mark-sweep collection.
    pub fn retain(&mut self, mut keep: impl FnMut(ArenaIndex, &T) -> bool) -> usize {
        let doomed: Vec<ArenaIndex> = self
            .iter()
            .filter(|(idx, value)| !keep(*idx, value))
            .map(|(idx, _)| idx)
            .collect();
        for idx in &doomed {
            self.remove(*idx);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_index_does_not_alias_reused_slot() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let b = arena.insert(2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn retain_frees_rejected_slots() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..10).map(|i| arena.insert(i)).collect();
        let freed = arena.retain(|_, v| v % 2 == 0);
        assert_eq!(freed, 5);
        assert_eq!(arena.len(), 5);
        assert!(arena.contains(ids[0]));
        assert!(!arena.contains(ids[1]));
    }
}
