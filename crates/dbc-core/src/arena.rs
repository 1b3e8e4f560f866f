//! Generational slab of live buffers.
//!
//! Buffers refer to each other (child → parent) by [`DbufIndex`] rather than
//! by pointer. A slot's generation is bumped on removal, so a stale index
//! resolves to `None` instead of to whatever buffer reused the slot.

use parking_lot::RwLock;
use std::sync::Arc;

/// Stable handle to a slot in the buffer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbufIndex {
    slot: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

pub(crate) struct Arena<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Allocate a slot and store the value built for its index.
    pub fn insert_with(&self, build: impl FnOnce(DbufIndex) -> T) -> Arc<T> {
        let mut slots = self.slots.write();
        let index = match slots.free.pop() {
            Some(slot) => DbufIndex {
                slot,
                generation: slots.entries[slot as usize].generation,
            },
            None => {
                let slot = u32::try_from(slots.entries.len())
                    .unwrap_or_else(|_| panic!("buffer arena exhausted"));
                slots.entries.push(Slot {
                    generation: 0,
                    value: None,
                });
                DbufIndex {
                    slot,
                    generation: 0,
                }
            }
        };
        let value = Arc::new(build(index));
        slots.entries[index.slot as usize].value = Some(Arc::clone(&value));
        slots.live += 1;
        value
    }

    pub fn get(&self, index: DbufIndex) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.entries.get(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        slot.value.clone()
    }

    pub fn remove(&self, index: DbufIndex) -> Option<Arc<T>> {
        let mut slots = self.slots.write();
        let slot = slots.entries.get_mut(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(index.slot);
        slots.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.read().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_index_does_not_resolve_to_reused_slot() {
        let arena = Arena::new();
        let first = arena.insert_with(|idx| (idx, "first"));
        let first_idx = first.0;
        assert!(arena.remove(first_idx).is_some());

        let second = arena.insert_with(|idx| (idx, "second"));
        assert_eq!(second.0.slot, first_idx.slot, "slot is reused");
        assert!(arena.get(first_idx).is_none());
        assert_eq!(arena.get(second.0).expect("live").1, "second");
        assert!(arena.remove(first_idx).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn build_sees_its_own_index() {
        let arena = Arena::new();
        let a = arena.insert_with(|idx| idx);
        let b = arena.insert_with(|idx| idx);
        assert_ne!(*a, *b);
        assert_eq!(*arena.get(*b).expect("b"), *b);
    }
}
