//! Generation-tagged slot table.
//!
//! Maps 64-bit ids to live values. An id packs `(generation << 32) |
//! index`; a slot's generation bumps on every removal, so a stale id can
//! never resolve to a slot's next tenant. Free slots form an intrusive
//! LIFO whose head carries an ABA counter: a pop that races with a
//! pop/push cycle of the same slot fails its CAS instead of corrupting
//! the list.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

const NIL: u32 = u32::MAX;

struct Slot<V> {
    generation: AtomicU32,
    next_free: AtomicU32,
    value: RwLock<Option<V>>,
}

/// Fixed-capacity concurrent id-to-value table.
///
/// # Test
///
/// ```
/// use flatwire_service::IdTable;
///
/// let table: IdTable<&str> = IdTable::new(8);
///
/// let id = table.add("servant").unwrap();
/// assert_eq!(table.get(&id), Some("servant"));
///
/// table.remove(&id);
/// assert_eq!(table.get(&id), None);
/// ```
pub struct IdTable<V> {
    slots: Box<[Slot<V>]>,
    /// Packed `(aba_counter << 32) | head_index` of the freelist.
    free_head: AtomicU64,
    live: AtomicUsize,
}

fn pack(index: u32, aba: u32) -> u64 {
    ((aba as u64) << 32) | index as u64
}

fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

pub fn id_index(id: u64) -> u32 {
    id as u32
}

pub fn id_generation(id: u64) -> u32 {
    (id >> 32) as u32
}

impl<V: Clone> IdTable<V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < NIL as usize);

        let slots = (0..capacity)
            .map(|index| Slot {
                generation: AtomicU32::new(0),
                next_free: AtomicU32::new(if index + 1 < capacity {
                    (index + 1) as u32
                } else {
                    NIL
                }),
                value: RwLock::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            free_head: AtomicU64::new(pack(0, 0)),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a slot and return its id, or `None` when the table is full.
    pub fn add(&self, value: V) -> Option<u64> {
        let index = loop {
            let head = self.free_head.load(Ordering::Acquire);
            let (index, aba) = unpack(head);
            if index == NIL {
                return None;
            }

            let next = self.slots[index as usize].next_free.load(Ordering::Acquire);
            if self
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(next, aba.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break index;
            }
        };

        let slot = &self.slots[index as usize];
        *slot.value.write() = Some(value);
        self.live.fetch_add(1, Ordering::Relaxed);

        let generation = slot.generation.load(Ordering::Relaxed);
        Some(((generation as u64) << 32) | index as u64)
    }

    /// Resolve an id, `None` if the slot was never this id's or has been
    /// reused since.
    pub fn get(&self, id: &u64) -> Option<V> {
        let index = id_index(*id) as usize;
        let slot = self.slots.get(index)?;

        if slot.generation.load(Ordering::Acquire) != id_generation(*id) {
            return None;
        }

        let value = slot.value.read().clone()?;

        // A removal may have slipped in between the generation check and
        // the value read; only a still-matching generation makes the value
        // ours.
        if slot.generation.load(Ordering::Acquire) != id_generation(*id) {
            return None;
        }

        Some(value)
    }

    /// Take the value out, bump the generation, and recycle the slot.
    pub fn remove(&self, id: &u64) -> Option<V> {
        let index = id_index(*id) as usize;
        let generation = id_generation(*id);
        let slot = self.slots.get(index)?;

        let value = {
            let mut guard = slot.value.write();
            if slot.generation.load(Ordering::Relaxed) != generation {
                return None;
            }

            // A racing remove of the same id may have emptied the slot
            // already; only the winner recycles it.
            let value = guard.take()?;
            slot.generation
                .store(generation.wrapping_add(1), Ordering::Release);

            value
        };

        self.live.fetch_sub(1, Ordering::Relaxed);

        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let (head_index, aba) = unpack(head);
            slot.next_free.store(head_index, Ordering::Release);

            if self
                .free_head
                .compare_exchange_weak(
                    head,
                    pack(index as u32, aba.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}
