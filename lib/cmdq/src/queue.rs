// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Array-backed binary heap with random-access removal.
//!
//! Entries are stored in a slot table owned by the [PriorityQueue], and are
//! referred to by callers through the [EntryId] handed back at insertion.  The
//! heap itself is a vector of slot numbers, with each occupied slot recording
//! its current position in that vector, so that an entry anywhere in the heap
//! can be removed or re-prioritized in O(log n).
//!
//! Ordering is by [Priority] (lower is more urgent), with ties broken by
//! insertion order so that entries of equal priority are emitted FIFO.

use std::cmp::Ordering;

use thiserror::Error;

/// Scheduling priority of a queue entry.  Lower values are more urgent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);
impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const NORMAL: Self = Self(1);
    pub const LOWEST: Self = Self(u32::MAX - 1);
    /// Not a schedulable priority: marks something which is not queued.
    pub const NONE: Self = Self(u32::MAX);

    /// Is `self` more urgent than `other`?
    pub const fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}
impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Handle to an entry resident in a [PriorityQueue].
///
/// A handle is invalidated when its entry leaves the queue.  Slot reuse is
/// tracked by a per-slot generation, so a stale handle is detected rather than
/// aliasing a newer entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    slot: u32,
    gen: u32,
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unable to allocate queue storage")]
    OutOfMemory,

    #[error("entry is not present in queue")]
    NotFound,

    #[error("capacity {0} is below live entry count {1}")]
    CapacityBelowCount(usize, usize),
}

struct Entry<T> {
    priority: Priority,
    /// Insertion sequence, used to order entries of equal priority
    seq: u64,
    /// Position of this entry in the heap array
    index: usize,
    value: T,
}
struct Slot<T> {
    gen: u32,
    entry: Option<Entry<T>>,
}

pub struct PriorityQueue<T> {
    heap: Vec<u32>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    next_seq: u64,
    generation: u64,
    frozen: u32,
    /// Fail the next storage growth, as an allocation failure would
    #[cfg(test)]
    fail_growth: bool,
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.  Storage is allocated on first insertion.
    pub const fn new() -> Self {
        Self {
            heap: Vec::new(),
            slots: Vec::new(),
            free: Vec::new(),
            capacity: 0,
            next_seq: 0,
            generation: 0,
            frozen: 0,
            #[cfg(test)]
            fail_growth: false,
        }
    }

    /// Create a queue with storage for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        let mut queue = Self::new();
        if capacity != 0 {
            queue.resize(capacity)?;
        }
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count of storage reallocations over the life of the queue.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Change the storage capacity of the queue.
    ///
    /// On failure the queue is left as it was.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), Error> {
        let count = self.heap.len();
        if new_capacity < count {
            return Err(Error::CapacityBelowCount(new_capacity, count));
        }
        if new_capacity > self.capacity {
            #[cfg(test)]
            if std::mem::take(&mut self.fail_growth) {
                return Err(Error::OutOfMemory);
            }
            self.heap
                .try_reserve_exact(new_capacity - count)
                .map_err(|_| Error::OutOfMemory)?;
            if new_capacity > self.slots.len() {
                self.slots
                    .try_reserve_exact(new_capacity - self.slots.len())
                    .map_err(|_| Error::OutOfMemory)?;
            }
        } else {
            self.heap.shrink_to(new_capacity);
        }
        self.capacity = new_capacity;
        self.generation += 1;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_growth(&mut self) {
        self.fail_growth = true;
    }

    /// Insert `value` with `priority`, returning the handle by which it can
    /// be later removed or re-prioritized.
    ///
    /// Fails only if the queue must grow and the allocation fails, in which
    /// case the queue is unchanged.
    pub fn insert(
        &mut self,
        priority: Priority,
        value: T,
    ) -> Result<EntryId, Error> {
        if self.heap.len() == self.capacity {
            let grown = (self.capacity * 2).max(1);
            self.resize(grown)?;
        }

        let index = self.heap.len();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = Entry { priority, seq, index, value };
        let slot = match self.free.pop() {
            Some(slot) => {
                let ent = &mut self.slots[slot as usize];
                assert!(ent.entry.is_none(), "free slot should be vacant");
                ent.entry = Some(entry);
                slot
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot { gen: 0, entry: Some(entry) });
                slot
            }
        };
        self.heap.push(slot);
        self.sift_up(index);

        Ok(EntryId { slot, gen: self.slots[slot as usize].gen })
    }

    /// Remove the entry identified by `id`, wherever it sits in the heap.
    pub fn remove(&mut self, id: EntryId) -> Result<T, Error> {
        let index = self.index_of(id).ok_or(Error::NotFound)?;
        Ok(self.remove_at(index))
    }

    /// Remove the most urgent entry (if any)
    pub fn remove_head(&mut self) -> Option<(EntryId, T)> {
        if self.heap.is_empty() {
            return None;
        }
        let slot = self.heap[0];
        let id = EntryId { slot, gen: self.slots[slot as usize].gen };
        Some((id, self.remove_at(0)))
    }

    /// Get the most urgent entry (if any) without removing it
    pub fn peek_head(&self) -> Option<(EntryId, &T)> {
        let slot = *self.heap.first()?;
        let ent = &self.slots[slot as usize];
        let entry = ent.entry.as_ref().expect("heap slot is occupied");
        Some((EntryId { slot, gen: ent.gen }, &entry.value))
    }

    /// Priority of the most urgent entry, or [Priority::NONE] if empty
    pub fn head_priority(&self) -> Priority {
        self.heap
            .first()
            .map(|slot| self.occupied(*slot).priority)
            .unwrap_or(Priority::NONE)
    }

    /// Change the priority of a queued entry, returning its prior priority.
    pub fn change_priority(
        &mut self,
        id: EntryId,
        priority: Priority,
    ) -> Result<Priority, Error> {
        let index = self.index_of(id).ok_or(Error::NotFound)?;
        let entry = self.occupied_mut(self.heap[index]);
        let old = std::mem::replace(&mut entry.priority, priority);
        self.resift(index);
        Ok(old)
    }

    /// Current position of an entry within the heap array.
    pub fn index_of(&self, id: EntryId) -> Option<usize> {
        let ent = self.slots.get(id.slot as usize)?;
        if ent.gen != id.gen {
            return None;
        }
        ent.entry.as_ref().map(|e| e.index)
    }
    pub fn contains(&self, id: EntryId) -> bool {
        self.index_of(id).is_some()
    }
    pub fn priority(&self, id: EntryId) -> Option<Priority> {
        self.index_of(id).map(|idx| self.occupied(self.heap[idx]).priority)
    }
    pub fn get(&self, id: EntryId) -> Option<&T> {
        let idx = self.index_of(id)?;
        Some(&self.occupied(self.heap[idx]).value)
    }
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        let idx = self.index_of(id)?;
        Some(&mut self.occupied_mut(self.heap[idx]).value)
    }

    /// Iterate over queued entries in heap (not priority) order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, Priority, &T)> {
        self.heap.iter().map(|slot| {
            let ent = &self.slots[*slot as usize];
            let entry = ent.entry.as_ref().expect("heap slot is occupied");
            let id = EntryId { slot: *slot, gen: ent.gen };
            (id, entry.priority, &entry.value)
        })
    }

    /// Mark the queue as frozen, returning the new freeze count.
    ///
    /// The queue itself continues to accept operations while frozen; it is up
    /// to consumers to refrain from dispatching its entries.
    pub fn freeze(&mut self) -> u32 {
        self.frozen += 1;
        self.frozen
    }

    /// Drop one level of freeze, returning the remaining freeze count.
    ///
    /// # Panics
    ///
    /// If the queue is not frozen.
    pub fn thaw(&mut self) -> u32 {
        assert!(self.frozen > 0, "thaw of unfrozen queue");
        self.frozen -= 1;
        self.frozen
    }
    pub fn is_frozen(&self) -> bool {
        self.frozen > 0
    }
    pub fn frozen_count(&self) -> u32 {
        self.frozen
    }

    fn occupied(&self, slot: u32) -> &Entry<T> {
        self.slots[slot as usize].entry.as_ref().expect("slot is occupied")
    }
    fn occupied_mut(&mut self, slot: u32) -> &mut Entry<T> {
        self.slots[slot as usize].entry.as_mut().expect("slot is occupied")
    }

    fn remove_at(&mut self, index: usize) -> T {
        let slot = self.heap.swap_remove(index);
        if index < self.heap.len() {
            let moved = self.heap[index];
            self.occupied_mut(moved).index = index;
            self.resift(index);
        }

        let ent = &mut self.slots[slot as usize];
        let entry = ent.entry.take().expect("removed slot is occupied");
        ent.gen = ent.gen.wrapping_add(1);
        self.free.push(slot);
        entry.value
    }

    /// Ordering of the entries at heap positions `a` and `b`
    fn cmp_at(&self, a: usize, b: usize) -> Ordering {
        let ea = self.occupied(self.heap[a]);
        let eb = self.occupied(self.heap[b]);
        ea.priority.cmp(&eb.priority).then(ea.seq.cmp(&eb.seq))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let (sa, sb) = (self.heap[a], self.heap[b]);
        self.occupied_mut(sa).index = a;
        self.occupied_mut(sb).index = b;
    }

    fn resift(&mut self, index: usize) {
        if index > 0 && self.cmp_at(index, (index - 1) / 2) == Ordering::Less
        {
            self.sift_up(index);
        } else {
            self.sift_down(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.cmp_at(index, parent) != Ordering::Less {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len
                && self.cmp_at(right, left) == Ordering::Less
            {
                right
            } else {
                left
            };
            if self.cmp_at(child, index) != Ordering::Less {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}
impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Assert the heap property and the slot/index back-references
    fn check_heap<T>(queue: &PriorityQueue<T>) {
        let occupied =
            queue.slots.iter().filter(|s| s.entry.is_some()).count();
        assert_eq!(occupied, queue.len());
        assert!(queue.len() <= queue.capacity());

        for (idx, slot) in queue.heap.iter().enumerate() {
            assert_eq!(queue.occupied(*slot).index, idx);
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < queue.len() {
                    assert_ne!(
                        queue.cmp_at(child, idx),
                        Ordering::Less,
                        "child {child} ordered before parent {idx}"
                    );
                }
            }
        }
    }

    fn drain<T>(queue: &mut PriorityQueue<T>) -> Vec<T> {
        std::iter::from_fn(|| queue.remove_head().map(|(_, v)| v)).collect()
    }

    #[test]
    fn empty() {
        let mut queue = PriorityQueue::<u32>::new();
        assert_eq!(queue.capacity(), 0);
        assert!(queue.peek_head().is_none());
        assert!(queue.remove_head().is_none());
        assert_eq!(queue.head_priority(), Priority::NONE);
    }

    #[test]
    fn deferred_allocation() {
        let mut queue = PriorityQueue::with_capacity(0).unwrap();
        assert_eq!(queue.generation(), 0);

        queue.insert(Priority(3), 'a').unwrap();
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.generation(), 1);

        queue.insert(Priority(2), 'b').unwrap();
        queue.insert(Priority(1), 'c').unwrap();
        assert_eq!(queue.capacity(), 4);
        assert_eq!(queue.generation(), 3);
        check_heap(&queue);
    }

    #[test]
    fn failed_growth_leaves_queue_intact() {
        let mut queue = PriorityQueue::with_capacity(2).unwrap();
        queue.insert(Priority(5), 5u64).unwrap();
        queue.insert(Priority(1), 1u64).unwrap();
        let gen = queue.generation();

        assert_eq!(queue.resize(usize::MAX), Err(Error::OutOfMemory));
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.generation(), gen);
        assert_eq!(drain(&mut queue), vec![1, 5]);
    }

    #[test]
    fn resize_below_count() {
        let mut queue = PriorityQueue::new();
        for p in 0..3 {
            queue.insert(Priority(p), p).unwrap();
        }
        assert_eq!(queue.resize(2), Err(Error::CapacityBelowCount(2, 3)));
        queue.resize(3).unwrap();
        assert_eq!(queue.capacity(), 3);
        check_heap(&queue);
    }

    #[test]
    fn fifo_among_equals() {
        let mut queue = PriorityQueue::new();
        for v in 0..16 {
            queue.insert(Priority::NORMAL, v).unwrap();
        }
        queue.insert(Priority::HIGHEST, 100).unwrap();
        let out = drain(&mut queue);
        assert_eq!(out[0], 100);
        assert_eq!(&out[1..], (0..16).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn random_priorities_drain_sorted() {
        let mut rng = StdRng::seed_from_u64(0xc0ffee);
        let mut queue = PriorityQueue::new();
        for _ in 0..1000 {
            let p: u32 = rng.gen_range(0..500);
            queue.insert(Priority(p), p).unwrap();
        }
        check_heap(&queue);

        let out = drain(&mut queue);
        assert_eq!(out.len(), 1000);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn interior_removal() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut queue = PriorityQueue::new();
        let mut live: Vec<(EntryId, u32)> = (0..200)
            .map(|_| {
                let p = rng.gen_range(0..50);
                (queue.insert(Priority(p), p).unwrap(), p)
            })
            .collect();

        while !live.is_empty() {
            let pick = rng.gen_range(0..live.len());
            let (id, p) = live.swap_remove(pick);
            let before = queue.len();
            assert_eq!(queue.remove(id), Ok(p));
            assert_eq!(queue.len(), before - 1);
            check_heap(&queue);

            let best = live.iter().map(|(_, p)| *p).min();
            assert_eq!(queue.peek_head().map(|(_, v)| *v), best);
        }
    }

    #[test]
    fn insert_remove_round_trip() {
        let mut queue = PriorityQueue::new();
        for p in [9, 3, 7, 1, 5] {
            queue.insert(Priority(p), p).unwrap();
        }
        let snapshot = |q: &PriorityQueue<u32>| {
            let mut ents: Vec<_> =
                q.iter().map(|(id, p, v)| (id, p, *v)).collect();
            ents.sort();
            ents
        };
        let before = snapshot(&queue);

        let id = queue.insert(Priority(4), 4).unwrap();
        queue.remove(id).unwrap();
        assert_eq!(snapshot(&queue), before);
    }

    #[test]
    fn stale_handles() {
        let mut queue = PriorityQueue::new();
        let id = queue.insert(Priority(1), "one").unwrap();
        assert_eq!(queue.remove(id), Ok("one"));
        assert_eq!(queue.remove(id), Err(Error::NotFound));
        assert_eq!(
            queue.change_priority(id, Priority(0)),
            Err(Error::NotFound)
        );

        // The recycled slot must not be reachable through the old handle
        let fresh = queue.insert(Priority(2), "two").unwrap();
        assert_ne!(id, fresh);
        assert!(!queue.contains(id));
        assert_eq!(queue.get(fresh), Some(&"two"));
    }

    #[test]
    fn change_priority_both_directions() {
        let mut queue = PriorityQueue::new();
        let ids: Vec<EntryId> = (0..10)
            .map(|v| queue.insert(Priority(v * 10 + 5), v).unwrap())
            .collect();

        assert_eq!(
            queue.change_priority(ids[9], Priority(0)),
            Ok(Priority(95))
        );
        check_heap(&queue);
        assert_eq!(queue.peek_head().map(|(_, v)| *v), Some(9));

        queue.change_priority(ids[9], Priority(95)).unwrap();
        queue.change_priority(ids[0], Priority(55)).unwrap();
        check_heap(&queue);
        assert_eq!(queue.len(), 10);
        assert_eq!(drain(&mut queue), vec![1, 2, 3, 4, 5, 0, 6, 7, 8, 9]);
    }

    #[test]
    fn random_mixed_operations() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut queue = PriorityQueue::new();
        let mut live: Vec<EntryId> = Vec::new();

        for _ in 0..5000 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let p = Priority(rng.gen_range(0..100));
                    live.push(queue.insert(p, ()).unwrap());
                }
                2 if !live.is_empty() => {
                    let id = live.swap_remove(rng.gen_range(0..live.len()));
                    queue.remove(id).unwrap();
                }
                3 if !live.is_empty() => {
                    let id = live[rng.gen_range(0..live.len())];
                    let p = Priority(rng.gen_range(0..100));
                    queue.change_priority(id, p).unwrap();
                }
                _ => {}
            }
            assert_eq!(queue.len(), live.len());
            check_heap(&queue);
        }
    }

    #[test]
    fn freeze_counting() {
        let mut queue = PriorityQueue::<()>::new();
        assert!(!queue.is_frozen());
        assert_eq!(queue.freeze(), 1);
        assert_eq!(queue.freeze(), 2);
        assert_eq!(queue.thaw(), 1);
        assert!(queue.is_frozen());
        assert_eq!(queue.thaw(), 0);
        assert!(!queue.is_frozen());
    }

    #[test]
    #[should_panic(expected = "thaw of unfrozen queue")]
    fn thaw_unfrozen() {
        let mut queue = PriorityQueue::<()>::new();
        queue.thaw();
    }
}
