// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adapter-wide send queue.
//!
//! Every device attached to an adapter which has work ready to go is scheduled
//! on the adapter's [SendQueue], ordered by the priority of its most urgent
//! command.  Independent of any per-device limits, the adapter admits at most
//! `send_openings + send_active` commands at once.

use std::collections::BTreeMap;

use crate::queue::{self, EntryId, Priority, PriorityQueue};

pub struct SendQueue<T> {
    queue: PriorityQueue<T>,
    scheduled: BTreeMap<T, EntryId>,
    send_openings: u32,
    send_active: u32,
}
impl<T: Ord + Copy> SendQueue<T> {
    pub fn new(send_openings: u32) -> Self {
        Self {
            queue: PriorityQueue::new(),
            scheduled: BTreeMap::new(),
            send_openings,
            send_active: 0,
        }
    }

    pub fn openings(&self) -> u32 {
        self.send_openings
    }
    pub fn active(&self) -> u32 {
        self.send_active
    }
    /// Adapter-wide ceiling on concurrently dispatched commands
    pub fn depth(&self) -> u32 {
        self.send_openings + self.send_active
    }
    pub fn len(&self) -> usize {
        self.queue.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
    pub fn is_scheduled(&self, item: T) -> bool {
        self.scheduled.contains_key(&item)
    }

    /// Schedule `item` to be serviced at `priority`.
    ///
    /// If it is already scheduled, its priority is only ever raised, never
    /// lowered.  Returns `true` if the item was newly placed on the queue.
    pub fn schedule(
        &mut self,
        item: T,
        priority: Priority,
    ) -> Result<bool, queue::Error> {
        if let Some(id) = self.scheduled.get(&item) {
            let current =
                self.queue.priority(*id).ok_or(queue::Error::NotFound)?;
            if priority.is_before(current) {
                self.queue.change_priority(*id, priority)?;
            }
            return Ok(false);
        }
        let id = self.queue.insert(priority, item)?;
        self.scheduled.insert(item, id);
        Ok(true)
    }

    /// Remove `item` from the queue, if scheduled
    pub fn unschedule(&mut self, item: T) -> bool {
        match self.scheduled.remove(&item) {
            Some(id) => {
                self.queue.remove(id).expect("scheduled item is queued");
                true
            }
            None => false,
        }
    }

    /// Take the most urgent scheduled item
    pub fn take_head(&mut self) -> Option<(T, Priority)> {
        let priority = self.queue.head_priority();
        let (_, item) = self.queue.remove_head()?;
        self.scheduled.remove(&item);
        Some((item, priority))
    }

    #[cfg(test)]
    pub(crate) fn fail_next_growth(&mut self) {
        self.queue.fail_next_growth();
    }

    pub fn peek_head(&self) -> Option<T> {
        self.queue.peek_head().map(|(_, item)| *item)
    }

    /// Can a command be dispatched through the adapter right now?
    pub fn can_send(&self) -> bool {
        self.send_openings > 0 && !self.queue.is_frozen()
    }

    /// Charge an adapter opening for a command being dispatched.
    ///
    /// # Panics
    ///
    /// If no adapter openings remain.
    pub fn send_command(&mut self) {
        assert!(self.send_openings > 0, "no adapter openings remain");
        self.send_openings -= 1;
        self.send_active += 1;
    }

    /// Return the adapter opening of a completed command.
    ///
    /// # Panics
    ///
    /// If no command is active on the adapter.
    pub fn command_completed(&mut self) {
        assert!(self.send_active > 0, "adapter completion with none active");
        self.send_active -= 1;
        self.send_openings += 1;
    }

    pub fn freeze(&mut self) -> u32 {
        self.queue.freeze()
    }
    pub fn thaw(&mut self) -> u32 {
        self.queue.thaw()
    }
    pub fn is_frozen(&self) -> bool {
        self.queue.is_frozen()
    }
    pub fn frozen_count(&self) -> u32 {
        self.queue.frozen_count()
    }

    /// Change the adapter-wide ceiling.  Shrinking below the number of
    /// commands currently dispatched is refused.
    pub fn resize(&mut self, new_depth: u32) -> bool {
        if new_depth < self.send_active {
            return false;
        }
        self.send_openings = new_depth - self.send_active;
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn schedule_only_promotes() {
        let mut sq = SendQueue::new(4);
        assert_eq!(sq.schedule(1u32, Priority(5)), Ok(true));
        assert_eq!(sq.schedule(2u32, Priority(3)), Ok(true));
        assert_eq!(sq.peek_head(), Some(2));

        // Demotion request is ignored
        assert_eq!(sq.schedule(2, Priority(9)), Ok(false));
        assert_eq!(sq.peek_head(), Some(2));

        // Promotion is honored
        assert_eq!(sq.schedule(1, Priority(0)), Ok(false));
        assert_eq!(sq.take_head(), Some((1, Priority(0))));
        assert_eq!(sq.take_head(), Some((2, Priority(3))));
        assert_eq!(sq.take_head(), None);
        assert!(!sq.is_scheduled(1));
    }

    #[test]
    fn unschedule() {
        let mut sq = SendQueue::new(1);
        sq.schedule(7u32, Priority(1)).unwrap();
        assert!(sq.unschedule(7));
        assert!(!sq.unschedule(7));
        assert!(sq.is_empty());
    }

    #[test]
    #[should_panic(expected = "no adapter openings remain")]
    fn send_past_ceiling() {
        let mut sq = SendQueue::<u32>::new(2);
        sq.send_command();
        sq.send_command();
        assert!(!sq.can_send());
        sq.send_command();
    }

    #[test]
    fn frozen_blocks_sending() {
        let mut sq = SendQueue::<u32>::new(2);
        assert!(sq.can_send());
        sq.freeze();
        assert!(!sq.can_send());
        sq.thaw();
        assert!(sq.can_send());
    }

    #[test]
    fn resize() {
        let mut sq = SendQueue::<u32>::new(4);
        sq.send_command();
        sq.send_command();
        assert!(sq.resize(8));
        assert_eq!((sq.openings(), sq.active()), (6, 2));
        assert!(!sq.resize(1));
        assert!(sq.resize(2));
        assert_eq!((sq.openings(), sq.active()), (0, 2));
    }

    #[test]
    fn random_openings_conserved() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut sq = SendQueue::<u32>::new(16);
        for _ in 0..10_000 {
            if rng.gen_bool(0.5) {
                if sq.can_send() {
                    sq.send_command();
                }
            } else if sq.active() > 0 {
                sq.command_completed();
            }
            assert_eq!(sq.depth(), 16);
        }
    }
}
