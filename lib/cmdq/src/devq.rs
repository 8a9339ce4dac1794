// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device command queue and its admission accounting.
//!
//! Two budgets are tracked for each device:
//!
//! - Allocation openings: how many commands may exist for the device at once,
//!   whether held by the upper layer, queued, or executing.  Conserved as
//!   `alloc_openings + held + queued (charged) + active`.
//! - Device (tag) openings: how many commands the device will accept
//!   concurrently.  Conserved as `dev_openings + active`.
//!
//! None of these operations lock.  They are expected to run under the
//! perimeter lock of the adapter which the device is attached to.

use crate::queue::{self, EntryId, Priority, PriorityQueue};

/// Result of placing a command on a [DeviceQueue]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Admission {
    /// Command is queued and eligible for dispatch
    Queued,
    /// Command is queued, but the device queue is frozen.  The opening the
    /// command held has been handed back, so it must not be expected to
    /// dispatch until the queue is thawed.
    Frozen,
}

/// Command removed from a [DeviceQueue] ahead of dispatch
#[derive(Debug, PartialEq, Eq)]
pub struct Removed<C> {
    pub cmd: C,
    /// Command was parked while the queue was frozen, and holds no opening.
    pub was_frozen: bool,
}

struct Queued<C> {
    cmd: C,
    /// Has this entry consumed an allocation opening?
    charged: bool,
}

pub struct DeviceQueue<C> {
    queue: PriorityQueue<Queued<C>>,
    alloc_openings: u32,
    allocating: u32,
    dev_openings: u32,
    active: u32,
    held: u32,
    /// Queued entries which hold no allocation opening
    parked: u32,
}
impl<C> DeviceQueue<C> {
    /// Create a queue where both budgets are `depth`.
    pub fn new(depth: u32) -> Self {
        Self::with_openings(depth, depth)
    }

    /// Create a queue with distinct allocation and tag budgets.
    pub fn with_openings(alloc_openings: u32, dev_openings: u32) -> Self {
        Self {
            queue: PriorityQueue::new(),
            alloc_openings,
            allocating: 0,
            dev_openings,
            active: 0,
            held: 0,
            parked: 0,
        }
    }

    pub fn alloc_openings(&self) -> u32 {
        self.alloc_openings
    }
    pub fn dev_openings(&self) -> u32 {
        self.dev_openings
    }
    pub fn active(&self) -> u32 {
        self.active
    }
    pub fn held(&self) -> u32 {
        self.held
    }
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
    /// Commands which exist for the device but are not yet executing
    pub fn pending(&self) -> usize {
        self.queue.len() + self.held as usize
    }
    /// Total of the allocation budget
    pub fn alloc_depth(&self) -> u32 {
        self.alloc_openings
            + self.held
            + self.active
            + (self.queue.len() as u32 - self.parked)
    }
    /// Total of the tag budget
    pub fn tag_depth(&self) -> u32 {
        self.dev_openings + self.active
    }

    pub fn has_opening(&self) -> bool {
        self.alloc_openings > 0
    }

    /// Take an allocation opening in preparation for a new command.
    ///
    /// # Panics
    ///
    /// If no allocation openings remain.
    pub fn take_opening(&mut self) {
        assert!(self.alloc_openings > 0, "no allocation openings remain");
        self.alloc_openings -= 1;
        self.held += 1;
    }

    /// Return an opening which was taken (or freed by completion) without a
    /// command consuming it.
    ///
    /// # Panics
    ///
    /// If no opening is held.
    pub fn release_opening(&mut self) {
        assert!(self.held > 0, "release of unheld opening");
        self.held -= 1;
        self.alloc_openings += 1;
    }

    /// Queue a command which was prepared under a previously taken opening.
    ///
    /// When the queue is frozen, the opening is handed back immediately and
    /// the command waits in the queue without one.
    pub fn insert_command(
        &mut self,
        priority: Priority,
        cmd: C,
    ) -> Result<(EntryId, Admission), queue::Error> {
        assert!(self.held > 0, "insert of command without an opening");
        let frozen = self.queue.is_frozen();
        let id = self.queue.insert(priority, Queued { cmd, charged: !frozen })?;
        self.held -= 1;
        if frozen {
            self.alloc_openings += 1;
            self.parked += 1;
            Ok((id, Admission::Frozen))
        } else {
            Ok((id, Admission::Queued))
        }
    }

    /// Remove a queued command, for dispatch or cancellation.
    ///
    /// A charged command moves back to `held`, and must then either be sent
    /// or have its opening released.  A command parked by a frozen insert
    /// comes back with no opening at all.
    pub fn remove_command(
        &mut self,
        id: EntryId,
    ) -> Result<Removed<C>, queue::Error> {
        let Queued { cmd, charged } = self.queue.remove(id)?;
        Ok(self.account_removed(cmd, charged))
    }

    fn account_removed(&mut self, cmd: C, charged: bool) -> Removed<C> {
        if charged {
            self.held += 1;
        } else {
            self.parked -= 1;
        }
        Removed { cmd, was_frozen: !charged }
    }

    pub fn change_priority(
        &mut self,
        id: EntryId,
        priority: Priority,
    ) -> Result<Priority, queue::Error> {
        self.queue.change_priority(id, priority)
    }

    /// Confirm that a held command has been handed to the hardware.
    ///
    /// # Panics
    ///
    /// If no device openings remain, or no command is held.
    pub fn send_command(&mut self) {
        assert!(self.dev_openings > 0, "no device openings remain");
        assert!(self.held > 0, "send of unheld command");
        self.held -= 1;
        self.dev_openings -= 1;
        self.active += 1;
    }

    /// Account for a command finishing on the hardware.  Its allocation
    /// opening is held until [DeviceQueue::release_opening()].
    ///
    /// # Panics
    ///
    /// If no command is active.
    pub fn command_completed(&mut self) {
        assert!(self.active > 0, "completion with no active commands");
        self.active -= 1;
        self.dev_openings += 1;
        self.held += 1;
    }

    /// Remove and send the head command, if the device is in a state to
    /// accept it.
    ///
    /// A head which was parked during a freeze is charged first.  When no
    /// allocation opening is free, the charge of a less urgent queued entry
    /// is moved onto it, and that entry is parked in its place.
    ///
    /// Returns `None` if the queue is empty or frozen, if the device has no
    /// openings, or if a parked head has no opening to be charged with.
    pub fn dispatch_head(&mut self) -> Option<(EntryId, C)> {
        if self.queue.is_frozen() || self.dev_openings == 0 {
            return None;
        }
        let (_, head) = self.queue.peek_head()?;
        if !head.charged {
            if self.alloc_openings > 0 {
                self.alloc_openings -= 1;
                self.parked -= 1;
            } else if !self.transfer_charge() {
                return None;
            }
        }
        let (id, Queued { cmd, .. }) =
            self.queue.remove_head().expect("head is present");
        self.held += 1;
        self.send_command();
        Some((id, cmd))
    }

    /// Park the least urgent charged entry, so its opening can be used by the
    /// (parked) head.
    fn transfer_charge(&mut self) -> bool {
        let donor = self
            .queue
            .iter()
            .filter(|(_, _, q)| q.charged)
            .max_by_key(|(_, priority, _)| *priority)
            .map(|(id, _, _)| id);
        match donor {
            Some(id) => {
                self.queue.get_mut(id).expect("donor is queued").charged =
                    false;
                true
            }
            None => false,
        }
    }

    pub fn peek_head(&self) -> Option<(EntryId, &C)> {
        self.queue.peek_head().map(|(id, q)| (id, &q.cmd))
    }
    pub fn head_priority(&self) -> Priority {
        self.queue.head_priority()
    }
    pub fn get(&self, id: EntryId) -> Option<&C> {
        self.queue.get(id).map(|q| &q.cmd)
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

    /// Mark that an allocation pass is running for this device
    pub fn begin_allocating(&mut self) {
        self.allocating += 1;
    }
    pub fn end_allocating(&mut self) {
        assert!(self.allocating > 0, "allocation pass not running");
        self.allocating -= 1;
    }
    pub fn is_allocating(&self) -> bool {
        self.allocating > 0
    }

    /// Change the depth of both budgets to `new_depth`, adjusting the free
    /// openings by the difference.
    ///
    /// Fails (leaving the queue untouched) if the free openings cannot cover
    /// a reduction.
    pub fn resize(&mut self, new_depth: u32) -> Result<(), ResizeError> {
        let alloc_depth = self.alloc_depth();
        let tag_depth = self.tag_depth();
        let alloc_openings = adjust(self.alloc_openings, alloc_depth, new_depth)
            .ok_or(ResizeError { in_use: alloc_depth - self.alloc_openings })?;
        let dev_openings = adjust(self.dev_openings, tag_depth, new_depth)
            .ok_or(ResizeError { in_use: self.active })?;

        self.alloc_openings = alloc_openings;
        self.dev_openings = dev_openings;
        Ok(())
    }
}

fn adjust(free: u32, depth: u32, new_depth: u32) -> Option<u32> {
    if new_depth >= depth {
        Some(free + (new_depth - depth))
    } else {
        free.checked_sub(depth - new_depth)
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
#[error("cannot shrink below {in_use} openings in use")]
pub struct ResizeError {
    pub in_use: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn check_budgets<C>(dq: &DeviceQueue<C>, alloc: u32, tags: u32) {
        assert_eq!(dq.alloc_depth(), alloc);
        assert_eq!(dq.tag_depth(), tags);
    }

    fn queue_one(dq: &mut DeviceQueue<u32>, prio: u32, cmd: u32) -> EntryId {
        dq.take_opening();
        let (id, adm) = dq.insert_command(Priority(prio), cmd).unwrap();
        assert_eq!(adm, Admission::Queued);
        id
    }

    #[test]
    fn take_insert_send_cycle() {
        let mut dq = DeviceQueue::with_openings(8, 4);
        for n in 0..4 {
            let id = queue_one(&mut dq, 1, n);
            let removed = dq.remove_command(id).unwrap();
            assert_eq!(removed, Removed { cmd: n, was_frozen: false });
            dq.send_command();
            check_budgets(&dq, 8, 4);
        }
        assert_eq!(dq.dev_openings(), 0);
        assert_eq!(dq.active(), 4);
        assert_eq!(dq.alloc_openings(), 4);
    }

    #[test]
    #[should_panic(expected = "no device openings remain")]
    fn send_past_tag_depth() {
        let mut dq = DeviceQueue::with_openings(8, 4);
        for n in 0..4 {
            let id = queue_one(&mut dq, 1, n);
            dq.remove_command(id).unwrap();
            dq.send_command();
        }
        let id = queue_one(&mut dq, 1, 4);
        dq.remove_command(id).unwrap();
        dq.send_command();
    }

    #[test]
    #[should_panic(expected = "no allocation openings remain")]
    fn take_past_allocation_depth() {
        let mut dq = DeviceQueue::<u32>::new(2);
        dq.take_opening();
        dq.take_opening();
        assert!(!dq.has_opening());
        dq.take_opening();
    }

    #[test]
    fn completion_returns_openings() {
        let mut dq = DeviceQueue::new(2);
        let id = queue_one(&mut dq, 1, 10);
        assert_eq!(dq.dispatch_head(), Some((id, 10)));
        assert_eq!((dq.active(), dq.dev_openings(), dq.held()), (1, 1, 0));

        dq.command_completed();
        assert_eq!((dq.active(), dq.dev_openings(), dq.held()), (0, 2, 1));
        assert_eq!(dq.alloc_openings(), 1);

        dq.release_opening();
        assert_eq!(dq.alloc_openings(), 2);
        check_budgets(&dq, 2, 2);
    }

    #[test]
    fn dispatch_in_priority_order() {
        let mut dq = DeviceQueue::new(4);
        queue_one(&mut dq, 5, 50);
        queue_one(&mut dq, 1, 10);
        queue_one(&mut dq, 5, 51);
        queue_one(&mut dq, 3, 30);
        assert_eq!(dq.pending(), 4);
        assert_eq!(dq.head_priority(), Priority(1));

        let order: Vec<u32> =
            std::iter::from_fn(|| dq.dispatch_head().map(|(_, c)| c)).collect();
        assert_eq!(order, vec![10, 30, 50, 51]);
        assert_eq!(dq.pending(), 0);
        check_budgets(&dq, 4, 4);
    }

    #[test]
    fn dispatch_stops_at_tag_depth() {
        let mut dq = DeviceQueue::with_openings(4, 2);
        for n in 0..3 {
            queue_one(&mut dq, 1, n);
        }
        assert!(dq.dispatch_head().is_some());
        assert!(dq.dispatch_head().is_some());
        assert!(dq.dispatch_head().is_none());
        assert_eq!(dq.queued(), 1);

        dq.command_completed();
        dq.release_opening();
        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(2));
        check_budgets(&dq, 4, 2);
    }

    #[test]
    fn cancel_queued_command() {
        let mut dq = DeviceQueue::new(2);
        let id = queue_one(&mut dq, 1, 7);
        let removed = dq.remove_command(id).unwrap();
        assert!(!removed.was_frozen);
        assert_eq!(dq.held(), 1);
        dq.release_opening();
        assert_eq!(dq.alloc_openings(), 2);
        assert_eq!(dq.remove_command(id), Err(queue::Error::NotFound));
    }

    #[test]
    fn frozen_insert_returns_opening() {
        let mut dq = DeviceQueue::new(2);
        dq.freeze();
        dq.take_opening();
        assert_eq!(dq.alloc_openings(), 1);

        let (id, adm) = dq.insert_command(Priority(1), 1u32).unwrap();
        assert_eq!(adm, Admission::Frozen);
        assert_eq!(dq.alloc_openings(), 2);
        assert_eq!(dq.held(), 0);
        check_budgets(&dq, 2, 2);

        // Nothing dispatches while frozen
        assert!(dq.dispatch_head().is_none());

        let removed = dq.remove_command(id).unwrap();
        assert!(removed.was_frozen);
        assert_eq!(dq.alloc_openings(), 2);
        assert_eq!(dq.held(), 0);
        check_budgets(&dq, 2, 2);
    }

    #[test]
    fn parked_command_charged_after_thaw() {
        let mut dq = DeviceQueue::with_openings(1, 1);
        dq.freeze();
        dq.take_opening();
        dq.insert_command(Priority(1), 1u32).unwrap();
        // The returned opening is reused while frozen
        dq.take_opening();
        dq.insert_command(Priority(1), 2u32).unwrap();
        assert_eq!(dq.queued(), 2);
        assert_eq!(dq.thaw(), 0);

        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(1));
        assert_eq!(dq.alloc_openings(), 0);
        check_budgets(&dq, 1, 1);

        // Second parked command must wait for an opening
        dq.command_completed();
        assert!(dq.dispatch_head().is_none());
        dq.release_opening();
        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(2));
        check_budgets(&dq, 1, 1);
    }

    #[test]
    fn parked_head_borrows_charge_of_later_entry() {
        let mut dq = DeviceQueue::new(2);
        dq.freeze();
        dq.take_opening();
        let (_, adm) = dq.insert_command(Priority(0), 0u32).unwrap();
        assert_eq!(adm, Admission::Frozen);
        dq.thaw();

        // Charged entries behind the parked head use up every opening
        queue_one(&mut dq, 5, 1);
        queue_one(&mut dq, 7, 2);
        assert_eq!(dq.alloc_openings(), 0);

        // Head takes the charge of the least urgent entry
        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(0));
        check_budgets(&dq, 2, 2);
        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(1));
        check_budgets(&dq, 2, 2);
        assert_eq!(dq.active(), 2);

        // Entry 2 is parked now, and dispatches once an opening returns
        dq.command_completed();
        dq.release_opening();
        assert_eq!(dq.dispatch_head().map(|(_, c)| c), Some(2));
        check_budgets(&dq, 2, 2);
        assert_eq!(dq.alloc_openings(), 0);
    }

    #[test]
    fn resize_budgets() {
        let mut dq = DeviceQueue::new(4);
        queue_one(&mut dq, 1, 1);
        queue_one(&mut dq, 1, 2);
        dq.dispatch_head().unwrap();

        dq.resize(8).unwrap();
        check_budgets(&dq, 8, 8);
        assert_eq!(dq.alloc_openings(), 6);
        assert_eq!(dq.dev_openings(), 7);

        dq.resize(2).unwrap();
        check_budgets(&dq, 2, 2);
        assert_eq!(dq.alloc_openings(), 0);

        assert_eq!(dq.resize(1), Err(ResizeError { in_use: 2 }));
        check_budgets(&dq, 2, 2);
    }

    #[test]
    fn allocating_marker() {
        let mut dq = DeviceQueue::<()>::new(1);
        assert!(!dq.is_allocating());
        dq.begin_allocating();
        assert!(dq.is_allocating());
        dq.end_allocating();
        assert!(!dq.is_allocating());
    }

    #[test]
    fn random_legal_sequences() {
        const ALLOC: u32 = 12;
        const TAGS: u32 = 5;
        let mut rng = StdRng::seed_from_u64(0xdecaf);
        let mut dq = DeviceQueue::with_openings(ALLOC, TAGS);
        let mut queued: Vec<EntryId> = Vec::new();

        for step in 0..10_000u32 {
            match rng.gen_range(0..8) {
                0 if dq.has_opening() => {
                    dq.take_opening();
                    let p = Priority(rng.gen_range(0..8));
                    let (id, _) = dq.insert_command(p, step).unwrap();
                    queued.push(id);
                }
                1 => {
                    if let Some((id, _)) = dq.dispatch_head() {
                        queued.retain(|q| *q != id);
                    }
                }
                2 if dq.active() > 0 => {
                    dq.command_completed();
                    dq.release_opening();
                }
                3 if !queued.is_empty() => {
                    let id = queued.swap_remove(rng.gen_range(0..queued.len()));
                    if !dq.remove_command(id).unwrap().was_frozen {
                        dq.release_opening();
                    }
                }
                4 if !queued.is_empty() => {
                    let id = queued[rng.gen_range(0..queued.len())];
                    dq.change_priority(id, Priority(rng.gen_range(0..8)))
                        .unwrap();
                }
                5 if !dq.is_frozen() && rng.gen_bool(0.2) => {
                    dq.freeze();
                }
                6 if dq.is_frozen() => {
                    dq.thaw();
                }
                _ => {}
            }
            check_budgets(&dq, ALLOC, TAGS);
            assert_eq!(dq.queued(), queued.len());
        }
    }
}
