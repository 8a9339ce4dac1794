// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling state guarded by an adapter's perimeter lock.
//!
//! A [Perimeter] ties together an adapter's [SendQueue] and the
//! [DeviceQueue]s of the devices attached through it.  Commands are admitted
//! at the device level, and a device with dispatchable work is scheduled on
//! the send queue at the priority of its most urgent command.  Dispatch
//! requires an opening at both levels, taken device-first, and completion
//! returns them in the opposite order.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};

use thiserror::Error;

use crate::devq::{self, Admission, DeviceQueue};
use crate::queue::{self, EntryId, Priority};
use crate::sendq::SendQueue;
use crate::util::id::{AdapterId, DeviceId};

#[usdt::provider(provider = "cmdq")]
mod probes {
    fn cmd_queue(dev: u32, priority: u32, admission: &str) {}
    fn cmd_dispatch(dev: u32, priority: u32) {}
    fn cmd_done(dev: u32) {}
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no device {0} attached")]
    NoDevice(DeviceId),

    #[error("device {0} has no free openings")]
    NoOpening(DeviceId),

    #[error("device {0} has commands outstanding")]
    Busy(DeviceId),

    #[error(transparent)]
    Resize(#[from] devq::ResizeError),

    #[error(transparent)]
    Queue(#[from] queue::Error),
}

/// A command taken off its device queue and charged against both the device
/// and the adapter, ready to be handed to the adapter driver.
#[derive(Debug, PartialEq, Eq)]
pub struct Dispatched<C> {
    pub device: DeviceId,
    pub id: EntryId,
    pub cmd: C,
}

/// Reference counts for the adapters whose counts are kept under a given lock
#[derive(Default)]
pub(crate) struct RefTable(BTreeMap<AdapterId, usize>);
impl RefTable {
    pub(crate) const fn new() -> Self {
        Self(BTreeMap::new())
    }
    pub(crate) fn register(&mut self, id: AdapterId) {
        let old = self.0.insert(id, 1);
        assert!(old.is_none(), "adapter {id} registered twice");
    }
    pub(crate) fn acquire(&mut self, id: AdapterId) -> usize {
        let count = self.0.get_mut(&id).expect("adapter is registered");
        assert!(*count > 0, "reference taken on drained adapter {id}");
        *count += 1;
        *count
    }
    pub(crate) fn release(&mut self, id: AdapterId) -> usize {
        let count = self.0.get_mut(&id).expect("adapter is registered");
        assert!(*count > 0, "adapter {id} released too many times");
        *count -= 1;
        *count
    }
    pub(crate) fn count(&self, id: AdapterId) -> usize {
        self.0.get(&id).copied().unwrap_or(0)
    }
    pub(crate) fn retire(&mut self, id: AdapterId) {
        let count = self.0.remove(&id).expect("adapter is registered");
        assert_eq!(count, 0, "adapter {id} retired while referenced");
    }
}

pub struct Perimeter<C> {
    sendq: SendQueue<DeviceId>,
    devices: BTreeMap<DeviceId, DeviceQueue<C>>,
    pub(crate) refs: RefTable,
}
impl<C> Perimeter<C> {
    /// Create scheduling state for an adapter which will allow at most
    /// `send_openings` commands to be dispatched at once.
    pub fn new(send_openings: u32) -> Self {
        Self {
            sendq: SendQueue::new(send_openings),
            devices: BTreeMap::new(),
            refs: RefTable::new(),
        }
    }

    pub fn send_queue(&self) -> &SendQueue<DeviceId> {
        &self.sendq
    }
    pub fn device(&self, dev: DeviceId) -> Option<&DeviceQueue<C>> {
        self.devices.get(&dev)
    }
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    fn dev_mut(&mut self, dev: DeviceId) -> Result<&mut DeviceQueue<C>, Error> {
        self.devices.get_mut(&dev).ok_or(Error::NoDevice(dev))
    }

    /// Attach a device whose allocation and tag budgets are both `depth`
    pub fn attach_device(&mut self, depth: u32) -> DeviceId {
        self.attach_queue(DeviceQueue::new(depth))
    }

    /// Attach an already-constructed device queue
    pub fn attach_queue(&mut self, queue: DeviceQueue<C>) -> DeviceId {
        let dev = DeviceId::new();
        self.devices.insert(dev, queue);
        dev
    }

    /// Detach an idle device.  Devices with commands queued, held, or active
    /// are refused.
    pub fn detach_device(
        &mut self,
        dev: DeviceId,
    ) -> Result<DeviceQueue<C>, Error> {
        let dq = self.devices.get(&dev).ok_or(Error::NoDevice(dev))?;
        if dq.pending() != 0 || dq.active() != 0 {
            return Err(Error::Busy(dev));
        }
        self.sendq.unschedule(dev);
        Ok(self.devices.remove(&dev).expect("device is present"))
    }

    /// Admit a command to a device queue.
    ///
    /// Fails with [Error::NoOpening] when the device's allocation budget is
    /// exhausted.  The caller is expected to retry after a completion.
    pub fn queue_command(
        &mut self,
        dev: DeviceId,
        priority: Priority,
        cmd: C,
    ) -> Result<(EntryId, Admission), Error> {
        let dq = self.dev_mut(dev)?;
        if !dq.has_opening() {
            return Err(Error::NoOpening(dev));
        }
        dq.begin_allocating();
        dq.take_opening();
        let res = dq.insert_command(priority, cmd);
        dq.end_allocating();
        let (id, admission) = match res {
            Ok(res) => res,
            Err(e) => {
                dq.release_opening();
                return Err(e.into());
            }
        };
        if admission == Admission::Queued {
            if let Err(e) = self.schedule_device(dev) {
                // Back the command out so it cannot dispatch unseen
                let dq = self.dev_mut(dev)?;
                dq.remove_command(id).expect("command was just queued");
                dq.release_opening();
                return Err(e);
            }
        }
        probes::cmd_queue!(|| {
            let admission: &'static str = admission.into();
            (dev.0, priority.0, admission)
        });
        Ok((id, admission))
    }

    /// Cancel a queued command, returning it to the caller.
    pub fn cancel_command(
        &mut self,
        dev: DeviceId,
        id: EntryId,
    ) -> Result<C, Error> {
        let dq = self.dev_mut(dev)?;
        let removed = dq.remove_command(id)?;
        if !removed.was_frozen {
            dq.release_opening();
        }
        if self.sendq.unschedule(dev) {
            self.schedule_device(dev)?;
        }
        Ok(removed.cmd)
    }

    /// Change the priority of a queued command.  A scheduled device is
    /// placed on the send queue again at the priority of its new head.
    pub fn change_priority(
        &mut self,
        dev: DeviceId,
        id: EntryId,
        priority: Priority,
    ) -> Result<Priority, Error> {
        let old = self.dev_mut(dev)?.change_priority(id, priority)?;
        if self.sendq.unschedule(dev) {
            self.schedule_device(dev)?;
        }
        Ok(old)
    }

    /// Place a device on the send queue at the priority of its head command,
    /// if it has any work which could be dispatched.
    fn schedule_device(&mut self, dev: DeviceId) -> Result<(), Error> {
        let dq = self.devices.get(&dev).ok_or(Error::NoDevice(dev))?;
        if dq.queued() == 0 || dq.is_frozen() {
            return Ok(());
        }
        let priority = dq.head_priority();
        self.sendq.schedule(dev, priority)?;
        Ok(())
    }

    /// Dispatch as many commands as the adapter's openings allow.
    ///
    /// Devices are serviced in order of their most urgent command.  A device
    /// which cannot accept its head command (frozen, out of openings) is
    /// dropped from the send queue until a completion or thaw reschedules it.
    pub fn run_send_queue(&mut self) -> Vec<Dispatched<C>> {
        let mut out = Vec::new();
        while self.sendq.can_send() {
            let Some((dev, priority)) = self.sendq.take_head() else {
                break;
            };
            let Some(dq) = self.devices.get_mut(&dev) else {
                continue;
            };
            let Some((id, cmd)) = dq.dispatch_head() else {
                continue;
            };
            self.sendq.send_command();
            probes::cmd_dispatch!(|| (dev.0, priority.0));
            out.push(Dispatched { device: dev, id, cmd });

            // A failure to reschedule leaves the device to be picked up by
            // its next completion.
            let _ = self.schedule_device(dev);
        }
        out
    }

    /// Account for a dispatched command which has completed, returning its
    /// openings to the adapter and then the device.
    pub fn command_done(&mut self, dev: DeviceId) -> Result<(), Error> {
        if !self.devices.contains_key(&dev) {
            return Err(Error::NoDevice(dev));
        }
        self.sendq.command_completed();
        let dq = self.dev_mut(dev)?;
        dq.command_completed();
        dq.release_opening();
        probes::cmd_done!(|| (dev.0));
        self.schedule_device(dev)
    }

    pub fn freeze_device(&mut self, dev: DeviceId) -> Result<u32, Error> {
        let count = self.dev_mut(dev)?.freeze();
        self.sendq.unschedule(dev);
        Ok(count)
    }

    /// Drop one freeze level from a device, rescheduling it once fully thawed.
    pub fn thaw_device(&mut self, dev: DeviceId) -> Result<u32, Error> {
        let count = self.dev_mut(dev)?.thaw();
        if count == 0 {
            self.schedule_device(dev)?;
        }
        Ok(count)
    }

    /// Freeze dispatch through the whole adapter by `count` levels.
    pub fn freeze_adapter(&mut self, count: u32) -> u32 {
        let mut level = self.sendq.frozen_count();
        for _ in 0..count {
            level = self.sendq.freeze();
        }
        level
    }

    /// Drop one freeze level from the adapter.
    pub fn release_adapter(&mut self) -> u32 {
        self.sendq.thaw()
    }

    pub fn resize_device(
        &mut self,
        dev: DeviceId,
        depth: u32,
    ) -> Result<(), Error> {
        self.dev_mut(dev)?.resize(depth)?;
        self.schedule_device(dev)
    }

    /// Change the adapter-wide ceiling.  Returns false if that would drop it
    /// below the number of commands currently dispatched.
    pub fn resize_adapter(&mut self, depth: u32) -> bool {
        self.sendq.resize(depth)
    }
}

/// The perimeter lock: a [Perimeter] behind a mutex, with a condition
/// variable for threads which must sleep while holding it.
pub struct PerimeterLock<C> {
    state: Mutex<Perimeter<C>>,
    pub(crate) cv: Condvar,
}
impl<C> PerimeterLock<C> {
    pub fn new(perimeter: Perimeter<C>) -> Self {
        Self { state: Mutex::new(perimeter), cv: Condvar::new() }
    }
    pub fn lock(&self) -> MutexGuard<'_, Perimeter<C>> {
        self.state.lock().unwrap()
    }
}
