// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reference-counted handle to an adapter driver instance.
//!
//! An [AdapterHandle] is created once when the adapter attaches, and is
//! destroyed exactly once when it detaches.  Anything which calls into the
//! driver, or hangs on to it across asynchronous work, does so through an
//! [AdapterRef].  Destruction blocks until every such reference has been
//! dropped, so the driver's soft state is never freed out from under a
//! caller.
//!
//! The reference count is kept under one of two locks, chosen by the
//! [LockStrategy] of the adapter: either its own perimeter lock, or (for
//! drivers which synchronize themselves) a lock shared across the process.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use slog::{debug, info, o, Logger};

use crate::devq::Admission;
use crate::perimeter::{self, Dispatched, PerimeterLock, RefTable};
use crate::queue::{EntryId, Priority};
use crate::util::id::{AdapterId, DeviceId};

#[usdt::provider(provider = "cmdq")]
mod probes {
    fn adapter_ref(id: u32, count: u64) {}
    fn adapter_unref(id: u32, count: u64) {}
    fn adapter_drain_wait(id: u32, count: u64) {}
    fn adapter_drain_done(id: u32) {}
}

/// Driver entry point to which dispatched commands are handed
pub type ActionFn<S, C> = dyn Fn(&S, Dispatched<C>) + Send + Sync + 'static;
/// Driver entry point for polled completion
pub type PollFn<S> = dyn Fn(&S) + Send + Sync + 'static;

/// Which lock guards the reference count of an adapter
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::IntoStaticStr)]
pub enum LockStrategy {
    /// The adapter's perimeter lock
    #[default]
    Perimeter,
    /// The driver does its own locking, so a process-wide lock is used
    SelfSynchronized,
}

#[derive(Clone, Debug)]
pub struct AdapterParams {
    pub name: String,
    pub unit: u32,
    /// Ceiling for devices which do not support tagged queueing
    pub max_device_openings: u32,
    /// Ceiling for devices which do
    pub max_tagged_openings: u32,
    pub locking: LockStrategy,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceParams {
    pub tagged: bool,
    /// Override for the depth otherwise derived from the adapter's ceilings
    pub openings: Option<u32>,
}

/// What [AdapterHandle::destroy()] should do with the adapter's queue
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueDisposition {
    /// Drop the handle's reference to the queue
    Free,
    /// Hand the queue back to the caller
    Keep,
}

static FALLBACK_REFS: Mutex<RefTable> = Mutex::new(RefTable::new());
static FALLBACK_CV: Condvar = Condvar::new();

enum RefGate<C> {
    Perimeter(Arc<PerimeterLock<C>>),
    Fallback,
}
impl<C> Clone for RefGate<C> {
    fn clone(&self) -> Self {
        match self {
            RefGate::Perimeter(lock) => RefGate::Perimeter(lock.clone()),
            RefGate::Fallback => RefGate::Fallback,
        }
    }
}
impl<C> RefGate<C> {
    fn with_refs<R>(&self, f: impl FnOnce(&mut RefTable) -> R) -> R {
        match self {
            RefGate::Perimeter(lock) => f(&mut lock.lock().refs),
            RefGate::Fallback => f(&mut FALLBACK_REFS.lock().unwrap()),
        }
    }
    fn register(&self, id: AdapterId) {
        self.with_refs(|refs| refs.register(id));
    }
    fn acquire(&self, id: AdapterId) {
        let count = self.with_refs(|refs| refs.acquire(id));
        probes::adapter_ref!(|| (id.0, count as u64));
    }
    fn release(&self, id: AdapterId) {
        let count = self.with_refs(|refs| refs.release(id));
        probes::adapter_unref!(|| (id.0, count as u64));
        if count == 0 {
            match self {
                RefGate::Perimeter(lock) => lock.cv.notify_all(),
                RefGate::Fallback => FALLBACK_CV.notify_all(),
            }
        }
    }
    fn count(&self, id: AdapterId) -> usize {
        self.with_refs(|refs| refs.count(id))
    }

    /// Drop the caller's reference and wait for all others to be dropped.
    /// Returns the number of references outstanding when the wait began.
    fn drain(&self, id: AdapterId) -> usize {
        match self {
            RefGate::Perimeter(lock) => {
                drain_locked(&lock.cv, lock.lock(), id, |p| &mut p.refs)
            }
            RefGate::Fallback => drain_locked(
                &FALLBACK_CV,
                FALLBACK_REFS.lock().unwrap(),
                id,
                |refs| refs,
            ),
        }
    }
}

fn drain_locked<T>(
    cv: &Condvar,
    mut guard: MutexGuard<'_, T>,
    id: AdapterId,
    refs: fn(&mut T) -> &mut RefTable,
) -> usize {
    let remaining = refs(&mut guard).release(id);
    if remaining > 0 {
        probes::adapter_drain_wait!(|| (id.0, remaining as u64));
    }
    let mut guard =
        cv.wait_while(guard, |state| refs(state).count(id) > 0).unwrap();
    refs(&mut guard).retire(id);
    probes::adapter_drain_done!(|| (id.0));
    remaining
}

pub struct Adapter<S, C> {
    this: Weak<Self>,
    id: AdapterId,
    name: String,
    unit: u32,
    max_device_openings: u32,
    max_tagged_openings: u32,
    path_id: AtomicU32,
    locking: LockStrategy,
    softc: S,
    action: Box<ActionFn<S, C>>,
    poll: Box<PollFn<S>>,
    queue: Arc<PerimeterLock<C>>,
    gate: RefGate<C>,
    log: Logger,
}
impl<S, C> Adapter<S, C> {
    pub fn id(&self) -> AdapterId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn unit(&self) -> u32 {
        self.unit
    }
    pub fn softc(&self) -> &S {
        &self.softc
    }
    pub fn max_device_openings(&self) -> u32 {
        self.max_device_openings
    }
    pub fn max_tagged_openings(&self) -> u32 {
        self.max_tagged_openings
    }
    pub fn locking(&self) -> LockStrategy {
        self.locking
    }
    pub fn queue(&self) -> &Arc<PerimeterLock<C>> {
        &self.queue
    }

    pub fn path_id(&self) -> u32 {
        self.path_id.load(Ordering::Relaxed)
    }
    pub fn set_path(&self, path_id: u32) {
        self.path_id.store(path_id, Ordering::Relaxed);
    }

    /// Take a reference which keeps the adapter alive until dropped
    pub fn acquire_ref(&self) -> AdapterRef<S, C> {
        self.gate.acquire(self.id);
        AdapterRef {
            inner: Some(self.this.upgrade().expect("adapter still exists")),
            id: self.id,
            gate: self.gate.clone(),
        }
    }

    /// Number of outstanding references, including that of the handle
    pub fn ref_count(&self) -> usize {
        self.gate.count(self.id)
    }

    /// Attach a device, sizing its queue from the adapter's ceilings.
    pub fn attach_device(&self, params: DeviceParams) -> DeviceId {
        let depth = params.openings.unwrap_or(if params.tagged {
            self.max_tagged_openings
        } else {
            self.max_device_openings
        });
        let dev = self.queue.lock().attach_device(depth);
        debug!(self.log, "device attached";
            "device" => %dev,
            "tagged" => params.tagged,
            "depth" => depth,
        );
        dev
    }

    pub fn detach_device(&self, dev: DeviceId) -> Result<(), perimeter::Error> {
        self.queue.lock().detach_device(dev)?;
        debug!(self.log, "device detached"; "device" => %dev);
        Ok(())
    }

    pub fn queue_command(
        &self,
        dev: DeviceId,
        priority: Priority,
        cmd: C,
    ) -> Result<(EntryId, Admission), perimeter::Error> {
        self.queue.lock().queue_command(dev, priority, cmd)
    }

    pub fn cancel_command(
        &self,
        dev: DeviceId,
        id: EntryId,
    ) -> Result<C, perimeter::Error> {
        self.queue.lock().cancel_command(dev, id)
    }

    /// Dispatch what the adapter's openings allow, handing each command to
    /// the driver's action entry point.  The perimeter lock is not held
    /// while the driver is called.
    ///
    /// Returns the number of commands dispatched.
    pub fn run(&self) -> usize {
        let dispatched = self.queue.lock().run_send_queue();
        if dispatched.is_empty() {
            return 0;
        }
        let hold = self.acquire_ref();
        let count = dispatched.len();
        for cmd in dispatched {
            (hold.action)(&hold.softc, cmd);
        }
        count
    }

    /// Invoke the driver's poll entry point
    pub fn poll(&self) {
        let hold = self.acquire_ref();
        (hold.poll)(&hold.softc);
    }

    /// Account for the completion of a command dispatched to `dev`
    pub fn complete(&self, dev: DeviceId) -> Result<(), perimeter::Error> {
        self.queue.lock().command_done(dev)
    }

    /// Freeze dispatch through the adapter by `count` levels
    pub fn freeze(&self, count: u32) -> u32 {
        let level = self.queue.lock().freeze_adapter(count);
        info!(self.log, "adapter queue frozen"; "level" => level);
        level
    }

    /// Drop one freeze level.  If that leaves the adapter thawed and `run`
    /// is set, dispatch immediately.
    pub fn release(&self, run: bool) -> u32 {
        let level = self.queue.lock().release_adapter();
        info!(self.log, "adapter queue released"; "level" => level);
        if level == 0 && run {
            self.run();
        }
        level
    }
}

/// Handle owning the adapter's initial reference
pub struct AdapterHandle<S, C> {
    inner: Option<Arc<Adapter<S, C>>>,
}
impl<S, C> AdapterHandle<S, C> {
    /// Create an adapter with a reference count of one.
    ///
    /// With [LockStrategy::Perimeter], the reference count is kept under the
    /// lock of `queue`.
    pub fn create(
        params: AdapterParams,
        softc: S,
        action: impl Fn(&S, Dispatched<C>) + Send + Sync + 'static,
        poll: impl Fn(&S) + Send + Sync + 'static,
        queue: Arc<PerimeterLock<C>>,
        log: &Logger,
    ) -> Self {
        let id = AdapterId::new();
        let gate = match params.locking {
            LockStrategy::Perimeter => RefGate::Perimeter(queue.clone()),
            LockStrategy::SelfSynchronized => RefGate::Fallback,
        };
        gate.register(id);

        let log = log.new(o!(
            "adapter" => params.name.clone(),
            "unit" => params.unit,
        ));
        let locking: &'static str = params.locking.into();
        info!(log, "adapter created"; "id" => %id, "locking" => locking);

        let inner = Arc::new_cyclic(|this| Adapter {
            this: this.clone(),
            id,
            name: params.name,
            unit: params.unit,
            max_device_openings: params.max_device_openings,
            max_tagged_openings: params.max_tagged_openings,
            path_id: AtomicU32::new(0),
            locking: params.locking,
            softc,
            action: Box::new(action),
            poll: Box::new(poll),
            queue,
            gate,
            log,
        });
        Self { inner: Some(inner) }
    }

    /// Destroy the adapter, blocking until all outstanding references have
    /// been dropped.
    ///
    /// With [QueueDisposition::Keep], the adapter's queue is handed back.
    pub fn destroy(
        mut self,
        disposition: QueueDisposition,
    ) -> Option<Arc<PerimeterLock<C>>> {
        self.teardown(disposition)
    }

    fn teardown(
        &mut self,
        disposition: QueueDisposition,
    ) -> Option<Arc<PerimeterLock<C>>> {
        let adapter = self.inner.take()?;
        let id = adapter.id;
        let log = adapter.log.clone();
        let gate = adapter.gate.clone();

        debug!(log, "draining adapter references");
        let waited = gate.drain(id);
        drop(gate);

        // Outstanding refs drop their Arc before releasing their count, so
        // once drained, this is the only strong reference.
        let Ok(adapter) = Arc::try_unwrap(adapter) else {
            panic!("adapter {id} still shared after drain");
        };
        info!(log, "adapter destroyed"; "waited_on" => waited);

        let Adapter { queue, .. } = adapter;
        match disposition {
            QueueDisposition::Free => None,
            QueueDisposition::Keep => Some(queue),
        }
    }
}
impl<S, C> Deref for AdapterHandle<S, C> {
    type Target = Adapter<S, C>;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().expect("adapter is not destroyed")
    }
}
impl<S, C> Drop for AdapterHandle<S, C> {
    fn drop(&mut self) {
        let _ = self.teardown(QueueDisposition::Free);
    }
}

/// Counted reference to an [Adapter]
pub struct AdapterRef<S, C> {
    inner: Option<Arc<Adapter<S, C>>>,
    id: AdapterId,
    gate: RefGate<C>,
}
impl<S, C> Clone for AdapterRef<S, C> {
    fn clone(&self) -> Self {
        self.gate.acquire(self.id);
        Self {
            inner: self.inner.clone(),
            id: self.id,
            gate: self.gate.clone(),
        }
    }
}
impl<S, C> Deref for AdapterRef<S, C> {
    type Target = Adapter<S, C>;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().expect("reference is live")
    }
}
impl<S, C> Drop for AdapterRef<S, C> {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.gate.release(self.id);
    }
}
