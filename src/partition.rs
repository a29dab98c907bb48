//! Per-server slice of the pool: the bounded free queue, the acquisition
//! waiters, the connection counters, and the watcher's signal slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::{ServerInfo, ServiceOrder};

/// One live connection plus its bookkeeping.
///
/// A handle is either in its partition's free queue or in a caller's hands,
/// never both; moving it by value is what flips its logical state. The
/// underlying connection slot is replaceable (see `PooledHandle::reacquire`)
/// so the handle identity survives a reconnect.
#[derive(Debug)]
pub(crate) struct Handle<C> {
    pub(crate) conn: C,
    /// Index of the owning partition. Non-owning back-reference.
    pub(crate) partition: usize,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) last_reset: Instant,
    pub(crate) possibly_broken: bool,
}

impl<C> Handle<C> {
    pub(crate) fn new(conn: C, partition: usize) -> Handle<C> {
        let now = Instant::now();
        Handle {
            conn,
            partition,
            created_at: now,
            last_used: now,
            last_reset: now,
            possibly_broken: false,
        }
    }

    /// Past the absolute TTL, when one is configured.
    pub(crate) fn is_expired(&self, max_age: Option<Duration>, now: Instant) -> bool {
        match max_age {
            Some(limit) => now.saturating_duration_since(self.created_at) >= limit,
            None => false,
        }
    }

    /// Unused longer than the idle TTL, when one is configured.
    pub(crate) fn is_idle_expired(&self, idle_max_age: Option<Duration>, now: Instant) -> bool {
        match idle_max_age {
            Some(limit) => now.saturating_duration_since(self.last_used) >= limit,
            None => false,
        }
    }

    /// Due a liveness probe, when a test period is configured.
    pub(crate) fn is_due_probe(&self, test_period: Option<Duration>, now: Instant) -> bool {
        match test_period {
            Some(period) => now.saturating_duration_since(self.last_reset) >= period,
            None => false,
        }
    }
}

/// The partition data that must be protected by a lock.
struct PartitionInternals<C> {
    free: VecDeque<Handle<C>>,
    waiters: VecDeque<oneshot::Sender<Handle<C>>>,
}

/// A per-server slice of the pool.
///
/// All shared mutable state for one server lives here, so contention is
/// per-partition rather than global. The lock is never held across a factory
/// call or a liveness probe; handles are removed first and operated on
/// detached.
pub(crate) struct Partition<C> {
    pub(crate) server: ServerInfo,
    pub(crate) index: usize,
    /// Free-queue capacity and connection ceiling.
    pub(crate) max: u32,
    availability_threshold: u32,
    internals: Mutex<PartitionInternals<C>>,
    created: AtomicU32,
    /// The watcher cannot add connections: ceiling reached or server down.
    growth_blocked: AtomicBool,
    server_down: AtomicBool,
    consecutive_failures: AtomicU32,
    signal: mpsc::Sender<()>,
}

impl<C> Partition<C> {
    /// Builds a partition and the receiving end of its signal queue, which
    /// the watcher takes ownership of.
    pub(crate) fn new(
        server: ServerInfo,
        index: usize,
        max: u32,
        availability_threshold: u32,
    ) -> (Partition<C>, mpsc::Receiver<()>) {
        // Capacity 1 gives the signal queue its coalescing offer semantics.
        let (signal, signal_rx) = mpsc::channel(1);
        let partition = Partition {
            server,
            index,
            max,
            availability_threshold,
            internals: Mutex::new(PartitionInternals {
                free: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            created: AtomicU32::new(0),
            growth_blocked: AtomicBool::new(false),
            server_down: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            signal,
        };
        (partition, signal_rx)
    }

    /// Non-blocking head of the free queue.
    pub(crate) fn poll_free(&self) -> Option<Handle<C>> {
        self.internals.lock().unwrap().free.pop_front()
    }

    /// One-shot poll-or-park: takes the head if there is one, otherwise
    /// registers a waiter under the same lock so no hand-off can slip
    /// between the two.
    pub(crate) fn poll_or_park(&self) -> Result<Handle<C>, oneshot::Receiver<Handle<C>>> {
        let mut locked = self.internals.lock().unwrap();
        if let Some(handle) = locked.free.pop_front() {
            return Ok(handle);
        }
        let (tx, rx) = oneshot::channel();
        locked.waiters.push_back(tx);
        Err(rx)
    }

    /// Hands `handle` to a parked waiter if any, otherwise queues it at the
    /// tail. Returns the handle back if the queue is full; with
    /// `created <= max` that cannot happen, so a refusal is a bug signal the
    /// caller must log.
    pub(crate) fn offer_free(&self, mut handle: Handle<C>) -> Result<(), Handle<C>> {
        let mut locked = self.internals.lock().unwrap();
        while let Some(waiter) = locked.waiters.pop_front() {
            // This connection is no longer idle, send it back out.
            match waiter.send(handle) {
                Ok(()) => return Ok(()),
                // That receiver was gone. Try the next one.
                Err(returned) => handle = returned,
            }
        }
        if locked.free.len() as u32 >= self.max {
            return Err(handle);
        }
        locked.free.push_back(handle);
        Ok(())
    }

    /// Drops every parked waiter's sender, failing their receivers. Used at
    /// shutdown so callers blocked in `get` see the pool-closed error
    /// instead of waiting out their timeout.
    pub(crate) fn cancel_waiters(&self) {
        let waiters: Vec<_> = {
            let mut locked = self.internals.lock().unwrap();
            locked.waiters.drain(..).collect()
        };
        drop(waiters);
    }

    /// Empties the free queue, handing the contents to the caller for
    /// destruction.
    pub(crate) fn drain_free(&self) -> Vec<Handle<C>> {
        self.internals.lock().unwrap().free.drain(..).collect()
    }

    /// Removes idle-expired handles and handles due a liveness probe, in
    /// `order` traversal direction. Survivors keep their insertion order.
    /// Probed handles are invisible to acquirers until reinserted.
    pub(crate) fn take_idle_reapable(
        &self,
        idle_max_age: Option<Duration>,
        test_period: Option<Duration>,
        order: ServiceOrder,
    ) -> (Vec<Handle<C>>, Vec<Handle<C>>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut due_probe = Vec::new();
        let mut locked = self.internals.lock().unwrap();
        let mut drained: Vec<Handle<C>> = locked.free.drain(..).collect();
        if order == ServiceOrder::Lifo {
            drained.reverse();
        }
        let mut kept = Vec::new();
        for handle in drained {
            if handle.is_idle_expired(idle_max_age, now) {
                expired.push(handle);
            } else if handle.is_due_probe(test_period, now) {
                due_probe.push(handle);
            } else {
                kept.push(handle);
            }
        }
        // Survivors go back in insertion order whatever the scan direction.
        if order == ServiceOrder::Lifo {
            kept.reverse();
        }
        locked.free = kept.into();
        (expired, due_probe)
    }

    /// Removes handles past the absolute TTL, in `order` traversal
    /// direction.
    pub(crate) fn take_age_expired(
        &self,
        max_age: Duration,
        order: ServiceOrder,
    ) -> Vec<Handle<C>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut locked = self.internals.lock().unwrap();
        let mut drained: Vec<Handle<C>> = locked.free.drain(..).collect();
        if order == ServiceOrder::Lifo {
            drained.reverse();
        }
        let mut kept = Vec::new();
        for handle in drained {
            if handle.is_expired(Some(max_age), now) {
                expired.push(handle);
            } else {
                kept.push(handle);
            }
        }
        if order == ServiceOrder::Lifo {
            kept.reverse();
        }
        locked.free = kept.into();
        expired
    }

    /// Count of handles currently free for acquisition.
    pub(crate) fn available(&self) -> u32 {
        self.internals.lock().unwrap().free.len() as u32
    }

    pub(crate) fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_created(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_created(&self) {
        self.created.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn growth_blocked(&self) -> bool {
        self.growth_blocked.load(Ordering::SeqCst)
    }

    pub(crate) fn block_growth(&self) {
        self.growth_blocked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unblock_growth(&self) {
        self.growth_blocked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_server_down(&self) -> bool {
        self.server_down.load(Ordering::SeqCst)
    }

    /// Records a failed create attempt. Returns true when this failure
    /// tripped the server-down latch.
    pub(crate) fn note_create_failure(&self, max_failed: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= max_failed && !self.server_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        false
    }

    /// Records a successful create, clearing the latch and reopening
    /// growth if a down server had blocked it.
    pub(crate) fn note_create_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.server_down.swap(false, Ordering::SeqCst) {
            self.unblock_growth();
        }
    }

    /// Posts a wake-up token to the watcher. A full slot means a wake is
    /// already pending, which is exactly the coalescing we want.
    pub(crate) fn signal(&self) {
        let _ = self.signal.try_send(());
    }

    /// Signals the watcher only when the partition is under its availability
    /// threshold and growth is not blocked. Callers are responsible for not
    /// signalling a pool that is shutting down.
    pub(crate) fn maybe_signal(&self) {
        if self.growth_blocked() {
            return;
        }
        if self.available() * 100 / self.max <= self.availability_threshold {
            self.signal();
        }
    }
}
