//! The native monitor: a mutex with condition-wait built on park/unpark.
//!
//! # Protocol
//!
//! The lock itself is bit 0 of the lock word; the rest of the word is the
//! head of the cxq, a LIFO of [`ParkEvent`]s pushed by threads that gave up
//! spinning. Any number of threads may push; only the holder of the OnDeck
//! inner lock may detach the cxq, and it moves the chain to the EntryList,
//! which only the inner-lock holder touches at all.
//!
//! `on_deck` is that inner lock. It is 0 when free, [`ON_DECK_LOCKED`] while
//! a releasing thread picks a successor, and otherwise the address of the one
//! event allowed to contend for the lock. The successor keeps OnDeck until it
//! wins the lock and then clears it, which also frees the inner lock for the
//! next release.
//!
//! A releasing thread drops the lock bit, fences, and looks at OnDeck. If a
//! successor is already designated it just unparks it; otherwise it takes the
//! inner lock, pops the EntryList (refilling it from the cxq when empty),
//! designates the head and unparks it. Newly arriving threads may still
//! barge past the successor: handoff is competitive, not direct.
//!
//! Threads in `wait` sit on a separate WaitSet guarded by a spin lock.
//! `notify` moves the head of the WaitSet onto the cxq, where it competes
//! like any other blocked acquirer.
//!
//! The owner field is advisory. It's set after the lock is physically
//! acquired and cleared before it's released, and only assertions and
//! diagnostics read it.

mod acquire;
mod release;
mod wait;

use crate::knobs::Knobs;
use crate::lock_word::LockWord;
use crate::park::ParkEvent;
use crate::rank::Rank;
use crate::runtime::{Runtime, WorldStopped, DEFAULT_RUNTIME};
use crate::spin::{RawSpinLock, SpinMutex};
use crate::thread::{Thread, ThreadId};
use core::fmt;
use core::ptr::null_mut;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use core::time::Duration;
use lock_api::RawMutex as _;

/// OnDeck value meaning "a releasing thread is choosing the successor".
const ON_DECK_LOCKED: usize = 1;

/// Owner value for callers of `raw_lock` that have no [`Thread`] record.
const ANONYMOUS_OWNER: usize = usize::MAX;

/// A non-reentrant mutual-exclusion lock with `wait`/`notify`.
///
/// Acquisition spins briefly, then queues; release hands off to one queued
/// successor, which competes with new arrivals. Monitors are
/// created unlocked by a `const fn`, so they can live in statics. A monitor
/// that is locked must not be moved, and one that is owned, contended, or
/// waited on must not be dropped.
pub struct Monitor {
    lock_word: LockWord,
    on_deck: AtomicUsize,
    entry_list: AtomicPtr<ParkEvent>,
    wait_set: SpinMutex<WaitSet>,
    owner: AtomicUsize,
    snuck: AtomicBool,
    name: &'static str,
    rank: Rank,
    knobs: Knobs,
    runtime: &'static dyn Runtime,
    #[cfg(test)]
    audit: audit::OnDeckAudit,
}

/// Threads blocked in `wait`, most recent first.
pub(crate) struct WaitSet {
    head: *mut ParkEvent,
}

// Only immortal events are linked, and only under the WaitLock.
unsafe impl Send for WaitSet {}

impl Monitor {
    /// Create an unlocked monitor using the default runtime and knobs.
    pub const fn new(rank: Rank, name: &'static str) -> Self {
        Self {
            lock_word: LockWord::new(),
            on_deck: AtomicUsize::new(0),
            entry_list: AtomicPtr::new(null_mut()),
            wait_set: SpinMutex::const_new(RawSpinLock::INIT, WaitSet { head: null_mut() }),
            owner: AtomicUsize::new(0),
            snuck: AtomicBool::new(false),
            name,
            rank,
            knobs: Knobs::DEFAULT,
            runtime: DEFAULT_RUNTIME,
            #[cfg(test)]
            audit: audit::OnDeckAudit::new(),
        }
    }

    /// Use `runtime` for safepoint polling, blocking hooks and transient
    /// events.
    pub fn with_runtime(mut self, runtime: &'static dyn Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Use `knobs` instead of [`Knobs::DEFAULT`].
    pub fn with_knobs(mut self, knobs: Knobs) -> Self {
        self.knobs = knobs;
        self
    }

    /// The monitor's name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The monitor's rank in the lock order.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The knobs this monitor was built with.
    pub fn knobs(&self) -> &Knobs {
        &self.knobs
    }

    /// Acquire the monitor for the current thread, blocking as needed.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already owns the monitor, and, in debug
    /// builds, if acquiring it would violate the lock-rank order.
    pub fn lock(&self) {
        Thread::with_current(|thread| self.lock_as(thread))
    }

    /// [`lock`](Self::lock) for an explicitly passed current thread.
    pub fn lock_as(&self, thread: &Thread) {
        self.check_prelock_state(thread);
        debug_assert!(!self.is_on_deck(thread.event()));

        if self.try_fast() || self.try_spin(Some(thread)) {
            self.set_owner(thread);
            return;
        }

        // Contended: let the runtime know this thread may block for a while.
        self.runtime.block_begin(thread);
        self.ilock(thread);
        self.runtime.block_end(thread);
        self.set_owner(thread);
    }

    /// Acquire the monitor without notifying the runtime that the thread
    /// may block.
    ///
    /// Only for code that the runtime knows cannot be holding up a
    /// safepoint.
    pub fn lock_without_safepoint_check(&self) {
        Thread::with_current(|thread| self.lock_without_safepoint_check_as(thread))
    }

    /// [`lock_without_safepoint_check`](Self::lock_without_safepoint_check)
    /// for an explicitly passed current thread.
    pub fn lock_without_safepoint_check_as(&self, thread: &Thread) {
        self.check_prelock_state(thread);
        debug_assert!(!self.is_on_deck(thread.event()));
        self.ilock(thread);
        self.set_owner(thread);
    }

    /// Try once to acquire the monitor without blocking or spinning.
    ///
    /// Returns `false` if it's held by anyone, including the caller.
    pub fn try_lock(&self) -> bool {
        Thread::with_current(|thread| self.try_lock_as(thread))
    }

    /// [`try_lock`](Self::try_lock) for an explicitly passed current thread.
    pub fn try_lock_as(&self, thread: &Thread) -> bool {
        // Not reentrant, and no rank check against itself: the owner just
        // fails.
        if self.owner.load(Relaxed) == thread.id().as_raw() {
            return false;
        }
        self.check_rank(thread);
        if self.try_lock_word() {
            self.set_owner(thread);
            true
        } else {
            false
        }
    }

    /// Take ownership while every other thread is stopped.
    ///
    /// If no thread has recorded itself as owner, ownership is taken without
    /// touching the lock word: a thread may have won the lock word and been
    /// stopped before recording itself, and it can't run again until the
    /// world resumes. The matching [`unlock`](Self::unlock) then leaves the
    /// lock word alone. Otherwise this is a plain [`try_lock`](Self::try_lock).
    ///
    /// # Panics
    ///
    /// Panics if `stopped` was issued by a different runtime than this
    /// monitor's.
    pub fn try_lock_assuming_world_stopped(&self, stopped: &WorldStopped<'_>) -> bool {
        assert!(
            stopped.is_for(self.runtime),
            "{}: WorldStopped token issued by a different runtime",
            self.name
        );
        debug_assert!(stopped.still_holds(), "world resumed under a WorldStopped token");

        Thread::with_current(|thread| {
            if self.owner.load(Relaxed) == 0 {
                self.set_owner(thread);
                self.snuck.store(true, Relaxed);
                true
            } else {
                self.try_lock_as(thread)
            }
        })
    }

    /// Release the monitor.
    ///
    /// # Panics
    ///
    /// Panics if the current thread doesn't own the monitor.
    pub fn unlock(&self) {
        Thread::with_current(|thread| self.unlock_as(thread))
    }

    /// [`unlock`](Self::unlock) for an explicitly passed current thread.
    pub fn unlock_as(&self, thread: &Thread) {
        self.clear_owner(thread);
        debug_assert!(!self.is_on_deck(thread.event()));

        if self.snuck.swap(false, Relaxed) {
            debug_assert!(self.runtime.is_world_stopped(), "{}: snuck past a running world", self.name);
            return;
        }
        self.iunlock(false, Some(thread.event()));
    }

    /// Acquire a [`Rank::NATIVE`] monitor from a thread that may not have a
    /// [`Thread`] record.
    ///
    /// On contention, the caller leases a transient event from the runtime's
    /// [`EventPool`](crate::EventPool) and returns it once it owns the
    /// monitor. No rank or reentrancy checks are made. Pair with
    /// [`raw_unlock`](Self::raw_unlock).
    pub fn raw_lock(&self) {
        assert_eq!(self.rank, Rank::NATIVE, "{}: raw_lock on a ranked monitor", self.name);

        if !(self.try_lock_word() || self.try_spin(None)) {
            let pool = self.runtime.event_pool();
            let event = pool.allocate();
            crate::arch::storeload();

            if !self.acquire_or_push(event) {
                self.acquire_as_successor(None, event);
            }
            pool.release(event);
        }

        debug_assert!(self.ilocked());
        debug_assert_eq!(self.owner.load(Relaxed), 0);
        let owner = Thread::try_with_current(|thread| thread.id().as_raw());
        self.owner.store(owner.unwrap_or(ANONYMOUS_OWNER), Relaxed);
    }

    /// Release a monitor acquired with [`raw_lock`](Self::raw_lock).
    pub fn raw_unlock(&self) {
        self.owner.store(0, Relaxed);
        if self.snuck.swap(false, Relaxed) {
            debug_assert!(self.runtime.is_world_stopped(), "{}: snuck past a running world", self.name);
            return;
        }
        self.iunlock(false, None);
    }

    /// Release the monitor, block until notified or until `timeout`
    /// elapses, and re-acquire it.
    ///
    /// With `no_safepoint_check` false the runtime's
    /// [`block_begin`](Runtime::block_begin) and
    /// [`block_end`](Runtime::block_end) hooks bracket the wait. With
    /// `as_suspend_equivalent`, a suspend request that arrived during the
    /// wait is honored after re-acquiring: the monitor is released while the
    /// thread is suspended, then acquired again.
    ///
    /// Returns `true` if the wait timed out and `false` if it was notified.
    /// Spurious wakeups are possible, so callers should re-check their
    /// condition in a loop.
    ///
    /// # Panics
    ///
    /// Panics if the current thread doesn't own the monitor, or if
    /// `as_suspend_equivalent` is requested without a safepoint check. Debug
    /// builds also panic when waiting while holding a lock of rank
    /// [`Rank::SPECIAL`] or lower.
    pub fn wait(
        &self,
        no_safepoint_check: bool,
        timeout: Option<Duration>,
        as_suspend_equivalent: bool,
    ) -> bool {
        Thread::with_current(|thread| {
            self.wait_as(thread, no_safepoint_check, timeout, as_suspend_equivalent)
        })
    }

    /// [`wait`](Self::wait) for an explicitly passed current thread.
    pub fn wait_as(
        &self,
        thread: &Thread,
        no_safepoint_check: bool,
        timeout: Option<Duration>,
        as_suspend_equivalent: bool,
    ) -> bool {
        assert!(
            !as_suspend_equivalent || !no_safepoint_check,
            "{}: as_suspend_equivalent requires a safepoint check",
            self.name
        );
        #[cfg(debug_assertions)]
        thread.check_wait(self.addr(), self.name, self.rank);

        // Conceptually give up ownership before abdicating the lock itself.
        self.clear_owner(thread);
        debug_assert!(self.ilocked());

        let timed_out = if no_safepoint_check {
            self.iwait(thread, timeout)
        } else {
            self.runtime.block_begin(thread);
            let timed_out = self.iwait(thread, timeout);
            if as_suspend_equivalent && self.runtime.take_suspend_request(thread) {
                // Whoever suspended us doesn't expect us to sit on the lock
                // while suspended.
                self.iunlock(true, Some(thread.event()));
                self.runtime.suspend_self(thread);
                self.ilock(thread);
            }
            self.runtime.block_end(thread);
            timed_out
        };

        debug_assert!(self.ilocked());
        self.set_owner(thread);
        timed_out
    }

    /// Move one waiting thread, if any, to the queue of lock contenders.
    ///
    /// # Panics
    ///
    /// Panics if the current thread doesn't own the monitor.
    pub fn notify(&self) {
        Thread::with_current(|thread| self.assert_owned_by(thread));
        self.inotify();
    }

    /// Move every waiting thread to the queue of lock contenders.
    ///
    /// # Panics
    ///
    /// Panics if the current thread doesn't own the monitor.
    pub fn notify_all(&self) {
        Thread::with_current(|thread| self.assert_owned_by(thread));
        while self.inotify() {}
    }

    /// The thread recorded as owner, if any.
    ///
    /// `raw_lock` callers without a [`Thread`] record show up as an
    /// anonymous id.
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.owner.load(Relaxed))
    }

    /// Whether the current thread owns the monitor.
    pub fn owned_by_self(&self) -> bool {
        let owned = Thread::try_with_current(|thread| {
            self.owner.load(Relaxed) == thread.id().as_raw()
        })
        .unwrap_or(false);
        debug_assert!(!owned || self.ilocked() || self.snuck.load(Relaxed));
        owned
    }

    /// Whether the lock bit is set. Racy unless the caller owns the monitor.
    pub fn is_locked(&self) -> bool {
        self.ilocked()
    }

    fn check_prelock_state(&self, thread: &Thread) {
        assert!(
            self.owner.load(Relaxed) != thread.id().as_raw(),
            "deadlock: {} is already owned by Thread[{}]",
            self.name,
            thread.id()
        );
        self.check_rank(thread);
    }

    /// Lock-order check, relaxed while the world is stopped.
    fn check_rank(&self, thread: &Thread) {
        #[cfg(debug_assertions)]
        if !self.runtime.is_world_stopped() {
            thread.check_rank(self.name, self.rank);
        }
        #[cfg(not(debug_assertions))]
        let _ = thread;
    }

    fn assert_owned_by(&self, thread: &Thread) {
        assert!(
            self.owner.load(Relaxed) == thread.id().as_raw(),
            "{} is not owned by Thread[{}]",
            self.name,
            thread.id()
        );
    }

    fn set_owner(&self, thread: &Thread) {
        debug_assert_eq!(
            self.owner.load(Relaxed),
            0,
            "setting the owner of already owned {}",
            self.name
        );
        #[cfg(debug_assertions)]
        thread.note_acquired(self.addr(), self.name, self.rank);
        self.owner.store(thread.id().as_raw(), Relaxed);
    }

    fn clear_owner(&self, thread: &Thread) {
        self.assert_owned_by(thread);
        #[cfg(debug_assertions)]
        thread.note_released(self.addr());
        self.owner.store(0, Relaxed);
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    fn is_on_deck(&self, event: &ParkEvent) -> bool {
        self.on_deck.load(SeqCst) == event as *const ParkEvent as usize
    }

    /// Clear OnDeck after its holder, `event`'s thread, took the lock. This
    /// also releases the inner lock.
    #[inline]
    fn clear_on_deck(&self, event: &ParkEvent) {
        debug_assert!(self.is_on_deck(event), "{}: OnDeck stolen", self.name);
        self.note_retired();
        self.on_deck.store(0, SeqCst);
    }

    #[inline]
    fn note_designated(&self) {
        #[cfg(test)]
        self.audit.designate();
    }

    #[inline]
    fn note_retired(&self) {
        #[cfg(test)]
        self.audit.retire();
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Monitor: [{:#x}/{:#x}] {} - owner: ",
            self.addr(),
            self.lock_word.load().raw(),
            self.name
        )?;
        match self.owner.load(Relaxed) {
            0 => f.write_str("none"),
            ANONYMOUS_OWNER => f.write_str("anonymous"),
            raw => write!(f, "Thread[#{}]", raw),
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("lock_word", &self.lock_word.load())
            .field("on_deck", &(self.on_deck.load(Relaxed) as *const ()))
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let busy = *self.owner.get_mut()
            | self.lock_word.load().raw()
            | *self.on_deck.get_mut()
            | *self.entry_list.get_mut() as usize
            | self.wait_set.get_mut().head as usize;
        debug_assert!(
            busy == 0,
            "{} destroyed while owned, contended or waited on",
            self
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::MonitorFlags;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        monitor: Monitor,
        counter: UnsafeCell<usize>,
    }

    unsafe impl Sync for Shared {}

    fn hammer(monitor: Monitor, threads: usize, iters: usize) -> Arc<Shared> {
        let shared = Arc::new(Shared {
            monitor,
            counter: UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..iters {
                        shared.monitor.lock();
                        unsafe { *shared.counter.get() += 1 };
                        if i % 64 == 0 {
                            thread::yield_now();
                        }
                        shared.monitor.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        shared
    }

    #[test]
    fn on_deck_is_never_designated_twice() {
        let shared = hammer(Monitor::new(Rank::LEAF, "audit"), 8, 5_000);
        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
        assert!(shared.monitor.audit.peak() <= 1);
        assert_eq!(shared.monitor.audit.claims(), 0);
        assert_eq!(shared.monitor.on_deck.load(SeqCst), 0);
    }

    #[test]
    fn on_deck_audit_with_barging_and_fifo_drain() {
        let knobs = Knobs {
            flags: MonitorFlags::BARGE_ON_DECK | MonitorFlags::FIFO_DRAIN,
            ..Knobs::DEFAULT
        };
        let shared = hammer(
            Monitor::new(Rank::LEAF, "audit-barge").with_knobs(knobs),
            8,
            5_000,
        );
        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
        assert!(shared.monitor.audit.peak() <= 1);
        assert_eq!(shared.monitor.audit.claims(), 0);
    }

    #[test]
    fn uniprocessor_knob_skips_spinning() {
        let knobs = Knobs {
            multiprocessor: Some(false),
            spin_limit: 0,
            ..Knobs::DEFAULT
        };
        let shared = hammer(
            Monitor::new(Rank::LEAF, "uniprocessor").with_knobs(knobs),
            4,
            2_000,
        );
        assert_eq!(unsafe { *shared.counter.get() }, 8_000);
        assert!(shared.monitor.audit.peak() <= 1);
    }

    #[test]
    fn display_shows_owner() {
        let monitor = Monitor::new(Rank::LEAF, "shown");
        assert!(monitor.to_string().ends_with("shown - owner: none"));
        monitor.lock();
        let id = monitor.owner().unwrap();
        assert!(monitor
            .to_string()
            .ends_with(&format!("shown - owner: Thread[{}]", id)));
        monitor.unlock();
    }

    #[test]
    fn try_lock_by_owner_fails() {
        let monitor = Monitor::new(Rank::LEAF, "held-twice");
        monitor.lock();
        assert!(!monitor.try_lock());
        assert!(monitor.owned_by_self());
        assert!(monitor.ilocked());
        monitor.unlock();
        assert!(monitor.try_lock());
        monitor.unlock();
    }

    #[test]
    fn unchecked_lock_under_contention() {
        let shared = Arc::new(Shared {
            monitor: Monitor::new(Rank::LEAF, "unchecked"),
            counter: UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        shared.monitor.lock_without_safepoint_check();
                        unsafe { *shared.counter.get() += 1 };
                        shared.monitor.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *shared.counter.get() }, 4_000);
        assert_eq!(shared.monitor.on_deck.load(SeqCst), 0);
        assert!(shared.monitor.audit.peak() <= 1);
    }

    #[test]
    fn lock_word_is_clean_after_contention() {
        let shared = hammer(Monitor::new(Rank::LEAF, "clean"), 4, 1_000);
        assert_eq!(shared.monitor.lock_word.load().raw(), 0);
        assert!(shared.monitor.entry_list.load(SeqCst).is_null());
    }
}
