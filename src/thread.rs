//! Per-thread monitor state.

use crate::park::ParkEvent;
use crate::pool::EventPool;
#[cfg(debug_assertions)]
use crate::rank::Rank;
#[cfg(debug_assertions)]
use core::cell::RefCell;
use core::cell::{Cell, OnceCell};
use core::fmt;
use core::num::NonZeroUsize;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::Relaxed;

/// A thread's identity, as recorded in a monitor's owner field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    /// The raw value; never zero.
    pub fn as_raw(self) -> usize {
        self.0.get()
    }

    pub(crate) fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data associated with a thread that uses monitors.
///
/// Every thread gets one lazily on first use, leasing its [`ParkEvent`] from
/// [`EventPool::global`]; [`Thread::attach`] installs one backed by a
/// different pool instead. The event goes back to its pool when the thread
/// exits.
///
/// `Thread` is neither `Send` nor `Sync`: a `&Thread` can only be obtained
/// on the thread it describes.
pub struct Thread {
    id: ThreadId,
    event: &'static ParkEvent,
    pool: &'static EventPool,

    /// Xor-shift state for spin backoff.
    rng: Cell<u32>,

    /// Monitors this thread owns, for lock-rank checking.
    #[cfg(debug_assertions)]
    owned: RefCell<Vec<HeldLock>>,
}

#[cfg(debug_assertions)]
#[derive(Clone, Copy)]
struct HeldLock {
    addr: usize,
    rank: Rank,
    name: &'static str,
}

thread_local! {
    static CURRENT: OnceCell<Thread> = const { OnceCell::new() };
}

impl Thread {
    fn new(pool: &'static EventPool) -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

        // Ids start at 1, leaving 0 to mean "no owner".
        let raw = NEXT_ID.fetch_add(1, Relaxed);
        let id = ThreadId(NonZeroUsize::MIN.saturating_add(raw.wrapping_sub(1)));
        let thread = Self {
            id,
            event: pool.allocate(),
            pool,
            rng: Cell::new((raw as u32).wrapping_mul(0x9e37_79b9) | 1),
            #[cfg(debug_assertions)]
            owned: RefCell::new(Vec::new()),
        };

        #[cfg(feature = "log")]
        log::trace!(
            target: "ondeck::thread",
            "Thread[{}] attached with {:p}",
            id,
            thread.event
        );

        thread
    }

    /// Call `f` with the current thread's record, creating it if needed.
    pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
        CURRENT.with(|cell| f(cell.get_or_init(|| Thread::new(EventPool::global()))))
    }

    /// Call `f` with the current thread's record if it already has one.
    ///
    /// Returns `None` for threads that never used a monitor (or called
    /// [`Thread::attach`]), and during thread-local destruction.
    pub fn try_with_current<R>(f: impl FnOnce(&Thread) -> R) -> Option<R> {
        CURRENT.try_with(|cell| cell.get().map(f)).ok().flatten()
    }

    /// Give the current thread a record whose event is leased from `pool`.
    ///
    /// Returns `false`, changing nothing, if the thread already has one.
    pub fn attach(pool: &'static EventPool) -> bool {
        CURRENT.with(|cell| cell.get().is_none() && cell.set(Thread::new(pool)).is_ok())
    }

    /// This thread's identity.
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// This thread's event, used whenever it blocks on a monitor.
    #[inline]
    pub fn event(&self) -> &'static ParkEvent {
        self.event
    }

    #[inline]
    pub(crate) fn rng(&self) -> u32 {
        self.rng.get()
    }

    #[inline]
    pub(crate) fn set_rng(&self, rv: u32) {
        self.rng.set(rv)
    }

    /// Panic if acquiring a monitor of `rank` would violate the lock order.
    #[cfg(debug_assertions)]
    pub(crate) fn check_rank(&self, name: &'static str, rank: Rank) {
        if rank.is_exempt() {
            return;
        }
        let owned = self.owned.borrow();
        if let Some(least) = owned.iter().min_by_key(|held| held.rank) {
            if least.rank <= rank {
                let (least_name, least_rank) = (least.name, least.rank);
                drop(owned);
                panic!(
                    "acquiring lock {}/{} out of order with lock {}/{} -- possible deadlock",
                    name, rank, least_name, least_rank
                );
            }
        }
    }

    /// Panic if this thread holds a lock, other than `addr`, that it must
    /// not block while holding.
    #[cfg(debug_assertions)]
    pub(crate) fn check_wait(&self, addr: usize, name: &'static str, rank: Rank) {
        let owned = self.owned.borrow();
        let least = owned
            .iter()
            .filter(|held| held.addr != addr)
            .min_by_key(|held| held.rank)
            .copied();
        drop(owned);
        if let Some(least) = least {
            if least.rank <= Rank::SPECIAL {
                panic!(
                    "attempting to wait on monitor {}/{} while holding lock {}/{} -- possible deadlock",
                    name, rank, least.name, least.rank
                );
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn note_acquired(&self, addr: usize, name: &'static str, rank: Rank) {
        self.owned.borrow_mut().push(HeldLock { addr, rank, name });
    }

    #[cfg(debug_assertions)]
    pub(crate) fn note_released(&self, addr: usize) {
        let mut owned = self.owned.borrow_mut();
        match owned.iter().rposition(|held| held.addr == addr) {
            Some(i) => {
                owned.remove(i);
            }
            None => {
                drop(owned);
                panic!("removing a lock not owned by Thread[{}]", self.id);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.pool.release(self.event);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("event", &(self.event as *const ParkEvent))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ids_are_per_thread_and_stable() {
        let here = Thread::with_current(|t| t.id());
        assert_eq!(Thread::with_current(|t| t.id()), here);
        assert_eq!(Thread::try_with_current(|t| t.id()), Some(here));

        let there = thread::spawn(|| Thread::with_current(|t| t.id()))
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn unattached_threads_have_no_record() {
        let seen = thread::spawn(|| Thread::try_with_current(|t| t.id()))
            .join()
            .unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn attach_uses_the_given_pool_and_returns_the_event() {
        static POOL: EventPool = EventPool::new();
        thread::spawn(|| {
            assert!(Thread::attach(&POOL));
            assert!(!Thread::attach(&POOL));
            assert_eq!(POOL.allocated(), 1);
            assert_eq!(POOL.idle(), 0);
        })
        .join()
        .unwrap();
        assert_eq!(POOL.idle(), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "out of order")]
    fn rank_order_is_enforced() {
        Thread::with_current(|t| {
            t.note_acquired(1, "outer", Rank::LEAF);
            t.check_rank("inner", Rank::NONLEAF);
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    fn decreasing_ranks_are_fine() {
        Thread::with_current(|t| {
            t.note_acquired(1, "outer", Rank::NONLEAF);
            t.check_rank("inner", Rank::LEAF);
            t.check_rank("foreign", Rank::NATIVE);
            t.note_released(1);
            t.check_rank("anything", Rank::MAX_NONLEAF);
        });
    }
}
