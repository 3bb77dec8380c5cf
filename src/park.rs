//! Per-thread parking, on top of Linux `futex`.
//!
//! The futex wrappers are derived from origin's src/sync/wait_wake.rs in
//! mustang, itself derived from Rust's library/std/src/sys/unix/futex.rs.
//! Here the caller computes the deadline once. The event protocol on top of
//! them is the three-state parker used by std's `thread::park`, with an
//! explicit `reset` so that a stale `unpark` can be discarded before a thread enqueues
//! itself somewhere new.

use core::ptr::null_mut;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32};
use core::time::Duration;
use rustix::thread::{FutexFlags, FutexOperation};
use rustix::time::{ClockId, Timespec};

/// Compute the absolute `CLOCK_MONOTONIC` time `timeout` from now.
///
/// Overflows are rounded up to an infinite timeout (None).
fn deadline_after(timeout: Duration) -> Option<Timespec> {
    let now = rustix::time::clock_gettime(ClockId::Monotonic);
    let plus = Duration::new(now.tv_sec as u64, now.tv_nsec as _).checked_add(timeout)?;
    Some(Timespec {
        tv_sec: plus.as_secs() as i64,
        tv_nsec: plus.subsec_nanos() as _,
    })
}

/// Wait for a `futex_wake` operation to wake us.
///
/// Returns directly if the futex doesn't hold the expected value.
///
/// Returns false on timeout, and true in all other cases.
fn futex_wait(futex: &AtomicU32, expected: u32, deadline: Option<&Timespec>) -> bool {
    use core::ptr::null;

    loop {
        // No need to wait if the value already changed.
        if futex.load(Relaxed) != expected {
            return true;
        }

        let r = unsafe {
            // Use FUTEX_WAIT_BITSET rather than FUTEX_WAIT to be able to give an
            // absolute time rather than a relative time.
            rustix::thread::futex(
                futex.as_ptr(),
                FutexOperation::WaitBitset,
                FutexFlags::PRIVATE,
                expected,
                deadline.map_or(null(), |t| t as *const _),
                null_mut(),
                !0u32, // A full bitmask, to make it behave like a regular FUTEX_WAIT.
            )
        };

        match r {
            Err(rustix::io::Errno::TIMEDOUT) => return false,
            Err(rustix::io::Errno::INTR) => continue,
            _ => return true,
        }
    }
}

/// Wake up one thread that's blocked on `futex_wait` on this futex.
///
/// Returns true if this actually woke up such a thread,
/// or false if no thread was waiting on this futex.
fn futex_wake(futex: &AtomicU32) -> bool {
    use core::ptr::null;
    unsafe {
        rustix::thread::futex(
            futex.as_ptr(),
            FutexOperation::Wake,
            FutexFlags::PRIVATE,
            1,
            null(),
            null_mut(),
            0,
        )
        .map_or(false, |woken| woken > 0)
    }
}

// The event is neutral: `park` will block.
const EMPTY: u32 = 0;
// An `unpark` is pending: the next `park` consumes it and returns.
const NOTIFIED: u32 = 1;
// The owning thread is (about to be) blocked in `futex_wait`.
const PARKED: u32 = u32::MAX;

/// How a call to [`ParkEvent::park`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkResult {
    /// An `unpark` was consumed, or the wakeup was spurious.
    Unparked,
    /// The timeout elapsed without an `unpark`.
    TimedOut,
}

/// A per-thread blocking handle.
///
/// Only the thread that owns an event may `reset` or `park` it; any thread
/// may `unpark` it, any number of times. Events handed out by an
/// [`EventPool`](crate::EventPool) are never freed, so an `unpark` through a
/// stale reference is always memory-safe: at worst it produces a spurious
/// wakeup, which every parking loop in this crate tolerates.
///
/// The alignment keeps the low bit of an event's address free for the lock
/// word's `LOCKED` flag and keeps hot events off each other's cache lines.
#[repr(C, align(64))]
pub struct ParkEvent {
    state: AtomicU32,

    /// Link for whichever list the event is on: cxq, EntryList, WaitSet, or
    /// the pool's free list. An event is on at most one of them at a time.
    pub(crate) list_next: AtomicPtr<ParkEvent>,

    /// Set by `notify` once the event has been moved from a WaitSet onto a
    /// contention queue.
    pub(crate) notified: AtomicBool,
}

impl ParkEvent {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY),
            list_next: AtomicPtr::new(null_mut()),
            notified: AtomicBool::new(false),
        }
    }

    /// Discard any pending `unpark`.
    ///
    /// The caller must follow this with a full fence before publishing the
    /// event on a queue, so a waker can't observe the event queued and then
    /// have its `unpark` overwritten by the reset.
    #[inline]
    pub fn reset(&self) {
        self.state.store(EMPTY, Relaxed);
    }

    /// Block until `unpark` is called or `timeout` elapses.
    ///
    /// A pending `unpark` is consumed immediately. Spurious wakeups are
    /// possible and reported as [`ParkResult::Unparked`].
    pub fn park(&self, timeout: Option<Duration>) -> ParkResult {
        // Change NOTIFIED=>EMPTY or EMPTY=>PARKED, and directly return in the
        // first case.
        if self.state.fetch_sub(1, Acquire) == NOTIFIED {
            return ParkResult::Unparked;
        }

        let deadline = timeout.and_then(deadline_after);
        loop {
            let in_time = futex_wait(&self.state, PARKED, deadline.as_ref());

            if self
                .state
                .compare_exchange(NOTIFIED, EMPTY, Acquire, Acquire)
                .is_ok()
            {
                return ParkResult::Unparked;
            }

            if !in_time {
                // Leave the PARKED state. An `unpark` may still land between
                // the timeout and here, in which case it counts.
                return if self.state.swap(EMPTY, Acquire) == NOTIFIED {
                    ParkResult::Unparked
                } else {
                    ParkResult::TimedOut
                };
            }

            // Spurious wakeup from the futex itself; keep waiting. Callers
            // are also prepared for spurious returns, but the deadline is
            // already fixed so there's no reason to push the retry up to them.
        }
    }

    /// Wake the owning thread, or make its next `park` return immediately.
    #[inline]
    pub fn unpark(&self) {
        if self.state.swap(NOTIFIED, Release) == PARKED {
            futex_wake(&self.state);
        }
    }
}

impl core::fmt::Debug for ParkEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParkEvent")
            .field("addr", &(self as *const Self))
            .field("state", &self.state.load(Relaxed))
            .field("notified", &self.notified.load(Relaxed))
            .finish()
    }
}
