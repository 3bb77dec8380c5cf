//! Acquiring the lock: fast path, bounded spinning, and the blocking slow
//! path through the cxq and OnDeck.

use super::Monitor;
use crate::arch;
use crate::knobs::MonitorFlags;
use crate::lock_word::Word;
use crate::park::{ParkEvent, ParkResult};
use crate::spin::stall;
use crate::thread::Thread;
use core::sync::atomic::fence;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::time::Duration;

impl Monitor {
    #[inline]
    pub(crate) fn ilocked(&self) -> bool {
        self.lock_word.load().is_locked()
    }

    /// Set the lock bit if it's clear, retrying only while the CAS fails
    /// because the queue changed.
    pub(super) fn try_lock_word(&self) -> bool {
        self.try_lock_from(self.lock_word.load())
    }

    fn try_lock_from(&self, mut word: Word) -> bool {
        loop {
            if word.is_locked() {
                return false;
            }
            match self.lock_word.cas(word, word.with_locked()) {
                Ok(_) => return true,
                Err(now) => word = now,
            }
        }
    }

    /// Optimistically assume an idle monitor, then fall back to
    /// [`try_lock_word`](Self::try_lock_word).
    #[inline]
    pub(super) fn try_fast(&self) -> bool {
        match self.lock_word.cas(Word::UNLOCKED, Word::LOCKED) {
            Ok(_) => true,
            Err(word) => self.try_lock_from(word),
        }
    }

    /// Spin for the lock, with randomized exponential backoff.
    ///
    /// Each probe costs a pause instruction; every eighth probe the stall
    /// between probes grows, up to 2047 rounds of the xor-shift generator.
    /// Stalls don't write shared memory. Gives up after `spin_limit` probes,
    /// immediately on a uniprocessor, or when the runtime reports a pending
    /// safepoint. `thread` supplies the generator state; callers without one
    /// start from a fixed seed.
    pub(super) fn try_spin(&self, thread: Option<&Thread>) -> bool {
        if self.try_lock_word() {
            return true;
        }
        if !self.knobs.is_multiprocessor() {
            return false;
        }

        let flags = self.knobs.flags;
        let check_safepoint = !flags.contains(MonitorFlags::IGNORE_SAFEPOINT_IN_SPIN);
        let mut rv = thread.map_or(0, Thread::rng);
        let mut probes = 0_u32;
        let mut delay = 0_u32;

        let acquired = loop {
            let word = self.lock_word.load();
            if !word.is_locked() {
                if self.lock_word.cas(word, word.with_locked()).is_ok() {
                    break true;
                }
                // The queue moved under us; probe again without counting it.
                continue;
            }

            if !flags.contains(MonitorFlags::NO_SPIN_PAUSE) {
                arch::spin_pause();
            }

            probes += 1;
            if probes > self.knobs.spin_limit {
                break false;
            }
            if probes & 7 == 0 {
                delay = ((delay << 1) | 1) & 0x7ff;
            }

            // Get out of the way of a pending safepoint.
            if check_safepoint && self.runtime.safepoint_pending() {
                break false;
            }
            if !flags.contains(MonitorFlags::NO_BACKOFF) {
                rv = stall(delay, rv);
            }
        };

        if let Some(thread) = thread {
            thread.set_rng(rv);
        }
        acquired
    }

    /// Acquire the lock if it's free, or else push `event` onto the cxq, in
    /// one atomic step.
    ///
    /// Returns `true` if the lock was acquired; `false` means `event` is
    /// queued and its thread has to wait to be made successor.
    pub(super) fn acquire_or_push(&self, event: &ParkEvent) -> bool {
        let mut word = self.lock_word.load();
        loop {
            let next = if word.is_locked() {
                event.list_next.store(word.cxq() as *mut ParkEvent, Relaxed);
                Word::pack(event, true)
            } else {
                word.with_locked()
            };
            match self.lock_word.cas(word, next) {
                Ok(_) => return !word.is_locked(),
                Err(now) => word = now,
            }
        }
    }

    /// The blocking slow path of `lock`.
    ///
    /// Returns holding the lock bit, with OnDeck free of this thread's event.
    pub(super) fn ilock(&self, thread: &Thread) {
        let event = thread.event();
        debug_assert!(
            !self.is_on_deck(event),
            "{}: OnDeck holder entered the slow path",
            self.name
        );

        if self.try_fast() || self.try_spin(Some(thread)) {
            return;
        }

        #[cfg(feature = "log")]
        log::trace!(
            target: "ondeck::monitor",
            "Thread[{}] blocking on {}",
            thread.id(),
            self.name
        );

        event.reset();
        fence(SeqCst);

        let barged = self.knobs.flags.contains(MonitorFlags::BARGE_ON_DECK)
            && self
                .on_deck
                .compare_exchange(0, event as *const ParkEvent as usize, SeqCst, SeqCst)
                .is_ok();
        if barged {
            self.note_designated();
        } else if self.acquire_or_push(event) {
            return;
        }

        self.acquire_as_successor(Some(thread), event);
    }

    /// Park until `event` is OnDeck, then contend for the lock until it's
    /// won, and finally clear OnDeck.
    ///
    /// Only the OnDeck thread spins here, so the lock sees at most one
    /// contender from the queues at a time.
    pub(super) fn acquire_as_successor(&self, thread: Option<&Thread>, event: &ParkEvent) {
        loop {
            if self.is_on_deck(event) && self.try_spin(thread) {
                break;
            }
            self.park_common(event, None);
        }
        self.clear_on_deck(event);
    }

    /// Park on `event`, bounded by the `park_timeout` knob when it's set.
    pub(super) fn park_common(&self, event: &ParkEvent, timeout: Option<Duration>) -> ParkResult {
        let timeout = match (timeout, self.knobs.park_timeout) {
            (Some(t), Some(cap)) => Some(t.min(cap)),
            (t, cap) => t.or(cap),
        };
        event.park(timeout)
    }
}
