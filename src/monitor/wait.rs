//! Condition waits: the WaitSet, `wait` and `notify`.

use super::{Monitor, WaitSet};
use crate::knobs::MonitorFlags;
use crate::lock_word::Word;
use crate::park::ParkEvent;
use crate::thread::Thread;
use core::ptr;
use core::sync::atomic::fence;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::time::Duration;
use std::time::Instant;

impl WaitSet {
    fn push(&mut self, event: &ParkEvent) {
        event.list_next.store(self.head, Relaxed);
        self.head = event as *const ParkEvent as *mut ParkEvent;
    }

    fn pop(&mut self) -> Option<&'static ParkEvent> {
        // Events on the WaitSet are leased from a pool and never freed.
        let head = unsafe { self.head.as_ref()? };
        self.head = head.list_next.load(Relaxed);
        Some(head)
    }

    /// Remove `event`, which must be on the set.
    fn unlink(&mut self, event: &ParkEvent) {
        let target = event as *const ParkEvent as *mut ParkEvent;
        let next = event.list_next.load(Relaxed);
        if self.head == target {
            self.head = next;
            return;
        }

        let mut prev = self.head;
        while !prev.is_null() {
            let prev_ref = unsafe { &*prev };
            let cur = prev_ref.list_next.load(Relaxed);
            if cur == target {
                prev_ref.list_next.store(next, Relaxed);
                return;
            }
            prev = cur;
        }
        debug_assert!(false, "waiter missing from the WaitSet");
    }
}

impl Monitor {
    /// Park on the WaitSet until notified or until `timeout` elapses, then
    /// re-acquire the lock.
    ///
    /// Called holding the lock bit, with ownership already cleared. Returns
    /// `true` if the wait timed out.
    pub(super) fn iwait(&self, thread: &Thread, timeout: Option<Duration>) -> bool {
        debug_assert!(self.ilocked());
        let event = thread.event();

        event.notified.store(false, Relaxed);
        event.reset();
        fence(SeqCst);

        self.wait_set.lock().push(event);

        // The waiter is on the WaitSet, not a queue, so it's fine for it to
        // be the thread doing this release.
        self.iunlock(true, Some(event));

        // A timeout too large to represent is no timeout at all.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if event.notified.load(SeqCst) {
                break;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.park_common(event, remaining);
            if self.knobs.flags.contains(MonitorFlags::WAKE_RETURNS_FROM_WAIT) {
                break;
            }
        }

        fence(SeqCst);

        // Decide whether we were notified or gave up. `notify` sets the flag
        // under the WaitLock, so checking it again under the lock is final.
        let mut was_on_wait_set = false;
        if !event.notified.load(SeqCst) {
            let mut wait_set = self.wait_set.lock();
            if !event.notified.load(SeqCst) {
                debug_assert!(!self.is_on_deck(event));
                wait_set.unlink(event);
                was_on_wait_set = true;
            }
        }

        #[cfg(feature = "log")]
        if was_on_wait_set {
            log::trace!(
                target: "ondeck::monitor",
                "Thread[{}] timed out waiting on {}",
                thread.id(),
                self.name
            );
        }

        if was_on_wait_set {
            // Nobody knows about us anymore; contend like a new arrival.
            self.ilock(thread);
        } else {
            // We were moved to the cxq and will be made OnDeck in due course.
            self.acquire_as_successor(Some(thread), event);
        }

        debug_assert!(self.ilocked());
        debug_assert!(!self.is_on_deck(event));
        was_on_wait_set
    }

    /// Move the WaitSet head to the cxq.
    ///
    /// The caller owns the monitor, so the notified thread can't run until
    /// the monitor is released. Returns `false` if nobody was waiting.
    pub(super) fn inotify(&self) -> bool {
        let notified = {
            let mut wait_set = self.wait_set.lock();
            let Some(event) = wait_set.pop() else {
                return false;
            };
            debug_assert!(!event.notified.load(Relaxed));

            self.push_cxq(event);
            fence(SeqCst);
            event.notified.store(true, SeqCst);
            event
        };

        #[cfg(feature = "log")]
        log::trace!(
            target: "ondeck::monitor",
            "{}: notified {:p}",
            self.name,
            notified
        );

        if self
            .knobs
            .flags
            .contains(MonitorFlags::EAGER_NOTIFY_UNPARK)
        {
            notified.unpark();
        }
        true
    }

    /// Push `event` onto the cxq, leaving the lock bit as it is.
    fn push_cxq(&self, event: &ParkEvent) {
        let mut word = self.lock_word.load();
        loop {
            debug_assert!(
                word.is_locked() || self.snuck.load(Relaxed),
                "{}: cxq push on an unlocked monitor",
                self.name
            );
            debug_assert!(!ptr::eq(word.cxq(), event));
            event.list_next.store(word.cxq() as *mut ParkEvent, Relaxed);
            match self
                .lock_word
                .cas(word, Word::pack(event, word.is_locked()))
            {
                Ok(_) => return,
                Err(now) => word = now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::Rank;
    use core::ptr::null_mut;

    #[test]
    fn unlink_from_anywhere() {
        let events = [ParkEvent::new(), ParkEvent::new(), ParkEvent::new()];
        let mut set = WaitSet { head: null_mut() };
        for event in &events {
            set.push(event);
        }

        set.unlink(&events[1]);
        assert!(ptr::eq(set.pop().unwrap(), &events[2]));
        set.push(&events[2]);
        set.unlink(&events[2]);
        assert!(ptr::eq(set.pop().unwrap(), &events[0]));
        assert!(set.pop().is_none());
    }

    #[test]
    fn notify_without_waiters_is_a_no_op() {
        let monitor = Monitor::new(Rank::LEAF, "empty");
        monitor.lock();
        assert!(!monitor.inotify());
        monitor.notify();
        monitor.notify_all();
        assert!(!monitor.lock_word.load().has_waiters());
        monitor.unlock();
    }

    #[test]
    fn timed_wait_alone_times_out() {
        let monitor = Monitor::new(Rank::LEAF, "alone");
        monitor.lock();
        assert!(monitor.wait(true, Some(Duration::from_millis(10)), false));
        assert!(monitor.owned_by_self());
        assert!(monitor.wait_set.lock().head.is_null());
        monitor.unlock();
    }
}
