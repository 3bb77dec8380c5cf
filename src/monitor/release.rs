//! Releasing the lock and choosing a successor.

use super::{Monitor, ON_DECK_LOCKED};
use crate::arch;
use crate::knobs::MonitorFlags;
use crate::park::ParkEvent;
use core::ptr::{self, null_mut};
use core::sync::atomic::Ordering::{Relaxed, SeqCst};

impl Monitor {
    /// Drop the lock bit and, if threads are queued and nobody has been
    /// designated yet, designate and wake a successor.
    ///
    /// `me` is the releasing thread's event, if it has one. `relax_assert`
    /// permits `me` to be queued already, as it is when `wait` releases the
    /// lock with its event on the WaitSet.
    pub(super) fn iunlock(&self, relax_assert: bool, me: Option<&ParkEvent>) {
        debug_assert!(self.ilocked(), "{} released while unlocked", self.name);

        self.lock_word.release();
        // The release must be visible before OnDeck is read, or a successor
        // that checks the lock word just before we drop the bit could park
        // forever.
        arch::storeload();

        let on_deck = self.on_deck.load(SeqCst);
        debug_assert!(
            relax_assert || me.map_or(true, |e| on_deck != e as *const ParkEvent as usize),
            "{}: released by its OnDeck thread",
            self.name
        );
        if on_deck != 0 {
            // A successor exists, or another releaser is choosing one and
            // will wake it. Stale unparks are harmless; events never die.
            if on_deck & ON_DECK_LOCKED == 0 {
                unsafe { (*(on_deck as *const ParkEvent)).unpark() };
            }
            return;
        }

        let word = self.lock_word.load();
        if !word.has_waiters() && self.entry_list.load(SeqCst).is_null() {
            return;
        }
        // Re-locked: succession is the new owner's duty.
        if word.is_locked() {
            return;
        }

        self.succession(relax_assert, me);
    }

    fn succession(&self, relax_assert: bool, me: Option<&ParkEvent>) {
        loop {
            // Only one thread at a time picks the successor.
            if self
                .on_deck
                .compare_exchange(0, ON_DECK_LOCKED, SeqCst, SeqCst)
                .is_err()
            {
                return;
            }

            let mut head = self.entry_list.load(Relaxed);
            if head.is_null() {
                head = self.drain_cxq();
            }
            if !head.is_null() {
                self.wake_one(head, relax_assert, me);
                return;
            }

            // Nothing to hand off. Drop the inner lock, then make sure no
            // thread queued on the cxq in the meantime without a releaser
            // left to notice.
            self.on_deck.store(0, SeqCst);
            arch::storeload();
            let word = self.lock_word.load();
            if !word.has_waiters() || word.is_locked() {
                return;
            }

            #[cfg(feature = "log")]
            log::trace!(
                target: "ondeck::monitor",
                "{}: cxq refilled during succession, retrying",
                self.name
            );
        }
    }

    /// Detach the whole cxq and make it the EntryList.
    ///
    /// Requires the inner lock and an empty EntryList. Returns the new
    /// EntryList head, or null if the cxq was empty or the lock was retaken.
    fn drain_cxq(&self) -> *mut ParkEvent {
        let mut word = self.lock_word.load();
        while word.has_waiters() {
            if word.is_locked() {
                return null_mut();
            }
            match self.lock_word.cas(word, word.without_cxq()) {
                Ok(_) => {
                    let mut chain = word.cxq() as *mut ParkEvent;
                    if self.knobs.flags.contains(MonitorFlags::FIFO_DRAIN) {
                        chain = unsafe { reverse(chain) };
                    }
                    self.entry_list.store(chain, Relaxed);
                    return chain;
                }
                Err(now) => word = now,
            }
        }
        null_mut()
    }

    /// Pop `head` off the EntryList, make it OnDeck, and wake it unless the
    /// lock was retaken in the meantime.
    fn wake_one(&self, head: *mut ParkEvent, relax_assert: bool, me: Option<&ParkEvent>) {
        let successor = unsafe { &*head };
        debug_assert!(
            relax_assert || me.map_or(true, |e| !ptr::eq(e, successor)),
            "{}: releasing thread chose itself",
            self.name
        );
        debug_assert_eq!(self.on_deck.load(Relaxed), ON_DECK_LOCKED);

        self.entry_list
            .store(successor.list_next.load(Relaxed), Relaxed);

        self.note_designated();
        self.on_deck.store(head as usize, SeqCst);

        #[cfg(feature = "log")]
        log::trace!(
            target: "ondeck::monitor",
            "{}: {:p} is OnDeck",
            self.name,
            successor
        );

        // If somebody holds the lock now, the successor's wakeup is theirs
        // to deliver when they release it.
        arch::storeload();
        if self.lock_word.load().is_locked() {
            return;
        }
        successor.unpark();
    }
}

/// Reverse a `list_next` chain in place.
///
/// # Safety
///
/// Every node on the chain must be live and owned by the caller.
unsafe fn reverse(mut node: *mut ParkEvent) -> *mut ParkEvent {
    let mut reversed = null_mut();
    while !node.is_null() {
        let next = (*node).list_next.load(Relaxed);
        (*node).list_next.store(reversed, Relaxed);
        reversed = node;
        node = next;
    }
    reversed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::Knobs;
    use crate::lock_word::Word;
    use crate::rank::Rank;

    fn chain(events: &[ParkEvent]) -> *mut ParkEvent {
        let mut head = null_mut();
        for event in events {
            event.list_next.store(head, Relaxed);
            head = event as *const ParkEvent as *mut ParkEvent;
        }
        head
    }

    #[test]
    fn reverse_restores_arrival_order() {
        let events = [ParkEvent::new(), ParkEvent::new(), ParkEvent::new()];
        let head = chain(&events);
        assert_eq!(head as *const ParkEvent, &events[2] as *const ParkEvent);

        let reversed = unsafe { reverse(head) };
        assert_eq!(reversed as *const ParkEvent, &events[0] as *const ParkEvent);
        assert_eq!(
            events[0].list_next.load(Relaxed) as *const ParkEvent,
            &events[1] as *const ParkEvent
        );
        assert!(events[2].list_next.load(Relaxed).is_null());
        assert!(unsafe { reverse(null_mut()) }.is_null());
    }

    fn drained_head(knobs: Knobs, events: &[ParkEvent]) -> *mut ParkEvent {
        let monitor = Monitor::new(Rank::LEAF, "drain").with_knobs(knobs);
        let head = chain(events);
        monitor
            .lock_word
            .cas(Word::UNLOCKED, Word::pack(head, false))
            .unwrap();
        monitor.on_deck.store(ON_DECK_LOCKED, SeqCst);

        let drained = monitor.drain_cxq();
        assert_eq!(monitor.lock_word.load(), Word::UNLOCKED);
        assert_eq!(monitor.entry_list.load(Relaxed), drained);

        // Leave the monitor idle for its drop check.
        monitor.entry_list.store(null_mut(), Relaxed);
        monitor.on_deck.store(0, SeqCst);
        drained
    }

    #[test]
    fn drain_is_lifo_by_default_and_fifo_on_request() {
        let events = [ParkEvent::new(), ParkEvent::new()];
        assert_eq!(
            drained_head(Knobs::DEFAULT, &events) as *const ParkEvent,
            &events[1] as *const ParkEvent
        );

        let events = [ParkEvent::new(), ParkEvent::new()];
        let fifo = Knobs {
            flags: MonitorFlags::FIFO_DRAIN,
            ..Knobs::DEFAULT
        };
        assert_eq!(
            drained_head(fifo, &events) as *const ParkEvent,
            &events[0] as *const ParkEvent
        );
    }

    #[test]
    fn drain_backs_off_when_relocked() {
        let monitor = Monitor::new(Rank::LEAF, "relocked");
        let event = ParkEvent::new();
        monitor
            .lock_word
            .cas(Word::UNLOCKED, Word::pack(&event, true))
            .unwrap();
        assert!(monitor.drain_cxq().is_null());
        assert!(monitor.lock_word.load().has_waiters());

        monitor
            .lock_word
            .cas(Word::pack(&event, true), Word::UNLOCKED)
            .unwrap();
    }

    #[test]
    fn release_designates_and_wakes_the_queued_thread() {
        let monitor = Monitor::new(Rank::LEAF, "handoff");
        let event = ParkEvent::new();
        assert!(monitor.try_fast());
        assert!(!monitor.acquire_or_push(&event));

        monitor.iunlock(false, None);
        assert!(!monitor.ilocked());
        assert!(monitor.is_on_deck(&event));
        assert!(monitor.entry_list.load(Relaxed).is_null());
        assert!(!monitor.lock_word.load().has_waiters());
        // The pending unpark makes this return at once.
        assert_eq!(event.park(None), crate::park::ParkResult::Unparked);

        monitor.acquire_as_successor(None, &event);
        assert!(monitor.ilocked());
        assert_eq!(monitor.on_deck.load(SeqCst), 0);
        monitor.iunlock(false, None);
    }
}
