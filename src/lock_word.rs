//! The monitor's lock word: a `LOCKED` bit packed with the head of the
//! contention queue (cxq).
//!
//! | bits 1.. (`word & !LOCKED`) | bit 0 (`LOCKED`) | meaning                          |
//! |:----------------------------|:-----------------|:---------------------------------|
//! | 0                           | 0                | unlocked, nobody queued          |
//! | 0                           | 1                | locked, nobody queued            |
//! | `*const ParkEvent`          | 0                | unlocked, cxq not yet drained    |
//! | `*const ParkEvent`          | 1                | locked, threads queued on cxq    |
//!
//! `ParkEvent` is aligned to 64 bytes, so bit 0 of an event address is always
//! clear.

use crate::park::ParkEvent;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::SeqCst;

const LOCKED: usize = 1;

/// A snapshot of the lock word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Word(usize);

impl Word {
    pub(crate) const UNLOCKED: Self = Self(0);
    pub(crate) const LOCKED: Self = Self(LOCKED);

    /// Pack a cxq head and the lock bit.
    #[inline]
    pub(crate) fn pack(head: *const ParkEvent, locked: bool) -> Self {
        let addr = head as usize;
        debug_assert_eq!(addr & LOCKED, 0, "misaligned ParkEvent");
        Self(addr | locked as usize)
    }

    #[inline]
    pub(crate) fn is_locked(self) -> bool {
        self.0 & LOCKED != 0
    }

    /// The cxq head, or null.
    #[inline]
    pub(crate) fn cxq(self) -> *const ParkEvent {
        (self.0 & !LOCKED) as *const ParkEvent
    }

    #[inline]
    pub(crate) fn has_waiters(self) -> bool {
        self.0 & !LOCKED != 0
    }

    /// The same queue, with the lock bit set.
    #[inline]
    pub(crate) fn with_locked(self) -> Self {
        Self(self.0 | LOCKED)
    }

    /// The lock bit alone, with the queue detached.
    #[inline]
    pub(crate) fn without_cxq(self) -> Self {
        Self(self.0 & LOCKED)
    }

    #[inline]
    pub(crate) fn raw(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for Word {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The atomic lock word.
///
/// Every transition is a sequentially consistent CAS, which doubles as the
/// acquire fence for whoever takes the lock.
pub(crate) struct LockWord(AtomicUsize);

impl LockWord {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub(crate) fn load(&self) -> Word {
        Word(self.0.load(SeqCst))
    }

    #[inline]
    pub(crate) fn cas(&self, current: Word, new: Word) -> Result<Word, Word> {
        self.0
            .compare_exchange(current.0, new.0, SeqCst, SeqCst)
            .map(Word)
            .map_err(Word)
    }

    /// Drop the lock bit, leaving the queue intact, and return the word as
    /// it was just before.
    ///
    /// Callers that go on to inspect OnDeck must issue a store-load fence
    /// first.
    #[inline]
    pub(crate) fn release(&self) -> Word {
        Word(self.0.fetch_and(!LOCKED, SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing() {
        let event = ParkEvent::new();
        let head = &event as *const ParkEvent;

        let w = Word::pack(head, false);
        assert!(!w.is_locked());
        assert!(w.has_waiters());
        assert_eq!(w.cxq(), head);

        let locked = w.with_locked();
        assert!(locked.is_locked());
        assert_eq!(locked.cxq(), head);
        assert_eq!(locked.without_cxq(), Word::LOCKED);
        assert_eq!(w.without_cxq(), Word::UNLOCKED);

        assert!(!Word::LOCKED.has_waiters());
        assert!(Word::LOCKED.cxq().is_null());
    }

    #[test]
    fn release_keeps_queue() {
        let event = ParkEvent::new();
        let word = LockWord::new();
        let queued = Word::pack(&event, true);
        assert_eq!(word.cas(Word::UNLOCKED, queued), Ok(Word::UNLOCKED));
        assert_eq!(word.cas(Word::UNLOCKED, Word::LOCKED), Err(queued));

        assert_eq!(word.release(), queued);
        let after = word.load();
        assert!(!after.is_locked());
        assert_eq!(after.cxq(), &event as *const ParkEvent);
    }
}
