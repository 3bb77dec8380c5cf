//! Immortal `ParkEvent` allocation.

use crate::park::ParkEvent;
use crate::spin::{RawSpinLock, SpinMutex};
use core::ptr::null_mut;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::Relaxed;
use lock_api::RawMutex as _;

/// A source of [`ParkEvent`]s.
///
/// Events are allocated on demand and never freed; `release` puts them on a
/// free list for the next `allocate`. Keeping events type-stable is what lets
/// a releasing thread `unpark` a successor it read from a queue without
/// synchronizing with that successor's exit.
///
/// All methods may be called concurrently from any thread.
pub struct EventPool {
    free: SpinMutex<FreeList>,
    allocated: AtomicUsize,
}

struct FreeList {
    head: *mut ParkEvent,
    len: usize,
}

// The list only links immortal events, and is only touched under the lock.
unsafe impl Send for FreeList {}

impl EventPool {
    /// Create an empty pool.
    pub const fn new() -> Self {
        Self {
            free: SpinMutex::const_new(
                RawSpinLock::INIT,
                FreeList {
                    head: null_mut(),
                    len: 0,
                },
            ),
            allocated: AtomicUsize::new(0),
        }
    }

    /// The process-wide pool used by the default runtime.
    pub fn global() -> &'static EventPool {
        static GLOBAL: EventPool = EventPool::new();
        &GLOBAL
    }

    /// Lease an event. It comes back reset, with no pending `unpark`.
    pub fn allocate(&self) -> &'static ParkEvent {
        let recycled = {
            let mut free = self.free.lock();
            let head = free.head;
            if !head.is_null() {
                // Safety: everything on the list was leaked by this pool.
                free.head = unsafe { (*head).list_next.load(Relaxed) };
                free.len -= 1;
            }
            head
        };

        let event: &'static ParkEvent = if recycled.is_null() {
            let _total = self.allocated.fetch_add(1, Relaxed) + 1;
            #[cfg(feature = "log")]
            log::debug!(target: "ondeck::pool", "allocated ParkEvent #{}", _total);
            Box::leak(Box::new(ParkEvent::new()))
        } else {
            unsafe { &*recycled }
        };

        event.list_next.store(null_mut(), Relaxed);
        event.notified.store(false, Relaxed);
        event.reset();
        event
    }

    /// Return an event leased from this pool.
    ///
    /// The event must not be on any monitor queue.
    pub fn release(&self, event: &'static ParkEvent) {
        let mut free = self.free.lock();
        event.list_next.store(free.head, Relaxed);
        free.head = event as *const ParkEvent as *mut ParkEvent;
        free.len += 1;
    }

    /// How many events this pool has ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Relaxed)
    }

    /// How many events are currently on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPool")
            .field("allocated", &self.allocated())
            .field("idle", &self.idle())
            .finish()
    }
}
