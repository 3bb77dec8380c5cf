//! Spinning helpers: the backoff PRNG and the low-level spin lock used for
//! WaitSets and event pools.

use crate::arch::spin_pause;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

/// One step of Marsaglia's xor-shift generator, in the variant that keeps
/// results non-negative when read as an `i32`.
///
/// A zero state would be a fixed point, so it's replaced by a non-zero seed.
#[inline]
pub(crate) fn marsaglia_xorv(mut x: u32) -> u32 {
    if x == 0 {
        x = 0x2545_f491;
    }
    x ^= x << 6;
    x ^= x >> 21;
    x ^= x << 7;
    x & 0x7fff_ffff
}

/// Burn roughly `rounds` PRNG steps without touching shared memory.
///
/// Used for spin backoff when the caller has no per-thread PRNG state.
#[inline(never)]
pub(crate) fn stall(rounds: u32, seed: u32) -> u32 {
    let mut v = seed;
    for _ in 0..rounds {
        v = marsaglia_xorv(v);
    }
    // Keep the loop from being optimized away.
    core::hint::black_box(v)
}

/// A test-and-test-and-set spin lock.
///
/// Meant for critical sections a handful of instructions long, like
/// unlinking one node from a list. After a short bounded spin, contenders
/// yield the CPU rather than park, since there is no queue to park on.
pub struct RawSpinLock {
    locked: AtomicBool,
}

// How many probes to spin before yielding the processor.
const SPINS_BEFORE_YIELD: u32 = 64;

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Acquire, Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.load(Relaxed)
            && self
                .locked
                .compare_exchange(false, true, Acquire, Relaxed)
                .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl RawSpinLock {
    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        loop {
            // Spin on a plain load so waiters share the line instead of
            // bouncing it between caches.
            while self.locked.load(Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    spin_pause();
                } else {
                    std::thread::yield_now();
                }
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Acquire, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// A mutex around a spin lock. Never held across a park.
pub(crate) type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;
