use core::arch::asm;
use core::sync::atomic::{fence, Ordering::SeqCst};

/// Relax the processor inside a spin loop.
///
/// `isb` stalls for roughly as long as x86's `pause`, where `yield` is a
/// no-op on most cores.
#[inline(always)]
pub(crate) fn spin_pause() {
    unsafe {
        asm!("isb", options(nomem, nostack, preserves_flags));
    }
}

/// A store-load barrier (`dmb ish`).
#[inline(always)]
pub(crate) fn storeload() {
    fence(SeqCst);
}
