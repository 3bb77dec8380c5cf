use core::sync::atomic::{fence, Ordering::SeqCst};

/// Relax the processor inside a spin loop.
#[inline(always)]
pub(crate) fn spin_pause() {
    core::hint::spin_loop();
}

/// A store-load barrier.
#[inline(always)]
pub(crate) fn storeload() {
    fence(SeqCst);
}
