use core::arch::asm;
use core::sync::atomic::{fence, Ordering::SeqCst};

/// Relax the processor inside a spin loop.
///
/// `pause` also keeps a spinning hyperthread from starving its sibling and
/// avoids the memory-order mis-speculation penalty when the loop exits.
#[inline(always)]
pub(crate) fn spin_pause() {
    unsafe {
        asm!("pause", options(nomem, nostack, preserves_flags));
    }
}

/// A store-load barrier: stores before it are globally visible before any
/// load after it is performed.
///
/// This is the only barrier x86 needs explicitly; it lowers to `mfence`.
#[inline(always)]
pub(crate) fn storeload() {
    fence(SeqCst);
}
