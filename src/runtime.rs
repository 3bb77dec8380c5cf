//! Hooks into the surrounding runtime.

use crate::pool::EventPool;
use crate::thread::Thread;
use core::marker::PhantomData;

/// What a monitor needs from the runtime that embeds it.
///
/// Every method has a default suitable for plain native threads, which is
/// what [`DefaultRuntime`] uses. A managed runtime overrides them to tie
/// monitors into its safepoint and suspension machinery.
pub trait Runtime: Sync {
    /// Whether a safepoint or suspension is pending. Spinning acquirers poll
    /// this and stop spinning when it turns true, so they don't delay the
    /// pause.
    fn safepoint_pending(&self) -> bool {
        false
    }

    /// Whether every other thread is known to be stopped. While true, the
    /// owning runtime's privileged thread may bypass ownership with
    /// [`Monitor::try_lock_assuming_world_stopped`], and lock-rank checks are
    /// relaxed.
    ///
    /// [`Monitor::try_lock_assuming_world_stopped`]: crate::Monitor::try_lock_assuming_world_stopped
    fn is_world_stopped(&self) -> bool {
        false
    }

    /// Called before a thread blocks in `lock` or `wait` with safepoint
    /// checks enabled.
    fn block_begin(&self, _thread: &Thread) {}

    /// Called after a blocked thread has re-acquired the monitor.
    fn block_end(&self, _thread: &Thread) {}

    /// Whether `thread` was asked to suspend while it was in a
    /// suspend-equivalent wait. Consumes the request.
    fn take_suspend_request(&self, _thread: &Thread) -> bool {
        false
    }

    /// Suspend `thread` until it's resumed. Called with no monitor held by
    /// this wait.
    fn suspend_self(&self, _thread: &Thread) {}

    /// The pool foreign callers lease transient events from.
    fn event_pool(&self) -> &EventPool {
        EventPool::global()
    }
}

/// The runtime for plain native threads: never at a safepoint, never
/// stopped, no hooks.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRuntime;

impl Runtime for DefaultRuntime {}

pub(crate) const DEFAULT_RUNTIME: &dyn Runtime = &DefaultRuntime;

/// Proof that a runtime reported every other thread stopped.
///
/// Only obtainable through [`WorldStopped::verify`], and not `Send`, so it
/// can't outlive the check on another thread.
pub struct WorldStopped<'a> {
    runtime: &'a dyn Runtime,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WorldStopped<'a> {
    /// Returns a token if `runtime` says the world is stopped.
    pub fn verify(runtime: &'a dyn Runtime) -> Option<Self> {
        runtime.is_world_stopped().then(|| Self {
            runtime,
            _not_send: PhantomData,
        })
    }

    /// Whether this token was issued by `runtime`.
    pub(crate) fn is_for(&self, runtime: &dyn Runtime) -> bool {
        core::ptr::eq(
            self.runtime as *const dyn Runtime as *const (),
            runtime as *const dyn Runtime as *const (),
        )
    }

    /// Whether the runtime still says the world is stopped.
    pub(crate) fn still_holds(&self) -> bool {
        self.runtime.is_world_stopped()
    }
}

impl core::fmt::Debug for WorldStopped<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorldStopped").finish_non_exhaustive()
    }
}
