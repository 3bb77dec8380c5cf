//! `Mutex` on top of [`Monitor`], and the scoped [`MonitorGuard`].
//!
//! A [`Monitor`] is itself a raw lock, so [`lock_api`] can wrap it into a
//! data-owning mutex. Such monitors are created with [`Rank::NATIVE`], which
//! exempts them from lock-rank checking, since `lock_api` has no way to pass
//! a rank or a name through.

use crate::monitor::Monitor;
use crate::rank::Rank;

mod guard;

pub use guard::MonitorGuard;

/// A data-owning mutex built on [`Monitor`].
pub type Mutex<T> = lock_api::Mutex<Monitor, T>;

/// An RAII guard for [`Mutex`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, Monitor, T>;

unsafe impl lock_api::RawMutex for Monitor {
    type GuardMarker = lock_api::GuardNoSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Monitor::new(Rank::NATIVE, "ondeck::Mutex");

    fn lock(&self) {
        Monitor::lock(self)
    }

    fn try_lock(&self) -> bool {
        Monitor::try_lock(self)
    }

    unsafe fn unlock(&self) {
        Monitor::unlock(self)
    }

    fn is_locked(&self) -> bool {
        Monitor::is_locked(self)
    }
}
