use crate::monitor::Monitor;
use core::fmt;
use core::marker::PhantomData;
use core::time::Duration;

/// Holds a [`Monitor`] for a scope and releases it on drop.
///
/// Created by [`Monitor::locker`] and
/// [`Monitor::locker_without_safepoint_check`]. Waits through the guard use
/// the same safepoint policy the monitor was acquired with.
#[must_use = "if unused the Monitor will immediately unlock"]
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    safepoint_check: bool,
    // Ownership is per thread.
    _not_send: PhantomData<*const ()>,
}

impl Monitor {
    /// Acquire the monitor and return a guard that releases it.
    pub fn locker(&self) -> MonitorGuard<'_> {
        self.lock();
        MonitorGuard {
            monitor: self,
            safepoint_check: true,
            _not_send: PhantomData,
        }
    }

    /// Like [`locker`](Self::locker), but acquire with
    /// [`lock_without_safepoint_check`](Self::lock_without_safepoint_check).
    pub fn locker_without_safepoint_check(&self) -> MonitorGuard<'_> {
        self.lock_without_safepoint_check();
        MonitorGuard {
            monitor: self,
            safepoint_check: false,
            _not_send: PhantomData,
        }
    }
}

impl<'a> MonitorGuard<'a> {
    /// The guarded monitor.
    pub fn monitor(&self) -> &'a Monitor {
        self.monitor
    }

    /// [`Monitor::wait`] on the guarded monitor. Returns `true` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.monitor.wait(!self.safepoint_check, timeout, false)
    }

    /// [`Monitor::notify`] on the guarded monitor.
    pub fn notify(&self) {
        self.monitor.notify()
    }

    /// [`Monitor::notify_all`] on the guarded monitor.
    pub fn notify_all(&self) {
        self.monitor.notify_all()
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.unlock();
    }
}

impl fmt::Debug for MonitorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorGuard")
            .field("monitor", &self.monitor.name())
            .field("safepoint_check", &self.safepoint_check)
            .finish()
    }
}
