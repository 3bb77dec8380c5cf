#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("ondeck parks threads on Linux futexes");

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[path = "arch-x86_64.rs"]
        mod arch;
    } else if #[cfg(target_arch = "aarch64")] {
        #[path = "arch-aarch64.rs"]
        mod arch;
    } else {
        #[path = "arch-generic.rs"]
        mod arch;
    }
}

mod knobs;
mod lock_word;
mod monitor;
mod park;
mod pool;
mod rank;
mod runtime;
mod spin;
mod sync;
mod thread;

pub use knobs::{Knobs, MonitorFlags};
pub use monitor::Monitor;
pub use park::{ParkEvent, ParkResult};
pub use pool::EventPool;
pub use rank::Rank;
pub use runtime::{DefaultRuntime, Runtime, WorldStopped};
pub use sync::{MonitorGuard, Mutex, MutexGuard};
pub use thread::{Thread, ThreadId};
