//! Tuning knobs for monitors.

use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering::Relaxed;
use core::time::Duration;

bitflags::bitflags! {
    /// Experimental and diagnostic behavior switches.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MonitorFlags: u32 {
        /// Return from `wait` on any wakeup, even an unnotified one.
        const WAKE_RETURNS_FROM_WAIT = 1;
        /// Spin without the growing xor-shift backoff delay.
        const NO_BACKOFF = 2;
        /// Don't abort spinning when a safepoint is pending.
        const IGNORE_SAFEPOINT_IN_SPIN = 4;
        /// Don't issue a pause instruction between spin probes.
        const NO_SPIN_PAUSE = 8;
        /// Unpark a thread as soon as `notify` moves it to the cxq, hoping it
        /// comes on-processor just as the owner releases the lock.
        const EAGER_NOTIFY_UNPARK = 16;
        /// Let a thread that failed to spin claim the OnDeck position
        /// directly when it's free, instead of queueing on the cxq.
        const BARGE_ON_DECK = 32;
        /// Reverse each batch drained from the cxq, so it's serviced in
        /// arrival order rather than LIFO.
        const FIFO_DRAIN = 64;
    }
}

/// Per-monitor tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Knobs {
    /// Maximum spin probes before a contended acquirer blocks.
    pub spin_limit: u32,
    /// If set, no single park lasts longer than this. A diagnostic for
    /// unwedging lost wakeups; the parkers re-check their conditions anyway.
    pub park_timeout: Option<Duration>,
    /// Behavior switches.
    pub flags: MonitorFlags,
    /// Whether to spin at all. `None` means detect: spin only when more than
    /// one CPU is available.
    pub multiprocessor: Option<bool>,
}

impl Knobs {
    /// The defaults: 20 probes, no park cap, no flags, detect CPUs.
    pub const DEFAULT: Self = Self {
        spin_limit: 20,
        park_timeout: None,
        flags: MonitorFlags::empty(),
        multiprocessor: None,
    };

    /// Read knobs from `ONDECK_*` environment variables, falling back to the
    /// defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read knobs through `lookup`, falling back to the defaults.
    ///
    /// Recognized keys:
    ///  - `ONDECK_SPIN_LIMIT`: probe count
    ///  - `ONDECK_PARK_TIMEOUT_MS`: park cap in milliseconds, `0` for none
    ///  - `ONDECK_FLAGS`: [`MonitorFlags`] bits, decimal or `0x` hex
    ///  - `ONDECK_MULTIPROCESSOR`: `true`/`false`/`1`/`0`
    ///
    /// Values that don't parse are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut knobs = Self::DEFAULT;

        if let Some(limit) = parsed(&lookup, "ONDECK_SPIN_LIMIT", |v| v.parse::<u32>().ok()) {
            knobs.spin_limit = limit;
        }
        if let Some(ms) = parsed(&lookup, "ONDECK_PARK_TIMEOUT_MS", |v| v.parse::<u64>().ok()) {
            knobs.park_timeout = (ms != 0).then(|| Duration::from_millis(ms));
        }
        if let Some(bits) = parsed(&lookup, "ONDECK_FLAGS", parse_bits) {
            #[cfg(feature = "log")]
            if bits & !MonitorFlags::all().bits() != 0 {
                log::warn!(
                    target: "ondeck::knobs",
                    "ignoring unknown ONDECK_FLAGS bits {:#x}",
                    bits & !MonitorFlags::all().bits()
                );
            }
            knobs.flags = MonitorFlags::from_bits_truncate(bits);
        }
        if let Some(mp) = parsed(&lookup, "ONDECK_MULTIPROCESSOR", parse_bool) {
            knobs.multiprocessor = Some(mp);
        }

        knobs
    }

    /// Whether spinning can pay off on this machine.
    pub(crate) fn is_multiprocessor(&self) -> bool {
        self.multiprocessor.unwrap_or_else(detect_multiprocessor)
    }
}

impl Default for Knobs {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let value = parse(raw.trim());
    #[cfg(feature = "log")]
    if value.is_none() {
        log::warn!(target: "ondeck::knobs", "ignoring malformed {}={:?}", key, raw);
    }
    value
}

fn parse_bits(v: &str) -> Option<u32> {
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn detect_multiprocessor() -> bool {
    // 0 = unknown, 1 = uniprocessor, 2 = multiprocessor.
    static DETECTED: AtomicU8 = AtomicU8::new(0);

    match DETECTED.load(Relaxed) {
        1 => false,
        2 => true,
        _ => {
            let mp = std::thread::available_parallelism().map_or(true, |n| n.get() > 1);
            DETECTED.store(if mp { 2 } else { 1 }, Relaxed);
            mp
        }
    }
}
