//! Integration with a managed runtime through the `Runtime` trait.

use ondeck::{EventPool, Knobs, Monitor, Rank, Runtime, Thread, WorldStopped};
use similar_asserts::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[ctor::ctor]
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A runtime that records what the monitor asks of it.
#[derive(Default)]
struct Recorder {
    safepoint: AtomicBool,
    stopped: AtomicBool,
    suspend_requested: AtomicBool,
    block_begins: AtomicUsize,
    block_ends: AtomicUsize,
    suspensions: AtomicUsize,
    pool: EventPool,
}

impl Runtime for Recorder {
    fn safepoint_pending(&self) -> bool {
        self.safepoint.load(SeqCst)
    }

    fn is_world_stopped(&self) -> bool {
        self.stopped.load(SeqCst)
    }

    fn block_begin(&self, _thread: &Thread) {
        self.block_begins.fetch_add(1, SeqCst);
    }

    fn block_end(&self, _thread: &Thread) {
        self.block_ends.fetch_add(1, SeqCst);
    }

    fn take_suspend_request(&self, _thread: &Thread) -> bool {
        self.suspend_requested.swap(false, SeqCst)
    }

    fn suspend_self(&self, _thread: &Thread) {
        self.suspensions.fetch_add(1, SeqCst);
    }

    fn event_pool(&self) -> &EventPool {
        &self.pool
    }
}

fn leaked_recorder() -> &'static Recorder {
    Box::leak(Box::new(Recorder::default()))
}

#[test]
fn waits_are_bracketed_by_block_hooks() {
    let runtime = leaked_recorder();
    let monitor = Monitor::new(Rank::LEAF, "bracketed").with_runtime(runtime);

    monitor.lock();
    assert_eq!(runtime.block_begins.load(SeqCst), 0, "uncontended lock");
    monitor.wait(false, Some(Duration::from_millis(1)), false);
    assert_eq!(runtime.block_begins.load(SeqCst), 1);
    assert_eq!(runtime.block_ends.load(SeqCst), 1);

    monitor.wait(true, Some(Duration::from_millis(1)), false);
    assert_eq!(runtime.block_begins.load(SeqCst), 1, "no safepoint check");
    monitor.unlock();
}

#[test]
fn contended_lock_is_bracketed_by_block_hooks() {
    let runtime = leaked_recorder();
    let monitor = Arc::new(Monitor::new(Rank::LEAF, "contended").with_runtime(runtime));

    monitor.lock();
    let contender = {
        let monitor = monitor.clone();
        thread::spawn(move || {
            monitor.lock();
            monitor.unlock();
        })
    };
    while runtime.block_begins.load(SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    monitor.unlock();
    contender.join().unwrap();
    assert_eq!(runtime.block_ends.load(SeqCst), 1);
}

#[test]
fn suspend_equivalent_wait_suspends_without_the_monitor() {
    let runtime = leaked_recorder();
    let monitor = Monitor::new(Rank::LEAF, "suspendable").with_runtime(runtime);

    runtime.suspend_requested.store(true, SeqCst);
    monitor.lock();
    assert!(monitor.wait(false, Some(Duration::from_millis(1)), true));
    assert_eq!(runtime.suspensions.load(SeqCst), 1);
    assert!(monitor.owned_by_self());

    // Without a request there's nothing to honor.
    assert!(monitor.wait(false, Some(Duration::from_millis(1)), true));
    assert_eq!(runtime.suspensions.load(SeqCst), 1);
    monitor.unlock();
}

#[test]
fn pending_safepoint_stops_spinning_but_not_locking() {
    let runtime = leaked_recorder();
    runtime.safepoint.store(true, SeqCst);
    let monitor = Arc::new(
        Monitor::new(Rank::LEAF, "safepointed")
            .with_runtime(runtime)
            .with_knobs(Knobs {
                multiprocessor: Some(true),
                spin_limit: u32::MAX,
                ..Knobs::DEFAULT
            }),
    );

    monitor.lock();
    let contender = {
        let monitor = monitor.clone();
        thread::spawn(move || {
            monitor.lock();
            monitor.unlock();
        })
    };
    // With an unbounded spin limit, only the safepoint check gets the
    // contender to block.
    while runtime.block_begins.load(SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    monitor.unlock();
    contender.join().unwrap();
}

#[test]
fn stopped_world_allows_sneaking() {
    let runtime = leaked_recorder();
    let monitor = Monitor::new(Rank::LEAF, "sneaky").with_runtime(runtime);

    assert!(WorldStopped::verify(runtime).is_none());
    runtime.stopped.store(true, SeqCst);
    let stopped = WorldStopped::verify(runtime).unwrap();

    // Nobody is recorded as owner, so ownership is taken without touching
    // the lock word.
    assert!(monitor.try_lock_assuming_world_stopped(&stopped));
    assert!(monitor.owned_by_self());
    assert!(!monitor.is_locked());

    // The matching unlock leaves the lock word alone too.
    monitor.unlock();
    assert_eq!(monitor.owner(), None);
    assert!(!monitor.is_locked());

    // Ordinary locking still works afterwards.
    runtime.stopped.store(false, SeqCst);
    monitor.lock();
    assert!(monitor.is_locked());
    monitor.unlock();
}

#[test]
fn sneaking_defers_to_a_recorded_owner() {
    let runtime = leaked_recorder();
    let monitor = Arc::new(Monitor::new(Rank::LEAF, "owned").with_runtime(runtime));
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let owner = {
        let monitor = monitor.clone();
        thread::spawn(move || {
            monitor.lock();
            locked_tx.send(monitor.owner()).unwrap();
            release_rx.recv().unwrap();
            monitor.unlock();
        })
    };
    let recorded = locked_rx.recv().unwrap();
    assert!(recorded.is_some());

    runtime.stopped.store(true, SeqCst);
    let stopped = WorldStopped::verify(runtime).unwrap();
    assert!(!monitor.try_lock_assuming_world_stopped(&stopped));
    assert_eq!(monitor.owner(), recorded);
    drop(stopped);
    runtime.stopped.store(false, SeqCst);

    release_tx.send(()).unwrap();
    owner.join().unwrap();
    assert_eq!(monitor.owner(), None);
}

#[test]
#[should_panic(expected = "different runtime")]
fn tokens_are_tied_to_their_runtime() {
    let runtime = leaked_recorder();
    let other = leaked_recorder();
    other.stopped.store(true, SeqCst);
    let stopped = WorldStopped::verify(other).unwrap();
    let monitor = Monitor::new(Rank::LEAF, "mismatched").with_runtime(runtime);
    monitor.try_lock_assuming_world_stopped(&stopped);
}

#[test]
fn raw_lock_leases_transient_events() {
    const THREADS: usize = 4;

    let runtime = leaked_recorder();
    let monitor = Arc::new(
        Monitor::new(Rank::NATIVE, "jvm_raw").with_runtime(runtime),
    );
    let counter = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let monitor = monitor.clone();
            let counter = counter.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let deadline = Instant::now() + Duration::from_millis(200);
                let mut mine = 0;
                while Instant::now() < deadline {
                    monitor.raw_lock();
                    // A lost update here would mean two holders at once.
                    let seen = counter.load(SeqCst);
                    thread::yield_now();
                    counter.store(seen + 1, SeqCst);
                    monitor.raw_unlock();
                    mine += 1;
                }
                mine
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(counter.load(SeqCst), total);
    assert!(!monitor.is_locked());
    // Every leased event went back to the runtime's pool.
    assert_eq!(runtime.pool.idle(), runtime.pool.allocated());
}
