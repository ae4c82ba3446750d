//! Background garbage collector.

use super::Shared;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Signal {
    /// Set by `request`, cleared by the worker when it starts a pass.
    requested: Mutex<bool>,
    wake: Condvar,
    shutdown: AtomicBool,
    passes: AtomicU64,
}

/// The single collector thread of a conglomerate.
///
/// Requests coalesce: however many idle closes arrive while a pass runs,
/// at most one more pass follows it. The thread holds only a weak
/// reference to the conglomerate between passes and stops when the
/// collector is dropped.
#[derive(Debug)]
pub(crate) struct Collector {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Collector {
    /// Spawns the collector thread. If the thread cannot be spawned the
    /// collector stays idle and [`Collector::request`] returns false.
    pub(crate) fn start(shared: Weak<Shared>) -> Self {
        let signal = Arc::new(Signal::default());
        let worker = Arc::clone(&signal);
        let spawned = std::thread::Builder::new()
            .name("tessera-gc".to_string())
            .spawn(move || run(&worker, &shared));

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "could not spawn garbage collector, collecting inline");
                None
            }
        };
        Self { signal, handle }
    }

    /// Asks for one collection pass. Returns false when no collector
    /// thread is running.
    pub(crate) fn request(&self) -> bool {
        if self.handle.is_none() {
            return false;
        }
        *self.signal.requested.lock() = true;
        self.signal.wake.notify_one();
        true
    }

    /// Number of passes the thread has completed.
    pub(crate) fn passes(&self) -> u64 {
        self.signal.passes.load(Ordering::Acquire)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        {
            let _requested = self.signal.requested.lock();
            self.signal.shutdown.store(true, Ordering::Release);
            self.signal.wake.notify_one();
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The last strong reference may be released by the worker itself.
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            warn!("garbage collector panicked");
        }
    }
}

fn run(signal: &Signal, shared: &Weak<Shared>) {
    loop {
        {
            let mut requested = signal.requested.lock();
            while !*requested && !signal.shutdown.load(Ordering::Acquire) {
                signal.wake.wait(&mut requested);
            }
            if signal.shutdown.load(Ordering::Acquire) {
                break;
            }
            *requested = false;
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(err) = shared.collect_garbage() {
            warn!(error = %err, "background garbage collection failed");
        }
        signal.passes.fetch_add(1, Ordering::Release);
    }
    debug!("garbage collector stopped");
}
