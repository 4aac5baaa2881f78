//! Stop signal for the proxy's periodic background loops (idle-transaction
//! reaper, disk watchdog, XA sweeper).
//!
//! ```ignore
//! let signal = ShutdownSignal::new();
//! let worker = signal.clone();
//! std::thread::spawn(move || {
//!     while !worker.wait_timeout(Duration::from_secs(1)) {
//!         tick();
//!     }
//! });
//! signal.shutdown(); // the worker wakes at once
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop and wake every waiter.
    pub fn shutdown(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep up to `interval`; returns `true` once stop was requested.
    pub fn wait_timeout(&self, interval: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_shutdown() {
            return true;
        }
        let _ = self.inner.cond.wait_for(&mut guard, interval);
        self.is_shutdown()
    }
}
