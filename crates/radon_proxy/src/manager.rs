//! Idle-transaction reaper.
//!
//! Once a second the manager scans sessions holding a transaction and kills
//! those that have sat idle (nothing running, or only `BEGIN`) longer than
//! `idle_txn_timeout_secs`. A slow statement inside a transaction is busy,
//! not idle, and is never reaped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use radon_common::shutdown::ShutdownSignal;

use crate::classify::StmtKind;
use crate::spanner::Spanner;

const TICK: Duration = Duration::from_secs(1);

pub struct Manager {
    spanner: Arc<Spanner>,
    idle_timeout_secs: AtomicU64,
    signal: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(spanner: Arc<Spanner>, idle_timeout_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            spanner,
            idle_timeout_secs: AtomicU64::new(idle_timeout_secs),
            signal: ShutdownSignal::new(),
            handle: Mutex::new(None),
        })
    }

    /// Zero disables reaping.
    pub fn set_idle_timeout(&self, secs: u64) {
        self.idle_timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// One scan as of `now`; returns the killed session ids.
    pub fn tick(&self, now: Instant) -> Vec<u32> {
        let limit = self.idle_timeout_secs.load(Ordering::Relaxed);
        if limit == 0 {
            return Vec::new();
        }
        let threshold = Duration::from_secs(limit);
        let mut killed = Vec::new();
        for s in self.spanner.sessions().snapshot_at(now) {
            if s.txn_id.is_none() {
                continue;
            }
            let idle = matches!(s.node, None | Some(StmtKind::Begin));
            if !idle || s.idle <= threshold {
                continue;
            }
            let reason = format!(
                "idle transaction for {}s exceeds idle-txn-timeout of {limit}s",
                s.idle.as_secs()
            );
            if self.spanner.kill_session(s.id, &reason) {
                radon_observability::record_reaped_session();
                killed.push(s.id);
            }
        }
        killed
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("radon-manager".into())
            .spawn(move || {
                tracing::info!("manager started");
                while !manager.signal.wait_timeout(TICK) {
                    manager.tick(Instant::now());
                }
                tracing::info!("manager stopped");
            });
        match spawned {
            Ok(h) => *handle = Some(h),
            Err(e) => tracing::error!(error = %e, "failed to spawn manager thread"),
        }
    }

    pub fn stop(&self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}
