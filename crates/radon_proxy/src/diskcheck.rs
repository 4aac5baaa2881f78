//! Disk watchdog: probes the meta directory's filesystem every 5 seconds and
//! raises a high-water flag the statement path consults before writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use radon_common::shutdown::ShutdownSignal;
use radon_common::{RadonError, RadonResult};

const TICK: Duration = Duration::from_secs(5);

/// Used space of the filesystem holding `path`, in percent.
#[cfg(target_family = "unix")]
pub fn used_percent(path: &Path) -> RadonResult<f64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| RadonError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: statvfs is plain old data; all-zero is a valid value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(RadonError::Io(std::io::Error::last_os_error()));
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let avail = stat.f_bavail as u64 * frsize;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(total.saturating_sub(avail) as f64 * 100.0 / total as f64)
}

#[cfg(not(target_family = "unix"))]
pub fn used_percent(_path: &Path) -> RadonResult<f64> {
    Err(RadonError::Unsupported("unsupported: disk check on this platform".into()))
}

pub struct DiskCheck {
    dir: PathBuf,
    highwater_percent: f64,
    highwater: AtomicBool,
    /// Last probe, `f64` bits.
    used: AtomicU64,
    signal: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiskCheck {
    pub fn new(dir: impl Into<PathBuf>, highwater_percent: f64) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            highwater_percent,
            highwater: AtomicBool::new(false),
            used: AtomicU64::new(0f64.to_bits()),
            signal: ShutdownSignal::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn is_highwater(&self) -> bool {
        self.highwater.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> f64 {
        f64::from_bits(self.used.load(Ordering::Relaxed))
    }

    /// Apply one usage reading.
    pub fn update(&self, used: f64) {
        let high = used >= self.highwater_percent;
        self.used.store(used.to_bits(), Ordering::Relaxed);
        let was = self.highwater.swap(high, Ordering::Relaxed);
        if high != was {
            if high {
                tracing::warn!(dir = %self.dir.display(), used, limit = self.highwater_percent, "disk high-water reached, refusing writes");
            } else {
                tracing::info!(dir = %self.dir.display(), used, "disk back under high-water");
            }
        }
        radon_observability::record_disk_usage(used, high);
    }

    /// Probe now. A failed probe keeps the previous state.
    pub fn check(&self) {
        match used_percent(&self.dir) {
            Ok(used) => self.update(used),
            Err(e) => tracing::warn!(dir = %self.dir.display(), error = %e, "disk check failed"),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.check();
        let disk = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("radon-diskcheck".into())
            .spawn(move || {
                while !disk.signal.wait_timeout(TICK) {
                    disk.check();
                }
            });
        match spawned {
            Ok(h) => *handle = Some(h),
            Err(e) => tracing::error!(error = %e, "failed to spawn disk check thread"),
        }
    }

    pub fn stop(&self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_current_dir() {
        let used = used_percent(Path::new(".")).unwrap();
        assert!((0.0..=100.0).contains(&used));
    }

    #[test]
    fn test_probe_missing_dir_fails() {
        assert!(used_percent(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn test_highwater_flag_follows_updates() {
        let disk = DiskCheck::new(".", 90.0);
        disk.update(50.0);
        assert!(!disk.is_highwater());
        disk.update(90.0);
        assert!(disk.is_highwater());
        assert_eq!(disk.used(), 90.0);
        disk.update(89.9);
        assert!(!disk.is_highwater());
    }

    #[test]
    fn test_failed_probe_keeps_state() {
        let disk = DiskCheck::new("/definitely/not/here", 90.0);
        disk.update(95.0);
        disk.check();
        assert!(disk.is_highwater());
    }

    #[test]
    fn test_start_stop() {
        let disk = DiskCheck::new(".", 100.1);
        disk.start();
        disk.stop();
        assert!(!disk.is_highwater());
    }
}
