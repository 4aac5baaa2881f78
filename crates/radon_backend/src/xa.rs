//! Recovery of prepared XA branches left behind by failed commits.
//!
//! Every branch the proxy opens is named `RXID-<yyyyMMddHHmmss>-<txnid>`, so
//! the age of a prepared branch can be read from its id. Only branches older
//! than the horizon are touched; younger ones may belong to a commit that is
//! still in flight.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use radon_common::shutdown::ShutdownSignal;
use radon_common::{QueryResult, RadonError, RadonResult};

use crate::scatter::Scatter;

const XID_PREFIX: &str = "RXID-";
const XID_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
/// Column of `XA RECOVER` holding the xid text.
const XID_DATA_COLUMN: usize = 3;

pub fn make_xid(now: DateTime<Local>, txn_id: u64) -> String {
    format!("{XID_PREFIX}{}-{txn_id}", now.format(XID_TIME_FORMAT))
}

/// Split an xid into its creation time and transaction id.
pub fn parse_xid(xid: &str) -> Option<(NaiveDateTime, u64)> {
    let rest = xid.strip_prefix(XID_PREFIX)?;
    let (stamp, id) = rest.split_once('-')?;
    let at = NaiveDateTime::parse_from_str(stamp, XID_TIME_FORMAT).ok()?;
    Some((at, id.parse().ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaAction {
    Commit,
    Rollback,
}

impl XaAction {
    fn verb(self) -> &'static str {
        match self {
            XaAction::Commit => "COMMIT",
            XaAction::Rollback => "ROLLBACK",
        }
    }
}

pub struct XaRecovery {
    scatter: Arc<Scatter>,
    horizon: Duration,
}

impl XaRecovery {
    pub fn new(scatter: Arc<Scatter>, horizon_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            scatter,
            horizon: Duration::from_secs(horizon_secs),
        })
    }

    /// `XA RECOVER` on the first backend.
    pub fn recover(&self) -> RadonResult<QueryResult> {
        let txn = self.scatter.create_transaction()?;
        let out = txn.execute_single("XA RECOVER");
        txn.finish();
        out
    }

    /// Commit every prepared branch older than the horizon, on all backends.
    pub fn commit(&self) -> RadonResult<usize> {
        self.resolve(XaAction::Commit)
    }

    /// Roll back every prepared branch older than the horizon, on all backends.
    pub fn rollback(&self) -> RadonResult<usize> {
        self.resolve(XaAction::Rollback)
    }

    fn is_stale(&self, xid: &str, now: NaiveDateTime) -> bool {
        let Some((at, _)) = parse_xid(xid) else {
            return false;
        };
        now.signed_duration_since(at)
            .to_std()
            .map_or(false, |age| age > self.horizon)
    }

    /// Returns the number of distinct xids acted on.
    fn resolve(&self, action: XaAction) -> RadonResult<usize> {
        let txn = self.scatter.create_transaction()?;
        let backends = self.scatter.backends();
        let now = Local::now().naive_local();

        let mut stale = BTreeSet::new();
        for backend in &backends {
            let prepared = txn.execute_on_this_backend(backend, "XA RECOVER")?;
            for row in &prepared.rows {
                if let Some(xid) = row.get(XID_DATA_COLUMN).and_then(|d| d.to_mysql_text()) {
                    if self.is_stale(&xid, now) {
                        stale.insert(xid);
                    }
                }
            }
        }

        let mut first_err: Option<RadonError> = None;
        for xid in &stale {
            let sql = format!("XA {} '{xid}'", action.verb());
            for backend in &backends {
                match txn.execute_on_this_backend(backend, &sql) {
                    Ok(_) => {}
                    Err(e) if e.is_xaer_nota() => {}
                    Err(e) => {
                        tracing::warn!(backend = %backend, xid = %xid, error = %e, "xa recovery statement failed");
                        first_err.get_or_insert(e);
                    }
                }
            }
            tracing::info!(xid = %xid, action = action.verb(), "stale xa branch resolved");
        }
        txn.finish();
        match first_err {
            Some(e) => Err(e),
            None => Ok(stale.len()),
        }
    }

    /// Run `action` every `interval` on a background thread.
    pub fn start(self: &Arc<Self>, action: XaAction, interval: Duration) -> XaSweeperHandle {
        let recovery = Arc::clone(self);
        let signal = ShutdownSignal::new();
        let worker = signal.clone();
        let thread = std::thread::Builder::new()
            .name("radon-xa-sweeper".into())
            .spawn(move || {
                tracing::info!(horizon_secs = recovery.horizon.as_secs(), "xa sweeper started");
                loop {
                    match recovery.resolve(action) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(resolved = n, "xa sweeper pass"),
                        Err(e) => tracing::warn!(error = %e, "xa sweeper pass failed"),
                    }
                    if worker.wait_timeout(interval) {
                        break;
                    }
                }
                tracing::info!("xa sweeper stopped");
            })
            .ok();
        if thread.is_none() {
            tracing::error!("failed to spawn xa sweeper thread");
        }
        XaSweeperHandle { signal, thread }
    }
}

/// Handle to the background XA sweeper thread.
pub struct XaSweeperHandle {
    signal: ShutdownSignal,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl XaSweeperHandle {
    /// Stop the sweeper and wait for the thread to finish.
    pub fn stop(mut self) {
        self.signal.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for XaSweeperHandle {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakedb::FakeDb;
    use radon_common::config::BackendConfig;
    use radon_common::{Datum, Field, FieldType};

    fn recover_result(xids: &[&str]) -> QueryResult {
        let fields = ["formatID", "gtrid_length", "bqual_length", "data"]
            .iter()
            .map(|n| Field::new(*n, FieldType::VarString))
            .collect();
        let rows = xids
            .iter()
            .map(|x| {
                vec![
                    Datum::Int64(1),
                    Datum::Int64(x.len() as i64),
                    Datum::Int64(0),
                    Datum::from(*x),
                ]
            })
            .collect();
        QueryResult::new(fields, rows)
    }

    #[test]
    fn test_xid_format_roundtrip() {
        let now = Local::now();
        let xid = make_xid(now, 42);
        assert!(xid.starts_with("RXID-"));
        let (at, id) = parse_xid(&xid).unwrap();
        assert_eq!(id, 42);
        assert_eq!(at.format(XID_TIME_FORMAT).to_string(), now.format(XID_TIME_FORMAT).to_string());
        assert!(parse_xid("foo-1").is_none());
        assert!(parse_xid("RXID-2020-1").is_none());
    }

    #[test]
    fn test_only_stale_branches_are_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb::new();
        let scatter = Scatter::new(Arc::new(db.clone()), dir.path());
        scatter.add(BackendConfig::new("b0", "a")).unwrap();
        scatter.add(BackendConfig::new("b1", "b")).unwrap();

        let old = "RXID-20200101000000-7";
        let fresh = make_xid(Local::now(), 8);
        db.add_backend_query("b0", "XA RECOVER", recover_result(&[old, &fresh]));
        db.add_backend_query("b1", "XA RECOVER", recover_result(&[]));
        db.add_query_error_pattern(Some("b1"), "XA COMMIT", 1397, "XAER_NOTA: Unknown XID");

        let xa = XaRecovery::new(Arc::clone(&scatter), 3600);
        assert_eq!(xa.commit().unwrap(), 1);
        let commits: Vec<_> = db
            .queries()
            .into_iter()
            .filter(|(_, q)| q.starts_with("XA COMMIT"))
            .collect();
        assert_eq!(commits.len(), 2);
        assert!(commits.iter().all(|(_, q)| q == &format!("XA COMMIT '{old}'")));
    }

    #[test]
    fn test_recover_uses_first_backend() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb::new();
        let scatter = Scatter::new(Arc::new(db.clone()), dir.path());
        scatter.add(BackendConfig::new("b1", "b")).unwrap();
        scatter.add(BackendConfig::new("b0", "a")).unwrap();
        db.add_query("XA RECOVER", recover_result(&["RXID-20200101000000-1"]));
        let xa = XaRecovery::new(scatter, 3600);
        assert_eq!(xa.recover().unwrap().rows.len(), 1);
        assert_eq!(db.queries(), vec![("b0".to_string(), "XA RECOVER".to_string())]);
    }

    #[test]
    fn test_sweeper_stops_without_waiting_out_interval() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb::new();
        let scatter = Scatter::new(Arc::new(db.clone()), dir.path());
        scatter.add(BackendConfig::new("b0", "a")).unwrap();
        db.add_query("XA RECOVER", recover_result(&["RXID-20200101000000-3"]));

        let handle = XaRecovery::new(scatter, 3600).start(XaAction::Rollback, Duration::from_secs(3600));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !db.queries().iter().any(|(_, q)| q.starts_with("XA ROLLBACK")) {
            assert!(std::time::Instant::now() < deadline, "sweeper never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
        let started = std::time::Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        let rollbacks = db.queries().iter().filter(|(_, q)| q.starts_with("XA ROLLBACK")).count();
        assert_eq!(rollbacks, 1);
    }
}
