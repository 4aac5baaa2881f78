//! Bounded per-backend connection pool.
//!
//! A borrower blocks (up to a timeout) while `max_connections` sessions are
//! checked out. Returned sessions go back to an idle list unless they were
//! marked broken; idle sessions older than `ping_after` are pinged before
//! being handed out again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use radon_common::config::BackendConfig;
use radon_common::{QueryResult, RadonError, RadonResult};

use crate::connection::{Connection, Connector};

/// Observable pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful borrows.
    pub borrows: u64,
    /// Connections handed back, broken or not.
    pub releases: u64,
    /// Borrows that had to wait for a free slot.
    pub waits: u64,
    /// Borrows that gave up waiting.
    pub timeouts: u64,
    /// Connections dropped because they were broken or failed a ping.
    pub discarded: u64,
    pub idle: usize,
    pub active: usize,
    pub max_connections: usize,
}

#[derive(Default)]
struct PoolCounters {
    borrows: AtomicU64,
    releases: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    discarded: AtomicU64,
}

struct IdleConn {
    conn: Box<dyn Connection>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConn>,
    /// Ids of checked-out sessions.
    active: HashSet<u32>,
    /// Slots reserved by borrowers that are still dialing.
    connecting: usize,
    closed: bool,
}

pub struct Pool {
    backend: BackendConfig,
    address: String,
    connector: Arc<dyn Connector>,
    acquire_timeout: Duration,
    ping_after: Duration,
    state: Mutex<PoolState>,
    cond: Condvar,
    counters: PoolCounters,
}

impl Pool {
    pub fn new(backend: BackendConfig, address: String, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            address,
            connector,
            acquire_timeout: Duration::from_secs(10),
            ping_after: Duration::from_secs(30),
            state: Mutex::new(PoolState::default()),
            cond: Condvar::new(),
            counters: PoolCounters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.backend.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check out a session, waiting for a free slot if the pool is full.
    pub fn get(self: &Arc<Self>) -> RadonResult<PooledConn> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut waited = false;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(RadonError::Internal(format!("pool[{}] is closed", self.backend.name)));
            }
            if let Some(idle) = state.idle.pop() {
                let id = idle.conn.id();
                state.active.insert(id);
                drop(state);
                return self.checkout(idle);
            }
            if state.active.len() + state.connecting < self.backend.max_connections.max(1) {
                state.connecting += 1;
                drop(state);
                let dialed = self.connector.connect(&self.backend, &self.address);
                let mut state = self.state.lock();
                state.connecting -= 1;
                return match dialed {
                    Ok(conn) => {
                        state.active.insert(conn.id());
                        self.counters.borrows.fetch_add(1, Ordering::Relaxed);
                        Ok(PooledConn::new(Arc::clone(self), conn))
                    }
                    Err(e) => {
                        self.cond.notify_one();
                        Err(e)
                    }
                };
            }
            if !waited {
                waited = true;
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(RadonError::Interrupted(format!(
                    "pool[{}] exhausted, waited {}ms for a connection",
                    self.backend.name,
                    self.acquire_timeout.as_millis()
                )));
            }
        }
    }

    fn checkout(self: &Arc<Self>, idle: IdleConn) -> RadonResult<PooledConn> {
        let IdleConn { mut conn, since } = idle;
        if since.elapsed() >= self.ping_after && conn.ping().is_err() {
            tracing::warn!(backend = %self.backend.name, conn_id = conn.id(), "idle connection failed ping, redialing");
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            let stale = conn.id();
            let fresh = self.connector.connect(&self.backend, &self.address);
            let mut state = self.state.lock();
            state.active.remove(&stale);
            match fresh {
                Ok(c) => {
                    state.active.insert(c.id());
                    conn = c;
                }
                Err(e) => {
                    self.cond.notify_one();
                    return Err(e);
                }
            }
        }
        self.counters.borrows.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConn::new(Arc::clone(self), conn))
    }

    fn put_back(&self, conn: Box<dyn Connection>) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.active.remove(&conn.id());
        if conn.is_broken() || state.closed {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        } else {
            state.idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        self.cond.notify_all();
    }

    /// Ids of the sessions currently checked out.
    pub fn active_ids(&self) -> Vec<u32> {
        self.state.lock().active.iter().copied().collect()
    }

    /// Block until nothing is checked out or `timeout` passes. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.active.is_empty() || state.connecting > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.active.is_empty() && state.connecting == 0;
            }
        }
        true
    }

    /// Kill a checked-out session through a side connection.
    pub fn kill(&self, conn_id: u32) -> RadonResult<()> {
        self.connector.kill(&self.backend, &self.address, conn_id)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Borrow a session and ping it. A session that fails the ping is
    /// discarded on release.
    pub fn is_alive(self: &Arc<Self>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.get() {
            Ok(mut conn) => conn.ping().is_ok(),
            Err(_) => false,
        }
    }

    /// Drop idle sessions and refuse new borrows.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
        self.cond.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            borrows: self.counters.borrows.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            idle: state.idle.len(),
            active: state.active.len(),
            max_connections: self.backend.max_connections,
        }
    }
}

/// A checked-out session. Dropping it returns the session to its pool,
/// so release happens exactly once on every exit path.
pub struct PooledConn {
    pool: Arc<Pool>,
    conn: Option<Box<dyn Connection>>,
    id: u32,
}

impl PooledConn {
    fn new(pool: Arc<Pool>, conn: Box<dyn Connection>) -> Self {
        let id = conn.id();
        Self {
            pool,
            conn: Some(conn),
            id,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn backend(&self) -> &str {
        self.pool.name()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn execute(&mut self, sql: &str) -> RadonResult<QueryResult> {
        match self.conn.as_mut() {
            Some(c) => c.execute(sql),
            None => Err(RadonError::Internal("connection already released".into())),
        }
    }

    pub fn execute_stream(
        &mut self,
        sql: &str,
        chunk_bytes: usize,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
    ) -> RadonResult<()> {
        match self.conn.as_mut() {
            Some(c) => c.execute_stream(sql, chunk_bytes, on_chunk),
            None => Err(RadonError::Internal("connection already released".into())),
        }
    }

    pub fn ping(&mut self) -> RadonResult<()> {
        match self.conn.as_mut() {
            Some(c) => c.ping(),
            None => Err(RadonError::Internal("connection already released".into())),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.conn.as_ref().map(|c| c.is_broken()).unwrap_or(true)
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakedb::FakeDb;

    fn pool(max: usize) -> Arc<Pool> {
        let mut cfg = BackendConfig::new("b0", "127.0.0.1:3306");
        cfg.max_connections = max;
        Pool::new(cfg, "127.0.0.1:3306".into(), Arc::new(FakeDb::new()))
    }

    #[test]
    fn test_reuse_idle_connection() {
        let p = pool(2);
        let id = {
            let c = p.get().unwrap();
            c.id()
        };
        let c = p.get().unwrap();
        assert_eq!(c.id(), id);
        drop(c);
        let s = p.stats();
        assert_eq!(s.borrows, 2);
        assert_eq!(s.releases, 2);
        assert_eq!(s.idle, 1);
        assert_eq!(s.active, 0);
    }

    #[test]
    fn test_full_pool_waits_for_release() {
        let p = pool(1);
        let held = p.get().unwrap();
        let p2 = Arc::clone(&p);
        let waiter = std::thread::spawn(move || p2.get().map(|c| c.id()));
        std::thread::sleep(Duration::from_millis(30));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
        assert_eq!(p.stats().waits, 1);
    }

    #[test]
    fn test_broken_connection_is_discarded() {
        let db = FakeDb::new();
        let mut cfg = BackendConfig::new("b0", "a");
        cfg.max_connections = 4;
        let p = Pool::new(cfg, "a".into(), Arc::new(db.clone()));
        let mut c = p.get().unwrap();
        db.kill_conn(c.id());
        assert!(c.execute("select 1").is_err());
        assert!(c.is_broken());
        drop(c);
        let s = p.stats();
        assert_eq!(s.idle, 0);
        assert_eq!(s.discarded, 1);
        assert_eq!(s.borrows, s.releases);
    }

    #[test]
    fn test_wait_idle() {
        let p = pool(2);
        let c = p.get().unwrap();
        assert!(!p.wait_idle(Duration::from_millis(10)));
        drop(c);
        assert!(p.wait_idle(Duration::from_millis(10)));
    }
}
