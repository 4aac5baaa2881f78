//! Scriptable in-memory backend.
//!
//! Statements are answered from rules matched by exact text or regex, in
//! reverse registration order (newest wins). Rules may be pinned to one
//! backend, may fail, and may sleep before answering; a sleeping statement
//! is interrupted when its connection is killed. Every statement is logged
//! with the backend that received it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use radon_common::config::BackendConfig;
use radon_common::{QueryResult, RadonError, RadonResult};
use regex::Regex;

use crate::connection::{Connection, Connector};

const CR_SERVER_LOST: u16 = 2013;

/// Statements answered with an empty OK when no rule matches.
const CONTROL_PREFIXES: [&str; 9] = [
    "xa ", "begin", "start transaction", "commit", "rollback", "set ", "kill ", "use ", "/*!",
];

#[derive(Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    fn matches(&self, sql: &str) -> bool {
        match self {
            Matcher::Exact(s) => s == sql,
            Matcher::Pattern(re) => re.is_match(sql),
        }
    }
}

#[derive(Clone)]
enum Reply {
    Result(QueryResult),
    Error { code: u16, state: String, message: String },
}

#[derive(Clone)]
struct Rule {
    backend: Option<String>,
    matcher: Matcher,
    reply: Reply,
    delay: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    rules: RwLock<Vec<Rule>>,
    log: Mutex<Vec<(String, String)>>,
    next_conn_id: AtomicU32,
    killed: Mutex<HashSet<u32>>,
    kill_cond: Condvar,
    down: RwLock<HashSet<String>>,
    opened: AtomicU32,
}

#[derive(Clone, Default)]
pub struct FakeDb {
    inner: Arc<Inner>,
}

impl FakeDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, backend: Option<&str>, matcher: Matcher, reply: Reply, delay: Option<Duration>) {
        self.inner.rules.write().push(Rule {
            backend: backend.map(str::to_string),
            matcher,
            reply,
            delay,
        });
    }

    /// Answer `sql` on every backend.
    pub fn add_query(&self, sql: &str, result: QueryResult) {
        self.push(None, Matcher::Exact(sql.to_string()), Reply::Result(result), None);
    }

    /// Answer `sql` on one backend only.
    pub fn add_backend_query(&self, backend: &str, sql: &str, result: QueryResult) {
        self.push(Some(backend), Matcher::Exact(sql.to_string()), Reply::Result(result), None);
    }

    /// Answer every statement matching `pattern`.
    pub fn add_query_pattern(&self, pattern: &str, result: QueryResult) {
        if let Ok(re) = Regex::new(pattern) {
            self.push(None, Matcher::Pattern(re), Reply::Result(result), None);
        }
    }

    pub fn add_backend_query_pattern(&self, backend: &str, pattern: &str, result: QueryResult) {
        if let Ok(re) = Regex::new(pattern) {
            self.push(Some(backend), Matcher::Pattern(re), Reply::Result(result), None);
        }
    }

    /// Fail every statement matching `pattern`, optionally on one backend only.
    pub fn add_query_error_pattern(&self, backend: Option<&str>, pattern: &str, code: u16, message: &str) {
        if let Ok(re) = Regex::new(pattern) {
            let reply = Reply::Error {
                code,
                state: "HY000".into(),
                message: message.into(),
            };
            self.push(backend, Matcher::Pattern(re), reply, None);
        }
    }

    /// Answer `pattern` only after `delay`, unless the connection is killed first.
    pub fn add_query_delay_pattern(&self, backend: Option<&str>, pattern: &str, result: QueryResult, delay: Duration) {
        if let Ok(re) = Regex::new(pattern) {
            self.push(backend, Matcher::Pattern(re), Reply::Result(result), Some(delay));
        }
    }

    pub fn reset_rules(&self) {
        self.inner.rules.write().clear();
    }

    /// Refuse new connections to `backend`.
    pub fn set_down(&self, backend: &str, down: bool) {
        let mut set = self.inner.down.write();
        if down {
            set.insert(backend.to_string());
        } else {
            set.remove(backend);
        }
    }

    /// Every `(backend, sql)` received so far.
    pub fn queries(&self) -> Vec<(String, String)> {
        self.inner.log.lock().clone()
    }

    /// Statements received by `backend`.
    pub fn queries_on(&self, backend: &str) -> Vec<String> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(b, _)| b == backend)
            .map(|(_, q)| q.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    /// Connections ever opened.
    pub fn connections_opened(&self) -> u32 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    pub fn kill_conn(&self, conn_id: u32) {
        self.inner.killed.lock().insert(conn_id);
        self.inner.kill_cond.notify_all();
    }

    fn is_killed(&self, conn_id: u32) -> bool {
        self.inner.killed.lock().contains(&conn_id)
    }

    fn find(&self, backend: &str, sql: &str) -> Option<Rule> {
        self.inner
            .rules
            .read()
            .iter()
            .rev()
            .find(|r| r.backend.as_deref().map_or(true, |b| b == backend) && r.matcher.matches(sql))
            .cloned()
    }

    /// Sleep up to `delay`; `false` if the connection was killed meanwhile.
    fn sleep_unless_killed(&self, conn_id: u32, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut killed = self.inner.killed.lock();
        while !killed.contains(&conn_id) {
            if self.inner.kill_cond.wait_until(&mut killed, deadline).timed_out() {
                return !killed.contains(&conn_id);
            }
        }
        false
    }
}

impl Connector for FakeDb {
    fn connect(&self, backend: &BackendConfig, address: &str) -> RadonResult<Box<dyn Connection>> {
        let name = if !backend.replica.is_empty() && address == backend.replica {
            format!("{}:replica", backend.name)
        } else {
            backend.name.clone()
        };
        if self.inner.down.read().contains(&name) {
            return Err(RadonError::backend(2003, "HY000", format!("Can't connect to MySQL server on '{address}'")));
        }
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(FakeConn {
            db: self.clone(),
            backend: name,
            id,
            broken: false,
        }))
    }
}

struct FakeConn {
    db: FakeDb,
    backend: String,
    id: u32,
    broken: bool,
}

impl FakeConn {
    fn lost(&mut self) -> RadonError {
        self.broken = true;
        RadonError::backend(CR_SERVER_LOST, "HY000", "Lost connection to MySQL server during query")
    }
}

impl Connection for FakeConn {
    fn id(&self) -> u32 {
        self.id
    }

    fn execute(&mut self, sql: &str) -> RadonResult<QueryResult> {
        if self.broken || self.db.is_killed(self.id) {
            return Err(self.lost());
        }
        self.db.inner.log.lock().push((self.backend.clone(), sql.to_string()));

        let lower = sql.trim_start().to_ascii_lowercase();
        if let Some(target) = lower.strip_prefix("kill ") {
            let target = target.trim().trim_start_matches("query ").trim();
            if let Ok(id) = target.parse::<u32>() {
                self.db.kill_conn(id);
            }
            return Ok(QueryResult::default());
        }

        match self.db.find(&self.backend, sql) {
            Some(rule) => {
                if let Some(delay) = rule.delay {
                    if !self.db.sleep_unless_killed(self.id, delay) {
                        return Err(self.lost());
                    }
                }
                match rule.reply {
                    Reply::Result(r) => Ok(r),
                    Reply::Error { code, state, message } => Err(RadonError::backend(code, state, message)),
                }
            }
            None if CONTROL_PREFIXES.iter().any(|p| lower.starts_with(p)) => Ok(QueryResult::default()),
            None => Err(RadonError::backend(
                1105,
                "HY000",
                format!("fakedb: no rule for query[{sql}] on backend[{}]", self.backend),
            )),
        }
    }

    fn ping(&mut self) -> RadonResult<()> {
        if self.broken || self.db.is_killed(self.id) || self.db.inner.down.read().contains(&self.backend) {
            return Err(self.lost());
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken || self.db.is_killed(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_common::{Datum, Field, FieldType};

    fn conn(db: &FakeDb, name: &str) -> Box<dyn Connection> {
        db.connect(&BackendConfig::new(name, "x"), "x").unwrap()
    }

    #[test]
    fn test_exact_pattern_and_backend_rules() {
        let db = FakeDb::new();
        let r = QueryResult::new(vec![Field::new("a", FieldType::LongLong)], vec![vec![Datum::Int64(1)]]);
        db.add_query_pattern("select .* from t_\\d+", r.clone());
        db.add_backend_query("b1", "select 2", QueryResult::affected(7));
        let mut c0 = conn(&db, "b0");
        let mut c1 = conn(&db, "b1");
        assert_eq!(c0.execute("select a from t_0001").unwrap(), r);
        assert!(c0.execute("select 2").is_err());
        assert_eq!(c1.execute("select 2").unwrap().rows_affected, 7);
        assert!(c0.execute("XA START 'x'").is_ok());
        assert_eq!(db.queries_on("b1"), vec!["select 2".to_string()]);
    }

    #[test]
    fn test_kill_interrupts_delay() {
        let db = FakeDb::new();
        db.add_query_delay_pattern(None, "sleep", QueryResult::default(), Duration::from_secs(10));
        let mut victim = conn(&db, "b0");
        let id = victim.id();
        let db2 = db.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut side = db2.connect(&BackendConfig::new("b0", "x"), "x").unwrap();
            side.execute(&format!("KILL {id}")).unwrap();
        });
        let start = Instant::now();
        let err = victim.execute("sleep").unwrap_err();
        killer.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.is_backend_code(CR_SERVER_LOST));
        assert!(victim.is_broken());
    }

    #[test]
    fn test_down_backend_refuses() {
        let db = FakeDb::new();
        db.set_down("b0", true);
        assert!(db.connect(&BackendConfig::new("b0", "x"), "x").is_err());
        db.set_down("b0", false);
        assert!(db.connect(&BackendConfig::new("b0", "x"), "x").is_ok());
    }
}
