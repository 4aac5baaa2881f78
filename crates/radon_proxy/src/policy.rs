//! Read-only gate and read steering.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::classify::StmtKind;

/// Per-statement override: `/*+loadbalance=0*/` or `/*+loadbalance=1*/`.
pub fn load_balance_hint(sql: &str) -> Option<u8> {
    let caps = static_regex!(r"(?i)/\*\+\s*loadbalance\s*=\s*(\d+)\s*\*/")?.captures(sql)?;
    match caps.get(1)?.as_str() {
        "0" => Some(0),
        "1" => Some(1),
        _ => None,
    }
}

pub struct Policy {
    read_only: AtomicBool,
    load_balance: AtomicU8,
}

impl Policy {
    pub fn new(read_only: bool, load_balance: u8) -> Self {
        Self {
            read_only: AtomicBool::new(read_only),
            load_balance: AtomicU8::new(load_balance),
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub fn set_read_only(&self, on: bool) {
        if self.read_only.swap(on, Ordering::Relaxed) != on {
            tracing::info!(read_only = on, "read-only mode changed");
        }
    }

    pub fn load_balance(&self) -> u8 {
        self.load_balance.load(Ordering::Relaxed)
    }

    pub fn set_load_balance(&self, mode: u8) {
        self.load_balance.store(mode, Ordering::Relaxed);
    }

    /// Writes and DDL are refused while read-only.
    pub fn allows(&self, kind: StmtKind) -> bool {
        !(self.read_only() && (kind.is_write() || kind.is_ddl()))
    }

    /// Whether a read of `sql` goes to replicas.
    pub fn read_on_replica(&self, sql: &str) -> bool {
        load_balance_hint(sql).unwrap_or_else(|| self.load_balance()) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_parsing() {
        assert_eq!(load_balance_hint("/*+loadbalance=1*/ select 1"), Some(1));
        assert_eq!(load_balance_hint("select /*+ LOADBALANCE = 0 */ 1"), Some(0));
        assert_eq!(load_balance_hint("/*+loadbalance=7*/ select 1"), None);
        assert_eq!(load_balance_hint("select 1"), None);
    }

    #[test]
    fn test_hint_beats_default() {
        let p = Policy::new(false, 1);
        assert!(p.read_on_replica("select 1"));
        assert!(!p.read_on_replica("/*+loadbalance=0*/ select 1"));
        p.set_load_balance(0);
        assert!(!p.read_on_replica("select 1"));
        assert!(p.read_on_replica("/*+loadbalance=1*/ select 1"));
    }

    #[test]
    fn test_read_only_gate() {
        let p = Policy::new(true, 0);
        assert!(p.allows(StmtKind::Select));
        assert!(!p.allows(StmtKind::Insert));
        assert!(!p.allows(StmtKind::CreateTable));
        p.set_read_only(false);
        assert!(p.allows(StmtKind::Delete));
    }
}
