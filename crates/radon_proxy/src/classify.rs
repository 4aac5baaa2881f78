//! Cheap textual statement classification.
//!
//! Runs before any parsing: admin, session and DDL statements are routed on
//! their leading keywords because much of that surface is MySQL-specific
//! syntax the SQL parser does not accept.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    CreateDatabase,
    DropDatabase,
    CreateTable,
    DropTable,
    Alter,
    CreateIndex,
    DropIndex,
    Truncate,
    Explain,
    Describe,
    /// `OPTIMIZE`, `CHECK` and `CHECKSUM TABLE`.
    Maintenance,
    Use,
    Set,
    Kill,
    Show,
    Begin,
    Commit,
    Rollback,
    Xa,
    Radon,
    /// `/*! ... */` version-comment statements.
    Comment,
    Unknown,
}

impl StmtKind {
    pub fn name(self) -> &'static str {
        match self {
            StmtKind::Select => "select",
            StmtKind::Insert => "insert",
            StmtKind::Replace => "replace",
            StmtKind::Update => "update",
            StmtKind::Delete => "delete",
            StmtKind::CreateDatabase => "create_database",
            StmtKind::DropDatabase => "drop_database",
            StmtKind::CreateTable => "create_table",
            StmtKind::DropTable => "drop_table",
            StmtKind::Alter => "alter",
            StmtKind::CreateIndex => "create_index",
            StmtKind::DropIndex => "drop_index",
            StmtKind::Truncate => "truncate",
            StmtKind::Explain => "explain",
            StmtKind::Describe => "describe",
            StmtKind::Maintenance => "maintenance",
            StmtKind::Use => "use",
            StmtKind::Set => "set",
            StmtKind::Kill => "kill",
            StmtKind::Show => "show",
            StmtKind::Begin => "begin",
            StmtKind::Commit => "commit",
            StmtKind::Rollback => "rollback",
            StmtKind::Xa => "xa",
            StmtKind::Radon => "radon",
            StmtKind::Comment => "comment",
            StmtKind::Unknown => "unknown",
        }
    }

    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            StmtKind::CreateDatabase
                | StmtKind::DropDatabase
                | StmtKind::CreateTable
                | StmtKind::DropTable
                | StmtKind::Alter
                | StmtKind::CreateIndex
                | StmtKind::DropIndex
                | StmtKind::Truncate
        )
    }

    /// DML that changes rows.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StmtKind::Insert | StmtKind::Replace | StmtKind::Update | StmtKind::Delete
        )
    }

    /// Statements whose transaction may be aborted by `KILL` or disconnect
    /// while they run. Writes are left to finish their own commit protocol.
    pub fn is_abortable(self) -> bool {
        self == StmtKind::Select || self.is_ddl()
    }
}

impl fmt::Display for StmtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drop leading whitespace, `(` and comments, except a `/*!` version comment.
pub fn strip_leading(sql: &str) -> &str {
    let mut s = sql.trim_start();
    loop {
        if s.starts_with("/*!") {
            return s;
        }
        if let Some(rest) = s.strip_prefix("/*") {
            match rest.find("*/") {
                Some(end) => s = rest[end + 2..].trim_start(),
                None => return "",
            }
        } else if s.starts_with("--") || s.starts_with('#') {
            match s.find('\n') {
                Some(end) => s = s[end + 1..].trim_start(),
                None => return "",
            }
        } else if let Some(rest) = s.strip_prefix('(') {
            s = rest.trim_start();
        } else {
            return s;
        }
    }
}

/// First `n` words, lowercased.
fn leading_words(sql: &str, n: usize) -> Vec<String> {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == '`')
        .filter(|w| !w.is_empty())
        .take(n)
        .map(str::to_ascii_lowercase)
        .collect()
}

pub fn classify(sql: &str) -> StmtKind {
    let body = strip_leading(sql);
    if body.starts_with("/*!") {
        return StmtKind::Comment;
    }
    let words = leading_words(body, 3);
    let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");
    match word(0) {
        "select" | "with" => StmtKind::Select,
        "insert" => StmtKind::Insert,
        "replace" => StmtKind::Replace,
        "update" => StmtKind::Update,
        "delete" => StmtKind::Delete,
        "create" => match word(1) {
            "database" | "schema" => StmtKind::CreateDatabase,
            "table" | "temporary" => StmtKind::CreateTable,
            "index" | "unique" | "fulltext" | "spatial" => StmtKind::CreateIndex,
            _ => StmtKind::Unknown,
        },
        "drop" => match word(1) {
            "database" | "schema" => StmtKind::DropDatabase,
            "table" | "tables" | "temporary" => StmtKind::DropTable,
            "index" => StmtKind::DropIndex,
            _ => StmtKind::Unknown,
        },
        "alter" => StmtKind::Alter,
        "truncate" => StmtKind::Truncate,
        "explain" => StmtKind::Explain,
        "desc" | "describe" => StmtKind::Describe,
        "optimize" | "check" | "checksum" => StmtKind::Maintenance,
        "use" => StmtKind::Use,
        "set" => StmtKind::Set,
        "kill" => StmtKind::Kill,
        "show" => StmtKind::Show,
        "begin" => StmtKind::Begin,
        "start" if word(1) == "transaction" => StmtKind::Begin,
        "commit" => StmtKind::Commit,
        "rollback" => StmtKind::Rollback,
        "xa" => StmtKind::Xa,
        "radon" => StmtKind::Radon,
        _ => StmtKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dml_and_queries() {
        assert_eq!(classify("select 1"), StmtKind::Select);
        assert_eq!(classify("  (SELECT a FROM t) UNION (SELECT a FROM u)"), StmtKind::Select);
        assert_eq!(classify("/*+loadbalance=1*/ SELECT * FROM t"), StmtKind::Select);
        assert_eq!(classify("-- note\nINSERT INTO t VALUES (1)"), StmtKind::Insert);
        assert_eq!(classify("REPLACE INTO t VALUES (1)"), StmtKind::Replace);
        assert_eq!(classify("update t set a=1"), StmtKind::Update);
        assert_eq!(classify("DELETE FROM t"), StmtKind::Delete);
    }

    #[test]
    fn test_ddl() {
        assert_eq!(classify("CREATE DATABASE IF NOT EXISTS db"), StmtKind::CreateDatabase);
        assert_eq!(classify("create schema db"), StmtKind::CreateDatabase);
        assert_eq!(classify("CREATE TABLE t(a int)"), StmtKind::CreateTable);
        assert_eq!(classify("create unique index i on t(a)"), StmtKind::CreateIndex);
        assert_eq!(classify("DROP TABLE IF EXISTS t1, t2"), StmtKind::DropTable);
        assert_eq!(classify("drop index i on t"), StmtKind::DropIndex);
        assert_eq!(classify("ALTER TABLE t ADD COLUMN b int"), StmtKind::Alter);
        assert_eq!(classify("truncate table t"), StmtKind::Truncate);
        assert_eq!(classify("create view v as select 1"), StmtKind::Unknown);
        assert!(StmtKind::Truncate.is_ddl());
        assert!(!StmtKind::Select.is_ddl());
    }

    #[test]
    fn test_session_and_admin() {
        assert_eq!(classify("START TRANSACTION"), StmtKind::Begin);
        assert_eq!(classify("begin"), StmtKind::Begin);
        assert_eq!(classify("COMMIT"), StmtKind::Commit);
        assert_eq!(classify("rollback"), StmtKind::Rollback);
        assert_eq!(classify("use db"), StmtKind::Use);
        assert_eq!(classify("SET autocommit=0"), StmtKind::Set);
        assert_eq!(classify("KILL QUERY 7"), StmtKind::Kill);
        assert_eq!(classify("show processlist"), StmtKind::Show);
        assert_eq!(classify("XA RECOVER"), StmtKind::Xa);
        assert_eq!(classify("radon attachlist"), StmtKind::Radon);
        assert_eq!(classify("/*!40101 SET NAMES utf8 */"), StmtKind::Comment);
        assert_eq!(classify("checksum table t"), StmtKind::Maintenance);
        assert_eq!(classify("desc t"), StmtKind::Describe);
        assert_eq!(classify(""), StmtKind::Unknown);
        assert_eq!(classify("/* unterminated"), StmtKind::Unknown);
    }

    #[test]
    fn test_abortable() {
        assert!(StmtKind::Select.is_abortable());
        assert!(StmtKind::Alter.is_abortable());
        assert!(!StmtKind::Insert.is_abortable());
        assert!(!StmtKind::Begin.is_abortable());
    }
}
