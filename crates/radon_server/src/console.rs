//! Interactive console: reads statements with `rustyline` and runs each one
//! through the proxy on a local session.

use std::time::Instant;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use radon_common::QueryResult;
use radon_proxy::{Proxy, Session};

pub fn run(proxy: &Proxy, session: &dyn Session) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let mut buffer = String::new();

    println!("radon v{} console, session {}", env!("CARGO_PKG_VERSION"), session.id());
    println!("End statements with ';'. Type quit to exit.");

    loop {
        let prompt = if buffer.is_empty() {
            let db = session.schema();
            format!("radon [{}]> ", if db.is_empty() { "(none)" } else { db.as_str() })
        } else {
            "     -> ".to_string()
        };
        let line = match rl.readline(&prompt) {
            Ok(l) => l,
            Err(ReadlineError::Interrupted) => {
                if !buffer.is_empty() {
                    println!("(buffer cleared)");
                    buffer.clear();
                }
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        };

        let trimmed = line.trim();
        if buffer.is_empty() && matches!(trimmed.to_ascii_lowercase().as_str(), "quit" | "exit" | "\\q") {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        buffer.push_str(&line);
        buffer.push('\n');
        if !ends_statement(&buffer) {
            continue;
        }

        let _ = rl.add_history_entry(buffer.trim());
        for stmt in split_statements(&buffer) {
            execute(proxy, session, &stmt);
        }
        buffer.clear();
    }
    Ok(())
}

/// Non-interactive `-e` mode; stops at the first failing statement.
pub fn run_batch(proxy: &Proxy, session: &dyn Session, sql: &str) -> Result<()> {
    for stmt in split_statements(sql) {
        let result = proxy.spanner().query(session, &stmt)?;
        print!("{}", render(&result));
    }
    Ok(())
}

fn execute(proxy: &Proxy, session: &dyn Session, sql: &str) {
    let start = Instant::now();
    match proxy.spanner().query(session, sql) {
        Ok(result) => {
            print!("{}", render(&result));
            println!("({:.3} sec)\n", start.elapsed().as_secs_f64());
        }
        Err(e) => println!("ERROR {} ({}): {e}\n", e.mysql_code(), e.sql_state()),
    }
}

/// Whether the buffered input ends with a `;` outside quotes and comments.
fn ends_statement(buffer: &str) -> bool {
    let mut last_terminated = false;
    scan(buffer, |ev| match ev {
        Scan::Terminator => last_terminated = true,
        Scan::Code(c) if !c.is_whitespace() => last_terminated = false,
        _ => {}
    });
    last_terminated
}

/// Split on `;` outside quotes and comments; blank statements are dropped.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    scan(input, |ev| match ev {
        Scan::Terminator => {
            let stmt = current.trim();
            if !stmt.is_empty() {
                out.push(stmt.to_string());
            }
            current.clear();
        }
        Scan::Code(c) | Scan::Quoted(c) => current.push(c),
    });
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

enum Scan {
    Code(char),
    /// Inside a literal, identifier quote or comment.
    Quoted(char),
    Terminator,
}

fn scan(input: &str, mut emit: impl FnMut(Scan)) {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                emit(Scan::Code(c));
                i += 1;
                while i < chars.len() {
                    let q = chars[i];
                    i += 1;
                    if q == '\\' && c != '`' && i < chars.len() {
                        emit(Scan::Quoted(q));
                        emit(Scan::Quoted(chars[i]));
                        i += 1;
                        continue;
                    }
                    if q == c {
                        emit(Scan::Code(q));
                        break;
                    }
                    emit(Scan::Quoted(q));
                }
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    emit(Scan::Quoted(chars[i]));
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    emit(Scan::Quoted(chars[i]));
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                emit(Scan::Quoted('/'));
                emit(Scan::Quoted('*'));
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        emit(Scan::Quoted('*'));
                        emit(Scan::Quoted('/'));
                        i += 2;
                        break;
                    }
                    emit(Scan::Quoted(chars[i]));
                    i += 1;
                }
            }
            ';' => {
                emit(Scan::Terminator);
                i += 1;
            }
            _ => {
                emit(Scan::Code(c));
                i += 1;
            }
        }
    }
}

/// MySQL client style table; statements without columns print the OK line.
pub fn render(result: &QueryResult) -> String {
    if result.fields.is_empty() {
        return format!("Query OK, {} rows affected\n", result.rows_affected);
    }
    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|d| d.to_mysql_text().unwrap_or_else(|| "NULL".into()))
                .collect()
        })
        .collect();
    let mut widths: Vec<usize> = result.fields.iter().map(|f| f.name.chars().count()).collect();
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let border: String = widths.iter().map(|w| format!("+{}", "-".repeat(w + 2))).collect::<String>() + "+\n";
    let mut out = border.clone();
    let header: Vec<&str> = result.fields.iter().map(|f| f.name.as_str()).collect();
    out.push_str(&table_line(&widths, &header));
    out.push_str(&border);
    for row in &cells {
        let values: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push_str(&table_line(&widths, &values));
    }
    if !cells.is_empty() {
        out.push_str(&border);
    }
    let noun = if cells.len() == 1 { "row" } else { "rows" };
    out.push_str(&format!("{} {noun} in set\n", cells.len()));
    out
}

fn table_line(widths: &[usize], values: &[&str]) -> String {
    let mut s: String = widths
        .iter()
        .zip(values)
        .map(|(w, v)| format!("| {v:<w$} ", w = *w))
        .collect();
    s.push_str("|\n");
    s
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use radon_backend::fakedb::FakeDb;
    use radon_backend::Scatter;
    use radon_common::config::{BackendConfig, ProxyConfig, RouterConfig};
    use radon_common::{Datum, Field, FieldType};
    use radon_proxy::LocalSession;
    use radon_router::MetaRouter;

    use super::*;

    #[test]
    fn test_split_statements() {
        assert_eq!(
            split_statements("select 1; select ';' ; -- a;b\nshow tables;;"),
            vec!["select 1", "select ';'", "-- a;b\nshow tables"]
        );
        assert_eq!(split_statements("set @a='x\\';y'"), vec!["set @a='x\\';y'"]);
        assert_eq!(split_statements("select `a;b` /* ; */ from t"), vec!["select `a;b` /* ; */ from t"]);
        assert!(split_statements(" ; ").is_empty());
    }

    #[test]
    fn test_ends_statement() {
        assert!(ends_statement("select 1;\n"));
        assert!(!ends_statement("select ';'\n"));
        assert!(!ends_statement("select 1; select\n"));
        assert!(ends_statement("select 1; # done\n"));
    }

    #[test]
    fn test_render_table() {
        let r = QueryResult::new(
            vec![Field::new("id", FieldType::LongLong), Field::new("name", FieldType::VarString)],
            vec![
                vec![Datum::Int64(7), Datum::from("go")],
                vec![Datum::Int64(10), Datum::Null],
            ],
        );
        let want = "\
+----+------+
| id | name |
+----+------+
| 7  | go   |
| 10 | NULL |
+----+------+
2 rows in set
";
        assert_eq!(render(&r), want);
        assert_eq!(render(&QueryResult::affected(3)), "Query OK, 3 rows affected\n");
    }

    #[test]
    fn test_batch_runs_through_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let db = FakeDb::new();
        let scatter = Scatter::new(Arc::new(db.clone()), dir.path());
        scatter.add(BackendConfig::new("b0", "127.0.0.1:3306")).unwrap();
        db.add_query_pattern("(?i)^CREATE DATABASE", QueryResult::default());
        let router = Arc::new(MetaRouter::new(RouterConfig::default()));
        let conf = ProxyConfig {
            meta_dir: dir.path().display().to_string(),
            disk_check_dir: dir.path().display().to_string(),
            ..ProxyConfig::default()
        };
        let proxy = Proxy::new(conf, router, scatter);
        let session = Arc::new(LocalSession::new("root", "console"));
        proxy.session_open(session.clone()).unwrap();

        run_batch(&proxy, &*session, "create database d1; use d1").unwrap();
        assert_eq!(session.schema(), "d1");
        assert!(run_batch(&proxy, &*session, "use nowhere; create database d2").is_err());
        assert!(db.queries().iter().all(|(_, q)| q != "create database d2"));
    }
}
