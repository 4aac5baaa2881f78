use std::sync::Arc;

use radon_backend::fakedb::FakeDb;
use radon_backend::Scatter;
use radon_common::config::{BackendConfig, RouterConfig};
use radon_common::{Datum, Field, FieldType, QueryResult, RadonError};
use radon_planner::{JoinStrategy, Plan, PlanNode, Planner};
use radon_router::{MetaRouter, Router, ShardType, TableExtra};

use crate::tree::execute_plan;
use crate::{ExecContext, Tree};

struct Env {
    _dir: tempfile::TempDir,
    db: FakeDb,
    scatter: Arc<Scatter>,
    router: Arc<MetaRouter>,
}

/// `a` on b0/b1 and `c` on b2/b3, four partitions each.
fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let db = FakeDb::new();
    let scatter = Scatter::new(Arc::new(db.clone()), dir.path());
    for (i, n) in ["b0", "b1", "b2", "b3"].iter().enumerate() {
        scatter.add(BackendConfig::new(*n, format!("127.0.0.1:{}", 3306 + i))).unwrap();
    }
    let router = MetaRouter::new(RouterConfig { slots: 4096, blocks: 1024 });
    router.create_database("db").unwrap();
    let extra = TableExtra::default();
    let near = vec!["b0".to_string(), "b1".to_string()];
    let far = vec!["b2".to_string(), "b3".to_string()];
    router.create_table("db", "a", "id", ShardType::Hash, &near, &extra).unwrap();
    router.create_table("db", "c", "id", ShardType::Hash, &far, &extra).unwrap();
    Env {
        _dir: dir,
        db,
        scatter,
        router: Arc::new(router),
    }
}

impl Env {
    fn planner(&self) -> Planner {
        Planner::new(self.router.clone())
    }

    fn run_with(&self, planner: &Planner, sql: &str) -> Result<QueryResult, RadonError> {
        let plan = planner.build("db", sql)?;
        let txn = self.scatter.create_transaction().unwrap();
        let ctx = ExecContext::new(txn.clone()).with_join_workers(2);
        let r = execute_plan(&ctx, &plan);
        txn.finish();
        r
    }

    fn run(&self, sql: &str) -> Result<QueryResult, RadonError> {
        self.run_with(&self.planner(), sql)
    }

    fn assert_pools_balanced(&self) {
        for (name, s) in self.scatter.pool_clone() {
            assert_eq!(s.borrows, s.releases, "pool {name} leaked a connection");
            assert_eq!(s.active, 0, "pool {name} still has active connections");
        }
    }

    /// Answer reads of one physical table.
    fn table(&self, physical: &str, result: QueryResult) {
        self.db.add_query_pattern(&format!("`{physical}`"), result);
    }
}

fn ints(names: &[&str], rows: &[&[Option<i64>]]) -> QueryResult {
    QueryResult::new(
        names.iter().map(|n| Field::new(*n, FieldType::LongLong)).collect(),
        rows.iter()
            .map(|r| r.iter().map(|v| v.map_or(Datum::Null, Datum::Int64)).collect())
            .collect(),
    )
}

fn name_id(rows: &[(&str, i64)]) -> QueryResult {
    QueryResult::new(
        vec![
            Field::new("name", FieldType::VarString),
            Field::new("id", FieldType::LongLong),
        ],
        rows.iter().map(|(n, i)| vec![Datum::from(*n), Datum::Int64(*i)]).collect(),
    )
}

fn render(r: &QueryResult) -> Vec<String> {
    r.rows
        .iter()
        .map(|row| row.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(","))
        .collect()
}

fn sorted(r: &QueryResult) -> Vec<String> {
    let mut v = render(r);
    v.sort();
    v
}

fn seed_join(e: &Env) {
    e.table("a_0000", ints(&["id"], &[&[Some(1)], &[Some(2)]]));
    e.table("a_0001", ints(&["id"], &[&[Some(3)]]));
    e.table("a_0002", ints(&["id"], &[]));
    e.table("a_0003", ints(&["id"], &[&[Some(4)], &[None]]));
    e.table("c_0000", name_id(&[("x1", 1), ("x3", 3)]));
    e.table("c_0001", name_id(&[("x4", 4), ("x9", 9)]));
    e.table("c_0002", name_id(&[]));
    e.table("c_0003", name_id(&[]));
}

// ── merge + operators ──

#[test]
fn test_scatter_order_and_limit() {
    let e = env();
    e.table("a_0000", ints(&["id"], &[&[Some(1)], &[Some(5)]]));
    e.table("a_0001", ints(&["id"], &[&[Some(2)], &[Some(6)]]));
    e.table("a_0002", ints(&["id"], &[&[Some(3)]]));
    e.table("a_0003", ints(&["id"], &[&[Some(4)]]));
    let r = e.run("SELECT id FROM a ORDER BY id DESC LIMIT 1, 2").unwrap();
    assert_eq!(render(&r), vec!["5", "4"]);
    let r = e.run("SELECT id FROM a").unwrap();
    assert_eq!(r.rows.len(), 6);
    e.assert_pools_balanced();
}

#[test]
fn test_pushed_aggregates_recombine() {
    let e = env();
    let names = ["COUNT(*)", "SUM(score)", "AVG(score)", "COUNT(score)"];
    e.table("a_0000", ints(&names, &[&[Some(2), Some(10), Some(10), Some(2)]]));
    e.table("a_0001", ints(&names, &[&[Some(1), Some(5), Some(5), Some(1)]]));
    e.table("a_0002", ints(&names, &[&[Some(0), None, None, Some(0)]]));
    e.table("a_0003", ints(&names, &[&[Some(1), Some(3), Some(3), Some(1)]]));
    let r = e.run("SELECT COUNT(*), SUM(score), AVG(score) FROM a").unwrap();
    assert_eq!(r.fields.len(), 3);
    assert_eq!(r.rows, vec![vec![Datum::Int64(4), Datum::Int64(18), Datum::Float64(4.5)]]);
    let sent = e.db.queries();
    assert!(sent.iter().any(|(_, q)| q.contains("COUNT(score)")));
}

#[test]
fn test_group_by_over_shards() {
    let e = env();
    let names = ["kind", "SUM(score)"];
    e.table("a_0000", ints(&names, &[&[Some(1), Some(10)], &[Some(2), Some(1)]]));
    e.table("a_0001", ints(&names, &[&[Some(2), Some(4)]]));
    e.table("a_0002", ints(&names, &[&[Some(1), Some(5)]]));
    e.table("a_0003", ints(&names, &[]));
    let r = e
        .run("SELECT kind, SUM(score) FROM a GROUP BY kind ORDER BY kind DESC")
        .unwrap();
    assert_eq!(render(&r), vec!["2,5", "1,15"]);
}

// ── joins ──

#[test]
fn test_join_strategies_agree() {
    let e = env();
    seed_join(&e);
    let sql = "SELECT a.id, c.name FROM a JOIN c ON a.id = c.id";
    let hashed = e.run(sql).unwrap();
    let merged = e.run_with(&e.planner().with_row_num_limit(0), sql).unwrap();
    assert_eq!(sorted(&hashed), vec!["1,x1", "3,x3", "4,x4"]);
    assert_eq!(sorted(&hashed), sorted(&merged));
    let names: Vec<&str> = hashed.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name"]);
    e.assert_pools_balanced();
}

#[test]
fn test_left_join_pads_missing_rows() {
    let e = env();
    seed_join(&e);
    let sql = "SELECT a.id, c.name FROM a LEFT JOIN c ON a.id = c.id";
    let hashed = e.run(sql).unwrap();
    let merged = e.run_with(&e.planner().with_row_num_limit(0), sql).unwrap();
    assert_eq!(sorted(&hashed), vec!["1,x1", "2,NULL", "3,x3", "4,x4", "NULL,NULL"]);
    assert_eq!(sorted(&hashed), sorted(&merged));
}

#[test]
fn test_nested_loop_binds_outer_key() {
    let e = env();
    e.db.add_query_pattern(r"`a_\d+`.* WHERE a\.id = 3", ints(&["id"], &[&[Some(3)]]));
    e.db.add_query_pattern(r"`c_\d+`.*c\.id = 3", name_id(&[("x3", 3)]));
    let sql = "SELECT a.id, c.name FROM a JOIN c ON a.id = c.id WHERE a.id = 3";
    let plan = e.planner().build("db", sql).unwrap();
    let Plan::Select(p) = &plan else {
        panic!("expected a select plan");
    };
    let PlanNode::Join(j) = &p.root else {
        panic!("expected a join");
    };
    assert_eq!(j.strategy, JoinStrategy::NestedLoop);

    let r = e.run(sql).unwrap();
    assert_eq!(render(&r), vec!["3,x3"]);
    let inner: Vec<String> = e
        .db
        .queries()
        .into_iter()
        .map(|(_, q)| q)
        .filter(|q| q.contains("`c_"))
        .collect();
    assert_eq!(inner.len(), 1, "{inner:?}");
    assert!(!inner[0].contains("__radon_nl_"));
    e.assert_pools_balanced();
}

#[test]
fn test_nested_loop_field_round_without_outer_rows() {
    let e = env();
    e.db.add_query_pattern(r"`a_\d+`", ints(&["id"], &[]));
    e.db.add_query_pattern(r"`c_\d+`.*c\.id = NULL", name_id(&[]));
    let r = e
        .run("SELECT a.id, c.name FROM a JOIN c ON a.id = c.id WHERE a.id = 3")
        .unwrap();
    assert!(r.rows.is_empty());
    let names: Vec<&str> = r.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name"]);
}

#[test]
fn test_join_aggregate_runs_on_joined_rows() {
    let e = env();
    e.table("a_0000", ints(&["id"], &[&[Some(1)]]));
    e.table("a_0001", ints(&["id"], &[&[Some(2)]]));
    e.table("a_0002", ints(&["id"], &[]));
    e.table("a_0003", ints(&["id"], &[]));
    e.table("c_0000", ints(&["COUNT(c.id)"], &[&[Some(1)], &[Some(1)]]));
    e.table("c_0001", ints(&["COUNT(c.id)"], &[&[Some(2)]]));
    e.table("c_0002", ints(&["COUNT(c.id)"], &[]));
    e.table("c_0003", ints(&["COUNT(c.id)"], &[]));
    let r = e
        .run("SELECT a.id, COUNT(c.id) FROM a JOIN c ON a.id = c.id GROUP BY a.id")
        .unwrap();
    assert_eq!(render(&r), vec!["1,2", "2,1"]);
}

#[test]
fn test_join_row_limit() {
    let e = env();
    seed_join(&e);
    let plan = e.planner().build("db", "SELECT a.id, c.id FROM a, c").unwrap();
    let txn = e.scatter.create_transaction().unwrap();
    txn.set_max_join_rows(3);
    let err = execute_plan(&ExecContext::new(txn.clone()), &plan).unwrap_err();
    txn.finish();
    assert!(err.to_string().contains("join.row.count.exceeded"), "{err}");
    e.assert_pools_balanced();
}

// ── union ──

#[test]
fn test_union_distinct_and_all() {
    let e = env();
    e.db.add_query_pattern(r"`a_\d+`", ints(&["id"], &[&[Some(1)], &[Some(2)]]));
    e.db.add_query_pattern(r"`c_\d+`", ints(&["id"], &[&[Some(2)], &[Some(3)]]));
    let r = e.run("SELECT id FROM a UNION SELECT id FROM c").unwrap();
    assert_eq!(render(&r), vec!["1", "2", "3"]);
    let r = e.run("SELECT id FROM a UNION ALL SELECT id FROM c").unwrap();
    assert_eq!(r.rows.len(), 16);
}

#[test]
fn test_union_column_mismatch() {
    let e = env();
    e.db.add_query_pattern(r"`a_\d+`", ints(&["id"], &[&[Some(1)]]));
    e.db.add_query_pattern(r"`c_\d+`", ints(&["id", "name"], &[&[Some(2), Some(3)]]));
    let err = e.run("SELECT id FROM a UNION SELECT id, name FROM c").unwrap_err();
    assert!(matches!(err, RadonError::Unsupported(_)), "{err}");
}

// ── tree ──

#[test]
fn test_tree_runs_writes_and_streams_reads() {
    let e = env();
    e.db.add_query_pattern("^INSERT", QueryResult::affected(1));
    let plan = e
        .planner()
        .build("db", "INSERT INTO a(id, name) VALUES (1, 'x'), (2, 'y'), (3, 'z')")
        .unwrap();
    let fragments = plan.querys().len() as u64;
    let txn = e.scatter.create_transaction().unwrap();
    let mut tree = Tree::new(ExecContext::new(txn.clone()));
    tree.add(plan);
    let r = tree.execute().unwrap();
    assert_eq!(r.rows_affected, fragments);

    e.db.add_query_pattern(r"`a_\d+`", ints(&["id"], &[&[Some(7)], &[Some(8)]]));
    let mut tree = Tree::new(ExecContext::new(txn.clone()));
    tree.add(e.planner().build("db", "SELECT id FROM a").unwrap());
    let mut rows = 0;
    tree.execute_stream_fetch(
        &mut |chunk| {
            rows += chunk.rows.len();
            Ok(())
        },
        16,
    )
    .unwrap();
    txn.finish();
    assert_eq!(rows, 8);
    e.assert_pools_balanced();
}

#[test]
fn test_empty_tree_is_an_error() {
    let e = env();
    let txn = e.scatter.create_transaction().unwrap();
    let tree = Tree::new(ExecContext::new(txn.clone()));
    assert!(tree.execute().is_err());
    txn.finish();
}
