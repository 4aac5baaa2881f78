use std::sync::Arc;

use radon_common::config::RouterConfig;
use radon_common::result::Direction;
use radon_common::{Datum, RadonError, ReqMode};
use radon_router::{MetaRouter, Router, ShardType, TableExtra};

use crate::*;

fn router() -> Arc<MetaRouter> {
    let r = MetaRouter::new(RouterConfig { slots: 4096, blocks: 1024 });
    r.create_database("db").unwrap();
    let near = vec!["b0".to_string(), "b1".to_string()];
    let far = vec!["b2".to_string(), "b3".to_string()];
    let extra = TableExtra::default();
    r.create_table("db", "a", "id", ShardType::Hash, &near, &extra).unwrap();
    r.create_table("db", "b", "id", ShardType::Hash, &near, &extra).unwrap();
    r.create_table("db", "c", "id", ShardType::Hash, &far, &extra).unwrap();
    r.create_non_part_table("db", "g", ShardType::Global, &near, &extra).unwrap();
    r.create_non_part_table("db", "s", ShardType::Single, &near, &extra).unwrap();
    Arc::new(r)
}

fn planner() -> Planner {
    Planner::new(router())
}

fn select_root(plan: Plan) -> PlanNode {
    match plan {
        Plan::Select(p) | Plan::Union(p) => p.root,
        other => panic!("expected a select plan, got {}", other.kind()),
    }
}

fn merge(node: &PlanNode) -> &MergeNode {
    match node {
        PlanNode::Merge(m) => m,
        _ => panic!("expected a merge node"),
    }
}

fn join(node: &PlanNode) -> &JoinNode {
    match node {
        PlanNode::Join(j) => j,
        _ => panic!("expected a join node"),
    }
}

fn queries(node: &PlanNode) -> Vec<String> {
    node.querys().into_iter().map(|q| q.query.clone()).collect()
}

fn segment_of(table: &str, key: i64) -> String {
    let k = Datum::Int64(key);
    router().lookup("db", table, Some(&k), Some(&k)).unwrap()[0].table.clone()
}

// ── single-table select ──

#[test]
fn test_select_scatters_to_every_partition() {
    let root = select_root(planner().build("db", "SELECT id, name FROM a WHERE id > 1").unwrap());
    let m = merge(&root);
    assert_eq!(m.mode, ReqMode::Normal);
    assert_eq!(m.querys.len(), 4);
    for (i, q) in m.querys.iter().enumerate() {
        assert!(q.query.contains(&format!("`db`.`a_{i:04}`")), "{}", q.query);
        assert!(q.query.contains("id > 1"));
    }
    assert_eq!(m.querys[0].backend, "b0");
    assert_eq!(m.querys[1].backend, "b1");
    assert!(m.children.is_empty());
}

#[test]
fn test_point_lookup_is_pushed_whole() {
    let sql = "SELECT id, SUM(score) FROM a WHERE id = 7 GROUP BY id ORDER BY id LIMIT 3";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 1);
    let q = &m.querys[0].query;
    assert!(q.contains(&format!("`db`.`{}`", segment_of("a", 7))), "{q}");
    assert!(q.contains("GROUP BY id"));
    assert!(q.contains("LIMIT 3"));
    assert!(m.children.is_empty());
}

#[test]
fn test_in_list_prunes_partitions() {
    let root = select_root(planner().build("db", "SELECT name FROM a WHERE id IN (7, 7)").unwrap());
    assert_eq!(merge(&root).querys.len(), 1);

    let mut want: Vec<String> = [1, 2, 3].iter().map(|k| segment_of("a", *k)).collect();
    want.sort();
    want.dedup();
    let root = select_root(planner().build("db", "SELECT name FROM a WHERE id IN (1, 2, 3)").unwrap());
    assert_eq!(merge(&root).querys.len(), want.len());
}

#[test]
fn test_global_reads_one_copy_single_reads_its_backend() {
    let root = select_root(planner().build("db", "SELECT x FROM g").unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 1);
    assert_eq!(m.querys[0].backend, "b0");
    assert!(m.querys[0].query.contains("`db`.`g`"));

    let root = select_root(planner().build("db", "SELECT x FROM s").unwrap());
    assert_eq!(merge(&root).querys.len(), 1);
}

#[test]
fn test_no_from_and_system_db_go_single() {
    let root = select_root(planner().build("db", "SELECT 1").unwrap());
    assert_eq!(merge(&root).mode, ReqMode::SingleRequest);
    let root = select_root(
        planner()
            .build("db", "SELECT table_name FROM information_schema.tables")
            .unwrap(),
    );
    let m = merge(&root);
    assert_eq!(m.mode, ReqMode::SingleRequest);
    assert!(m.raw_query.contains("information_schema"));
}

// ── aggregation and post-processing ──

#[test]
fn test_avg_is_pushed_as_sum_and_hidden_count() {
    let root = select_root(planner().build("db", "SELECT AVG(score) FROM a WHERE id > 8").unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 4);
    let q = &m.querys[0].query;
    assert!(q.contains("SUM(score) AS `AVG(score)`"), "{q}");
    assert!(q.contains("COUNT(score)"), "{q}");
    let [SubPlan::Aggregate(agg)] = m.children.as_slice() else {
        panic!("expected one aggregate sub-plan: {:?}", m.children);
    };
    assert_eq!(agg.hidden, vec![1]);
    assert_eq!(
        agg.aggregators,
        vec![Aggregator {
            index: 0,
            kind: AggKind::Avg,
            distinct: false,
            pushed: true,
            count_index: Some(1),
        }]
    );
}

#[test]
fn test_distinct_aggregate_fetches_raw_values() {
    let sql = "SELECT id, COUNT(DISTINCT score) FROM a WHERE id > 2 GROUP BY id";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    let q = &m.querys[0].query;
    assert!(q.starts_with("SELECT id, score AS `COUNT(DISTINCT score)` FROM"), "{q}");
    assert!(!q.contains("GROUP BY"), "{q}");
    let SubPlan::Aggregate(agg) = &m.children[0] else {
        panic!("expected an aggregate");
    };
    assert_eq!(agg.group_by, vec![0]);
    assert!(agg.aggregators[0].distinct);
    assert!(!agg.aggregators[0].pushed);
}

#[test]
fn test_group_by_order_limit_sub_plans_in_order() {
    let sql = "SELECT k, SUM(score) AS total FROM a GROUP BY k ORDER BY total DESC LIMIT 2, 5";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    assert!(!m.querys[0].query.contains("LIMIT"));
    assert!(!m.querys[0].query.contains("ORDER BY"));
    assert!(m.querys[0].query.contains("GROUP BY k"));
    match m.children.as_slice() {
        [SubPlan::Aggregate(a), SubPlan::OrderBy(o), SubPlan::Limit(l)] => {
            assert_eq!(a.group_by, vec![0]);
            assert_eq!(a.aggregators[0].kind, AggKind::Sum);
            assert_eq!(o.keys[0].field, "total");
            assert_eq!(o.keys[0].direction, Direction::Desc);
            assert_eq!(*l, LimitPlan { offset: 2, count: 5 });
        }
        other => panic!("unexpected sub-plans {other:?}"),
    }
}

#[test]
fn test_select_distinct_groups_every_column() {
    let root = select_root(planner().build("db", "SELECT DISTINCT k, name FROM a").unwrap());
    let SubPlan::Aggregate(agg) = &merge(&root).children[0] else {
        panic!("expected an aggregate");
    };
    assert_eq!(agg.group_by, vec![0, 1]);
    assert!(agg.aggregators.is_empty());
}

#[test]
fn test_limit_pushed_as_offset_plus_count() {
    let sql = "SELECT id, name FROM a WHERE id > 8 ORDER BY id DESC, name ASC LIMIT 1, 2";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    let q = &m.querys[0].query;
    assert!(q.contains("LIMIT 3"), "{q}");
    assert!(!q.contains("OFFSET"), "{q}");
    match m.children.as_slice() {
        [SubPlan::OrderBy(o), SubPlan::Limit(l)] => {
            let keys: Vec<(&str, Direction)> = o.keys.iter().map(|k| (k.field.as_str(), k.direction)).collect();
            assert_eq!(keys, vec![("id", Direction::Desc), ("name", Direction::Asc)]);
            assert_eq!(*l, LimitPlan { offset: 1, count: 2 });
        }
        other => panic!("unexpected sub-plans {other:?}"),
    }
}

#[test]
fn test_order_by_must_be_selected() {
    let err = planner().build("db", "SELECT id FROM a ORDER BY name").unwrap_err();
    assert!(matches!(err, RadonError::Unsupported(_)), "{err}");
}

// ── joins ──

#[test]
fn test_colocated_join_pairs_partitions() {
    let sql = "SELECT a.id, b.name FROM a JOIN b ON a.id = b.id WHERE a.id > 2";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 4);
    for (i, q) in m.querys.iter().enumerate() {
        assert!(q.query.contains(&format!("`db`.`a_{i:04}` AS `a`")), "{}", q.query);
        assert!(q.query.contains(&format!("`db`.`b_{i:04}` AS `b`")), "{}", q.query);
    }

    let sql = "SELECT a.id, b.name FROM a JOIN b ON a.id = b.id WHERE a.id = 7";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 1);
    assert!(m.querys[0].query.contains(&segment_of("a", 7)));
}

#[test]
fn test_global_joins_single_on_its_backend() {
    let sql = "SELECT g.x, s.y FROM g JOIN s ON g.x = s.y";
    let root = select_root(planner().build("db", sql).unwrap());
    let m = merge(&root);
    assert_eq!(m.querys.len(), 1);
    assert_eq!(m.querys[0].backend, "b0");
    assert!(m.querys[0].query.contains("`db`.`g` AS `g`"));
    assert!(m.querys[0].query.contains("`db`.`s` AS `s`"));
}

#[test]
fn test_sort_merge_join_tree() {
    let sql = "SELECT a.id, c.name FROM a JOIN c ON a.id = c.id WHERE a.id > 2 AND c.name <> 'x' ORDER BY a.id";
    let root = select_root(planner().build("db", sql).unwrap());
    let j = join(&root);
    assert_eq!(j.strategy, JoinStrategy::SortMerge);
    assert!(!j.is_left_join);
    assert_eq!(j.left_keys, vec![0]);
    assert_eq!(j.right_keys, vec![1]);
    assert_eq!(j.cols, vec![-1, 1]);
    assert_eq!(j.row_num_limit, DEFAULT_ROW_NUM_LIMIT);

    let left = queries(&j.left);
    assert_eq!(left.len(), 4);
    assert_eq!(left[0], "SELECT a.id AS `id` FROM `db`.`a_0000` AS `a` WHERE a.id > 2");
    let right = queries(&j.right);
    assert_eq!(right.len(), 4);
    assert_eq!(
        right[0],
        "SELECT c.name AS `name`, c.id AS `id` FROM `db`.`c_0000` AS `c` WHERE c.name <> 'x'"
    );
    assert_eq!(right.iter().filter(|q| q.contains("c_0002")).count(), 1);
    assert!(matches!(j.children.as_slice(), [SubPlan::OrderBy(_)]));
}

#[test]
fn test_left_join_tmp_columns_and_filters() {
    let sql = "SELECT a.id, c.name FROM a LEFT JOIN c ON a.id = c.id AND a.score > 1 AND a.id < c.score \
               WHERE c.name = 'z'";
    let root = select_root(planner().build("db", sql).unwrap());
    let j = join(&root);
    assert!(j.is_left_join);
    assert!(j.has_right_filter);
    assert_eq!(j.left_keys, vec![0]);
    assert_eq!(j.right_keys, vec![1]);
    assert_eq!(j.left_tmp_cols, vec![1]);
    assert_eq!(
        j.cmp_filters,
        vec![CmpFilter {
            left: 0,
            right: 2,
            op: CmpOp::Lt,
            exchange: false,
        }]
    );
    let left = queries(&j.left);
    assert!(left[0].contains("(a.score > 1) AS `tmpc_1`"), "{}", left[0]);
    let right = queries(&j.right);
    assert!(right[0].contains("WHERE c.name = 'z'"), "{}", right[0]);
}

#[test]
fn test_exchanged_cross_table_comparison() {
    let sql = "SELECT a.id, c.id FROM a JOIN c ON a.id = c.id WHERE c.score >= a.score";
    let j = join(&select_root(planner().build("db", sql).unwrap())).clone();
    let [f] = j.cmp_filters.as_slice() else {
        panic!("expected one filter");
    };
    assert_eq!(f.op, CmpOp::Ge);
    assert!(f.exchange);
}

#[test]
fn test_point_lookup_outer_uses_nested_loop() {
    let sql = "SELECT a.id, c.name FROM a JOIN c ON a.id = c.id WHERE a.id = 7";
    let root = select_root(planner().build("db", sql).unwrap());
    let j = join(&root);
    assert_eq!(j.strategy, JoinStrategy::NestedLoop);
    assert_eq!(queries(&j.left).len(), 1);
    let nl = j.nested_loop.as_ref().unwrap();
    assert_eq!(nl.markers.len(), 1);
    assert_eq!(nl.markers[0].placeholder, "'__radon_nl_0__'");
    assert_eq!(nl.markers[0].left_index, 0);
    assert_eq!(nl.route.as_ref().map(|r| r.marker), Some(0));
    let right = queries(&j.right);
    assert_eq!(right.len(), nl.query_tables.len());
    assert!(right.iter().all(|q| q.contains("c.id = '__radon_nl_0__'")));
}

#[test]
fn test_join_without_keys_is_cartesian() {
    let sql = "SELECT a.id, c.name FROM a, c";
    let j = join(&select_root(planner().build("db", sql).unwrap())).clone();
    assert_eq!(j.strategy, JoinStrategy::Cartesian);
    assert!(j.left_keys.is_empty());
    assert_eq!(j.cols, vec![-1, 1]);
}

#[test]
fn test_three_way_join_is_left_deep() {
    let sql = "SELECT a.id, c.name, g.x FROM a JOIN c ON a.id = c.id JOIN g ON c.k = g.x";
    let root = select_root(planner().build("db", sql).unwrap());
    let top = join(&root);
    let inner = join(&top.left);
    assert_eq!(inner.strategy, JoinStrategy::SortMerge);
    // a.id, c.name, then c.k for the next level's key.
    assert_eq!(inner.cols, vec![-1, 1, 3]);
    assert_eq!(top.left_keys, vec![2]);
    assert_eq!(top.right_keys, vec![0]);
    assert_eq!(top.cols, vec![-1, -2, 1]);
}

#[test]
fn test_join_aggregate_is_not_pushed() {
    let sql = "SELECT a.id, COUNT(c.name) FROM a JOIN c ON a.id = c.id GROUP BY a.id";
    let root = select_root(planner().build("db", sql).unwrap());
    let j = join(&root);
    let right = queries(&j.right);
    assert!(right[0].starts_with("SELECT c.name AS `COUNT(c.name)`"), "{}", right[0]);
    let SubPlan::Aggregate(agg) = &j.children[0] else {
        panic!("expected an aggregate");
    };
    assert_eq!(agg.group_by, vec![0]);
    assert!(!agg.aggregators[0].pushed);
}

#[test]
fn test_join_rejections() {
    let p = planner();
    for sql in [
        "SELECT id FROM a JOIN c ON a.id = c.id",
        "SELECT * FROM a JOIN c ON a.id = c.id",
        "SELECT a.id FROM a JOIN c USING (id)",
        "SELECT a.id, c.id FROM a LEFT JOIN c ON a.id = c.id WHERE c.id IS NULL",
        "SELECT a.id, c.name FROM a LEFT JOIN c ON a.id = c.id WHERE c.name IS NULL OR c.name = 'go'",
        "SELECT a.id, c.id FROM a LEFT JOIN c ON a.id = c.id WHERE COALESCE(c.score, 0) = 0",
    ] {
        let err = p.build("db", sql).unwrap_err();
        assert!(matches!(err, RadonError::Unsupported(_)), "{sql}: {err}");
    }
    let err = p.build("db", "SELECT a.id FROM a JOIN b AS a ON a.id = a.id").unwrap_err();
    assert_eq!(err.mysql_code(), 1066);
}

// ── union ──

#[test]
fn test_union_tree_and_post_plans() {
    let sql = "SELECT id FROM a UNION ALL SELECT id FROM c ORDER BY id LIMIT 3";
    let plan = planner().build("db", sql).unwrap();
    assert_eq!(plan.kind(), "Union");
    let root = select_root(plan);
    let PlanNode::Union(u) = &root else {
        panic!("expected a union node");
    };
    assert!(!u.distinct);
    assert_eq!(queries(&u.left).len(), 4);
    assert!(queries(&u.right)[0].contains("`db`.`c_0000`"));
    assert!(!queries(&u.left)[0].contains("LIMIT"));
    assert!(matches!(u.children.as_slice(), [SubPlan::OrderBy(_), SubPlan::Limit(_)]));

    let root = select_root(planner().build("db", "SELECT id FROM a UNION SELECT id FROM b").unwrap());
    let PlanNode::Union(u) = &root else {
        panic!("expected a union node");
    };
    assert!(u.distinct);
}

// ── writes ──

#[test]
fn test_insert_groups_rows_by_partition() {
    let sql = "INSERT INTO a(id, name) VALUES (1, 'x'), (2, 'y'), (1, 'z')";
    let plan = planner().build("db", sql).unwrap();
    let Plan::Insert(p) = &plan else {
        panic!("expected an insert plan");
    };
    let one = segment_of("a", 1);
    let two = segment_of("a", 2);
    let expect = if one == two { 1 } else { 2 };
    assert_eq!(p.querys.len(), expect);
    let q1 = p.querys.iter().find(|q| q.query.contains(&one)).unwrap();
    assert!(q1.query.starts_with(&format!("INSERT INTO `db`.`{one}`")), "{}", q1.query);
    assert!(q1.query.contains("'x'") && q1.query.contains("'z'"));
    assert_eq!(plan.txn_mode(), radon_common::TxnMode::Write);
}

#[test]
fn test_insert_needs_shard_key_values() {
    let p = planner();
    for sql in [
        "INSERT INTO a(name) VALUES ('x')",
        "INSERT INTO a(id, name) VALUES (NULL, 'x')",
        "INSERT INTO a(id, name) VALUES (1 + 1, 'x')",
        "INSERT INTO a(id) SELECT id FROM b",
    ] {
        assert!(matches!(p.build("db", sql), Err(RadonError::Unsupported(_))), "{sql}");
    }
}

#[test]
fn test_insert_global_reaches_every_copy() {
    let Plan::Insert(p) = planner().build("db", "REPLACE INTO g(x) VALUES (1)").unwrap() else {
        panic!("expected an insert plan");
    };
    let backends: Vec<&str> = p.querys.iter().map(|q| q.backend.as_str()).collect();
    assert_eq!(backends, vec!["b0", "b1"]);
    assert!(p.querys[0].query.starts_with("REPLACE INTO `db`.`g`"));
}

#[test]
fn test_update_routes_and_protects_shard_key() {
    let p = planner();
    let Plan::Update(u) = p.build("db", "UPDATE a SET name = 'n' WHERE id = 1").unwrap() else {
        panic!("expected an update plan");
    };
    assert_eq!(u.querys.len(), 1);
    assert!(u.querys[0].query.contains(&format!("`db`.`{}`", segment_of("a", 1))));

    let Plan::Update(u) = p.build("db", "UPDATE a SET name = 'n'").unwrap() else {
        panic!("expected an update plan");
    };
    assert_eq!(u.querys.len(), 4);

    let err = p.build("db", "UPDATE a SET id = 3 WHERE id = 1").unwrap_err();
    assert!(matches!(err, RadonError::Unsupported(_)));
    let err = p.build("db", "UPDATE a JOIN b ON a.id = b.id SET a.name = b.name").unwrap_err();
    assert!(matches!(err, RadonError::Unsupported(_)));
}

#[test]
fn test_delete_routes_without_alias() {
    let p = planner();
    let Plan::Delete(d) = p.build("db", "DELETE FROM a WHERE id = 1").unwrap() else {
        panic!("expected a delete plan");
    };
    assert_eq!(d.querys.len(), 1);
    let q = &d.querys[0].query;
    assert_eq!(q, &format!("DELETE FROM `db`.`{}` WHERE id = 1", segment_of("a", 1)));

    let Plan::Delete(d) = p.build("db", "DELETE FROM a WHERE a.name = 'x'").unwrap() else {
        panic!("expected a delete plan");
    };
    assert_eq!(d.querys.len(), 4);
    assert!(d.querys[0].query.contains("AS `a`"));
}

#[test]
fn test_write_to_system_db_rejected() {
    let err = planner()
        .build("db", "DELETE FROM information_schema.tables")
        .unwrap_err();
    assert!(matches!(err, RadonError::Unsupported(_)));
    let err = planner().build("db", "DELETE FROM mysql.user").unwrap_err();
    assert!(matches!(err, RadonError::AccessDenied(_)));
}

// ── ddl, others, explain ──

#[test]
fn test_table_ddl_per_partition() {
    let p = planner();
    let Plan::Ddl(d) = p.build_table_ddl("db", "a", "ALTER TABLE a ADD COLUMN c INT").unwrap() else {
        panic!("expected a ddl plan");
    };
    assert_eq!(d.querys.len(), 4);
    assert_eq!(d.querys[3].query, "ALTER TABLE `db`.`a_0003` ADD COLUMN c INT");
    assert_eq!(d.querys[3].backend, "b1");

    let Plan::Ddl(d) = p.build_database_ddl("CREATE DATABASE x") else {
        panic!("expected a ddl plan");
    };
    assert_eq!(d.mode, ReqMode::ScatterRequest);
    assert!(d.querys.is_empty());

    let plan = p.build_others("db", "g", "CHECKSUM TABLE g").unwrap();
    assert_eq!(plan.kind(), "Others");
    assert_eq!(plan.querys().len(), 2);
    assert!(matches!(p.build_table_ddl("db", "nope", "TRUNCATE nope"), Err(RadonError::TableMissing(_))));
}

#[test]
fn test_explain_renders_json() {
    let p = planner();
    let sql = "SELECT AVG(score) FROM a";
    let stmt = parse_one(sql).unwrap();
    let text = p.explain("db", sql, &stmt).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    let merge = &v["Select"]["root"]["Merge"];
    assert_eq!(merge["querys"].as_array().map(|a| a.len()), Some(4));
    assert_eq!(merge["children"][0]["Aggregate"]["aggregators"][0]["kind"], "Avg");
}

// ── errors ──

#[test]
fn test_unsupported_statements() {
    let p = planner();
    for sql in [
        "SELECT id, COUNT(*) FROM a GROUP BY id HAVING COUNT(*) > 1",
        "SELECT x.id FROM (SELECT id FROM a) AS x",
        "SELECT id FROM a WHERE id IN (SELECT id FROM b)",
        "WITH t AS (SELECT id FROM a) SELECT id FROM t",
        "SELECT id FROM a INTERSECT SELECT id FROM b",
        "SELECT k FROM a GROUP BY name",
        "SELECT SUM(score) + 1 FROM a",
        "SHOW TABLES",
    ] {
        assert!(matches!(p.build("db", sql), Err(RadonError::Unsupported(_))), "{sql}");
    }
}

#[test]
fn test_missing_objects_and_parse_errors() {
    let p = planner();
    assert!(matches!(p.build("db", "SELECT * FROM nope"), Err(RadonError::TableMissing(_))));
    assert!(matches!(p.build("other", "SELECT * FROM a"), Err(RadonError::SchemaMissing(_))));
    assert_eq!(p.build("", "SELECT * FROM a").unwrap_err().mysql_code(), 1046);
    assert!(matches!(p.build("db", "SELEC id FROM a"), Err(RadonError::Parse(_))));
    assert!(matches!(p.build("db", "SELECT 1; SELECT 2"), Err(RadonError::Unsupported(_))));
}
