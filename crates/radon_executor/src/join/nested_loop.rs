//! Nested-loop join: the inner side is re-queried once per distinct outer key.
//!
//! The inner fragments carry placeholder literals where the outer row's key
//! values go. When a placeholder binds the inner table's shard key, only the
//! fragments owning that value are sent.

use std::collections::HashMap;

use radon_common::{Field, QueryResult, QueryTuple, RadonError, RadonResult, RequestContext, ReqMode, Row, TxnMode};
use radon_planner::{JoinNode, MergeNode, NestedLoopSpec, PlanNode};

use super::filter::{cell, left_joinable};
use super::{emit_left, emit_unmatched, Output};
use crate::{engine, operator, ExecContext};

fn bind(sql: &str, spec: &NestedLoopSpec, literals: &[String]) -> String {
    let mut out = sql.to_string();
    for (m, lit) in spec.markers.iter().zip(literals) {
        out = out.replace(&m.placeholder, lit);
    }
    out
}

fn fragments(inner: &MergeNode, spec: &NestedLoopSpec, outer: &Row, literals: &[String]) -> Vec<QueryTuple> {
    let owners: Option<Vec<String>> = spec.route.as_ref().and_then(|r| {
        let m = spec.markers.get(r.marker)?;
        let v = cell(outer, m.left_index);
        Some(r.table.segments_for(Some(v)).into_iter().map(|s| s.table).collect())
    });
    inner
        .querys
        .iter()
        .enumerate()
        .filter(|(i, _)| match (&owners, spec.query_tables.get(*i)) {
            (Some(owners), Some(table)) => owners.contains(table),
            _ => true,
        })
        .map(|(_, q)| QueryTuple {
            query: bind(&q.query, spec, literals),
            backend: q.backend.clone(),
            range: q.range.clone(),
        })
        .collect()
}

fn run(ctx: &ExecContext, inner: &MergeNode, querys: Vec<QueryTuple>) -> RadonResult<QueryResult> {
    let req = RequestContext {
        mode: ReqMode::Normal,
        txn_mode: TxnMode::Read,
        querys,
        raw_query: inner.raw_query.clone(),
    };
    let result = ctx.txn.execute(&req)?;
    operator::apply(result, &inner.children)
}

/// Run the join and return the field lists of both sides.
pub(crate) fn execute(ctx: &ExecContext, node: &JoinNode, out: &mut Output) -> RadonResult<(Vec<Field>, Vec<Field>)> {
    let (PlanNode::Merge(inner), Some(spec)) = (&node.right, node.nested_loop.as_ref()) else {
        return Err(RadonError::Internal("nested loop join without a parameterised inner side".into()));
    };
    let outer = engine::execute(ctx, &node.left)?;

    let mut inner_fields: Option<Vec<Field>> = None;
    let mut cache: HashMap<Vec<String>, Vec<Row>> = HashMap::new();
    let mut rounds = 0usize;
    for l in &outer.rows {
        let values: Vec<_> = spec.markers.iter().map(|m| cell(l, m.left_index)).collect();
        if !left_joinable(node, l) || values.iter().any(|v| v.is_null()) {
            let mut rows = Vec::new();
            emit_unmatched(node, l, &mut rows);
            out.extend(rows)?;
            continue;
        }
        let literals: Vec<String> = values.iter().map(|v| v.to_sql_literal()).collect();
        if !cache.contains_key(&literals) {
            let querys = fragments(inner, spec, l, &literals);
            let result = if querys.is_empty() {
                QueryResult::default()
            } else {
                rounds += 1;
                run(ctx, inner, querys)?
            };
            if inner_fields.is_none() && !result.fields.is_empty() {
                inner_fields = Some(result.fields);
            }
            cache.insert(literals.clone(), result.rows);
        }
        let candidates = cache.get(&literals).map(Vec::as_slice).unwrap_or_default();
        let mut rows = Vec::new();
        emit_left(node, l, candidates, &mut rows);
        out.extend(rows)?;
    }

    let inner_fields = match inner_fields {
        Some(f) => f,
        None => {
            // Nothing was fetched: one NULL-bound round for the column metadata.
            let nulls = vec!["NULL".to_string(); spec.markers.len()];
            let querys: Vec<QueryTuple> = inner
                .querys
                .iter()
                .take(1)
                .map(|q| QueryTuple {
                    query: bind(&q.query, spec, &nulls),
                    backend: q.backend.clone(),
                    range: q.range.clone(),
                })
                .collect();
            if querys.is_empty() {
                Vec::new()
            } else {
                rounds += 1;
                run(ctx, inner, querys)?.fields
            }
        }
    };
    tracing::debug!(
        txn_id = ctx.txn.id(),
        outer_rows = outer.rows.len(),
        rounds,
        "executor: nested loop"
    );
    Ok((outer.fields, inner_fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_planner::NlMarker;

    #[test]
    fn test_bind_replaces_every_marker() {
        let spec = NestedLoopSpec {
            markers: vec![
                NlMarker {
                    placeholder: "'__radon_nl_0__'".into(),
                    left_index: 0,
                },
                NlMarker {
                    placeholder: "'__radon_nl_1__'".into(),
                    left_index: 1,
                },
            ],
            route: None,
            query_tables: vec![],
        };
        let sql = "SELECT b.id AS `id` FROM `db`.`b_0000` AS `b` WHERE b.id = '__radon_nl_0__' AND b.k = '__radon_nl_1__'";
        assert_eq!(
            bind(sql, &spec, &["7".into(), "'x'".into()]),
            "SELECT b.id AS `id` FROM `db`.`b_0000` AS `b` WHERE b.id = 7 AND b.k = 'x'"
        );
    }
}
