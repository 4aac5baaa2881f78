//! Multi-table SELECT: co-located push-down or a left-deep join tree.
//!
//! Each leaf of the tree selects, from one table, the columns the joins
//! above it need plus its own single-table predicates. Cross-table `=`
//! becomes a join key, other comparisons become `CmpFilter`s, and a LEFT
//! JOIN's left-only ON predicates travel as boolean tmp columns.

use std::collections::BTreeSet;

use radon_common::{QueryTuple, RadonError, RadonResult};
use radon_router::{ShardType, TableConfig};
use sqlparser::ast::{BinaryOperator, Expr, JoinConstraint, JoinOperator, Query, Select};

use crate::expr::{
    aggregate_call, and_all, cmp_op, column_ref, contains_aggregate, number, quoted, rejects_null, select_items,
    split_and, tables_in,
};
use crate::plan::*;
use crate::route::{route, shard_values, table_ref, TableRef};
use crate::select::{limit_plan, order_plan, shape_of, Target};
use crate::Planner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinKind {
    Inner,
    Left,
}

/// One table of a FROM clause with the way it joins to everything before it.
#[derive(Debug, Clone)]
pub(crate) struct FromItem {
    pub tref: TableRef,
    pub kind: JoinKind,
    pub on: Vec<Expr>,
}

pub(crate) fn flatten_from(sel: &Select, db: &str) -> RadonResult<Vec<FromItem>> {
    let mut out: Vec<FromItem> = Vec::new();
    for twj in &sel.from {
        out.push(FromItem {
            tref: table_ref(&twj.relation, db)?,
            kind: JoinKind::Inner,
            on: Vec::new(),
        });
        for j in &twj.joins {
            let (kind, constraint) = match &j.join_operator {
                JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
                JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
                JoinOperator::CrossJoin => (JoinKind::Inner, None),
                other => return Err(RadonError::Unsupported(format!("unsupported: join type {other:?}"))),
            };
            let on = match constraint {
                Some(JoinConstraint::On(e)) => split_and(e),
                Some(JoinConstraint::None) | None => Vec::new(),
                Some(_) => return Err(RadonError::Unsupported("unsupported: join using or natural join".into())),
            };
            out.push(FromItem {
                tref: table_ref(&j.relation, db)?,
                kind,
                on,
            });
        }
    }
    let mut seen = BTreeSet::new();
    for f in &out {
        if !seen.insert(f.tref.alias.to_ascii_lowercase()) {
            return Err(RadonError::backend(
                1066,
                "42000",
                format!("Not unique table/alias: '{}'", f.tref.alias),
            ));
        }
    }
    Ok(out)
}

/// A column a leaf must select: `sql` evaluated on table `table`, returned
/// under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Col {
    table: usize,
    sql: String,
    name: String,
}

#[derive(Debug, Default)]
struct Level {
    keys: Vec<(Col, Col)>,
    filters: Vec<(Col, Col, CmpOp, bool)>,
    left_tmp: Vec<Col>,
    has_right_filter: bool,
}

impl Level {
    fn left_cols(&self) -> impl Iterator<Item = &Col> {
        self.keys
            .iter()
            .map(|(l, _)| l)
            .chain(self.filters.iter().map(|(l, ..)| l))
            .chain(self.left_tmp.iter())
    }

    fn right_cols(&self) -> impl Iterator<Item = &Col> {
        self.keys.iter().map(|(_, r)| r).chain(self.filters.iter().map(|(_, r, ..)| r))
    }
}

fn push_unique(v: &mut Vec<Col>, c: &Col) {
    if !v.iter().any(|x| x.table == c.table && x.sql == c.sql) {
        v.push(c.clone());
    }
}

/// Position of `c` in `cols`, preferring an exact match of the output name.
fn pos(cols: &[Col], c: &Col) -> RadonResult<usize> {
    cols.iter()
        .position(|x| x == c)
        .or_else(|| cols.iter().position(|x| x.table == c.table && x.sql == c.sql))
        .ok_or_else(|| RadonError::Internal(format!("join column {} lost between levels", c.sql)))
}

struct JoinBuilder<'a> {
    from: &'a [FromItem],
    aliases: Vec<String>,
    leaves: Vec<Vec<Expr>>,
    levels: Vec<Level>,
    tmp_seq: usize,
}

impl<'a> JoinBuilder<'a> {
    fn new(from: &'a [FromItem]) -> Self {
        Self {
            from,
            aliases: from.iter().map(|f| f.tref.alias.clone()).collect(),
            leaves: vec![Vec::new(); from.len()],
            levels: (0..from.len()).map(|_| Level::default()).collect(),
            tmp_seq: 0,
        }
    }

    /// Sorted positions of the tables `e` reads.
    fn tables(&self, e: &Expr) -> RadonResult<Vec<usize>> {
        let names = tables_in(e, &self.aliases, None)?;
        let set: BTreeSet<usize> = names
            .iter()
            .filter_map(|n| self.aliases.iter().position(|a| a == n))
            .collect();
        Ok(set.into_iter().collect())
    }

    fn tmp_name(&mut self) -> String {
        self.tmp_seq += 1;
        format!("tmpc_{}", self.tmp_seq)
    }

    fn col(&mut self, table: usize, e: &Expr) -> Col {
        let name = match column_ref(e) {
            Some(c) => c.name,
            None => self.tmp_name(),
        };
        Col {
            table,
            sql: e.to_string(),
            name,
        }
    }

    fn classify_where(&mut self, c: &Expr) -> RadonResult<()> {
        let ts = self.tables(c)?;
        match ts.as_slice() {
            [] => self.leaves[0].push(c.clone()),
            [t] => {
                let t = *t;
                if self.from[t].kind == JoinKind::Left {
                    if !rejects_null(c) {
                        return Err(RadonError::Unsupported(format!(
                            "unsupported: '{c}' on the right table of a left join"
                        )));
                    }
                    self.levels[t].has_right_filter = true;
                }
                self.leaves[t].push(c.clone());
            }
            [a, b] => self.cross(c, *a, *b, true)?,
            _ => {
                return Err(RadonError::Unsupported(format!(
                    "unsupported: clause '{c}' references more than two tables"
                )))
            }
        }
        Ok(())
    }

    fn classify_on(&mut self, k: usize, c: &Expr) -> RadonResult<()> {
        let ts = self.tables(c)?;
        if ts.iter().any(|t| *t > k) {
            return Err(RadonError::Unsupported(format!(
                "unsupported: on clause '{c}' references a later table"
            )));
        }
        let kind = self.from[k].kind;
        match (ts.as_slice(), kind) {
            ([], _) => self.leaves[k].push(c.clone()),
            ([t], _) if *t == k => self.leaves[k].push(c.clone()),
            ([t], JoinKind::Left) => {
                let name = self.tmp_name();
                self.levels[k].left_tmp.push(Col {
                    table: *t,
                    sql: format!("({c})"),
                    name,
                });
            }
            ([a, b], _) if *b == k => self.cross(c, *a, k, false)?,
            (_, JoinKind::Inner) => self.classify_where(c)?,
            _ => {
                return Err(RadonError::Unsupported(format!(
                    "unsupported: on clause '{c}' of a left join"
                )))
            }
        }
        Ok(())
    }

    /// A comparison between table `a` and table `b` (`a < b`), owned by level `b`.
    fn cross(&mut self, c: &Expr, a: usize, b: usize, in_where: bool) -> RadonResult<()> {
        let unsupported = || RadonError::Unsupported(format!("unsupported: clause '{c}' across tables"));
        let Expr::BinaryOp { left, op, right } = c else {
            return Err(unsupported());
        };
        let op = cmp_op(op).ok_or_else(unsupported)?;
        let (lt, rt) = (self.tables(left)?, self.tables(right)?);
        let (lexpr, rexpr, exchange) = if lt == [a] && rt == [b] {
            (left, right, false)
        } else if lt == [b] && rt == [a] {
            (right, left, true)
        } else {
            return Err(unsupported());
        };
        let lcol = self.col(a, lexpr);
        let rcol = self.col(b, rexpr);
        let null_rejecting = in_where && self.from[b].kind == JoinKind::Left;
        let level = &mut self.levels[b];
        if op == CmpOp::Eq && !null_rejecting {
            level.keys.push((lcol, rcol));
        } else {
            level.filters.push((lcol, rcol, op, exchange));
            level.has_right_filter |= null_rejecting;
        }
        Ok(())
    }
}

fn leaf_sql(item: &FromItem, physical: &str, cols: &[Col], conds: &[Expr], extra: &[String]) -> String {
    let list = cols
        .iter()
        .map(|c| format!("{} AS {}", c.sql, quoted(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {list} FROM {}.{} AS {}",
        quoted(&item.tref.db),
        quoted(physical),
        quoted(&item.tref.alias)
    );
    let mut preds: Vec<String> = and_all(conds).map(|e| e.to_string()).into_iter().collect();
    preds.extend(extra.iter().cloned());
    if !preds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&preds.join(" AND "));
    }
    sql
}

impl Planner {
    /// Targets for a join every part of which can run inside one backend.
    pub(crate) fn colocated(&self, from: &[FromItem], cfgs: &[TableConfig], where_conds: &[Expr]) -> Option<Vec<Target>> {
        let logical = |i: usize| cfgs[i].name.clone();
        let parted: Vec<usize> = (0..cfgs.len())
            .filter(|&i| cfgs[i].shard_type != ShardType::Global)
            .collect();

        if parted.is_empty() {
            let seg = cfgs[0].segments().into_iter().next()?;
            return Some(vec![Target {
                backend: seg.backend,
                range: String::new(),
                tables: (0..cfgs.len()).map(logical).collect(),
            }]);
        }
        if parted.iter().all(|&i| cfgs[i].shard_type == ShardType::Single) {
            let backends: Vec<&str> = parted
                .iter()
                .filter_map(|&i| cfgs[i].partitions.first().map(|p| p.backend.as_str()))
                .collect();
            let same = backends.len() == parted.len() && backends.windows(2).all(|w| w[0] == w[1]);
            return same.then(|| {
                vec![Target {
                    backend: backends[0].to_string(),
                    range: String::new(),
                    tables: (0..cfgs.len()).map(logical).collect(),
                }]
            });
        }

        let first = parted[0];
        if !cfgs[first].is_partitioned() || parted.iter().any(|&i| !cfgs[i].same_layout(&cfgs[first])) {
            return None;
        }
        let key_owner = |e: &Expr| -> Option<usize> {
            let c = column_ref(e)?;
            let q = c.qualifier?;
            let i = from.iter().position(|f| f.tref.alias.eq_ignore_ascii_case(&q))?;
            (parted.contains(&i) && c.name.eq_ignore_ascii_case(&cfgs[i].shard_key)).then_some(i)
        };
        let conds: Vec<&Expr> = where_conds.iter().chain(from.iter().flat_map(|f| f.on.iter())).collect();
        let mut linked = vec![first];
        loop {
            let before = linked.len();
            for c in &conds {
                if let Expr::BinaryOp {
                    left,
                    op: BinaryOperator::Eq,
                    right,
                } = c
                {
                    if let (Some(a), Some(b)) = (key_owner(left), key_owner(right)) {
                        match (linked.contains(&a), linked.contains(&b)) {
                            (true, false) => linked.push(b),
                            (false, true) => linked.push(a),
                            _ => {}
                        }
                    }
                }
            }
            if linked.len() == before {
                break;
            }
        }
        if linked.len() != parted.len() {
            return None;
        }

        let parts = &cfgs[first].partitions;
        let mut keep: Vec<usize> = (0..parts.len()).collect();
        for &i in &parted {
            let mut pins = where_conds.to_vec();
            if from[i].kind == JoinKind::Inner {
                pins.extend(from[i].on.iter().cloned());
            }
            if let Some(values) = shard_values(&pins, &from[i].tref.alias, &cfgs[i].shard_key, false) {
                let hit: Vec<String> = values
                    .iter()
                    .flat_map(|v| cfgs[i].segments_for(Some(v)))
                    .map(|s| s.table)
                    .collect();
                keep.retain(|&p| hit.contains(&cfgs[i].partitions[p].table));
            }
        }
        if keep.is_empty() {
            keep.push(0);
        }
        Some(
            keep.into_iter()
                .map(|p| Target {
                    backend: parts[p].backend.clone(),
                    range: parts[p].segment().range,
                    tables: (0..cfgs.len())
                        .map(|i| {
                            if parted.contains(&i) {
                                cfgs[i].partitions[p].table.clone()
                            } else {
                                logical(i)
                            }
                        })
                        .collect(),
                })
                .collect(),
        )
    }

    pub(crate) fn plan_join(
        &self,
        sel: &Select,
        query: &Query,
        from: &[FromItem],
        cfgs: &[TableConfig],
        where_conds: &[Expr],
    ) -> RadonResult<PlanNode> {
        let n = from.len();
        let mut b = JoinBuilder::new(from);
        for c in where_conds {
            b.classify_where(c)?;
        }
        for (k, f) in from.iter().enumerate().skip(1) {
            for c in &f.on {
                b.classify_on(k, c)?;
            }
        }

        let items = select_items(&sel.projection)
            .ok_or_else(|| RadonError::Unsupported("unsupported: '*' expression in cross-shard query".into()))?;
        let mut outputs = Vec::with_capacity(items.len());
        for it in &items {
            let expr = match aggregate_call(&it.expr)? {
                Some(call) => call.arg.unwrap_or_else(|| number(1)),
                None if contains_aggregate(&it.expr) => {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: expression with aggregate {}",
                        it.expr
                    )))
                }
                None => it.expr.clone(),
            };
            let table = match b.tables(&expr)?.as_slice() {
                [] => 0,
                [t] => *t,
                _ => {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: select expression '{}' across tables",
                        it.expr
                    )))
                }
            };
            outputs.push(Col {
                table,
                sql: expr.to_string(),
                name: it.name.clone(),
            });
        }

        let mut leaf_cols: Vec<Vec<Col>> = vec![Vec::new(); n];
        for c in &outputs {
            if !leaf_cols[c.table].contains(c) {
                leaf_cols[c.table].push(c.clone());
            }
        }
        for lvl in &b.levels {
            for c in lvl.left_cols().chain(lvl.right_cols()) {
                push_unique(&mut leaf_cols[c.table], c);
            }
        }
        for (t, cols) in leaf_cols.iter_mut().enumerate() {
            if cols.is_empty() {
                cols.push(Col {
                    table: t,
                    sql: "1".into(),
                    name: "tmpc_0".into(),
                });
            }
        }

        // Leaves.
        let mut leaf_nodes = Vec::with_capacity(n);
        let mut point_lookup = vec![false; n];
        for t in 0..n {
            let f = &from[t];
            let values = shard_values(&b.leaves[t], &f.tref.alias, &cfgs[t].shard_key, false);
            let segs = route(&cfgs[t], values.as_deref(), false);
            point_lookup[t] = cfgs[t].is_partitioned() && values.is_some() && segs.len() == 1;
            leaf_nodes.push(segs);
        }

        let mut leaves = leaf_nodes.into_iter().enumerate();
        let (_, first_segs) = leaves
            .next()
            .ok_or_else(|| RadonError::Internal("join without tables".into()))?;
        let mut node = PlanNode::Merge(MergeNode::new(
            first_segs
                .iter()
                .map(|s| QueryTuple {
                    query: leaf_sql(&from[0], &s.table, &leaf_cols[0], &b.leaves[0], &[]),
                    backend: s.backend.clone(),
                    range: s.range.clone(),
                })
                .collect(),
        ));
        let mut out = leaf_cols[0].clone();

        for (k, segs) in leaves {
            let lvl = &b.levels[k];
            let right_cols = &leaf_cols[k];
            let strategy = if lvl.keys.is_empty() {
                JoinStrategy::Cartesian
            } else if k == 1 && point_lookup[0] {
                JoinStrategy::NestedLoop
            } else {
                JoinStrategy::SortMerge
            };

            let mut nested_loop = None;
            let right = if strategy == JoinStrategy::NestedLoop {
                let mut markers = Vec::with_capacity(lvl.keys.len());
                let mut extra = Vec::with_capacity(lvl.keys.len());
                let mut nl_route = None;
                for (i, (l, r)) in lvl.keys.iter().enumerate() {
                    let placeholder = format!("'__radon_nl_{i}__'");
                    extra.push(format!("{} = {placeholder}", r.sql));
                    markers.push(NlMarker {
                        placeholder,
                        left_index: pos(&out, l)?,
                    });
                    let binds_key = cfgs[k].is_partitioned()
                        && r.sql.rsplit('.').next().map_or(false, |s| {
                            s.trim_matches('`').eq_ignore_ascii_case(&cfgs[k].shard_key)
                        });
                    if nl_route.is_none() && binds_key {
                        nl_route = Some(NlRoute {
                            marker: i,
                            table: cfgs[k].clone(),
                        });
                    }
                }
                nested_loop = Some(NestedLoopSpec {
                    markers,
                    route: nl_route,
                    query_tables: segs.iter().map(|s| s.table.clone()).collect(),
                });
                segs.iter()
                    .map(|s| QueryTuple {
                        query: leaf_sql(&from[k], &s.table, right_cols, &b.leaves[k], &extra),
                        backend: s.backend.clone(),
                        range: s.range.clone(),
                    })
                    .collect()
            } else {
                segs.iter()
                    .map(|s| QueryTuple {
                        query: leaf_sql(&from[k], &s.table, right_cols, &b.leaves[k], &[]),
                        backend: s.backend.clone(),
                        range: s.range.clone(),
                    })
                    .collect()
            };

            let next: Vec<Col> = if k == n - 1 {
                outputs.clone()
            } else {
                let mut v: Vec<Col> = Vec::new();
                for c in outputs.iter().filter(|c| c.table <= k) {
                    if !v.contains(c) {
                        v.push(c.clone());
                    }
                }
                for later in &b.levels[k + 1..] {
                    for c in later.left_cols().filter(|c| c.table <= k) {
                        push_unique(&mut v, c);
                    }
                }
                v
            };
            let cols = next
                .iter()
                .map(|c| {
                    if c.table == k {
                        pos(right_cols, c).map(|i| i as isize + 1)
                    } else {
                        pos(&out, c).map(|i| -(i as isize) - 1)
                    }
                })
                .collect::<RadonResult<Vec<_>>>()?;
            let left_keys = lvl.keys.iter().map(|(l, _)| pos(&out, l)).collect::<RadonResult<Vec<_>>>()?;
            let right_keys = lvl
                .keys
                .iter()
                .map(|(_, r)| pos(right_cols, r))
                .collect::<RadonResult<Vec<_>>>()?;
            let cmp_filters = lvl
                .filters
                .iter()
                .map(|(l, r, op, exchange)| {
                    Ok(CmpFilter {
                        left: pos(&out, l)?,
                        right: pos(right_cols, r)?,
                        op: *op,
                        exchange: *exchange,
                    })
                })
                .collect::<RadonResult<Vec<_>>>()?;
            let left_tmp_cols = lvl.left_tmp.iter().map(|c| pos(&out, c)).collect::<RadonResult<Vec<_>>>()?;

            node = PlanNode::Join(Box::new(JoinNode {
                left: node,
                right: PlanNode::Merge(MergeNode::new(right)),
                left_keys,
                right_keys,
                cols,
                left_tmp_cols,
                right_tmp_cols: Vec::new(),
                cmp_filters,
                is_left_join: from[k].kind == JoinKind::Left,
                has_right_filter: lvl.has_right_filter,
                strategy,
                row_num_limit: self.row_num_limit,
                nested_loop,
                children: Vec::new(),
            }));
            out = next;
        }

        let shape = shape_of(sel)?;
        let children = node.children_mut();
        if shape.needs_aggregate() {
            children.push(SubPlan::Aggregate(AggregatePlan {
                group_by: shape.group_by.clone(),
                aggregators: shape
                    .aggs
                    .iter()
                    .map(|(i, call)| Aggregator {
                        index: *i,
                        kind: call.kind,
                        distinct: call.distinct,
                        pushed: false,
                        count_index: None,
                    })
                    .collect(),
                hidden: Vec::new(),
            }));
        }
        if let Some(order) = order_plan(Some(items.as_slice()), query)? {
            children.push(SubPlan::OrderBy(order));
        }
        if let Some(limit) = limit_plan(query)? {
            children.push(SubPlan::Limit(limit));
        }
        tracing::debug!(tables = n, "planner: cross-shard join");
        Ok(node)
    }
}
