//! SELECT and UNION planning.
//!
//! A query whose tables all land on one target is pushed down whole. When
//! several targets hold the same statement shape, each receives a rewritten
//! copy and the coordinator finishes the job through sub-plans, always in
//! the order Aggregate, OrderBy, Limit:
//!
//! - `COUNT/SUM/MIN/MAX` are pushed and re-aggregated; `AVG` is pushed as
//!   `SUM` in place plus a hidden `COUNT` column.
//! - With any `DISTINCT` aggregate nothing is pushed: shards return raw
//!   argument values and the coordinator aggregates them.
//! - `SELECT DISTINCT` is a group-by over every column.
//! - `LIMIT o, c` is pushed as `LIMIT o + c` when no aggregation follows.

use radon_common::result::Direction;
use radon_common::{QueryTuple, RadonError, RadonResult};
use sqlparser::ast::{Distinct, GroupByExpr, Query, Select, SelectItem, SetExpr, SetOperator, SetQuantifier};

use crate::expr::{
    aggregate_call, column_ref, contains_aggregate, has_subquery, limit_value, number, parse_expr, quoted,
    resolve_item, select_items, split_and, AggCall, Item,
};
use crate::join::{flatten_from, FromItem};
use crate::plan::*;
use crate::route::{rename_factor, route, shard_values};
use crate::Planner;

/// One place a pushed-down statement runs: a backend plus the physical name
/// of every FROM table, in FROM order.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub backend: String,
    pub range: String,
    pub tables: Vec<String>,
}

/// Aggregation shape of a select list.
pub(crate) struct Shape {
    pub items: Option<Vec<Item>>,
    pub group_by: Vec<usize>,
    pub aggs: Vec<(usize, AggCall)>,
    pub distinct: bool,
}

impl Shape {
    pub fn needs_aggregate(&self) -> bool {
        !self.aggs.is_empty() || !self.group_by.is_empty() || self.distinct
    }
}

pub(crate) fn shape_of(sel: &Select) -> RadonResult<Shape> {
    if sel.having.is_some() {
        return Err(RadonError::Unsupported("unsupported: having clause on multiple shards".into()));
    }
    let items = select_items(&sel.projection);
    let group_exprs = match &sel.group_by {
        GroupByExpr::Expressions(v, mods) if mods.is_empty() => v.clone(),
        other => return Err(RadonError::Unsupported(format!("unsupported: {other}"))),
    };
    let distinct = match &sel.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => return Err(RadonError::Unsupported("unsupported: distinct on".into())),
    };

    let mut aggs = Vec::new();
    if let Some(items) = &items {
        for (i, it) in items.iter().enumerate() {
            match aggregate_call(&it.expr)? {
                Some(call) => {
                    if call.arg.as_ref().map_or(false, contains_aggregate) {
                        return Err(RadonError::Unsupported(format!("unsupported: nested aggregate {}", it.expr)));
                    }
                    aggs.push((i, call));
                }
                None if contains_aggregate(&it.expr) => {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: expression with aggregate {}",
                        it.expr
                    )));
                }
                None => {}
            }
        }
    }

    let Some(list) = &items else {
        if distinct || !group_exprs.is_empty() {
            return Err(RadonError::Unsupported(
                "unsupported: '*' with group by or distinct on multiple shards".into(),
            ));
        }
        return Ok(Shape {
            items,
            group_by: Vec::new(),
            aggs,
            distinct,
        });
    };

    let mut group_by = Vec::new();
    for g in &group_exprs {
        let i = resolve_item(list, g).ok_or_else(|| {
            RadonError::Unsupported(format!("unsupported: group by field[{g}] should be in select list"))
        })?;
        if !group_by.contains(&i) {
            group_by.push(i);
        }
    }
    if distinct {
        for i in 0..list.len() {
            if !aggs.iter().any(|(j, _)| *j == i) && !group_by.contains(&i) {
                group_by.push(i);
            }
        }
    }
    Ok(Shape {
        items,
        group_by,
        aggs,
        distinct,
    })
}

pub(crate) fn order_plan(items: Option<&[Item]>, query: &Query) -> RadonResult<Option<OrderByPlan>> {
    let Some(ob) = &query.order_by else {
        return Ok(None);
    };
    let mut keys = Vec::with_capacity(ob.exprs.len());
    for o in &ob.exprs {
        let direction = if o.asc == Some(false) {
            Direction::Desc
        } else {
            Direction::Asc
        };
        let (table, field) = match items {
            Some(items) => {
                let i = resolve_item(items, &o.expr).ok_or_else(|| {
                    RadonError::Unsupported(format!("unsupported: orderby[{}].should.in.select.list", o.expr))
                })?;
                let it = &items[i];
                let ambiguous = items.iter().filter(|x| x.name.eq_ignore_ascii_case(&it.name)).count() > 1;
                let table = if ambiguous {
                    it.qualifier().unwrap_or_default()
                } else {
                    String::new()
                };
                (table, it.name.clone())
            }
            None => match column_ref(&o.expr) {
                Some(c) => (c.qualifier.unwrap_or_default(), c.name),
                None => (String::new(), o.expr.to_string()),
            },
        };
        keys.push(OrderKey { table, field, direction });
    }
    Ok(Some(OrderByPlan { keys }))
}

pub(crate) fn limit_plan(query: &Query) -> RadonResult<Option<LimitPlan>> {
    let offset = match &query.offset {
        Some(o) => limit_value(&o.value)?,
        None => 0,
    };
    match &query.limit {
        Some(l) => Ok(Some(LimitPlan {
            offset,
            count: limit_value(l)?,
        })),
        None if offset > 0 => Ok(Some(LimitPlan {
            offset,
            count: usize::MAX,
        })),
        None => Ok(None),
    }
}

/// The statement each shard runs plus the coordinator's sub-plans.
pub(crate) fn decompose(query: &Query, sel: &Select) -> RadonResult<(Query, Vec<SubPlan>)> {
    let shape = shape_of(sel)?;
    let needs_aggregate = shape.needs_aggregate();
    let mut pushed = query.clone();
    let mut children = Vec::new();

    if needs_aggregate {
        let items = shape
            .items
            .as_ref()
            .ok_or_else(|| RadonError::Internal("aggregate over a wildcard select list".into()))?;
        let SetExpr::Select(psel) = pushed.body.as_mut() else {
            return Err(RadonError::Internal("decompose on a non-select body".into()));
        };
        let push = shape.aggs.iter().all(|(_, c)| !c.distinct);
        let mut aggregators = Vec::with_capacity(shape.aggs.len());
        let mut hidden = Vec::new();
        for (i, call) in &shape.aggs {
            let name = &items[*i].name;
            if push {
                let mut agg = Aggregator {
                    index: *i,
                    kind: call.kind,
                    distinct: false,
                    pushed: true,
                    count_index: None,
                };
                if call.kind == AggKind::Avg {
                    let arg = call
                        .arg
                        .as_ref()
                        .ok_or_else(|| RadonError::Parse("avg(*) is not valid".into()))?;
                    psel.projection[*i] = SelectItem::ExprWithAlias {
                        expr: parse_expr(&format!("SUM({arg})"))?,
                        alias: quoted(name),
                    };
                    let ci = psel.projection.len();
                    psel.projection
                        .push(SelectItem::UnnamedExpr(parse_expr(&format!("COUNT({arg})"))?));
                    hidden.push(ci);
                    agg.count_index = Some(ci);
                }
                aggregators.push(agg);
            } else {
                let raw = call.arg.clone().unwrap_or_else(|| number(1));
                psel.projection[*i] = SelectItem::ExprWithAlias {
                    expr: raw,
                    alias: quoted(name),
                };
                aggregators.push(Aggregator {
                    index: *i,
                    kind: call.kind,
                    distinct: call.distinct,
                    pushed: false,
                    count_index: None,
                });
            }
        }
        if !push {
            psel.group_by = GroupByExpr::Expressions(Vec::new(), Vec::new());
            psel.distinct = None;
        }
        children.push(SubPlan::Aggregate(AggregatePlan {
            group_by: shape.group_by.clone(),
            aggregators,
            hidden,
        }));
        pushed.order_by = None;
        pushed.limit = None;
        pushed.offset = None;
    }

    if let Some(order) = order_plan(shape.items.as_deref(), query)? {
        children.push(SubPlan::OrderBy(order));
    }
    if let Some(limit) = limit_plan(query)? {
        if !needs_aggregate {
            pushed.limit = Some(number(limit.offset.saturating_add(limit.count)));
            pushed.offset = None;
        }
        children.push(SubPlan::Limit(limit));
    }
    Ok((pushed, children))
}

/// Rewrite every FROM table of `query` to the physical names of `target`.
fn physical_sql(query: &Query, from: &[FromItem], target: &Target) -> String {
    let mut q = query.clone();
    if let SetExpr::Select(sel) = q.body.as_mut() {
        let mut i = 0;
        for twj in &mut sel.from {
            if let (Some(item), Some(phys)) = (from.get(i), target.tables.get(i)) {
                rename_factor(&mut twj.relation, &item.tref.db, phys, Some(&item.tref.alias));
            }
            i += 1;
            for j in &mut twj.joins {
                if let (Some(item), Some(phys)) = (from.get(i), target.tables.get(i)) {
                    rename_factor(&mut j.relation, &item.tref.db, phys, Some(&item.tref.alias));
                }
                i += 1;
            }
        }
    }
    q.to_string()
}

fn tuple(query: String, t: &Target) -> QueryTuple {
    QueryTuple {
        query,
        backend: t.backend.clone(),
        range: t.range.clone(),
    }
}

/// A side of a set operation as a standalone query.
fn side_query(outer: &Query, body: &SetExpr) -> Query {
    let mut q = outer.clone();
    q.with = None;
    q.body = Box::new(body.clone());
    q.order_by = None;
    q.limit = None;
    q.offset = None;
    q
}

fn outer_post(query: &Query) -> RadonResult<Vec<SubPlan>> {
    let mut children = Vec::new();
    if let Some(order) = order_plan(None, query)? {
        children.push(SubPlan::OrderBy(order));
    }
    if let Some(limit) = limit_plan(query)? {
        children.push(SubPlan::Limit(limit));
    }
    Ok(children)
}

impl Planner {
    pub(crate) fn plan_query(&self, db: &str, query: &Query) -> RadonResult<PlanNode> {
        if query.with.is_some() {
            return Err(RadonError::Unsupported("unsupported: with clause".into()));
        }
        match query.body.as_ref() {
            SetExpr::Select(sel) => self.plan_select(db, query, sel),
            SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => self.plan_union(db, query, *op, *set_quantifier, left, right),
            SetExpr::Query(inner) => {
                let mut node = self.plan_query(db, inner)?;
                node.children_mut().extend(outer_post(query)?);
                Ok(node)
            }
            other => Err(RadonError::Unsupported(format!("unsupported: query body {other}"))),
        }
    }

    fn plan_union(
        &self,
        db: &str,
        query: &Query,
        op: SetOperator,
        quantifier: SetQuantifier,
        left: &SetExpr,
        right: &SetExpr,
    ) -> RadonResult<PlanNode> {
        if op != SetOperator::Union {
            return Err(RadonError::Unsupported(format!("unsupported: {op}")));
        }
        let distinct = match quantifier {
            SetQuantifier::All => false,
            SetQuantifier::Distinct | SetQuantifier::None => true,
            other => return Err(RadonError::Unsupported(format!("unsupported: union {other}"))),
        };
        let left = self.plan_query(db, &side_query(query, left))?;
        let right = self.plan_query(db, &side_query(query, right))?;
        Ok(PlanNode::Union(Box::new(UnionNode {
            left,
            right,
            distinct,
            children: outer_post(query)?,
        })))
    }

    fn plan_select(&self, db: &str, query: &Query, sel: &Select) -> RadonResult<PlanNode> {
        if sel.from.is_empty() {
            return Ok(PlanNode::Merge(MergeNode::single(query.to_string())));
        }
        if sel.into.is_some() {
            return Err(RadonError::Unsupported("unsupported: select into".into()));
        }
        let from = flatten_from(sel, db)?;
        if from.iter().any(|f| self.router.is_system_db(&f.tref.db)) {
            return Ok(PlanNode::Merge(MergeNode::single(query.to_string())));
        }
        for f in &from {
            self.router.database_acl(&f.tref.db)?;
        }
        let cfgs = from
            .iter()
            .map(|f| self.router.table_config(&f.tref.db, &f.tref.table))
            .collect::<RadonResult<Vec<_>>>()?;

        let where_conds = sel.selection.as_ref().map(split_and).unwrap_or_default();
        let projected = sel.projection.iter().filter_map(|p| match p {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Some(e),
            _ => None,
        });
        if where_conds.iter().chain(projected).any(has_subquery) {
            return Err(RadonError::Unsupported("unsupported: subqueries".into()));
        }

        let targets = if from.len() == 1 {
            let f = &from[0];
            let values = shard_values(&where_conds, &f.tref.alias, &cfgs[0].shard_key, true);
            Some(
                route(&cfgs[0], values.as_deref(), false)
                    .into_iter()
                    .map(|s| Target {
                        backend: s.backend,
                        range: s.range,
                        tables: vec![s.table],
                    })
                    .collect::<Vec<_>>(),
            )
        } else {
            self.colocated(&from, &cfgs, &where_conds)
        };
        match targets {
            Some(targets) => self.merge_node(query, sel, &from, targets),
            None => self.plan_join(sel, query, &from, &cfgs, &where_conds),
        }
    }

    fn merge_node(&self, query: &Query, sel: &Select, from: &[FromItem], targets: Vec<Target>) -> RadonResult<PlanNode> {
        if let [only] = targets.as_slice() {
            let node = MergeNode::new(vec![tuple(physical_sql(query, from, only), only)]);
            return Ok(PlanNode::Merge(node));
        }
        let (pushed, children) = decompose(query, sel)?;
        let mut node = MergeNode::new(targets.iter().map(|t| tuple(physical_sql(&pushed, from, t), t)).collect());
        node.children = children;
        Ok(PlanNode::Merge(node))
    }
}
