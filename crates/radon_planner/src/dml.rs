//! INSERT/REPLACE, UPDATE and DELETE routing.

use std::collections::BTreeMap;

use radon_common::{QueryTuple, RadonError, RadonResult};
use radon_router::{Segment, ShardType, TableConfig};
use sqlparser::ast::{
    Assignment, AssignmentTarget, Delete, Expr, FromTable, Insert, ObjectName, SetExpr, Statement, TableWithJoins,
};

use crate::expr::{columns_in, literal, quoted, split_and};
use crate::plan::{Plan, ShardPlan};
use crate::route::{rename_factor, route, shard_values, split_name, table_ref};
use crate::Planner;

fn tuple(query: String, seg: &Segment) -> QueryTuple {
    QueryTuple {
        query,
        backend: seg.backend.clone(),
        range: seg.range.clone(),
    }
}

fn physical_name(db: &str, table: &str) -> ObjectName {
    ObjectName(vec![quoted(db), quoted(table)])
}

impl Planner {
    fn writable_table(&self, db: &str, table: &str) -> RadonResult<TableConfig> {
        self.router.database_acl(db)?;
        if self.router.is_system_db(db) {
            return Err(RadonError::Unsupported(format!("unsupported: write to system database {db}")));
        }
        self.router.table_config(db, table)
    }

    pub(crate) fn build_insert(&self, db: &str, sql: &str, ins: &Insert) -> RadonResult<Plan> {
        let (db, table) = split_name(&ins.table_name, db)?;
        let cfg = self.writable_table(&db, &table)?;
        let source = ins
            .source
            .as_ref()
            .ok_or_else(|| RadonError::Unsupported("unsupported: insert without values".into()))?;
        let SetExpr::Values(values) = source.body.as_ref() else {
            return Err(RadonError::Unsupported("unsupported: insert ... select".into()));
        };

        // Rows grouped per physical table, keyed by partition position.
        let mut groups: BTreeMap<usize, (Segment, Vec<Vec<Expr>>)> = BTreeMap::new();
        match cfg.shard_type {
            ShardType::Hash | ShardType::List => {
                let key_pos = ins
                    .columns
                    .iter()
                    .position(|c| c.value.eq_ignore_ascii_case(&cfg.shard_key))
                    .ok_or_else(|| {
                        RadonError::Unsupported(format!(
                            "unsupported: shardkey.column[{}].missing",
                            cfg.shard_key
                        ))
                    })?;
                let segments = cfg.segments();
                for row in &values.rows {
                    let key = row
                        .get(key_pos)
                        .and_then(literal)
                        .filter(|d| !d.is_null())
                        .ok_or_else(|| {
                            RadonError::Unsupported(format!(
                                "unsupported: shardkey[{}].value must be a non-null constant",
                                cfg.shard_key
                            ))
                        })?;
                    let seg = route(&cfg, Some(std::slice::from_ref(&key)), true)
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            RadonError::Unsupported(format!(
                                "unsupported: table[{}].can.not.find.partition.for.value[{}]",
                                cfg.name,
                                key.to_mysql_text().unwrap_or_default()
                            ))
                        })?;
                    let idx = segments.iter().position(|s| s == &seg).unwrap_or_default();
                    groups.entry(idx).or_insert_with(|| (seg, Vec::new())).1.push(row.clone());
                }
            }
            ShardType::Global | ShardType::Single => {
                for (i, seg) in cfg.segments().into_iter().enumerate() {
                    groups.insert(i, (seg, values.rows.clone()));
                }
            }
        }

        let querys = groups
            .into_values()
            .map(|(seg, rows)| {
                let mut stmt = ins.clone();
                stmt.table_name = physical_name(&db, &seg.table);
                if let Some(src) = stmt.source.as_mut() {
                    if let SetExpr::Values(v) = src.body.as_mut() {
                        v.rows = rows;
                    }
                }
                tuple(Statement::Insert(stmt).to_string(), &seg)
            })
            .collect();
        Ok(Plan::Insert(ShardPlan::normal(sql, querys)))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_update(
        &self,
        db: &str,
        sql: &str,
        stmt: &Statement,
        table: &TableWithJoins,
        assignments: &[Assignment],
        has_from: bool,
        selection: Option<&Expr>,
    ) -> RadonResult<Plan> {
        if has_from || !table.joins.is_empty() {
            return Err(RadonError::Unsupported("unsupported: multi-table update".into()));
        }
        let tref = table_ref(&table.relation, db)?;
        let cfg = self.writable_table(&tref.db, &tref.table)?;
        let db = tref.db.as_str();
        if cfg.is_partitioned() {
            for a in assignments {
                let targets: Vec<&ObjectName> = match &a.target {
                    AssignmentTarget::ColumnName(n) => vec![n],
                    AssignmentTarget::Tuple(ns) => ns.iter().collect(),
                };
                let hits_key = targets
                    .iter()
                    .any(|n| n.0.last().map_or(false, |id| id.value.eq_ignore_ascii_case(&cfg.shard_key)));
                if hits_key {
                    return Err(RadonError::Unsupported(format!(
                        "unsupported: cannot update the shard key column[{}]",
                        cfg.shard_key
                    )));
                }
            }
        }
        let conds = selection.map(split_and).unwrap_or_default();
        let values = shard_values(&conds, &tref.alias, &cfg.shard_key, true);
        let querys = route(&cfg, values.as_deref(), true)
            .iter()
            .map(|seg| {
                let mut s = stmt.clone();
                if let Statement::Update { table, .. } = &mut s {
                    rename_factor(&mut table.relation, db, &seg.table, Some(&tref.alias));
                }
                tuple(s.to_string(), seg)
            })
            .collect();
        Ok(Plan::Update(ShardPlan::normal(sql, querys)))
    }

    pub(crate) fn build_delete(&self, db: &str, sql: &str, del: &Delete) -> RadonResult<Plan> {
        let from = match &del.from {
            FromTable::WithFromKeyword(v) | FromTable::WithoutKeyword(v) => v,
        };
        let [single] = from.as_slice() else {
            return Err(RadonError::Unsupported("unsupported: multi-table delete".into()));
        };
        if !del.tables.is_empty() || del.using.is_some() || !single.joins.is_empty() {
            return Err(RadonError::Unsupported("unsupported: multi-table delete".into()));
        }
        let tref = table_ref(&single.relation, db)?;
        let cfg = self.writable_table(&tref.db, &tref.table)?;
        let db = tref.db.as_str();
        let conds = del.selection.as_ref().map(split_and).unwrap_or_default();
        let values = shard_values(&conds, &tref.alias, &cfg.shard_key, true);
        let qualified = del
            .selection
            .as_ref()
            .map_or(false, |e| columns_in(e).iter().any(|c| c.qualifier.is_some()));
        // MySQL 5.7 takes no alias on a single-table DELETE.
        let alias = (tref.alias != tref.table || qualified).then_some(tref.alias.as_str());
        let querys = route(&cfg, values.as_deref(), true)
            .iter()
            .map(|seg| {
                let mut d = del.clone();
                let (FromTable::WithFromKeyword(v) | FromTable::WithoutKeyword(v)) = &mut d.from;
                if let Some(twj) = v.first_mut() {
                    rename_factor(&mut twj.relation, db, &seg.table, alias);
                }
                tuple(Statement::Delete(d).to_string(), seg)
            })
            .collect();
        Ok(Plan::Delete(ShardPlan::normal(sql, querys)))
    }
}
