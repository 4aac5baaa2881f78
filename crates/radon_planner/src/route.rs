//! Table references, shard-key pruning and physical renaming.

use radon_common::{Datum, RadonError, RadonResult};
use radon_router::{Segment, ShardType, TableConfig};
use sqlparser::ast::{BinaryOperator, Expr, ObjectName, TableAlias, TableFactor};

use crate::expr::{column_ref, literal, quoted, split_and};

/// A table as written in FROM: database, logical name and the name rows are
/// qualified with (the alias, or the table itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub db: String,
    pub table: String,
    pub alias: String,
}

pub fn split_name(name: &ObjectName, default_db: &str) -> RadonResult<(String, String)> {
    match name.0.as_slice() {
        [t] => {
            if default_db.is_empty() {
                return Err(RadonError::backend(1046, "3D000", "No database selected"));
            }
            Ok((default_db.to_string(), t.value.clone()))
        }
        [d, t] => Ok((d.value.clone(), t.value.clone())),
        _ => Err(RadonError::Unsupported(format!("unsupported: table name {name}"))),
    }
}

pub fn table_ref(factor: &TableFactor, default_db: &str) -> RadonResult<TableRef> {
    match factor {
        TableFactor::Table { name, alias, args, .. } => {
            if args.is_some() {
                return Err(RadonError::Unsupported(format!("unsupported: table function {name}")));
            }
            let (db, table) = split_name(name, default_db)?;
            let alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table.clone());
            Ok(TableRef { db, table, alias })
        }
        TableFactor::Derived { .. } => Err(RadonError::Unsupported("unsupported: subquery in from clause".into())),
        other => Err(RadonError::Unsupported(format!("unsupported: table factor {other}"))),
    }
}

/// Point `factor` at `db`.`physical`, keeping `alias` as the row qualifier.
pub fn rename_factor(factor: &mut TableFactor, db: &str, physical: &str, alias: Option<&str>) {
    if let TableFactor::Table { name, alias: current, .. } = factor {
        *name = ObjectName(vec![quoted(db), quoted(physical)]);
        if let (None, Some(a)) = (current.as_ref(), alias) {
            *current = Some(TableAlias {
                name: quoted(a),
                columns: Vec::new(),
            });
        }
    }
}

fn is_key_column(e: &Expr, alias: &str, key: &str, unqualified_ok: bool) -> bool {
    match column_ref(e) {
        Some(c) => {
            c.name.eq_ignore_ascii_case(key)
                && match &c.qualifier {
                    Some(q) => q.eq_ignore_ascii_case(alias),
                    None => unqualified_ok,
                }
        }
        None => false,
    }
}

/// Shard-key values pinned by `conds` (`key = lit` or `key IN (lits)`),
/// from the first conjunct that pins any.
pub fn shard_values(conds: &[Expr], alias: &str, key: &str, unqualified_ok: bool) -> Option<Vec<Datum>> {
    if key.is_empty() {
        return None;
    }
    for c in conds {
        match c {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                for (col, val) in [(left, right), (right, left)] {
                    if is_key_column(col, alias, key, unqualified_ok) {
                        if let Some(d) = literal(val).filter(|d| !d.is_null()) {
                            return Some(vec![d]);
                        }
                    }
                }
            }
            Expr::InList {
                expr,
                list,
                negated: false,
            } if is_key_column(expr, alias, key, unqualified_ok) => {
                let values: Option<Vec<Datum>> = list.iter().map(literal).collect();
                if let Some(values) = values {
                    let values: Vec<Datum> = values.into_iter().filter(|d| !d.is_null()).collect();
                    return Some(values);
                }
            }
            Expr::Nested(inner) => {
                if let Some(v) = shard_values(&split_and(inner), alias, key, unqualified_ok) {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Segments a statement on `cfg` must reach.
///
/// Reads of a `GLOBAL` table use its first copy; writes reach every copy.
/// A read whose pinned values match no partition still goes to one segment
/// so the client receives the column metadata.
pub fn route(cfg: &TableConfig, values: Option<&[Datum]>, write: bool) -> Vec<Segment> {
    let all = cfg.segments();
    match cfg.shard_type {
        ShardType::Global if !write => all.into_iter().take(1).collect(),
        ShardType::Global | ShardType::Single => all,
        ShardType::Hash | ShardType::List => {
            let Some(values) = values else {
                return all;
            };
            let hit: Vec<String> = values
                .iter()
                .flat_map(|v| cfg.segments_for(Some(v)))
                .map(|s| s.table)
                .collect();
            let picked: Vec<Segment> = all.iter().filter(|s| hit.contains(&s.table)).cloned().collect();
            if picked.is_empty() && !write {
                all.into_iter().take(1).collect()
            } else {
                picked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;
    use radon_router::Partition;

    fn hash_table() -> TableConfig {
        TableConfig {
            name: "t".into(),
            shard_type: ShardType::Hash,
            shard_key: "id".into(),
            slots: 4096,
            blocks: 1024,
            partitions: radon_router::hash::distribute("t", 4096, 1024, &["b0".to_string(), "b1".to_string()]),
        }
    }

    #[test]
    fn test_shard_values_eq_and_in() {
        let conds = split_and(&parse_expr("t.id = 3 AND name = 'x'").unwrap());
        assert_eq!(shard_values(&conds, "t", "id", false), Some(vec![Datum::Int64(3)]));
        let conds = split_and(&parse_expr("5 = id").unwrap());
        assert_eq!(shard_values(&conds, "t", "id", true), Some(vec![Datum::Int64(5)]));
        assert_eq!(shard_values(&conds, "t", "id", false), None);
        let conds = split_and(&parse_expr("id IN (1, 2)").unwrap());
        assert_eq!(shard_values(&conds, "t", "id", true).map(|v| v.len()), Some(2));
        let conds = split_and(&parse_expr("id > 1").unwrap());
        assert_eq!(shard_values(&conds, "t", "id", true), None);
    }

    #[test]
    fn test_route_prunes_and_falls_back() {
        let cfg = hash_table();
        assert_eq!(route(&cfg, None, false).len(), 4);
        let one = route(&cfg, Some(&[Datum::Int64(9)]), false);
        assert_eq!(one.len(), 1);
        assert_eq!(one, cfg.segments_for(Some(&Datum::Int64(9))));

        let list = TableConfig {
            name: "l".into(),
            shard_type: ShardType::List,
            shard_key: "c".into(),
            slots: 0,
            blocks: 0,
            partitions: vec![Partition {
                table: "l_0000".into(),
                backend: "b0".into(),
                slot_start: 0,
                slot_end: 0,
                list_values: vec!["1".into()],
            }],
        };
        assert_eq!(route(&list, Some(&[Datum::Int64(7)]), false).len(), 1);
        assert!(route(&list, Some(&[Datum::Int64(7)]), true).is_empty());
    }
}
