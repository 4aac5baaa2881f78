use std::collections::BTreeMap;

use parking_lot::RwLock;
use radon_common::config::RouterConfig;
use radon_common::error::codes;
use radon_common::{Datum, RadonError, RadonResult};

use crate::hash::distribute;
use crate::table::{Partition, Segment, ShardType, TableConfig, TableExtra};
use crate::Router;

const SYSTEM_DBS: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];
const DENIED_DBS: [&str; 2] = ["mysql", "sys"];

/// In-memory topology guarded by a read-mostly lock.
pub struct MetaRouter {
    conf: RouterConfig,
    dbs: RwLock<BTreeMap<String, BTreeMap<String, TableConfig>>>,
}

impl MetaRouter {
    pub fn new(conf: RouterConfig) -> Self {
        Self {
            conf,
            dbs: RwLock::new(BTreeMap::new()),
        }
    }

    fn with_table<T>(&self, db: &str, table: &str, f: impl FnOnce(&TableConfig) -> T) -> RadonResult<T> {
        let dbs = self.dbs.read();
        let tables = dbs
            .get(db)
            .ok_or_else(|| RadonError::SchemaMissing(db.to_string()))?;
        let cfg = tables
            .get(table)
            .ok_or_else(|| RadonError::TableMissing(format!("{db}.{table}")))?;
        Ok(f(cfg))
    }

    fn insert_table(&self, db: &str, cfg: TableConfig) -> RadonResult<()> {
        let mut dbs = self.dbs.write();
        let tables = dbs
            .get_mut(db)
            .ok_or_else(|| RadonError::SchemaMissing(db.to_string()))?;
        if tables.contains_key(&cfg.name) {
            return Err(RadonError::backend(
                codes::ER_TABLE_EXISTS_ERROR,
                "42S01",
                format!("Table '{}' already exists", cfg.name),
            ));
        }
        tracing::info!(db, table = %cfg.name, shard_type = %cfg.shard_type, partitions = cfg.partitions.len(), "router: table created");
        tables.insert(cfg.name.clone(), cfg);
        Ok(())
    }
}

fn sorted(backends: &[String]) -> RadonResult<Vec<String>> {
    if backends.is_empty() {
        return Err(RadonError::Unsupported("no backends to place the table on".into()));
    }
    let mut v = backends.to_vec();
    v.sort();
    v.dedup();
    Ok(v)
}

impl Router for MetaRouter {
    fn database_acl(&self, db: &str) -> RadonResult<()> {
        if DENIED_DBS.iter().any(|d| d.eq_ignore_ascii_case(db)) {
            return Err(RadonError::AccessDenied(format!(
                "lacking privileges for database {db}"
            )));
        }
        Ok(())
    }

    fn create_database(&self, db: &str) -> RadonResult<()> {
        let mut dbs = self.dbs.write();
        if dbs.contains_key(db) {
            return Err(RadonError::backend(
                codes::ER_DB_CREATE_EXISTS,
                "HY000",
                format!("Can't create database '{db}'; database exists"),
            ));
        }
        dbs.insert(db.to_string(), BTreeMap::new());
        Ok(())
    }

    fn drop_database(&self, db: &str) -> RadonResult<()> {
        match self.dbs.write().remove(db) {
            Some(_) => Ok(()),
            None => Err(RadonError::backend(
                codes::ER_DB_DROP_EXISTS,
                "HY000",
                format!("Can't drop database '{db}'; database doesn't exist"),
            )),
        }
    }

    fn create_table(
        &self,
        db: &str,
        table: &str,
        shard_key: &str,
        shard_type: ShardType,
        backends: &[String],
        extra: &TableExtra,
    ) -> RadonResult<()> {
        let backends = sorted(backends)?;
        let partitions = match shard_type {
            ShardType::Hash => distribute(table, self.conf.slots, self.conf.blocks, &backends),
            ShardType::List => {
                if extra.list_partitions.is_empty() {
                    return Err(RadonError::Unsupported("list partition needs at least one value list".into()));
                }
                extra
                    .list_partitions
                    .iter()
                    .enumerate()
                    .map(|(i, (backend, values))| {
                        if !backends.contains(backend) {
                            return Err(RadonError::Unsupported(format!("backend[{backend}] does not exist")));
                        }
                        Ok(Partition {
                            table: crate::hash::physical_name(table, i),
                            backend: backend.clone(),
                            slot_start: 0,
                            slot_end: 0,
                            list_values: values.clone(),
                        })
                    })
                    .collect::<RadonResult<Vec<_>>>()?
            }
            other => {
                return Err(RadonError::Internal(format!("create_table called with {other} table")));
            }
        };
        self.insert_table(
            db,
            TableConfig {
                name: table.to_string(),
                shard_type,
                shard_key: shard_key.to_string(),
                slots: if shard_type == ShardType::Hash { self.conf.slots } else { 0 },
                blocks: if shard_type == ShardType::Hash { self.conf.blocks } else { 0 },
                partitions,
            },
        )
    }

    fn create_non_part_table(
        &self,
        db: &str,
        table: &str,
        shard_type: ShardType,
        backends: &[String],
        _extra: &TableExtra,
    ) -> RadonResult<()> {
        let backends = sorted(backends)?;
        let chosen: Vec<String> = match shard_type {
            ShardType::Global => backends,
            ShardType::Single => backends.into_iter().take(1).collect(),
            other => {
                return Err(RadonError::Internal(format!("create_non_part_table called with {other} table")));
            }
        };
        let partitions = chosen
            .into_iter()
            .map(|backend| Partition {
                table: table.to_string(),
                backend,
                slot_start: 0,
                slot_end: 0,
                list_values: Vec::new(),
            })
            .collect();
        self.insert_table(
            db,
            TableConfig {
                name: table.to_string(),
                shard_type,
                shard_key: String::new(),
                slots: 0,
                blocks: 0,
                partitions,
            },
        )
    }

    fn drop_table(&self, db: &str, table: &str) -> RadonResult<()> {
        let mut dbs = self.dbs.write();
        let tables = dbs
            .get_mut(db)
            .ok_or_else(|| RadonError::SchemaMissing(db.to_string()))?;
        tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| RadonError::TableMissing(format!("{db}.{table}")))
    }

    fn tables(&self) -> BTreeMap<String, Vec<String>> {
        self.dbs
            .read()
            .iter()
            .map(|(db, tables)| (db.clone(), tables.keys().cloned().collect()))
            .collect()
    }

    fn table_config(&self, db: &str, table: &str) -> RadonResult<TableConfig> {
        self.with_table(db, table, Clone::clone)
    }

    fn shard_key(&self, db: &str, table: &str) -> RadonResult<String> {
        self.with_table(db, table, |t| t.shard_key.clone())
    }

    fn partition_type(&self, db: &str, table: &str) -> RadonResult<ShardType> {
        self.with_table(db, table, |t| t.shard_type)
    }

    fn is_system_db(&self, db: &str) -> bool {
        SYSTEM_DBS.iter().any(|d| d.eq_ignore_ascii_case(db))
    }

    fn check_database(&self, db: &str) -> RadonResult<()> {
        if db.is_empty() {
            return Err(RadonError::backend(1046, "3D000", "No database selected"));
        }
        if self.dbs.read().contains_key(db) {
            Ok(())
        } else {
            Err(RadonError::SchemaMissing(db.to_string()))
        }
    }

    fn check_table(&self, db: &str, table: &str) -> RadonResult<()> {
        self.with_table(db, table, |_| ())
    }

    fn lookup(
        &self,
        db: &str,
        table: &str,
        lower: Option<&Datum>,
        upper: Option<&Datum>,
    ) -> RadonResult<Vec<Segment>> {
        self.with_table(db, table, |cfg| {
            let point = match (lower, upper) {
                (Some(l), Some(u)) if l == u && !l.is_null() => Some(l),
                _ => None,
            };
            cfg.segments_for(point)
        })
    }
}
