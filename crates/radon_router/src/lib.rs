//! Shard topology for the proxy.
//!
//! A logical table maps onto an ordered list of [`Segment`]s, each a physical
//! table on a named backend. The query path only talks to the [`Router`]
//! trait; [`MetaRouter`] is the in-memory implementation.

pub mod hash;
pub mod meta;
pub mod table;

pub use meta::MetaRouter;
pub use table::{Partition, Segment, ShardType, TableConfig, TableExtra};

use std::collections::BTreeMap;

use radon_common::{Datum, RadonResult};

/// Topology lookups consumed by the planner, executor and DDL front desk.
pub trait Router: Send + Sync {
    /// Reject databases the proxy must not expose to clients.
    fn database_acl(&self, db: &str) -> RadonResult<()>;
    fn create_database(&self, db: &str) -> RadonResult<()>;
    fn drop_database(&self, db: &str) -> RadonResult<()>;
    /// Register a partitioned (`HASH` or `LIST`) table.
    fn create_table(
        &self,
        db: &str,
        table: &str,
        shard_key: &str,
        shard_type: ShardType,
        backends: &[String],
        extra: &TableExtra,
    ) -> RadonResult<()>;
    /// Register a `GLOBAL` or `SINGLE` table.
    fn create_non_part_table(
        &self,
        db: &str,
        table: &str,
        shard_type: ShardType,
        backends: &[String],
        extra: &TableExtra,
    ) -> RadonResult<()>;
    fn drop_table(&self, db: &str, table: &str) -> RadonResult<()>;
    /// Every database with its tables, both sorted.
    fn tables(&self) -> BTreeMap<String, Vec<String>>;
    fn table_config(&self, db: &str, table: &str) -> RadonResult<TableConfig>;
    /// Shard key column; empty for non-partitioned tables.
    fn shard_key(&self, db: &str, table: &str) -> RadonResult<String>;
    fn partition_type(&self, db: &str, table: &str) -> RadonResult<ShardType>;
    fn is_partition_hash(&self, t: ShardType) -> bool {
        t == ShardType::Hash
    }
    fn is_system_db(&self, db: &str) -> bool;
    fn check_database(&self, db: &str) -> RadonResult<()>;
    fn check_table(&self, db: &str, table: &str) -> RadonResult<()>;
    /// Segments holding rows whose shard key lies in `[lower, upper]`.
    ///
    /// A point lookup passes the same value twice; `None` bounds mean
    /// "unbounded" and return every segment.
    fn lookup(
        &self,
        db: &str,
        table: &str,
        lower: Option<&Datum>,
        upper: Option<&Datum>,
    ) -> RadonResult<Vec<Segment>>;
}
