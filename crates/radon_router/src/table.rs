use std::fmt;

use radon_common::Datum;
use serde::{Deserialize, Serialize};

use crate::hash::slot_of;

/// How a logical table is spread over backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardType {
    Hash,
    List,
    /// Replicated on every backend.
    Global,
    /// Lives on exactly one backend.
    Single,
}

impl fmt::Display for ShardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardType::Hash => "HASH",
            ShardType::List => "LIST",
            ShardType::Global => "GLOBAL",
            ShardType::Single => "SINGLE",
        };
        f.write_str(s)
    }
}

/// One physical sub-table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Physical table name, e.g. `t_0003`.
    pub table: String,
    pub backend: String,
    /// Hash slots `[start, end)` owned by this partition; zero for non-hash tables.
    pub slot_start: usize,
    pub slot_end: usize,
    /// Shard-key values routed here for `LIST` tables.
    pub list_values: Vec<String>,
}

/// Lookup answer: where a fragment must be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub table: String,
    pub backend: String,
    /// Human-readable range for EXPLAIN, e.g. `[0-128)`.
    pub range: String,
}

/// Extra options supplied at CREATE TABLE time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableExtra {
    /// `LIST` partitions: (backend, values) in declaration order.
    pub list_partitions: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub shard_type: ShardType,
    pub shard_key: String,
    pub slots: usize,
    pub blocks: usize,
    pub partitions: Vec<Partition>,
}

impl TableConfig {
    pub fn is_partitioned(&self) -> bool {
        matches!(self.shard_type, ShardType::Hash | ShardType::List)
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.partitions.iter().map(Partition::segment).collect()
    }

    pub fn backends(&self) -> Vec<String> {
        let mut out: Vec<String> = self.partitions.iter().map(|p| p.backend.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Segments that may hold rows with shard key `key`; every segment when
    /// the key is unknown or the table is not partitioned.
    pub fn segments_for(&self, key: Option<&Datum>) -> Vec<Segment> {
        match (self.shard_type, key) {
            (ShardType::Hash, Some(key)) => {
                let slot = slot_of(key, self.slots);
                self.partitions
                    .iter()
                    .filter(|p| slot >= p.slot_start && slot < p.slot_end)
                    .map(Partition::segment)
                    .collect()
            }
            (ShardType::List, Some(key)) => {
                let text = key.to_mysql_text().unwrap_or_default();
                self.partitions
                    .iter()
                    .filter(|p| p.list_values.iter().any(|v| v == &text))
                    .map(Partition::segment)
                    .collect()
            }
            _ => self.segments(),
        }
    }

    /// Two tables whose rows with equal shard keys always land on the same backend.
    pub fn same_layout(&self, other: &TableConfig) -> bool {
        if self.shard_type != other.shard_type
            || self.slots != other.slots
            || self.partitions.len() != other.partitions.len()
        {
            return false;
        }
        self.partitions.iter().zip(&other.partitions).all(|(a, b)| {
            a.backend == b.backend
                && a.slot_start == b.slot_start
                && a.slot_end == b.slot_end
                && a.list_values == b.list_values
        })
    }
}

impl Partition {
    pub fn segment(&self) -> Segment {
        let range = if self.slot_end > self.slot_start {
            format!("[{}-{})", self.slot_start, self.slot_end)
        } else if !self.list_values.is_empty() {
            format!("({})", self.list_values.join(","))
        } else {
            String::new()
        };
        Segment {
            table: self.table.clone(),
            backend: self.backend.clone(),
            range,
        }
    }
}
