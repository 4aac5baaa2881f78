use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::datum::{cmp_datum, Datum};
use crate::error::{RadonError, RadonResult};

/// MySQL column types as reported in result-set metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[default]
    Null,
    Tiny,
    Short,
    Int24,
    Long,
    LongLong,
    Float,
    Double,
    NewDecimal,
    Year,
    Date,
    Time,
    Datetime,
    Timestamp,
    Varchar,
    VarString,
    String,
    Blob,
    Json,
    Bit,
    Enum,
    Set,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Int24
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Float
                | FieldType::Double
                | FieldType::NewDecimal
                | FieldType::Year
        )
    }
}

/// Column metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Table alias as seen by the client.
    pub table: String,
    pub org_table: String,
    pub database: String,
    pub field_type: FieldType,
    pub decimals: u8,
    pub unsigned: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        self.org_table = table.clone();
        self.table = table;
        self
    }
}

pub type Row = Vec<Datum>;

/// Sort direction for one key of an ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// A resolved sort key: column index plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub index: usize,
    pub direction: Direction,
}

/// A merged or per-shard result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub warnings: u16,
}

impl QueryResult {
    pub fn new(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    /// Concatenate another shard's answer onto this one.
    ///
    /// Fields are taken from the first non-empty side; affected rows and
    /// warnings are summed; the last non-zero insert id wins.
    pub fn append_result(&mut self, other: QueryResult) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        self.warnings = self.warnings.saturating_add(other.warnings);
        if other.insert_id != 0 {
            self.insert_id = other.insert_id;
        }
    }

    /// Keep rows `[offset, offset + count)`, clamped to the row count.
    pub fn limit(&mut self, offset: usize, count: usize) {
        let len = self.rows.len();
        let start = offset.min(len);
        let end = start.saturating_add(count).min(len);
        self.rows.truncate(end);
        self.rows.drain(..start);
    }

    /// Position of the column named `field`, qualified by `table` when non-empty.
    pub fn field_index(&self, table: &str, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| {
            f.name.eq_ignore_ascii_case(field)
                && (table.is_empty() || f.table.eq_ignore_ascii_case(table))
        })
    }

    fn resolve(&self, table: &str, field: &str) -> RadonResult<usize> {
        self.field_index(table, field).ok_or_else(|| {
            let name = if table.is_empty() {
                field.to_string()
            } else {
                format!("{table}.{field}")
            };
            RadonError::Unsupported(format!("unsupported: can.not.find.the.orderby.field[{name}].direction.asc"))
        })
    }

    /// Stable ascending sort on the named column.
    pub fn ordered_by_asc(&mut self, table: &str, field: &str) -> RadonResult<()> {
        let index = self.resolve(table, field)?;
        self.sort(&[SortKey { index, direction: Direction::Asc }]);
        Ok(())
    }

    /// Stable descending sort on the named column.
    pub fn ordered_by_desc(&mut self, table: &str, field: &str) -> RadonResult<()> {
        let index = self.resolve(table, field)?;
        self.sort(&[SortKey { index, direction: Direction::Desc }]);
        Ok(())
    }

    /// One stable multi-key sort with null-safe comparison.
    pub fn sort(&mut self, keys: &[SortKey]) {
        self.rows.sort_by(|a, b| compare_by_keys(a, b, keys));
    }

    /// Drop the columns at `indices` from fields and rows.
    pub fn remove_columns(&mut self, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        let keep = |i: usize| !indices.contains(&i);
        self.fields = std::mem::take(&mut self.fields)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep(*i))
            .map(|(_, f)| f)
            .collect();
        for row in &mut self.rows {
            *row = std::mem::take(row)
                .into_iter()
                .enumerate()
                .filter(|(i, _)| keep(*i))
                .map(|(_, d)| d)
                .collect();
        }
    }

    /// Null-safe compare of two rows on column `idx`.
    pub fn compare_column(a: &Row, b: &Row, idx: usize) -> Ordering {
        match (a.get(idx), b.get(idx)) {
            (Some(x), Some(y)) => cmp_datum(x, y),
            (None, None) => Ordering::Equal,
            (None, _) => Ordering::Less,
            (_, None) => Ordering::Greater,
        }
    }

    /// Approximate payload size in bytes, used against the result-size cap.
    pub fn size_bytes(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.iter().map(datum_size).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Compare two rows with a multi-key descriptor.
pub fn compare_by_keys(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = QueryResult::compare_column(a, b, key.index);
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn datum_size(d: &Datum) -> usize {
    match d {
        Datum::Null => 1,
        Datum::Int64(_) | Datum::UInt64(_) | Datum::Float64(_) => 8,
        Datum::Decimal(..) => 16,
        Datum::Text(s) => s.len(),
        Datum::Bytes(b) => b.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(rows: &[&[i64]]) -> Vec<Row> {
        rows.iter()
            .map(|r| r.iter().map(|v| Datum::Int64(*v)).collect())
            .collect()
    }

    fn two_col(rows: &[&[i64]]) -> QueryResult {
        QueryResult::new(
            vec![
                Field::new("id", FieldType::LongLong).with_table("A"),
                Field::new("score", FieldType::LongLong).with_table("A"),
            ],
            ints(rows),
        )
    }

    #[test]
    fn test_limit_clamping() {
        for (n, o, c) in [(5usize, 0usize, 2usize), (5, 4, 10), (5, 7, 1), (0, 0, 3), (5, 0, usize::MAX)] {
            let data: Vec<i64> = (0..n as i64).collect();
            let rows: Vec<&[i64]> = data.chunks(1).collect();
            let mut r = two_col(&rows);
            r.limit(o, c);
            let expect = c.min(n.saturating_sub(o));
            assert_eq!(r.rows.len(), expect, "n={n} o={o} c={c}");
            if expect > 0 {
                assert_eq!(r.rows[0][0], Datum::Int64(o as i64));
            }
        }
    }

    #[test]
    fn test_append_result_sums() {
        let mut a = QueryResult::affected(2);
        let mut b = QueryResult::affected(3);
        b.insert_id = 9;
        b.warnings = 1;
        a.append_result(b);
        assert_eq!(a.rows_affected, 5);
        assert_eq!(a.insert_id, 9);
        assert_eq!(a.warnings, 1);
    }

    #[test]
    fn test_sort_desc_then_asc() {
        let mut r = two_col(&[&[1, 2], &[3, 1], &[1, 1], &[3, 0]]);
        r.sort(&[
            SortKey { index: 0, direction: Direction::Desc },
            SortKey { index: 1, direction: Direction::Asc },
        ]);
        assert_eq!(r.rows, ints(&[&[3, 0], &[3, 1], &[1, 1], &[1, 2]]));
    }

    #[test]
    fn test_sort_is_fixed_point_on_sorted_input() {
        let sorted = ints(&[&[1, 9], &[1, 3], &[2, 8], &[5, 0]]);
        let mut r = two_col(&[&[1, 9], &[1, 3], &[2, 8], &[5, 0]]);
        r.ordered_by_asc("A", "id").unwrap();
        assert_eq!(r.rows, sorted);
    }

    #[test]
    fn test_unknown_order_field() {
        let mut r = two_col(&[&[1, 2]]);
        assert!(r.ordered_by_desc("B", "id").is_err());
        assert!(r.ordered_by_desc("", "nope").is_err());
    }

    #[test]
    fn test_remove_columns() {
        let mut r = two_col(&[&[1, 2], &[3, 4]]);
        r.remove_columns(&[0]);
        assert_eq!(r.fields.len(), 1);
        assert_eq!(r.fields[0].name, "score");
        assert_eq!(r.rows, ints(&[&[2], &[4]]));
    }
}
