//! Group-wise re-aggregation of merged shard rows.
//!
//! Rows are stably sorted on the group columns so each group is a run; a
//! run is folded into one output row that keeps the first row's non-aggregate
//! columns. Pushed aggregators combine partial results (`COUNT` partials are
//! summed); the rest fold raw argument values.

use std::collections::HashSet;

use radon_common::datum::{cmp_datum, cmp_row_keys};
use radon_common::{Datum, QueryResult, RadonResult, Row};
use radon_planner::{AggKind, AggregatePlan, Aggregator};

/// Running state of one aggregator within one group.
struct AggState<'a> {
    agg: &'a Aggregator,
    value: Datum,
    count: i64,
    seen: HashSet<Vec<u8>>,
}

impl<'a> AggState<'a> {
    fn new(agg: &'a Aggregator) -> Self {
        Self {
            agg,
            value: Datum::Null,
            count: 0,
            seen: HashSet::new(),
        }
    }

    fn update(&mut self, row: &Row) {
        let v = row.get(self.agg.index).cloned().unwrap_or(Datum::Null);
        if self.agg.pushed {
            match self.agg.kind {
                AggKind::Count => self.value = self.value.add(&v),
                AggKind::Sum => self.value = self.value.add(&v),
                AggKind::Min => self.pick(v, true),
                AggKind::Max => self.pick(v, false),
                AggKind::Avg => {
                    self.value = self.value.add(&v);
                    let c = self
                        .agg
                        .count_index
                        .and_then(|i| row.get(i))
                        .and_then(Datum::as_i64)
                        .unwrap_or(0);
                    self.count += c;
                }
            }
            return;
        }
        if v.is_null() {
            return;
        }
        if self.agg.distinct && !self.seen.insert(distinct_key(&v)) {
            return;
        }
        self.count += 1;
        match self.agg.kind {
            AggKind::Count => {}
            AggKind::Sum | AggKind::Avg => self.value = self.value.add(&v),
            AggKind::Min => self.pick(v, true),
            AggKind::Max => self.pick(v, false),
        }
    }

    fn pick(&mut self, v: Datum, min: bool) {
        if v.is_null() {
            return;
        }
        let replace = self.value.is_null() || {
            let ord = cmp_datum(&v, &self.value);
            if min {
                ord.is_lt()
            } else {
                ord.is_gt()
            }
        };
        if replace {
            self.value = v;
        }
    }

    fn finish(self) -> Datum {
        match (self.agg.kind, self.agg.pushed) {
            (AggKind::Count, true) => match self.value {
                Datum::Null => Datum::Int64(0),
                v => v,
            },
            (AggKind::Count, false) => Datum::Int64(self.count),
            (AggKind::Avg, _) => {
                if self.count == 0 {
                    return Datum::Null;
                }
                match self.value.as_f64() {
                    Some(sum) => Datum::Float64(sum / self.count as f64),
                    None => Datum::Null,
                }
            }
            _ => self.value,
        }
    }
}

/// Numbers that compare equal collide, so `1` and `1.0` count once.
fn distinct_key(v: &Datum) -> Vec<u8> {
    match v.as_f64() {
        Some(f) if v.is_numeric() => {
            let f = if f == 0.0 { 0.0 } else { f };
            let mut k = vec![b'n'];
            k.extend_from_slice(&f.to_bits().to_be_bytes());
            k
        }
        _ => {
            let mut k = vec![b's'];
            k.extend(v.raw_bytes());
            k
        }
    }
}

fn fold(group: &[Row], plan: &AggregatePlan, width: usize) -> Row {
    let mut states: Vec<AggState<'_>> = plan.aggregators.iter().map(AggState::new).collect();
    for row in group {
        for s in &mut states {
            s.update(row);
        }
    }
    let mut out = group
        .first()
        .cloned()
        .unwrap_or_else(|| vec![Datum::Null; width]);
    if out.len() < width {
        out.resize(width, Datum::Null);
    }
    for s in states {
        let index = s.agg.index;
        let value = s.finish();
        if let Some(cell) = out.get_mut(index) {
            *cell = value;
        }
    }
    out
}

pub fn execute(mut result: QueryResult, plan: &AggregatePlan) -> RadonResult<QueryResult> {
    let width = result
        .fields
        .len()
        .max(result.rows.first().map_or(0, Vec::len))
        .max(plan.aggregators.iter().map(|a| a.index + 1).max().unwrap_or(0));
    let rows = std::mem::take(&mut result.rows);

    let mut out = Vec::new();
    if plan.group_by.is_empty() {
        let empty_row = rows.is_empty() && plan.aggregators.iter().any(|a| !a.distinct);
        if !rows.is_empty() || empty_row {
            out.push(fold(&rows, plan, width));
        }
    } else {
        let mut rows = rows;
        rows.sort_by(|a, b| cmp_row_keys(a, b, &plan.group_by));
        let mut start = 0;
        for i in 1..=rows.len() {
            let boundary = i == rows.len() || cmp_row_keys(&rows[i - 1], &rows[i], &plan.group_by).is_ne();
            if boundary {
                out.push(fold(&rows[start..i], plan, width));
                start = i;
            }
        }
    }
    result.rows = out;
    result.remove_columns(&plan.hidden);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_common::{Field, FieldType};

    fn agg(index: usize, kind: AggKind, distinct: bool, pushed: bool) -> Aggregator {
        Aggregator {
            index,
            kind,
            distinct,
            pushed,
            count_index: None,
        }
    }

    fn input(rows: Vec<Row>) -> QueryResult {
        let width = rows.first().map_or(2, Vec::len);
        QueryResult::new(
            (0..width)
                .map(|i| Field::new(format!("c{i}"), FieldType::LongLong))
                .collect(),
            rows,
        )
    }

    fn ints(vals: &[&[i64]]) -> Vec<Row> {
        vals.iter()
            .map(|r| r.iter().map(|v| Datum::Int64(*v)).collect())
            .collect()
    }

    #[test]
    fn test_pushed_sum_count_min_max() {
        let plan = AggregatePlan {
            group_by: vec![],
            aggregators: vec![
                agg(1, AggKind::Sum, false, true),
                agg(2, AggKind::Count, false, true),
                agg(3, AggKind::Min, false, true),
                agg(4, AggKind::Max, false, true),
            ],
            hidden: vec![],
        };
        let r = execute(input(ints(&[&[3, 3, 1, 4, 4], &[3, 7, 2, 2, 9], &[3, 3, 1, 8, 1]])), &plan).unwrap();
        assert_eq!(r.rows, ints(&[&[3, 13, 4, 2, 9]]));
    }

    #[test]
    fn test_avg_from_partials_drops_hidden_count() {
        let mut avg = agg(0, AggKind::Avg, false, true);
        avg.count_index = Some(1);
        let plan = AggregatePlan {
            group_by: vec![],
            aggregators: vec![avg],
            hidden: vec![1],
        };
        let r = execute(input(ints(&[&[3, 1], &[8, 2]])), &plan).unwrap();
        assert_eq!(r.fields.len(), 1);
        assert_eq!(r.rows, vec![vec![Datum::Float64(11.0 / 3.0)]]);
    }

    #[test]
    fn test_distinct_count_on_raw_values() {
        let plan = AggregatePlan {
            group_by: vec![],
            aggregators: vec![agg(1, AggKind::Count, true, false)],
            hidden: vec![],
        };
        let r = execute(input(ints(&[&[3, 3], &[3, 7], &[3, 3], &[3, 7]])), &plan).unwrap();
        assert_eq!(r.rows, ints(&[&[3, 2]]));
    }

    #[test]
    fn test_group_by_is_order_independent() {
        let plan = AggregatePlan {
            group_by: vec![0],
            aggregators: vec![agg(1, AggKind::Sum, false, true)],
            hidden: vec![],
        };
        let a = execute(input(ints(&[&[1, 11], &[2, 22], &[1, 11], &[2, 22]])), &plan).unwrap();
        let b = execute(input(ints(&[&[2, 22], &[1, 11], &[2, 22], &[1, 11]])), &plan).unwrap();
        assert_eq!(a.rows, ints(&[&[1, 22], &[2, 44]]));
        assert_eq!(a.rows, b.rows);
    }

    #[test]
    fn test_empty_input() {
        let plan = AggregatePlan {
            group_by: vec![],
            aggregators: vec![agg(0, AggKind::Count, false, true), agg(1, AggKind::Sum, false, true)],
            hidden: vec![],
        };
        let r = execute(input(vec![]), &plan).unwrap();
        assert_eq!(r.rows, vec![vec![Datum::Int64(0), Datum::Null]]);

        let grouped = AggregatePlan {
            group_by: vec![0],
            ..plan
        };
        assert!(execute(input(vec![]), &grouped).unwrap().rows.is_empty());

        let only_distinct = AggregatePlan {
            group_by: vec![],
            aggregators: vec![agg(0, AggKind::Count, true, false)],
            hidden: vec![],
        };
        assert!(execute(input(vec![]), &only_distinct).unwrap().rows.is_empty());
    }

    #[test]
    fn test_raw_values_skip_nulls() {
        let plan = AggregatePlan {
            group_by: vec![],
            aggregators: vec![
                agg(0, AggKind::Count, false, false),
                agg(1, AggKind::Avg, false, false),
                agg(2, AggKind::Min, false, false),
            ],
            hidden: vec![],
        };
        let rows = vec![
            vec![Datum::Int64(1), Datum::Int64(2), Datum::Null],
            vec![Datum::Null, Datum::Int64(4), Datum::Int64(5)],
            vec![Datum::Int64(1), Datum::Null, Datum::Int64(-1)],
        ];
        let r = execute(input(rows), &plan).unwrap();
        assert_eq!(r.rows, vec![vec![Datum::Int64(2), Datum::Float64(3.0), Datum::Int64(-1)]]);
    }
}
