use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::result::FieldType;

/// A single cell of a MySQL result set.
///
/// Backends speak the text protocol, so every cell arrives as bytes and is
/// decoded by column type (see [`Datum::from_mysql_text`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    /// Fixed-point decimal: mantissa × 10^(-scale). `Decimal(12345, 2)` is `123.45`.
    Decimal(i128, u8),
    Text(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Datum::Int64(_) | Datum::UInt64(_) | Datum::Float64(_) | Datum::Decimal(..)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            Datum::UInt64(v) => i64::try_from(*v).ok(),
            Datum::Float64(v) => Some(*v as i64),
            Datum::Decimal(m, s) => Some(10i128.checked_pow(u32::from(*s)).map_or(0, |p| *m / p) as i64),
            Datum::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int64(v) => Some(*v as f64),
            Datum::UInt64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            Datum::Decimal(m, s) => Some(*m as f64 / 10f64.powi(*s as i32)),
            Datum::Text(s) => s.trim().parse().ok(),
            Datum::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            Datum::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            Datum::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// MySQL truthiness: NULL and numeric zero are false.
    pub fn is_true(&self) -> bool {
        match self {
            Datum::Null => false,
            other => other.as_f64().map(|v| v != 0.0).unwrap_or(true),
        }
    }

    /// Text-protocol rendering; `None` for NULL.
    pub fn to_mysql_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Int64(v) => Some(v.to_string()),
            Datum::UInt64(v) => Some(v.to_string()),
            Datum::Float64(v) => Some(format_float(*v)),
            Datum::Decimal(m, s) => Some(decimal_to_string(*m, *s)),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Raw bytes of the value as it travels on the wire; NULL is empty.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match self {
            Datum::Bytes(b) => b.clone(),
            other => other.to_mysql_text().unwrap_or_default().into_bytes(),
        }
    }

    /// SQL literal form for substitution into a statement.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Null => "NULL".into(),
            Datum::Text(s) => quote_string(s),
            Datum::Bytes(b) => quote_string(&String::from_utf8_lossy(b)),
            other => other.to_mysql_text().unwrap_or_else(|| "NULL".into()),
        }
    }

    /// Decode one text-protocol cell according to its column type.
    pub fn from_mysql_text(raw: Option<&[u8]>, field_type: FieldType, unsigned: bool) -> Datum {
        let Some(raw) = raw else {
            return Datum::Null;
        };
        let text = match std::str::from_utf8(raw) {
            Ok(t) => t,
            Err(_) => return Datum::Bytes(raw.to_vec()),
        };
        match field_type {
            FieldType::Tiny
            | FieldType::Short
            | FieldType::Int24
            | FieldType::Long
            | FieldType::LongLong
            | FieldType::Year => {
                if unsigned {
                    text.parse().map(Datum::UInt64).unwrap_or_else(|_| Datum::Text(text.into()))
                } else {
                    text.parse().map(Datum::Int64).unwrap_or_else(|_| Datum::Text(text.into()))
                }
            }
            FieldType::Float | FieldType::Double => text
                .parse()
                .map(Datum::Float64)
                .unwrap_or_else(|_| Datum::Text(text.into())),
            FieldType::NewDecimal => {
                Datum::parse_decimal(text).unwrap_or_else(|| Datum::Text(text.into()))
            }
            FieldType::Blob | FieldType::Bit => Datum::Bytes(raw.to_vec()),
            _ => Datum::Text(text.into()),
        }
    }

    /// Parse `"123.45"` or `"-0.001"` into a decimal.
    pub fn parse_decimal(s: &str) -> Option<Datum> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (int_part, frac_part) = match s.find('.') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => (s, ""),
        };
        let scale = u8::try_from(frac_part.len()).ok()?;
        let mantissa: i128 = format!("{int_part}{frac_part}").parse().ok()?;
        Some(Datum::Decimal(mantissa, scale))
    }

    /// Addition used by SUM; NULL is absorbed by the other side.
    pub fn add(&self, other: &Datum) -> Datum {
        match (self, other) {
            (Datum::Null, x) | (x, Datum::Null) => x.clone(),
            (Datum::Int64(a), Datum::Int64(b)) => match a.checked_add(*b) {
                Some(v) => Datum::Int64(v),
                None => Datum::Decimal(*a as i128 + *b as i128, 0),
            },
            (Datum::UInt64(a), Datum::UInt64(b)) => match a.checked_add(*b) {
                Some(v) => Datum::UInt64(v),
                None => Datum::Decimal(*a as i128 + *b as i128, 0),
            },
            (Datum::Int64(a), Datum::UInt64(b)) | (Datum::UInt64(b), Datum::Int64(a)) => {
                Datum::Decimal(*a as i128 + *b as i128, 0)
            }
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => decimal_add(*a, *sa, *b, *sb),
            (Datum::Decimal(a, sa), x) | (x, Datum::Decimal(a, sa)) if x.is_integer() => {
                let b = x.as_i128().unwrap_or_default();
                decimal_add(*a, *sa, b, 0)
            }
            (a, b) => Datum::Float64(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, Datum::Int64(_) | Datum::UInt64(_))
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Datum::Int64(v) => Some(*v as i128),
            Datum::UInt64(v) => Some(*v as i128),
            _ => None,
        }
    }
}

/// Null-safe total order: NULL sorts before every value.
///
/// Numbers compare numerically across representations; text compares
/// byte-wise; a number and a numeric-looking string compare as numbers.
pub fn cmp_datum(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Int64(x), Datum::Int64(y)) => x.cmp(y),
        (Datum::UInt64(x), Datum::UInt64(y)) => x.cmp(y),
        (Datum::Int64(x), Datum::UInt64(y)) => (*x as i128).cmp(&(*y as i128)),
        (Datum::UInt64(x), Datum::Int64(y)) => (*x as i128).cmp(&(*y as i128)),
        (Datum::Decimal(x, sx), Datum::Decimal(y, sy)) => decimal_cmp(*x, *sx, *y, *sy),
        (Datum::Decimal(x, sx), other) if other.is_integer() => {
            decimal_cmp(*x, *sx, other.as_i128().unwrap_or_default(), 0)
        }
        (other, Datum::Decimal(y, sy)) if other.is_integer() => {
            decimal_cmp(other.as_i128().unwrap_or_default(), 0, *y, *sy)
        }
        (x, y) if x.is_numeric() || y.is_numeric() => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.total_cmp(&fy),
            _ => x.raw_bytes().cmp(&y.raw_bytes()),
        },
        (x, y) => x.raw_bytes().cmp(&y.raw_bytes()),
    }
}

/// Compare two rows on the given column indices, left to right.
pub fn cmp_row_keys(a: &[Datum], b: &[Datum], keys: &[usize]) -> Ordering {
    for &k in keys {
        let ord = match (a.get(k), b.get(k)) {
            (Some(x), Some(y)) => cmp_datum(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        cmp_datum(self, other) == Ordering::Equal
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_mysql_text() {
            Some(t) => f.write_str(&t),
            None => f.write_str("NULL"),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// `(12345, 2)` → `"123.45"`, `(-1, 3)` → `"-0.001"`.
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let digits = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    let body = if digits.len() <= scale {
        format!("0.{}{}", "0".repeat(scale - digits.len()), digits)
    } else {
        let (i, f) = digits.split_at(digits.len() - scale);
        format!("{i}.{f}")
    };
    if mantissa < 0 {
        format!("-{body}")
    } else {
        body
    }
}

/// `v * 10^k`, or `None` when it does not fit in an `i128`.
fn rescale(v: i128, k: u32) -> Option<i128> {
    if v == 0 {
        return Some(0);
    }
    10i128.checked_pow(k)?.checked_mul(v)
}

/// Both mantissas at the larger scale, when that is representable.
fn decimal_normalize(a: i128, sa: u8, b: i128, sb: u8) -> Option<(i128, i128)> {
    match sa.cmp(&sb) {
        Ordering::Equal => Some((a, b)),
        Ordering::Greater => Some((a, rescale(b, u32::from(sa - sb))?)),
        Ordering::Less => Some((rescale(a, u32::from(sb - sa))?, b)),
    }
}

fn decimal_cmp(a: i128, sa: u8, b: i128, sb: u8) -> Ordering {
    match decimal_normalize(a, sa, b, sb) {
        Some((na, nb)) => na.cmp(&nb),
        // The side that overflowed has the larger magnitude, so its sign decides.
        None if sa > sb => 0.cmp(&b),
        None => a.cmp(&0),
    }
}

fn decimal_add(a: i128, sa: u8, b: i128, sb: u8) -> Datum {
    match decimal_normalize(a, sa, b, sb).and_then(|(na, nb)| na.checked_add(nb)) {
        Some(sum) => Datum::Decimal(sum, sa.max(sb)),
        None => Datum::Float64(
            Datum::Decimal(a, sa).as_f64().unwrap_or(0.0) + Datum::Decimal(b, sb).as_f64().unwrap_or(0.0),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(cmp_datum(&Datum::Null, &Datum::Int64(-5)), Ordering::Less);
        assert_eq!(cmp_datum(&Datum::Text("a".into()), &Datum::Null), Ordering::Greater);
        assert_eq!(cmp_datum(&Datum::Null, &Datum::Null), Ordering::Equal);
    }

    #[test]
    fn test_cross_numeric_compare() {
        assert_eq!(cmp_datum(&Datum::Int64(3), &Datum::Decimal(300, 2)), Ordering::Equal);
        assert_eq!(cmp_datum(&Datum::UInt64(4), &Datum::Int64(-1)), Ordering::Greater);
        assert_eq!(cmp_datum(&Datum::Float64(2.5), &Datum::Int64(3)), Ordering::Less);
        assert_eq!(cmp_datum(&Datum::Int64(10), &Datum::Text("9".into())), Ordering::Greater);
    }

    #[test]
    fn test_decimal_compare_far_apart_scales() {
        assert_eq!(cmp_datum(&Datum::Decimal(1, 30), &Datum::Int64(1_000_000_000)), Ordering::Less);
        assert_eq!(cmp_datum(&Datum::Int64(-1_000_000_000), &Datum::Decimal(1, 30)), Ordering::Less);
        assert_eq!(cmp_datum(&Datum::Decimal(-5, 60), &Datum::Decimal(-7, 0)), Ordering::Greater);
        assert_eq!(cmp_datum(&Datum::Decimal(0, 60), &Datum::Decimal(0, 2)), Ordering::Equal);
        assert_eq!(cmp_datum(&Datum::Decimal(10i128.pow(30), 30), &Datum::Int64(1)), Ordering::Equal);
        assert_eq!(cmp_datum(&Datum::Decimal(12, 1), &Datum::Decimal(1, 40)), Ordering::Greater);
        assert_eq!(Datum::Decimal(1, 45).as_i64(), Some(0));
        assert!(matches!(Datum::Decimal(1, 60).add(&Datum::Int64(i64::MAX)), Datum::Float64(_)));
    }

    #[test]
    fn test_add() {
        assert_eq!(Datum::Int64(3).add(&Datum::Int64(7)), Datum::Int64(10));
        assert_eq!(Datum::Null.add(&Datum::Int64(7)), Datum::Int64(7));
        let d = Datum::Decimal(150, 2).add(&Datum::Int64(1));
        assert_eq!(d.to_mysql_text().unwrap(), "2.50");
        assert_eq!(Datum::Int64(i64::MAX).add(&Datum::Int64(1)).to_string(), "9223372036854775808");
    }

    #[test]
    fn test_from_mysql_text() {
        assert_eq!(
            Datum::from_mysql_text(Some(b"42"), FieldType::LongLong, false),
            Datum::Int64(42)
        );
        assert!(Datum::from_mysql_text(None, FieldType::LongLong, false).is_null());
        match Datum::from_mysql_text(Some(b"12.50"), FieldType::NewDecimal, false) {
            Datum::Decimal(m, s) => assert_eq!((m, s), (1250, 2)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            Datum::from_mysql_text(Some(b"go"), FieldType::VarString, false),
            Datum::Text("go".into())
        );
    }

    #[test]
    fn test_sql_literal_escapes() {
        assert_eq!(Datum::Text("it's".into()).to_sql_literal(), "'it\\'s'");
        assert_eq!(Datum::Null.to_sql_literal(), "NULL");
        assert_eq!(Datum::Int64(-3).to_sql_literal(), "-3");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Datum::Null.is_true());
        assert!(!Datum::Int64(0).is_true());
        assert!(Datum::Int64(1).is_true());
        assert!(!Datum::Text("0".into()).is_true());
    }
}
