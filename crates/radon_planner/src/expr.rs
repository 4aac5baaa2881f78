//! Parsing entry points and expression helpers shared by the builders.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use radon_common::{Datum, RadonError, RadonResult};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FunctionArg, FunctionArgExpr, Ident, SelectItem, Statement,
    UnaryOperator, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::plan::{AggKind, CmpOp};

/// Parse exactly one MySQL statement.
pub fn parse_one(sql: &str) -> RadonResult<Statement> {
    let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| RadonError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(RadonError::Parse("empty query".into())),
        1 => Ok(stmts.remove(0)),
        _ => Err(RadonError::Unsupported("multi statements in one query".into())),
    }
}

pub fn parse_expr(text: &str) -> RadonResult<Expr> {
    Parser::new(&MySqlDialect {})
        .try_with_sql(text)
        .and_then(|mut p| p.parse_expr())
        .map_err(|e| RadonError::Parse(e.to_string()))
}

/// Backquoted identifier.
pub fn quoted(name: &str) -> Ident {
    Ident::with_quote('`', name)
}

/// A column reference, with the qualifier the user wrote (alias or table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

pub fn column_ref(e: &Expr) -> Option<ColumnRef> {
    match e {
        Expr::Identifier(id) => Some(ColumnRef {
            qualifier: None,
            name: id.value.clone(),
        }),
        Expr::CompoundIdentifier(ids) if ids.len() >= 2 => Some(ColumnRef {
            qualifier: Some(ids[ids.len() - 2].value.clone()),
            name: ids[ids.len() - 1].value.clone(),
        }),
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

/// Constant value of a literal expression.
pub fn literal(e: &Expr) -> Option<Datum> {
    match e {
        Expr::Value(v) => match v {
            Value::Number(s, _) => s
                .parse::<i64>()
                .ok()
                .map(Datum::Int64)
                .or_else(|| s.parse::<u64>().ok().map(Datum::UInt64))
                .or_else(|| Datum::parse_decimal(s)),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Some(Datum::Text(s.clone())),
            Value::Boolean(b) => Some(Datum::Int64(i64::from(*b))),
            Value::Null => Some(Datum::Null),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Datum::Int64(v) => Some(Datum::Int64(-v)),
            Datum::Decimal(m, s) => Some(Datum::Decimal(-m, s)),
            Datum::Float64(v) => Some(Datum::Float64(-v)),
            _ => None,
        },
        Expr::Nested(inner) => literal(inner),
        _ => None,
    }
}

/// Split a predicate on its top-level `AND`s.
pub fn split_and(e: &Expr) -> Vec<Expr> {
    match e {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut v = split_and(left);
            v.extend(split_and(right));
            v
        }
        other => vec![other.clone()],
    }
}

/// Join conjuncts with `AND`, parenthesising any top-level `OR`.
pub fn and_all(conds: &[Expr]) -> Option<Expr> {
    let mut it = conds.iter().map(|c| match c {
        Expr::BinaryOp {
            op: BinaryOperator::Or | BinaryOperator::Xor,
            ..
        } => Expr::Nested(Box::new(c.clone())),
        other => other.clone(),
    });
    let first = it.next()?;
    Some(it.fold(first, |acc, e| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new(e),
    }))
}

pub fn cmp_op(op: &BinaryOperator) -> Option<CmpOp> {
    match op {
        BinaryOperator::Eq => Some(CmpOp::Eq),
        BinaryOperator::Lt => Some(CmpOp::Lt),
        BinaryOperator::LtEq => Some(CmpOp::Le),
        BinaryOperator::Gt => Some(CmpOp::Gt),
        BinaryOperator::GtEq => Some(CmpOp::Ge),
        BinaryOperator::NotEq => Some(CmpOp::Ne),
        BinaryOperator::Spaceship => Some(CmpOp::NullSafeEq),
        _ => None,
    }
}

/// Every column reference under `e`, subqueries included.
pub fn columns_in(e: &Expr) -> Vec<ColumnRef> {
    let mut out = Vec::new();
    let _ = ast::visit_expressions(e, |x: &Expr| {
        if matches!(x, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
            if let Some(c) = column_ref(x) {
                out.push(c);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    out
}

pub fn has_subquery(e: &Expr) -> bool {
    ast::visit_expressions(e, |x: &Expr| {
        if matches!(x, Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. }) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .is_break()
}

/// Whether `e` can never be true once every column it reads is NULL.
///
/// Only forms that propagate NULL are accepted; `IS NULL`, `COALESCE`,
/// `<=>` and anything else unknown count as NULL-tolerant.
pub fn rejects_null(e: &Expr) -> bool {
    match e {
        Expr::Nested(inner) => rejects_null(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => rejects_null(left) || rejects_null(right),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => rejects_null(left) && rejects_null(right),
        Expr::BinaryOp { left, op, right } if op != &BinaryOperator::Spaceship && cmp_op(op).is_some() => {
            propagates_null(left) && propagates_null(right) && (reads_column(left) || reads_column(right))
        }
        Expr::InList { expr, .. }
        | Expr::Between { expr, .. }
        | Expr::Like { expr, .. }
        | Expr::ILike { expr, .. }
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr) => propagates_null(expr) && reads_column(expr),
        _ => false,
    }
}

/// Columns, literals and arithmetic over them: NULL in, NULL out.
fn propagates_null(e: &Expr) -> bool {
    match e {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_) => true,
        Expr::Nested(inner) | Expr::UnaryOp { expr: inner, .. } => propagates_null(inner),
        Expr::BinaryOp { left, op, right } => {
            matches!(
                op,
                BinaryOperator::Plus
                    | BinaryOperator::Minus
                    | BinaryOperator::Multiply
                    | BinaryOperator::Divide
                    | BinaryOperator::Modulo
            ) && propagates_null(left)
                && propagates_null(right)
        }
        _ => false,
    }
}

fn reads_column(e: &Expr) -> bool {
    !columns_in(e).is_empty()
}

/// Aliases referenced by `e`. An unqualified column resolves to `only`
/// when given, otherwise it is an error.
pub fn tables_in(e: &Expr, aliases: &[String], only: Option<&str>) -> RadonResult<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for c in columns_in(e) {
        match (&c.qualifier, only) {
            (Some(q), _) => {
                let alias = aliases
                    .iter()
                    .find(|a| a.eq_ignore_ascii_case(q))
                    .ok_or_else(|| RadonError::Unsupported(format!("unknown.column.'{q}.{}'.in.clause", c.name)))?;
                out.insert(alias.clone());
            }
            (None, Some(t)) => {
                out.insert(t.to_string());
            }
            (None, None) => {
                return Err(RadonError::Unsupported(format!(
                    "column.'{}'.must.be.qualified.in.join",
                    c.name
                )));
            }
        }
    }
    Ok(out)
}

/// A top-level aggregate call: kind, `DISTINCT` flag and argument (`None` for `*`).
pub struct AggCall {
    pub kind: AggKind,
    pub distinct: bool,
    pub arg: Option<Expr>,
}

pub fn aggregate_call(e: &Expr) -> RadonResult<Option<AggCall>> {
    let func = match e {
        Expr::Function(f) => f,
        Expr::Nested(inner) => return aggregate_call(inner),
        _ => return Ok(None),
    };
    let Some(kind) = AggKind::from_name(&func.name.to_string()) else {
        return Ok(None);
    };
    if func.over.is_some() {
        return Err(RadonError::Unsupported("window functions".into()));
    }
    let ast::FunctionArguments::List(args) = &func.args else {
        return Err(RadonError::Unsupported(format!("aggregate {} without arguments", func.name)));
    };
    let distinct = args.duplicate_treatment == Some(ast::DuplicateTreatment::Distinct);
    if args.args.len() != 1 {
        return Err(RadonError::Unsupported(format!("aggregate {} takes one argument", func.name)));
    }
    let arg = match &args.args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => None,
        FunctionArg::Unnamed(FunctionArgExpr::Expr(x)) => Some(x.clone()),
        other => return Err(RadonError::Unsupported(format!("aggregate argument {other}"))),
    };
    if arg.is_none() && kind != AggKind::Count {
        return Err(RadonError::Parse(format!("{}(*) is not valid", func.name)));
    }
    Ok(Some(AggCall { kind, distinct, arg }))
}

pub fn contains_aggregate(e: &Expr) -> bool {
    ast::visit_expressions(e, |x: &Expr| match x {
        Expr::Function(f) if AggKind::from_name(&f.name.to_string()).is_some() => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    })
    .is_break()
}

/// A select-list entry reduced to its expression and output name.
#[derive(Debug, Clone)]
pub struct Item {
    pub expr: Expr,
    pub alias: Option<String>,
    /// Column name the client sees.
    pub name: String,
}

impl Item {
    /// Qualifier of a plain column item.
    pub fn qualifier(&self) -> Option<String> {
        column_ref(&self.expr).and_then(|c| c.qualifier)
    }
}

/// Flatten the projection; `None` when it contains a wildcard.
pub fn select_items(projection: &[SelectItem]) -> Option<Vec<Item>> {
    projection
        .iter()
        .map(|p| match p {
            SelectItem::UnnamedExpr(e) => Some(Item {
                name: match column_ref(e) {
                    Some(c) => c.name,
                    None => e.to_string(),
                },
                expr: e.clone(),
                alias: None,
            }),
            SelectItem::ExprWithAlias { expr, alias } => Some(Item {
                expr: expr.clone(),
                alias: Some(alias.value.clone()),
                name: alias.value.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Position of the select item an ORDER BY / GROUP BY expression refers to.
pub fn resolve_item(items: &[Item], e: &Expr) -> Option<usize> {
    if let Some(Datum::Int64(n)) = literal(e) {
        return usize::try_from(n).ok().filter(|n| *n >= 1 && *n <= items.len()).map(|n| n - 1);
    }
    if let Expr::Identifier(id) = e {
        if let Some(i) = items
            .iter()
            .position(|it| it.alias.as_deref().map_or(false, |a| a.eq_ignore_ascii_case(&id.value)))
        {
            return Some(i);
        }
    }
    let text = e.to_string();
    if let Some(i) = items.iter().position(|it| it.expr.to_string().eq_ignore_ascii_case(&text)) {
        return Some(i);
    }
    let want = column_ref(e)?;
    items.iter().position(|it| match column_ref(&it.expr) {
        Some(have) => {
            have.name.eq_ignore_ascii_case(&want.name)
                && match (&have.qualifier, &want.qualifier) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => true,
                }
        }
        None => false,
    })
}

pub fn number(n: usize) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

/// Unsigned integer of a LIMIT/OFFSET clause.
pub fn limit_value(e: &Expr) -> RadonResult<usize> {
    match literal(e) {
        Some(Datum::Int64(n)) if n >= 0 => Ok(n as usize),
        Some(Datum::UInt64(n)) => Ok(n as usize),
        _ => Err(RadonError::Unsupported(format!("limit value {e} must be a constant"))),
    }
}
