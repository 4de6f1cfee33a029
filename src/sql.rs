use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Day;

/// Parsed command from SQL input. Week numbers and slots are carried as
/// written; range checks belong to the caller.
#[derive(Debug, PartialEq)]
pub enum Command {
    Place {
        week: i64,
        course: String,
        day: Day,
        slot: i64,
    },
    Move {
        week: i64,
        id: Ulid,
        day: Day,
        slot: i64,
    },
    Delete {
        week: i64,
        id: Ulid,
    },
    SelectReservations {
        week: i64,
    },
    SelectSlots,
    SelectCourses,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported(format!("{} statements in one query", stmts.len()))),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "reservations" => {
            let [week, course, day, slot] = insert_fields(insert, "reservations", ["week", "course", "day", "slot"])?;
            Ok(Command::Place {
                week: parse_i64_expr(&week)?,
                course: parse_string_expr(&course)?,
                day: parse_day_expr(&day)?,
                slot: parse_i64_expr(&slot)?,
            })
        }
        "moves" => {
            let [week, id, day, slot] = insert_fields(insert, "moves", ["week", "id", "day", "slot"])?;
            Ok(Command::Move {
                week: parse_i64_expr(&week)?,
                id: parse_ulid_expr(&id)?,
                day: parse_day_expr(&day)?,
                slot: parse_i64_expr(&slot)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let filters = eq_filters(delete.selection.as_ref(), &["week", "id"])?;
    let week = filters.get("week").ok_or(SqlError::MissingFilter("week"))?;
    let id = filters.get("id").ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::Delete {
        week: parse_i64_expr(week)?,
        id: parse_ulid_expr(id)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "reservations" => {
            let filters = eq_filters(select.selection.as_ref(), &["week"])?;
            let week = filters.get("week").ok_or(SqlError::MissingFilter("week"))?;
            Ok(Command::SelectReservations { week: parse_i64_expr(week)? })
        }
        "slots" => Ok(Command::SelectSlots),
        "courses" => Ok(Command::SelectCourses),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of an AND chain, by lowercase column name. Any other
/// predicate shape, a column outside `allowed`, or a repeated column is
/// rejected rather than ignored.
fn eq_filters<'a>(selection: Option<&'a Expr>, allowed: &[&str]) -> Result<HashMap<String, &'a Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, allowed, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_filters<'a>(
    expr: &'a Expr,
    allowed: &[&str],
    filters: &mut HashMap<String, &'a Expr>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, allowed, filters)?;
            collect_eq_filters(right, allowed, filters)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            if !allowed.contains(&col.as_str()) {
                return Err(SqlError::Unsupported(format!("filter on column {col}")));
            }
            if filters.insert(col.clone(), right.as_ref()).is_some() {
                return Err(SqlError::Unsupported(format!("repeated filter on {col}")));
            }
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, allowed, filters),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Values of the single VALUES row, ordered as `names`. With a column list the
/// values are matched by name, otherwise by position.
fn insert_fields<const N: usize>(
    insert: &ast::Insert,
    table: &'static str,
    names: [&'static str; N],
) -> Result<[Expr; N], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if row.len() != N {
        return Err(SqlError::WrongArity(table, N, row.len()));
    }
    if insert.columns.is_empty() {
        return row
            .clone()
            .try_into()
            .map_err(|_| SqlError::WrongArity(table, N, row.len()));
    }
    if insert.columns.len() != N {
        return Err(SqlError::WrongArity(table, N, insert.columns.len()));
    }

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let mut fields = Vec::with_capacity(N);
    for name in names {
        let pos = columns
            .iter()
            .position(|c| c == name)
            .ok_or(SqlError::MissingColumn(table, name))?;
        fields.push(row[pos].clone());
    }
    fields.try_into().map_err(|_| SqlError::WrongArity(table, N, row.len()))
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Exact, case-sensitive day label (`'Mon'` .. `'Fri'`).
fn parse_day_expr(expr: &Expr) -> Result<Day, SqlError> {
    let s = parse_string_expr(expr)?;
    Day::from_exact(&s).ok_or(SqlError::BadDay(s))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer overflow".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    BadDay(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadDay(s) => write!(f, "bad day {s:?}, expected one of Mon Tue Wed Thu Fri"),
        }
    }
}

impl std::error::Error for SqlError {}
