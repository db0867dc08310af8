use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;
use crate::timestamp::parse_timestamp;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        name: String,
        capacity: u32,
        returning: bool,
    },
    UpdateSpace {
        id: SpaceId,
        name: Option<String>,
        capacity: Option<u32>,
    },
    DeleteSpace {
        id: SpaceId,
    },
    InsertReservation {
        space_id: SpaceId,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    UpdateReservation {
        id: ReservationId,
        start: Ms,
        end: Ms,
    },
    DeleteReservation {
        id: ReservationId,
    },
    SelectSpaces {
        id: Option<SpaceId>,
    },
    SelectReservations {
        id: Option<ReservationId>,
        space_id: Option<SpaceId>,
    },
    /// Reservations on a space intersecting `[start, end]`, optionally
    /// leaving one reservation out (`id <> n`).
    SelectConflicts {
        space_id: SpaceId,
        start: Ms,
        end: Ms,
        exclude: Option<ReservationId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Spaces,
    Reservations,
    Conflicts,
}

impl Table {
    fn from_name(name: String) -> Result<Self, SqlError> {
        match name.as_str() {
            "spaces" => Ok(Table::Spaces),
            "reservations" => Ok(Table::Reservations),
            "conflicts" => Ok(Table::Conflicts),
            _ => Err(SqlError::UnknownTable(name)),
        }
    }

    /// Canonical column name, folding the `start`/`end` aliases.
    fn column(self, name: &str) -> Result<&'static str, SqlError> {
        let col = match (self, name) {
            (_, "id") => "id",
            (Table::Spaces, "name") => "name",
            (Table::Spaces, "capacity") => "capacity",
            (Table::Reservations | Table::Conflicts, "space_id") => "space_id",
            (Table::Reservations | Table::Conflicts, "start_time" | "start") => "start_time",
            (Table::Reservations | Table::Conflicts, "end_time" | "end") => "end_time",
            _ => return Err(SqlError::UnknownColumn(name.to_string())),
        };
        Ok(col)
    }

    /// Column order for `INSERT` without a column list.
    fn insert_columns(self) -> &'static [&'static str] {
        match self {
            Table::Spaces => &["name", "capacity"],
            Table::Reservations | Table::Conflicts => &["space_id", "start_time", "end_time"],
        }
    }
}

/// Parse every statement in `sql`. The simple query protocol may carry
/// several separated by semicolons.
pub fn parse_sql(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

/// Parse exactly one statement, as the extended protocol requires.
pub fn parse_single(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_sql(sql)?;
    if commands.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements in one prepared query",
            commands.len()
        )));
    }
    Ok(commands.remove(0))
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(insert_table_name(insert)?)?;
    let returning = insert.returning.is_some();
    let fields = insert_fields(table, insert)?;

    match table {
        Table::Spaces => Ok(Command::InsertSpace {
            name: parse_string(required(&fields, "name")?)?,
            capacity: parse_u32(required(&fields, "capacity")?)?,
            returning,
        }),
        Table::Reservations => Ok(Command::InsertReservation {
            space_id: parse_i64(required(&fields, "space_id")?)?,
            start: parse_time(required(&fields, "start_time")?)?,
            end: parse_time(required(&fields, "end_time")?)?,
            returning,
        }),
        Table::Conflicts => Err(SqlError::ReadOnly("conflicts")),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(table_factor_name(relation)?)?;
    if table == Table::Conflicts {
        return Err(SqlError::ReadOnly("conflicts"));
    }
    let id = extract_where_id(selection)?;

    let mut fields = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        fields.push((table.column(&name)?, &assignment.value));
    }

    match table {
        Table::Spaces => {
            if lookup(&fields, "id").is_some() {
                return Err(SqlError::Unsupported("changing a space id".into()));
            }
            let name = lookup(&fields, "name").map(parse_string).transpose()?;
            let capacity = lookup(&fields, "capacity").map(parse_u32).transpose()?;
            Ok(Command::UpdateSpace { id, name, capacity })
        }
        Table::Reservations => {
            if lookup(&fields, "id").is_some() || lookup(&fields, "space_id").is_some() {
                return Err(SqlError::Unsupported(
                    "only start_time and end_time of a reservation can change".into(),
                ));
            }
            Ok(Command::UpdateReservation {
                id,
                start: parse_time(required(&fields, "start_time")?)?,
                end: parse_time(required(&fields, "end_time")?)?,
            })
        }
        Table::Conflicts => Err(SqlError::ReadOnly("conflicts")),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Spaces => Ok(Command::DeleteSpace { id }),
        Table::Reservations => Ok(Command::DeleteReservation { id }),
        Table::Conflicts => Err(SqlError::ReadOnly("conflicts")),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = Table::from_name(table_factor_name(&select.from[0].relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table {
        Table::Spaces => {
            let mut id = None;
            for filter in &filters {
                match (table.column(&filter.column)?, filter.op) {
                    ("id", FilterOp::Eq) => id = Some(parse_i64(filter.value)?),
                    _ => return Err(filter.unsupported()),
                }
            }
            Ok(Command::SelectSpaces { id })
        }
        Table::Reservations => {
            let (mut id, mut space_id) = (None, None);
            for filter in &filters {
                match (table.column(&filter.column)?, filter.op) {
                    ("id", FilterOp::Eq) => id = Some(parse_i64(filter.value)?),
                    ("space_id", FilterOp::Eq) => space_id = Some(parse_i64(filter.value)?),
                    _ => return Err(filter.unsupported()),
                }
            }
            Ok(Command::SelectReservations { id, space_id })
        }
        Table::Conflicts => {
            let (mut space_id, mut start, mut end, mut exclude) = (None, None, None, None);
            for filter in &filters {
                match (table.column(&filter.column)?, filter.op) {
                    ("space_id", FilterOp::Eq) => space_id = Some(parse_i64(filter.value)?),
                    ("start_time", FilterOp::Eq | FilterOp::GtEq) => {
                        start = Some(parse_time(filter.value)?)
                    }
                    ("end_time", FilterOp::Eq | FilterOp::LtEq) => {
                        end = Some(parse_time(filter.value)?)
                    }
                    ("id", FilterOp::NotEq) => exclude = Some(parse_i64(filter.value)?),
                    _ => return Err(filter.unsupported()),
                }
            }
            Ok(Command::SelectConflicts {
                space_id: space_id.ok_or(SqlError::MissingFilter("space_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start_time"))?,
                end: end.ok_or(SqlError::MissingFilter("end_time"))?,
                exclude,
            })
        }
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    NotEq,
    GtEq,
    LtEq,
}

struct Filter<'a> {
    column: String,
    op: FilterOp,
    value: &'a Expr,
}

impl Filter<'_> {
    fn unsupported(&self) -> SqlError {
        SqlError::Unsupported(format!("filter {} {:?}", self.column, self.op))
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::NotEq => FilterOp::NotEq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("comparison on {left}")))?;
            out.push(Filter { column, op, value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_filters(sel, &mut filters)?;
    match filters.as_slice() {
        [Filter { column, op: FilterOp::Eq, value }] if column == "id" => parse_i64(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

// ── INSERT helpers ────────────────────────────────────────────

type Fields<'a> = Vec<(&'static str, &'a Expr)>;

/// Pair each VALUES entry with its canonical column, by column list or position.
fn insert_fields(table: Table, insert: &ast::Insert) -> Result<Fields<'_>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    if insert.columns.is_empty() {
        let columns = table.insert_columns();
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(columns.len(), row.len()));
        }
        return Ok(columns.iter().copied().zip(row.iter()).collect());
    }

    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), row.len()));
    }
    insert
        .columns
        .iter()
        .zip(row.iter())
        .map(|(ident, value)| Ok((table.column(&ident.value.to_lowercase())?, value)))
        .collect()
}

fn lookup<'a>(fields: &Fields<'a>, column: &str) -> Option<&'a Expr> {
    fields.iter().find(|(c, _)| *c == column).map(|(_, v)| *v)
}

fn required<'a>(fields: &Fields<'a>, column: &'static str) -> Result<&'a Expr, SqlError> {
    lookup(fields, column).ok_or(SqlError::MissingValue(column))
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal value, looking through `'...'::type` casts.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::BadValue(format!("expected string, got {other}"))),
        None => Err(SqlError::BadValue(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64(expr)?;
        return v
            .checked_neg()
            .ok_or_else(|| SqlError::BadValue(format!("-({v}) out of range")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::BadValue(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::BadValue(format!("expected number, got {other}"))),
        None => Err(SqlError::BadValue(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::BadValue(format!("{v} out of range")))
}

/// A timestamp: ISO-8601 text, or an integer count of Unix milliseconds.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Ok(ms);
            }
            parse_timestamp(s).ok_or_else(|| SqlError::BadTimestamp(s.clone()))
        }
        _ => parse_i64(expr),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("table {0} is read-only")]
    ReadOnly(&'static str),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing value for column {0}")]
    MissingValue(&'static str),
    #[error("invalid value: {0}")]
    BadValue(String),
    #[error("invalid timestamp: {0:?}")]
    BadTimestamp(String),
}

impl SqlError {
    /// Malformed literals are argument errors; everything else is syntax.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::BadValue(_) | SqlError::BadTimestamp(_) => "22023",
            _ => "42601",
        }
    }
}
