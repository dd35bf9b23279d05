use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Which users a `SELECT ... FROM users` returns.
#[derive(Debug, Clone, PartialEq)]
pub enum UserFilter {
    /// No WHERE clause: the session user.
    Me,
    Id(Ulid),
    Email(String),
}

/// Which bookings a `SELECT ... FROM bookings` returns.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingFilter {
    /// No WHERE clause: bookings the session user created or joined.
    Mine,
    Id(Ulid),
    Room(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertUser {
        id: Option<Ulid>,
        name: String,
        email: String,
        credential: String,
        system_admin: bool,
    },
    InsertRoom {
        id: Option<Ulid>,
        title: String,
        description: Option<String>,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertMember {
        room_id: Ulid,
        email: String,
        role: Role,
    },
    DeleteMember {
        room_id: Ulid,
        user_id: Ulid,
    },
    InsertBooking {
        id: Option<Ulid>,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        title: Option<String>,
        description: Option<String>,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertParticipant {
        booking_id: Ulid,
    },
    DeleteParticipant {
        booking_id: Ulid,
    },
    SelectUsers {
        filter: UserFilter,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    SelectMembers {
        room_id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectParticipants {
        booking_id: Ulid,
    },
    SelectConflicts {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
}

/// Column order for INSERTs that omit the column list.
const USER_COLUMNS: &[&str] = &["id", "name", "email", "credential", "system_admin"];
const ROOM_COLUMNS: &[&str] = &["id", "title", "description"];
const MEMBER_COLUMNS: &[&str] = &["room_id", "email", "role"];
const BOOKING_COLUMNS: &[&str] = &["id", "room_id", "start", "end", "title", "description"];
const PARTICIPANT_COLUMNS: &[&str] = &["booking_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

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

/// The table a SELECT reads from, without validating the rest of the statement.
/// Used to describe result columns before parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok(),
            _ => None,
        },
        _ => None,
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// Column name → value expression for one INSERT row or one UPDATE's SET list.
struct Fields<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Fields<'a> {
    fn from_row(
        table: &'static str,
        default_columns: &[&str],
        columns: &[Ident],
        row: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if row.len() > default_columns.len() {
                return Err(SqlError::WrongArity {
                    table,
                    expected: default_columns.len(),
                    got: row.len(),
                });
            }
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != row.len() {
                return Err(SqlError::WrongArity {
                    table,
                    expected: columns.len(),
                    got: row.len(),
                });
            }
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut values = HashMap::new();
        for (name, expr) in names.into_iter().zip(row) {
            if !default_columns.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn { table, column: name });
            }
            if values.insert(name.clone(), expr).is_some() {
                return Err(SqlError::Parse(format!("column {name} given twice")));
            }
        }
        Ok(Self { table, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }
}

/// Flatten `a = x AND b = y AND ...` into column → value. Anything else is rejected.
fn where_equalities(selection: &Option<Expr>) -> Result<HashMap<String, &Expr>, SqlError> {
    fn walk<'e>(expr: &'e Expr, out: &mut HashMap<String, &'e Expr>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!(
                "WHERE supports only `column = value` joined by AND, got {other}"
            ))),
        }
    }

    let mut out = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn reject_extra_filters(
    filters: &HashMap<String, &Expr>,
    allowed: &[&str],
) -> Result<(), SqlError> {
    match filters.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(col) => Err(SqlError::Unsupported(format!("filter on {col}"))),
        None => Ok(()),
    }
}

fn required_filter<'e>(
    filters: &HashMap<String, &'e Expr>,
    column: &'static str,
) -> Result<&'e Expr, SqlError> {
    filters
        .get(column)
        .copied()
        .ok_or(SqlError::MissingFilter(column))
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = extract_single_row(insert)?;
    let columns = &insert.columns;

    match table.as_str() {
        "users" => {
            let f = Fields::from_row("users", USER_COLUMNS, columns, row)?;
            Ok(Command::InsertUser {
                id: f.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
                name: parse_text(f.required("name")?)?,
                email: parse_text(f.required("email")?)?,
                credential: parse_text(f.required("credential")?)?,
                system_admin: f.get("system_admin").map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "rooms" => {
            let f = Fields::from_row("rooms", ROOM_COLUMNS, columns, row)?;
            Ok(Command::InsertRoom {
                id: f.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
                title: parse_text(f.required("title")?)?,
                description: f.get("description").map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "members" => {
            let f = Fields::from_row("members", MEMBER_COLUMNS, columns, row)?;
            Ok(Command::InsertMember {
                room_id: parse_ulid(f.required("room_id")?)?,
                email: parse_text(f.required("email")?)?,
                role: f.get("role").map(parse_role).transpose()?.unwrap_or(Role::User),
            })
        }
        "bookings" => {
            let f = Fields::from_row("bookings", BOOKING_COLUMNS, columns, row)?;
            Ok(Command::InsertBooking {
                id: f.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
                room_id: parse_ulid(f.required("room_id")?)?,
                start: parse_timestamp(f.required("start")?)?,
                end: parse_timestamp(f.required("end")?)?,
                title: f.get("title").map(parse_text_or_null).transpose()?.flatten(),
                description: f.get("description").map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "participants" => {
            let f = Fields::from_row("participants", PARTICIPANT_COLUMNS, columns, row)?;
            Ok(Command::InsertParticipant {
                booking_id: parse_ulid(f.required("booking_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let (static_table, allowed): (&'static str, &[&str]) = match table.as_str() {
        "rooms" => ("rooms", &["title", "description"]),
        "bookings" => ("bookings", &["start", "end", "title", "description"]),
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let mut columns = Vec::with_capacity(assignments.len());
    let mut row = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("SET {}", assignment.target)))?;
        columns.push(Ident::new(name));
        row.push(assignment.value.clone());
    }
    let f = Fields::from_row(static_table, allowed, &columns, &row)?;

    let filters = where_equalities(selection)?;
    reject_extra_filters(&filters, &["id"])?;
    let id = parse_ulid(required_filter(&filters, "id")?)?;

    match static_table {
        "rooms" => {
            let title = match f.get("title") {
                None => None,
                Some(expr) => Some(
                    parse_text_or_null(expr)?
                        .ok_or_else(|| SqlError::Parse("rooms.title cannot be NULL".into()))?,
                ),
            };
            Ok(Command::UpdateRoom {
                id,
                patch: RoomPatch {
                    title,
                    description: f.get("description").map(parse_text_or_null).transpose()?,
                },
            })
        }
        _ => Ok(Command::UpdateBooking {
            id,
            patch: BookingPatch {
                start: f.get("start").map(parse_timestamp).transpose()?,
                end: f.get("end").map(parse_timestamp).transpose()?,
                title: f.get("title").map(parse_text_or_null).transpose()?,
                description: f.get("description").map(parse_text_or_null).transpose()?,
            },
        }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(&delete.selection)?;

    match table.as_str() {
        "rooms" | "bookings" => {
            reject_extra_filters(&filters, &["id"])?;
            let id = parse_ulid(required_filter(&filters, "id")?)?;
            if table == "rooms" {
                Ok(Command::DeleteRoom { id })
            } else {
                Ok(Command::DeleteBooking { id })
            }
        }
        "members" => {
            reject_extra_filters(&filters, &["room_id", "user_id"])?;
            Ok(Command::DeleteMember {
                room_id: parse_ulid(required_filter(&filters, "room_id")?)?,
                user_id: parse_ulid(required_filter(&filters, "user_id")?)?,
            })
        }
        "participants" => {
            reject_extra_filters(&filters, &["booking_id"])?;
            Ok(Command::DeleteParticipant {
                booking_id: parse_ulid(required_filter(&filters, "booking_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_equalities(&select.selection)?;

    match table.as_str() {
        "users" => {
            reject_extra_filters(&filters, &["id", "email"])?;
            let filter = match (filters.get("id"), filters.get("email")) {
                (Some(id), None) => UserFilter::Id(parse_ulid(id)?),
                (None, Some(email)) => UserFilter::Email(parse_text(email)?),
                (None, None) => UserFilter::Me,
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("filter users by id or email, not both".into()));
                }
            };
            Ok(Command::SelectUsers { filter })
        }
        "rooms" => {
            reject_extra_filters(&filters, &["id"])?;
            Ok(Command::SelectRooms {
                id: filters.get("id").map(|e| parse_ulid(e)).transpose()?,
            })
        }
        "members" => {
            reject_extra_filters(&filters, &["room_id"])?;
            Ok(Command::SelectMembers {
                room_id: parse_ulid(required_filter(&filters, "room_id")?)?,
            })
        }
        "bookings" => {
            reject_extra_filters(&filters, &["id", "room_id"])?;
            let filter = match (filters.get("id"), filters.get("room_id")) {
                (Some(id), None) => BookingFilter::Id(parse_ulid(id)?),
                (None, Some(room_id)) => BookingFilter::Room(parse_ulid(room_id)?),
                (None, None) => BookingFilter::Mine,
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "filter bookings by id or room_id, not both".into(),
                    ));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "participants" => {
            reject_extra_filters(&filters, &["booking_id"])?;
            Ok(Command::SelectParticipants {
                booking_id: parse_ulid(required_filter(&filters, "booking_id")?)?,
            })
        }
        "conflicts" => {
            reject_extra_filters(&filters, &["room_id", "start", "end", "exclude"])?;
            Ok(Command::SelectConflicts {
                room_id: parse_ulid(required_filter(&filters, "room_id")?)?,
                start: parse_timestamp(required_filter(&filters, "start")?)?,
                end: parse_timestamp(required_filter(&filters, "end")?)?,
                exclude: filters
                    .get("exclude")
                    .map(|e| parse_ulid_or_null(e))
                    .transpose()?
                    .flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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

/// Exactly one VALUES row; every write is a single logical operation.
fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            rows => Err(SqlError::Unsupported(format!(
                "multi-row INSERT ({} rows)",
                rows.len()
            ))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
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
        Expr::Nested(inner) => extract_value(inner),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64_expr(expr)?;
        return v
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: -({v})")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Parse an instant as Unix milliseconds.
///
/// Accepts integer milliseconds, RFC 3339 (`2024-05-01T09:00:00Z`, any offset), or an
/// offset-less ISO-8601 date-time, which is read as UTC.
pub fn parse_instant(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(SqlError::Parse(format!("bad timestamp {s:?}")))
}

fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_instant(s),
        _ => parse_i64_expr(expr),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    if is_null(expr) {
        return Ok(Role::User);
    }
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long: {0} bytes")]
    TooLong(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{table}: expected {expected} values, got {got}")]
    WrongArity {
        table: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{table}: missing column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
