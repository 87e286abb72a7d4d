use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetAvailability {
        window: AvailabilityWindow,
    },
    DefineService {
        service: ServiceDefinition,
    },
    DefineFormTemplate {
        template: FormTemplate,
    },
    UpsertContact {
        contact: Contact,
    },
    SetPause {
        contact_id: Ulid,
        paused: bool,
    },
    UpdateSettings {
        settings: TenantSettings,
    },
    InsertBooking {
        id: Ulid,
        contact_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    },
    RescheduleBooking {
        id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    InsertForm {
        id: Ulid,
        contact_id: Ulid,
        due_at: NaiveDateTime,
        max_reminders: Option<u32>,
    },
    CompleteForm {
        id: Ulid,
    },
    SelectSlots {
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectSlotCheck {
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
    },
    SelectBookings {
        date: NaiveDate,
    },
    SelectForms {
        booking_id: Ulid,
    },
}

/// Parse a simple-protocol query string. Every statement is translated
/// before any of them runs, so one bad statement rejects the whole batch.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

/// Parse exactly one statement, as the extended protocol requires.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::MultipleStatements(commands.len()));
    }
    commands.pop().ok_or(SqlError::Empty)
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "availability" => {
            arity(3)?;
            let slot_minutes = match values.get(3) {
                Some(v) => parse_u32_or_null(v)?.unwrap_or(DEFAULT_SLOT_MINUTES),
                None => DEFAULT_SLOT_MINUTES,
            };
            let day_of_week = parse_u32(&values[0])?;
            Ok(Command::SetAvailability {
                window: AvailabilityWindow {
                    day_of_week: u8::try_from(day_of_week)
                        .map_err(|_| SqlError::Parse(format!("{day_of_week} out of range")))?,
                    is_open: parse_bool(&values[1])?,
                    intervals: parse_intervals(&parse_string(&values[2])?)?,
                    slot_minutes,
                },
            })
        }
        "services" => {
            arity(3)?;
            Ok(Command::DefineService {
                service: ServiceDefinition {
                    id: parse_ulid(&values[0])?,
                    name: parse_string(&values[1])?,
                    duration_minutes: parse_u32(&values[2])?,
                    buffer_minutes: match values.get(3) {
                        Some(v) => parse_u32_or_null(v)?.unwrap_or(0),
                        None => 0,
                    },
                },
            })
        }
        "form_templates" => {
            arity(4)?;
            Ok(Command::DefineFormTemplate {
                template: FormTemplate {
                    id: parse_ulid(&values[0])?,
                    service_id: parse_ulid(&values[1])?,
                    name: parse_string(&values[2])?,
                    due_in_hours: parse_u32(&values[3])?,
                    active: match values.get(4) {
                        Some(v) => parse_bool(v)?,
                        None => true,
                    },
                },
            })
        }
        "contacts" => {
            arity(1)?;
            let optional = |i: usize| match values.get(i) {
                Some(v) => parse_string_or_null(v),
                None => Ok(None),
            };
            Ok(Command::UpsertContact {
                contact: Contact {
                    id: parse_ulid(&values[0])?,
                    name: optional(1)?,
                    email: optional(2)?,
                },
            })
        }
        "pauses" => {
            arity(2)?;
            Ok(Command::SetPause {
                contact_id: parse_ulid(&values[0])?,
                paused: parse_bool(&values[1])?,
            })
        }
        "settings" => {
            arity(2)?;
            // Missing or NULL automation fields mean "use the default".
            let tuning = |i: usize| -> Result<u32, SqlError> {
                match values.get(i) {
                    Some(v) => Ok(parse_u32_or_null(v)?.unwrap_or(0)),
                    None => Ok(0),
                }
            };
            Ok(Command::UpdateSettings {
                settings: TenantSettings {
                    active: parse_bool(&values[0])?,
                    email_channel: parse_bool(&values[1])?,
                    automation: AutomationConfig {
                        booking_reminder_lead_minutes: tuning(2)?,
                        form_reminder_cooldown_hours: tuning(3)?,
                        form_reminder_max: tuning(4)?,
                    },
                },
            })
        }
        "bookings" => {
            arity(5)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                contact_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                start: parse_time(&values[4])?,
            })
        }
        "reschedules" => {
            arity(3)?;
            Ok(Command::RescheduleBooking {
                id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                start: parse_time(&values[2])?,
            })
        }
        "booking_status" => {
            arity(2)?;
            Ok(Command::SetBookingStatus {
                id: parse_ulid(&values[0])?,
                status: parse_string(&values[1])?.parse().map_err(SqlError::Parse)?,
            })
        }
        "forms" => {
            arity(3)?;
            Ok(Command::InsertForm {
                id: parse_ulid(&values[0])?,
                contact_id: parse_ulid(&values[1])?,
                due_at: parse_datetime(&values[2])?,
                max_reminders: match values.get(3) {
                    Some(v) => parse_u32_or_null(v)?,
                    None => None,
                },
            })
        }
        "form_completions" => {
            arity(1)?;
            Ok(Command::CompleteForm {
                id: parse_ulid(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters from a WHERE clause of `col = value` terms joined by AND.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) {
        if let Expr::BinaryOp { left, op, right } = expr {
            match op {
                ast::BinaryOperator::And => {
                    self.collect(left);
                    self.collect(right);
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        self.terms.push((col, right));
                    }
                }
                _ => {}
            }
        }
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.terms.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection);
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            service_id: parse_ulid(filters.require("service_id")?)?,
            date: parse_date(filters.require("date")?)?,
        }),
        "slot_check" => {
            let start = parse_time(filters.require("start_time")?)?;
            let end = parse_time(filters.require("end_time")?)?;
            let span = Span::between(start, end)
                .ok_or_else(|| SqlError::Parse(format!("end_time {end} must be after start_time {start}")))?;
            let exclude = match filters.get("exclude_id") {
                Some(e) => parse_ulid_or_null(e)?,
                None => None,
            };
            Ok(Command::SelectSlotCheck {
                date: parse_date(filters.require("date")?)?,
                span,
                exclude,
            })
        }
        "bookings" => Ok(Command::SelectBookings {
            date: parse_date(filters.require("date")?)?,
        }),
        "forms" => Ok(Command::SelectForms {
            booking_id: parse_ulid(filters.require("booking_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "availability" => "availability",
        "services" => "services",
        "form_templates" => "form_templates",
        "contacts" => "contacts",
        "pauses" => "pauses",
        "settings" => "settings",
        "bookings" => "bookings",
        "reschedules" => "reschedules",
        "booking_status" => "booking_status",
        "forms" => "forms",
        "form_completions" => "form_completions",
        _ => "table",
    }
}

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

/// First VALUES row. Multi-row inserts are not supported.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    s.parse().map_err(|e: TimeParseError| SqlError::Parse(e.to_string()))
}

const DATETIME_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string(expr)?;
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s.trim(), f).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")))
}

/// `'09:00-12:00,13:00-17:00'`. An empty string means no intervals.
fn parse_intervals(s: &str) -> Result<Vec<Span>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| SqlError::Parse(format!("bad interval {part:?}")))?;
            let start: TimeOfDay = start.parse().map_err(|e: TimeParseError| SqlError::Parse(e.to_string()))?;
            let end: TimeOfDay = end.parse().map_err(|e: TimeParseError| SqlError::Parse(e.to_string()))?;
            Span::between(start, end).ok_or_else(|| SqlError::Parse(format!("interval {part:?} ends before it starts")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("expected one statement, got {0}")]
    MultipleStatements(usize),
}
