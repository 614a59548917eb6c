use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetSchedule {
        owner: String,
        days: Vec<(Weekday, DayWindow)>,
    },
    ClearSchedule {
        owner: String,
    },
    SelectSchedule {
        owner: String,
    },
    InsertMember {
        owner: String,
        identity: CalendarId,
    },
    DeleteMember {
        owner: String,
        identity: CalendarId,
    },
    SelectMembers {
        owner: String,
    },
    InsertRequest {
        id: Ulid,
        owner: String,
        start: Ms,
        end: Ms,
        guest: Guest,
    },
    ApproveRequest {
        id: Ulid,
    },
    DeclineRequest {
        id: Ulid,
    },
    SelectRequests {
        owner: String,
    },
    SelectSlots {
        owner: String,
        date: NaiveDate,
    },
    SetCredential {
        identity: CalendarId,
        token: String,
    },
    DeleteCredential {
        identity: CalendarId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    if table != "schedules" && rows.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}: send one row per statement"
        )));
    }
    let values = &rows[0];

    match table.as_str() {
        "schedules" => {
            let mut owner: Option<String> = None;
            let mut days = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 5 {
                    return Err(SqlError::WrongArity("schedules", 5, row.len()));
                }
                let row_owner = parse_string(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                match &owner {
                    Some(o) if *o != row_owner => {
                        return Err(SqlError::Parse("all schedule rows must share one owner".into()));
                    }
                    Some(_) => {}
                    None => owner = Some(row_owner),
                }
                let weekday = parse_weekday(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                let active = parse_bool(&row[2]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                let start = parse_time(&row[3]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                let end = parse_time(&row[4]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                days.push((weekday, DayWindow { active, start, end }));
            }
            Ok(Command::SetSchedule {
                owner: owner.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
                days,
            })
        }
        "members" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("members", 2, values.len()));
            }
            Ok(Command::InsertMember {
                owner: parse_string(&values[0])?,
                identity: CalendarId::new(parse_string(&values[1])?),
            })
        }
        "requests" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("requests", 6, values.len()));
            }
            let note = match values.get(6) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertRequest {
                id: parse_ulid(&values[0])?,
                owner: parse_string(&values[1])?,
                start: parse_instant(&values[2])?,
                end: parse_instant(&values[3])?,
                guest: Guest {
                    name: parse_string(&values[4])?,
                    email: parse_string(&values[5])?,
                    note,
                },
            })
        }
        "approvals" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("approvals", 1, 0));
            }
            Ok(Command::ApproveRequest {
                id: parse_ulid(&values[0])?,
            })
        }
        "credentials" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("credentials", 2, values.len()));
            }
            Ok(Command::SetCredential {
                identity: CalendarId::new(parse_string(&values[0])?),
                token: parse_string(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "schedules" => Ok(Command::ClearSchedule {
            owner: required_string(&filters, "owner")?,
        }),
        "members" => Ok(Command::DeleteMember {
            owner: required_string(&filters, "owner")?,
            identity: CalendarId::new(required_string(&filters, "identity")?),
        }),
        "requests" => Ok(Command::DeclineRequest {
            id: parse_ulid(filters.get("id").ok_or(SqlError::MissingFilter("id"))?)?,
        }),
        "credentials" => Ok(Command::DeleteCredential {
            identity: CalendarId::new(required_string(&filters, "identity")?),
        }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "schedules" => Ok(Command::SelectSchedule {
            owner: required_string(&filters, "owner")?,
        }),
        "members" => Ok(Command::SelectMembers {
            owner: required_string(&filters, "owner")?,
        }),
        "requests" => Ok(Command::SelectRequests {
            owner: required_string(&filters, "owner")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            owner: required_string(&filters, "owner")?,
            date: parse_date(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters joined by AND, keyed by lowercase column name.
fn where_filters(selection: &Option<Expr>) -> Result<HashMap<String, &Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_filters<'a>(expr: &'a Expr, filters: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, filters)?;
                collect_eq_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                filters.insert(col, right.as_ref());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, filters)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn required_string(filters: &HashMap<String, &Expr>, col: &'static str) -> Result<String, SqlError> {
    let expr = filters.get(col).ok_or(SqlError::MissingFilter(col))?;
    parse_string(expr)
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
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

/// Weekday name (`monday`, `mon`) or number with Sunday = 0.
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s
            .parse::<Weekday>()
            .map_err(|_| SqlError::Parse(format!("bad weekday: {s}"))),
        Some(Value::Number(_, _)) => {
            let n = parse_i64(expr)?;
            usize::try_from(n)
                .ok()
                .and_then(|i| WEEKDAYS.get(i).copied())
                .ok_or_else(|| SqlError::Parse(format!("weekday {n} out of range 0-6")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected weekday, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_time(expr: &Expr) -> Result<chrono::NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    parse_time_of_day(&s).ok_or_else(|| SqlError::Parse(format!("bad time of day: {s}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
