use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::RateQuote;
use crate::engine::ShippingSelection;
use crate::limits::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Ulid,
        date: NaiveDate,
        time_window: String,
        capacity: Option<u32>,
    },
    DeleteSlot {
        id: Ulid,
    },
    SelectSlots {
        date: Option<NaiveDate>,
    },
    Reserve {
        id: Ulid,
        date: NaiveDate,
        time_window: String,
        hold_seconds: Option<u64>,
        shipping: Option<ShippingSelection>,
    },
    Confirm {
        reservation_id: Ulid,
        order_id: String,
    },
    Release {
        id: Ulid,
    },
    /// `DELETE FROM expired_reservations`: run the sweep now.
    ReleaseExpired,
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectDeliveryDates {
        date: Option<NaiveDate>,
    },
    SelectShipDate {
        delivery_date: NaiveDate,
        transit_days: u32,
    },
    SelectQualifyingRates {
        delivery_date: NaiveDate,
        rates: Vec<RateQuote>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    Slot(Ulid),
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

// ── INSERT ────────────────────────────────────────────────────

const SLOT_COLUMNS: &[&str] = &["id", "date", "time_window", "capacity"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "date",
    "time_window",
    "hold_seconds",
    "carrier",
    "service",
    "rate_id",
    "transit_days",
];
const CONFIRMATION_COLUMNS: &[&str] = &["reservation_id", "order_id"];

/// One VALUES row keyed by column name. Without a column list the values are
/// taken in the table's declared order.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn new(table: &'static str, insert: &ast::Insert, declared: &[&str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if !insert.columns.is_empty() && values.len() != names.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !declared.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values).collect(),
        })
    }

    /// The cell for `column`, with SQL NULL read as absent.
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
            .filter(|expr| !matches!(extract_value(expr), Some(Value::Null)))
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingValue(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "slots" => {
            let row = Row::new("slots", insert, SLOT_COLUMNS)?;
            Ok(Command::InsertSlot {
                id: parse_ulid_expr(row.require("id")?)?,
                date: parse_date_expr(row.require("date")?)?,
                time_window: parse_string_expr(row.require("time_window")?)?,
                capacity: row.get("capacity").map(parse_u32).transpose()?,
            })
        }
        "reservations" => {
            let row = Row::new("reservations", insert, RESERVATION_COLUMNS)?;
            Ok(Command::Reserve {
                id: parse_ulid_expr(row.require("id")?)?,
                date: parse_date_expr(row.require("date")?)?,
                time_window: parse_string_expr(row.require("time_window")?)?,
                hold_seconds: row.get("hold_seconds").map(parse_u64).transpose()?,
                shipping: parse_shipping(&row)?,
            })
        }
        "confirmations" => {
            let row = Row::new("confirmations", insert, CONFIRMATION_COLUMNS)?;
            Ok(Command::Confirm {
                reservation_id: parse_ulid_expr(row.require("reservation_id")?)?,
                order_id: parse_string_expr(row.require("order_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Shipping columns are all-or-nothing: once any is given, `service` and
/// `rate_id` must be too.
fn parse_shipping(row: &Row) -> Result<Option<ShippingSelection>, SqlError> {
    let given = ["carrier", "service", "rate_id", "transit_days"]
        .iter()
        .any(|c| row.get(c).is_some());
    if !given {
        return Ok(None);
    }
    Ok(Some(ShippingSelection {
        carrier: row.get("carrier").map(parse_string_expr).transpose()?,
        service: parse_string_expr(row.require("service")?)?,
        rate_id: parse_string_expr(row.require("rate_id")?)?,
        transit_days: row.get("transit_days").map(parse_u32).transpose()?,
    }))
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot {
            id: extract_where_id(&delete.selection)?,
        }),
        "reservations" => Ok(Command::Release {
            id: extract_where_id(&delete.selection)?,
        }),
        "expired_reservations" => {
            if delete.selection.is_some() {
                return Err(SqlError::Unsupported("expired_reservations takes no filter".into()));
            }
            Ok(Command::ReleaseExpired)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(name, _)| name == col).map(|(_, e)| e);

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: filter("date").map(parse_date_expr).transpose()?,
        }),
        "reservations" => {
            let filter = match (filter("id"), filter("slot_id")) {
                (Some(id), _) => ReservationFilter::Id(parse_ulid_expr(id)?),
                (None, Some(slot)) => ReservationFilter::Slot(parse_ulid_expr(slot)?),
                (None, None) => ReservationFilter::All,
            };
            Ok(Command::SelectReservations { filter })
        }
        "delivery_dates" => Ok(Command::SelectDeliveryDates {
            date: filter("date").map(parse_date_expr).transpose()?,
        }),
        "ship_dates" => Ok(Command::SelectShipDate {
            delivery_date: parse_date_expr(filter("delivery_date").ok_or(SqlError::MissingFilter("delivery_date"))?)?,
            transit_days: parse_u32(filter("transit_days").ok_or(SqlError::MissingFilter("transit_days"))?)?,
        }),
        "qualifying_rates" => Ok(Command::SelectQualifyingRates {
            delivery_date: parse_date_expr(filter("delivery_date").ok_or(SqlError::MissingFilter("delivery_date"))?)?,
            rates: parse_rates_expr(filter("rates").ok_or(SqlError::MissingFilter("rates"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn parse_rates_expr(expr: &Expr) -> Result<Vec<RateQuote>, SqlError> {
    let json = parse_string_expr(expr)?;
    if json.len() > MAX_RATES_JSON_LEN {
        return Err(SqlError::Limit("rates payload too large"));
    }
    let rates: Vec<RateQuote> =
        serde_json::from_str(&json).map_err(|e| SqlError::Parse(format!("bad rates JSON: {e}")))?;
    if rates.len() > MAX_RATES_PER_QUERY {
        return Err(SqlError::Limit("too many rates in one query"));
    }
    Ok(rates)
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::DollarQuotedString(s)) => Ok(s.value.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (want YYYY-MM-DD): {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str, &'static str),
    Limit(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::Limit(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
