use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FunctionArg, FunctionArgExpr, ObjectNamePart, SetExpr, Statement, TableFactor, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{Action, BookingUpdate, NewBooking};
use crate::model::Ms;
use crate::time::parse_instant;

/// Time filter on a read: one local calendar day, or `[start, end)` by start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Day(NaiveDate),
    Range { start: Ms, end: Ms },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateBooking(NewBooking),
    UpdateBooking(BookingUpdate),
    Transition {
        booking_id: Ulid,
        action: Action,
    },
    DeleteBooking {
        booking_id: Ulid,
    },
    CreateUnavailability {
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    },
    DeleteUnavailability {
        block_id: Ulid,
    },
    CreateBarber {
        name: String,
        is_active: bool,
    },
    SetBarberActive {
        barber_id: Ulid,
        is_active: bool,
    },
    DeleteBarber {
        barber_id: Ulid,
    },
    DeleteService {
        service_id: Ulid,
    },
    CreateService {
        name: String,
        duration_minutes: u32,
        price: Decimal,
    },
    UpdateService {
        service_id: Ulid,
        name: String,
        duration_minutes: u32,
        price: Decimal,
        is_active: bool,
    },
    UpdateSettings {
        opening_time: NaiveTime,
        closing_time: NaiveTime,
        slot_interval: u32,
    },
    CheckConflict {
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectBarbers {
        active_only: bool,
    },
    SelectBookings {
        window: Window,
        barber_id: Option<Ulid>,
    },
    SelectUnavailability {
        window: Window,
        barber_id: Option<Ulid>,
    },
    SelectServices {
        active_only: bool,
    },
    SelectSettings,
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(rest) = trimmed
        .get(..7)
        .filter(|head| head.eq_ignore_ascii_case("LISTEN "))
        .and_then(|_| trimmed.get(7..))
    {
        let channel = rest.trim().trim_matches(';').trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.first() {
        None => Err(SqlError::Empty),
        Some(Statement::Query(query)) => parse_select(query),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Lower-cased table or procedure name a statement reads from, without
/// binding its arguments. Used to describe result columns for prepared
/// statements whose parameters are still `$n` placeholders.
pub fn relation_name(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    match &select.from.first()?.relation {
        TableFactor::Table { name, .. } => object_name_last(name),
        _ => None,
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let (name, args) = match &from.relation {
        TableFactor::Table { name, args, .. } => (
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))?,
            args,
        ),
        _ => return Err(SqlError::Parse("complex table expression".into())),
    };

    match args {
        Some(call) => parse_call(&name, &call.args),
        None => parse_read(name, select.selection.as_ref()),
    }
}

// ── Procedures ────────────────────────────────────────────────

fn parse_call(name: &str, raw: &[FunctionArg]) -> Result<Command, SqlError> {
    match name {
        "create_booking_safe" => {
            let args = Args::bind(
                "create_booking_safe",
                &[
                    "barber_id",
                    "service_id",
                    "client_name",
                    "client_id",
                    "start_time",
                    "end_time",
                    "price",
                    "notes",
                ],
                raw,
            )?;
            Ok(Command::CreateBooking(NewBooking {
                barber_id: args.ulid("barber_id")?,
                service_id: args.ulid("service_id")?,
                client_name: args.text("client_name")?,
                client_id: args.opt_ulid("client_id")?,
                start: args.instant("start_time")?,
                end: args.instant("end_time")?,
                price: args.decimal("price")?,
                notes: args.opt_text("notes")?,
            }))
        }
        "update_booking_safe" => {
            let args = Args::bind(
                "update_booking_safe",
                &["booking_id", "barber_id", "start_time", "end_time", "client_name", "service_id"],
                raw,
            )?;
            Ok(Command::UpdateBooking(BookingUpdate {
                booking_id: args.ulid("booking_id")?,
                barber_id: args.ulid("barber_id")?,
                start: args.instant("start_time")?,
                end: args.instant("end_time")?,
                client_name: args.opt_text("client_name")?,
                service_id: args.opt_ulid("service_id")?,
            }))
        }
        "start_booking" | "complete_booking" | "cancel_booking" => {
            let (proc, action) = match name {
                "start_booking" => ("start_booking", Action::Start),
                "complete_booking" => ("complete_booking", Action::Complete),
                _ => ("cancel_booking", Action::Cancel),
            };
            let args = Args::bind(proc, &["booking_id"], raw)?;
            Ok(Command::Transition {
                booking_id: args.ulid("booking_id")?,
                action,
            })
        }
        "delete_booking_safe" => {
            let args = Args::bind("delete_booking_safe", &["booking_id"], raw)?;
            Ok(Command::DeleteBooking {
                booking_id: args.ulid("booking_id")?,
            })
        }
        "create_unavailability_safe" => {
            let args = Args::bind(
                "create_unavailability_safe",
                &["barber_id", "start_time", "end_time", "reason"],
                raw,
            )?;
            Ok(Command::CreateUnavailability {
                barber_id: args.ulid("barber_id")?,
                start: args.instant("start_time")?,
                end: args.instant("end_time")?,
                reason: args.opt_text("reason")?,
            })
        }
        "delete_unavailability" => {
            let args = Args::bind("delete_unavailability", &["block_id"], raw)?;
            Ok(Command::DeleteUnavailability {
                block_id: args.ulid("block_id")?,
            })
        }
        "create_barber" => {
            let args = Args::bind("create_barber", &["name", "is_active"], raw)?;
            Ok(Command::CreateBarber {
                name: args.text("name")?,
                is_active: args.opt_bool("is_active")?.unwrap_or(true),
            })
        }
        "set_barber_active" => {
            let args = Args::bind("set_barber_active", &["barber_id", "is_active"], raw)?;
            Ok(Command::SetBarberActive {
                barber_id: args.ulid("barber_id")?,
                is_active: args.bool("is_active")?,
            })
        }
        "delete_barber_safe" => {
            let args = Args::bind("delete_barber_safe", &["barber_id"], raw)?;
            Ok(Command::DeleteBarber {
                barber_id: args.ulid("barber_id")?,
            })
        }
        "create_service" => {
            let args = Args::bind("create_service", &["name", "duration_minutes", "price"], raw)?;
            Ok(Command::CreateService {
                name: args.text("name")?,
                duration_minutes: args.u32("duration_minutes")?,
                price: args.decimal("price")?,
            })
        }
        "update_service" => {
            let args = Args::bind(
                "update_service",
                &["service_id", "name", "duration_minutes", "price", "is_active"],
                raw,
            )?;
            Ok(Command::UpdateService {
                service_id: args.ulid("service_id")?,
                name: args.text("name")?,
                duration_minutes: args.u32("duration_minutes")?,
                price: args.decimal("price")?,
                is_active: args.bool("is_active")?,
            })
        }
        "delete_service_safe" => {
            let args = Args::bind("delete_service_safe", &["service_id"], raw)?;
            Ok(Command::DeleteService {
                service_id: args.ulid("service_id")?,
            })
        }
        "update_business_settings" => {
            let args = Args::bind(
                "update_business_settings",
                &["opening_time", "closing_time", "slot_interval"],
                raw,
            )?;
            Ok(Command::UpdateSettings {
                opening_time: args.time_of_day("opening_time")?,
                closing_time: args.time_of_day("closing_time")?,
                slot_interval: args.u32("slot_interval")?,
            })
        }
        "check_conflict" => {
            let args = Args::bind(
                "check_conflict",
                &["barber_id", "start_time", "end_time", "exclude_booking_id"],
                raw,
            )?;
            Ok(Command::CheckConflict {
                barber_id: args.ulid("barber_id")?,
                start: args.instant("start_time")?,
                end: args.instant("end_time")?,
                exclude: args.opt_ulid("exclude_booking_id")?,
            })
        }
        other => Err(SqlError::UnknownProcedure(other.to_string())),
    }
}

/// Call arguments bound to parameter names. Positional arguments follow
/// the declared order; named ones may carry a `p_` prefix.
struct Args<'a> {
    proc: &'static str,
    bound: HashMap<&'static str, &'a Expr>,
}

impl<'a> Args<'a> {
    fn bind(proc: &'static str, params: &[&'static str], raw: &'a [FunctionArg]) -> Result<Self, SqlError> {
        let mut bound = HashMap::new();
        for (i, arg) in raw.iter().enumerate() {
            let (param, expr) = match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                    let param = params.get(i).copied().ok_or(SqlError::TooManyArgs {
                        proc,
                        max: params.len(),
                    })?;
                    (param, e)
                }
                FunctionArg::Named {
                    name,
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => (param_named(proc, params, &name.value)?, e),
                FunctionArg::ExprNamed {
                    name,
                    arg: FunctionArgExpr::Expr(e),
                    ..
                } => {
                    let name = expr_column_name(name)
                        .ok_or_else(|| SqlError::Parse(format!("{proc}: bad argument name {name}")))?;
                    (param_named(proc, params, &name)?, e)
                }
                other => return Err(SqlError::Unsupported(format!("argument {other} to {proc}"))),
            };
            if bound.insert(param, expr).is_some() {
                return Err(SqlError::Parse(format!("{proc}: {param} given twice")));
            }
        }
        Ok(Self { proc, bound })
    }

    /// Literal text of `param`; `None` when absent or NULL.
    fn value(&self, param: &'static str) -> Result<Option<String>, SqlError> {
        match self.bound.get(param) {
            None => Ok(None),
            Some(expr) => literal(expr).map_err(|e| SqlError::BadArg {
                proc: self.proc,
                arg: param,
                reason: e.to_string(),
            }),
        }
    }

    fn required(&self, param: &'static str) -> Result<String, SqlError> {
        self.value(param)?.ok_or(SqlError::MissingArg { proc: self.proc, arg: param })
    }

    fn convert<T, E: std::fmt::Display>(
        &self,
        param: &'static str,
        raw: String,
        parse: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<T, SqlError> {
        parse(raw.trim()).map_err(|e| SqlError::BadArg {
            proc: self.proc,
            arg: param,
            reason: format!("{raw:?}: {e}"),
        })
    }

    fn text(&self, param: &'static str) -> Result<String, SqlError> {
        self.required(param)
    }

    fn opt_text(&self, param: &'static str) -> Result<Option<String>, SqlError> {
        self.value(param)
    }

    fn ulid(&self, param: &'static str) -> Result<Ulid, SqlError> {
        let raw = self.required(param)?;
        self.convert(param, raw, Ulid::from_string)
    }

    fn opt_ulid(&self, param: &'static str) -> Result<Option<Ulid>, SqlError> {
        match self.value(param)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => self.convert(param, raw, Ulid::from_string).map(Some),
        }
    }

    fn instant(&self, param: &'static str) -> Result<Ms, SqlError> {
        let raw = self.required(param)?;
        self.convert(param, raw, parse_ms)
    }

    fn u32(&self, param: &'static str) -> Result<u32, SqlError> {
        let raw = self.required(param)?;
        self.convert(param, raw, str::parse::<u32>)
    }

    fn decimal(&self, param: &'static str) -> Result<Decimal, SqlError> {
        let raw = self.required(param)?;
        self.convert(param, raw, str::parse::<Decimal>)
    }

    fn bool(&self, param: &'static str) -> Result<bool, SqlError> {
        self.opt_bool(param)?.ok_or(SqlError::MissingArg { proc: self.proc, arg: param })
    }

    fn opt_bool(&self, param: &'static str) -> Result<Option<bool>, SqlError> {
        match self.value(param)? {
            None => Ok(None),
            Some(raw) => self.convert(param, raw, parse_bool).map(Some),
        }
    }

    fn time_of_day(&self, param: &'static str) -> Result<NaiveTime, SqlError> {
        let raw = self.required(param)?;
        self.convert(param, raw, |s| {
            NaiveTime::parse_from_str(s, "%H:%M:%S").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        })
    }
}

fn param_named(proc: &'static str, params: &[&'static str], name: &str) -> Result<&'static str, SqlError> {
    let name = name.to_lowercase();
    let bare = name.strip_prefix("p_").unwrap_or(&name);
    params
        .iter()
        .copied()
        .find(|p| *p == bare)
        .ok_or_else(|| SqlError::UnknownArg { proc, arg: name.clone() })
}

// ── Reads ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Filters {
    day: Option<NaiveDate>,
    from: Option<Ms>,
    until: Option<Ms>,
    barber_id: Option<Ulid>,
    is_active: Option<bool>,
}

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.add(expr)?;
        }
        Ok(filters)
    }

    fn add(&mut self, expr: &Expr) -> Result<(), SqlError> {
        use ast::BinaryOperator as Op;
        match expr {
            Expr::BinaryOp {
                left,
                op: Op::And,
                right,
            } => {
                self.add(left)?;
                self.add(right)
            }
            Expr::Nested(inner) => self.add(inner),
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let raw = literal(right)?.ok_or_else(|| SqlError::Unsupported(format!("NULL in filter {expr}")))?;
                let bad = |e: &dyn std::fmt::Display| SqlError::Parse(format!("{col}: {raw:?}: {e}"));
                match (col.as_str(), op) {
                    ("day", Op::Eq) => {
                        self.day = Some(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| bad(&e))?)
                    }
                    ("start_time", Op::GtEq) => self.from = Some(parse_ms(&raw).map_err(|e| bad(&e))?),
                    ("start_time", Op::Lt) => self.until = Some(parse_ms(&raw).map_err(|e| bad(&e))?),
                    ("barber_id", Op::Eq) => {
                        self.barber_id = Some(Ulid::from_string(raw.trim()).map_err(|e| bad(&e))?)
                    }
                    ("is_active", Op::Eq) => self.is_active = Some(parse_bool(&raw).map_err(|e| bad(&e))?),
                    _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn window(&self) -> Result<Window, SqlError> {
        match (self.day, self.from, self.until) {
            (Some(day), None, None) => Ok(Window::Day(day)),
            (None, Some(start), Some(end)) => Ok(Window::Range { start, end }),
            (Some(_), _, _) => Err(SqlError::Parse("use either day or a start_time range, not both".into())),
            _ => Err(SqlError::MissingFilter("day, or start_time >= … AND start_time < …")),
        }
    }

    /// Reads over catalogs take only `is_active = true|false`.
    fn active_only(&self, table: &str) -> Result<bool, SqlError> {
        if self.day.is_some() || self.from.is_some() || self.until.is_some() || self.barber_id.is_some() {
            return Err(SqlError::Unsupported(format!("time or barber filter on {table}")));
        }
        Ok(self.is_active.unwrap_or(false))
    }
}

fn parse_read(table: String, selection: Option<&Expr>) -> Result<Command, SqlError> {
    let filters = Filters::collect(selection)?;
    match table.as_str() {
        "barbers" => Ok(Command::SelectBarbers {
            active_only: filters.active_only("barbers")?,
        }),
        "services" => Ok(Command::SelectServices {
            active_only: filters.active_only("services")?,
        }),
        "bookings" | "unavailability" | "unavailability_blocks" => {
            if filters.is_active.is_some() {
                return Err(SqlError::Unsupported(format!("is_active filter on {table}")));
            }
            let window = filters.window()?;
            let barber_id = filters.barber_id;
            if table == "bookings" {
                Ok(Command::SelectBookings { window, barber_id })
            } else {
                Ok(Command::SelectUnavailability { window, barber_id })
            }
        }
        "business_settings" => {
            if selection.is_some() {
                return Err(SqlError::Unsupported("filter on business_settings".into()));
            }
            Ok(Command::SelectSettings)
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Text of a literal argument, looking through casts and a leading minus.
/// `None` for NULL.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
        Expr::Cast { expr, .. } => literal(expr),
        Expr::Nested(expr) => literal(expr),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

/// RFC 3339 text, or epoch milliseconds.
fn parse_ms(s: &str) -> Result<Ms, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    parse_instant(s).map_err(|e| e.to_string())
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "on" => Ok(true),
        "false" | "f" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("bad bool: {other}")),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownProcedure(String),
    UnknownArg { proc: &'static str, arg: String },
    TooManyArgs { proc: &'static str, max: usize },
    MissingArg { proc: &'static str, arg: &'static str },
    BadArg { proc: &'static str, arg: &'static str, reason: String },
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownProcedure(_) => "42883",
            SqlError::BadArg { .. } => "22P02",
            SqlError::MissingArg { .. } => "22023",
            _ => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownProcedure(p) => write!(f, "unknown procedure: {p}"),
            SqlError::UnknownArg { proc, arg } => write!(f, "{proc}: unknown argument {arg}"),
            SqlError::TooManyArgs { proc, max } => write!(f, "{proc}: takes at most {max} arguments"),
            SqlError::MissingArg { proc, arg } => write!(f, "{proc}: {arg} is required"),
            SqlError::BadArg { proc, arg, reason } => write!(f, "{proc}: bad {arg}: {reason}"),
            SqlError::MissingFilter(what) => write!(f, "missing filter: {what}"),
        }
    }
}

impl std::error::Error for SqlError {}
