use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::gate::parse_release_time;
use crate::limits::MAX_BATCH_ROWS;
use crate::model::{ShiftTemplate, TenantConfig};

/// One setting in `UPDATE config SET ...`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    ReleaseEnabled(bool),
    /// `release_tier_<n>`; kept as raw text so a bad value reaches the gate
    /// (and its defect reporting) unchanged.
    ReleaseTime { tier: u8, raw: String },
    CancellationEnabled(bool),
    CancellationLeadHours(f64),
    UtcOffsetMinutes(i32),
}

impl ConfigChange {
    pub fn apply(&self, config: &mut TenantConfig) {
        match self {
            ConfigChange::ReleaseEnabled(b) => config.release_enabled = *b,
            ConfigChange::ReleaseTime { tier, raw } => {
                config.release_times[usize::from(tier - 1)] = raw.clone();
            }
            ConfigChange::CancellationEnabled(b) => config.cancellation_enabled = *b,
            ConfigChange::CancellationLeadHours(h) => config.cancellation_lead_hours = *h,
            ConfigChange::UtcOffsetMinutes(m) => config.utc_offset_minutes = *m,
        }
    }
}

/// The single pool setting an `UPDATE pools` statement changes. Each maps
/// to one engine commit, so a statement may name only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolChange {
    Capacity(u32),
    Active(bool),
    ReservationsAllowed(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Pool(Ulid),
    Worker(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPool {
        id: Ulid,
        date: NaiveDate,
        shift: ShiftTemplate,
        region_id: Ulid,
        capacity: u32,
        reservations_allowed: bool,
    },
    UpdatePool {
        id: Ulid,
        change: PoolChange,
    },
    DuplicatePool {
        source: Ulid,
        dates: Vec<NaiveDate>,
    },
    InsertBooking {
        id: Ulid,
        pool_id: Ulid,
        worker_id: Ulid,
        notes: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    UpsertWorker {
        workers: Vec<(Ulid, u8)>,
    },
    UpdateConfig {
        changes: Vec<ConfigChange>,
    },
    SelectPools {
        id: Option<Ulid>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectVisiblePools {
        worker_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectAudit {
        pool_id: Option<Ulid>,
    },
    Reconcile {
        pool_id: Option<Ulid>,
    },
    SelectConfig,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: trimmed[7..].trim().to_string(),
        });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: trimmed[9..].trim().to_string(),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn req(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

/// Rows of an `INSERT ... VALUES`. Without a column list, values map onto
/// `columns` positionally.
fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&'static str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }
    if values.rows.len() > MAX_BATCH_ROWS {
        return Err(SqlError::TooManyRows(values.rows.len()));
    }

    let names: Vec<String> = if insert.columns.is_empty() {
        columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|i| i.value.to_lowercase()).collect()
    };
    if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }

    values
        .rows
        .iter()
        .map(|row| {
            if row.len() > names.len() {
                return Err(SqlError::WrongArity(table, names.len(), row.len()));
            }
            Ok(Row {
                table,
                cells: names.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "pools" => {
            let rows = insert_rows(
                insert,
                "pools",
                &[
                    "id",
                    "date",
                    "shift_id",
                    "shift_name",
                    "shift_start",
                    "shift_end",
                    "region_id",
                    "capacity",
                    "reservations_allowed",
                ],
            )?;
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("multi-row INSERT INTO pools".into()));
            };
            Ok(Command::InsertPool {
                id: parse_ulid(row.req("id")?)?,
                date: parse_date(row.req("date")?)?,
                shift: ShiftTemplate {
                    id: parse_ulid(row.req("shift_id")?)?,
                    name: parse_string(row.req("shift_name")?)?,
                    start: parse_time(row.req("shift_start")?)?,
                    end: parse_time(row.req("shift_end")?)?,
                },
                region_id: parse_ulid(row.req("region_id")?)?,
                capacity: parse_u32(row.req("capacity")?)?,
                reservations_allowed: row
                    .get("reservations_allowed")
                    .map(parse_bool)
                    .transpose()?
                    .unwrap_or(true),
            })
        }
        "duplicates" => {
            let rows = insert_rows(insert, "duplicates", &["pool_id", "date"])?;
            let mut source = None;
            let mut dates = Vec::with_capacity(rows.len());
            for row in &rows {
                let pool_id = parse_ulid(row.req("pool_id")?)?;
                if *source.get_or_insert(pool_id) != pool_id {
                    return Err(SqlError::Unsupported("duplicating more than one pool at once".into()));
                }
                dates.push(parse_date(row.req("date")?)?);
            }
            let source = source.ok_or(SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::DuplicatePool { source, dates })
        }
        "bookings" => {
            let rows = insert_rows(insert, "bookings", &["id", "pool_id", "worker_id", "notes"])?;
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("multi-row INSERT INTO bookings".into()));
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(row.req("id")?)?,
                pool_id: parse_ulid(row.req("pool_id")?)?,
                worker_id: parse_ulid(row.req("worker_id")?)?,
                notes: row.get("notes").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "workers" => {
            let rows = insert_rows(insert, "workers", &["id", "tier"])?;
            let workers = rows
                .iter()
                .map(|row| {
                    let tier = parse_i64(row.req("tier")?)?;
                    let tier = u8::try_from(tier)
                        .map_err(|_| SqlError::Parse(format!("{tier} out of tier range")))?;
                    Ok((parse_ulid(row.req("id")?)?, tier))
                })
                .collect::<Result<_, SqlError>>()?;
            Ok(Command::UpsertWorker { workers })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn assignment_column(target: &AssignmentTarget) -> Result<String, SqlError> {
    match target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    match table.as_str() {
        "pools" => {
            let id = extract_where_id(selection)?;
            let [a] = assignments else {
                return Err(SqlError::Unsupported(
                    "UPDATE pools sets exactly one column per statement".into(),
                ));
            };
            let change = match assignment_column(&a.target)?.as_str() {
                "capacity" => PoolChange::Capacity(parse_u32(&a.value)?),
                "active" => PoolChange::Active(parse_bool(&a.value)?),
                "reservations_allowed" => PoolChange::ReservationsAllowed(parse_bool(&a.value)?),
                other => return Err(SqlError::UnknownColumn("pools", other.to_string())),
            };
            Ok(Command::UpdatePool { id, change })
        }
        "config" => {
            if selection.is_some() {
                return Err(SqlError::Unsupported("WHERE on config".into()));
            }
            let changes = assignments
                .iter()
                .map(|a| parse_config_change(&assignment_column(&a.target)?, &a.value))
                .collect::<Result<_, _>>()?;
            Ok(Command::UpdateConfig { changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_config_change(column: &str, value: &Expr) -> Result<ConfigChange, SqlError> {
    if let Some(tier) = column.strip_prefix("release_tier_") {
        let tier: u8 = tier
            .parse()
            .ok()
            .filter(|t| (1..=5).contains(t))
            .ok_or_else(|| SqlError::UnknownColumn("config", column.to_string()))?;
        return Ok(ConfigChange::ReleaseTime {
            tier,
            raw: parse_string(value)?,
        });
    }
    Ok(match column {
        "release_enabled" => ConfigChange::ReleaseEnabled(parse_bool(value)?),
        "cancellation_enabled" => ConfigChange::CancellationEnabled(parse_bool(value)?),
        "cancellation_lead_hours" => ConfigChange::CancellationLeadHours(parse_f64(value)?),
        "utc_offset_minutes" => {
            let m = parse_i64(value)?;
            ConfigChange::UtcOffsetMinutes(
                i32::try_from(m).map_err(|_| SqlError::Parse(format!("{m} out of range")))?,
            )
        }
        other => return Err(SqlError::UnknownColumn("config", other.to_string())),
    })
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(delete.selection.as_ref())?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = match &select.selection {
        Some(expr) => where_equalities(expr)?,
        None => Vec::new(),
    };
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let ulid_filter = |col: &str| filter(col).map(parse_ulid).transpose();

    match table.as_str() {
        "pools" => Ok(Command::SelectPools { id: ulid_filter("id")? }),
        "bookings" => {
            let filter = if let Some(id) = ulid_filter("id")? {
                BookingFilter::Id(id)
            } else if let Some(pool) = ulid_filter("pool_id")? {
                BookingFilter::Pool(pool)
            } else if let Some(worker) = ulid_filter("worker_id")? {
                BookingFilter::Worker(worker)
            } else {
                return Err(SqlError::MissingFilter("pool_id or worker_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "visible_pools" => Ok(Command::SelectVisiblePools {
            worker_id: ulid_filter("worker_id")?.ok_or(SqlError::MissingFilter("worker_id"))?,
            date: filter("date").map(parse_date).transpose()?,
        }),
        "audit" => Ok(Command::SelectAudit {
            pool_id: ulid_filter("pool_id")?,
        }),
        "reconcile" => Ok(Command::Reconcile {
            pool_id: ulid_filter("pool_id")?,
        }),
        "config" => Ok(Command::SelectConfig),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2` into `[(a, 1), (b, 2)]`.
fn where_equalities(expr: &Expr) -> Result<Vec<(String, &Expr)>, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            let mut all = where_equalities(left)?;
            all.extend(where_equalities(right)?);
            Ok(all)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            Ok(vec![(col, right.as_ref())])
        }
        Expr::Nested(inner) => where_equalities(inner),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.ok_or(SqlError::MissingFilter("id"))?;
    let filters = where_equalities(sel)?;
    match filters.as_slice() {
        [(col, value)] if col == "id" => parse_ulid(value),
        _ => Err(SqlError::MissingFilter("id")),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text of a string or numeric literal.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?;
    parse_release_time(s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    TooManyRows(usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooManyRows(n) => {
                write!(f, "{n} rows in one statement, at most {MAX_BATCH_ROWS} allowed")
            }
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn insert_pool_with_all_columns() {
        let sql = format!(
            "INSERT INTO pools (id, date, shift_id, shift_name, shift_start, shift_end, region_id, capacity, reservations_allowed) \
             VALUES ('{A}', '2030-06-10', '{B}', 'Noite', '22:00', '02:00:00', '{B}', 12, false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertPool { id, date, shift, region_id, capacity, reservations_allowed } => {
                assert_eq!(id, ulid(A));
                assert_eq!(date, NaiveDate::from_ymd_opt(2030, 6, 10).unwrap());
                assert_eq!(shift.name, "Noite");
                assert_eq!(shift.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
                assert_eq!(shift.end, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
                assert_eq!(region_id, ulid(B));
                assert_eq!(capacity, 12);
                assert!(!reservations_allowed);
            }
            other => panic!("expected InsertPool, got {other:?}"),
        }
    }

    #[test]
    fn insert_pool_reservations_default_on() {
        let sql = format!(
            "INSERT INTO pools (id, date, shift_id, shift_name, shift_start, shift_end, region_id, capacity) \
             VALUES ('{A}', '2030-06-10', '{B}', 'Dia', '08:00', '16:00', '{B}', 3)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertPool { reservations_allowed: true, .. }
        ));
    }

    #[test]
    fn insert_pool_missing_column_is_reported() {
        let sql = format!("INSERT INTO pools (id, date) VALUES ('{A}', '2030-06-10')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("pools", "shift_id"))));
    }

    #[test]
    fn insert_booking_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO bookings (worker_id, pool_id, id, notes) VALUES ('{B}', '{A}', '{A}', 'late arrival')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: ulid(A),
                pool_id: ulid(A),
                worker_id: ulid(B),
                notes: Some("late arrival".into()),
            }
        );
    }

    #[test]
    fn insert_booking_positional() {
        let sql = format!("INSERT INTO bookings VALUES ('{A}', '{B}', '{B}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertBooking { notes: None, .. }));
    }

    #[test]
    fn insert_booking_rejects_unknown_column() {
        let sql = format!("INSERT INTO bookings (id, pool_id, worker_id, seat) VALUES ('{A}', '{A}', '{A}', 1)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("bookings", _))));
    }

    #[test]
    fn duplicates_collect_dates_for_one_pool() {
        let sql = format!(
            "INSERT INTO duplicates (pool_id, date) VALUES ('{A}', '2030-06-11'), ('{A}', '2030-06-12')"
        );
        match parse_sql(&sql).unwrap() {
            Command::DuplicatePool { source, dates } => {
                assert_eq!(source, ulid(A));
                assert_eq!(dates.len(), 2);
            }
            other => panic!("expected DuplicatePool, got {other:?}"),
        }

        let mixed = format!(
            "INSERT INTO duplicates (pool_id, date) VALUES ('{A}', '2030-06-11'), ('{B}', '2030-06-12')"
        );
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn workers_accept_several_rows() {
        let sql = format!("INSERT INTO workers (id, tier) VALUES ('{A}', 5), ('{B}', 2)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpsertWorker { workers: vec![(ulid(A), 5), (ulid(B), 2)] }
        );
    }

    #[test]
    fn update_pool_sets_one_column() {
        let sql = format!("UPDATE pools SET capacity = 8 WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdatePool { id: ulid(A), change: PoolChange::Capacity(8) }
        );
        let sql = format!("UPDATE pools SET reservations_allowed = false WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdatePool { id: ulid(A), change: PoolChange::ReservationsAllowed(false) }
        );
    }

    #[test]
    fn update_pool_refuses_several_columns() {
        let sql = format!("UPDATE pools SET capacity = 8, active = false WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_pool_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE pools SET capacity = 8"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn update_config_changes() {
        let sql = "UPDATE config SET release_tier_5 = '07:30', cancellation_lead_hours = 1.5, utc_offset_minutes = -180, release_enabled = true";
        let Command::UpdateConfig { changes } = parse_sql(sql).unwrap() else {
            panic!("expected UpdateConfig");
        };
        assert_eq!(
            changes,
            vec![
                ConfigChange::ReleaseTime { tier: 5, raw: "07:30".into() },
                ConfigChange::CancellationLeadHours(1.5),
                ConfigChange::UtcOffsetMinutes(-180),
                ConfigChange::ReleaseEnabled(true),
            ]
        );

        let mut cfg = TenantConfig::default();
        for c in &changes {
            c.apply(&mut cfg);
        }
        assert_eq!(cfg.release_times[4], "07:30");
        assert_eq!(cfg.cancellation_lead_hours, 1.5);
    }

    #[test]
    fn update_config_unknown_tier() {
        assert!(matches!(
            parse_sql("UPDATE config SET release_tier_6 = '07:00'"),
            Err(SqlError::UnknownColumn("config", _))
        ));
    }

    #[test]
    fn delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{A}';");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
    }

    #[test]
    fn select_variants() {
        assert_eq!(parse_sql("SELECT * FROM pools").unwrap(), Command::SelectPools { id: None });
        assert_eq!(
            parse_sql(&format!("SELECT * FROM bookings WHERE worker_id = '{B}'")).unwrap(),
            Command::SelectBookings { filter: BookingFilter::Worker(ulid(B)) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM visible_pools WHERE worker_id = '{B}' AND date = '2030-06-10'"))
                .unwrap(),
            Command::SelectVisiblePools {
                worker_id: ulid(B),
                date: NaiveDate::from_ymd_opt(2030, 6, 10),
            }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM audit WHERE pool_id = '{A}'")).unwrap(),
            Command::SelectAudit { pool_id: Some(ulid(A)) }
        );
        assert_eq!(parse_sql("SELECT * FROM reconcile").unwrap(), Command::Reconcile { pool_id: None });
        assert_eq!(parse_sql("SELECT * FROM config").unwrap(), Command::SelectConfig);
    }

    #[test]
    fn bookings_need_a_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn or_filters_are_unsupported() {
        let sql = format!("SELECT * FROM pools WHERE id = '{A}' OR id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn listen_and_unlisten() {
        assert_eq!(
            parse_sql(&format!("LISTEN pool_{A};")).unwrap(),
            Command::Listen { channel: format!("pool_{A}") }
        );
        assert_eq!(
            parse_sql(&format!("unlisten pool_{A}")).unwrap(),
            Command::Unlisten { channel: format!("pool_{A}") }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn bad_literals_are_parse_errors() {
        let sql = "INSERT INTO workers (id, tier) VALUES ('not-a-ulid', 3)";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
        let sql = format!("INSERT INTO workers (id, tier) VALUES ('{A}', 300)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn empty_and_unknown() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql("SELECT * FROM resources"),
            Err(SqlError::UnknownTable(_))
        ));
    }
}
