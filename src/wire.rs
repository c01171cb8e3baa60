use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::AgendadAuthSource;
use crate::engine::{Engine, EngineError, NewPool};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, PoolChange};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = AgendadFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Statement handler for a single connection. LISTEN subscriptions are
/// connection state; queued events go out ahead of the next response.
pub struct AgendadHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AgendadQueryParser>,
    listening: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl AgendadHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AgendadQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run<C>(&self, client: &mut C, sql: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(sql).map_err(|e| {
            tracing::debug!("rejected statement {sql:?}: {e}");
            sql_err(e)
        })?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.flush_notifications(client).await?;
        result
    }

    /// Send every event queued on this connection's LISTEN channels.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for (pool_id, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((*pool_id, event)),
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            tracing::warn!(pool_id = %pool_id, missed, "listener fell behind");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (pool_id, event) in pending {
            let payload = serde_json::to_string(&event)
                .map_err(|e| user_error("XX000", format!("encode notification: {e}")))?;
            let msg = NotificationResponse::new(0, channel_name(pool_id), payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(msg))
                .await?;
        }
        Ok(())
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let now = now_ms();
        match cmd {
            Command::InsertPool {
                id,
                date,
                shift,
                region_id,
                capacity,
                reservations_allowed,
            } => {
                let pool = NewPool {
                    date,
                    shift,
                    region_id,
                    capacity,
                    reservations_allowed,
                };
                engine.create_pool(id, pool, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdatePool { id, change } => {
                match change {
                    PoolChange::Capacity(capacity) => {
                        engine.set_capacity(id, capacity).await.map_err(engine_err)?;
                    }
                    PoolChange::Active(active) => {
                        engine.set_active(id, active).await.map_err(engine_err)?;
                    }
                    PoolChange::ReservationsAllowed(allowed) => {
                        engine
                            .set_reservations_allowed(id, allowed)
                            .await
                            .map_err(engine_err)?;
                    }
                }
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DuplicatePool { source, dates } => {
                let report = engine
                    .duplicate_pool(source, &dates, now)
                    .await
                    .map_err(engine_err)?;
                let created = report
                    .created
                    .into_iter()
                    .map(|(date, id)| (date, "created", Some(id)));
                let conflicts = report.conflicts.into_iter().map(|d| (d, "conflict", None));
                let past = report
                    .rejected_past_dates
                    .into_iter()
                    .map(|d| (d, "past_date", None));
                let failed = report.failed.into_iter().map(|d| (d, "failed", None));
                let rows: Vec<_> = created.chain(conflicts).chain(past).chain(failed).collect();
                rows_response(duplicate_schema(), rows, |enc, (date, outcome, id)| {
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&outcome.to_string())?;
                    enc.encode_field(&id.map(|id| id.to_string()))
                })
            }
            Command::InsertBooking {
                id,
                pool_id,
                worker_id,
                notes,
            } => {
                let outcome = engine
                    .book(id, pool_id, worker_id, notes, now)
                    .await
                    .map_err(engine_err)?;
                rows_response(booking_outcome_schema(), [outcome], |enc, o| {
                    enc.encode_field(&o.booking_id.to_string())?;
                    enc.encode_field(&o.kind.as_str().to_string())
                })
            }
            Command::DeleteBooking { id } => {
                engine.cancel(id, now).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UpsertWorker { workers } => {
                let count = workers.len();
                for (worker_id, tier) in workers {
                    engine
                        .set_worker_tier(worker_id, tier)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::UpdateConfig { changes } => {
                engine
                    .update_config(|config| {
                        for change in &changes {
                            change.apply(config);
                        }
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectPools { id } => {
                let pools = match id {
                    Some(id) => vec![engine.pool_info(id).await.map_err(engine_err)?],
                    None => engine.list_pools().await,
                };
                rows_response(pool_schema(), pools, encode_pool)
            }
            Command::SelectVisiblePools { worker_id, date } => {
                let pools = engine
                    .visible_pools(worker_id, date, now)
                    .await
                    .map_err(engine_err)?;
                rows_response(pool_schema(), pools, encode_pool)
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => {
                        vec![engine.booking_info(id, now).await.map_err(engine_err)?]
                    }
                    BookingFilter::Pool(pool_id) => {
                        engine.list_pool(pool_id, now).await.map_err(engine_err)?.bookings
                    }
                    BookingFilter::Worker(worker_id) => {
                        engine.worker_bookings(worker_id, now).await
                    }
                };
                rows_response(booking_schema(), bookings, encode_booking)
            }
            Command::SelectAudit { pool_id } => {
                let reports = match pool_id {
                    Some(id) => vec![engine.audit(id).await.map_err(engine_err)?],
                    None => engine.audit_all().await.map_err(engine_err)?,
                };
                rows_response(audit_schema(), reports, encode_audit)
            }
            Command::Reconcile { pool_id } => {
                let corrected = match pool_id {
                    Some(id) => {
                        let before = engine.audit(id).await.map_err(engine_err)?;
                        if engine.reconcile(id).await.map_err(engine_err)? {
                            vec![before]
                        } else {
                            vec![]
                        }
                    }
                    None => engine.reconcile_all(false).await.map_err(engine_err)?,
                };
                rows_response(audit_schema(), corrected, encode_audit)
            }
            Command::SelectConfig => {
                let config = engine.config().await;
                rows_response(config_schema(), config_rows(&config), |enc, (key, value)| {
                    enc.encode_field(&key)?;
                    enc.encode_field(&value)
                })
            }
            Command::Listen { channel } => {
                let pool_id = parse_channel(&channel)?;
                let rx = engine.subscribe(pool_id);
                self.listening.lock().await.insert(pool_id, rx);
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let pool_id = parse_channel(&channel)?;
                self.listening.lock().await.remove(&pool_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

fn channel_name(pool_id: Ulid) -> String {
    format!("pool_{pool_id}")
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("pool_").ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected pool_{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn pool_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("shift_id", Type::VARCHAR),
        field("shift_name", Type::VARCHAR),
        field("shift_start", Type::VARCHAR),
        field("shift_end", Type::VARCHAR),
        field("region_id", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("occupied", Type::INT8),
        field("waitlisted", Type::INT8),
        field("active", Type::BOOL),
        field("reservations_allowed", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("pool_id", Type::VARCHAR),
        field("worker_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("cancelled_at", Type::INT8),
        field("notes", Type::VARCHAR),
    ]
}

fn booking_outcome_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("kind", Type::VARCHAR)]
}

fn duplicate_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("pool_id", Type::VARCHAR),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("pool_id", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("true_occupied", Type::INT8),
        field("cached_occupied", Type::INT8),
        field("drift", Type::INT8),
        field("finding", Type::VARCHAR),
    ]
}

fn config_schema() -> Vec<FieldInfo> {
    vec![field("key", Type::VARCHAR), field("value", Type::VARCHAR)]
}

/// Columns a statement will return, judged from its text alone so it works
/// before parameters are bound.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |kw: &str| {
        words
            .iter()
            .position(|w| *w == kw)
            .and_then(|i| words.get(i + 1))
            .copied()
    };
    match words.first().copied() {
        Some("select") => match after("from") {
            Some("pools" | "visible_pools") => pool_schema(),
            Some("bookings") => booking_schema(),
            Some("audit" | "reconcile") => audit_schema(),
            Some("config") => config_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("bookings") => booking_outcome_schema(),
            Some("duplicates") => duplicate_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_pool(enc: &mut DataRowEncoder, p: PoolInfo) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.date.to_string())?;
    enc.encode_field(&p.shift_id.to_string())?;
    enc.encode_field(&p.shift_name)?;
    enc.encode_field(&p.shift_start.format("%H:%M:%S").to_string())?;
    enc.encode_field(&p.shift_end.format("%H:%M:%S").to_string())?;
    enc.encode_field(&p.region_id.to_string())?;
    enc.encode_field(&i64::from(p.capacity))?;
    enc.encode_field(&i64::from(p.occupied))?;
    enc.encode_field(&i64::from(p.waitlisted))?;
    enc.encode_field(&p.active)?;
    enc.encode_field(&p.reservations_allowed)
}

fn encode_booking(enc: &mut DataRowEncoder, b: BookingInfo) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.pool_id.to_string())?;
    enc.encode_field(&b.worker_id.to_string())?;
    enc.encode_field(&b.kind.as_str().to_string())?;
    enc.encode_field(&b.status.as_str().to_string())?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.cancelled_at)?;
    enc.encode_field(&b.notes)
}

fn encode_audit(enc: &mut DataRowEncoder, r: AuditReport) -> PgWireResult<()> {
    enc.encode_field(&r.pool_id.to_string())?;
    enc.encode_field(&i64::from(r.capacity))?;
    enc.encode_field(&i64::from(r.true_occupied))?;
    enc.encode_field(&i64::from(r.cached_occupied))?;
    enc.encode_field(&r.drift)?;
    enc.encode_field(&r.finding.map(|f| f.label().to_string()))
}

fn config_rows(config: &TenantConfig) -> Vec<(String, String)> {
    let mut rows = vec![("release_enabled".to_string(), config.release_enabled.to_string())];
    for (i, raw) in config.release_times.iter().enumerate() {
        rows.push((format!("release_tier_{}", i + 1), raw.clone()));
    }
    rows.push(("cancellation_enabled".into(), config.cancellation_enabled.to_string()));
    rows.push(("cancellation_lead_hours".into(), config.cancellation_lead_hours.to_string()));
    rows.push(("utc_offset_minutes".into(), config.utc_offset_minutes.to_string()));
    rows
}

#[async_trait]
impl SimpleQueryHandler for AgendadHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendadQueryParser;

#[async_trait]
impl QueryParser for AgendadQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendadHandler {
    type Statement = String;
    type QueryParser = AgendadQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AgendadFactory {
    handler: Arc<AgendadHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AgendadAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl AgendadFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AgendadAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AgendadHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendadFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error. Booking outcomes share `P0001`; a busy
/// pool is a serialization failure so drivers treat it as retryable.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(_) | EngineError::CancelRefused(_) => "P0001",
        EngineError::ConcurrencyConflict(_) => "40001",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::SlotTaken(_) => "23505",
        EngineError::CapacityBelowOccupied { .. } => "23514",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::WalError(_) => tracing::error!("statement failed: {e}"),
        _ => tracing::debug!("statement refused: {e}"),
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
