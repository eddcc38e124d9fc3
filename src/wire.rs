use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, Invalid};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, Window};
use crate::time::{format_instant, BusinessZone};

/// What an engine call produced, before it is encoded as rows.
enum Reply {
    Bookings(Vec<Booking>),
    Blocks(Vec<UnavailabilityBlock>),
    Barbers(Vec<Barber>),
    Services(Vec<Service>),
    Settings(BusinessSettings),
    Conflict(Option<Occupant>),
    Deleted,
}

/// One handler per connection; it owns that connection's LISTEN subscriptions.
pub struct BarbercalHandler {
    engine: Arc<Engine>,
    zone: BusinessZone,
    query_parser: Arc<BarbercalQueryParser>,
    listening: Mutex<Vec<(String, broadcast::Receiver<Event>)>>,
}

impl BarbercalHandler {
    pub fn new(engine: Arc<Engine>, zone: BusinessZone) -> Self {
        Self {
            engine,
            zone,
            query_parser: Arc::new(BarbercalQueryParser),
            listening: Mutex::new(Vec::new()),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        let cmd = match cmd {
            Command::Listen { channel } => return self.listen(channel).await,
            Command::SelectBookings { window, barber_id } => Resolved::Bookings(self.span(window)?, barber_id),
            Command::SelectUnavailability { window, barber_id } => {
                Resolved::Blocks(self.span(window)?, barber_id)
            }
            other => Resolved::Other(other),
        };

        // Runs on its own task so a client hanging up mid-call cannot
        // cancel a mutation after its barber lock is taken.
        let engine = self.engine.clone();
        let reply = tokio::spawn(async move { run(&engine, cmd).await })
            .await
            .map_err(|e| {
                tracing::error!("engine task failed: {e}");
                user_error("58030", format!("internal error: {e}"))
            })?
            .map_err(engine_err)?;
        Ok(encode(reply))
    }

    fn span(&self, window: Window) -> PgWireResult<Span> {
        match window {
            Window::Day(day) => self
                .zone
                .day_bounds(day)
                .map_err(|e| user_error("22008", e.to_string())),
            Window::Range { start, end } if start < end => Ok(Span::new(start, end)),
            Window::Range { start, end } => Err(engine_err(EngineError::Validation(Invalid::EmptyRange {
                start,
                end,
            }))),
        }
    }

    async fn listen(&self, channel: String) -> PgWireResult<Response> {
        let barber_id = channel
            .strip_prefix("barber_")
            .and_then(|id| Ulid::from_string(id).ok())
            .ok_or_else(|| {
                user_error(
                    "42000",
                    format!("invalid channel: {channel} (expected barber_{{id}})"),
                )
            })?;
        self.engine.get_barber(barber_id).await.map_err(engine_err)?;
        let rx = self.engine.notify.subscribe(barber_id);
        let mut listening = self.listening.lock().unwrap_or_else(|p| p.into_inner());
        if !listening.iter().any(|(c, _)| *c == channel) {
            listening.push((channel, rx));
        }
        Ok(Response::Execution(Tag::new("LISTEN")))
    }

    /// Everything published on this connection's channels since the last call.
    /// A lagged receiver yields a `resync` so the client refetches.
    fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut listening = self.listening.lock().unwrap_or_else(|p| p.into_inner());
        listening.retain_mut(|(channel, rx)| loop {
            match rx.try_recv() {
                Ok(event) => out.push((channel.clone(), event_payload(&event))),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(%channel, skipped, "listener lagged");
                    out.push((channel.clone(), "resync".into()));
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    /// Notifications ride along with the next statement on the connection.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for (channel, payload) in self.drain_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    std::process::id() as i32,
                    channel,
                    payload,
                )))
                .await?;
        }
        Ok(())
    }
}

enum Resolved {
    Bookings(Span, Option<Ulid>),
    Blocks(Span, Option<Ulid>),
    Other(Command),
}

async fn run(engine: &Engine, cmd: Resolved) -> Result<Reply, EngineError> {
    let cmd = match cmd {
        Resolved::Bookings(window, barber) => {
            return Ok(Reply::Bookings(engine.bookings_in_range(window, barber).await?));
        }
        Resolved::Blocks(window, barber) => {
            return Ok(Reply::Blocks(engine.unavailability_in_range(window, barber).await?));
        }
        Resolved::Other(cmd) => cmd,
    };
    Ok(match cmd {
        Command::CreateBooking(new) => Reply::Bookings(vec![engine.create_booking(new).await?]),
        Command::UpdateBooking(update) => Reply::Bookings(vec![engine.update_booking(update).await?]),
        Command::Transition { booking_id, action } => {
            Reply::Bookings(vec![engine.transition_booking(booking_id, action).await?])
        }
        Command::DeleteBooking { booking_id } => {
            engine.delete_booking(booking_id).await?;
            Reply::Deleted
        }
        Command::CreateUnavailability {
            barber_id,
            start,
            end,
            reason,
        } => Reply::Blocks(vec![engine.create_unavailability(barber_id, start, end, reason).await?]),
        Command::DeleteUnavailability { block_id } => {
            engine.delete_unavailability(block_id).await?;
            Reply::Deleted
        }
        Command::CreateBarber { name, is_active } => Reply::Barbers(vec![engine.create_barber(&name, is_active).await?]),
        Command::SetBarberActive { barber_id, is_active } => {
            Reply::Barbers(vec![engine.set_barber_active(barber_id, is_active).await?])
        }
        Command::DeleteBarber { barber_id } => {
            engine.delete_barber(barber_id).await?;
            Reply::Deleted
        }
        Command::DeleteService { service_id } => {
            engine.delete_service(service_id).await?;
            Reply::Deleted
        }
        Command::CreateService {
            name,
            duration_minutes,
            price,
        } => Reply::Services(vec![engine.create_service(&name, duration_minutes, price).await?]),
        Command::UpdateService {
            service_id,
            name,
            duration_minutes,
            price,
            is_active,
        } => Reply::Services(vec![
            engine
                .update_service(service_id, &name, duration_minutes, price, is_active)
                .await?,
        ]),
        Command::UpdateSettings {
            opening_time,
            closing_time,
            slot_interval,
        } => Reply::Settings(
            engine
                .update_settings(opening_time, closing_time, slot_interval)
                .await?,
        ),
        Command::CheckConflict {
            barber_id,
            start,
            end,
            exclude,
        } => Reply::Conflict(engine.check_conflict(barber_id, start, end, exclude).await?),
        Command::SelectBarbers { active_only } => Reply::Barbers(engine.list_barbers(active_only).await),
        Command::SelectServices { active_only } => Reply::Services(engine.list_services(active_only).await),
        Command::SelectSettings => Reply::Settings(engine.settings().await),
        // Resolved before the spawn.
        Command::SelectBookings { .. } | Command::SelectUnavailability { .. } | Command::Listen { .. } => {
            return Err(EngineError::LimitExceeded("unresolved read"));
        }
    })
}

// ── Row encoding ─────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("barber_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("client_name", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("price_at_booking", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

fn block_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("barber_id", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

fn barber_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("is_active", Type::BOOL),
        field("created_at", Type::VARCHAR),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("price", Type::VARCHAR),
        field("is_active", Type::BOOL),
    ]
}

fn settings_schema() -> Vec<FieldInfo> {
    vec![
        field("opening_time", Type::VARCHAR),
        field("closing_time", Type::VARCHAR),
        field("slot_interval", Type::INT4),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![field("occupant_kind", Type::VARCHAR), field("occupant_id", Type::VARCHAR)]
}

/// Result columns by procedure or table name.
fn schema_for(relation: &str) -> Vec<FieldInfo> {
    match relation {
        "create_booking_safe" | "update_booking_safe" | "start_booking" | "complete_booking" | "cancel_booking"
        | "bookings" => booking_schema(),
        "create_unavailability_safe" | "unavailability" | "unavailability_blocks" => block_schema(),
        "create_barber" | "set_barber_active" | "barbers" => barber_schema(),
        "create_service" | "update_service" | "services" => service_schema(),
        "update_business_settings" | "business_settings" => settings_schema(),
        "check_conflict" => conflict_schema(),
        _ => Vec::new(),
    }
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    sql::relation_name(sql).map(|r| schema_for(&r)).unwrap_or_default()
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode_row: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_row(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode(reply: Reply) -> Response {
    match reply {
        Reply::Bookings(bookings) => rows(booking_schema(), bookings, |e, b| {
            e.encode_field(&b.id.to_string())?;
            e.encode_field(&b.barber_id.to_string())?;
            e.encode_field(&b.service_id.map(|s| s.to_string()))?;
            e.encode_field(&b.client_name)?;
            e.encode_field(&b.client_id.map(|c| c.to_string()))?;
            e.encode_field(&format_instant(b.span.start))?;
            e.encode_field(&format_instant(b.span.end))?;
            e.encode_field(&(b.duration_minutes as i32))?;
            e.encode_field(&b.price_at_booking.to_string())?;
            e.encode_field(&b.status.as_str())?;
            e.encode_field(&b.notes)?;
            e.encode_field(&format_instant(b.created_at))
        }),
        Reply::Blocks(blocks) => rows(block_schema(), blocks, |e, u| {
            e.encode_field(&u.id.to_string())?;
            e.encode_field(&u.barber_id.to_string())?;
            e.encode_field(&format_instant(u.span.start))?;
            e.encode_field(&format_instant(u.span.end))?;
            e.encode_field(&u.reason)
        }),
        Reply::Barbers(barbers) => rows(barber_schema(), barbers, |e, b| {
            e.encode_field(&b.id.to_string())?;
            e.encode_field(&b.name)?;
            e.encode_field(&b.is_active)?;
            e.encode_field(&format_instant(b.created_at))
        }),
        Reply::Services(services) => rows(service_schema(), services, |e, s| {
            e.encode_field(&s.id.to_string())?;
            e.encode_field(&s.name)?;
            e.encode_field(&(s.duration_minutes as i32))?;
            e.encode_field(&s.price.to_string())?;
            e.encode_field(&s.is_active)
        }),
        Reply::Settings(settings) => rows(settings_schema(), vec![settings], |e, s| {
            e.encode_field(&s.opening_time.format("%H:%M").to_string())?;
            e.encode_field(&s.closing_time.format("%H:%M").to_string())?;
            e.encode_field(&(s.slot_interval.minutes() as i32))
        }),
        Reply::Conflict(occupant) => rows(conflict_schema(), occupant.into_iter().collect(), |e, o| {
            e.encode_field(&o.kind())?;
            e.encode_field(&o.id().to_string())
        }),
        Reply::Deleted => Response::Execution(Tag::new("DELETE").with_rows(1)),
    }
}

/// `NOTIFY` payload: event name and the id it concerns.
fn event_payload(event: &Event) -> String {
    match event {
        Event::BarberCreated { id, .. } => format!("barber_created {id}"),
        Event::BarberUpdated { id, .. } => format!("barber_updated {id}"),
        Event::BarberDeleted { id } => format!("barber_deleted {id}"),
        Event::ServiceSaved { service } => format!("service_saved {}", service.id),
        Event::ServiceDeleted { id } => format!("service_deleted {id}"),
        Event::SettingsUpdated { .. } => "settings_updated".into(),
        Event::BookingCreated { booking } => format!("booking_created {}", booking.id),
        Event::BookingRescheduled { id, .. } => format!("booking_rescheduled {id}"),
        Event::BookingStatusChanged { id, status, .. } => format!("booking_{status} {id}"),
        Event::BookingDeleted { id, .. } => format!("booking_deleted {id}"),
        Event::UnavailabilityCreated { block } => format!("unavailability_created {}", block.id),
        Event::UnavailabilityDeleted { id, .. } => format!("unavailability_deleted {id}"),
    }
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for BarbercalHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let result = match sql::parse_sql(query) {
            Ok(cmd) => self.execute_command(cmd).await,
            Err(e) => Err(sql_err(e)),
        };
        self.flush_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BarbercalQueryParser;

#[async_trait]
impl QueryParser for BarbercalQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BarbercalHandler {
    type Statement = String;
    type QueryParser = BarbercalQueryParser;

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
        let result = match sql::parse_sql(&sql) {
            Ok(cmd) => self.execute_command(cmd).await,
            Err(e) => Err(sql_err(e)),
        };
        self.flush_notifications(client).await?;
        result
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password; the user name is not checked.
#[derive(Debug)]
pub struct PasswordSource {
    password: String,
}

impl PasswordSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BarbercalFactory {
    handler: Arc<BarbercalHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<PasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BarbercalFactory {
    pub fn new(engine: Arc<Engine>, zone: BusinessZone, password: String) -> Self {
        Self {
            handler: Arc::new(BarbercalHandler::new(engine, zone)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BarbercalFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    zone: BusinessZone,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BarbercalFactory::new(engine, zone, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::WalError(_)) {
        tracing::error!("{e}");
    } else {
        tracing::debug!(kind = e.kind().as_str(), "rejected: {e}");
    }
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}
