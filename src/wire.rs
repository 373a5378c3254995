use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::calendar::QualifiedRate;
use crate::engine::{now_ms, Engine, EngineError, ReserveRequest};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ReservationFilter, SqlError};

pub struct SlotwiseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlot {
                id,
                date,
                time_window,
                capacity,
            } => {
                let capacity = capacity.unwrap_or(engine.booking().default_capacity);
                engine
                    .create_slot(id, date, time_window, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots { date } => {
                let slots = engine.list_slots(date).await;
                Ok(slot_rows(slots))
            }
            Command::Reserve {
                id,
                date,
                time_window,
                hold_seconds,
                shipping,
            } => {
                let request = ReserveRequest {
                    id,
                    date,
                    time_window,
                    hold: hold_seconds.map(Duration::from_secs),
                    shipping,
                };
                engine.reserve(request).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Confirm {
                reservation_id,
                order_id,
            } => {
                engine
                    .confirm(reservation_id, order_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Release { id } => {
                engine.release(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ReleaseExpired => {
                let expired = engine
                    .release_expired_reservations()
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(expired)))
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::All => engine.list_reservations(None).await,
                    ReservationFilter::Slot(slot_id) => engine.list_reservations(Some(slot_id)).await,
                    ReservationFilter::Id(id) => engine.get_reservation(&id).await.map(|r| vec![r]),
                }
                .map_err(engine_err)?;
                Ok(reservation_rows(reservations))
            }
            Command::SelectDeliveryDates { date } => {
                let calendar = engine.calendar();
                let now = now_ms();
                let min_date = calendar.min_selectable_delivery_date(now);
                let (date, selectable) = match date {
                    Some(d) => (d, calendar.is_selectable_delivery_date(d, now)),
                    None => (min_date, true),
                };
                let schema = Arc::new(delivery_date_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&date.to_string())?;
                encoder.encode_field(&selectable)?;
                encoder.encode_field(&min_date.to_string())?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectShipDate {
                delivery_date,
                transit_days,
            } => {
                let ship_date = engine
                    .calendar()
                    .calculate_ship_date(delivery_date, transit_days, now_ms());
                let schema = Arc::new(ship_date_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&delivery_date.to_string())?;
                encoder.encode_field(&i64::from(transit_days))?;
                encoder.encode_field(&ship_date.map(|d| d.to_string()))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectQualifyingRates {
                delivery_date,
                rates,
            } => {
                let qualified = engine
                    .calendar()
                    .qualifying_rates_for_delivery_date(&rates, delivery_date, now_ms());
                Ok(rate_rows(qualified))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("date"),
        text_field("time_window"),
        int_field("capacity"),
        int_field("reserved_count"),
        int_field("remaining"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("slot_id"),
        text_field("delivery_date"),
        text_field("time_window"),
        text_field("status"),
        int_field("expires_at"),
        text_field("order_id"),
        int_field("confirmed_at"),
        text_field("carrier"),
        text_field("service"),
        text_field("rate_id"),
        int_field("transit_days"),
        text_field("ship_date"),
    ]
}

fn delivery_date_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), bool_field("selectable"), text_field("min_date")]
}

fn ship_date_schema() -> Vec<FieldInfo> {
    vec![
        text_field("delivery_date"),
        int_field("transit_days"),
        text_field("ship_date"),
    ]
}

fn qualifying_rate_schema() -> Vec<FieldInfo> {
    vec![
        text_field("rate_id"),
        text_field("carrier"),
        text_field("service"),
        text_field("price"),
        int_field("estimated_days"),
        int_field("transit_days"),
        bool_field("transit_inferred"),
        text_field("ship_date"),
    ]
}

fn slot_rows(slots: Vec<SlotInfo>) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<DataRow>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.date.to_string())?;
            encoder.encode_field(&slot.time_window)?;
            encoder.encode_field(&i64::from(slot.capacity))?;
            encoder.encode_field(&i64::from(slot.reserved_count))?;
            encoder.encode_field(&i64::from(slot.capacity.saturating_sub(slot.reserved_count)))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn reservation_rows(reservations: Vec<ReservationInfo>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<DataRow>> = reservations
        .into_iter()
        .map(|r| {
            let shipment = r.shipment.as_ref();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.slot_id.to_string())?;
            encoder.encode_field(&r.delivery_date.to_string())?;
            encoder.encode_field(&r.time_window)?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.expires_at)?;
            encoder.encode_field(&r.order_id)?;
            encoder.encode_field(&r.confirmed_at)?;
            encoder.encode_field(&shipment.and_then(|s| s.carrier.clone()))?;
            encoder.encode_field(&shipment.map(|s| s.service.clone()))?;
            encoder.encode_field(&shipment.map(|s| s.rate_id.clone()))?;
            encoder.encode_field(&shipment.map(|s| i64::from(s.transit_days)))?;
            encoder.encode_field(&shipment.map(|s| s.ship_date.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn rate_rows(rates: Vec<QualifiedRate>) -> Response {
    let schema = Arc::new(qualifying_rate_schema());
    let rows: Vec<PgWireResult<DataRow>> = rates
        .into_iter()
        .map(|rate| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rate.quote.rate_id)?;
            encoder.encode_field(&rate.quote.carrier)?;
            encoder.encode_field(&rate.quote.service)?;
            encoder.encode_field(&rate.quote.price)?;
            encoder.encode_field(&rate.quote.estimated_days.map(i64::from))?;
            encoder.encode_field(&i64::from(rate.transit_days))?;
            encoder.encode_field(&rate.transit_inferred)?;
            encoder.encode_field(&rate.ship_date.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

/// Table named after the first FROM of a SELECT, lowercased.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let after_from = lower.split_once(" from ")?.1;
    after_from
        .split(|c: char| c.is_whitespace() || c == ';')
        .find(|s| !s.is_empty())
        .map(|s| s.trim_matches('"').to_string())
}

/// Result columns a statement will produce, for Describe.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("slots") => slot_schema(),
        Some("reservations") => reservation_schema(),
        Some("delivery_dates") => delivery_date_schema(),
        Some("ship_dates") => ship_date_schema(),
        Some("qualifying_rates") => qualifying_rate_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut in_literal = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => in_literal = !in_literal,
            '$' if !in_literal => {
                let mut n = 0usize;
                let mut digits = 0;
                while let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
                    n = n.saturating_mul(10).saturating_add(d as usize);
                    digits += 1;
                    chars.next();
                }
                if digits > 0 {
                    max = max.max(n);
                }
            }
            _ => {}
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over `sql`: each `$N` outside a quoted literal is
/// replaced by parameter N as a quoted string. Inserted text is never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

/// One password for every client, whatever user name it logs in with.
#[derive(Debug)]
struct SharedPassword(Vec<u8>);

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.0.clone()))
    }
}

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotwiseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword(password.into_bytes()),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotwiseFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDate(_) => "SL001",
        EngineError::CapacityExhausted { .. } => "SL002",
        EngineError::NotFound(_) => "SL003",
        EngineError::AlreadyFinalized { .. } => "SL004",
        EngineError::Expired(_) => "SL005",
        EngineError::ImpossibleShipDate { .. } => "SL006",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Limit(_) => "54000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
