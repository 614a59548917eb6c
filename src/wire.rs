use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::auth::TeamSlotAuthSource;
use crate::engine::{DayAvailability, Engine};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct TeamSlotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TeamSlotQueryParser>,
}

impl TeamSlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TeamSlotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SetSchedule { owner, days } => {
                let count = days.len();
                engine.set_schedule(&owner, days).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::ClearSchedule { owner } => {
                engine.clear_schedule(&owner).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSchedule { owner } => {
                let config = engine.weekly_configuration(&owner).await;
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<_>> = config
                    .iter()
                    .map(|(weekday, window)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&owner)?;
                        encoder.encode_field(&weekday_name(weekday))?;
                        encoder.encode_field(&window.active)?;
                        encoder.encode_field(&window.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&window.end.format("%H:%M").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertMember { owner, identity } => {
                engine.add_member(&owner, identity).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteMember { owner, identity } => {
                engine.remove_member(&owner, identity).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectMembers { owner } => {
                let members = engine.members(&owner).await;
                let schema = Arc::new(members_schema());
                let rows: Vec<PgWireResult<_>> = members
                    .into_iter()
                    .map(|identity| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&owner)?;
                        encoder.encode_field(&identity.0)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertRequest {
                id,
                owner,
                start,
                end,
                guest,
            } => {
                let span = Span::try_new(start, end).ok_or_else(|| {
                    engine_err(crate::engine::EngineError::InvalidInput("start must be before end"))
                })?;
                engine.submit_request(id, &owner, span, guest).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ApproveRequest { id } => {
                let request = engine.approve_request(id).await.map_err(engine_err)?;
                info!(request = %id, owner = %request.owner, "request approved");
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeclineRequest { id } => {
                engine.decline_request(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRequests { owner } => {
                let requests = engine.list_requests(&owner).await;
                let schema = Arc::new(requests_schema());
                let rows: Vec<PgWireResult<_>> = requests
                    .into_iter()
                    .map(|r| {
                        let link = match &r.status {
                            RequestStatus::Confirmed { link, .. } => link.clone(),
                            _ => None,
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.owner)?;
                        encoder.encode_field(&r.span.start)?;
                        encoder.encode_field(&r.span.end)?;
                        encoder.encode_field(&r.guest_name)?;
                        encoder.encode_field(&r.guest_email)?;
                        encoder.encode_field(&r.note)?;
                        encoder.encode_field(&r.status.label())?;
                        encoder.encode_field(&link)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { owner, date } => {
                let cancel = self.tenant_manager.shutdown_token().child_token();
                let report = engine.compute_slots(&owner, date, &cancel).await.map_err(engine_err)?;

                match &report.availability {
                    DayAvailability::Inactive => debug!(owner = %owner, %date, "inactive day"),
                    DayAvailability::Open { slots, .. } if slots.is_empty() => {
                        debug!(owner = %owner, %date, "no free slot in working hours")
                    }
                    DayAvailability::Open { .. } => {}
                }

                let unverified: Option<String> = if report.unverified.is_empty() {
                    None
                } else {
                    Some(
                        report
                            .unverified
                            .iter()
                            .map(CalendarId::as_str)
                            .collect::<Vec<_>>()
                            .join(","),
                    )
                };

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = report
                    .slots()
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&owner)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&unverified)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SetCredential { identity, token } => {
                self.tenant_manager.credentials().set(identity, token);
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteCredential { identity } => {
                let removed = self.tenant_manager.credentials().remove(&identity);
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(removed)))])
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("owner", Type::VARCHAR),
        text_field("weekday", Type::VARCHAR),
        text_field("active", Type::BOOL),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
    ]
}

fn members_schema() -> Vec<FieldInfo> {
    vec![text_field("owner", Type::VARCHAR), text_field("identity", Type::VARCHAR)]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("guest_name", Type::VARCHAR),
        text_field("guest_email", Type::VARCHAR),
        text_field("note", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("link", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("owner", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("unverified", Type::VARCHAR),
    ]
}

/// Result columns of a SELECT, looked up by the table after FROM.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut tokens = sql.split_whitespace();
    if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("SELECT")) {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| !t.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_lowercase());
    match table.as_deref() {
        Some("schedules") => schedules_schema(),
        Some("members") => members_schema(),
        Some("requests") => requests_schema(),
        Some("slots") => slots_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for TeamSlotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TeamSlotQueryParser;

#[async_trait]
impl QueryParser for TeamSlotQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TeamSlotHandler {
    type Statement = String;
    type QueryParser = TeamSlotQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so $1 never clobbers the prefix of $10.
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

pub struct TeamSlotFactory {
    handler: Arc<TeamSlotHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<TeamSlotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TeamSlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TeamSlotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TeamSlotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TeamSlotFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = TeamSlotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
