use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::timestamp::format_timestamp;

pub struct SpaceBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SpaceBookQueryParser>,
}

impl SpaceBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SpaceBookQueryParser),
        }
    }

    /// Run one command, recording its RED metrics. Rows are encoded in
    /// `format`, which the extended protocol lets the client choose.
    async fn execute(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSpace { name, capacity, returning } => {
                let id = engine.register_space(name, capacity).await?;
                Ok(inserted(id, returning, format))
            }
            Command::UpdateSpace { id, name, capacity } => {
                engine.update_space(id, name, capacity).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSpace { id } => {
                engine.delete_space(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation { space_id, start, end, returning } => {
                let id = engine
                    .create_reservation(space_id, Window::new(start, end))
                    .await?;
                Ok(inserted(id, returning, format))
            }
            Command::UpdateReservation { id, start, end } => {
                engine
                    .update_reservation_time(id, Window::new(start, end))
                    .await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSpaces { id } => {
                let spaces = match id {
                    Some(id) => vec![engine.get_space(id).await?],
                    None => engine.list_spaces().await,
                };
                Ok(space_rows(spaces, format))
            }
            Command::SelectReservations { id, space_id } => {
                let reservations = match (id, space_id) {
                    (Some(id), filter) => {
                        let r = engine.get_reservation(id).await?;
                        if filter.is_some_and(|sid| sid != r.space_id) {
                            Vec::new()
                        } else {
                            vec![r]
                        }
                    }
                    (None, Some(space_id)) => engine.list_reservations_by_space(space_id).await,
                    (None, None) => engine.list_reservations().await,
                };
                Ok(reservation_rows(reservations, format))
            }
            Command::SelectConflicts { space_id, start, end, exclude } => {
                let conflicts = engine
                    .find_overlaps(space_id, Window::new(start, end), exclude)
                    .await;
                Ok(reservation_rows(conflicts, format))
            }
        }
    }
}

fn inserted(id: i64, returning: bool, format: &Format) -> Response {
    if !returning {
        return Response::Execution(Tag::new("INSERT").with_rows(1));
    }
    let schema = Arc::new(returning_schema(format));
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&id).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn space_rows(spaces: Vec<SpaceInfo>, format: &Format) -> Response {
    let schema = Arc::new(spaces_schema(format));
    let rows: Vec<PgWireResult<_>> = spaces
        .into_iter()
        .map(|space| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&space.id)?;
            encoder.encode_field(&space.name)?;
            encoder.encode_field(&i64::from(space.capacity))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<ReservationInfo>, format: &Format) -> Response {
    let schema = Arc::new(reservations_schema(format));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id)?;
            encoder.encode_field(&r.space_id)?;
            encoder.encode_field(&format_timestamp(r.start))?;
            encoder.encode_field(&format_timestamp(r.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn schema(columns: Vec<(&str, Type)>, format: &Format) -> Vec<FieldInfo> {
    columns
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
        .collect()
}

fn returning_schema(format: &Format) -> Vec<FieldInfo> {
    schema(vec![("id", Type::INT8)], format)
}

fn spaces_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        vec![
            ("id", Type::INT8),
            ("name", Type::VARCHAR),
            ("capacity", Type::INT8),
        ],
        format,
    )
}

/// Shared by `reservations` and `conflicts`. Times are RFC 3339 text in UTC.
fn reservations_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        vec![
            ("id", Type::INT8),
            ("space_id", Type::INT8),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
        ],
        format,
    )
}

/// Result columns a statement will produce, guessed from its text so
/// Describe can answer before parameters are bound.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") {
        returning_schema(format)
    } else if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("SPACES") {
        spaces_schema(format)
    } else if upper.contains("RESERVATIONS") || upper.contains("CONFLICTS") {
        reservations_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SpaceBookHandler {
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
        let commands = sql::parse_sql(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.execute(cmd, &Format::UnifiedText).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpaceBookQueryParser;

#[async_trait]
impl QueryParser for SpaceBookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpaceBookHandler {
    type Statement = String;
    type QueryParser = SpaceBookQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_single(&sql).map_err(sql_err)?;
        self.execute(cmd, &portal.result_column_format).await
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// A `$<digits>` placeholder starting at byte `i`: its index and the byte
/// just past it.
fn placeholder_at(sql: &str, i: usize) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    if bytes.get(i) != Some(&b'$') {
        return None;
    }
    let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
    let end = i + 1 + digits;
    sql[i + 1..end].parse().ok().map(|n| (n, end))
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut i = 0;
    while i < sql.len() {
        match placeholder_at(sql, i) {
            Some((n, end)) => {
                max = max.max(n);
                i = end;
            }
            None => i += 1,
        }
    }
    max
}

/// Substitute $1, $2, ... with bound parameter values as quoted text.
/// One pass over the statement; substituted values are never rescanned.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < sql.len() {
        let Some((n, end)) = placeholder_at(sql, i) else {
            i += 1;
            continue;
        };
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            i = end;
            continue;
        };
        result.push_str(&sql[copied..i]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
        i = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpaceBookFactory {
    handler: Arc<SpaceBookHandler>,
    noop: Arc<NoopHandler>,
}

impl SpaceBookFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(SpaceBookHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpaceBookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SpaceBookFactory::new(engine));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::DuplicateName(_) => "23505",
        EngineError::SpaceNotFound(_) | EngineError::ReservationNotFound(_) => "P0002",
        EngineError::InvalidDuration { .. } => "23514",
        EngineError::OverlapConflict { .. } => "23P01",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::DatastoreUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}
