use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;
use ulid::Ulid;

use crate::auth::{RoomBookAuthSource, ANONYMOUS};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, SqlError, UserFilter};

pub struct RoomBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// The session's user, or `None` for an anonymous session.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Option<Ulid>> {
        let login = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or(ANONYMOUS);
        if login == ANONYMOUS {
            return Ok(None);
        }
        self.engine
            .resolve_login(login)
            .map(Some)
            .ok_or_else(|| user_error("28000", format!("unknown user {login:?}")))
    }

    async fn run(
        &self,
        actor: Option<Ulid>,
        sql_text: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(actor, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!("{label} by {actor:?}: {status}");
        result
    }

    async fn register(
        &self,
        actor: Option<Ulid>,
        id: Option<Ulid>,
        name: String,
        email: String,
        credential: String,
        system_admin: bool,
    ) -> PgWireResult<Response> {
        let new = NewUser {
            id: id.unwrap_or_else(Ulid::new),
            name,
            email,
            credential_hash: credential,
            system_admin,
        };
        self.engine
            .register_user(actor, new)
            .await
            .map_err(engine_err)?;
        Ok(inserted())
    }

    async fn execute_command(
        &self,
        actor: Option<Ulid>,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;

        // Registration is the only statement an anonymous session may run.
        let Some(actor) = actor else {
            return match cmd {
                Command::InsertUser {
                    id,
                    name,
                    email,
                    credential,
                    system_admin,
                } => self.register(None, id, name, email, credential, system_admin).await,
                _ => Err(user_error(
                    "28000",
                    "anonymous sessions may only register users".into(),
                )),
            };
        };

        match cmd {
            Command::InsertUser {
                id,
                name,
                email,
                credential,
                system_admin,
            } => {
                self.register(Some(actor), id, name, email, credential, system_admin)
                    .await
            }
            Command::InsertRoom {
                id,
                title,
                description,
            } => {
                let new = NewRoom {
                    id: id.unwrap_or_else(Ulid::new),
                    title,
                    description,
                };
                engine.create_room(actor, new).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateRoom { id, patch } => {
                engine
                    .update_room(actor, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(actor, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertMember {
                room_id,
                email,
                role,
            } => {
                engine
                    .add_member(actor, room_id, &email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteMember { room_id, user_id } => {
                engine
                    .remove_member(actor, room_id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertBooking {
                id,
                room_id,
                start,
                end,
                title,
                description,
            } => {
                let new = NewBooking {
                    id: id.unwrap_or_else(Ulid::new),
                    room_id,
                    start,
                    end,
                    title,
                    description,
                };
                engine.create_booking(actor, new).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateBooking { id, patch } => {
                engine
                    .update_booking(actor, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertParticipant { booking_id } => {
                engine
                    .join_booking(actor, booking_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteParticipant { booking_id } => {
                engine
                    .leave_booking(actor, booking_id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectUsers { filter } => {
                let user = match filter {
                    UserFilter::Me => engine.get_user(&actor),
                    UserFilter::Id(id) => engine.get_user(&id),
                    UserFilter::Email(email) => engine.find_user_by_email(&email).ok(),
                };
                let users: Vec<UserInfo> = user.into_iter().collect();
                encode_rows(Table::Users, format, &users, |enc, u| {
                    enc.encode_field(&u.id.to_string())?;
                    enc.encode_field(&u.name)?;
                    enc.encode_field(&u.email)?;
                    enc.encode_field(&u.system_admin)?;
                    enc.encode_field(&format_instant(u.created_at))
                })
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => vec![engine.get_room_info(actor, id).await.map_err(engine_err)?],
                    None => engine.list_rooms(actor).await,
                };
                encode_rows(Table::Rooms, format, &rooms, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.title)?;
                    enc.encode_field(&r.description)?;
                    enc.encode_field(&format_instant(r.created_at))?;
                    enc.encode_field(&(r.member_count as i64))?;
                    enc.encode_field(&r.role.map(|role| role.as_str().to_string()))
                })
            }
            Command::SelectMembers { room_id } => {
                let members = engine
                    .list_members(actor, room_id)
                    .await
                    .map_err(engine_err)?;
                encode_rows(Table::Members, format, &members, |enc, m| {
                    enc.encode_field(&m.room_id.to_string())?;
                    enc.encode_field(&m.user_id.to_string())?;
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&m.email)?;
                    enc.encode_field(&m.role.as_str().to_string())
                })
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Mine => engine.list_user_bookings(actor).await,
                    BookingFilter::Id(id) => {
                        vec![engine.get_booking(actor, id).await.map_err(engine_err)?]
                    }
                    BookingFilter::Room(room_id) => engine
                        .list_room_bookings(actor, room_id)
                        .await
                        .map_err(engine_err)?,
                };
                encode_rows(Table::Bookings, format, &bookings, |enc, b| {
                    let participants: Vec<String> =
                        b.participants.iter().map(|p| p.user_id.to_string()).collect();
                    let participants = serde_json::to_string(&participants)
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.room_id.to_string())?;
                    enc.encode_field(&b.created_by.to_string())?;
                    enc.encode_field(&format_instant(b.span.start))?;
                    enc.encode_field(&format_instant(b.span.end))?;
                    enc.encode_field(&b.title)?;
                    enc.encode_field(&b.description)?;
                    enc.encode_field(&format_instant(b.created_at))?;
                    enc.encode_field(&participants)
                })
            }
            Command::SelectParticipants { booking_id } => {
                let participants = engine
                    .list_participants(actor, booking_id)
                    .await
                    .map_err(engine_err)?;
                encode_rows(Table::Participants, format, &participants, |enc, p| {
                    enc.encode_field(&p.booking_id.to_string())?;
                    enc.encode_field(&p.user_id.to_string())?;
                    enc.encode_field(&format_instant(p.joined_at))
                })
            }
            Command::SelectConflicts {
                room_id,
                start,
                end,
                exclude,
            } => {
                let conflict = engine
                    .has_conflict(actor, room_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                encode_rows(Table::Conflicts, format, &[conflict], |enc, c| {
                    enc.encode_field(&room_id.to_string())?;
                    enc.encode_field(&format_instant(start))?;
                    enc.encode_field(&format_instant(end))?;
                    enc.encode_field(c)
                })
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

/// Unix milliseconds as RFC 3339 in UTC. Out-of-range values fall back to the raw number.
pub fn format_instant(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

// ── Result schemas ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Users,
    Rooms,
    Members,
    Bookings,
    Participants,
    Conflicts,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "users" => Some(Self::Users),
            "rooms" => Some(Self::Rooms),
            "members" => Some(Self::Members),
            "bookings" => Some(Self::Bookings),
            "participants" => Some(Self::Participants),
            "conflicts" => Some(Self::Conflicts),
            _ => None,
        }
    }

    fn columns(self) -> Vec<(&'static str, Type)> {
        match self {
            Self::Users => vec![
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("email", Type::VARCHAR),
                ("system_admin", Type::BOOL),
                ("created_at", Type::VARCHAR),
            ],
            Self::Rooms => vec![
                ("id", Type::VARCHAR),
                ("title", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("created_at", Type::VARCHAR),
                ("member_count", Type::INT8),
                ("role", Type::VARCHAR),
            ],
            Self::Members => vec![
                ("room_id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("email", Type::VARCHAR),
                ("role", Type::VARCHAR),
            ],
            Self::Bookings => vec![
                ("id", Type::VARCHAR),
                ("room_id", Type::VARCHAR),
                ("created_by", Type::VARCHAR),
                ("start", Type::VARCHAR),
                ("end", Type::VARCHAR),
                ("title", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("created_at", Type::VARCHAR),
                ("participants", Type::VARCHAR),
            ],
            Self::Participants => vec![
                ("booking_id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("joined_at", Type::VARCHAR),
            ],
            Self::Conflicts => vec![
                ("room_id", Type::VARCHAR),
                ("start", Type::VARCHAR),
                ("end", Type::VARCHAR),
                ("conflict", Type::BOOL),
            ],
        }
    }

    fn schema(self, format: &Format) -> Vec<FieldInfo> {
        self.columns()
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                FieldInfo::new(name.to_string(), None, None, ty, format.format_for(i))
            })
            .collect()
    }
}

/// Result columns of a statement, for Describe. Non-SELECT statements have none.
fn describe_columns(sql_text: &str, format: &Format) -> Vec<FieldInfo> {
    sql::select_table(sql_text)
        .and_then(|t| Table::from_name(&t))
        .map(|t| t.schema(format))
        .unwrap_or_default()
}

fn encode_rows<T>(
    table: Table,
    format: &Format,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(table.schema(format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let response = self.run(actor, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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
        Ok(describe_columns(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.run(actor, &sql, &portal.result_column_format).await
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
            describe_columns(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_columns(
            &target.statement.statement,
            &target.result_column_format,
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

/// Substitute `$n` placeholders with bound values as quoted text literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = RoomBookAuthSource::new(engine.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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
    let factory = RoomBookFactory::new(engine, password);
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

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_)
        | EngineError::UserNotFound(_)
        | EngineError::NotAParticipant { .. }
        | EngineError::NotAMember { .. } => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidInterval { .. } => "22007",
        EngineError::IntervalConflict(_) => "23P01",
        EngineError::AlreadyExists(_)
        | EngineError::AlreadyMember { .. }
        | EngineError::AlreadyJoined { .. }
        | EngineError::DuplicateEmail(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
