use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotgridAuthSource;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::engine::{EngineError, Scheduler};
use crate::grid::format_hhmm;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotgridHandler {
    scheduler: Arc<Scheduler>,
    catalog: Arc<Catalog>,
    config: Arc<Config>,
    query_parser: Arc<SlotgridQueryParser>,
}

impl SlotgridHandler {
    pub fn new(scheduler: Arc<Scheduler>, catalog: Arc<Catalog>, config: Arc<Config>) -> Self {
        Self {
            scheduler,
            catalog,
            config,
            query_parser: Arc::new(SlotgridQueryParser),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<CallerId> {
        client
            .metadata()
            .get("user")
            .map(|user| CallerId::new(user.as_str()))
            .ok_or_else(|| user_error("28000", "no user name in startup packet".into()))
    }

    fn resolve_week(&self, week: i64) -> PgWireResult<WeekId> {
        self.config.week_id(week).ok_or_else(|| {
            user_error("22023", format!("unknown week {week}, term has weeks 1..={}", self.config.weeks))
        })
    }

    async fn run(&self, caller: &CallerId, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &CallerId, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::Place { week, course, day, slot } => {
                let week_id = self.resolve_week(week)?;
                let entry = self
                    .catalog
                    .get(&course)
                    .ok_or_else(|| user_error("22023", format!("unknown course {course:?}")))?;
                let placed = self
                    .scheduler
                    .place(&week_id, caller, entry, day, slot)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![self.reservation_response(week, std::slice::from_ref(&placed))])
            }
            Command::Move { week, id, day, slot } => {
                let week_id = self.resolve_week(week)?;
                let moved = self
                    .scheduler
                    .move_reservation(&week_id, caller, id, day, slot)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![self.reservation_response(week, std::slice::from_ref(&moved))])
            }
            Command::Delete { week, id } => {
                let week_id = self.resolve_week(week)?;
                let removed = self.scheduler.delete(&week_id, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(removed)))])
            }
            Command::SelectReservations { week } => {
                let week_id = self.resolve_week(week)?;
                let reservations = self.scheduler.reservations(&week_id).await.map_err(engine_err)?;
                Ok(vec![self.reservation_response(week, &reservations)])
            }
            Command::SelectSlots => {
                let schema = Arc::new(slot_schema());
                let grid = *self.scheduler.grid();
                let rows: Vec<PgWireResult<DataRow>> = (0..grid.slot_count())
                    .filter_map(|slot| grid.slot_bounds(slot).map(|bounds| (slot, bounds)))
                    .map(|(slot, (start, end))| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i64::from(slot))?;
                        encoder.encode_field(&format_hhmm(start))?;
                        encoder.encode_field(&format_hhmm(end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCourses => {
                let schema = Arc::new(course_schema());
                let rows: Vec<PgWireResult<DataRow>> = self
                    .catalog
                    .entries()
                    .iter()
                    .map(|entry| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.key())?;
                        encoder.encode_field(&entry.subject)?;
                        encoder.encode_field(&entry.cohort)?;
                        encoder.encode_field(&entry.owner)?;
                        encoder.encode_field(&color_for_subject(&entry.subject).to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }

    fn reservation_response(&self, week: i64, reservations: &[Reservation]) -> Response {
        let schema = Arc::new(reservation_schema());
        let grid = self.scheduler.grid();
        let rows: Vec<PgWireResult<DataRow>> = reservations
            .iter()
            .map(|r| {
                let start = grid.slot_bounds(r.start_slot).map(|(start, _)| format_hhmm(start));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&r.id.to_string())?;
                encoder.encode_field(&week)?;
                encoder.encode_field(&r.day.to_string())?;
                encoder.encode_field(&i64::from(r.start_slot))?;
                encoder.encode_field(&i64::from(r.duration_slots))?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&r.subject)?;
                encoder.encode_field(&r.cohort)?;
                encoder.encode_field(&r.owner)?;
                encoder.encode_field(&r.color)?;
                encoder.encode_field(&r.uid)?;
                encoder.encode_field(&r.updated_at)?;
                Ok(encoder.take_row())
            })
            .collect();
        Response::Query(QueryResponse::new(schema, stream::iter(rows)))
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("week", Type::INT8),
        text_field("day", Type::VARCHAR),
        text_field("slot", Type::INT8),
        text_field("duration", Type::INT8),
        text_field("start", Type::VARCHAR),
        text_field("subject", Type::VARCHAR),
        text_field("cohort", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
        text_field("color", Type::VARCHAR),
        text_field("uid", Type::VARCHAR),
        text_field("updated_at", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("slot", Type::INT8),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
    ]
}

fn course_schema() -> Vec<FieldInfo> {
    vec![
        text_field("key", Type::VARCHAR),
        text_field("subject", Type::VARCHAR),
        text_field("cohort", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
        text_field("color", Type::VARCHAR),
    ]
}

/// Row shape a statement will produce, judged from its table name. Used to
/// describe prepared statements before their parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    if words.first() == Some(&"DELETE") {
        return vec![];
    }
    match words.iter().find(|w| matches!(**w, "RESERVATIONS" | "MOVES" | "SLOTS" | "COURSES")) {
        Some(&"RESERVATIONS") | Some(&"MOVES") => reservation_schema(),
        Some(&"SLOTS") => slot_schema(),
        Some(&"COURSES") => course_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotgridHandler {
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
        let caller = self.resolve_caller(client)?;
        self.run(&caller, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotgridQueryParser;

#[async_trait]
impl QueryParser for SlotgridQueryParser {
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
impl ExtendedQueryHandler for SlotgridHandler {
    type Statement = String;
    type QueryParser = SlotgridQueryParser;

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
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        let responses = self.run(&caller, &sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(i + 1);
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each `$N` outside string literals with parameter N as a quoted
/// literal. One left-to-right pass, so inlined text is never rescanned.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let param = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match param {
                    Some(value) => {
                        out.push_str(&sql[copied..i]);
                        match value {
                            Some(raw) => {
                                out.push('\'');
                                out.push_str(&String::from_utf8_lossy(raw.as_ref()).replace('\'', "''"));
                                out.push('\'');
                            }
                            None => out.push_str("NULL"),
                        }
                        copied = end;
                        i = end;
                    }
                    None => i = end.max(i + 1),
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotgridFactory {
    handler: Arc<SlotgridHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotgridAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotgridFactory {
    pub fn new(handler: Arc<SlotgridHandler>, password: String) -> Self {
        let auth_source = SlotgridAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler,
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotgridFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    handler: Arc<SlotgridHandler>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = SlotgridFactory::new(handler, password);
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::OutOfRange { .. } => "22003",
        EngineError::SlotOccupied { .. } | EngineError::SlotCollision { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Contention { .. } => "40001",
        EngineError::Store(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::BadDay(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let key = crate::slot_key::SlotKey::encode(Day::Mon, 1);
        let cases = [
            (EngineError::OutOfRange { day: Day::Mon, start: 10, slot_count: 10 }, "22003"),
            (EngineError::SlotOccupied { key: key.clone(), holder: Ulid::new() }, "23P01"),
            (EngineError::SlotCollision { key, holder: Ulid::new() }, "23P01"),
            (EngineError::NotFound(Ulid::new()), "P0002"),
            (EngineError::Contention { attempts: 5 }, "40001"),
            (EngineError::Store(crate::store::StoreError::Wal("disk full".into())), "58030"),
        ];
        for (err, code) in cases {
            assert_eq!(engine_sqlstate(&err), code, "{err}");
        }
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM slots").len(), 3);
        assert_eq!(result_schema("select * from courses").len(), 5);
        assert_eq!(result_schema("SELECT * FROM reservations WHERE week = $1").len(), 12);
        assert_eq!(result_schema("INSERT INTO moves (week, id, day, slot) VALUES ($1, $2, $3, $4)").len(), 12);
        assert!(result_schema("DELETE FROM reservations WHERE week = $1 AND id = $2").is_empty());
        assert!(result_schema("SELECT 1").is_empty());
    }

    #[test]
    fn counts_placeholders() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
        assert_eq!(count_params("SELECT '$' FROM t"), 0);
    }

    #[test]
    fn inlined_values_are_not_rescanned() {
        let params = vec![Some(b"1".to_vec()), Some(b"COST $1 X|1A|P".to_vec())];
        assert_eq!(
            inline_params("VALUES ($1, $2, 'Mon', 3)", &params),
            "VALUES ('1', 'COST $1 X|1A|P', 'Mon', 3)"
        );
    }

    #[test]
    fn inline_quotes_nulls_and_wide_indexes() {
        let mut params: Vec<Option<Vec<u8>>> = (1..=10).map(|n| Some(n.to_string().into_bytes())).collect();
        params[2] = None;
        params[3] = Some(b"it's".to_vec());
        assert_eq!(
            inline_params("$10 $1 $3 $4 '$2' $11", &params),
            "'10' '1' NULL 'it''s' '$2' $11"
        );
    }
}
