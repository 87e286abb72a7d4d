use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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

use crate::automation::local_now;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
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

    /// Run every statement of a simple query in order. Execution stops at the
    /// first failure; statements before it stay applied.
    async fn run_batch<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match run_command(&engine, cmd).await {
                Ok(mut out) => responses.append(&mut out),
                Err(e) if responses.is_empty() => return Err(engine_err(e)),
                Err(e) => {
                    responses.push(Response::Error(Box::new(error_info(&e))));
                    break;
                }
            }
        }
        Ok(responses)
    }

    async fn run_query<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        run_command(&engine, cmd).await.map_err(engine_err)
    }
}

async fn run_command(engine: &Engine, cmd: Command) -> Result<Vec<Response>, EngineError> {
    let label = observability::command_label(&cmd);
    let started = Instant::now();
    let result = execute_command(engine, cmd).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
    metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::debug!(tenant = %engine.tenant, command = label, error = %e, "query failed");
    }
    result
}

fn executed(tag: &str) -> Vec<Response> {
    vec![Response::Execution(Tag::new(tag).with_rows(1))]
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Vec<Response>, EngineError> {
    match cmd {
        Command::SetAvailability { window } => {
            engine.set_availability(window).await?;
            Ok(executed("INSERT"))
        }
        Command::DefineService { service } => {
            engine.define_service(service).await?;
            Ok(executed("INSERT"))
        }
        Command::DefineFormTemplate { template } => {
            engine.define_form_template(template).await?;
            Ok(executed("INSERT"))
        }
        Command::UpsertContact { contact } => {
            engine.upsert_contact(contact).await?;
            Ok(executed("INSERT"))
        }
        Command::SetPause { contact_id, paused } => {
            engine.set_automation_paused(contact_id, paused).await?;
            Ok(executed("INSERT"))
        }
        Command::UpdateSettings { settings } => {
            engine.update_settings(settings).await?;
            Ok(executed("INSERT"))
        }
        Command::InsertBooking {
            id,
            contact_id,
            service_id,
            date,
            start,
        } => {
            engine.create_booking(id, contact_id, service_id, date, start).await?;
            Ok(executed("INSERT"))
        }
        Command::RescheduleBooking { id, date, start } => {
            engine.reschedule_booking(id, date, start).await?;
            Ok(executed("INSERT"))
        }
        Command::SetBookingStatus { id, status } => {
            engine.set_booking_status(id, status).await?;
            Ok(executed("INSERT"))
        }
        Command::CancelBooking { id } => {
            engine.cancel_booking(id).await?;
            Ok(executed("DELETE"))
        }
        Command::InsertForm {
            id,
            contact_id,
            due_at,
            max_reminders,
        } => {
            let mut item = PendingReminderItem::new(id, contact_id, due_at);
            item.max_reminders = max_reminders;
            engine.create_form_item(item).await?;
            Ok(executed("INSERT"))
        }
        Command::CompleteForm { id } => {
            engine.complete_form_item(id, local_now()).await?;
            Ok(executed("INSERT"))
        }
        Command::SelectSlots { service_id, date } => {
            let slots = engine.available_slots(service_id, date).await?;
            let schema = Arc::new(slots_schema());
            let rows: Vec<PgWireResult<_>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&slot.span.start_time().to_string())?;
                    encoder.encode_field(&slot.span.end_time().to_string())?;
                    encoder.encode_field(&slot.available)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectSlotCheck { date, span, exclude } => {
            let available = engine.is_slot_available(date, span, exclude).await;
            let schema = Arc::new(slot_check_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            let row = encoder.encode_field(&available).map(|()| encoder.take_row());
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))])
        }
        Command::SelectBookings { date } => {
            let bookings = engine.bookings_on(date).await;
            let schema = Arc::new(bookings_schema());
            let rows: Vec<PgWireResult<_>> = bookings
                .into_iter()
                .map(|b| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&b.id.to_string())?;
                    encoder.encode_field(&b.contact_id.to_string())?;
                    encoder.encode_field(&b.service_id.to_string())?;
                    encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
                    encoder.encode_field(&b.span.start_time().to_string())?;
                    encoder.encode_field(&b.span.end_time().to_string())?;
                    encoder.encode_field(&b.status.as_str().to_string())?;
                    encoder.encode_field(&b.reminder_sent)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectForms { booking_id } => {
            let items = engine.forms_for_booking(booking_id).await;
            let schema = Arc::new(forms_schema());
            let rows: Vec<PgWireResult<_>> = items
                .into_iter()
                .map(|item| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&item.id.to_string())?;
                    encoder.encode_field(&item.contact_id.to_string())?;
                    encoder.encode_field(&item.template_id.map(|t| t.to_string()))?;
                    encoder.encode_field(&item.due_at.format("%Y-%m-%dT%H:%M:%S").to_string())?;
                    encoder.encode_field(&item.status.as_str().to_string())?;
                    encoder.encode_field(&i64::from(item.reminder_count))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("start_time"), text_field("end_time"), bool_field("available")]
}

fn slot_check_schema() -> Vec<FieldInfo> {
    vec![bool_field("available")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("contact_id"),
        text_field("service_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        bool_field("reminder_sent"),
    ]
}

fn forms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("contact_id"),
        text_field("template_id"),
        text_field("due_at"),
        text_field("status"),
        FieldInfo::new("reminder_count".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Result columns for a statement that has not been bound yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("SLOT_CHECK") {
        slot_check_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("FORMS") {
        forms_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
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
        self.run_batch(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let responses = self.run_query(client, &sql).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("no response for statement".into()))
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

/// Inline bound text parameters as quoted literals. Replaced from the
/// highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// One shared cleartext password for every user; the database name picks the tenant.
#[derive(Debug)]
pub struct SlotdAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for SlotdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotdAuthSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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
    let factory = SlotdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

/// SQLSTATE reported for each engine failure.
fn error_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidInput(_) | EngineError::Configuration(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn error_info(e: &EngineError) -> ErrorInfo {
    ErrorInfo::new("ERROR".into(), error_code(e).into(), e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(error_info(&e)))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots WHERE service_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("SELECT * FROM bookings WHERE date = $10"), 10);
        assert_eq!(count_params("SELECT '$' FROM bookings"), 0);
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(result_schema("select * from slots where date = $1").len(), 3);
        assert_eq!(result_schema("SELECT * FROM slot_check WHERE date = $1").len(), 1);
        assert_eq!(result_schema("SELECT * FROM bookings WHERE date = $1").len(), 8);
        assert_eq!(result_schema("SELECT * FROM forms WHERE booking_id = $1").len(), 6);
        assert!(result_schema("INSERT INTO bookings (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn conflict_maps_to_exclusion_violation() {
        let err = EngineError::Conflict(ulid::Ulid::new());
        assert_eq!(error_code(&err), "23P01");
        assert!(err.to_string().starts_with("this time slot is no longer available"));
        assert_eq!(error_code(&EngineError::LimitExceeded("too many bookings on this day")), "54000");
    }
}
