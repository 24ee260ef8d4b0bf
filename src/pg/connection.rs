//! PostgreSQL connection and query executor.
//!
//! This module provides the main connection type that handles:
//! - Dispatch of statements through the five execution modes
//! - Named statement and description caching, with invalidation
//! - Transaction status tracking and rollback cleanup
//! - Cancellation and deadlines through the out-of-band cancel channel
//!
//! A connection serves one operation at a time: every call takes `&mut self`
//! and cursors borrow the connection until their statement completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::config::{PgConfig, QueryExecMode};
use super::error::{PgError, PgResult, ServerError};
use super::protocol::*;
use super::query::QueryOptions;
use super::rows::{CommandTag, Row, RowCursor};
use super::sanitize;
use super::startup::{handshake, StartupInfo};
use super::statement::{statement_name, DescriptionCache, StatementCache, StatementDescription};
use super::transport::{BackendKey, CancelRequester, Socket, TcpCancelRequester};
use super::types::{Format, Oid, TypeMap, Value};

const READ_BUFFER_SIZE: usize = 32 * 1024;
const WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Cache entry an execution used, invalidated if the execution reports a
/// stale plan or is cancelled. Descriptions go on any server error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheKey {
    None,
    Statement(String),
    Description(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Ready,
    Broken(String),
    Closed,
}

/// A statement prepared through [`PgConnection::prepare`].
#[derive(Debug, Clone)]
struct Prepared {
    statement: Arc<StatementDescription>,
    tx_scoped: bool,
}

// ============================================================================
// Cancellation state of the running operation
// ============================================================================

#[derive(Debug, Default)]
struct Interrupt {
    deadline: Option<Instant>,
    cancel: Option<super::query::CancelSignal>,
    /// Set once a cancel request went out; reported instead of 57014
    fired: Option<PgError>,
    /// Hard deadline for the server to answer the cancel
    grace_until: Option<Instant>,
}

enum Wake {
    Read(std::io::Result<usize>),
    Fired(PgError),
    GraceExpired,
}

impl Interrupt {
    async fn wait(&self) -> Wake {
        if self.fired.is_some() {
            return match self.grace_until {
                Some(until) => {
                    tokio::time::sleep_until(until).await;
                    Wake::GraceExpired
                }
                None => std::future::pending().await,
            };
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.cancel {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = deadline => Wake::Fired(PgError::Timeout),
            _ = cancelled => Wake::Fired(PgError::Cancelled),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    /// Authenticated stream to the backend
    stream: Box<dyn Socket>,
    /// Read buffer for incoming messages
    read_buffer: BytesMut,
    /// Pipelined outgoing messages, written on flush
    write_buffer: BytesMut,
    /// Connection configuration
    config: PgConfig,
    /// Codecs for this connection
    type_map: TypeMap,
    /// Named statements for `cache_statement`
    statements: StatementCache,
    /// Descriptions for `cache_describe`
    descriptions: DescriptionCache,
    /// Statements prepared explicitly, by caller-chosen name
    prepared: HashMap<String, Prepared>,
    /// Server-side statements to close before the next operation
    closing: Vec<String>,
    /// Current transaction status
    transaction_status: TransactionStatus,
    /// Identifies the session to the cancel channel
    backend_key: Option<BackendKey>,
    canceller: Option<Arc<dyn CancelRequester>>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    state: State,
    /// ReadyForQuery messages still owed by the server
    pending: usize,
    /// A write was abandoned part way; the stream framing is unknown
    writing: bool,
    /// In COPY IN mode without CopyDone/CopyFail sent yet
    copy_in_progress: bool,
    /// A ROLLBACK completed since the last ReadyForQuery
    saw_rollback: bool,
    interrupt: Interrupt,
}

impl PgConnection {
    /// Connect to a PostgreSQL server.
    pub async fn connect(url: &str) -> PgResult<Self> {
        let config = PgConfig::from_url(url)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration, authenticating with trust,
    /// cleartext or MD5.
    pub async fn connect_with_config(config: PgConfig) -> PgResult<Self> {
        let mut stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;

        let startup = handshake(&mut stream, &config).await?;
        debug!(host = %config.host, port = config.port, database = %config.database, "connected");

        let canceller = Arc::new(TcpCancelRequester::new(&config.host, config.port));
        Ok(Self::from_socket(stream, startup, config).with_canceller(canceller))
    }

    /// Wrap an already-authenticated stream positioned after the first
    /// ReadyForQuery.
    pub fn from_socket(socket: impl Socket, startup: StartupInfo, config: PgConfig) -> Self {
        Self {
            stream: Box::new(socket),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buffer: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            type_map: TypeMap::new(),
            statements: StatementCache::new(config.statement_cache_capacity),
            descriptions: DescriptionCache::new(config.description_cache_capacity),
            prepared: HashMap::new(),
            closing: Vec::new(),
            transaction_status: startup.transaction_status,
            backend_key: startup.backend_key,
            canceller: None,
            parameters: startup.parameters,
            state: State::Ready,
            pending: 0,
            writing: false,
            copy_in_progress: false,
            saw_rollback: false,
            interrupt: Interrupt::default(),
            config,
        }
    }

    /// Channel used to deliver cancel requests.
    pub fn with_canceller(mut self, canceller: Arc<dyn CancelRequester>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    /// Replace the type map. Registration must finish before the connection
    /// is used.
    pub fn with_type_map(mut self, type_map: TypeMap) -> Self {
        self.type_map = type_map;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }

    pub fn type_map_mut(&mut self) -> &mut TypeMap {
        &mut self.type_map
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Get a server parameter value.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    pub fn prepared_statement(&self, name: &str) -> Option<Arc<StatementDescription>> {
        self.prepared.get(name).map(|p| Arc::clone(&p.statement))
    }

    /// Whether the last operation left the connection usable. Unread
    /// replies of an abandoned operation do not count: they are drained
    /// before the next one.
    pub fn is_healthy(&self) -> bool {
        self.state == State::Ready && !self.writing
    }

    fn in_transaction(&self) -> bool {
        self.transaction_status != TransactionStatus::Idle
    }

    // ========================================================================
    // Public call surface
    // ========================================================================

    /// Execute a statement and return its command tag.
    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> PgResult<CommandTag> {
        self.exec_with(sql, args, &QueryOptions::default()).await
    }

    pub async fn exec_with(
        &mut self,
        sql: &str,
        args: &[Value],
        options: &QueryOptions,
    ) -> PgResult<CommandTag> {
        self.query_with(sql, args, options).await?.close().await
    }

    /// Execute a statement and stream its rows.
    pub async fn query(&mut self, sql: &str, args: &[Value]) -> PgResult<RowCursor<'_>> {
        self.query_with(sql, args, &QueryOptions::default()).await
    }

    pub async fn query_with(
        &mut self,
        sql: &str,
        args: &[Value],
        options: &QueryOptions,
    ) -> PgResult<RowCursor<'_>> {
        self.begin_op(options)?;

        let rewritten = match &options.rewriter {
            Some(rewriter) => match rewriter.rewrite(&self.type_map, sql, args) {
                Ok(rewritten) => Some(rewritten),
                Err(err) => {
                    self.end_op();
                    return Err(err);
                }
            },
            None => None,
        };
        let (sql, args) = match &rewritten {
            Some((sql, args)) => (sql.as_str(), args.as_slice()),
            None => (sql, args),
        };

        let mode = options.mode.unwrap_or(self.config.default_query_exec_mode);
        match self.dispatch(sql, args, mode).await {
            Ok(key) => RowCursor::start(self, key).await,
            Err(err) => {
                self.end_op();
                Err(err)
            }
        }
    }

    /// First row of the result, if any.
    pub async fn query_one(&mut self, sql: &str, args: &[Value]) -> PgResult<Option<Row>> {
        let mut cursor = self.query(sql, args).await?;
        let row = if cursor.next().await? {
            Some(cursor.to_row()?)
        } else {
            None
        };
        cursor.close().await?;
        Ok(row)
    }

    /// Every row of the result.
    pub async fn query_all(&mut self, sql: &str, args: &[Value]) -> PgResult<Vec<Row>> {
        let mut cursor = self.query(sql, args).await?;
        let mut rows = Vec::new();
        while cursor.next().await? {
            rows.push(cursor.to_row()?);
        }
        cursor.close().await?;
        Ok(rows)
    }

    /// Prepare `sql` under `name`. When `name == sql` the server-side name
    /// is the statement digest. Later queries whose SQL text is `name` run
    /// this statement.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> PgResult<Arc<StatementDescription>> {
        if let Some(existing) = self.prepared.get(name) {
            return if existing.statement.sql == sql {
                Ok(Arc::clone(&existing.statement))
            } else {
                Err(PgError::StatementConflict {
                    name: name.to_string(),
                })
            };
        }
        self.begin_op(&QueryOptions::default())?;
        let result = self.prepare_named(name, sql).await;
        self.end_op();
        result
    }

    async fn prepare_named(&mut self, name: &str, sql: &str) -> PgResult<Arc<StatementDescription>> {
        self.settle().await?;
        let server_name = if name == sql {
            statement_name(sql)
        } else {
            name.to_string()
        };
        // A cached statement for the same text is already on the server
        let adopted = if name == sql { self.statements.take(sql) } else { None };
        let statement = match adopted {
            Some(statement) => statement,
            None => Arc::new(self.describe(&server_name, sql, &[]).await?),
        };
        let tx_scoped = self.in_transaction();
        self.prepared.insert(
            name.to_string(),
            Prepared {
                statement: Arc::clone(&statement),
                tx_scoped,
            },
        );
        debug!(statement = %server_name, "prepared statement");
        Ok(statement)
    }

    /// Release a prepared statement. The local entry is removed even if the
    /// server no longer has it.
    pub async fn deallocate(&mut self, name: &str) -> PgResult<()> {
        self.begin_op(&QueryOptions::default())?;
        let server_name = match self.prepared.remove(name) {
            Some(prepared) => prepared.statement.name.clone(),
            None => name.to_string(),
        };
        let result = self.close_statement(&server_name).await;
        self.end_op();
        debug!(statement = %server_name, "deallocated prepared statement");
        result
    }

    /// Close + Sync for one statement, reporting the first server error.
    async fn close_statement(&mut self, name: &str) -> PgResult<()> {
        self.settle().await?;
        self.buffer(&CloseMessage {
            target: Target::Statement,
            name,
        });
        self.buffer_sync();
        self.flush().await?;

        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::CloseComplete => {}
                BackendMessage::ErrorResponse { fields } => {
                    if error.is_none() {
                        error = Some(self.server_error(&fields));
                    }
                }
                BackendMessage::ReadyForQuery { .. } => break,
                other => return Err(self.unexpected(&other)),
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release every prepared statement on the server and locally.
    pub async fn deallocate_all(&mut self) -> PgResult<()> {
        self.exec_with(
            "DEALLOCATE ALL",
            &[],
            &QueryOptions::new().mode(QueryExecMode::SimpleProtocol),
        )
        .await?;
        self.prepared.clear();
        self.statements.clear();
        self.descriptions.clear();
        self.closing.clear();
        debug!("deallocated all prepared statements");
        Ok(())
    }

    /// Execute BEGIN using simple query protocol.
    pub async fn begin(&mut self) -> PgResult<()> {
        self.simple_query("BEGIN").await
    }

    /// Execute COMMIT using simple query protocol.
    pub async fn commit(&mut self) -> PgResult<()> {
        self.simple_query("COMMIT").await
    }

    /// Execute ROLLBACK using simple query protocol.
    pub async fn rollback(&mut self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await
    }

    async fn simple_query(&mut self, sql: &str) -> PgResult<()> {
        self.exec_with(sql, &[], &QueryOptions::new().mode(QueryExecMode::SimpleProtocol))
            .await
            .map(|_| ())
    }

    /// Prepare the connection for reuse by another caller: drain unread
    /// replies, roll back an open transaction and close invalidated
    /// statements.
    pub async fn reset(&mut self) -> PgResult<()> {
        self.begin_op(&QueryOptions::default())?;
        let result = self.reset_inner().await;
        self.end_op();
        result
    }

    async fn reset_inner(&mut self) -> PgResult<()> {
        self.settle().await?;
        if self.in_transaction() {
            self.buffer(&QueryMessage { query: "ROLLBACK" });
            self.pending += 1;
            self.flush().await?;
            self.drain().await?;
        }
        self.settle().await
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> PgResult<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.buffer(&TerminateMessage);
        self.flush().await?;
        self.state = State::Closed;
        self.stream.shutdown().await?;
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&mut self, sql: &str, args: &[Value], mode: QueryExecMode) -> PgResult<CacheKey> {
        self.settle().await?;

        if let Some(prepared) = self.prepared.get(sql) {
            let statement = Arc::clone(&prepared.statement);
            if mode == QueryExecMode::SimpleProtocol {
                self.send_simple(&statement.sql, args).await?;
            } else {
                self.execute_described(&statement, args).await?;
            }
            return Ok(CacheKey::None);
        }

        match mode {
            QueryExecMode::CacheStatement if self.statements.is_enabled() => {
                let statement = self.cached_statement(sql).await?;
                self.execute_described(&statement, args).await?;
                Ok(CacheKey::Statement(sql.to_string()))
            }
            QueryExecMode::CacheStatement | QueryExecMode::DescribeExec => {
                let described = self.describe("", sql, &[]).await?;
                self.execute_described(&described, args).await?;
                Ok(CacheKey::None)
            }
            QueryExecMode::CacheDescribe => {
                match self.descriptions.get(sql) {
                    Some(described) => {
                        let (formats, params) = self.encode_args(&described.param_types, args)?;
                        let result_formats = self.result_formats(&described.fields);
                        self.buffer(&ParseMessage {
                            name: "",
                            query: sql,
                            param_types: &described.param_types,
                        });
                        self.buffer_execute("", &formats, &params, &result_formats);
                        self.flush().await?;
                    }
                    None => {
                        let described = self.describe("", sql, &[]).await?;
                        let tx_scoped = self.in_transaction();
                        let described = self.descriptions.insert(described, tx_scoped);
                        self.execute_described(&described, args).await?;
                    }
                }
                Ok(CacheKey::Description(sql.to_string()))
            }
            QueryExecMode::Exec => {
                let expected = sanitize::placeholder_count(sql);
                check_arg_count(expected, args.len())?;
                let (oids, params) = self.encode_text_args(args)?;
                self.buffer(&ParseMessage {
                    name: "",
                    query: sql,
                    param_types: &oids,
                });
                self.buffer_execute("", &[], &params, &[]);
                self.flush().await?;
                Ok(CacheKey::None)
            }
            QueryExecMode::SimpleProtocol => {
                self.send_simple(sql, args).await?;
                Ok(CacheKey::None)
            }
        }
    }

    async fn cached_statement(&mut self, sql: &str) -> PgResult<Arc<StatementDescription>> {
        if let Some(statement) = self.statements.get(sql)? {
            return Ok(statement);
        }
        let name = statement_name(sql);
        let described = self.describe(&name, sql, &[]).await?;
        let tx_scoped = self.in_transaction();
        let statement = self.statements.insert(described, tx_scoped)?;
        debug!(statement = %statement.name, params = statement.param_types.len(), "prepared statement");
        Ok(statement)
    }

    /// Parse + Describe(statement) + Sync, one round trip.
    pub(crate) async fn describe(
        &mut self,
        name: &str,
        sql: &str,
        param_types: &[Oid],
    ) -> PgResult<StatementDescription> {
        self.buffer(&ParseMessage {
            name,
            query: sql,
            param_types,
        });
        self.buffer(&DescribeMessage {
            target: Target::Statement,
            name,
        });
        self.buffer_sync();
        self.flush().await?;

        let mut described = StatementDescription::new(name.to_string(), sql.to_string());
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::ParseComplete | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => {
                    described.param_types = type_oids;
                }
                BackendMessage::RowDescription { fields } => {
                    described.fields = Arc::new(fields);
                }
                BackendMessage::ErrorResponse { fields } => {
                    if error.is_none() {
                        error = Some(self.server_error(&fields));
                    }
                }
                BackendMessage::ReadyForQuery { .. } => break,
                other => return Err(self.unexpected(&other)),
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(described),
        }
    }

    /// Bind a described statement, binary wherever the codecs allow.
    async fn execute_described(&mut self, statement: &StatementDescription, args: &[Value]) -> PgResult<()> {
        let (formats, params) = self.encode_args(&statement.param_types, args)?;
        let result_formats = self.result_formats(&statement.fields);
        self.buffer_execute(&statement.name, &formats, &params, &result_formats);
        self.flush().await
    }

    async fn send_simple(&mut self, sql: &str, args: &[Value]) -> PgResult<()> {
        let sql = if args.is_empty() {
            sql.to_string()
        } else {
            sanitize::substitute(&self.type_map, sql, args)?
        };
        self.buffer(&QueryMessage { query: &sql });
        self.pending += 1;
        self.flush().await
    }

    /// Bind + Describe(portal) + Execute + Sync on the unnamed portal.
    pub(crate) fn buffer_execute(
        &mut self,
        statement: &str,
        param_formats: &[Format],
        params: &[Option<Bytes>],
        result_formats: &[Format],
    ) {
        self.buffer(&BindMessage {
            portal: "",
            statement,
            param_formats,
            params,
            result_formats,
        });
        self.buffer(&DescribeMessage {
            target: Target::Portal,
            name: "",
        });
        self.buffer(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        });
        self.buffer_sync();
    }

    // ========================================================================
    // Argument encoding
    // ========================================================================

    /// Encode against known parameter types. Nothing is written on error.
    pub(crate) fn encode_args(
        &self,
        param_types: &[Oid],
        args: &[Value],
    ) -> PgResult<(FormatCodes, EncodedParams)> {
        check_arg_count(param_types.len(), args.len())?;
        let mut formats = FormatCodes::new();
        let mut params = EncodedParams::new();
        for (oid, value) in param_types.iter().zip(args) {
            let format = self.type_map.format_for_encode(*oid, value);
            params.push(self.type_map.encode(*oid, format, value)?);
            formats.push(format);
        }
        Ok((formats, params))
    }

    /// Text encoding with parameter types from the default-type table;
    /// values without a default type are left for the server to infer.
    pub(crate) fn encode_text_args(&self, args: &[Value]) -> PgResult<(Vec<Oid>, EncodedParams)> {
        let mut oids = Vec::with_capacity(args.len());
        let mut params = EncodedParams::new();
        for value in args {
            let oid = match self.type_map.default_oid(value) {
                Some(oid) => oid,
                None if value.is_structured() => {
                    return Err(PgError::Encode(format!(
                        "cannot infer a type for {:?} argument without describing the statement",
                        value.kind()
                    )))
                }
                None => Oid::UNSPECIFIED,
            };
            params.push(self.type_map.encode(oid, Format::Text, value)?);
            oids.push(oid);
        }
        Ok((oids, params))
    }

    pub(crate) fn result_formats(&self, fields: &[FieldDescription]) -> FormatCodes {
        fields
            .iter()
            .map(|field| self.type_map.format_for_decode(field.type_oid))
            .collect()
    }

    // ========================================================================
    // Operation lifecycle
    // ========================================================================

    pub(crate) fn begin_op(&mut self, options: &QueryOptions) -> PgResult<()> {
        if self.writing {
            self.mark_broken(PgError::ConnectionBroken("write interrupted".to_string()));
        }
        match &self.state {
            State::Ready => {}
            State::Broken(reason) => return Err(PgError::ConnectionBroken(reason.clone())),
            State::Closed => return Err(PgError::ConnectionClosed),
        }
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(PgError::Cancelled);
        }
        let timeout = options.timeout.or(self.config.query_timeout);
        self.interrupt = Interrupt {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel: options.cancel.clone(),
            fired: None,
            grace_until: None,
        };
        Ok(())
    }

    pub(crate) fn end_op(&mut self) {
        self.interrupt = Interrupt::default();
    }

    /// Called once an execution has read its ReadyForQuery.
    pub(crate) fn finish_op(&mut self, key: &CacheKey, error: Option<&PgError>) {
        if let Some(err) = error {
            let stale = err.is_cancellation()
                || err
                    .as_server()
                    .is_some_and(|e| self.config.stale_plan_classifier.is_stale_plan(e));
            match key {
                CacheKey::Statement(sql) if stale => {
                    self.statements.invalidate(sql);
                }
                // A description holds no server state, so any server error
                // is enough to describe again next time
                CacheKey::Description(sql) if stale || err.as_server().is_some() => {
                    if self.descriptions.invalidate(sql) {
                        debug!(sql = %sql, "invalidated statement description");
                    }
                }
                _ => {}
            }
        }
        self.end_op();
    }

    /// Bring the channel to a clean state: abort an abandoned COPY, read
    /// the replies of abandoned operations and close invalidated
    /// statements.
    pub(crate) async fn settle(&mut self) -> PgResult<()> {
        if self.copy_in_progress {
            self.copy_in_progress = false;
            warn!("aborting abandoned copy");
            self.buffer(&CopyFailMessage {
                message: "copy abandoned by client",
            });
            self.flush().await?;
        }
        self.drain().await?;

        self.closing.extend(self.statements.take_invalidated());
        // The server rejects everything but ROLLBACK in a failed transaction
        if !self.closing.is_empty() && self.transaction_status != TransactionStatus::Failed {
            let names = std::mem::take(&mut self.closing);
            for name in &names {
                self.buffer(&CloseMessage {
                    target: Target::Statement,
                    name,
                });
            }
            self.buffer_sync();
            self.flush().await?;
            self.drain().await?;
            debug!(count = names.len(), "closed invalidated statements");
        }
        Ok(())
    }

    /// Read and discard replies until every Sync or Query sent has been
    /// answered.
    pub(crate) async fn drain(&mut self) -> PgResult<()> {
        while self.pending > 0 {
            match self.recv().await? {
                BackendMessage::ErrorResponse { fields } => {
                    debug!(error = %ServerError::from_fields(&fields), "discarded error of an abandoned operation");
                }
                BackendMessage::CopyInResponse { .. } => self.refuse_copy_in().await?,
                _ => {}
            }
        }
        Ok(())
    }

    /// A COPY FROM STDIN reached through a plain query; refuse it.
    pub(crate) async fn refuse_copy_in(&mut self) -> PgResult<()> {
        self.buffer(&CopyFailMessage {
            message: "COPY FROM STDIN must use copy_from",
        });
        self.flush().await
    }

    // ========================================================================
    // Transaction tracking
    // ========================================================================

    fn ready(&mut self, status: TransactionStatus) {
        self.pending = self.pending.saturating_sub(1);
        let previous = std::mem::replace(&mut self.transaction_status, status);
        if status == TransactionStatus::Idle && previous != TransactionStatus::Idle {
            if previous == TransactionStatus::Failed || self.saw_rollback {
                self.discard_tx_scoped();
            } else {
                self.statements.commit_tx_scoped();
                self.descriptions.commit_tx_scoped();
                for prepared in self.prepared.values_mut() {
                    prepared.tx_scoped = false;
                }
            }
        }
        self.saw_rollback = false;
    }

    /// The server discarded what the rolled back transaction prepared.
    fn discard_tx_scoped(&mut self) {
        let cached = self.statements.invalidate_tx_scoped();
        self.descriptions.invalidate_tx_scoped();
        let closing = &mut self.closing;
        let before = self.prepared.len();
        self.prepared.retain(|_, prepared| {
            if prepared.tx_scoped {
                closing.push(prepared.statement.name.clone());
            }
            !prepared.tx_scoped
        });
        let explicit = before - self.prepared.len();
        if cached + explicit > 0 {
            debug!(cached, explicit, "dropped statements prepared in rolled back transaction");
        }
    }

    // ========================================================================
    // Low-level I/O
    // ========================================================================

    /// Append a message to the write buffer.
    pub(crate) fn buffer<M: FrontendMessage + fmt::Debug>(&mut self, msg: &M) {
        trace!(message = ?msg, "send");
        msg.encode(&mut self.write_buffer);
    }

    /// Drop messages buffered but not yet written.
    pub(crate) fn discard_unsent(&mut self) {
        self.write_buffer.clear();
    }

    pub(crate) fn buffer_sync(&mut self) {
        self.buffer(&SyncMessage);
        self.pending += 1;
    }

    /// Write everything buffered.
    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        self.writing = true;
        if let Err(e) = self.stream.write_all(&self.write_buffer).await {
            return Err(self.mark_broken(e.into()));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.mark_broken(e.into()));
        }
        self.write_buffer.clear();
        self.writing = false;
        Ok(())
    }

    /// Receive the next message an operation cares about.
    ///
    /// Notices and parameter changes are absorbed here; ReadyForQuery
    /// updates the transaction status before being returned.
    pub(crate) async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            match BackendMessage::parse(&mut self.read_buffer) {
                Ok(Some(msg)) => {
                    trace!(message = msg.name(), "received");
                    if let Some(msg) = self.observe(msg) {
                        return Ok(msg);
                    }
                }
                Ok(None) => self.fill_buffer().await?,
                Err(e) => return Err(self.mark_broken(e)),
            }
        }
    }

    fn observe(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NoticeResponse { fields } => {
                debug!(
                    notice = fields.get(&b'M').map(String::as_str).unwrap_or_default(),
                    "server notice"
                );
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
                None
            }
            BackendMessage::NotificationResponse { .. } => None,
            BackendMessage::CommandComplete { tag } => {
                if tag == "ROLLBACK" {
                    self.saw_rollback = true;
                }
                Some(BackendMessage::CommandComplete { tag })
            }
            BackendMessage::ReadyForQuery { status } => {
                self.ready(status);
                Some(BackendMessage::ReadyForQuery { status })
            }
            other => Some(other),
        }
    }

    /// Read more bytes, honoring the operation's deadline and cancel signal.
    ///
    /// When either fires, a cancel request goes out and reading continues
    /// until the server answers or the grace period runs out.
    async fn fill_buffer(&mut self) -> PgResult<()> {
        loop {
            let wake = tokio::select! {
                biased;
                read = self.stream.read_buf(&mut self.read_buffer) => Wake::Read(read),
                wake = self.interrupt.wait() => wake,
            };
            match wake {
                Wake::Read(Ok(0)) => return Err(self.mark_broken(PgError::ConnectionClosed)),
                Wake::Read(Ok(_)) => return Ok(()),
                Wake::Read(Err(e)) => return Err(self.mark_broken(e.into())),
                Wake::Fired(reason) => self.send_cancel(reason)?,
                Wake::GraceExpired => {
                    let reason = self.interrupt.fired.clone().unwrap_or(PgError::Timeout);
                    warn!(grace = ?self.config.cancel_grace, "cancel request not answered in time");
                    self.mark_broken(PgError::ConnectionBroken(
                        "cancel request not answered in time".to_string(),
                    ));
                    return Err(reason);
                }
            }
        }
    }

    /// Record that the operation was interrupted and fire the cancel
    /// request on its own task, so the request survives the read that
    /// noticed the interrupt being dropped.
    fn send_cancel(&mut self, reason: PgError) -> PgResult<()> {
        let grace = self.config.cancel_grace;
        self.interrupt.fired = Some(reason.clone());
        self.interrupt.grace_until = Some(Instant::now() + grace);

        let (Some(canceller), Some(key)) = (self.canceller.clone(), self.backend_key) else {
            warn!(reason = %reason, "no cancel channel, abandoning connection");
            self.mark_broken(PgError::ConnectionBroken("no cancel channel".to_string()));
            return Err(reason);
        };
        warn!(reason = %reason, pid = key.process_id, "sending cancel request");
        tokio::spawn(async move {
            match tokio::time::timeout(grace, canceller.cancel(key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "cancel request failed"),
                Err(_) => warn!("cancel request timed out"),
            }
        });
        Ok(())
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Build the error for an ErrorResponse. A query_canceled error caused
    /// by our own cancel request reports the cancellation instead.
    pub(crate) fn server_error(&self, fields: &HashMap<u8, String>) -> PgError {
        let err = ServerError::from_fields(fields);
        if err.code == "57014" {
            if let Some(reason) = &self.interrupt.fired {
                return reason.clone();
            }
        }
        err.into()
    }

    pub(crate) fn unexpected(&mut self, msg: &BackendMessage) -> PgError {
        self.mark_broken(PgError::Protocol(format!(
            "Unexpected message: {}",
            msg.name()
        )))
    }

    /// Flag the connection unusable. Server-side state is unknown, so the
    /// caches go with it.
    pub(crate) fn mark_broken(&mut self, err: PgError) -> PgError {
        if self.state == State::Ready {
            warn!(error = %err, "connection marked broken");
            self.state = State::Broken(err.to_string());
            self.statements.clear();
            self.descriptions.clear();
            self.prepared.clear();
            self.closing.clear();
            self.pending = 0;
            self.copy_in_progress = false;
        }
        err
    }

    // Fields shared with the copy streamer and batch pipeline

    pub(crate) fn add_pending(&mut self) {
        self.pending += 1;
    }

    /// A cancel request went out for the running operation.
    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.fired.is_some()
    }

    pub(crate) fn set_copy_in_progress(&mut self, in_progress: bool) {
        self.copy_in_progress = in_progress;
    }
}

pub(crate) fn check_arg_count(expected: usize, given: usize) -> PgResult<()> {
    if expected != given {
        return Err(PgError::Encode(format!(
            "statement expects {} arguments, {} given",
            expected, given
        )));
    }
    Ok(())
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("state", &self.state)
            .field("transaction_status", &self.transaction_status)
            .field("cached_statements", &self.statements.len())
            .field("prepared", &self.prepared.len())
            .field("pending", &self.pending)
            .finish()
    }
}
