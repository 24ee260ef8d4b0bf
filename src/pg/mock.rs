//! In-process fake backend for protocol tests.
//!
//! Speaks the server side of the extended and simple query protocols over
//! a `tokio::io::duplex` pipe. Statements answer from a catalog of canned
//! results; everything else gets a generic reply derived from its verb.
//! Every frontend message is recorded so tests can assert on the exact
//! exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use super::config::PgConfig;
use super::connection::PgConnection;
use super::protocol::TransactionStatus;
use super::sanitize;
use super::startup::StartupInfo;
use super::transport::{BackendKey, CancelFuture, CancelRequester};
use super::types::{Format, Oid, TypeMap, Value};

type SqlError = (&'static str, String);

// ============================================================================
// Catalog
// ============================================================================

/// Canned reply for one SQL text.
#[derive(Debug, Clone, Default)]
pub(crate) struct Canned {
    params: Vec<Oid>,
    fields: Vec<(String, Oid)>,
    /// Columns that appear once the schema has changed
    added: Vec<(String, Oid)>,
    rows: Vec<Vec<Value>>,
    tag: Option<String>,
    error: Option<(&'static str, String)>,
    echo: bool,
    sleep: Option<Duration>,
}

impl Canned {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn params(mut self, params: &[Oid]) -> Self {
        self.params = params.to_vec();
        self
    }

    pub(crate) fn field(mut self, name: &str, oid: Oid) -> Self {
        self.fields.push((name.to_string(), oid));
        self
    }

    /// A column added by the next schema change. Existing rows read it as
    /// NULL.
    pub(crate) fn added_field(mut self, name: &str, oid: Oid) -> Self {
        self.added.push((name.to_string(), oid));
        self
    }

    pub(crate) fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub(crate) fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    /// Fail on execution.
    pub(crate) fn error(mut self, code: &'static str, message: &str) -> Self {
        self.error = Some((code, message.to_string()));
        self
    }

    /// Return the bound parameters as a single row.
    pub(crate) fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Block on execution until cancelled or `duration` passes.
    pub(crate) fn sleep(mut self, duration: Duration) -> Self {
        self.sleep = Some(duration);
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<(String, Oid, bool)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    canned: HashMap<String, Canned>,
    tables: HashMap<String, Table>,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn statement(mut self, sql: &str, canned: Canned) -> Self {
        self.canned.insert(sql.to_string(), canned);
        self
    }

    /// A copy target. Columns are `(name, type, not null)`; the describe
    /// query issued by `copy_from` is registered alongside.
    pub(crate) fn table(mut self, name: &str, columns: &[(&str, Oid, bool)]) -> Self {
        let quoted = |n: &str| format!("\"{}\"", n);
        let list = columns
            .iter()
            .map(|(c, _, _)| quoted(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut canned = Canned::new();
        for (column, oid, _) in columns {
            canned = canned.field(column, *oid);
        }
        self.canned
            .insert(format!("select {} from {}", list, quoted(name)), canned);
        self.tables.insert(
            name.to_string(),
            Table {
                columns: columns
                    .iter()
                    .map(|(c, oid, not_null)| (c.to_string(), *oid, *not_null))
                    .collect(),
            },
        );
        self
    }
}

// ============================================================================
// Shared state and handles
// ============================================================================

#[derive(Debug, Default)]
struct Shared {
    log: Vec<String>,
    /// Bumped to simulate a schema change
    generation: u64,
    ignore_cancel: bool,
    /// Time the cancel channel takes to reach the server
    cancel_delay: Duration,
    executing: bool,
    cancel_requested: bool,
    cancels: usize,
    copied: HashMap<String, usize>,
    statements: Vec<String>,
}

/// Test-side view of the fake backend.
#[derive(Debug, Clone)]
pub(crate) struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    pub(crate) fn log(&self) -> Vec<String> {
        self.shared.lock().log.clone()
    }

    /// Number of logged messages starting with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.shared
            .lock()
            .log
            .iter()
            .filter(|m| m.starts_with(prefix))
            .count()
    }

    pub(crate) fn clear_log(&self) {
        self.shared.lock().log.clear();
    }

    /// Invalidate the result type of every named statement prepared so far
    /// and add the columns declared with `Canned::added_field`.
    pub(crate) fn change_schema(&self) {
        self.shared.lock().generation += 1;
    }

    pub(crate) fn ignore_cancel(&self, ignore: bool) {
        self.shared.lock().ignore_cancel = ignore;
    }

    pub(crate) fn delay_cancel(&self, delay: Duration) {
        self.shared.lock().cancel_delay = delay;
    }

    pub(crate) fn cancels(&self) -> usize {
        self.shared.lock().cancels
    }

    /// Rows committed into `table` by COPY.
    pub(crate) fn copied_rows(&self, table: &str) -> usize {
        self.shared.lock().copied.get(table).copied().unwrap_or(0)
    }

    /// Named statements currently held by the backend, sorted.
    pub(crate) fn server_statements(&self) -> Vec<String> {
        let mut names = self.shared.lock().statements.clone();
        names.sort();
        names
    }
}

#[derive(Debug)]
struct MockCanceller {
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
}

impl CancelRequester for MockCanceller {
    fn cancel(&self, _key: BackendKey) -> CancelFuture<'_> {
        Box::pin(async move {
            let delay = self.shared.lock().cancel_delay;
            tokio::time::sleep(delay).await;
            let mut shared = self.shared.lock();
            shared.cancels += 1;
            if shared.executing && !shared.ignore_cancel {
                shared.cancel_requested = true;
                self.notify.notify_one();
            }
            Ok(())
        })
    }
}

/// Connection to a fresh fake backend with default configuration.
pub(crate) fn connect(catalog: Catalog) -> (PgConnection, MockHandle) {
    connect_with_config(catalog, PgConfig::default())
}

pub(crate) fn connect_with_config(catalog: Catalog, config: PgConfig) -> (PgConnection, MockHandle) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let shared = Arc::new(Mutex::new(Shared::default()));
    let notify = Arc::new(Notify::new());

    let backend = Backend {
        stream: server,
        input: BytesMut::new(),
        output: BytesMut::new(),
        shared: Arc::clone(&shared),
        notify: Arc::clone(&notify),
        catalog,
        map: TypeMap::new(),
        statements: HashMap::new(),
        portal: None,
        status: TransactionStatus::Idle,
        skipping: false,
        copy: None,
    };
    tokio::spawn(backend.run());

    let startup = StartupInfo {
        backend_key: Some(BackendKey {
            process_id: 1,
            secret_key: 2,
        }),
        parameters: HashMap::from([("server_version".to_string(), "16.0".to_string())]),
        transaction_status: TransactionStatus::Idle,
    };
    let canceller = Arc::new(MockCanceller {
        shared: Arc::clone(&shared),
        notify,
    });
    let conn = PgConnection::from_socket(client, startup, config).with_canceller(canceller);
    (conn, MockHandle { shared })
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone)]
struct Statement {
    sql: String,
    params: Vec<Oid>,
    generation: u64,
    in_tx: bool,
}

#[derive(Debug, Clone)]
struct Portal {
    sql: String,
    params: Vec<Oid>,
    values: Vec<Value>,
    formats: Vec<Format>,
}

#[derive(Debug)]
struct CopyState {
    table: String,
    data: BytesMut,
    header_seen: bool,
    rows: usize,
    failed: bool,
}

enum Reply {
    Rows {
        fields: Vec<(String, Oid)>,
        rows: Vec<Vec<Value>>,
        tag: String,
    },
    Copy(String),
}

struct Backend {
    stream: DuplexStream,
    input: BytesMut,
    output: BytesMut,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    catalog: Catalog,
    map: TypeMap,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    status: TransactionStatus,
    /// After an error, discard messages until Sync
    skipping: bool,
    copy: Option<CopyState>,
}

impl Backend {
    async fn run(mut self) {
        loop {
            while let Some((tag, body)) = self.next_message() {
                if !self.handle(tag, body).await {
                    return;
                }
            }
            if self.flush().await.is_err() {
                return;
            }
            let copying = self.copy.is_some();
            tokio::select! {
                read = self.stream.read_buf(&mut self.input) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
                _ = self.notify.notified(), if copying => {
                    if self.take_cancel() {
                        self.copy = None;
                        self.shared.lock().executing = false;
                        self.error("57014", "canceling statement due to user request".to_string());
                        self.ready();
                    }
                }
            }
        }
    }

    fn next_message(&mut self) -> Option<(u8, Bytes)> {
        if self.input.len() < 5 {
            return None;
        }
        let len = i32::from_be_bytes([self.input[1], self.input[2], self.input[3], self.input[4]]) as usize;
        if self.input.len() < len + 1 {
            return None;
        }
        let tag = self.input.get_u8();
        self.input.advance(4);
        Some((tag, self.input.split_to(len - 4).freeze()))
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.output.is_empty() {
            self.stream.write_all(&self.output).await?;
            self.output.clear();
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.shared.lock().log.push(entry);
    }

    /// Returns `false` once the client terminates.
    async fn handle(&mut self, tag: u8, mut body: Bytes) -> bool {
        match tag {
            b'P' => {
                let name = cstring(&mut body);
                let sql = cstring(&mut body);
                let count = body.get_i16() as usize;
                let oids = (0..count).map(|_| Oid(body.get_u32())).collect::<Vec<_>>();
                self.record(format!("Parse {}", name));
                if !self.skipping {
                    self.parse(name, sql, oids);
                }
            }
            b'B' => {
                let _portal = cstring(&mut body);
                let statement = cstring(&mut body);
                let formats = (0..body.get_i16()).map(|_| Format::from_code(body.get_i16())).collect::<Vec<_>>();
                let raw = (0..body.get_i16())
                    .map(|_| match body.get_i32() {
                        -1 => None,
                        len => Some(body.split_to(len as usize)),
                    })
                    .collect::<Vec<_>>();
                let results = (0..body.get_i16()).map(|_| Format::from_code(body.get_i16())).collect::<Vec<_>>();
                self.record(format!("Bind {}", statement));
                if !self.skipping {
                    self.bind(&statement, &formats, &raw, results);
                }
            }
            b'D' => {
                let target = body.get_u8();
                let name = cstring(&mut body);
                self.record(format!("Describe {}", target as char));
                if !self.skipping {
                    if target == b'S' {
                        self.describe_statement(&name);
                    } else {
                        self.describe_portal();
                    }
                }
            }
            b'E' => {
                self.record("Execute".to_string());
                if !self.skipping {
                    self.execute_portal().await;
                }
            }
            b'C' => {
                let _target = body.get_u8();
                let name = cstring(&mut body);
                self.record(format!("Close S {}", name));
                if !self.skipping {
                    self.statements.remove(&name);
                    self.sync_names();
                    put_msg(&mut self.output, b'3', |_| {});
                }
            }
            b'S' => {
                self.record("Sync".to_string());
                self.skipping = false;
                self.ready();
            }
            b'H' => self.record("Flush".to_string()),
            b'Q' => {
                let sql = cstring(&mut body);
                self.record(format!("Query {}", sql));
                self.simple_query(&sql).await;
            }
            b'd' => {
                self.record("CopyData".to_string());
                self.copy_data(&body);
            }
            b'c' => {
                self.record("CopyDone".to_string());
                if let Some(copy) = self.copy.take() {
                    self.shared.lock().executing = false;
                    *self.shared.lock().copied.entry(copy.table).or_default() += copy.rows;
                    command_complete(&mut self.output, &format!("COPY {}", copy.rows));
                    self.ready();
                }
            }
            b'f' => {
                let message = cstring(&mut body);
                self.record("CopyFail".to_string());
                if self.copy.take().is_some() {
                    self.shared.lock().executing = false;
                    self.error("57014", format!("COPY from stdin failed: {}", message));
                    self.ready();
                }
            }
            b'X' => {
                self.record("Terminate".to_string());
                return false;
            }
            other => self.record(format!("Unknown {}", other as char)),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Extended protocol
    // ------------------------------------------------------------------------

    fn parse(&mut self, name: String, sql: String, oids: Vec<Oid>) {
        if let Err((code, message)) = self.check_aborted(&sql) {
            return self.error(code, message);
        }
        if !name.is_empty() && self.statements.contains_key(&name) {
            return self.error("42P05", format!("prepared statement \"{}\" already exists", name));
        }
        let mut params = match self.catalog.canned.get(sql.trim()) {
            Some(canned) if !canned.params.is_empty() => canned.params.clone(),
            _ => vec![Oid::TEXT; sanitize::placeholder_count(&sql)],
        };
        for (param, oid) in params.iter_mut().zip(&oids) {
            if *oid != Oid::UNSPECIFIED {
                *param = *oid;
            }
        }
        let statement = Statement {
            sql,
            params,
            generation: self.shared.lock().generation,
            in_tx: self.status != TransactionStatus::Idle,
        };
        self.statements.insert(name, statement);
        self.sync_names();
        put_msg(&mut self.output, b'1', |_| {});
    }

    fn bind(&mut self, name: &str, formats: &[Format], raw: &[Option<Bytes>], results: Vec<Format>) {
        let Some(statement) = self.statements.get(name).cloned() else {
            return self.error("26000", format!("prepared statement \"{}\" does not exist", name));
        };
        if let Err((code, message)) = self.check_aborted(&statement.sql) {
            return self.error(code, message);
        }
        let generation = self.shared.lock().generation;
        if !name.is_empty() && statement.generation < generation && !self.fields_for(&statement).is_empty() {
            return self.error("0A000", "cached plan must not change result type".to_string());
        }
        let columns = self.fields_for(&statement).len();
        if results.len() > 1 && results.len() != columns {
            return self.error(
                "08P01",
                format!(
                    "bind message has {} result formats but query has {} columns",
                    results.len(),
                    columns
                ),
            );
        }
        if raw.len() != statement.params.len() {
            return self.error(
                "08P01",
                format!(
                    "bind message supplies {} parameters, but prepared statement requires {}",
                    raw.len(),
                    statement.params.len()
                ),
            );
        }
        let mut values = Vec::with_capacity(raw.len());
        for (i, (value, oid)) in raw.iter().zip(&statement.params).enumerate() {
            let format = match formats.len() {
                0 => Format::Text,
                1 => formats[0],
                _ => formats[i],
            };
            match self.map.decode(*oid, format, value.as_deref()) {
                Ok(value) => values.push(value),
                Err(err) => return self.error("22P02", err.to_string()),
            }
        }
        self.portal = Some(Portal {
            sql: statement.sql,
            params: statement.params,
            values,
            formats: results,
        });
        put_msg(&mut self.output, b'2', |_| {});
    }

    fn describe_statement(&mut self, name: &str) {
        let Some(statement) = self.statements.get(name).cloned() else {
            return self.error("26000", format!("prepared statement \"{}\" does not exist", name));
        };
        put_msg(&mut self.output, b't', |buf| {
            buf.put_i16(statement.params.len() as i16);
            for oid in &statement.params {
                buf.put_u32(oid.0);
            }
        });
        let fields = self.fields_for(&statement);
        row_description(&mut self.output, &fields, &[]);
    }

    fn describe_portal(&mut self) {
        let Some(portal) = self.portal.clone() else {
            return self.error("34000", "portal \"\" does not exist".to_string());
        };
        let fields = self.fields_for_sql(&portal.sql, &portal.params);
        row_description(&mut self.output, &fields, &portal.formats);
    }

    async fn execute_portal(&mut self) {
        let Some(portal) = self.portal.take() else {
            return self.error("34000", "portal \"\" does not exist".to_string());
        };
        match self.execute(&portal.sql, &portal.params, portal.values).await {
            Ok(Reply::Rows { fields, rows, tag }) => {
                let formats = expand_formats(&portal.formats, fields.len());
                for row in &rows {
                    self.data_row(&fields, row, &formats);
                }
                command_complete(&mut self.output, &tag);
            }
            Ok(Reply::Copy(_)) => self.error("0A000", "COPY requires the simple query protocol".to_string()),
            Err((code, message)) => self.error(code, message),
        }
    }

    // ------------------------------------------------------------------------
    // Simple protocol
    // ------------------------------------------------------------------------

    async fn simple_query(&mut self, sql: &str) {
        let statements: Vec<&str> = sql.split(';').map(str::trim).filter(|s| !s.is_empty()).collect();
        if statements.is_empty() {
            put_msg(&mut self.output, b'I', |_| {});
        }
        for statement in statements {
            match self.execute(statement, &[], Vec::new()).await {
                Ok(Reply::Rows { fields, rows, tag }) => {
                    if !fields.is_empty() {
                        row_description(&mut self.output, &fields, &[]);
                    }
                    let formats = vec![Format::Text; fields.len()];
                    for row in &rows {
                        self.data_row(&fields, row, &formats);
                    }
                    command_complete(&mut self.output, &tag);
                }
                Ok(Reply::Copy(table)) => {
                    let columns = self.catalog.tables.get(&table).map_or(0, |t| t.columns.len());
                    put_msg(&mut self.output, b'G', |buf| {
                        buf.put_u8(1);
                        buf.put_i16(columns as i16);
                        for _ in 0..columns {
                            buf.put_i16(1);
                        }
                    });
                    self.shared.lock().executing = true;
                    self.copy = Some(CopyState {
                        table,
                        data: BytesMut::new(),
                        header_seen: false,
                        rows: 0,
                        failed: false,
                    });
                    // ReadyForQuery follows the end of the copy
                    return;
                }
                Err((code, message)) => {
                    self.error(code, message);
                    break;
                }
            }
        }
        self.skipping = false;
        self.ready();
    }

    // ------------------------------------------------------------------------
    // Statement execution
    // ------------------------------------------------------------------------

    fn check_aborted(&self, sql: &str) -> Result<(), SqlError> {
        let verb = verb(sql);
        if self.status == TransactionStatus::Failed && verb != "ROLLBACK" && verb != "COMMIT" {
            return Err((
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block".to_string(),
            ));
        }
        Ok(())
    }

    fn fields_for(&self, statement: &Statement) -> Vec<(String, Oid)> {
        self.fields_for_sql(&statement.sql, &statement.params)
    }

    fn fields_for_sql(&self, sql: &str, params: &[Oid]) -> Vec<(String, Oid)> {
        let sql = sql.trim();
        if let Some(canned) = self.catalog.canned.get(sql) {
            if canned.echo {
                return params
                    .iter()
                    .enumerate()
                    .map(|(i, oid)| (format!("${}", i + 1), *oid))
                    .collect();
            }
            let mut fields = canned.fields.clone();
            if self.shared.lock().generation > 0 {
                fields.extend(canned.added.iter().cloned());
            }
            return fields;
        }
        if literal_select(sql).is_some() {
            return vec![("?column?".to_string(), Oid::INT4)];
        }
        Vec::new()
    }

    async fn execute(&mut self, sql: &str, params: &[Oid], values: Vec<Value>) -> Result<Reply, SqlError> {
        self.check_aborted(sql)?;
        let sql = sql.trim();
        let fields = self.fields_for_sql(sql, params);

        if let Some(canned) = self.catalog.canned.get(sql).cloned() {
            if let Some(duration) = canned.sleep {
                self.sleep(duration).await?;
            }
            if let Some((code, message)) = canned.error {
                return Err((code, message));
            }
            let mut rows = if canned.echo { vec![values] } else { canned.rows };
            if fields.len() > canned.fields.len() && !canned.echo {
                for row in &mut rows {
                    row.resize(fields.len(), Value::Null);
                }
            }
            let tag = canned.tag.unwrap_or_else(|| format!("SELECT {}", rows.len()));
            return Ok(Reply::Rows { fields, rows, tag });
        }

        let verb = verb(sql);
        let tag = match verb.as_str() {
            "BEGIN" => {
                self.status = TransactionStatus::InTransaction;
                "BEGIN".to_string()
            }
            "COMMIT" if self.status == TransactionStatus::Failed => {
                self.end_transaction(false);
                "ROLLBACK".to_string()
            }
            "COMMIT" => {
                self.end_transaction(true);
                "COMMIT".to_string()
            }
            "ROLLBACK" => {
                self.end_transaction(false);
                "ROLLBACK".to_string()
            }
            "DEALLOCATE" => {
                self.statements.retain(|name, _| name.is_empty());
                self.sync_names();
                "DEALLOCATE ALL".to_string()
            }
            "COPY" => return self.start_copy(sql),
            "SELECT" => match literal_select(sql) {
                Some(n) => {
                    return Ok(Reply::Rows {
                        fields,
                        rows: vec![vec![Value::Int4(n)]],
                        tag: "SELECT 1".to_string(),
                    })
                }
                None => return Err(("42P01", format!("relation for \"{}\" does not exist", sql))),
            },
            "INSERT" => "INSERT 0 1".to_string(),
            "UPDATE" | "DELETE" => format!("{} 1", verb),
            "CREATE" | "DROP" | "ALTER" => {
                let object = sql.split_whitespace().nth(1).unwrap_or_default().to_uppercase();
                format!("{} {}", verb, object)
            }
            _ => verb.clone(),
        };
        Ok(Reply::Rows {
            fields,
            rows: Vec::new(),
            tag,
        })
    }

    fn end_transaction(&mut self, commit: bool) {
        if commit {
            for statement in self.statements.values_mut() {
                statement.in_tx = false;
            }
        } else {
            self.statements.retain(|_, statement| !statement.in_tx);
            self.sync_names();
        }
        self.status = TransactionStatus::Idle;
    }

    async fn sleep(&mut self, duration: Duration) -> Result<(), SqlError> {
        let _ = self.flush().await;
        self.shared.lock().executing = true;
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let cancelled = loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    if self.take_cancel() {
                        break true;
                    }
                }
                _ = &mut deadline => break false,
            }
        };
        self.shared.lock().executing = false;
        if cancelled {
            return Err(("57014", "canceling statement due to user request".to_string()));
        }
        Ok(())
    }

    fn take_cancel(&self) -> bool {
        std::mem::take(&mut self.shared.lock().cancel_requested)
    }

    // ------------------------------------------------------------------------
    // COPY
    // ------------------------------------------------------------------------

    fn start_copy(&mut self, sql: &str) -> Result<Reply, SqlError> {
        // copy "t" ( "a", "b" ) from stdin binary
        let rest = sql[4..].trim_start();
        let end = rest.find(|c: char| c == ' ' || c == '(').unwrap_or(rest.len());
        let table = rest[..end].trim_matches('"').to_string();
        if !self.catalog.tables.contains_key(&table) {
            return Err(("42P01", format!("relation \"{}\" does not exist", table)));
        }
        Ok(Reply::Copy(table))
    }

    fn copy_data(&mut self, data: &[u8]) {
        let Some(copy) = self.copy.as_mut() else {
            // Outside copy mode the server ignores stray copy messages
            return;
        };
        if copy.failed {
            return;
        }
        copy.data.extend_from_slice(data);
        let columns = self
            .catalog
            .tables
            .get(&copy.table)
            .map(|t| t.columns.clone())
            .unwrap_or_default();

        if !copy.header_seen {
            if copy.data.len() < 19 {
                return;
            }
            copy.data.advance(19);
            copy.header_seen = true;
        }
        let violation = loop {
            let Some(row) = take_tuple(&mut copy.data) else {
                break None;
            };
            let Some(row) = row else {
                // Trailer
                break None;
            };
            let null_column = columns
                .iter()
                .zip(&row)
                .find(|((_, _, not_null), value)| *not_null && value.is_none())
                .map(|((name, _, _), _)| name.clone());
            if let Some(column) = null_column {
                break Some(column);
            }
            copy.rows += 1;
        };
        if let Some(column) = violation {
            copy.failed = true;
            let table = copy.table.clone();
            self.copy = None;
            self.shared.lock().executing = false;
            self.error(
                "23502",
                format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    column, table
                ),
            );
            self.ready();
        }
    }

    // ------------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------------

    fn error(&mut self, code: &str, message: String) {
        put_msg(&mut self.output, b'E', |buf| {
            for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message.as_str())] {
                buf.put_u8(field);
                buf.put_slice(value.as_bytes());
                buf.put_u8(0);
            }
            buf.put_u8(0);
        });
        self.skipping = true;
        if self.status == TransactionStatus::InTransaction {
            self.status = TransactionStatus::Failed;
        }
    }

    fn ready(&mut self) {
        let status = match self.status {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        };
        put_msg(&mut self.output, b'Z', |buf| buf.put_u8(status));
    }

    fn data_row(&mut self, fields: &[(String, Oid)], row: &[Value], formats: &[Format]) {
        let mut encoded = Vec::with_capacity(row.len());
        for ((_, oid), (value, format)) in fields.iter().zip(row.iter().zip(formats)) {
            // Echoed values of unknown type go back as text
            let format = if self.map.get(*oid).is_none() { Format::Text } else { *format };
            encoded.push(self.map.encode(*oid, format, value).ok().flatten());
        }
        put_msg(&mut self.output, b'D', |buf| {
            buf.put_i16(encoded.len() as i16);
            for value in &encoded {
                match value {
                    Some(bytes) => {
                        buf.put_i32(bytes.len() as i32);
                        buf.put_slice(bytes);
                    }
                    None => buf.put_i32(-1),
                }
            }
        });
    }

    fn sync_names(&self) {
        let names = self
            .statements
            .keys()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect();
        self.shared.lock().statements = names;
    }
}

fn cstring(body: &mut Bytes) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let s = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance((end + 1).min(body.len()));
    s
}

fn put_msg(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(tag);
    let start = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn command_complete(out: &mut BytesMut, tag: &str) {
    put_msg(out, b'C', |buf| {
        buf.put_slice(tag.as_bytes());
        buf.put_u8(0);
    });
}

fn row_description(out: &mut BytesMut, fields: &[(String, Oid)], formats: &[Format]) {
    if fields.is_empty() {
        put_msg(out, b'n', |_| {});
        return;
    }
    let formats = expand_formats(formats, fields.len());
    put_msg(out, b'T', |buf| {
        buf.put_i16(fields.len() as i16);
        for ((name, oid), format) in fields.iter().zip(&formats) {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0);
            buf.put_i16(0);
            buf.put_u32(oid.0);
            buf.put_i16(-1);
            buf.put_i32(-1);
            buf.put_i16(format.code());
        }
    });
}

fn expand_formats(formats: &[Format], count: usize) -> Vec<Format> {
    match formats.len() {
        0 => vec![Format::Text; count],
        1 => vec![formats[0]; count],
        _ => formats.to_vec(),
    }
}

fn verb(sql: &str) -> String {
    sql.split_whitespace().next().unwrap_or_default().to_uppercase()
}

/// `select <integer>`
fn literal_select(sql: &str) -> Option<i32> {
    let mut words = sql.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some(select), Some(n), None) if select.eq_ignore_ascii_case("select") => n.parse().ok(),
        _ => None,
    }
}

/// One binary COPY tuple: `None` if incomplete, `Some(None)` for the
/// trailer.
fn take_tuple(data: &mut BytesMut) -> Option<Option<Vec<Option<Bytes>>>> {
    if data.len() < 2 {
        return None;
    }
    let count = i16::from_be_bytes([data[0], data[1]]);
    if count < 0 {
        data.advance(2);
        return Some(None);
    }
    let mut offset = 2;
    let mut lens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if data.len() < offset + 4 {
            return None;
        }
        let len = i32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
        offset += 4;
        if len >= 0 {
            if data.len() < offset + len as usize {
                return None;
            }
            offset += len as usize;
        }
        lens.push(len);
    }
    data.advance(2);
    let mut values = Vec::with_capacity(lens.len());
    for len in lens {
        data.advance(4);
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(data.split_to(len as usize).freeze()));
        }
    }
    Some(Some(values))
}
