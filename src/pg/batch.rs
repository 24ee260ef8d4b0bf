//! Pipelined batches: many statements, one round trip.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::connection::{check_arg_count, PgConnection};
use super::error::{PgError, PgResult};
use super::protocol::{BackendMessage, BindMessage, DescribeMessage, ExecuteMessage, ParseMessage, Target};
use super::query::QueryOptions;
use super::rows::{CommandTag, Row};
use super::sanitize;
use super::statement::SharedFields;
use super::types::Value;

/// Statements queued for a single pipelined submission.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    items: Vec<(String, Vec<Value>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `sql` with its arguments. SQL naming an explicitly prepared
    /// statement runs that statement.
    pub fn queue(&mut self, sql: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.items.push((sql.into(), args));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PgConnection {
    /// Send every queued statement back to back, followed by one Sync.
    ///
    /// Failures while sending are reported by the first result call.
    pub async fn send_batch(&mut self, batch: &Batch) -> BatchResults<'_> {
        self.send_batch_with(batch, &QueryOptions::default()).await
    }

    pub async fn send_batch_with(&mut self, batch: &Batch, options: &QueryOptions) -> BatchResults<'_> {
        let sent = match self.begin_op(options) {
            Ok(()) => self.queue_batch(batch).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) if !batch.is_empty() => BatchResults {
                conn: self,
                remaining: batch.len(),
                error: None,
                aborted: None,
                done: false,
            },
            Ok(()) => {
                self.end_op();
                BatchResults {
                    conn: self,
                    remaining: 0,
                    error: None,
                    aborted: None,
                    done: true,
                }
            }
            Err(err) => {
                self.end_op();
                BatchResults {
                    conn: self,
                    remaining: 0,
                    error: Some(err.clone()),
                    aborted: Some(err),
                    done: true,
                }
            }
        }
    }

    async fn queue_batch(&mut self, batch: &Batch) -> PgResult<()> {
        self.settle().await?;
        if batch.is_empty() {
            return Ok(());
        }
        for (sql, args) in &batch.items {
            // Nothing goes out unless every statement encodes
            if let Err(err) = self.buffer_batch_item(sql, args) {
                self.discard_unsent();
                return Err(err);
            }
        }
        self.buffer_sync();
        self.flush().await?;
        debug!(statements = batch.len(), "batch sent");
        Ok(())
    }

    fn buffer_batch_item(&mut self, sql: &str, args: &[Value]) -> PgResult<()> {
        match self.prepared_statement(sql) {
            Some(statement) => {
                let (formats, params) = self.encode_args(&statement.param_types, args)?;
                let result_formats = self.result_formats(&statement.fields);
                self.buffer(&BindMessage {
                    portal: "",
                    statement: &statement.name,
                    param_formats: &formats,
                    params: &params,
                    result_formats: &result_formats,
                });
            }
            None => {
                check_arg_count(sanitize::placeholder_count(sql), args.len())?;
                let (oids, params) = self.encode_text_args(args)?;
                self.buffer(&ParseMessage {
                    name: "",
                    query: sql,
                    param_types: &oids,
                });
                self.buffer(&BindMessage {
                    portal: "",
                    statement: "",
                    param_formats: &[],
                    params: &params,
                    result_formats: &[],
                });
            }
        }
        self.buffer(&DescribeMessage {
            target: Target::Portal,
            name: "",
        });
        self.buffer(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        });
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// Replies of a sent batch, read one statement at a time in queue order.
///
/// Once a statement fails the server skips the rest, and every later call
/// returns the first error. A row that fails to decode fails only its own
/// call; `close` still reports it.
pub struct BatchResults<'a> {
    conn: &'a mut PgConnection,
    remaining: usize,
    /// First error seen, reported by `close`
    error: Option<PgError>,
    /// Error that made the server skip the rest of the batch
    aborted: Option<PgError>,
    done: bool,
}

impl BatchResults<'_> {
    /// Result of the next statement as a command tag.
    pub async fn exec(&mut self) -> PgResult<CommandTag> {
        self.next_result(false).await.map(|(tag, _)| tag)
    }

    /// Rows of the next statement.
    pub async fn query(&mut self) -> PgResult<Vec<Row>> {
        self.next_result(true).await.map(|(_, rows)| rows)
    }

    /// Discard unread results and return the first error of the batch.
    pub async fn close(mut self) -> PgResult<()> {
        while !self.done {
            self.read_reply().await;
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn next_result(&mut self, collect: bool) -> PgResult<(CommandTag, Vec<Row>)> {
        if self.remaining == 0 {
            return Err(self.aborted.clone().unwrap_or(PgError::NoMoreResults));
        }
        self.remaining -= 1;

        let mut fields: SharedFields = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut decode_error = None;
        loop {
            let Some(msg) = self.read_reply().await else {
                // Ended without completing this statement
                self.finish().await;
                return Err(self.aborted.clone().unwrap_or_else(|| {
                    PgError::Protocol("batch ended before all results were read".to_string())
                }));
            };
            match msg {
                BackendMessage::RowDescription { fields: described } => {
                    fields = Arc::new(described);
                }
                BackendMessage::DataRow { values } if collect && decode_error.is_none() => {
                    match Row::decode(self.conn.type_map(), &fields, &values) {
                        Ok(row) => rows.push(row),
                        Err(err) => decode_error = Some(err),
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    if self.remaining == 0 {
                        self.finish().await;
                    }
                    return match decode_error {
                        Some(err) => {
                            self.fail(err.clone());
                            Err(err)
                        }
                        None => Ok((CommandTag::new(tag), rows)),
                    };
                }
                BackendMessage::EmptyQueryResponse => {
                    if self.remaining == 0 {
                        self.finish().await;
                    }
                    return Ok((CommandTag::default(), rows));
                }
                _ => {}
            }
        }
    }

    /// Read until ReadyForQuery.
    async fn finish(&mut self) {
        while !self.done {
            self.read_reply().await;
        }
    }

    /// Next reply of the batch. Errors are recorded and end the batch:
    /// `None` once ReadyForQuery (or a fatal error) has been seen.
    async fn read_reply(&mut self) -> Option<BackendMessage> {
        if self.done {
            return None;
        }
        let msg = loop {
            match self.conn.recv().await {
                Ok(BackendMessage::CopyInResponse { .. }) => {
                    if let Err(err) = self.conn.refuse_copy_in().await {
                        self.abort(err);
                        self.complete();
                        return None;
                    }
                }
                other => break other,
            }
        };
        match msg {
            Ok(BackendMessage::ReadyForQuery { .. }) => {
                self.complete();
                None
            }
            Ok(BackendMessage::ErrorResponse { fields }) => {
                let err = self.conn.server_error(&fields);
                // The server skips everything up to the Sync
                self.abort(err);
                None
            }
            Ok(
                msg @ (BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData
                | BackendMessage::RowDescription { .. }
                | BackendMessage::DataRow { .. }
                | BackendMessage::CommandComplete { .. }
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::PortalSuspended),
            ) => Some(msg),
            Ok(other) => {
                let err = self.conn.unexpected(&other);
                self.abort(err);
                self.complete();
                None
            }
            Err(err) => {
                self.abort(err);
                self.complete();
                None
            }
        }
    }

    fn fail(&mut self, err: PgError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn abort(&mut self, err: PgError) {
        self.fail(err.clone());
        if self.aborted.is_none() {
            self.aborted = Some(err);
        }
        self.remaining = 0;
    }

    fn complete(&mut self) {
        self.done = true;
        self.remaining = 0;
        self.conn.end_op();
    }
}

impl fmt::Debug for BatchResults<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchResults")
            .field("remaining", &self.remaining)
            .field("error", &self.error)
            .field("aborted", &self.aborted)
            .field("done", &self.done)
            .finish()
    }
}
