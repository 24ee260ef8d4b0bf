//! Bulk upload through `COPY ... FROM STDIN BINARY`.
//!
//! Rows are encoded on a blocking worker and handed to the connection in
//! chunks. The connection keeps reading the server while the worker
//! produces, so a server that terminates the copy early is noticed without
//! waiting on the source.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::protocol::{BackendMessage, CopyDataMessage, CopyDoneMessage, CopyFailMessage, QueryMessage};
use super::query::QueryOptions;
use super::rows::CommandTag;
use super::sanitize::Identifier;
use super::types::{Format, Oid, TypeMap, Value};

/// Signature, flags and header extension length of the binary COPY format.
const COPY_HEADER: &[u8] = b"PGCOPY\n\xff\r\n\0\0\0\0\0\0\0\0\0";

/// Encoded bytes are sent once a chunk grows past this size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks that may wait in the channel before the producer blocks.
const CHANNEL_DEPTH: usize = 4;

// ============================================================================
// Row sources
// ============================================================================

/// Produces the rows of a copy, one call to `next` per row.
pub trait CopyFromSource: Send {
    /// Advance to the next row. `false` when exhausted or failed.
    fn next(&mut self) -> bool;

    /// Values of the current row, in column order.
    fn values(&mut self) -> PgResult<Vec<Value>>;

    /// Error that stopped the source, checked once `next` returns `false`.
    fn err(&self) -> Option<PgError>;
}

/// In-memory rows.
#[derive(Debug)]
pub struct CopyFromRows {
    rows: std::vec::IntoIter<Vec<Value>>,
    current: Option<Vec<Value>>,
}

impl CopyFromRows {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows: rows.into_iter(),
            current: None,
        }
    }
}

impl CopyFromSource for CopyFromRows {
    fn next(&mut self) -> bool {
        self.current = self.rows.next();
        self.current.is_some()
    }

    fn values(&mut self) -> PgResult<Vec<Value>> {
        self.current
            .take()
            .ok_or_else(|| PgError::copy_source("values requested without a current row"))
    }

    fn err(&self) -> Option<PgError> {
        None
    }
}

/// Rows pulled from a closure until it returns `Ok(None)` or an error.
pub struct CopyFromFn<F> {
    f: F,
    current: Option<Vec<Value>>,
    err: Option<PgError>,
}

impl<F> CopyFromFn<F>
where
    F: FnMut() -> PgResult<Option<Vec<Value>>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            current: None,
            err: None,
        }
    }
}

impl<F> CopyFromSource for CopyFromFn<F>
where
    F: FnMut() -> PgResult<Option<Vec<Value>>> + Send,
{
    fn next(&mut self) -> bool {
        match (self.f)() {
            Ok(row) => {
                self.current = row;
                self.current.is_some()
            }
            Err(err) => {
                self.current = None;
                self.err = Some(err);
                false
            }
        }
    }

    fn values(&mut self) -> PgResult<Vec<Value>> {
        self.current
            .take()
            .ok_or_else(|| PgError::copy_source("values requested without a current row"))
    }

    fn err(&self) -> Option<PgError> {
        self.err.clone()
    }
}

// ============================================================================
// Producer
// ============================================================================

enum Produced {
    Data(Bytes),
    End,
    Failed(PgError),
}

/// Encode every row of `source` into binary COPY chunks. Stops as soon as
/// the receiving side goes away.
fn produce<S: CopyFromSource>(map: TypeMap, oids: Vec<Oid>, mut source: S, tx: mpsc::Sender<Produced>) {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE + 1024);
    buf.put_slice(COPY_HEADER);

    while source.next() {
        if let Err(err) = encode_row(&map, &oids, &mut source, &mut buf) {
            let _ = tx.blocking_send(Produced::Failed(err));
            return;
        }
        if buf.len() >= CHUNK_SIZE && tx.blocking_send(Produced::Data(buf.split().freeze())).is_err() {
            return;
        }
    }
    if let Some(err) = source.err() {
        let _ = tx.blocking_send(Produced::Failed(err));
        return;
    }

    buf.put_i16(-1);
    if tx.blocking_send(Produced::Data(buf.freeze())).is_ok() {
        let _ = tx.blocking_send(Produced::End);
    }
}

fn encode_row<S: CopyFromSource>(map: &TypeMap, oids: &[Oid], source: &mut S, buf: &mut BytesMut) -> PgResult<()> {
    let values = source.values()?;
    if values.len() != oids.len() {
        return Err(PgError::Encode(format!(
            "copy row has {} values for {} columns",
            values.len(),
            oids.len()
        )));
    }
    let start = buf.len();
    buf.put_i16(values.len() as i16);
    for (oid, value) in oids.iter().zip(&values) {
        if let Err(err) = map.encode_field(*oid, Format::Binary, value, buf) {
            buf.truncate(start);
            return Err(err);
        }
    }
    Ok(())
}

// ============================================================================
// Streaming
// ============================================================================

impl PgConnection {
    /// Upload the rows of `source` into `columns` of `table`, returning the
    /// number of rows copied.
    ///
    /// A server error aborts the whole copy: nothing is committed and the
    /// error is returned. A source error is reported to the server and
    /// returned without waiting for the server to acknowledge it.
    pub async fn copy_from<S>(&mut self, table: &Identifier, columns: &[&str], source: S) -> PgResult<u64>
    where
        S: CopyFromSource + 'static,
    {
        self.copy_from_with(table, columns, source, &QueryOptions::default())
            .await
    }

    pub async fn copy_from_with<S>(
        &mut self,
        table: &Identifier,
        columns: &[&str],
        source: S,
        options: &QueryOptions,
    ) -> PgResult<u64>
    where
        S: CopyFromSource + 'static,
    {
        self.begin_op(options)?;
        let result = self.copy_inner(table, columns, source).await;
        self.end_op();
        result
    }

    async fn copy_inner<S>(&mut self, table: &Identifier, columns: &[&str], source: S) -> PgResult<u64>
    where
        S: CopyFromSource + 'static,
    {
        self.settle().await?;

        let table = table.sanitize();
        let column_list = columns
            .iter()
            .map(|c| Identifier::from(*c).sanitize())
            .collect::<Vec<_>>()
            .join(", ");
        let (describe_sql, copy_sql) = if columns.is_empty() {
            (
                format!("select * from {}", table),
                format!("copy {} from stdin binary;", table),
            )
        } else {
            (
                format!("select {} from {}", column_list, table),
                format!("copy {} ( {} ) from stdin binary;", table, column_list),
            )
        };
        let described = self.describe("", &describe_sql, &[]).await?;
        let oids: Vec<Oid> = described.fields.iter().map(|f| f.type_oid).collect();

        self.buffer(&QueryMessage { query: &copy_sql });
        self.add_pending();
        self.flush().await?;
        self.await_copy_in().await?;
        self.set_copy_in_progress(true);
        debug!(table = %table, columns = oids.len(), "copy started");

        let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
        let map = self.type_map().clone();
        tokio::task::spawn_blocking(move || produce(map, oids, source, tx));

        loop {
            // Once a cancel is out, only the server's answer matters
            let interrupted = self.interrupted();
            tokio::select! {
                biased;
                msg = self.recv() => {
                    // The server only speaks mid-copy to end it
                    match msg? {
                        BackendMessage::ErrorResponse { fields } => {
                            let err = self.server_error(&fields);
                            self.set_copy_in_progress(false);
                            warn!(error = %err, "copy aborted by server");
                            self.drain().await?;
                            return Err(err);
                        }
                        other => return Err(self.unexpected(&other)),
                    }
                }
                produced = rx.recv(), if !interrupted => match produced {
                    Some(Produced::Data(chunk)) => {
                        self.buffer(&CopyDataMessage { data: &chunk });
                        self.flush().await?;
                    }
                    Some(Produced::End) => {
                        self.buffer(&CopyDoneMessage);
                        self.flush().await?;
                        self.set_copy_in_progress(false);
                        return self.finish_copy().await;
                    }
                    Some(Produced::Failed(err)) => return self.fail_copy(err).await,
                    None => {
                        return self
                            .fail_copy(PgError::copy_source("copy source stopped without finishing"))
                            .await
                    }
                },
            }
        }
    }

    /// Wait for the server to enter COPY IN mode.
    async fn await_copy_in(&mut self) -> PgResult<()> {
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::CopyInResponse { .. } => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    if error.is_none() {
                        error = Some(self.server_error(&fields));
                    }
                }
                BackendMessage::ReadyForQuery { .. } => {
                    return Err(error.unwrap_or_else(|| {
                        PgError::Protocol("server did not enter copy mode".to_string())
                    }))
                }
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    /// Read the outcome after CopyDone.
    async fn finish_copy(&mut self) -> PgResult<u64> {
        let mut rows = 0;
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::CommandComplete { tag } => {
                    rows = CommandTag::new(tag).rows_affected();
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
            Some(err) => {
                warn!(error = %err, "copy failed");
                Err(err)
            }
            None => {
                debug!(rows, "copy finished");
                Ok(rows)
            }
        }
    }

    /// Abort on a source error. The server's reply is left for the next
    /// operation to drain.
    async fn fail_copy(&mut self, err: PgError) -> PgResult<u64> {
        warn!(error = %err, "copy aborted by source");
        self.buffer(&CopyFailMessage {
            message: &err.to_string(),
        });
        self.set_copy_in_progress(false);
        self.flush().await?;
        Err(err)
    }
}
