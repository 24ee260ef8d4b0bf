//! Result streaming: row cursors, owned rows and command tags.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::connection::{CacheKey, PgConnection};
use super::error::{PgError, PgResult};
use super::protocol::{BackendMessage, FieldDescription};
use super::statement::SharedFields;
use super::types::{FromSql, TypeMap, Value};

// ============================================================================
// Command tags
// ============================================================================

/// The CommandComplete summary of a statement, e.g. `INSERT 0 3`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing row count, 0 when the tag has none.
    pub fn rows_affected(&self) -> u64 {
        self.0
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_insert(&self) -> bool {
        self.0.starts_with("INSERT")
    }

    pub fn is_update(&self) -> bool {
        self.0.starts_with("UPDATE")
    }

    pub fn is_delete(&self) -> bool {
        self.0.starts_with("DELETE")
    }

    pub fn is_select(&self) -> bool {
        self.0.starts_with("SELECT")
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Owned rows
// ============================================================================

/// A decoded row that outlives its cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: SharedFields,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn decode(map: &TypeMap, fields: &SharedFields, raw: &[Option<Bytes>]) -> PgResult<Self> {
        let values = decode_values(map, fields, raw)?;
        Ok(Self {
            fields: Arc::clone(fields),
            values,
        })
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Convert column `idx` into `T`.
    pub fn get<T: FromSql>(&self, idx: usize) -> PgResult<T> {
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| out_of_range(idx, self.values.len()))?;
        T::from_value(value.clone())
    }

    /// Convert the first column named `name` into `T`.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> PgResult<T> {
        let idx = self
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| PgError::Decode(format!("no column named {}", name)))?;
        self.get(idx)
    }
}

fn decode_values(map: &TypeMap, fields: &[FieldDescription], raw: &[Option<Bytes>]) -> PgResult<Vec<Value>> {
    if fields.len() != raw.len() {
        return Err(PgError::Protocol(format!(
            "DataRow has {} values for {} fields",
            raw.len(),
            fields.len()
        )));
    }
    fields
        .iter()
        .zip(raw)
        .map(|(field, value)| map.decode(field.type_oid, field.format, value.as_deref()))
        .collect()
}

fn out_of_range(idx: usize, len: usize) -> PgError {
    PgError::Decode(format!("column index {} out of range ({} columns)", idx, len))
}

// ============================================================================
// Row cursor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the row description of the first result set
    Header,
    Rows,
    /// Reading and discarding up to ReadyForQuery
    Draining,
    Done,
}

enum Event {
    Header,
    Row,
    Done,
    Continue,
}

/// Lazily decoded rows of one statement.
///
/// Holds the connection exclusively until ReadyForQuery has been read. A
/// cursor dropped early leaves the remaining replies on the channel; the
/// next operation on the connection drains them first.
pub struct RowCursor<'a> {
    conn: &'a mut PgConnection,
    fields: SharedFields,
    row: Vec<Option<Bytes>>,
    tag: Option<CommandTag>,
    error: Option<PgError>,
    stage: Stage,
    key: CacheKey,
}

impl<'a> RowCursor<'a> {
    /// Read up to the first result set's description. Errors raised before
    /// any row (parse, bind, stale plans) are returned here, after the
    /// exchange has completed.
    pub(crate) async fn start(conn: &'a mut PgConnection, key: CacheKey) -> PgResult<RowCursor<'a>> {
        let mut cursor = RowCursor {
            conn,
            fields: Arc::new(Vec::new()),
            row: Vec::new(),
            tag: None,
            error: None,
            stage: Stage::Header,
            key,
        };
        loop {
            match cursor.read().await {
                Event::Header => return Ok(cursor),
                Event::Done => {
                    return match cursor.error.take() {
                        Some(err) => Err(err),
                        None => Ok(cursor),
                    }
                }
                Event::Row | Event::Continue => {}
            }
        }
    }

    /// Advance to the next row. Returns `Ok(false)` once the statement is
    /// complete, or the first error seen while reading.
    pub async fn next(&mut self) -> PgResult<bool> {
        loop {
            if self.stage == Stage::Done {
                self.row.clear();
                return match &self.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(false),
                };
            }
            match self.read().await {
                Event::Row => return Ok(true),
                Event::Header | Event::Done | Event::Continue => {}
            }
        }
    }

    /// Finish the statement, discarding unread rows.
    pub async fn close(mut self) -> PgResult<CommandTag> {
        while self.stage != Stage::Done {
            self.read().await;
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self.tag.take().unwrap_or_default()),
        }
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Tag of the last completed statement, once read.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }

    /// Undecoded values of the current row. Valid until the next read.
    pub fn raw_values(&self) -> &[Option<Bytes>] {
        &self.row
    }

    /// Convert column `idx` of the current row into `T`.
    pub fn get<T: FromSql>(&self, idx: usize) -> PgResult<T> {
        let field = self
            .fields
            .get(idx)
            .ok_or_else(|| out_of_range(idx, self.fields.len()))?;
        let raw = self.row.get(idx).ok_or_else(|| out_of_range(idx, self.row.len()))?;
        self.conn
            .type_map()
            .scan(field.type_oid, field.format, raw.as_deref())
    }

    /// Decode every column of the current row.
    pub fn values(&self) -> PgResult<Vec<Value>> {
        decode_values(self.conn.type_map(), &self.fields, &self.row)
    }

    /// Copy the current row out of the receive buffer.
    pub fn to_row(&self) -> PgResult<Row> {
        Row::decode(self.conn.type_map(), &self.fields, &self.row)
    }

    fn fail(&mut self, err: PgError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    async fn read(&mut self) -> Event {
        let msg = match self.conn.recv().await {
            Ok(msg) => msg,
            Err(err) => {
                self.fail(err);
                self.finish();
                return Event::Done;
            }
        };

        match msg {
            BackendMessage::RowDescription { fields } => {
                if self.stage == Stage::Header {
                    self.fields = Arc::new(fields);
                    self.stage = Stage::Rows;
                    return Event::Header;
                }
            }
            BackendMessage::NoData => {
                if self.stage == Stage::Header {
                    self.stage = Stage::Rows;
                    return Event::Header;
                }
            }
            BackendMessage::DataRow { values } => {
                if self.stage == Stage::Rows {
                    self.row = values;
                    return Event::Row;
                }
            }
            BackendMessage::CommandComplete { tag } => {
                self.tag = Some(CommandTag::new(tag));
                return self.end_result_set();
            }
            BackendMessage::EmptyQueryResponse => return self.end_result_set(),
            BackendMessage::ErrorResponse { fields } => {
                let err = self.conn.server_error(&fields);
                self.fail(err);
                self.stage = Stage::Draining;
            }
            BackendMessage::ReadyForQuery { .. } => {
                self.finish();
                return Event::Done;
            }
            BackendMessage::CopyInResponse { .. } => {
                if let Err(err) = self.conn.refuse_copy_in().await {
                    self.fail(err);
                    self.finish();
                    return Event::Done;
                }
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription { .. }
            | BackendMessage::PortalSuspended
            | BackendMessage::CopyOutResponse { .. }
            | BackendMessage::CopyData { .. }
            | BackendMessage::CopyDone => {}
            other => {
                let err = self.conn.unexpected(&other);
                self.fail(err);
                self.finish();
                return Event::Done;
            }
        }
        Event::Continue
    }

    /// Only the first result set is exposed; later ones (simple protocol)
    /// are read for their tags and discarded.
    fn end_result_set(&mut self) -> Event {
        match self.stage {
            Stage::Header => {
                self.stage = Stage::Draining;
                Event::Header
            }
            Stage::Rows => {
                self.stage = Stage::Draining;
                Event::Continue
            }
            Stage::Draining | Stage::Done => Event::Continue,
        }
    }

    fn finish(&mut self) {
        self.stage = Stage::Done;
        self.row.clear();
        self.conn.finish_op(&self.key, self.error.as_ref());
    }
}

impl fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCursor")
            .field("fields", &self.fields.len())
            .field("stage", &self.stage)
            .field("tag", &self.tag)
            .finish()
    }
}
