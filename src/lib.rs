//! pgexec - PostgreSQL query execution over the wire protocol.
//!
//! A single [`PgConnection`] runs statements in one of five execution
//! modes, keeps prepared statements and descriptions cached, converts
//! values through a per-connection [`TypeMap`], streams binary COPY and
//! pipelines batches.

pub mod pg;

pub use pg::{
    Batch, BatchResults, CancelHandle, CancelSignal, CommandTag, CopyFromFn, CopyFromRows,
    CopyFromSource, FromSql, Identifier, NamedArgs, Oid, PgConfig, PgConnection, PgError,
    PgResult, QueryExecMode, QueryOptions, Row, RowCursor, TypeMap, Value,
};
