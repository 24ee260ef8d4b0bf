//! PostgreSQL wire protocol client.
//!
//! This module provides a connection-level query executor that:
//! - Runs statements in five execution modes, from cached named statements
//!   down to the simple query protocol
//! - Caches prepared statements and statement descriptions per connection
//! - Encodes and decodes through a pluggable per-connection type map
//! - Streams binary COPY FROM STDIN and pipelines batches in one round trip
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `transport`: Socket and out-of-band cancel collaborators
//! - `startup`: Minimal authentication handshake
//! - `connection`: Connection state machine and execution modes
//! - `rows`: Row cursor and owned rows
//! - `statement`: Prepared statement and description caches
//! - `types`: PostgreSQL type encoding/decoding
//! - `copy`: Binary COPY streaming
//! - `batch`: Pipelined batches

pub mod batch;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod protocol;
pub mod query;
pub mod rows;
pub mod sanitize;
pub mod startup;
pub mod statement;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock;

// Public API re-exports for library consumers
pub use batch::{Batch, BatchResults};
pub use config::{PgConfig, QueryExecMode};
pub use connection::PgConnection;
pub use copy::{CopyFromFn, CopyFromRows, CopyFromSource};
pub use error::{PgError, PgResult, ServerError, SqlStateClassifier, StalePlanClassifier};
pub use protocol::{FieldDescription, TransactionStatus};
pub use query::{CancelHandle, CancelSignal, NamedArgs, QueryOptions, QueryRewriter};
pub use rows::{CommandTag, Row, RowCursor};
pub use sanitize::Identifier;
pub use startup::StartupInfo;
pub use statement::StatementDescription;
pub use transport::{BackendKey, CancelRequester, Socket, TcpCancelRequester};
pub use types::{FromSql, Oid, TypeMap, Value};
