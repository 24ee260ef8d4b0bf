//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use super::types::Oid;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
///
/// Cloneable so a cursor or batch can hand the same first error back from
/// both the step that hit it and the final `close`.
#[derive(Debug, Clone, Error)]
pub enum PgError {
    /// I/O error during communication. Always fatal for the connection.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an ErrorResponse.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// A query argument could not be encoded. Raised before any bytes are sent.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A result value could not be converted.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A type was registered before one of the types it is built from.
    #[error("Type {type_name} depends on unregistered type OID {dependency}")]
    MissingDependency { type_name: String, dependency: Oid },

    /// The same statement name was prepared for different SQL text.
    #[error("Prepared statement {name} already exists with different SQL")]
    StatementConflict { name: String },

    /// Statement not found.
    #[error("Prepared statement not found: {0}")]
    StatementNotFound(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A COPY row source reported an error.
    #[error("Copy source error: {0}")]
    CopySource(String),

    /// A batch result was requested after every queued statement was read.
    #[error("No more results in batch")]
    NoMoreResults,

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Timeout waiting for response.
    #[error("Operation timed out")]
    Timeout,

    /// Connection is closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Connection was flagged unusable after a fatal error.
    #[error("Connection is broken: {0}")]
    ConnectionBroken(String),
}

impl PgError {
    /// Errors after which the channel can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_)
                | PgError::Protocol(_)
                | PgError::ConnectionClosed
                | PgError::ConnectionBroken(_)
        )
    }

    /// Cancellation and timeout, as opposed to errors reported by the server.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PgError::Cancelled | PgError::Timeout)
    }

    /// SQLSTATE code if this is a server error.
    pub fn code(&self) -> Option<&str> {
        self.as_server().map(|e| e.code.as_str())
    }

    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Wrap an error raised by a COPY source.
    pub fn copy_source(err: impl fmt::Display) -> Self {
        PgError::CopySource(err.to_string())
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(Box::new(e))
    }
}

// ============================================================================
// Server errors
// ============================================================================

/// Structured contents of an ErrorResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub routine: Option<String>,
}

impl ServerError {
    /// Build from the (field type, value) pairs of an ErrorResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the non-localized severity; fall back to 'S'
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
            where_: fields.get(&b'W').cloned(),
            schema: fields.get(&b's').cloned(),
            table: fields.get(&b't').cloned(),
            column: fields.get(&b'c').cloned(),
            data_type: fields.get(&b'd').cloned(),
            constraint: fields.get(&b'n').cloned(),
            routine: fields.get(&b'R').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

// ============================================================================
// Stale plan classification
// ============================================================================

/// Decides whether a server error means a cached server-side plan is stale.
///
/// Message text and casing differ between backends, so this is pluggable
/// through [`PgConfig`](super::config::PgConfig).
pub trait StalePlanClassifier: Send + Sync + fmt::Debug {
    fn is_stale_plan(&self, err: &ServerError) -> bool;
}

/// Classifier matching SQLSTATE codes, optionally narrowed by a
/// case-insensitive message fragment.
#[derive(Debug, Clone)]
pub struct SqlStateClassifier {
    rules: Vec<(String, Option<String>)>,
}

impl SqlStateClassifier {
    /// A classifier with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Treat every error with `code` as stale.
    pub fn code(mut self, code: &str) -> Self {
        self.rules.push((code.to_string(), None));
        self
    }

    /// Treat errors with `code` whose message contains `fragment` as stale.
    pub fn code_with_message(mut self, code: &str, fragment: &str) -> Self {
        self.rules
            .push((code.to_string(), Some(fragment.to_lowercase())));
        self
    }
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self::empty()
            .code_with_message("0A000", "cached plan must not change result type")
            .code("26000")
    }
}

impl StalePlanClassifier for SqlStateClassifier {
    fn is_stale_plan(&self, err: &ServerError) -> bool {
        let message = err.message.to_lowercase();
        self.rules.iter().any(|(code, fragment)| {
            *code == err.code
                && fragment
                    .as_deref()
                    .map_or(true, |frag| message.contains(frag))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: &str, message: &str) -> ServerError {
        ServerError {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_classifier_matches_either_casing() {
        let classifier = SqlStateClassifier::default();
        assert!(classifier.is_stale_plan(&server_error(
            "0A000",
            "Cached plan must not change result type"
        )));
        assert!(classifier.is_stale_plan(&server_error(
            "0A000",
            "cached plan must not change result type"
        )));
        assert!(classifier.is_stale_plan(&server_error(
            "26000",
            "prepared statement \"stmt_1\" does not exist"
        )));
    }

    #[test]
    fn test_default_classifier_ignores_other_errors() {
        let classifier = SqlStateClassifier::default();
        assert!(!classifier.is_stale_plan(&server_error("22012", "division by zero")));
        assert!(!classifier.is_stale_plan(&server_error("0A000", "feature not supported")));
        assert!(!classifier.is_stale_plan(&server_error("42601", "syntax error")));
    }

    #[test]
    fn test_server_error_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERREUR".to_string());
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', "23502".to_string());
        fields.insert(b'M', "null value in column \"b\"".to_string());
        fields.insert(b'c', "b".to_string());
        fields.insert(b'P', "12".to_string());

        let err = ServerError::from_fields(&fields);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "23502");
        assert_eq!(err.column.as_deref(), Some("b"));
        assert_eq!(err.position, Some(12));

        let err = PgError::from(err);
        assert_eq!(err.code(), Some("23502"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_and_cancellation_classes() {
        let io = PgError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_fatal());
        assert!(PgError::Cancelled.is_cancellation());
        assert!(PgError::Timeout.is_cancellation());
        assert!(!PgError::Cancelled.is_fatal());
        // Clone keeps the shared I/O error
        let copy = io.clone();
        assert_eq!(copy.to_string(), io.to_string());
    }
}
