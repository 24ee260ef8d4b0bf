//! Per-call execution options: mode, deadline, cancellation and rewriting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::config::QueryExecMode;
use super::error::{PgError, PgResult};
use super::sanitize;
use super::types::{TypeMap, Value};

// ============================================================================
// Options
// ============================================================================

/// Overrides applied to a single `exec_with` / `query_with` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Execution mode; the connection default when unset
    pub mode: Option<QueryExecMode>,
    /// Deadline for the whole call; the configured `query_timeout` when unset
    pub timeout: Option<Duration>,
    /// Caller-driven cancellation
    pub cancel: Option<CancelSignal>,
    /// Runs once before dispatch and may replace SQL text and arguments
    pub rewriter: Option<Arc<dyn QueryRewriter>>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: QueryExecMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    pub fn rewriter(mut self, rewriter: impl QueryRewriter + 'static) -> Self {
        self.rewriter = Some(Arc::new(rewriter));
        self
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Receiving side of a cancellation request, observed by long-running calls.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Triggers every [`CancelSignal`] created alongside it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create a linked handle and signal.
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if every
    /// handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

// ============================================================================
// Rewriters
// ============================================================================

/// Hook that may replace SQL text and arguments before dispatch.
pub trait QueryRewriter: Send + Sync + fmt::Debug {
    fn rewrite(&self, map: &TypeMap, sql: &str, args: &[Value]) -> PgResult<(String, Vec<Value>)>;
}

/// Named arguments: rewrites `@name` placeholders into `$n`, numbered in
/// order of first appearance. Names without a value bind NULL.
#[derive(Debug, Clone, Default)]
pub struct NamedArgs {
    args: Vec<(String, Value)>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the value for `name`.
    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.args.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.args.push((name.to_string(), value)),
        }
        self
    }

    fn get(&self, name: &str) -> Value {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }
}

impl QueryRewriter for NamedArgs {
    fn rewrite(&self, _map: &TypeMap, sql: &str, args: &[Value]) -> PgResult<(String, Vec<Value>)> {
        if !args.is_empty() {
            return Err(PgError::Encode(
                "named arguments cannot be combined with positional arguments".to_string(),
            ));
        }
        let (sql, names) = sanitize::rewrite_named(sql);
        let values = names.iter().map(|name| self.get(name)).collect();
        Ok((sql, values))
    }
}
