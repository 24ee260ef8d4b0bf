//! Prepared statement management and caching.
//!
//! This module provides:
//! - `StatementDescription`: parameter and result types of a parsed statement
//! - `StatementCache`: O(1) LRU cache of named server-side statements
//! - `DescriptionCache`: O(1) LRU cache of descriptions for unnamed statements

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{PgError, PgResult};
use super::protocol::FieldDescription;
use super::types::Oid;

/// Shared field descriptions - wrapped in Arc to avoid cloning on every query.
pub type SharedFields = Arc<Vec<FieldDescription>>;

/// Server-side name for `sql`: `stmt_` plus the hex of the first 24 bytes
/// of its SHA-256, so names stay short and stable for identical text.
pub fn statement_name(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    let mut name = String::with_capacity(5 + 48);
    name.push_str("stmt_");
    for byte in &digest[..24] {
        name.push_str(&format!("{:02x}", byte));
    }
    name
}

// ============================================================================
// Statement description
// ============================================================================

/// A statement parsed by the server (Parse + Describe).
#[derive(Debug, Clone)]
pub struct StatementDescription {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    /// The SQL text
    pub sql: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result field descriptions (from RowDescription); empty on NoData
    pub fields: SharedFields,
}

impl StatementDescription {
    pub fn new(name: String, sql: String) -> Self {
        Self {
            name,
            sql,
            param_types: Vec::new(),
            fields: Arc::new(Vec::new()),
        }
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.fields.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    statement: Arc<StatementDescription>,
    /// Prepared inside a transaction that has not committed yet
    tx_scoped: bool,
}

fn lru<V>(capacity: usize) -> Option<LruCache<String, V>> {
    NonZeroUsize::new(capacity).map(LruCache::new)
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache of named prepared statements, keyed by digest name.
///
/// Entries remember their SQL text so a digest reused for different text is
/// reported instead of silently executing the wrong statement. Evicted and
/// invalidated names are queued until the connection closes them on the
/// server. A capacity of 0 disables caching.
#[derive(Debug)]
pub struct StatementCache {
    cache: Option<LruCache<String, Entry>>,
    invalidated: Vec<String>,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: lru(capacity),
            invalidated: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up the statement for `sql`, marking it recently used.
    pub fn get(&mut self, sql: &str) -> PgResult<Option<Arc<StatementDescription>>> {
        let Some(cache) = self.cache.as_mut() else {
            return Ok(None);
        };
        let name = statement_name(sql);
        match cache.get(&name) {
            Some(entry) if entry.statement.sql != sql => Err(PgError::StatementConflict { name }),
            Some(entry) => Ok(Some(Arc::clone(&entry.statement))),
            None => Ok(None),
        }
    }

    /// Check if a statement for `sql` is cached.
    #[inline]
    pub fn contains(&self, sql: &str) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|cache| cache.contains(&statement_name(sql)))
    }

    /// Insert a freshly prepared statement.
    ///
    /// If the cache is at capacity, the least recently used statement is
    /// evicted and queued for closing.
    pub fn insert(
        &mut self,
        statement: StatementDescription,
        tx_scoped: bool,
    ) -> PgResult<Arc<StatementDescription>> {
        let statement = Arc::new(statement);
        let Some(cache) = self.cache.as_mut() else {
            return Ok(statement);
        };
        if let Some(existing) = cache.peek(&statement.name) {
            if existing.statement.sql != statement.sql {
                return Err(PgError::StatementConflict {
                    name: statement.name.clone(),
                });
            }
        }
        let entry = Entry {
            statement: Arc::clone(&statement),
            tx_scoped,
        };
        if let Some((name, _)) = cache.push(statement.name.clone(), entry) {
            if name != statement.name {
                debug!(statement = %name, "evicted prepared statement");
                self.invalidated.push(name);
            }
        }
        Ok(statement)
    }

    /// Remove the statement for `sql` without closing it on the server.
    /// Used when an explicit prepare adopts a cached statement.
    pub fn take(&mut self, sql: &str) -> Option<Arc<StatementDescription>> {
        let cache = self.cache.as_mut()?;
        let name = statement_name(sql);
        match cache.peek(&name) {
            Some(entry) if entry.statement.sql == sql => cache.pop(&name).map(|e| e.statement),
            _ => None,
        }
    }

    /// Drop the statement for `sql`; it will be closed on the server before
    /// the next statement runs.
    pub fn invalidate(&mut self, sql: &str) -> bool {
        let Some(cache) = self.cache.as_mut() else {
            return false;
        };
        let name = statement_name(sql);
        match cache.peek(&name) {
            Some(entry) if entry.statement.sql == sql => {
                cache.pop(&name);
                debug!(statement = %name, "invalidated prepared statement");
                self.invalidated.push(name);
                true
            }
            _ => false,
        }
    }

    /// Drop every cached statement.
    pub fn invalidate_all(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            while let Some((name, _)) = cache.pop_lru() {
                self.invalidated.push(name);
            }
        }
    }

    /// Drop statements prepared inside a transaction that rolled back.
    pub fn invalidate_tx_scoped(&mut self) -> usize {
        let Some(cache) = self.cache.as_mut() else {
            return 0;
        };
        let names: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.tx_scoped)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            cache.pop(name);
        }
        let count = names.len();
        self.invalidated.extend(names);
        count
    }

    /// The transaction committed: its statements now outlive it.
    pub fn commit_tx_scoped(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            for (_, entry) in cache.iter_mut() {
                entry.tx_scoped = false;
            }
        }
    }

    /// Names waiting to be closed on the server.
    pub fn take_invalidated(&mut self) -> Vec<String> {
        std::mem::take(&mut self.invalidated)
    }

    pub fn has_invalidated(&self) -> bool {
        !self.invalidated.is_empty()
    }

    /// Forget everything, including pending closes. Used once the server
    /// side is known to be gone.
    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        self.invalidated.clear();
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get all statement names.
    pub fn statement_names(&self) -> Vec<String> {
        self.cache
            .as_ref()
            .map(|cache| cache.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Description Cache
// ============================================================================

/// Descriptions of statements run through the unnamed statement, keyed by
/// SQL text. Nothing lives on the server, so eviction needs no cleanup.
#[derive(Debug)]
pub struct DescriptionCache {
    cache: Option<LruCache<String, Entry>>,
}

impl DescriptionCache {
    pub fn new(capacity: usize) -> Self {
        Self { cache: lru(capacity) }
    }

    pub fn get(&mut self, sql: &str) -> Option<Arc<StatementDescription>> {
        self.cache
            .as_mut()?
            .get(sql)
            .map(|entry| Arc::clone(&entry.statement))
    }

    pub fn insert(&mut self, statement: StatementDescription, tx_scoped: bool) -> Arc<StatementDescription> {
        let statement = Arc::new(statement);
        if let Some(cache) = self.cache.as_mut() {
            cache.put(
                statement.sql.clone(),
                Entry {
                    statement: Arc::clone(&statement),
                    tx_scoped,
                },
            );
        }
        statement
    }

    pub fn invalidate(&mut self, sql: &str) -> bool {
        self.cache
            .as_mut()
            .is_some_and(|cache| cache.pop(sql).is_some())
    }

    pub fn invalidate_tx_scoped(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            let stale: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.tx_scoped)
                .map(|(sql, _)| sql.clone())
                .collect();
            for sql in stale {
                cache.pop(&sql);
            }
        }
    }

    pub fn commit_tx_scoped(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            for (_, entry) in cache.iter_mut() {
                entry.tx_scoped = false;
            }
        }
    }

    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn described(sql: &str) -> StatementDescription {
        StatementDescription::new(statement_name(sql), sql.to_string())
    }

    #[test]
    fn test_statement_names_are_bounded_digests() {
        let short = statement_name("SELECT 1");
        let long = statement_name(&"SELECT 1 UNION ALL ".repeat(10_000));
        assert!(short.starts_with("stmt_"));
        assert_eq!(short.len(), 53);
        assert_eq!(long.len(), 53);
        assert_eq!(short, statement_name("SELECT 1"));
        assert_ne!(short, statement_name("SELECT 2"));
    }

    #[test]
    fn test_cache_basic_operations() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        let mut stmt = described("SELECT $1");
        stmt.param_types = vec![Oid::INT4];
        cache.insert(stmt, false).unwrap();

        assert_eq!(cache.len(), 1);
        let found = cache.get("SELECT $1").unwrap().unwrap();
        assert_eq!(found.name, statement_name("SELECT $1"));
        assert_eq!(found.param_types, vec![Oid::INT4]);
        assert!(!found.returns_rows());
        assert!(cache.get("SELECT 2").unwrap().is_none());
    }

    #[test]
    fn test_same_name_different_sql_conflicts() {
        let mut cache = StatementCache::new(10);
        cache.insert(described("q1"), false).unwrap();

        let forged = StatementDescription::new(statement_name("q1"), "q2".to_string());
        let err = cache.insert(forged, false).unwrap_err();
        assert!(matches!(err, PgError::StatementConflict { .. }));
        // The original entry survives
        assert_eq!(cache.get("q1").unwrap().unwrap().sql, "q1");
    }

    #[test]
    fn test_cache_lru_eviction_queues_close() {
        let mut cache = StatementCache::new(2);
        cache.insert(described("q1"), false).unwrap();
        cache.insert(described("q2"), false).unwrap();

        // Access q1 to make it recently used
        cache.get("q1").unwrap();

        // Insert q3, should evict q2 (now least recently used)
        cache.insert(described("q3"), false).unwrap();

        assert!(cache.contains("q1"));
        assert!(!cache.contains("q2"));
        assert!(cache.contains("q3"));
        assert_eq!(cache.take_invalidated(), vec![statement_name("q2")]);
        assert!(!cache.has_invalidated());
    }

    #[test]
    fn test_tx_scoped_invalidation() {
        let mut cache = StatementCache::new(10);
        cache.insert(described("outside"), false).unwrap();
        cache.insert(described("inside"), true).unwrap();

        assert_eq!(cache.invalidate_tx_scoped(), 1);
        assert!(cache.contains("outside"));
        assert!(!cache.contains("inside"));
        assert_eq!(cache.take_invalidated(), vec![statement_name("inside")]);

        cache.insert(described("committed"), true).unwrap();
        cache.commit_tx_scoped();
        assert_eq!(cache.invalidate_tx_scoped(), 0);
        assert!(cache.contains("committed"));
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let mut cache = StatementCache::new(0);
        assert!(!cache.is_enabled());
        cache.insert(described("q1"), false).unwrap();
        assert!(cache.get("q1").unwrap().is_none());
        assert!(!cache.invalidate("q1"));
    }

    #[test]
    fn test_description_cache() {
        let mut cache = DescriptionCache::new(1);
        cache.insert(StatementDescription::new(String::new(), "a".into()), false);
        cache.insert(StatementDescription::new(String::new(), "b".into()), true);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        cache.invalidate_tx_scoped();
        assert!(cache.is_empty());
    }
}
