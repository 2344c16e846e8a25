//! Repository interfaces over the persistent store.

pub mod memory;
pub mod sqlite;

use crate::models::{
    BlockedAddress, NewSuspiciousEntry, RequestEntry, SuspicionReason, SuspiciousEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error from the backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored data: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only request log.
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn insert(&self, entry: &RequestEntry) -> Result<(), StoreError>;

    /// Entries from `address` at or after `since`, oldest first.
    async fn query_by_address_since(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError>;

    /// Entries at or after `since` whose path matches one of `paths`
    /// (see [`path_matches`]), oldest first.
    async fn query_by_path_in(
        &self,
        paths: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError>;

    /// Request count per address at or after `since`.
    async fn count_grouped_by_address(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, u64>, StoreError>;

    /// Most recent entries for `address`, newest first.
    async fn recent_by_address(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<RequestEntry>, StoreError>;
}

/// Operator-managed deny-list.
#[async_trait]
pub trait BlockedAddressStore: Send + Sync {
    /// Insert a record. Returns `false` if the address already has one.
    async fn insert(&self, record: &BlockedAddress) -> Result<bool, StoreError>;

    async fn get(&self, address: &str) -> Result<Option<BlockedAddress>, StoreError>;

    async fn exists(&self, address: &str) -> Result<bool, StoreError>;

    async fn update_reason(&self, address: &str, reason: &str) -> Result<bool, StoreError>;

    /// Returns `false` if nothing was deleted.
    async fn delete(&self, address: &str) -> Result<bool, StoreError>;

    /// All records, most recently blocked first.
    async fn list(&self) -> Result<Vec<BlockedAddress>, StoreError>;
}

/// Scanner output.
#[async_trait]
pub trait SuspiciousStore: Send + Sync {
    async fn create(&self, entry: NewSuspiciousEntry) -> Result<SuspiciousEntry, StoreError>;

    /// Whether `address` has a flag with one of `reasons` detected at or after `since`.
    async fn exists_since(
        &self,
        address: &str,
        reasons: &[SuspicionReason],
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_investigated(&self, id: i64) -> Result<bool, StoreError>;

    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Flags ordered by detection time, newest first.
    async fn list(&self, include_investigated: bool) -> Result<Vec<SuspiciousEntry>, StoreError>;
}

/// The three repositories backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub requests: Arc<dyn RequestLogStore>,
    pub blocked: Arc<dyn BlockedAddressStore>,
    pub suspicious: Arc<dyn SuspiciousStore>,
}

impl Stores {
    /// Use one value for all three repositories.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RequestLogStore + BlockedAddressStore + SuspiciousStore + 'static,
    {
        Self {
            requests: store.clone(),
            blocked: store.clone(),
            suspicious: store,
        }
    }

    /// Open the store described by `database_url` (`memory` or a SQLite URL).
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        if database_url == "memory" {
            return Ok(Self::shared(Arc::new(MemoryStore::new())));
        }
        let store = SqliteStore::connect(database_url).await?;
        Ok(Self::shared(Arc::new(store)))
    }
}

/// Whether `path` is `pattern` or lies beneath it.
///
/// `/admin` matches `/admin`, `/admin/` and `/admin/login`, but not `/administrator`.
pub fn path_matches(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }
    let base = pattern.trim_end_matches('/');
    path == base
        || path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Whether `path` matches any of `patterns`.
pub fn path_matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| path_matches(path, p))
}
