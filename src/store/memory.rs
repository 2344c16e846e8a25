//! In-process store.
//!
//! Keeps everything in memory behind `RwLock`s. Used for tests and for
//! deployments that do not need the log to survive a restart.

use super::{
    path_matches_any, BlockedAddressStore, RequestLogStore, StoreError, SuspiciousStore,
};
use crate::models::{
    BlockedAddress, NewSuspiciousEntry, RequestEntry, SuspicionReason, SuspiciousEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory implementation of every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<Vec<RequestEntry>>,
    blocked: RwLock<HashMap<String, BlockedAddress>>,
    suspicious: RwLock<Vec<SuspiciousEntry>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of logged requests.
    pub fn request_count(&self) -> usize {
        self.requests.read().map(|r| r.len()).unwrap_or(0)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn oldest_first(mut entries: Vec<RequestEntry>) -> Vec<RequestEntry> {
    entries.sort_by_key(|e| e.timestamp);
    entries
}

#[async_trait]
impl RequestLogStore for MemoryStore {
    async fn insert(&self, entry: &RequestEntry) -> Result<(), StoreError> {
        write(&self.requests)?.push(entry.clone());
        Ok(())
    }

    async fn query_by_address_since(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        let entries = read(&self.requests)?
            .iter()
            .filter(|e| e.address == address && e.timestamp >= since)
            .cloned()
            .collect();
        Ok(oldest_first(entries))
    }

    async fn query_by_path_in(
        &self,
        paths: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        let entries = read(&self.requests)?
            .iter()
            .filter(|e| e.timestamp >= since && path_matches_any(&e.path, paths))
            .cloned()
            .collect();
        Ok(oldest_first(entries))
    }

    async fn count_grouped_by_address(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, u64>, StoreError> {
        let mut counts = HashMap::new();
        for entry in read(&self.requests)?.iter().filter(|e| e.timestamp >= since) {
            *counts.entry(entry.address.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn recent_by_address(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        let mut entries: Vec<RequestEntry> = read(&self.requests)?
            .iter()
            .filter(|e| e.address == address)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[async_trait]
impl BlockedAddressStore for MemoryStore {
    async fn insert(&self, record: &BlockedAddress) -> Result<bool, StoreError> {
        let mut blocked = write(&self.blocked)?;
        if blocked.contains_key(&record.address) {
            return Ok(false);
        }
        blocked.insert(record.address.clone(), record.clone());
        Ok(true)
    }

    async fn get(&self, address: &str) -> Result<Option<BlockedAddress>, StoreError> {
        Ok(read(&self.blocked)?.get(address).cloned())
    }

    async fn exists(&self, address: &str) -> Result<bool, StoreError> {
        Ok(read(&self.blocked)?.contains_key(address))
    }

    async fn update_reason(&self, address: &str, reason: &str) -> Result<bool, StoreError> {
        match write(&self.blocked)?.get_mut(address) {
            Some(record) => {
                record.reason = reason.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, address: &str) -> Result<bool, StoreError> {
        Ok(write(&self.blocked)?.remove(address).is_some())
    }

    async fn list(&self) -> Result<Vec<BlockedAddress>, StoreError> {
        let mut records: Vec<BlockedAddress> = read(&self.blocked)?.values().cloned().collect();
        records.sort_by(|a, b| {
            b.blocked_at
                .cmp(&a.blocked_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        Ok(records)
    }
}

#[async_trait]
impl SuspiciousStore for MemoryStore {
    async fn create(&self, entry: NewSuspiciousEntry) -> Result<SuspiciousEntry, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = SuspiciousEntry::from_new(id, entry);
        write(&self.suspicious)?.push(stored.clone());
        Ok(stored)
    }

    async fn exists_since(
        &self,
        address: &str,
        reasons: &[SuspicionReason],
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(read(&self.suspicious)?.iter().any(|s| {
            s.address == address && reasons.contains(&s.reason) && s.detected_at >= since
        }))
    }

    async fn mark_investigated(&self, id: i64) -> Result<bool, StoreError> {
        match write(&self.suspicious)?.iter_mut().find(|s| s.id == id) {
            Some(entry) => {
                entry.investigated = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut suspicious = write(&self.suspicious)?;
        let before = suspicious.len();
        suspicious.retain(|s| s.id != id);
        Ok(suspicious.len() != before)
    }

    async fn list(&self, include_investigated: bool) -> Result<Vec<SuspiciousEntry>, StoreError> {
        let mut entries: Vec<SuspiciousEntry> = read(&self.suspicious)?
            .iter()
            .filter(|s| include_investigated || !s.investigated)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }
}
