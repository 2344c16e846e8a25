//! Request log writer.

use crate::address::canonical_address;
use crate::geo::GeoLocation;
use crate::models::{bound_path, RequestEntry};
use crate::store::{RequestLogStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Default number of entries returned by [`RequestRecorder::recent`].
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
/// Upper bound on entries returned by [`RequestRecorder::recent`].
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Creates [`RequestEntry`] records. Timestamps handed out by one recorder
/// never go backwards, even if the wall clock does.
pub struct RequestRecorder {
    store: Arc<dyn RequestLogStore>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl RequestRecorder {
    pub fn new(store: Arc<dyn RequestLogStore>) -> Self {
        Self {
            store,
            last_timestamp: Mutex::new(None),
        }
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_timestamp.lock() {
            Ok(mut last) => {
                let ts = match *last {
                    Some(prev) if prev > now => prev,
                    _ => now,
                };
                *last = Some(ts);
                ts
            }
            Err(_) => now,
        }
    }

    /// Persist one accepted request.
    pub async fn record(
        &self,
        address: &str,
        path: &str,
        location: &GeoLocation,
    ) -> Result<RequestEntry, StoreError> {
        let entry = RequestEntry {
            address: canonical_address(address),
            timestamp: self.next_timestamp(),
            path: bound_path(path),
            country: location.country.clone(),
            city: location.city.clone(),
        };

        self.store.insert(&entry).await?;
        Ok(entry)
    }

    /// Most recent entries for `address`, newest first. `limit` is clamped
    /// to [`MAX_HISTORY_LIMIT`].
    pub async fn recent(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        self.store
            .recent_by_address(&canonical_address(address), limit.min(MAX_HISTORY_LIMIT))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MAX_PATH_LEN;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_record_persists_entry() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RequestRecorder::new(store.clone());

        let entry = recorder
            .record("203.0.113.5", "/about", &GeoLocation::new("Chile", "Santiago"))
            .await
            .unwrap();

        assert_eq!(entry.address, "203.0.113.5");
        assert_eq!(entry.country, "Chile");
        assert_eq!(entry.city, "Santiago");
        assert_eq!(store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_spellings_share_one_history() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RequestRecorder::new(store);

        recorder
            .record("2001:DB8::1", "/", &GeoLocation::unknown())
            .await
            .unwrap();
        recorder
            .record("2001:0db8::1", "/", &GeoLocation::unknown())
            .await
            .unwrap();

        let recent = recorder.recent("2001:db8:0::1", DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.address == "2001:db8::1"));
    }

    #[tokio::test]
    async fn test_record_bounds_path() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RequestRecorder::new(store);

        let long_path = format!("/{}", "x".repeat(MAX_PATH_LEN * 2));
        let entry = recorder
            .record("203.0.113.5", &long_path, &GeoLocation::unknown())
            .await
            .unwrap();

        assert_eq!(entry.path.chars().count(), MAX_PATH_LEN);
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RequestRecorder::new(store);

        let mut previous = None;
        for _ in 0..50 {
            let entry = recorder
                .record("203.0.113.5", "/", &GeoLocation::unknown())
                .await
                .unwrap();
            if let Some(prev) = previous {
                assert!(entry.timestamp >= prev);
            }
            previous = Some(entry.timestamp);
        }
    }

    #[tokio::test]
    async fn test_recent_is_limited() {
        let store = Arc::new(MemoryStore::new());
        let recorder = RequestRecorder::new(store);

        for i in 0..(MAX_HISTORY_LIMIT + 5) {
            recorder
                .record("203.0.113.5", &format!("/page/{}", i), &GeoLocation::unknown())
                .await
                .unwrap();
        }
        recorder
            .record("198.51.100.1", "/", &GeoLocation::unknown())
            .await
            .unwrap();

        let recent = recorder.recent("203.0.113.5", DEFAULT_HISTORY_LIMIT).await.unwrap();
        assert_eq!(recent.len(), DEFAULT_HISTORY_LIMIT);
        assert!(recent.iter().all(|e| e.address == "203.0.113.5"));

        let capped = recorder.recent("203.0.113.5", 1000).await.unwrap();
        assert_eq!(capped.len(), MAX_HISTORY_LIMIT);
    }
}
