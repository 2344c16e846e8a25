//! SQLite-backed store.

use super::{BlockedAddressStore, RequestLogStore, StoreError, SuspiciousStore};
use crate::models::{
    BlockedAddress, NewSuspiciousEntry, RequestEntry, SuspicionReason, SuspiciousEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS request_log (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        address     TEXT NOT NULL,
        timestamp   INTEGER NOT NULL,
        path        TEXT NOT NULL,
        country     TEXT NOT NULL,
        city        TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_request_log_address_ts ON request_log(address, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_request_log_path_ts ON request_log(path, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_request_log_ts ON request_log(timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS blocked_address (
        address     TEXT PRIMARY KEY,
        blocked_at  INTEGER NOT NULL,
        reason      TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS suspicious_entry (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        address         TEXT NOT NULL,
        reason          TEXT NOT NULL,
        detected_at     INTEGER NOT NULL,
        request_count   INTEGER NOT NULL,
        investigated    INTEGER NOT NULL DEFAULT 0,
        details         TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_suspicious_address_ts ON suspicious_entry(address, detected_at DESC)",
];

/// Store backed by a SQLite database through a connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite://ip-tracking.db` or `sqlite::memory:`),
    /// creating the database and schema if missing.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Every connection to an in-memory database sees a different database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        if !url.contains(":memory:") {
            sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        }

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(url = %url, "SQLite store ready");

        Ok(Self { pool })
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn request_from_row(row: &SqliteRow) -> Result<RequestEntry, StoreError> {
    Ok(RequestEntry {
        address: row.try_get("address")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        path: row.try_get("path")?,
        country: row.try_get("country")?,
        city: row.try_get("city")?,
    })
}

fn blocked_from_row(row: &SqliteRow) -> Result<BlockedAddress, StoreError> {
    Ok(BlockedAddress {
        address: row.try_get("address")?,
        blocked_at: from_millis(row.try_get("blocked_at")?)?,
        reason: row.try_get("reason")?,
    })
}

fn suspicious_from_row(row: &SqliteRow) -> Result<SuspiciousEntry, StoreError> {
    let reason: String = row.try_get("reason")?;
    let details: String = row.try_get("details")?;
    let request_count: i64 = row.try_get("request_count")?;
    Ok(SuspiciousEntry {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        reason: reason.parse().map_err(StoreError::Corrupt)?,
        detected_at: from_millis(row.try_get("detected_at")?)?,
        request_count: u64::try_from(request_count).map_err(|_| {
            StoreError::Corrupt(format!("negative request count: {}", request_count))
        })?,
        investigated: row.try_get("investigated")?,
        details: serde_json::from_str(&details)?,
    })
}

/// `?1, ?2, ...` starting at `first`.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl RequestLogStore for SqliteStore {
    async fn insert(&self, entry: &RequestEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO request_log (address, timestamp, path, country, city)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&entry.address)
        .bind(to_millis(entry.timestamp))
        .bind(&entry.path)
        .bind(&entry.country)
        .bind(&entry.city)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_by_address_since(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, timestamp, path, country, city
            FROM request_log
            WHERE address = ?1 AND timestamp >= ?2
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(address)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn query_by_path_in(
        &self,
        paths: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        // Each pattern matches itself, its base without a trailing slash,
        // and anything nested beneath the base.
        let bases: Vec<String> = paths
            .iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .collect();
        let nested: Vec<String> = bases.iter().map(|b| format!("{}/", b)).collect();

        let n = paths.len();
        let sql = format!(
            r#"
            SELECT address, timestamp, path, country, city
            FROM request_log
            WHERE timestamp >= ?1
              AND (path IN ({exact}) OR path IN ({bases}) OR {nested})
            ORDER BY timestamp ASC, id ASC
            "#,
            exact = placeholders(2, n),
            bases = placeholders(2 + n, n),
            nested = (0..n)
                .map(|i| {
                    let p = 2 + 2 * n + i;
                    format!("substr(path, 1, length(?{p})) = ?{p}")
                })
                .collect::<Vec<_>>()
                .join(" OR "),
        );

        let mut query = sqlx::query(&sql).bind(to_millis(since));
        for value in paths.iter().chain(bases.iter()).chain(nested.iter()) {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn count_grouped_by_address(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, COUNT(*) AS count
            FROM request_log
            WHERE timestamp >= ?1
            GROUP BY address
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let address: String = row.try_get("address")?;
                let count: i64 = row.try_get("count")?;
                Ok((address, count.max(0) as u64))
            })
            .collect()
    }

    async fn recent_by_address(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<RequestEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, timestamp, path, country, city
            FROM request_log
            WHERE address = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(address)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl BlockedAddressStore for SqliteStore {
    async fn insert(&self, record: &BlockedAddress) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blocked_address (address, blocked_at, reason)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(address) DO NOTHING
            "#,
        )
        .bind(&record.address)
        .bind(to_millis(record.blocked_at))
        .bind(&record.reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, address: &str) -> Result<Option<BlockedAddress>, StoreError> {
        let row = sqlx::query(
            "SELECT address, blocked_at, reason FROM blocked_address WHERE address = ?1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(blocked_from_row).transpose()
    }

    async fn exists(&self, address: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM blocked_address WHERE address = ?1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn update_reason(&self, address: &str, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE blocked_address SET reason = ?2 WHERE address = ?1")
            .bind(address)
            .bind(reason)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, address: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM blocked_address WHERE address = ?1")
            .bind(address)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<BlockedAddress>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address, blocked_at, reason
            FROM blocked_address
            ORDER BY blocked_at DESC, address ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(blocked_from_row).collect()
    }
}

#[async_trait]
impl SuspiciousStore for SqliteStore {
    async fn create(&self, entry: NewSuspiciousEntry) -> Result<SuspiciousEntry, StoreError> {
        let details = serde_json::to_string(&entry.details)?;
        let request_count = i64::try_from(entry.request_count).unwrap_or(i64::MAX);

        let result = sqlx::query(
            r#"
            INSERT INTO suspicious_entry (address, reason, detected_at, request_count, investigated, details)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
        )
        .bind(&entry.address)
        .bind(entry.reason.as_str())
        .bind(to_millis(entry.detected_at))
        .bind(request_count)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(SuspiciousEntry::from_new(result.last_insert_rowid(), entry))
    }

    async fn exists_since(
        &self,
        address: &str,
        reasons: &[SuspicionReason],
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if reasons.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            r#"
            SELECT 1 FROM suspicious_entry
            WHERE address = ?1 AND detected_at >= ?2 AND reason IN ({})
            LIMIT 1
            "#,
            placeholders(3, reasons.len())
        );

        let mut query = sqlx::query(&sql).bind(address).bind(to_millis(since));
        for reason in reasons {
            query = query.bind(reason.as_str());
        }

        Ok(query.fetch_optional(&self.pool).await?.is_some())
    }

    async fn mark_investigated(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE suspicious_entry SET investigated = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM suspicious_entry WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, include_investigated: bool) -> Result<Vec<SuspiciousEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, reason, detected_at, request_count, investigated, details
            FROM suspicious_entry
            WHERE ?1 OR investigated = 0
            ORDER BY detected_at DESC, id DESC
            "#,
        )
        .bind(include_investigated)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(suspicious_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn entry(address: &str, path: &str, timestamp: DateTime<Utc>) -> RequestEntry {
        RequestEntry {
            address: address.to_string(),
            timestamp,
            path: path.to_string(),
            country: "Local".to_string(),
            city: "Local".to_string(),
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
        assert_eq!(placeholders(1, 0), "");
    }

    #[tokio::test]
    async fn test_request_log_roundtrip_and_windows() {
        let store = memory_store().await;
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let old = now - Duration::hours(3);

        RequestLogStore::insert(&store, &entry("1.2.3.4", "/", old)).await.unwrap();
        RequestLogStore::insert(&store, &entry("1.2.3.4", "/admin/login", now))
            .await
            .unwrap();
        RequestLogStore::insert(&store, &entry("5.6.7.8", "/administrator", now))
            .await
            .unwrap();
        RequestLogStore::insert(&store, &entry("5.6.7.8", "/api/login", now))
            .await
            .unwrap();

        let since = now - Duration::hours(1);

        let by_address = store.query_by_address_since("1.2.3.4", since).await.unwrap();
        assert_eq!(by_address, vec![entry("1.2.3.4", "/admin/login", now)]);

        let sensitive = vec!["/admin".to_string(), "/api/login/".to_string()];
        let by_path = store.query_by_path_in(&sensitive, since).await.unwrap();
        let paths: Vec<&str> = by_path.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&"/admin/login"));
        assert!(paths.contains(&"/api/login"));

        let counts = store.count_grouped_by_address(since).await.unwrap();
        assert_eq!(counts.get("1.2.3.4"), Some(&1));
        assert_eq!(counts.get("5.6.7.8"), Some(&2));

        let recent = store.recent_by_address("1.2.3.4", 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].path, "/admin/login");
    }

    #[tokio::test]
    async fn test_blocked_address_crud() {
        let store = memory_store().await;
        let first = BlockedAddress {
            address: "1.2.3.4".to_string(),
            blocked_at: Utc::now() - Duration::minutes(5),
            reason: "scraping".to_string(),
        };
        let second = BlockedAddress {
            address: "5.6.7.8".to_string(),
            blocked_at: Utc::now(),
            reason: String::new(),
        };

        assert!(BlockedAddressStore::insert(&store, &first).await.unwrap());
        assert!(!BlockedAddressStore::insert(&store, &first).await.unwrap());
        assert!(BlockedAddressStore::insert(&store, &second).await.unwrap());

        let listed = BlockedAddressStore::list(&store).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].address, "5.6.7.8");

        assert!(store.update_reason("1.2.3.4", "abuse").await.unwrap());
        assert_eq!(store.get("1.2.3.4").await.unwrap().unwrap().reason, "abuse");

        assert!(BlockedAddressStore::delete(&store, "1.2.3.4").await.unwrap());
        assert!(!BlockedAddressStore::delete(&store, "1.2.3.4").await.unwrap());
        assert!(!store.exists("1.2.3.4").await.unwrap());
        assert!(store.exists("5.6.7.8").await.unwrap());
    }

    #[tokio::test]
    async fn test_suspicious_entries() {
        let store = memory_store().await;
        let now = Utc::now();

        let created = store
            .create(NewSuspiciousEntry {
                address: "203.0.113.9".to_string(),
                reason: SuspicionReason::AdminAccess,
                detected_at: now,
                request_count: 3,
                details: serde_json::json!({"paths": ["/admin"], "count": 3}),
            })
            .await
            .unwrap();

        let since = now - Duration::hours(1);
        assert!(store
            .exists_since("203.0.113.9", &SuspicionReason::SENSITIVE_PATH, since)
            .await
            .unwrap());
        assert!(!store
            .exists_since("203.0.113.9", &[SuspicionReason::HighVolume], since)
            .await
            .unwrap());
        assert!(!store
            .exists_since("203.0.113.9", &[], since)
            .await
            .unwrap());

        let listed = SuspiciousStore::list(&store, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].details["count"], 3);
        assert_eq!(listed[0].reason, SuspicionReason::AdminAccess);

        assert!(store.mark_investigated(created.id).await.unwrap());
        assert!(SuspiciousStore::list(&store, false).await.unwrap().is_empty());
        assert!(SuspiciousStore::list(&store, true).await.unwrap()[0].investigated);

        assert!(SuspiciousStore::delete(&store, created.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tracking.db").display());

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            let record = BlockedAddress {
                address: "198.51.100.7".to_string(),
                blocked_at: Utc::now(),
                reason: "manual".to_string(),
            };
            BlockedAddressStore::insert(&store, &record).await.unwrap();
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        assert!(reopened.exists("198.51.100.7").await.unwrap());
    }
}
