//! Periodic anomaly detection over the request log.
//!
//! Each run looks at the last detection window and applies two independent
//! rules:
//!
//! - **Excessive volume**: more requests than the threshold from one address.
//! - **Sensitive paths**: any request to an admin or authentication endpoint
//!   from a non-private address.
//!
//! A flag is only written when no flag of the same class exists for the
//! address within the window, so re-running over the same window is a no-op.

use crate::address::is_private_address;
use crate::config::DetectionConfig;
use crate::models::{NewSuspiciousEntry, RequestEntry, SuspicionReason};
use crate::scheduler::Job;
use crate::store::{RequestLogStore, StoreError, SuspiciousStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ADMIN_PREFIX: &str = "/admin";
const LOGIN_MARKER: &str = "login";

/// Flags written by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub window_start: Option<DateTime<Utc>>,
    pub high_volume_flags: usize,
    pub sensitive_path_flags: usize,
    /// Candidates skipped because an equivalent flag already exists.
    pub duplicates_skipped: usize,
}

impl ScanReport {
    pub fn total_flags(&self) -> usize {
        self.high_volume_flags + self.sensitive_path_flags
    }
}

/// Builds [`crate::models::SuspiciousEntry`] records from recent traffic.
pub struct AnomalyScanner {
    config: DetectionConfig,
    requests: Arc<dyn RequestLogStore>,
    suspicious: Arc<dyn SuspiciousStore>,
}

impl AnomalyScanner {
    pub fn new(
        config: DetectionConfig,
        requests: Arc<dyn RequestLogStore>,
        suspicious: Arc<dyn SuspiciousStore>,
    ) -> Self {
        Self {
            config,
            requests,
            suspicious,
        }
    }

    /// One pass over the window ending now.
    pub async fn scan(&self) -> Result<ScanReport, StoreError> {
        self.scan_at(Utc::now()).await
    }

    /// One pass over the window ending at `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport, StoreError> {
        let since = now
            .checked_sub_signed(self.config.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = ScanReport {
            window_start: Some(since),
            ..ScanReport::default()
        };

        info!(since = %since, "Starting anomaly detection");

        self.check_excessive_requests(now, since, &mut report).await?;
        self.check_sensitive_paths(now, since, &mut report).await?;

        info!(
            high_volume = report.high_volume_flags,
            sensitive_paths = report.sensitive_path_flags,
            duplicates = report.duplicates_skipped,
            "Anomaly detection completed"
        );

        Ok(report)
    }

    async fn check_excessive_requests(
        &self,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), StoreError> {
        let threshold = self.config.request_threshold;

        let mut offenders: Vec<(String, u64)> = self
            .requests
            .count_grouped_by_address(since)
            .await?
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .collect();
        offenders.sort();

        for (address, count) in offenders {
            if self
                .suspicious
                .exists_since(&address, &[SuspicionReason::HighVolume], since)
                .await?
            {
                debug!(address = %address, "High volume already flagged in window");
                report.duplicates_skipped += 1;
                continue;
            }

            warn!(
                address = %address,
                count = count,
                threshold = threshold,
                "Anomaly detected: excessive requests"
            );

            self.suspicious
                .create(NewSuspiciousEntry {
                    address,
                    reason: SuspicionReason::HighVolume,
                    detected_at: now,
                    request_count: count,
                    details: json!({
                        "count": count,
                        "threshold": threshold,
                        "method": "excessive_requests",
                    }),
                })
                .await?;
            report.high_volume_flags += 1;
        }

        Ok(())
    }

    async fn check_sensitive_paths(
        &self,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), StoreError> {
        let entries = self
            .requests
            .query_by_path_in(&self.config.sensitive_paths, since)
            .await?;

        let mut by_address: BTreeMap<&str, Vec<&RequestEntry>> = BTreeMap::new();
        for entry in &entries {
            by_address.entry(entry.address.as_str()).or_default().push(entry);
        }

        for (address, hits) in by_address {
            // Local traffic is never flagged here
            if is_private_address(address) {
                continue;
            }

            if self
                .suspicious
                .exists_since(address, &SuspicionReason::SENSITIVE_PATH, since)
                .await?
            {
                debug!(address = %address, "Sensitive access already flagged in window");
                report.duplicates_skipped += 1;
                continue;
            }

            let reason = classify_sensitive_access(&hits);
            let paths: BTreeSet<&str> = hits.iter().map(|e| e.path.as_str()).collect();
            let count = hits.len() as u64;

            warn!(
                address = %address,
                count = count,
                reason = %reason,
                "Anomaly detected: sensitive path access"
            );

            self.suspicious
                .create(NewSuspiciousEntry {
                    address: address.to_string(),
                    reason,
                    detected_at: now,
                    request_count: count,
                    details: json!({
                        "paths": paths,
                        "count": count,
                        "method": "sensitive_path_access",
                    }),
                })
                .await?;
            report.sensitive_path_flags += 1;
        }

        Ok(())
    }
}

/// Most specific reason for one address's sensitive hits: admin beats login
/// beats the generic pattern match.
fn classify_sensitive_access(hits: &[&RequestEntry]) -> SuspicionReason {
    if hits.iter().any(|e| is_admin_path(&e.path)) {
        SuspicionReason::AdminAccess
    } else if hits.iter().any(|e| e.path.contains(LOGIN_MARKER)) {
        SuspicionReason::LoginAccess
    } else {
        SuspicionReason::PatternMatch
    }
}

fn is_admin_path(path: &str) -> bool {
    path.strip_prefix(ADMIN_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[async_trait]
impl Job for AnomalyScanner {
    type Output = ScanReport;

    fn name(&self) -> &str {
        "detect-anomalies"
    }

    async fn run(&self) -> anyhow::Result<ScanReport> {
        Ok(self.scan().await?)
    }
}
