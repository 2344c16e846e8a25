//! Records persisted by the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum stored length of a request path, in characters.
pub const MAX_PATH_LEN: usize = 2048;

/// One accepted inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry {
    /// Client address in textual form, or `"unknown"`.
    pub address: String,
    /// Server-assigned creation time.
    pub timestamp: DateTime<Utc>,
    /// Requested path, truncated to [`MAX_PATH_LEN`] characters.
    pub path: String,
    pub country: String,
    pub city: String,
}

/// An operator-managed deny-list record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedAddress {
    pub address: String,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
}

/// Why an address was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    /// Request volume above the hourly threshold.
    HighVolume,
    /// Requests to admin endpoints.
    AdminAccess,
    /// Requests to login endpoints.
    LoginAccess,
    /// Requests to other sensitive endpoints.
    PatternMatch,
    Other,
}

impl SuspicionReason {
    /// Reasons produced by the sensitive-path rule. They share one
    /// de-duplication class.
    pub const SENSITIVE_PATH: [SuspicionReason; 3] = [
        SuspicionReason::AdminAccess,
        SuspicionReason::LoginAccess,
        SuspicionReason::PatternMatch,
    ];

    /// Stable label used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionReason::HighVolume => "high_volume",
            SuspicionReason::AdminAccess => "admin_access",
            SuspicionReason::LoginAccess => "login_access",
            SuspicionReason::PatternMatch => "pattern_match",
            SuspicionReason::Other => "other",
        }
    }
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuspicionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_volume" => Ok(SuspicionReason::HighVolume),
            "admin_access" => Ok(SuspicionReason::AdminAccess),
            "login_access" => Ok(SuspicionReason::LoginAccess),
            "pattern_match" => Ok(SuspicionReason::PatternMatch),
            "other" => Ok(SuspicionReason::Other),
            other => Err(format!("unknown suspicion reason: {}", other)),
        }
    }
}

/// A flag about to be written by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewSuspiciousEntry {
    pub address: String,
    pub reason: SuspicionReason,
    pub detected_at: DateTime<Utc>,
    pub request_count: u64,
    pub details: serde_json::Value,
}

/// A stored suspicion flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousEntry {
    pub id: i64,
    pub address: String,
    pub reason: SuspicionReason,
    pub detected_at: DateTime<Utc>,
    pub request_count: u64,
    pub investigated: bool,
    pub details: serde_json::Value,
}

impl SuspiciousEntry {
    pub(crate) fn from_new(id: i64, new: NewSuspiciousEntry) -> Self {
        Self {
            id,
            address: new.address,
            reason: new.reason,
            detected_at: new.detected_at,
            request_count: new.request_count,
            investigated: false,
            details: new.details,
        }
    }
}

/// Truncate a path to [`MAX_PATH_LEN`] characters on a char boundary.
pub fn bound_path(path: &str) -> String {
    match path.char_indices().nth(MAX_PATH_LEN) {
        Some((idx, _)) => path[..idx].to_string(),
        None => path.to_string(),
    }
}
