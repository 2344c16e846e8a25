//! Request tracking and IP blocking for HTTP services.
//!
//! Records every accepted request with its client address and geolocation,
//! refuses requests from blocklisted addresses, and periodically scans the
//! request log for abusive patterns.
//!
//! # Features
//!
//! - **Request Interception** - Blocklist check, geolocation and logging around any handler
//! - **Blocklist** - Operator-managed blocks, effective on the next request
//! - **Geolocation** - HTTP lookups with a TTL cache; private addresses never leave the host
//! - **Anomaly Scanner** - Flags excessive volume and sensitive path access, idempotent per window
//! - **Scheduling** - Periodic scans with exponential-backoff retries
//! - **Storage** - SQLite or in-memory
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   fail_action: allow
//!
//! geolocation:
//!   endpoint: "https://ipapi.co/{ip}/json/"
//!   cache_ttl_seconds: 86400
//!
//! detection:
//!   window_seconds: 3600
//!   request_threshold: 100
//!
//! storage:
//!   database_url: "sqlite://ip-tracking.db"
//! ```

pub mod address;
pub mod app;
pub mod blocklist;
pub mod cache;
pub mod config;
pub mod geo;
pub mod interceptor;
pub mod models;
pub mod recorder;
pub mod scanner;
pub mod scheduler;
pub mod store;

pub use app::IpTracking;
pub use config::Config;
pub use interceptor::{Decision, RequestContext, RequestInterceptor};
pub use scanner::{AnomalyScanner, ScanReport};
