//! Configuration types for the IP tracking service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Client address extraction.
    #[serde(default)]
    pub ip_extraction: IpExtractionConfig,

    /// Geolocation lookups and caching.
    #[serde(default)]
    pub geolocation: GeolocationConfig,

    /// Anomaly detection rules.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Periodic scanner scheduling.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Persistent store.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch for request tracking.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Action when the blocklist cannot be queried.
    #[serde(default)]
    pub fail_action: FailAction,

    /// Log denied requests.
    #[serde(default = "default_true")]
    pub log_blocked: bool,

    /// Log accepted requests.
    #[serde(default)]
    pub log_allowed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_action: FailAction::default(),
            log_blocked: true,
            log_allowed: false,
        }
    }
}

/// Action to take when the blocklist lookup fails.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    /// Serve the request (fail-open).
    #[default]
    Allow,
    /// Deny the request (fail-closed).
    Block,
}

/// Client address extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpExtractionConfig {
    /// Forwarding header whose first entry is the client address.
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            forwarded_header: default_forwarded_header(),
        }
    }
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

/// Geolocation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeolocationConfig {
    /// Enable external lookups. When disabled every public address
    /// resolves to "Unknown".
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lookup URL; `{ip}` is replaced by the address.
    #[serde(default = "default_geo_endpoint")]
    pub endpoint: String,

    /// Cache TTL in seconds.
    #[serde(default = "default_geo_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Lookup timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Upper bound on cached addresses.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_geo_endpoint(),
            cache_ttl_seconds: default_geo_cache_ttl(),
            timeout_ms: default_timeout(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

fn default_geo_endpoint() -> String {
    "https://ipapi.co/{ip}/json/".to_string()
}

fn default_geo_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_timeout() -> u64 {
    5000
}

fn default_max_cache_entries() -> usize {
    100_000
}

/// Anomaly detection rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Lookback window scanned by each run, in seconds.
    #[serde(default = "default_window")]
    pub window_seconds: u64,

    /// Flag addresses with more requests than this within the window.
    #[serde(default = "default_request_threshold")]
    pub request_threshold: u64,

    /// Admin and authentication endpoints. A request matches an entry when
    /// its path equals it or is nested beneath it.
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window(),
            request_threshold: default_request_threshold(),
            sensitive_paths: default_sensitive_paths(),
        }
    }
}

/// Longest accepted detection window (30 days).
pub const MAX_WINDOW_SECONDS: u64 = 30 * 24 * 3600;

impl DetectionConfig {
    /// Lookback window, saturating for values no `chrono::Duration` can hold.
    pub fn window(&self) -> chrono::Duration {
        i64::try_from(self.window_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

fn default_window() -> u64 {
    3600
}

fn default_request_threshold() -> u64 {
    100
}

fn default_sensitive_paths() -> Vec<String> {
    vec![
        "/admin".to_string(),
        "/admin/".to_string(),
        "/login".to_string(),
        "/api/login/".to_string(),
        "/api/password-reset/".to_string(),
    ]
}

/// Scanner scheduling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Seconds between scheduled runs.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Retries after a failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles for each further retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            max_retries: default_max_retries(),
            backoff_base_seconds: default_backoff_base(),
        }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }
}

fn default_interval() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    60
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite URL, or `memory` for the in-process store.
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://ip-tracking.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ip_extraction.forwarded_header.trim().is_empty() {
            anyhow::bail!("ip_extraction.forwarded_header must not be empty");
        }

        if self.geolocation.enabled && !self.geolocation.endpoint.contains("{ip}") {
            anyhow::bail!(
                "geolocation endpoint must contain an {{ip}} placeholder: {}",
                self.geolocation.endpoint
            );
        }

        if self.geolocation.timeout_ms == 0 {
            anyhow::bail!("geolocation.timeout_ms must be > 0");
        }

        if self.detection.window_seconds == 0 {
            anyhow::bail!("detection.window_seconds must be > 0");
        }

        if self.detection.window_seconds > MAX_WINDOW_SECONDS {
            anyhow::bail!(
                "detection.window_seconds ({}) must be <= {}",
                self.detection.window_seconds,
                MAX_WINDOW_SECONDS
            );
        }

        if self.scanner.interval_seconds == 0 {
            anyhow::bail!("scanner.interval_seconds must be > 0");
        }

        // A longer period than the lookback window leaves traffic unscanned.
        if self.scanner.interval_seconds > self.detection.window_seconds {
            anyhow::bail!(
                "scanner.interval_seconds ({}) must be <= detection.window_seconds ({})",
                self.scanner.interval_seconds,
                self.detection.window_seconds
            );
        }

        for path in &self.detection.sensitive_paths {
            if !path.starts_with('/') {
                anyhow::bail!("Invalid sensitive path (must start with '/'): {}", path);
            }
        }

        if self.storage.database_url.trim().is_empty() {
            anyhow::bail!("storage.database_url must not be empty");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# IP Tracking Configuration

settings:
  enabled: true
  fail_action: allow           # allow or block when the blocklist cannot be read
  log_blocked: true
  log_allowed: false

# Client address extraction
ip_extraction:
  forwarded_header: "x-forwarded-for"   # first entry is the client

# Geolocation lookups
geolocation:
  enabled: true
  endpoint: "https://ipapi.co/{ip}/json/"
  cache_ttl_seconds: 86400     # Cache results (including failures) for 24 hours
  timeout_ms: 5000             # Lookup timeout
  max_cache_entries: 100000

# Anomaly detection
detection:
  window_seconds: 3600         # Lookback window per scan
  request_threshold: 100       # Flag addresses above this many requests per window
  sensitive_paths:
    - "/admin"
    - "/admin/"
    - "/login"
    - "/api/login/"
    - "/api/password-reset/"

# Periodic scanner
scanner:
  interval_seconds: 3600
  max_retries: 3
  backoff_base_seconds: 60     # 60s, 120s, 240s

# Persistent store
storage:
  database_url: "${IP_TRACKING_DATABASE_URL}"   # e.g. sqlite://ip-tracking.db, or memory
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
