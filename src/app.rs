//! Component wiring.

use crate::blocklist::BlockList;
use crate::cache::GeoCache;
use crate::config::Config;
use crate::geo::{GeoLocator, GeoProvider, IpApiProvider};
use crate::interceptor::{RequestContext, RequestInterceptor};
use crate::recorder::RequestRecorder;
use crate::scanner::AnomalyScanner;
use crate::scheduler::{IntervalScheduler, RetryPolicy};
use crate::store::Stores;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Every component, built from one [`Config`] over one set of stores.
pub struct IpTracking {
    config: Arc<Config>,
    stores: Stores,
    pub blocklist: Arc<BlockList>,
    pub geo: Arc<GeoLocator>,
    pub recorder: Arc<RequestRecorder>,
    pub interceptor: Arc<RequestInterceptor>,
    pub scanner: Arc<AnomalyScanner>,
}

impl IpTracking {
    /// Open the configured store and build all components on top of it.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let stores = Stores::open(&config.storage.database_url).await?;
        Self::with_stores(config, stores)
    }

    /// Build all components over existing stores.
    pub fn with_stores(config: Config, stores: Stores) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let cache = Arc::new(GeoCache::new(
            Duration::from_secs(config.geolocation.cache_ttl_seconds),
            config.geolocation.max_cache_entries,
        ));

        let provider: Option<Arc<dyn GeoProvider>> = if config.geolocation.enabled {
            let provider = IpApiProvider::new(&config.geolocation)?;
            info!(endpoint = %config.geolocation.endpoint, "Geolocation provider enabled");
            Some(Arc::new(provider))
        } else {
            info!("Geolocation disabled, public addresses resolve to Unknown");
            None
        };

        let geo = Arc::new(GeoLocator::new(provider, cache));
        let blocklist = Arc::new(BlockList::new(stores.blocked.clone()));
        let recorder = Arc::new(RequestRecorder::new(stores.requests.clone()));
        let interceptor = Arc::new(RequestInterceptor::new(
            config.settings.clone(),
            blocklist.clone(),
            geo.clone(),
            recorder.clone(),
        ));
        let scanner = Arc::new(AnomalyScanner::new(
            config.detection.clone(),
            stores.requests.clone(),
            stores.suspicious.clone(),
        ));

        info!(
            enabled = config.settings.enabled,
            window_secs = config.detection.window_seconds,
            threshold = config.detection.request_threshold,
            "IP tracking initialized"
        );

        Ok(Self {
            config,
            stores,
            blocklist,
            geo,
            recorder,
            interceptor,
            scanner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Request context using the configured forwarding header.
    pub fn request_context(
        &self,
        path: &str,
        remote_addr: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> RequestContext {
        RequestContext::from_headers(path, remote_addr, headers, &self.config.ip_extraction)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.scanner.max_retries,
            self.config.scanner.backoff_base(),
        )
    }

    /// Scheduler for the anomaly scanner, per the `scanner` section.
    pub fn scheduler(&self) -> IntervalScheduler {
        IntervalScheduler::new(self.config.scanner.interval(), self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeolocationConfig;
    use crate::interceptor::Decision;
    use crate::models::SuspicionReason;
    use crate::store::SuspiciousStore;

    fn offline_config() -> Config {
        Config {
            geolocation: GeolocationConfig {
                enabled: false,
                ..GeolocationConfig::default()
            },
            ..Config::default()
        }
    }

    async fn memory_app() -> IpTracking {
        let mut config = offline_config();
        config.storage.database_url = "memory".to_string();
        IpTracking::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_request_then_scan() {
        let app = memory_app().await;
        let mut headers = HashMap::new();
        headers.insert("x-forwarded-for".to_string(), "203.0.113.5".to_string());

        let ctx = app.request_context("/admin/", Some("10.0.0.1"), &headers);
        let decision = app.interceptor.on_request(&ctx).await;
        assert!(matches!(decision, Decision::Proceed { entry: Some(_) }));

        let report = app.scanner.scan().await.unwrap();
        assert_eq!(report.sensitive_path_flags, 1);

        let flags = app.stores().suspicious.list(false).await.unwrap();
        assert_eq!(flags[0].address, "203.0.113.5");
        assert_eq!(flags[0].reason, SuspicionReason::AdminAccess);
    }

    #[tokio::test]
    async fn test_operator_block_applies_to_interceptor() {
        let app = memory_app().await;
        app.blocklist.block("203.0.113.5", "manual").await.unwrap();

        let ctx = RequestContext::new("/").with_remote_addr("203.0.113.5");
        assert!(app.interceptor.on_request(&ctx).await.is_denied());
    }

    #[tokio::test]
    async fn test_sqlite_backed_app() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config();
        config.storage.database_url = format!("sqlite://{}", dir.path().join("t.db").display());

        let app = IpTracking::new(config).await.unwrap();
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.7");
        app.interceptor.on_request(&ctx).await;

        let recent = app.recorder.recent("198.51.100.7", 20).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].country, "Unknown");
    }

    #[tokio::test]
    async fn test_retry_policy_from_config() {
        let app = memory_app().await;
        let policy = app.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
    }
}
