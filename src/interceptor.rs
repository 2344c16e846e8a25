//! Per-request tracking and blocklist enforcement.

use crate::address::extract_client_address;
use crate::blocklist::BlockList;
use crate::config::{FailAction, IpExtractionConfig, Settings};
use crate::geo::GeoLocator;
use crate::models::RequestEntry;
use crate::recorder::RequestRecorder;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Status returned for denied requests.
pub const FORBIDDEN_STATUS: u16 = 403;
/// Body returned for denied requests.
pub const FORBIDDEN_BODY: &str = "Access denied: Your IP address has been blocked.";

/// What the host HTTP layer hands us about an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Direct peer address, if known.
    pub remote_addr: Option<String>,
    /// Raw value of the forwarding header, if present.
    pub forwarded_for: Option<String>,
    pub path: String,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Build a context from request headers keyed by lowercase name.
    pub fn from_headers(
        path: impl Into<String>,
        remote_addr: Option<&str>,
        headers: &HashMap<String, String>,
        config: &IpExtractionConfig,
    ) -> Self {
        Self {
            remote_addr: remote_addr.map(str::to_string),
            forwarded_for: headers
                .get(&config.forwarded_header.to_lowercase())
                .cloned(),
            path: path.into(),
        }
    }

    /// Client address per the forwarding-header rules.
    pub fn client_address(&self) -> String {
        extract_client_address(self.forwarded_for.as_deref(), self.remote_addr.as_deref())
    }
}

/// Interceptor verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Refuse with [`FORBIDDEN_STATUS`]; nothing was recorded.
    Deny { address: String },
    /// Hand the request on. `entry` is `None` when tracking is disabled or
    /// the log write failed.
    Proceed { entry: Option<RequestEntry> },
}

impl Decision {
    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }
}

/// Result of [`RequestInterceptor::handle`].
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<R> {
    Forbidden,
    Forwarded(R),
}

impl<R> Outcome<R> {
    /// Status and body to send back when the request was refused.
    pub fn rejection(&self) -> Option<(u16, &'static str)> {
        match self {
            Outcome::Forbidden => Some((FORBIDDEN_STATUS, FORBIDDEN_BODY)),
            Outcome::Forwarded(_) => None,
        }
    }
}

/// Orchestrates blocklist check, geolocation and logging for each request.
///
/// Safe to share across concurrently handled requests.
pub struct RequestInterceptor {
    settings: Settings,
    blocklist: Arc<BlockList>,
    geo: Arc<GeoLocator>,
    recorder: Arc<RequestRecorder>,
}

impl RequestInterceptor {
    pub fn new(
        settings: Settings,
        blocklist: Arc<BlockList>,
        geo: Arc<GeoLocator>,
        recorder: Arc<RequestRecorder>,
    ) -> Self {
        Self {
            settings,
            blocklist,
            geo,
            recorder,
        }
    }

    /// Classify and log one request. Never fails.
    pub async fn on_request(&self, ctx: &RequestContext) -> Decision {
        // Check global kill switch
        if !self.settings.enabled {
            debug!("IP tracking disabled globally");
            return Decision::Proceed { entry: None };
        }

        let address = ctx.client_address();

        let blocked = match self.blocklist.is_blocked(&address).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(address = %address, error = %e, "Blocklist lookup failed");
                self.settings.fail_action == FailAction::Block
            }
        };

        if blocked {
            if self.settings.log_blocked {
                warn!(address = %address, path = %ctx.path, "Blocked request from blacklisted IP");
            }
            return Decision::Deny { address };
        }

        let location = self.geo.resolve(&address).await;

        let entry = match self.recorder.record(&address, &ctx.path, &location).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(address = %address, error = %e, "Failed to log request");
                None
            }
        };

        if self.settings.log_allowed {
            debug!(
                address = %address,
                path = %ctx.path,
                country = %location.country,
                "Request tracked"
            );
        }

        Decision::Proceed { entry }
    }

    /// Run `next` unless the request is denied, returning its result unchanged.
    pub async fn handle<F, Fut, R>(&self, ctx: &RequestContext, next: F) -> Outcome<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        match self.on_request(ctx).await {
            Decision::Deny { .. } => Outcome::Forbidden,
            Decision::Proceed { .. } => Outcome::Forwarded(next().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GeoCache;
    use crate::geo::tests::CountingProvider;
    use crate::geo::GeoProvider;
    use crate::models::BlockedAddress;
    use crate::store::{BlockedAddressStore, MemoryStore, RequestLogStore, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        blocklist: Arc<BlockList>,
        provider: Arc<CountingProvider>,
        interceptor: RequestInterceptor,
    }

    fn harness(settings: Settings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(CountingProvider::ok("Brazil", "Recife"));
        let cache = Arc::new(GeoCache::new(Duration::from_secs(86400), 1000));
        let geo = Arc::new(GeoLocator::new(
            Some(provider.clone() as Arc<dyn GeoProvider>),
            cache,
        ));
        let blocklist = Arc::new(BlockList::new(store.clone()));
        let recorder = Arc::new(RequestRecorder::new(store.clone()));
        let interceptor = RequestInterceptor::new(settings, blocklist.clone(), geo, recorder);

        Harness {
            store,
            blocklist,
            provider,
            interceptor,
        }
    }

    #[tokio::test]
    async fn test_accepted_request_is_recorded() {
        let h = harness(Settings::default());
        let ctx = RequestContext::new("/products").with_remote_addr("203.0.113.5");

        let decision = h.interceptor.on_request(&ctx).await;

        let entry = match decision {
            Decision::Proceed { entry: Some(entry) } => entry,
            other => panic!("unexpected decision: {:?}", other),
        };
        assert_eq!(entry.address, "203.0.113.5");
        assert_eq!(entry.path, "/products");
        assert_eq!(entry.country, "Brazil");
        assert_eq!(entry.city, "Recife");
        assert_eq!(h.store.request_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_request_denied_and_not_recorded() {
        let h = harness(Settings::default());
        h.blocklist.block("203.0.113.5", "abuse").await.unwrap();

        let ctx = RequestContext::new("/").with_remote_addr("203.0.113.5");
        let decision = h.interceptor.on_request(&ctx).await;

        assert!(decision.is_denied());
        assert_eq!(h.store.request_count(), 0);
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_blocked_ipv6_denied_in_any_spelling() {
        let h = harness(Settings::default());
        h.blocklist.block("2001:DB8::1", "abuse").await.unwrap();

        for spelling in ["2001:DB8::1", "2001:0db8::1", "2001:0db8:0000::1"] {
            let ctx = RequestContext::new("/").with_remote_addr(spelling);
            assert!(h.interceptor.on_request(&ctx).await.is_denied(), "{}", spelling);

            let ctx = RequestContext::new("/").with_forwarded_for(spelling);
            assert!(h.interceptor.on_request(&ctx).await.is_denied(), "{}", spelling);
        }
        assert_eq!(h.store.request_count(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_header_decides_address() {
        let h = harness(Settings::default());
        h.blocklist.block("203.0.113.5", "").await.unwrap();

        let ctx = RequestContext::new("/")
            .with_remote_addr("10.0.0.1")
            .with_forwarded_for("203.0.113.5, 10.0.0.1");

        assert_eq!(ctx.client_address(), "203.0.113.5");
        assert!(h.interceptor.on_request(&ctx).await.is_denied());
    }

    #[test]
    fn test_context_from_headers() {
        let mut headers = HashMap::new();
        headers.insert(
            "x-forwarded-for".to_string(),
            " 203.0.113.5 , 10.0.0.1".to_string(),
        );
        let config = IpExtractionConfig {
            forwarded_header: "X-Forwarded-For".to_string(),
        };

        let ctx = RequestContext::from_headers("/", Some("10.0.0.1"), &headers, &config);
        assert_eq!(ctx.client_address(), "203.0.113.5");

        let ctx = RequestContext::from_headers("/", Some("10.0.0.1"), &HashMap::new(), &config);
        assert_eq!(ctx.client_address(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_unknown_address_is_recorded() {
        let h = harness(Settings::default());
        let ctx = RequestContext::new("/health");

        match h.interceptor.on_request(&ctx).await {
            Decision::Proceed { entry: Some(entry) } => assert_eq!(entry.address, "unknown"),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_forwards_unchanged_response() {
        let h = harness(Settings::default());
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");

        let outcome = h.interceptor.handle(&ctx, || async { (200u16, "ok") }).await;
        assert_eq!(outcome, Outcome::Forwarded((200, "ok")));
        assert_eq!(outcome.rejection(), None);
    }

    #[tokio::test]
    async fn test_handle_skips_downstream_when_denied() {
        let h = harness(Settings::default());
        h.blocklist.block("198.51.100.4", "").await.unwrap();
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");

        let called = AtomicBool::new(false);
        let called_ref = &called;
        let outcome = h
            .interceptor
            .handle(&ctx, || async move {
                called_ref.store(true, Ordering::SeqCst);
            })
            .await;

        assert_eq!(outcome, Outcome::Forbidden);
        assert_eq!(
            outcome.rejection(),
            Some((403, "Access denied: Your IP address has been blocked."))
        );
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_block_visible_on_next_request() {
        let h = harness(Settings::default());
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");

        assert!(!h.interceptor.on_request(&ctx).await.is_denied());
        h.blocklist.block("198.51.100.4", "").await.unwrap();
        assert!(h.interceptor.on_request(&ctx).await.is_denied());
        h.blocklist.unblock("198.51.100.4").await.unwrap();
        assert!(!h.interceptor.on_request(&ctx).await.is_denied());
    }

    #[tokio::test]
    async fn test_disabled_tracking_passes_through() {
        let settings = Settings {
            enabled: false,
            ..Settings::default()
        };
        let h = harness(settings);
        h.blocklist.block("198.51.100.4", "").await.unwrap();

        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");
        assert_eq!(
            h.interceptor.on_request(&ctx).await,
            Decision::Proceed { entry: None }
        );
        assert_eq!(h.store.request_count(), 0);
    }

    /// Store whose every operation fails.
    struct BrokenStore;

    fn broken() -> StoreError {
        StoreError::Unavailable("database is down".to_string())
    }

    #[async_trait]
    impl RequestLogStore for BrokenStore {
        async fn insert(&self, _entry: &RequestEntry) -> Result<(), StoreError> {
            Err(broken())
        }
        async fn query_by_address_since(
            &self,
            _address: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<RequestEntry>, StoreError> {
            Err(broken())
        }
        async fn query_by_path_in(
            &self,
            _paths: &[String],
            _since: DateTime<Utc>,
        ) -> Result<Vec<RequestEntry>, StoreError> {
            Err(broken())
        }
        async fn count_grouped_by_address(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<HashMap<String, u64>, StoreError> {
            Err(broken())
        }
        async fn recent_by_address(
            &self,
            _address: &str,
            _limit: usize,
        ) -> Result<Vec<RequestEntry>, StoreError> {
            Err(broken())
        }
    }

    #[async_trait]
    impl BlockedAddressStore for BrokenStore {
        async fn insert(&self, _record: &BlockedAddress) -> Result<bool, StoreError> {
            Err(broken())
        }
        async fn get(&self, _address: &str) -> Result<Option<BlockedAddress>, StoreError> {
            Err(broken())
        }
        async fn exists(&self, _address: &str) -> Result<bool, StoreError> {
            Err(broken())
        }
        async fn update_reason(&self, _address: &str, _reason: &str) -> Result<bool, StoreError> {
            Err(broken())
        }
        async fn delete(&self, _address: &str) -> Result<bool, StoreError> {
            Err(broken())
        }
        async fn list(&self) -> Result<Vec<BlockedAddress>, StoreError> {
            Err(broken())
        }
    }

    fn broken_interceptor(settings: Settings) -> RequestInterceptor {
        let store = Arc::new(BrokenStore);
        let cache = Arc::new(GeoCache::new(Duration::from_secs(60), 10));
        RequestInterceptor::new(
            settings,
            Arc::new(BlockList::new(store.clone())),
            Arc::new(GeoLocator::new(None, cache)),
            Arc::new(RequestRecorder::new(store)),
        )
    }

    #[tokio::test]
    async fn test_log_failure_still_serves_request() {
        let interceptor = broken_interceptor(Settings::default());
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");

        let outcome = interceptor.handle(&ctx, || async { "served" }).await;
        assert_eq!(outcome, Outcome::Forwarded("served"));
    }

    #[tokio::test]
    async fn test_blocklist_failure_fail_closed() {
        let settings = Settings {
            fail_action: FailAction::Block,
            ..Settings::default()
        };
        let interceptor = broken_interceptor(settings);
        let ctx = RequestContext::new("/").with_remote_addr("198.51.100.4");

        assert!(interceptor.on_request(&ctx).await.is_denied());
    }

    #[tokio::test]
    async fn test_private_address_recorded_as_local() {
        let h = harness(Settings::default());
        let ctx = RequestContext::new("/").with_remote_addr("127.0.0.1");

        match h.interceptor.on_request(&ctx).await {
            Decision::Proceed { entry: Some(entry) } => {
                assert_eq!(entry.country, "Local");
                assert_eq!(entry.city, "Local");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert_eq!(h.provider.calls(), 0);
    }
}
