//! Address geolocation.
//!
//! [`GeoLocator`] resolves a client address to a country and city. Private
//! addresses short-circuit to "Local", everything else goes through a TTL
//! cache in front of a [`GeoProvider`]. Lookups never fail from the
//! caller's point of view: provider errors degrade to "Unknown".

pub mod ipapi;

use crate::address::is_private_address;
use crate::cache::GeoCache;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use ipapi::IpApiProvider;

pub const UNKNOWN: &str = "Unknown";
pub const LOCAL: &str = "Local";

/// Resolved location of an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub city: String,
}

impl GeoLocation {
    pub fn new(country: &str, city: &str) -> Self {
        Self {
            country: country.to_string(),
            city: city.to_string(),
        }
    }

    /// Result for failed or disabled lookups.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    /// Result for private and loopback addresses.
    pub fn local() -> Self {
        Self::new(LOCAL, LOCAL)
    }
}

/// Error from a geolocation provider.
#[derive(Debug)]
pub enum GeoError {
    /// HTTP request failed.
    Http(reqwest::Error),
    /// Timeout.
    Timeout,
    /// Rate limited.
    RateLimited,
    /// Invalid response.
    InvalidResponse(String),
    /// Other error.
    Other(String),
}

impl std::fmt::Display for GeoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeoError::Http(e) => write!(f, "HTTP error: {}", e),
            GeoError::Timeout => write!(f, "Request timed out"),
            GeoError::RateLimited => write!(f, "Rate limited"),
            GeoError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            GeoError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GeoError {}

impl From<reqwest::Error> for GeoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GeoError::Timeout
        } else {
            GeoError::Http(e)
        }
    }
}

/// External geolocation lookup.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Look up a public address.
    async fn lookup(&self, address: &str) -> Result<GeoLocation, GeoError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Cached, failure-tolerant geolocation.
pub struct GeoLocator {
    provider: Option<Arc<dyn GeoProvider>>,
    cache: Arc<GeoCache>,
}

impl GeoLocator {
    /// Create a locator. With no provider, public addresses resolve to
    /// "Unknown" without being cached.
    pub fn new(provider: Option<Arc<dyn GeoProvider>>, cache: Arc<GeoCache>) -> Self {
        Self { provider, cache }
    }

    pub fn cache(&self) -> &Arc<GeoCache> {
        &self.cache
    }

    /// Resolve `address` to a location. Never fails.
    pub async fn resolve(&self, address: &str) -> GeoLocation {
        if let Some(cached) = self.cache.get(address) {
            debug!(address = %address, country = %cached.country, "Geolocation cache hit");
            return cached;
        }

        if is_private_address(address) {
            let location = GeoLocation::local();
            self.cache.set(address, location.clone());
            return location;
        }

        // Free-form header text never reaches the provider or the cache
        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!(address = %address, "Not an IP address, skipping geolocation");
                return GeoLocation::unknown();
            }
        };

        let provider = match &self.provider {
            Some(provider) => provider,
            None => return GeoLocation::unknown(),
        };

        // The cache lock is not held here; concurrent misses for the same
        // address may both query the provider and the last write wins.
        let location = match provider.lookup(&ip.to_string()).await {
            Ok(location) => {
                info!(
                    address = %address,
                    provider = provider.name(),
                    country = %location.country,
                    city = %location.city,
                    "Geolocation resolved"
                );
                location
            }
            Err(e) => {
                warn!(
                    address = %address,
                    provider = provider.name(),
                    error = %e,
                    "Geolocation lookup failed"
                );
                GeoLocation::unknown()
            }
        };

        self.cache.set(address, location.clone());
        location
    }
}
