//! ipapi.co-style geolocation provider.

use super::{GeoError, GeoLocation, GeoProvider, UNKNOWN};
use crate::config::GeolocationConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Lookup response. Only the fields we keep are parsed.
#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    country_name: Option<String>,

    #[serde(default)]
    city: Option<String>,
}

impl IpApiResponse {
    fn into_location(self) -> GeoLocation {
        fn or_unknown(value: Option<String>) -> String {
            value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string())
        }

        GeoLocation {
            country: or_unknown(self.country_name),
            city: or_unknown(self.city),
        }
    }
}

/// Provider issuing one HTTP GET per address against a JSON endpoint.
pub struct IpApiProvider {
    endpoint: String,
    client: Client,
}

impl IpApiProvider {
    /// Create a new provider. Requests are bounded by `timeout_ms`.
    pub fn new(config: &GeolocationConfig) -> Result<Self, GeoError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
        })
    }

    fn url_for(&self, address: &str) -> String {
        self.endpoint.replace("{ip}", address)
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    async fn lookup(&self, address: &str) -> Result<GeoLocation, GeoError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| GeoError::Other(format!("not an IP address: {}", address)))?;
        let url = self.url_for(&ip.to_string());

        debug!(address = %address, "Querying geolocation provider");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("Geolocation provider rate limit exceeded");
            return Err(GeoError::RateLimited);
        }

        if !response.status().is_success() {
            return Err(GeoError::InvalidResponse(format!("HTTP {}", response.status())));
        }

        let body: IpApiResponse = response.json().await.map_err(|e| {
            GeoError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        Ok(body.into_location())
    }

    fn name(&self) -> &str {
        "ipapi"
    }
}
