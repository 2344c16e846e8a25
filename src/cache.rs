//! TTL-based cache for geolocation lookups.

use crate::geo::GeoLocation;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Cached geolocation result.
#[derive(Debug, Clone)]
pub struct CachedLocation {
    pub location: GeoLocation,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedLocation {
    /// Expired once `ttl` has elapsed since the write.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Thread-safe TTL cache keyed by client address.
///
/// Entries expire a fixed time after they were written; reads never extend
/// their lifetime.
pub struct GeoCache {
    cache: RwLock<HashMap<String, CachedLocation>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl GeoCache {
    /// Create a new geolocation cache.
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached location if available and not expired.
    pub fn get(&self, address: &str) -> Option<GeoLocation> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(address)?;

        if entry.is_expired() {
            // Left in place; a write at capacity or to this key drops it
            None
        } else {
            Some(entry.location.clone())
        }
    }

    /// Store a location with the default TTL.
    pub fn set(&self, address: &str, location: GeoLocation) {
        self.set_with_ttl(address, location, self.default_ttl);
    }

    /// Store a location with a custom TTL.
    pub fn set_with_ttl(&self, address: &str, location: GeoLocation, ttl: Duration) {
        let entry = CachedLocation {
            location,
            cached_at: Instant::now(),
            ttl,
        };

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_entries && !cache.contains_key(address) {
                Self::evict_expired_entries(&mut cache);

                // Still full: drop the oldest write
                if cache.len() >= self.max_entries {
                    if let Some(oldest) = cache
                        .iter()
                        .min_by_key(|(_, v)| v.cached_at)
                        .map(|(k, _)| k.clone())
                    {
                        cache.remove(&oldest);
                    }
                }
            }

            cache.insert(address.to_string(), entry);
        }
    }

    fn evict_expired_entries(cache: &mut HashMap<String, CachedLocation>) {
        cache.retain(|_, v| !v.is_expired());
    }

    /// Entries held, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}
