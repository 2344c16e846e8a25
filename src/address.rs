//! Client address extraction and classification.

use std::net::IpAddr;

/// Address recorded when neither a forwarding header nor a peer address is known.
pub const UNKNOWN_ADDRESS: &str = "unknown";

const PRIVATE_EXACT: &[&str] = &["127.0.0.1", "::1", "localhost"];

const PRIVATE_PREFIXES: &[&str] = &[
    "127.", "10.", "192.168.", "172.16.", "172.17.", "172.18.", "172.19.", "172.20.", "172.21.",
    "172.22.", "172.23.", "172.24.", "172.25.", "172.26.", "172.27.", "172.28.", "172.29.",
    "172.30.", "172.31.",
];

/// Whether `address` is loopback or in a private range.
///
/// Classification is textual: private addresses are never geolocated and
/// never flagged for sensitive-path access.
pub fn is_private_address(address: &str) -> bool {
    PRIVATE_EXACT.contains(&address) || PRIVATE_PREFIXES.iter().any(|p| address.starts_with(p))
}

/// Canonical text form of `address`: IP literals are re-rendered so every
/// spelling of one address compares equal. Anything else is returned trimmed.
pub fn canonical_address(address: &str) -> String {
    let address = address.trim();
    match address.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => address.to_string(),
    }
}

/// Determine the client address of a request, in canonical form.
///
/// X-Forwarded-For: client, proxy1, proxy2. The first token is the
/// originating client. Without a usable header the direct peer address is
/// used, and [`UNKNOWN_ADDRESS`] when that is missing too.
pub fn extract_client_address(forwarded_for: Option<&str>, remote_addr: Option<&str>) -> String {
    if let Some(first) = forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
    {
        return canonical_address(first);
    }

    remote_addr
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(canonical_address)
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}
