//! Client address resolution

use axum::http::HeaderMap;
use std::net::IpAddr;
use visitgate_core::normalize_address;

const UNKNOWN: &str = "unknown";

/// Visitor address plus where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress {
    pub address: String,
    /// Taken from a forwarding header rather than the socket peer
    pub forwarded: bool,
}

/// Resolve the visitor address for a request.
///
/// `trusted_hops` is the number of reverse proxies in front of this one.
/// Each of them appends the address it saw to `X-Forwarded-For`, so the
/// chain is read from the right and the entry just past the trusted hops
/// is the visitor. Anything further left is client-supplied. A chain
/// shorter than the hop count yields its leftmost entry. Without an
/// `X-Forwarded-For` chain `X-Real-IP` is used, then the socket peer.
/// Zero hops ignores the headers entirely.
pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>, trusted_hops: usize) -> ClientAddress {
    if trusted_hops > 0 {
        if let Some(address) = forwarded_address(headers, trusted_hops) {
            return ClientAddress {
                address,
                forwarded: true,
            };
        }
    }

    ClientAddress {
        address: peer
            .map(|ip| normalize_address(&ip.to_string()))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        forwarded: false,
    }
}

fn forwarded_address(headers: &HeaderMap, trusted_hops: usize) -> Option<String> {
    let chain: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let candidate = if chain.is_empty() {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())?
    } else {
        chain[chain.len().saturating_sub(trusted_hops)]
    };

    Some(normalize_address(candidate)).filter(|a| !a.is_empty())
}
