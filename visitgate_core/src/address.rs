//! Source address normalisation
//!
//! Ledger keys must be stable across the different spellings a client
//! address can arrive in (proxy headers, socket peers, admin URLs).

use std::net::{IpAddr, SocketAddr};

/// Normalise a source address into its ledger key form
///
/// - surrounding whitespace is removed
/// - `1.2.3.4:5678` and `[::1]:80` lose their ports, `[::1]` its brackets
/// - IPv4-mapped IPv6 (`::ffff:1.2.3.4`) becomes plain IPv4
/// - IPv6 is printed in canonical compressed lowercase form
///
/// Strings that are not IP addresses (e.g. `localhost`, garbage from a
/// forged header) are only trimmed and lowercased, never rejected.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some(ip) = parse_ip(trimmed) {
        return canonical(ip);
    }

    trimmed.to_ascii_lowercase()
}

/// Parse an address with or without port/brackets
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();

    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Some(sock.ip());
    }

    raw.strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse::<IpAddr>().ok())
}

fn canonical(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}
