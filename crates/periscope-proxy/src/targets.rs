//! Fixed upstream targets the relay may forward to.
//!
//! The proxy is not a general forwarder: a start request must name one of
//! the addresses below, either by its deployment name or by the literal
//! address. Everything else fails validation before a listener exists.

use std::net::{IpAddr, SocketAddr};

/// Known upstream addresses, keyed by deployment name.
///
/// Deployments replace this table with their own capture targets; the
/// `loopback` entry stays for local development and tests.
pub const KNOWN_UPSTREAMS: &[(&str, &str)] = &[
    ("loopback", "127.0.0.1"),
    ("primary", "203.0.113.10"),
    ("mirror-1", "203.0.113.24"),
    ("mirror-2", "198.51.100.73"),
];

/// Upstream port used when the target does not name one.
pub const DEFAULT_UPSTREAM_PORT: u16 = 80;

/// Resolves a target to its upstream socket address.
///
/// Accepts a deployment name or a listed address, optionally suffixed with
/// `:port`. Returns `None` for anything not in the allowlist.
pub fn resolve(target: &str) -> Option<SocketAddr> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (target, DEFAULT_UPSTREAM_PORT),
    };
    KNOWN_UPSTREAMS
        .iter()
        .find(|(name, addr)| *name == host || *addr == host)
        .and_then(|(_, addr)| addr.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, port))
}

/// Whether a target names an allowlisted upstream.
pub fn is_known(target: &str) -> bool {
    resolve(target).is_some()
}

/// Iterates the allowlisted addresses, for the PAC script.
pub fn known_addresses() -> impl Iterator<Item = &'static str> {
    KNOWN_UPSTREAMS.iter().map(|(_, addr)| *addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_by_name() {
        let addr = resolve("loopback").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:80");
    }

    #[test]
    fn resolve_by_address_with_port() {
        let addr = resolve("203.0.113.10:8080").unwrap();
        assert_eq!(addr.to_string(), "203.0.113.10:8080");
    }

    #[test]
    fn resolve_unknown_fails() {
        assert!(resolve("203.0.113.99").is_none());
        assert!(resolve("evil.example.com").is_none());
        assert!(!is_known("nonsense"));
    }

    #[test]
    fn resolve_bad_port_fails() {
        assert!(resolve("loopback:notaport").is_none());
    }
}
