//! Start-request validation.
//!
//! Runs before any session or listener exists: both ports must be outside
//! the reserved range, distinct, and currently unbound, and the target must
//! be an allowlisted upstream. Each check fails with its own descriptive
//! reason so the control plane can report exactly what was wrong.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::targets;

/// Ports at or below this value are refused.
pub const RESERVED_PORT_CEILING: u16 = 3000;

/// A start request that must be rejected before any resource is created.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Proxy and PAC listener cannot share a port.
    #[error("proxy port and pac port must differ (both are {0})")]
    PortsEqual(u16),

    /// Port inside the reserved range.
    #[error("port {0} is reserved (must be greater than {RESERVED_PORT_CEILING})")]
    PortReserved(u16),

    /// Port already bound on this host.
    #[error("port {port} is not available: {source}")]
    PortInUse {
        port: u16,
        source: std::io::Error,
    },

    /// Target not in the upstream allowlist.
    #[error("unknown upstream target: {0:?}")]
    UnknownTarget(String),
}

/// Validates a start request and resolves its upstream address.
pub fn validate_start(
    proxy_port: u16,
    pac_port: u16,
    target: &str,
) -> Result<SocketAddr, ValidationError> {
    if proxy_port == pac_port {
        return Err(ValidationError::PortsEqual(proxy_port));
    }
    for port in [proxy_port, pac_port] {
        if port <= RESERVED_PORT_CEILING {
            return Err(ValidationError::PortReserved(port));
        }
        probe_port(port)?;
    }
    targets::resolve(target).ok_or_else(|| ValidationError::UnknownTarget(target.to_string()))
}

/// Checks that a port is currently unbound by binding and releasing it.
fn probe_port(port: u16) -> Result<(), ValidationError> {
    let probe: std::io::Result<()> = (|| {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.bind(&SocketAddr::from(([127, 0, 0, 1], port)).into())?;
        Ok(())
    })();
    probe.map_err(|source| ValidationError::PortInUse { port, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ports_fail_before_anything_else() {
        let err = validate_start(3128, 3128, "loopback").unwrap_err();
        assert!(matches!(err, ValidationError::PortsEqual(3128)));
    }

    #[test]
    fn reserved_ports_fail() {
        let err = validate_start(2999, 48100, "loopback").unwrap_err();
        assert!(matches!(err, ValidationError::PortReserved(2999)));

        let err = validate_start(48100, 3000, "loopback").unwrap_err();
        assert!(matches!(err, ValidationError::PortReserved(3000)));
    }

    #[test]
    fn unknown_target_fails() {
        let err = validate_start(48101, 48102, "198.18.0.1").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTarget(_)));
    }

    #[test]
    fn bound_port_fails_the_probe() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = probe_port(port).unwrap_err();
        assert!(matches!(err, ValidationError::PortInUse { port: p, .. } if p == port));
    }

    #[test]
    fn valid_request_resolves_the_upstream() {
        let upstream = validate_start(48103, 48104, "loopback:9000").unwrap();
        assert_eq!(upstream.to_string(), "127.0.0.1:9000");
    }
}
