//! Address resolution and normalization helpers
//!
//! Remote clients may appear as IPv4, IPv6, or IPv4-mapped IPv6 addresses
//! depending on how the proxy socket is bound. A mapped address is the same
//! peer as its embedded IPv4 address, so sizing decisions and endpoint
//! equality both normalize before comparing.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::ConfigError;

/// Resolve a `host:port` string to a socket address.
///
/// The first resolved address is used, matching the behavior of resolving
/// once at startup.
///
/// # Errors
///
/// Returns [`ConfigError::EndpointUnresolvable`] if the string does not
/// parse or resolves to nothing.
pub fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, ConfigError> {
    match endpoint.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ConfigError::unresolvable(endpoint, "no addresses returned")),
        Err(e) => Err(ConfigError::unresolvable(endpoint, e.to_string())),
    }
}

/// Normalize an address: IPv4-mapped IPv6 becomes plain IPv4.
#[must_use]
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Compare two addresses with IPv4-mapped-IPv6 normalization.
#[must_use]
pub fn mapped_eq(a: SocketAddr, b: SocketAddr) -> bool {
    canonical(a) == canonical(b)
}

/// Whether an address belongs to the IPv4 family for sizing purposes.
///
/// IPv4-mapped IPv6 addresses travel in IPv4 packets on the wire, so they
/// count as IPv4.
#[must_use]
pub fn is_ipv4_family(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint() {
        let addr = resolve_endpoint("127.0.0.1:51820").unwrap();
        assert_eq!(addr.port(), 51820);
        assert!(addr.is_ipv4());

        let addr = resolve_endpoint("[::1]:51820").unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn test_resolve_endpoint_invalid() {
        assert!(matches!(
            resolve_endpoint("not an endpoint"),
            Err(ConfigError::EndpointUnresolvable { .. })
        ));
    }

    #[test]
    fn test_canonical_mapped() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:51820".parse().unwrap();
        let plain: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        assert_eq!(canonical(mapped), plain);
        assert_eq!(canonical(plain), plain);

        let v6: SocketAddr = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(canonical(v6), v6);
    }

    #[test]
    fn test_mapped_eq() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:51820".parse().unwrap();
        let plain: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        let other: SocketAddr = "192.0.2.2:51820".parse().unwrap();

        assert!(mapped_eq(mapped, plain));
        assert!(mapped_eq(plain, mapped));
        assert!(!mapped_eq(mapped, other));
        assert!(!mapped_eq(plain, "192.0.2.1:51821".parse().unwrap()));
    }

    #[test]
    fn test_is_ipv4_family() {
        let v4: SocketAddr = "192.0.2.1:1".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:1".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:1".parse().unwrap();

        assert!(is_ipv4_family(&v4));
        assert!(is_ipv4_family(&mapped));
        assert!(!is_ipv4_family(&v6));
    }
}
