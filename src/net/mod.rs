//! Network address primitives
//!
//! Addresses are either literal IPs or unresolved domain names; the core
//! never performs name resolution itself, so a [`Destination`] carries the
//! domain through to whichever outbound eventually dials it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport-layer network of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Stream-oriented traffic
    Tcp,
    /// Datagram-oriented traffic
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A host address: IPv4, IPv6, or an unresolved domain name.
///
/// Immutable once constructed. The port lives on [`Destination`], not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IPv4 address
    Ipv4(Ipv4Addr),
    /// Literal IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name, resolved by an external collaborator
    Domain(String),
}

impl Address {
    /// Parse a host string: IP literals become IP addresses, everything
    /// else is treated as a domain name.
    #[must_use]
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Self::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => Self::Ipv6(ip),
            Err(_) => Self::Domain(host.to_string()),
        }
    }

    /// Whether this address is an IP literal (v4 or v6).
    #[must_use]
    pub fn is_ip(&self) -> bool {
        !matches!(self, Self::Domain(_))
    }

    /// The IP literal, if this address is one.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Self::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Self::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::Ipv4(v4),
            IpAddr::V6(v6) => Self::Ipv6(v6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Ipv6(ip) => write!(f, "{ip}"),
            Self::Domain(d) => f.write_str(d),
        }
    }
}

/// A fully-qualified dial target: network, address, and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Network the destination speaks
    pub network: Network,
    /// Host address
    pub address: Address,
    /// Port number
    pub port: u16,
}

impl Destination {
    /// Create a TCP destination.
    #[must_use]
    pub fn tcp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address,
            port,
        }
    }

    /// Create a UDP destination.
    #[must_use]
    pub fn udp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address,
            port,
        }
    }

    /// The socket address, when the host part is an IP literal.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `host:port` form suitable for `ToSocketAddrs`.
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl From<(Network, SocketAddr)> for Destination {
    fn from((network, addr): (Network, SocketAddr)) -> Self {
        Self {
            network,
            address: addr.ip().into(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert_eq!(
            Address::parse("127.0.0.1"),
            Address::Ipv4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(Address::parse("::1"), Address::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(
            Address::parse("example.com"),
            Address::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_address_is_ip() {
        assert!(Address::parse("8.8.8.8").is_ip());
        assert!(!Address::parse("dns.google").is_ip());
    }

    #[test]
    fn test_destination_display() {
        let dest = Destination::tcp(Address::parse("127.0.0.1"), 1080);
        assert_eq!(dest.to_string(), "tcp:127.0.0.1:1080");
        assert_eq!(dest.host_port(), "127.0.0.1:1080");

        let dest = Destination::udp(Address::parse("8.8.4.4"), 53);
        assert_eq!(dest.to_string(), "udp:8.8.4.4:53");
    }

    #[test]
    fn test_destination_socket_addr() {
        let dest = Destination::tcp(Address::parse("10.0.0.1"), 443);
        assert_eq!(dest.socket_addr(), Some("10.0.0.1:443".parse().unwrap()));

        let dest = Destination::tcp(Address::parse("example.com"), 443);
        assert_eq!(dest.socket_addr(), None);
    }
}
