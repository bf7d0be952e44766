//! IPv4 socket addresses.
//!
//! Spec §1 excludes IPv6 and name resolution as non-goals; this wraps
//! [`std::net::SocketAddrV4`] directly rather than reinventing address
//! parsing.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

/// An IPv4 address and host-order port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddress(SocketAddrV4);

impl InetAddress {
    /// `0.0.0.0:port`, for binding a listener on all interfaces.
    pub fn any(port: u16) -> InetAddress {
        InetAddress(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// `127.0.0.1:port`.
    pub fn loopback(port: u16) -> InetAddress {
        InetAddress(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    pub fn new(ip: Ipv4Addr, port: u16) -> InetAddress {
        InetAddress(SocketAddrV4::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_string_rep(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }

    pub(crate) fn from_raw(addr: SocketAddrV4) -> InetAddress {
        InetAddress(addr)
    }

    pub(crate) fn as_raw(&self) -> SocketAddrV4 {
        self.0
    }
}

impl FromStr for InetAddress {
    type Err = std::net::AddrParseError;

    /// Accepts `"a.b.c.d:port"`. A bare `"a.b.c.d"` is not accepted — a port
    /// is always required, matching `sockets.h`'s address helpers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddrV4>().map(InetAddress)
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetAddress({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_quad_and_port() {
        let addr: InetAddress = "192.168.0.1:8080".parse().unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.ip(), Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn any_binds_all_interfaces() {
        let addr = InetAddress::any(0);
        assert_eq!(addr.ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn display_matches_expected_format() {
        let addr = InetAddress::loopback(9000);
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }
}
