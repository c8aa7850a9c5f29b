//! Address and socket primitives (§2 "Address & Socket primitives"):
//! the [`Endpoint`] value type used as both bind target and send
//! destination, plus thin non-blocking wrappers over stream and
//! datagram sockets.
//!
//! Grounded on `examples/original_source/reactor/InetAddress.h`'s
//! `(ip, port)` pair and `UdpSocket`/`TcpConnection`'s non-blocking
//! send/receive wrappers, rebuilt on top of `mio`'s socket types so the
//! [`crate::reactor::Reactor`] can poll them directly instead of the
//! original's raw fd plumbing.

pub mod interleave;
pub mod io;
pub mod udp;

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{RelayError, Result};

/// `(ip, port)`. Immutable once constructed; used both as a bind target
/// and as a send destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        (self.ip.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                RelayError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("endpoint {self} did not resolve to an address"),
                ))
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_ip_colon_port() {
        let ep = Endpoint::new("192.168.1.5", 40000);
        assert_eq!(ep.to_string(), "192.168.1.5:40000");
    }

    #[test]
    fn resolves_to_socket_addr() {
        let ep = Endpoint::new("127.0.0.1", 8554);
        let addr = ep.to_socket_addr().unwrap();
        assert_eq!(addr.port(), 8554);
    }
}
