//! Non-blocking UDP bind helpers.
//!
//! Actual I/O on a bound socket happens through [`crate::reactor::Reactor`]
//! (`add_read` + `with_source`), which owns the `mio::net::UdpSocket`
//! directly — this module exists only to get from an [`Endpoint`] /
//! ephemeral-bind request to a registerable `mio` socket, mirroring
//! `UdpSocket::bind`/`setNonBlocking` in
//! `examples/original_source/reactor/UdpSocket.cc`.

use std::net::SocketAddr;

use crate::error::Result;

use super::Endpoint;

/// Binds a non-blocking UDP socket on `addr`, suitable for
/// `Reactor::add_read`.
pub fn bind_nonblocking(addr: SocketAddr) -> Result<mio::net::UdpSocket> {
    let socket = mio::net::UdpSocket::bind(addr)?;
    Ok(socket)
}

/// Binds a non-blocking UDP socket at an explicit port on `0.0.0.0`,
/// used when allocating the fixed RTP/RTCP port pair during SETUP.
pub fn bind_port(port: u16) -> Result<mio::net::UdpSocket> {
    bind_nonblocking(Endpoint::new("0.0.0.0", port).to_socket_addr()?)
}

/// Binds a non-blocking UDP socket on an OS-chosen ephemeral port.
pub fn bind_ephemeral() -> Result<mio::net::UdpSocket> {
    bind_port(0)
}
