//! Partial-write helpers for non-blocking stream sockets (§2 "thin
//! wrappers over stream and datagram sockets exposing non-blocking
//! send/receive with partial-write semantics").
//!
//! Grounded on `examples/original_source/reactor/TcpConnection.cc`'s
//! `handleWrite`: a non-blocking `write()` that may accept only part of
//! the buffer, with the remainder queued for a later writable-readiness
//! callback rather than blocking the reactor thread.

use std::io::{self, Write};

/// Writes as much of `buf` as the socket will currently accept without
/// blocking. A `WouldBlock` on the very first attempt is not an error —
/// it just means zero bytes were accepted this round.
pub fn write_partial(stream: &mut impl Write, buf: &[u8]) -> io::Result<usize> {
    match stream.write(buf) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(err),
    }
}
