//! Error types shared across the relay.

use std::fmt;

/// Errors that can occur anywhere in the relay.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`MonitorParse`](Self::MonitorParse)
///   — malformed RTSP or monitor-control messages.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures,
///   [`PortRangeExhausted`](Self::PortRangeExhausted) — RTP/RTCP port
///   allocation.
/// - **Relay**: [`AlreadyRunning`](Self::AlreadyRunning) — double-`run()`
///   on an [`crate::server::Orchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The orchestrator was started while already running.
    #[error("relay already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Failed to parse a Monitor Server control line.
    #[error("monitor control parse error: {kind}")]
    MonitorParse { kind: ParseErrorKind },

    /// Server-side UDP port allocation exhausted the configured range.
    #[error("port range exhausted (no free port >= {floor})")]
    PortRangeExhausted { floor: u16 },
}

/// Specific kind of line-protocol parse failure (shared by RTSP and the
/// monitor control protocol, which both use CRLF/blank-line-terminated
/// `Method URI Version` + `Key: Value` framing).
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
