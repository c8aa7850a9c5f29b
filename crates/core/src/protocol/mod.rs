//! RTSP ingest protocol plumbing (RFC 2326 message framing, applied to
//! this relay's camera-as-client direction).
//!
//! This module covers request/response parsing and SDP summarization —
//! the text-based plumbing shared by both line protocols this crate
//! speaks ([`wire`] is shared with [`crate::monitor::control`]). Method
//! dispatch itself lives on [`crate::session::connection::IngestConnection`],
//! the same way [`crate::monitor::MonitorServer`] dispatches its own
//! control requests inline rather than through a separate handler type.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! ANNOUNCE rtsp://server/cam-A RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 123\r\n
//! \r\n
//! <sdp body>
//! ```
//!
//! ## Methods accepted (§6)
//!
//! | Method | Purpose |
//! |--------|---------|
//! | OPTIONS | Capability discovery |
//! | ANNOUNCE | Camera describes its stream (SDP body) |
//! | SETUP | Negotiate transport (UDP ports or TCP-interleaved channels); allowed twice |
//! | RECORD | Start pushing media |
//! | TEARDOWN | End the session |

pub mod request;
pub mod response;
pub mod sdp;
pub mod wire;

pub use request::RtspRequest;
pub use response::RtspResponse;
