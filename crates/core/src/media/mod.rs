//! Media codecs and RTP depacketization.
//!
//! This module reassembles RTP packets received from a camera encoder back
//! into Annex-B H.264 access units.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame arrives split across one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpPacket`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping) — for reordering and loss detection.
//! - **Timestamp** (32-bit) — media clock, typically 90 kHz for video.
//! - **SSRC** (32-bit) — identifies the sending encoder.
//! - **Marker bit** — set on the last packet of an access unit (frame).
//!
//! Only H.264 is depacketized ([`h264`]); other codecs are out of scope.

pub mod h264;
pub mod rtp;

pub use h264::H264Depacketizer;

/// A reassembled NAL unit, Annex-B prefixed (`00 00 00 01` followed by the
/// NAL header + RBSP), and the RTP timestamp it was reassembled from.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub timestamp: u32,
    pub data: Vec<u8>,
}
