//! # camrelay — multi-camera RTSP ingest relay
//!
//! Embedded cameras push H.264 over RTSP, acting as clients that
//! `ANNOUNCE`/`RECORD` into this relay; the relay terminates those
//! sessions, reassembles per-camera RTP into elementary H.264 streams,
//! and fans them out to monitoring clients over a secondary control
//! channel that negotiates per-session reliable-UDP (KCP-style)
//! transports for the video payload.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Ingest request/response parsing, session lifecycle, transport negotiation |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Packet header parsing, sequence/timestamp handling |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Summarizing the camera's inbound `ANNOUNCE` body |
//! | [RFC 6184](https://tools.ietf.org/html/rfc6184) | H.264 RTP payload | Single-NALU, STAP-A, and FU-A depacketization |
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Orchestrator   — startup/shutdown wiring   │
//! ├────────────────────────────────────────────┤
//! │  Reactor pool    — main + N worker loops    │
//! │  Session         — ingest state machine     │
//! │  Monitor         — fan-out control plane    │
//! ├────────────────────────────────────────────┤
//! │  Protocol        — RTSP parsing, SDP        │
//! │  Media           — RTP/H.264 depacketizer   │
//! │  Kcp             — reliable-UDP endpoint    │
//! │  Transport       — address/socket primitives│
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use camrelay::{Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::start(OrchestratorConfig::default()).unwrap();
//! orchestrator.run().unwrap(); // blocks until `orchestrator.stop()` is called elsewhere
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — [`Orchestrator`] and [`OrchestratorConfig`].
//! - [`reactor`] — the single-threaded event loop, worker pool, and timer wheel.
//! - [`session`] — the RTSP ingest state machine, transport negotiation, and
//!   the per-connection reactor driver.
//! - [`monitor`] — the fan-out control plane and its reliable-UDP flows.
//! - [`protocol`] — RTSP request/response parsing and SDP summarization.
//! - [`media`] — RTP header parsing and the H.264 depacketizer.
//! - [`kcp`] — the reliable-UDP (KCP-style) ARQ endpoint.
//! - [`transport`] — address/socket primitives shared across the above.
//! - [`error`] — [`RelayError`] and [`Result`].

pub mod error;
pub mod kcp;
pub mod media;
pub mod monitor;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{RelayError, Result};
pub use server::{Orchestrator, OrchestratorConfig};
