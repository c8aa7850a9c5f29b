//! Per-TCP-connection ingest driver (§4.2): reads RTSP requests (and, for
//! TCP-interleaved transport, RTP/RTCP frames sharing the same stream) off
//! one accepted control connection, drives the [`IngestSession`] state
//! machine, and forwards depacketized NAL units to the [`MonitorServer`].
//!
//! Grounded on `examples/original_source/media/RtspConnect.cc`'s
//! `handleRead`/`onMessage` dispatch loop, rebuilt as reactor callbacks
//! instead of a blocking per-connection thread — the same translation
//! [`crate::monitor::MonitorServer`] applies to its own client
//! connections — per §5's affinity rule pinning a session to the worker
//! reactor that accepted it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use parking_lot::Mutex;

use crate::error::Result;
use crate::media::NalUnit;
use crate::monitor::MonitorServer;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::reactor::{IoHandle, Reactor};
use crate::transport::io::write_partial;
use crate::transport::{Endpoint, interleave};

use super::transport::{Transport, TransportRequest};
use super::{IngestSession, PortAllocator, SessionRegistry, SessionState, derive_stream_name_from_uri};

/// How often the idle-reap timer re-checks a connection's last activity
/// (§5: "no control-channel activity for 60s is cancelled").
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

struct State {
    recv_buf: Vec<u8>,
    write_buf: Vec<u8>,
    rtp_token: Option<Token>,
}

/// One accepted RTSP ingest connection, pinned to the worker reactor that
/// accepted it for its whole lifetime.
pub struct IngestConnection {
    reactor: Arc<Reactor>,
    session: Arc<IngestSession>,
    control_token: Token,
    bind_ip: String,
    registry: SessionRegistry,
    allocator: Arc<PortAllocator>,
    monitor: Arc<MonitorServer>,
    state: Mutex<State>,
}

impl IngestConnection {
    /// Registers `stream` for read readiness on `reactor` (the worker that
    /// accepted this connection) and starts the idle-reap timer. Must be
    /// called on `reactor`'s own loop thread — the caller hands the
    /// accepted stream over via `Reactor::run_in_loop`, matching
    /// `MultiThreadEventLoop::onNewConnection`'s handoff.
    pub fn spawn(
        reactor: Arc<Reactor>,
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        bind_ip: String,
        registry: SessionRegistry,
        allocator: Arc<PortAllocator>,
        monitor: Arc<MonitorServer>,
    ) {
        let session = IngestSession::new(peer_addr);
        registry.insert(session.clone());

        // `add_read` only hands the token back after registering, but the
        // callback needs it from its very first invocation onward — stash
        // the connection itself in a cell, same as `MonitorServer::spawn_client`.
        let conn_cell: Arc<Mutex<Option<Arc<IngestConnection>>>> = Arc::new(Mutex::new(None));

        let cell = conn_cell.clone();
        let registered = reactor.add_read(
            IoHandle::TcpStream(stream),
            Box::new(move |r| {
                if let Some(conn) = cell.lock().clone() {
                    conn.on_readable(r);
                }
            }),
        );

        let control_token = match registered {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(%err, "failed to register ingest connection");
                registry.remove(&session.session_id);
                return;
            }
        };

        tracing::info!(session_id = %session.session_id, %peer_addr, "ingest session accepted");

        let conn = Arc::new(IngestConnection {
            reactor: reactor.clone(),
            session,
            control_token,
            bind_ip,
            registry,
            allocator,
            monitor,
            state: Mutex::new(State {
                recv_buf: Vec::new(),
                write_buf: Vec::new(),
                rtp_token: None,
            }),
        });
        *conn_cell.lock() = Some(conn.clone());

        let idle_conn = conn;
        reactor.add_periodic(IDLE_CHECK_INTERVAL, IDLE_CHECK_INTERVAL, move || idle_conn.check_idle());
    }

    fn check_idle(self: &Arc<Self>) {
        if self.session.state() == SessionState::Closing {
            return;
        }
        if self.session.idle_for() >= super::IDLE_TIMEOUT {
            tracing::warn!(session_id = %self.session.session_id, "ingest session idle timeout, tearing down");
            self.teardown();
            self.reactor.remove(self.control_token);
        }
    }

    fn on_readable(self: &Arc<Self>, r: &Reactor) {
        self.read_available(r);
        self.drain_buffer(r);
    }

    fn read_available(self: &Arc<Self>, r: &Reactor) {
        let mut buf = [0u8; 4096];
        loop {
            let read = r.with_source(self.control_token, |h| match h {
                IoHandle::TcpStream(s) => std::io::Read::read(s, &mut buf),
                _ => unreachable!("control token always maps to a TcpStream"),
            });
            match read {
                Some(Ok(0)) => {
                    tracing::info!(session_id = %self.session.session_id, "ingest control channel EOF");
                    self.teardown();
                    self.reactor.remove(self.control_token);
                    return;
                }
                Some(Ok(n)) => self.state.lock().recv_buf.extend_from_slice(&buf[..n]),
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(_)) | None => {
                    self.teardown();
                    self.reactor.remove(self.control_token);
                    return;
                }
            }
        }
    }

    /// Consumes as many complete requests (and, once TCP-interleaved
    /// transport is negotiated, interleaved RTP/RTCP frames) as are
    /// currently buffered.
    fn drain_buffer(self: &Arc<Self>, r: &Reactor) {
        loop {
            let snapshot = self.state.lock().recv_buf.clone();
            if snapshot.is_empty() {
                return;
            }

            if snapshot[0] == interleave::MAGIC {
                match interleave::try_parse(&snapshot) {
                    Some((frame, consumed)) => {
                        self.handle_interleaved_frame(frame.channel, frame.payload);
                        self.state.lock().recv_buf.drain(..consumed);
                        continue;
                    }
                    None => return, // incomplete frame, wait for more bytes
                }
            }

            match RtspRequest::try_parse(&snapshot) {
                Ok(Some((req, consumed))) => {
                    self.session.touch();
                    self.state.lock().recv_buf.drain(..consumed);
                    let resp = self.handle_request(&req);
                    self.queue_write(r, resp.serialize().into_bytes());
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(session_id = %self.session.session_id, %err, "malformed RTSP request, tearing down");
                    self.teardown();
                    self.reactor.remove(self.control_token);
                    return;
                }
            }
        }
    }

    fn handle_interleaved_frame(&self, channel: u8, payload: &[u8]) {
        let Some(Transport::TcpInterleaved { rtp_channel, .. }) = self.session.transport() else {
            return;
        };
        if channel != rtp_channel {
            return; // RTCP or an unrelated channel: not part of the media path
        }
        let nals = self.session.push_rtp(payload);
        self.forward_nals(nals);
    }

    fn forward_nals(&self, nals: Vec<NalUnit>) {
        if nals.is_empty() {
            return;
        }
        let stream_name = self.session.stream_name();
        for nal in nals {
            self.monitor.on_nal(stream_name.clone(), nal.data);
        }
    }

    // ---- RTSP method dispatch (§4.2) --------------------------------

    fn handle_request(self: &Arc<Self>, req: &RtspRequest) -> RtspResponse {
        let cseq = req.cseq().unwrap_or("0");
        match req.method.as_str() {
            "OPTIONS" => RtspResponse::ok().add_header("CSeq", cseq).add_header(
                "Public",
                "OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN",
            ),
            "ANNOUNCE" => self.handle_announce(cseq, req),
            "SETUP" => self.handle_setup(cseq, req),
            "RECORD" => self.handle_record(cseq, req),
            "TEARDOWN" => self.handle_teardown(cseq),
            other => {
                tracing::warn!(method = other, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_announce(&self, cseq: &str, req: &RtspRequest) -> RtspResponse {
        let sdp_text = String::from_utf8_lossy(&req.body).to_string();
        let summary = sdp::summarize(&sdp_text);
        if let Some(name) = derive_stream_name_from_uri(&req.uri) {
            self.session.set_stream_name(name);
        }
        self.session.set_sdp(sdp_text);
        tracing::info!(
            session_id = %self.session.session_id,
            stream = %self.session.stream_name(),
            session_name = ?summary.session_name,
            media_lines = summary.media_line_count,
            "ANNOUNCE received"
        );
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    fn handle_setup(self: &Arc<Self>, cseq: &str, req: &RtspRequest) -> RtspResponse {
        if matches!(self.session.state(), SessionState::Streaming | SessionState::Closing) {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(transport_header) = req.get_header("Transport") else {
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(parsed) = TransportRequest::parse(transport_header) else {
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let (transport, response_suffix) = match parsed {
            TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => match self.setup_udp(client_rtp_port, client_rtcp_port) {
                Ok((transport, server_rtp_port, server_rtcp_port)) => (
                    transport,
                    format!(
                        "RTP/AVP/UDP;unicast;client_port={client_rtp_port}-{client_rtcp_port};server_port={server_rtp_port}-{server_rtcp_port}"
                    ),
                ),
                Err(err) => {
                    tracing::error!(%err, "UDP port allocation failed for SETUP");
                    return RtspResponse::internal_error().add_header("CSeq", cseq);
                }
            },
            TransportRequest::Tcp {
                rtp_channel,
                rtcp_channel,
            } => {
                let rtp_channel = rtp_channel.unwrap_or(0);
                let rtcp_channel = rtcp_channel.unwrap_or(1);
                (
                    Transport::TcpInterleaved { rtp_channel, rtcp_channel },
                    format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
                )
            }
        };

        self.session.set_transport(transport);
        self.session.set_state(SessionState::Ready);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &response_suffix)
            .add_header("Session", &format!("{};timeout=60", self.session.session_id))
    }

    fn setup_udp(
        self: &Arc<Self>,
        client_rtp_port: u16,
        client_rtcp_port: u16,
    ) -> Result<(Transport, u16, u16)> {
        let (rtp_sock, rtcp_sock, rtp_port, rtcp_port) = self.allocator.allocate_udp_pair()?;

        let conn = self.clone();
        let rtp_token = self
            .reactor
            .add_read(IoHandle::Udp(rtp_sock), Box::new(move |r| conn.on_rtp_readable(r)))?;
        self.session.register_socket(self.reactor.clone(), rtp_token);
        self.state.lock().rtp_token = Some(rtp_token);

        let rtcp_token = self
            .reactor
            .add_read(IoHandle::Udp(rtcp_sock), Box::new(|_| {}))?;
        self.session.register_socket(self.reactor.clone(), rtcp_token);

        let transport = Transport::Udp {
            server_rtp: Endpoint::new(self.bind_ip.clone(), rtp_port),
            server_rtcp: Endpoint::new(self.bind_ip.clone(), rtcp_port),
            client_rtp: Endpoint::new(self.session.peer_addr.ip().to_string(), client_rtp_port),
            client_rtcp: Endpoint::new(self.session.peer_addr.ip().to_string(), client_rtcp_port),
        };
        Ok((transport, rtp_port, rtcp_port))
    }

    fn on_rtp_readable(self: &Arc<Self>, r: &Reactor) {
        let Some(token) = self.state.lock().rtp_token else { return };
        let mut buf = [0u8; 2048];
        loop {
            let received = r.with_source(token, |h| match h {
                IoHandle::Udp(sock) => sock.recv_from(&mut buf),
                _ => unreachable!("rtp token always maps to a Udp handle"),
            });
            match received {
                Some(Ok((n, _from))) => {
                    let nals = self.session.push_rtp(&buf[..n]);
                    self.forward_nals(nals);
                }
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(err)) => {
                    tracing::debug!(%err, "ingest RTP UDP read error");
                    break;
                }
                None => break,
            }
        }
    }

    fn handle_record(&self, cseq: &str, req: &RtspRequest) -> RtspResponse {
        if self.session.state() != SessionState::Ready {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        let session_matches = req
            .get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim() == self.session.session_id)
            .unwrap_or(false);
        if !session_matches {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }

        self.session.set_state(SessionState::Streaming);
        self.monitor
            .add_camera(self.session.session_id.clone(), self.session.stream_name());

        tracing::info!(
            session_id = %self.session.session_id,
            stream = %self.session.stream_name(),
            "RECORD: session streaming, camera published"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &format!("{};timeout=60", self.session.session_id))
    }

    /// Unlike the EOF/malformed-request/idle-timeout paths, this deliberately
    /// leaves the control socket registered: the "200 OK" below still needs
    /// to flush over it, and a redundant TEARDOWN on the same connection must
    /// still get a reply (454) rather than finding the connection gone.
    fn handle_teardown(self: &Arc<Self>, cseq: &str) -> RtspResponse {
        if self.session.state() == SessionState::Closing {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        self.teardown();
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// Idempotent teardown: withdraws the camera, releases every UDP media
    /// socket the session owns, and removes the session from the registry.
    /// Does not touch the control socket itself — that's `IngestConnection`'s
    /// own fd, not the session's, and callers decide separately whether to
    /// deregister it (see [`handle_teardown`](Self::handle_teardown) vs. the
    /// EOF/malformed-request/idle-timeout paths). Safe to call more than once
    /// (from TEARDOWN, control-EOF, or the idle-reap timer) — every caller
    /// checks state first, but this double-checks so a race between them can
    /// never double-teardown.
    fn teardown(self: &Arc<Self>) {
        if self.session.state() == SessionState::Closing {
            return;
        }
        self.session.set_state(SessionState::Closing);
        self.monitor.remove_camera(self.session.session_id.clone());
        self.session.release_sockets();
        self.registry.remove(&self.session.session_id);
    }

    fn queue_write(self: &Arc<Self>, r: &Reactor, bytes: Vec<u8>) {
        self.state.lock().write_buf.extend_from_slice(&bytes);
        self.flush(r);
    }

    fn flush(self: &Arc<Self>, r: &Reactor) {
        let pending = std::mem::take(&mut self.state.lock().write_buf);
        if pending.is_empty() {
            return;
        }
        let written = r
            .with_source(self.control_token, |h| match h {
                IoHandle::TcpStream(s) => write_partial(s, &pending),
                _ => Ok(0),
            })
            .unwrap_or(Ok(0))
            .unwrap_or(0);

        if written < pending.len() {
            self.state.lock().write_buf = pending[written..].to_vec();
            let conn = self.clone();
            let _ = r.add_write(self.control_token, Box::new(move |r| conn.flush(r)));
        } else {
            let _ = r.clear_writable(self.control_token);
        }
    }
}
