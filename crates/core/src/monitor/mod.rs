//! The Monitor Server (§4.5): the fan-out control plane. Maintains the
//! camera registry and the set of connected monitor clients, speaks the
//! control line protocol ([`control`]) over TCP, and owns one
//! reliable-UDP [`kcp::Endpoint`] per (client, camera) pair sharing a
//! single UDP socket.
//!
//! Grounded on `examples/original_source/media/MonitorServer.{h,cc}`:
//! `QtClient`/`udpSession` become [`ClientState`]/[`ReliableFlow`], and
//! the process-global `static MonitorServer*` singleton becomes an
//! explicitly constructed `Arc<MonitorServer>` per the design notes'
//! singleton-remapping guidance. Runs on its own dedicated
//! [`Reactor`] thread; per §5's affinity rule, every `ReliableFlow` is
//! pinned to that thread and ticked by a single 10 ms periodic timer
//! (the Open Question's "single-reactor-timer" resolution — see
//! `DESIGN.md` — rather than the original's divergent per-flow update
//! thread).

pub mod control;

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::Token;
use parking_lot::Mutex;

use crate::error::Result;
use crate::kcp;
use crate::reactor::{IoHandle, Reactor};
use crate::transport::Endpoint;

use control::{ControlRequest, ControlResponse};

const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// One (monitor client × camera) reliable-UDP flow.
pub struct ReliableFlow {
    pub conv: u32,
    pub remote: Endpoint,
    arq: kcp::Endpoint,
}

struct ClientState {
    peer_ip: String,
    /// The `<ip:port>` the client announced itself as in `SETUP`.
    control_addr: String,
    cseq: u32,
    recv_buf: Vec<u8>,
    write_buf: Vec<u8>,
    flows: HashMap<String, ReliableFlow>,
    /// Cameras this client has been told about (via the SETUP listing or
    /// a subsequent ADDCAM) but has not yet bound with a MESSAGE.
    pending_addcam: HashSet<String>,
}

impl ClientState {
    fn new(peer_ip: String) -> Self {
        Self {
            peer_ip,
            control_addr: String::new(),
            cseq: 0,
            recv_buf: Vec::new(),
            write_buf: Vec::new(),
            flows: HashMap::new(),
            pending_addcam: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// `stream_name -> session_id`, the authoritative "active cameras"
    /// registry (§3).
    cameras: HashMap<String, String>,
    clients: HashMap<Token, ClientState>,
    /// `conv -> (client token, stream_name)`, for demuxing inbound
    /// datagrams on the shared reliable-UDP socket.
    conv_index: HashMap<u32, (Token, String)>,
}

pub struct MonitorServer {
    reactor: Arc<Reactor>,
    bind_addr: Endpoint,
    listener_token: Mutex<Option<Token>>,
    udp_token: Mutex<Option<Token>>,
    inner: Mutex<Inner>,
    start: Instant,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorServer {
    /// Binds the control-line TCP listener and the shared reliable-UDP
    /// socket on `bind_addr`, starts the 10 ms tick, and spawns the
    /// dedicated reactor thread.
    pub fn start(bind_addr: Endpoint) -> Result<Arc<Self>> {
        let (reactor, poll) = Reactor::new("monitor")?;
        let server = Arc::new(MonitorServer {
            reactor: reactor.clone(),
            bind_addr,
            listener_token: Mutex::new(None),
            udp_token: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
            start: Instant::now(),
            join: Mutex::new(None),
        });

        let srv = server.clone();
        reactor.run_in_loop(move |r| {
            if let Err(err) = srv.bootstrap(r) {
                tracing::error!(%err, "monitor server failed to bind, stopping");
                r.stop();
            }
        });

        let handle = std::thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || {
                if let Err(err) = reactor.run(poll) {
                    tracing::error!(%err, "monitor reactor exited with error");
                }
            })
            .map_err(crate::error::RelayError::Io)?;
        *server.join.lock() = Some(handle);

        Ok(server)
    }

    fn bootstrap(self: &Arc<Self>, r: &Reactor) -> Result<()> {
        let addr = self.bind_addr.to_socket_addr()?;

        let listener = mio::net::TcpListener::bind(addr)?;
        let srv = self.clone();
        let listener_token = r.add_read(
            IoHandle::TcpListener(listener),
            Box::new(move |r| srv.on_acceptable(r)),
        )?;
        *self.listener_token.lock() = Some(listener_token);

        let udp = mio::net::UdpSocket::bind(addr)?;
        let srv = self.clone();
        let udp_token = r.add_read(IoHandle::Udp(udp), Box::new(move |r| srv.on_udp_readable(r)))?;
        *self.udp_token.lock() = Some(udp_token);

        let srv = self.clone();
        r.add_periodic(TICK_INTERVAL, TICK_INTERVAL, move || srv.tick());

        tracing::info!(addr = %self.bind_addr, "monitor server listening");
        Ok(())
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn tick(self: &Arc<Self>) {
        let now = self.now_ms();
        let mut dead: Vec<(Token, String)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (token, client) in inner.clients.iter_mut() {
                for (name, flow) in client.flows.iter_mut() {
                    flow.arq.update(now);
                    if flow.arq.is_dead_peer(now) {
                        dead.push((*token, name.clone()));
                    }
                }
            }
        }
        for (token, name) in dead {
            tracing::warn!(%name, "reliable-UDP peer silent past dead-peer threshold, tearing down flow");
            let mut inner = self.inner.lock();
            if let Some(client) = inner.clients.get_mut(&token) {
                client.flows.remove(&name);
            }
            inner.conv_index.retain(|_, (t, n)| !(*t == token && n == &name));
        }
    }

    // ---- TCP control connections -----------------------------------

    fn on_acceptable(self: &Arc<Self>, r: &Reactor) {
        let Some(listener_token) = *self.listener_token.lock() else { return };
        loop {
            let accepted = r.with_source(listener_token, |h| match h {
                IoHandle::TcpListener(l) => l.accept(),
                _ => unreachable!("listener token always maps to a TcpListener"),
            });
            match accepted {
                Some(Ok((stream, peer))) => self.spawn_client(r, stream, peer),
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(err)) => {
                    tracing::warn!(%err, "monitor accept failed");
                    break;
                }
                None => break,
            }
        }
    }

    fn spawn_client(self: &Arc<Self>, r: &Reactor, stream: mio::net::TcpStream, peer: SocketAddr) {
        // The callback needs its own token, but `add_read` only hands the
        // token back after registering — stash it in a cell the callback
        // reads from its first invocation onward (no event can fire
        // before `add_read` returns on this same thread).
        let token_cell: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));
        let srv = self.clone();
        let cell = token_cell.clone();
        let registered = r.add_read(
            IoHandle::TcpStream(stream),
            Box::new(move |r| {
                if let Some(token) = *cell.lock() {
                    srv.on_client_readable(r, token);
                }
            }),
        );
        match registered {
            Ok(token) => {
                *token_cell.lock() = Some(token);
                self.inner
                    .lock()
                    .clients
                    .insert(token, ClientState::new(peer.ip().to_string()));
                tracing::info!(%peer, "monitor client connected");
            }
            Err(err) => tracing::warn!(%err, "failed to register monitor client"),
        }
    }

    fn on_client_readable(self: &Arc<Self>, r: &Reactor, token: Token) {
        let mut buf = [0u8; 4096];
        loop {
            let read = r.with_source(token, |h| match h {
                IoHandle::TcpStream(s) => s.read(&mut buf),
                _ => unreachable!("client token always maps to a TcpStream"),
            });
            match read {
                Some(Ok(0)) => {
                    self.disconnect_client(token);
                    return;
                }
                Some(Ok(n)) => {
                    if let Some(c) = self.inner.lock().clients.get_mut(&token) {
                        c.recv_buf.extend_from_slice(&buf[..n]);
                    }
                }
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(_)) | None => {
                    self.disconnect_client(token);
                    return;
                }
            }
        }
        self.drain_requests(r, token);
    }

    fn drain_requests(self: &Arc<Self>, r: &Reactor, token: Token) {
        loop {
            let snapshot = match self.inner.lock().clients.get(&token) {
                Some(c) => c.recv_buf.clone(),
                None => return,
            };
            match ControlRequest::try_parse(&snapshot) {
                Ok(Some((req, consumed))) => {
                    if let Some(c) = self.inner.lock().clients.get_mut(&token) {
                        c.recv_buf.drain(..consumed);
                    }
                    self.handle_request(r, token, &req);
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(%err, "malformed monitor control message, disconnecting client");
                    self.disconnect_client(token);
                    return;
                }
            }
        }
    }

    fn handle_request(self: &Arc<Self>, r: &Reactor, token: Token, req: &ControlRequest) {
        match req.method.as_str() {
            "SETUP" => self.handle_setup(r, token, req),
            "MESSAGE" => self.handle_message(r, token, req),
            other => {
                tracing::warn!(method = other, "unexpected monitor request, ignoring");
            }
        }
    }

    fn handle_setup(self: &Arc<Self>, r: &Reactor, token: Token, req: &ControlRequest) {
        let cseq = req.cseq().unwrap_or(0);
        let cameras: Vec<String> = {
            let mut inner = self.inner.lock();
            let cameras: Vec<String> = inner.cameras.keys().cloned().collect();
            if let Some(c) = inner.clients.get_mut(&token) {
                c.control_addr = req.arg.clone();
                c.cseq = cseq;
                for name in &cameras {
                    c.pending_addcam.insert(name.clone());
                }
            }
            cameras
        };

        let mut resp = ControlResponse::ok()
            .add_header("Cseq", &cseq.to_string())
            .add_header("CamNum", &cameras.len().to_string());
        for (idx, name) in cameras.iter().enumerate() {
            resp = resp.add_header(&idx.to_string(), name);
        }
        self.queue_write(r, token, resp.serialize().into_bytes());
    }

    fn handle_message(self: &Arc<Self>, r: &Reactor, token: Token, req: &ControlRequest) {
        let bindings = control::parse_message_body(&req.body);
        let Some(udp_token) = *self.udp_token.lock() else { return };

        let peer_ip = match self.inner.lock().clients.get(&token) {
            Some(c) => c.peer_ip.clone(),
            None => return,
        };

        let mut inner = self.inner.lock();
        let Inner { clients, conv_index, .. } = &mut *inner;
        let Some(client) = clients.get_mut(&token) else { return };

        for binding in &bindings {
            client.pending_addcam.remove(&binding.stream_name);
            let remote = Endpoint::new(peer_ip.clone(), binding.rtp_port);
            let remote_addr = match remote.to_socket_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!(%err, endpoint = %remote, "bad client endpoint in MESSAGE body");
                    continue;
                }
            };

            let reactor = self.reactor.clone();
            let output = move |buf: &[u8]| -> std::io::Result<()> {
                reactor
                    .with_source(udp_token, |h| match h {
                        IoHandle::Udp(sock) => sock.send_to(buf, remote_addr).map(|_| ()),
                        _ => Ok(()),
                    })
                    .unwrap_or(Ok(()))
            };

            client.flows.insert(
                binding.stream_name.clone(),
                ReliableFlow {
                    conv: binding.conv,
                    remote: remote.clone(),
                    arq: kcp::Endpoint::new(binding.conv, output),
                },
            );
            conv_index.insert(binding.conv, (token, binding.stream_name.clone()));
            tracing::info!(stream = %binding.stream_name, conv = binding.conv, remote = %remote, "reliable-UDP flow established");
        }
        drop(inner);

        let cseq = req.cseq().unwrap_or(0);
        let resp = ControlResponse::ok().add_header("Cseq", &cseq.to_string());
        self.queue_write(r, token, resp.serialize().into_bytes());
    }

    fn disconnect_client(self: &Arc<Self>, token: Token) {
        let removed = self.inner.lock().clients.remove(&token);
        if let Some(client) = removed {
            tracing::info!(peer = %client.peer_ip, "monitor client disconnected");
        }
        self.inner.lock().conv_index.retain(|_, (t, _)| *t != token);
        self.reactor.run_in_loop(move |r| r.remove(token));
    }

    fn queue_write(self: &Arc<Self>, r: &Reactor, token: Token, bytes: Vec<u8>) {
        if let Some(c) = self.inner.lock().clients.get_mut(&token) {
            c.write_buf.extend_from_slice(&bytes);
        }
        self.flush_client(r, token);
    }

    fn flush_client(self: &Arc<Self>, r: &Reactor, token: Token) {
        let pending = match self.inner.lock().clients.get_mut(&token) {
            Some(c) => std::mem::take(&mut c.write_buf),
            None => return,
        };
        if pending.is_empty() {
            return;
        }
        let written = r
            .with_source(token, |h| match h {
                IoHandle::TcpStream(s) => crate::transport::io::write_partial(s, &pending),
                _ => Ok(0),
            })
            .unwrap_or(Ok(0))
            .unwrap_or(0);

        if written < pending.len() {
            if let Some(c) = self.inner.lock().clients.get_mut(&token) {
                c.write_buf = pending[written..].to_vec();
            }
            let srv = self.clone();
            let _ = r.add_write(token, Box::new(move |r| srv.flush_client(r, token)));
        } else {
            let _ = r.clear_writable(token);
        }
    }

    // ---- shared reliable-UDP socket ---------------------------------

    fn on_udp_readable(self: &Arc<Self>, r: &Reactor) {
        let Some(udp_token) = *self.udp_token.lock() else { return };
        let mut buf = [0u8; 2048];
        loop {
            let received = r.with_source(udp_token, |h| match h {
                IoHandle::Udp(sock) => sock.recv_from(&mut buf),
                _ => unreachable!("udp token always maps to a Udp handle"),
            });
            match received {
                Some(Ok((n, _from))) => self.route_datagram(&buf[..n]),
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(err)) => {
                    tracing::debug!(%err, "monitor UDP read error");
                    break;
                }
                None => break,
            }
        }
    }

    fn route_datagram(&self, datagram: &[u8]) {
        let Some(conv) = kcp::segment::peek_conv(datagram) else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some((token, stream_name)) = inner.conv_index.get(&conv).cloned() else {
            tracing::debug!(conv, "reliable-UDP datagram for unknown flow, dropped");
            return;
        };
        if let Some(client) = inner.clients.get_mut(&token) {
            if let Some(flow) = client.flows.get_mut(&stream_name) {
                flow.arq.input(datagram);
            }
        }
    }

    // ---- camera lifecycle (§4.5) -------------------------------------

    /// Registers `stream_name` as active and emits `ADDCAM` to every
    /// connected client that doesn't already have a flow for it.
    pub fn add_camera(self: &Arc<Self>, session_id: String, stream_name: String) {
        let srv = self.clone();
        self.reactor.run_in_loop(move |r| {
            {
                let mut inner = srv.inner.lock();
                inner.cameras.insert(stream_name.clone(), session_id.clone());
            }

            let targets: Vec<Token> = {
                let inner = srv.inner.lock();
                inner
                    .clients
                    .iter()
                    .filter(|(_, c)| !c.flows.contains_key(&stream_name))
                    .map(|(token, _)| *token)
                    .collect()
            };
            for token in targets {
                let cseq = {
                    let mut inner = srv.inner.lock();
                    let Some(c) = inner.clients.get_mut(&token) else { continue };
                    c.cseq += 1;
                    c.pending_addcam.insert(stream_name.clone());
                    c.cseq
                };
                let msg = control::build_push_request("ADDCAM", &srv.bind_addr.to_string(), cseq, &stream_name);
                srv.queue_write(r, token, msg.into_bytes());
            }
            tracing::info!(stream = %stream_name, "camera registered");
        });
    }

    /// Removes `session_id`'s camera(s) from the registry and emits
    /// `DELCAM` to every client holding a flow for them, tearing the
    /// flow down afterward.
    pub fn remove_camera(self: &Arc<Self>, session_id: String) {
        let srv = self.clone();
        self.reactor.run_in_loop(move |r| {
            let removed_names: Vec<String> = {
                let mut inner = srv.inner.lock();
                let names: Vec<String> = inner
                    .cameras
                    .iter()
                    .filter(|(_, sid)| **sid == session_id)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in &names {
                    inner.cameras.remove(name);
                }
                names
            };

            for name in removed_names {
                let targets: Vec<Token> = {
                    let inner = srv.inner.lock();
                    inner
                        .clients
                        .iter()
                        .filter(|(_, c)| c.flows.contains_key(&name) || c.pending_addcam.contains(&name))
                        .map(|(token, _)| *token)
                        .collect()
                };
                for token in targets {
                    let cseq = {
                        let mut inner = srv.inner.lock();
                        let Some(c) = inner.clients.get_mut(&token) else { continue };
                        c.cseq += 1;
                        c.pending_addcam.remove(&name);
                        c.flows.remove(&name);
                        c.cseq
                    };
                    srv.inner.lock().conv_index.retain(|_, (t, n)| !(*t == token && n == &name));
                    let msg = control::build_push_request("DELCAM", &srv.bind_addr.to_string(), cseq, &name);
                    srv.queue_write(r, token, msg.into_bytes());
                }
                tracing::info!(stream = %name, "camera withdrawn");
            }
        });
    }

    /// Pushes one reassembled NAL unit to every monitor client holding a
    /// flow for `stream_name` (§4.5 "Fan-out").
    pub fn on_nal(self: &Arc<Self>, stream_name: String, bytes: Vec<u8>) {
        let srv = self.clone();
        self.reactor.run_in_loop(move |_| {
            let mut inner = srv.inner.lock();
            for client in inner.clients.values_mut() {
                if let Some(flow) = client.flows.get_mut(&stream_name) {
                    flow.arq.send(&bytes);
                }
            }
        });
    }

    /// Stops the reactor loop and joins its thread. Idempotent.
    pub fn stop(&self) {
        self.reactor.stop();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_starts_with_no_flows_or_pending_cameras() {
        let client = ClientState::new("127.0.0.1".to_string());
        assert!(client.flows.is_empty());
        assert!(client.pending_addcam.is_empty());
    }
}
