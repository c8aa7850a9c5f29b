//! Top-level orchestration (§4.6): wires the RTSP ingest listener, the
//! worker reactor pool, and the Monitor Server together and drives
//! startup/shutdown.
//!
//! Grounded on `rtsp::server::Server`'s own `ServerConfig`/`start`/`stop`
//! shape (an `Arc<AtomicBool>` running flag, a builder-style config with
//! `Default`) generalized to the multi-reactor topology of
//! `examples/original_source/reactor/MultiThreadEventLoop.cc`'s
//! `start()`: bind the listener on the main loop, spin up `N` worker
//! loops, then block the main loop on the calling thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Token;
use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::monitor::MonitorServer;
use crate::reactor::pool::ReactorPool;
use crate::reactor::{IoHandle, Reactor};
use crate::session::connection::IngestConnection;
use crate::session::{PORT_FLOOR, PortAllocator, SessionRegistry, SessionState};
use crate::transport::Endpoint;

/// Orchestrator-level configuration (§4.6 "Startup"; CLI surface in §6).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the RTSP ingest listener (and, unless `monitor_ip`
    /// overrides it, the Monitor Server) binds to.
    pub bind_ip: String,
    pub rtsp_port: u16,
    /// Worker reactor count; each accepted ingest connection is pinned to
    /// one worker for its lifetime (§5 affinity rules).
    pub workers: usize,
    /// Overrides `bind_ip` for the Monitor Server's control listener, if set.
    pub monitor_ip: Option<String>,
    pub monitor_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            rtsp_port: 8554,
            workers: 4,
            monitor_ip: None,
            monitor_port: 9000,
        }
    }
}

/// Owns the RTSP ingest listener, the worker reactor pool, and the
/// Monitor Server. [`Orchestrator::run`] drives the main reactor on the
/// calling thread until [`Orchestrator::stop`] is called from elsewhere
/// (e.g. a `ctrlc` signal handler in `crates/cli`).
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    allocator: Arc<PortAllocator>,
    monitor: Arc<MonitorServer>,
    listener_token: Mutex<Option<Token>>,
    pool: Mutex<ReactorPool>,
    main_poll: Mutex<Option<mio::Poll>>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Binds the RTSP ingest listener and the Monitor Server, starts the
    /// worker pool, and registers the listener on the main reactor. Does
    /// not block — call [`Orchestrator::run`] to drive the main loop.
    ///
    /// The RTSP listener is bound synchronously here so a bind failure
    /// surfaces immediately as an `Err`; the Monitor Server's own bind
    /// follows its established async-bootstrap pattern
    /// ([`MonitorServer::start`]) and instead stops its reactor and logs
    /// on failure.
    pub fn start(config: OrchestratorConfig) -> Result<Arc<Self>> {
        let monitor_addr = Endpoint::new(
            config
                .monitor_ip
                .clone()
                .unwrap_or_else(|| config.bind_ip.clone()),
            config.monitor_port,
        );
        let monitor = MonitorServer::start(monitor_addr)?;

        let rtsp_addr = Endpoint::new(config.bind_ip.clone(), config.rtsp_port).to_socket_addr()?;
        let listener = mio::net::TcpListener::bind(rtsp_addr)?;

        let (mut pool, main_poll) = ReactorPool::new(config.workers.max(1))?;
        pool.start();
        let main = pool.main.clone();

        let orchestrator = Arc::new(Orchestrator {
            config,
            registry: SessionRegistry::new(),
            allocator: Arc::new(PortAllocator::new(PORT_FLOOR)),
            monitor,
            listener_token: Mutex::new(None),
            pool: Mutex::new(pool),
            main_poll: Mutex::new(Some(main_poll)),
            running: AtomicBool::new(true),
        });

        let orch = orchestrator.clone();
        main.run_in_loop(move |r| {
            let orch_for_cb = orch.clone();
            match r.add_read(IoHandle::TcpListener(listener), Box::new(move |r| orch_for_cb.on_acceptable(r))) {
                Ok(token) => *orch.listener_token.lock() = Some(token),
                Err(err) => {
                    tracing::error!(%err, "failed to register RTSP ingest listener");
                    r.stop();
                }
            }
        });

        tracing::info!(addr = %rtsp_addr, %monitor_addr, "orchestrator started");
        Ok(orchestrator)
    }

    /// Drives the main reactor on the calling thread until
    /// [`Orchestrator::stop`] wakes and stops it, then runs the rest of
    /// the shutdown sequence (session teardown, worker join, Monitor
    /// Server stop) before returning — so by the time this returns,
    /// shutdown is complete, not merely requested. Consumes the `Poll`
    /// created in [`Orchestrator::start`] — calling this twice on the
    /// same instance returns `Err(RelayError::AlreadyRunning)` rather
    /// than driving a second main loop.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let poll = self.main_poll.lock().take().ok_or(RelayError::AlreadyRunning)?;
        let main = self.pool.lock().main.clone();
        let result = main.run(poll);
        self.finish_shutdown();
        result.map_err(RelayError::Io)
    }

    fn on_acceptable(self: &Arc<Self>, r: &Reactor) {
        let Some(listener_token) = *self.listener_token.lock() else { return };
        loop {
            let accepted = r.with_source(listener_token, |h| match h {
                IoHandle::TcpListener(l) => l.accept(),
                _ => unreachable!("listener token always maps to a TcpListener"),
            });
            match accepted {
                Some(Ok((stream, peer))) => self.dispatch_to_worker(stream, peer),
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Some(Err(err)) => {
                    tracing::warn!(%err, "RTSP ingest accept failed");
                    break;
                }
                None => break,
            }
        }
    }

    /// Hands the accepted connection to the next worker by atomic
    /// round-robin, matching `getNextLoop`'s `fetch_add % size` and
    /// `onNewConnection`'s cross-thread `runInLoop` handoff.
    fn dispatch_to_worker(self: &Arc<Self>, stream: mio::net::TcpStream, peer: SocketAddr) {
        let worker = self.pool.lock().next_worker();
        let registry = self.registry.clone();
        let allocator = self.allocator.clone();
        let monitor = self.monitor.clone();
        let bind_ip = self.config.bind_ip.clone();
        let w = worker.clone();
        worker.run_in_loop(move |_r| {
            IngestConnection::spawn(w, stream, peer, bind_ip, registry, allocator, monitor);
        });
    }

    /// Requests shutdown: stops accepting by stopping the main reactor,
    /// which unblocks the [`Orchestrator::run`] call on whatever thread is
    /// driving it. Safe to call from any thread (e.g. a `ctrlc` handler)
    /// and more than once — a second call observes `running` already
    /// false and is a no-op. The rest of the shutdown sequence (session
    /// teardown, worker join, Monitor Server stop) runs synchronously
    /// inside [`Orchestrator::run`] after the main reactor stops, so
    /// shutdown is complete only once `run` returns, not as soon as this
    /// call returns.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("orchestrator shutdown requested");
        self.pool.lock().main.stop();
    }

    /// Tears every ingest session down the same way a client-initiated
    /// TEARDOWN does (withdraws its camera and releases every UDP media
    /// socket it owns), joins the worker pool, and stops the Monitor Server
    /// (§4.6 "Shutdown"). Control sockets aren't explicitly deregistered
    /// here — stopping and joining every worker reactor drops their
    /// `Entry`s (and the fds inside them) right after, same as the process
    /// exiting. Runs once, from [`Orchestrator::run`], after the main
    /// reactor has stopped.
    fn finish_shutdown(self: &Arc<Self>) {
        tracing::info!("orchestrator shutting down");
        for session in self.registry.snapshot() {
            self.monitor.remove_camera(session.session_id.clone());
            session.set_state(SessionState::Closing);
            session.release_sockets();
            self.registry.remove(&session.session_id);
        }

        self.pool.lock().stop_and_join();
        self.monitor.stop();
        tracing::info!("orchestrator shutdown complete");
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<MonitorServer> {
        &self.monitor
    }
}
