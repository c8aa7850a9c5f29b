//! Main reactor + worker pool, assigning new connections to workers by
//! atomic round-robin.
//!
//! Grounded on `examples/original_source/reactor/MultiThreadEventLoop.cc`:
//! one main loop owning only the listener, `N` worker loops each run on a
//! dedicated OS thread, `getNextLoop()`'s `fetch_add % size` round robin,
//! and `onNewConnection` handing the new connection to the chosen worker via
//! `runInLoop` so construction/registration happens on the worker's own
//! thread.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use mio::Poll;

use super::Reactor;

/// Owns the main reactor (listener-only) and a fixed-size pool of worker
/// reactors, each on its own thread.
pub struct ReactorPool {
    pub main: Arc<Reactor>,
    workers: Vec<Arc<Reactor>>,
    worker_polls: Vec<Option<Poll>>,
    next_worker: AtomicUsize,
    handles: Vec<JoinHandle<()>>,
}

impl ReactorPool {
    /// Build the main reactor plus `worker_count` worker reactors. Nothing
    /// is running yet — call [`ReactorPool::start`] to spawn the worker
    /// threads, then drive `main` on the calling thread with the returned
    /// `Poll` (the caller owns it since the main loop is driven inline, not
    /// on a spawned thread — see `Orchestrator::run`).
    pub fn new(worker_count: usize) -> io::Result<(Self, Poll)> {
        assert!(worker_count > 0, "worker pool needs at least one worker");

        let (main, main_poll) = Reactor::new("main")?;

        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_polls = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let (reactor, poll) = Reactor::new(format!("worker-{idx}"))?;
            workers.push(reactor);
            worker_polls.push(Some(poll));
        }

        let pool = Self {
            main,
            workers,
            worker_polls,
            next_worker: AtomicUsize::new(0),
            handles: Vec::new(),
        };
        Ok((pool, main_poll))
    }

    /// Spawn one OS thread per worker, each running that worker's loop.
    pub fn start(&mut self) {
        for (idx, worker) in self.workers.iter().enumerate() {
            let poll = self.worker_polls[idx]
                .take()
                .expect("worker poll already taken");
            let worker = worker.clone();
            let name = worker.name().to_string();
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    if let Err(err) = worker.run(poll) {
                        tracing::error!(worker = %name, %err, "worker reactor exited with error");
                    }
                })
                .expect("failed to spawn worker thread");
            self.handles.push(handle);
        }
        tracing::info!(workers = self.workers.len(), "worker pool started");
    }

    /// Atomic round-robin selection, matching `getNextLoop`'s
    /// `fetch_add(1) % size`.
    pub fn next_worker(&self) -> Arc<Reactor> {
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].clone()
    }

    pub fn workers(&self) -> &[Arc<Reactor>] {
        &self.workers
    }

    /// Stop every worker loop and join its thread. Idempotent: calling this
    /// twice is harmless since `Reactor::stop` just flips an already-false
    /// flag and re-wakes an already-stopped loop.
    pub fn stop_and_join(&mut self) {
        for worker in &self.workers {
            worker.stop();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("worker pool stopped");
    }
}
