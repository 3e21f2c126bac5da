//! Per-endpoint listener supervision.
//!
//! One [`Listener`] task per configured mapping. It owns the listen socket
//! and the active-session list, dispatches accepted connections round-robin
//! over the worker pool, and supervises two auxiliary loops: the reaper,
//! which prunes finished sessions, and the retry scanner, which re-dispatches
//! clients whose worker could not be reached.

use crate::config::{Mapping, Worker};
use crate::session::{self, SessionHandle};
use crate::Shutdown;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Cadence of the reaper's pruning passes.
const REAP_INTERVAL: Duration = Duration::from_millis(1500);

/// Retry-scanner pacing: scan fast while failures are recent, back off once
/// this many consecutive cycles found nothing.
const RETRY_SCAN_FAST: Duration = Duration::from_millis(100);
const RETRY_SCAN_SLOW: Duration = Duration::from_secs(2);
const RETRY_FAST_CYCLES: u32 = 5;

/// How long sessions get to drain on shutdown before being aborted, and the
/// join bound for the auxiliary loops.
const SESSION_DRAIN: Duration = Duration::from_secs(3);
const AUX_JOIN: Duration = Duration::from_secs(2);

/// Sessions currently owned by a listener. Pushed to by the accept and
/// retry paths, pruned by the reaper; never touched from outside the
/// listener's own tasks.
type ActiveSessions = Arc<Mutex<Vec<SessionHandle>>>;

/// Listener state for one local endpoint.
pub(crate) struct Listener {
    mapping: Mapping,
    buffer_size: usize,
    active: ActiveSessions,
    /// Cancels this listener's sessions and auxiliary loops.
    notify_sessions: broadcast::Sender<()>,
    /// Every session holds a clone; the channel closing is the drain signal.
    session_drained_tx: mpsc::Sender<()>,
    session_drained_rx: mpsc::Receiver<()>,
    /// Cancellation from the top supervisor.
    shutdown: Shutdown,
    /// Held until this listener is fully stopped; the top supervisor waits
    /// on the paired receiver.
    top_drained: mpsc::Sender<()>,
}

impl Listener {
    pub(crate) fn new(
        mapping: Mapping,
        buffer_size: usize,
        shutdown: Shutdown,
        top_drained: mpsc::Sender<()>,
    ) -> Listener {
        let (notify_sessions, _) = broadcast::channel(1);
        let (session_drained_tx, session_drained_rx) = mpsc::channel(1);
        Listener {
            mapping,
            buffer_size,
            active: Arc::new(Mutex::new(Vec::new())),
            notify_sessions,
            session_drained_tx,
            session_drained_rx,
            shutdown,
            top_drained,
        }
    }

    /// Bind, accept and dispatch until cancelled, then drain.
    pub(crate) async fn run(mut self) {
        let Some(listener) = self.bind_with_retry().await else {
            return;
        };
        info!(
            "listening on {} ({} workers)",
            self.mapping.local,
            self.mapping.workers.len()
        );

        let reaper = tokio::spawn(reap_finished(
            Arc::clone(&self.active),
            Shutdown::new(self.notify_sessions.subscribe()),
        ));
        let scanner = tokio::spawn(retry_failed(
            Arc::clone(&self.active),
            self.mapping.workers.clone(),
            self.buffer_size,
            self.notify_sessions.clone(),
            self.session_drained_tx.clone(),
            Shutdown::new(self.notify_sessions.subscribe()),
        ));

        self.accept_loop(&listener).await;

        // Stop accepting before draining sessions.
        drop(listener);
        self.drain_sessions(reaper, scanner).await;
    }

    /// Bind failures are retried indefinitely; only cancellation gives up.
    async fn bind_with_retry(&mut self) -> Option<TcpListener> {
        loop {
            match bind(self.mapping.local) {
                Ok(listener) => return Some(listener),
                Err(err) => {
                    error!(
                        "failed to bind to {}: {err}, retrying in {}s",
                        self.mapping.local,
                        BIND_RETRY_DELAY.as_secs()
                    );
                    tokio::select! {
                        _ = time::sleep(BIND_RETRY_DELAY) => {}
                        _ = self.shutdown.recv() => return None,
                    }
                }
            }
        }
    }

    /// Accept connections and dispatch each to the next worker in
    /// declaration order, wrapping at the end of the pool. Accept errors get
    /// a bounded backoff and the loop continues.
    async fn accept_loop(&mut self, listener: &TcpListener) {
        let mut next = 0usize;
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                res = listener.accept() => match res {
                    Ok((client, client_addr)) => {
                        let worker =
                            self.mapping.workers[next % self.mapping.workers.len()].clone();
                        next = next.wrapping_add(1);
                        debug!(
                            "accepted {client_addr} on {}, dispatching to {worker}",
                            self.mapping.local
                        );
                        let handle = session::spawn(
                            client,
                            client_addr,
                            worker,
                            self.buffer_size,
                            &self.notify_sessions,
                            &self.session_drained_tx,
                        );
                        self.active.lock().unwrap().push(handle);
                    }
                    Err(err) => {
                        error!("accept failed on {}: {err}", self.mapping.local);
                        tokio::select! {
                            _ = time::sleep(ACCEPT_RETRY_DELAY) => {}
                            _ = self.shutdown.recv() => break,
                        }
                    }
                }
            }
        }
    }

    /// Cancel everything this listener spawned, wait out the graceful
    /// window, abort survivors, then join the auxiliary loops.
    async fn drain_sessions(self, reaper: JoinHandle<()>, scanner: JoinHandle<()>) {
        let Listener {
            mapping,
            active,
            notify_sessions,
            session_drained_tx,
            mut session_drained_rx,
            top_drained,
            ..
        } = self;

        info!(
            "shutting down {} ({} active sessions)",
            mapping.local,
            active.lock().unwrap().len()
        );

        // Wake every current subscriber, then drop the channel. The scanner
        // exits on the notification and drops its own sender clone, at which
        // point any session it spawned after the send still observes the
        // channel closing.
        let _ = notify_sessions.send(());
        drop(notify_sessions);
        drop(session_drained_tx);

        if timeout(SESSION_DRAIN, session_drained_rx.recv()).await.is_err() {
            let active = active.lock().unwrap();
            let survivors = active.iter().filter(|s| !s.is_finished()).count();
            if survivors > 0 {
                warn!("forcibly terminating {survivors} sessions on {}", mapping.local);
            }
            for session in active.iter() {
                session.abort();
            }
        }

        let _ = timeout(AUX_JOIN, reaper).await;
        let _ = timeout(AUX_JOIN, scanner).await;
        debug!("listener {} stopped", mapping.local);
        drop(top_drained);
    }
}

/// A listen socket with address reuse, per the usual restart-friendly setup.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Prune sessions whose task has finished. The non-blocking probe keeps the
/// pass cheap; sockets are never touched here.
async fn reap_finished(active: ActiveSessions, mut shutdown: Shutdown) {
    while !shutdown.is_shutdown() {
        tokio::select! {
            _ = time::sleep(REAP_INTERVAL) => {}
            _ = shutdown.recv() => break,
        }

        let mut active = active.lock().unwrap();
        let before = active.len();
        active.retain(|session| !session.is_finished());
        let reaped = before - active.len();
        if reaped > 0 {
            debug!("reaped {reaped} finished sessions");
        }
    }
}

/// Watch for sessions that could not reach their worker and re-dispatch
/// their clients to an alternate.
///
/// Pacing adapts: cycles run every 100 ms while failures are being handled
/// (a cluster of failures usually means a worker is down and more are
/// coming), backing off to 2 s once things have been quiet for a few cycles.
async fn retry_failed(
    active: ActiveSessions,
    workers: Vec<Worker>,
    buffer_size: usize,
    notify_sessions: broadcast::Sender<()>,
    session_drained: mpsc::Sender<()>,
    mut shutdown: Shutdown,
) {
    let mut successful_runs: u32 = 0;
    while !shutdown.is_shutdown() {
        let retried = scan_once(
            &active,
            &workers,
            buffer_size,
            &notify_sessions,
            &session_drained,
        );
        if retried > 0 {
            successful_runs = 0;
        } else {
            successful_runs = successful_runs.saturating_add(1);
        }

        let pause = if successful_runs <= RETRY_FAST_CYCLES {
            RETRY_SCAN_FAST
        } else {
            RETRY_SCAN_SLOW
        };
        tokio::select! {
            _ = time::sleep(pause) => {}
            _ = shutdown.recv() => break,
        }
    }
}

/// One scanner pass. Each failed session is retried at most once per pass:
/// its parked client is taken, its flag cleared, and a replacement session
/// started on an alternate worker.
fn scan_once(
    active: &ActiveSessions,
    workers: &[Worker],
    buffer_size: usize,
    notify_sessions: &broadcast::Sender<()>,
    session_drained: &mpsc::Sender<()>,
) -> usize {
    let mut active = active.lock().unwrap();
    let mut replacements = Vec::new();

    for session in active.iter() {
        if !session.connect_failed() {
            continue;
        }
        let Some(client) = session.take_parked_client() else {
            continue;
        };
        let next_worker = pick_alternate(workers, &session.worker);
        info!(
            "retrying request from {} from {} on {next_worker}",
            session.client_addr, session.worker
        );
        session.clear_connect_failed();
        replacements.push(session::spawn(
            client,
            session.client_addr,
            next_worker,
            buffer_size,
            notify_sessions,
            session_drained,
        ));
    }

    let count = replacements.len();
    active.extend(replacements);
    count
}

/// Uniformly random worker that is not the failed one. A single-entry pool
/// (or one made entirely of duplicates of the failed worker) reuses it.
fn pick_alternate(workers: &[Worker], failed: &Worker) -> Worker {
    if workers.len() <= 1 || workers.iter().all(|w| w == failed) {
        return failed.clone();
    }
    let mut rng = rand::thread_rng();
    loop {
        let candidate = &workers[rng.gen_range(0..workers.len())];
        if candidate != failed {
            return candidate.clone();
        }
    }
}
