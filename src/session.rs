//! Per-connection session: one accepted client relayed to one worker.
//!
//! A session owns both sockets for its lifetime. The only state it shares
//! with its listener is the [`SessionHandle`]: a connect-failure flag and a
//! parking slot through which the client socket is handed back so the retry
//! scanner can re-dispatch it to another worker.

use crate::config::Worker;
use crate::Shutdown;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

/// How long a session that failed to connect stays alive after parking its
/// client socket. The retry scanner must observe the failure flag within
/// this window, before the reaper prunes the finished task.
const CONNECT_FAIL_LINGER: Duration = Duration::from_secs(6);

/// The listener-side view of a running session.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub(crate) client_addr: SocketAddr,
    pub(crate) worker: Worker,
    /// Set exactly once by the session when the worker dial fails; cleared
    /// exactly once by the retry scanner when it takes the client back.
    failed_to_connect: Arc<AtomicBool>,
    /// Where the session parks the client socket on a failed dial.
    parked_client: Arc<Mutex<Option<TcpStream>>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Non-blocking liveness probe, used by the reaper.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn connect_failed(&self) -> bool {
        self.failed_to_connect.load(Ordering::Acquire)
    }

    /// Take the parked client socket back. The session parks the socket
    /// before raising the failure flag, so after observing the flag this
    /// returns `Some` until someone takes it.
    pub(crate) fn take_parked_client(&self) -> Option<TcpStream> {
        self.parked_client.lock().unwrap().take()
    }

    pub(crate) fn clear_connect_failed(&self) {
        self.failed_to_connect.store(false, Ordering::Release);
    }

    /// Forcibly terminate the session task. Dropping the task closes both
    /// of its sockets.
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Start a session for an accepted client on its assigned worker.
///
/// The session subscribes to `notify_shutdown` for cooperative cancellation
/// and holds a clone of `drained` until it finishes, which is how the
/// listener tracks its drain during shutdown.
pub(crate) fn spawn(
    client: TcpStream,
    client_addr: SocketAddr,
    worker: Worker,
    buffer_size: usize,
    notify_shutdown: &broadcast::Sender<()>,
    drained: &mpsc::Sender<()>,
) -> SessionHandle {
    let failed_to_connect = Arc::new(AtomicBool::new(false));
    let parked_client = Arc::new(Mutex::new(None));

    let session = Session {
        client,
        client_addr,
        worker: worker.clone(),
        buffer_size,
        failed_to_connect: Arc::clone(&failed_to_connect),
        parked_client: Arc::clone(&parked_client),
        shutdown: Shutdown::new(notify_shutdown.subscribe()),
        _drained: drained.clone(),
    };
    let task = tokio::spawn(session.run());

    SessionHandle {
        client_addr,
        worker,
        failed_to_connect,
        parked_client,
        task,
    }
}

struct Session {
    client: TcpStream,
    client_addr: SocketAddr,
    worker: Worker,
    buffer_size: usize,
    failed_to_connect: Arc<AtomicBool>,
    parked_client: Arc<Mutex<Option<TcpStream>>>,
    shutdown: Shutdown,
    /// Dropped when the session ends; closes the listener's drain channel
    /// once every session has finished.
    _drained: mpsc::Sender<()>,
}

impl Session {
    async fn run(self) {
        let Session {
            client,
            client_addr,
            worker,
            buffer_size,
            failed_to_connect,
            parked_client,
            mut shutdown,
            _drained,
        } = self;

        let worker_stream = tokio::select! {
            res = TcpStream::connect((worker.addr.as_str(), worker.port)) => match res {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("could not connect to worker {worker}: {err}");
                    // Park before raising the flag: the retry scanner reads
                    // the flag first, then takes the socket.
                    *parked_client.lock().unwrap() = Some(client);
                    failed_to_connect.store(true, Ordering::Release);
                    tokio::select! {
                        _ = time::sleep(CONNECT_FAIL_LINGER) => {}
                        _ = shutdown.recv() => {}
                    }
                    return;
                }
            },
            _ = shutdown.recv() => return,
        };

        debug!("relaying {client_addr} <-> {worker}");
        relay(
            client,
            worker_stream,
            client_addr,
            &worker,
            buffer_size,
            &mut shutdown,
        )
        .await;
    }
}

/// Why the relay loop stopped.
enum RelayEnd {
    /// One of the peers closed its connection.
    PeerClosed,
    /// Cooperative cancellation.
    Cancelled,
    /// An I/O error, already logged.
    Failed,
}

/// Full-duplex relay between the client and the worker.
///
/// Bytes read from one side accumulate in a pending buffer for the other and
/// are drained in `buffer_size`-sized writes whenever that side is writable.
/// Write interest for a socket is only registered while its pending buffer
/// is non-empty. The relay ends when either peer closes, on the first I/O
/// error, or on cancellation; bytes already read when a peer closes are
/// still flushed, so a client that sends and immediately disconnects has its
/// whole stream delivered to the worker.
async fn relay(
    mut client: TcpStream,
    mut worker: TcpStream,
    client_addr: SocketAddr,
    worker_desc: &Worker,
    buffer_size: usize,
    shutdown: &mut Shutdown,
) {
    let mut to_client = BytesMut::new();
    let mut to_worker = BytesMut::new();
    let mut scratch = vec![0u8; buffer_size];

    let end = loop {
        let client_interest = interest_for(&to_client);
        let worker_interest = interest_for(&to_worker);

        tokio::select! {
            _ = shutdown.recv() => break RelayEnd::Cancelled,
            res = client.ready(client_interest) => {
                match pump_side(res, &client, &mut to_worker, &mut to_client, &mut scratch, buffer_size) {
                    Ok(true) => {}
                    Ok(false) => break RelayEnd::PeerClosed,
                    Err(err) => {
                        error!("session {client_addr} -> {worker_desc} failed: {err}");
                        break RelayEnd::Failed;
                    }
                }
            }
            res = worker.ready(worker_interest) => {
                match pump_side(res, &worker, &mut to_client, &mut to_worker, &mut scratch, buffer_size) {
                    Ok(true) => {}
                    Ok(false) => break RelayEnd::PeerClosed,
                    Err(err) => {
                        error!("session {client_addr} -> {worker_desc} failed: {err}");
                        break RelayEnd::Failed;
                    }
                }
            }
        }
    };

    match end {
        RelayEnd::PeerClosed => {
            // Deliver what was already read before tearing down. Cancellation
            // still cuts this short.
            let flush = async {
                if !to_worker.is_empty() {
                    let _ = worker.write_all(&to_worker).await;
                }
                if !to_client.is_empty() {
                    let _ = client.write_all(&to_client).await;
                }
            };
            tokio::select! {
                _ = flush => {}
                _ = shutdown.recv() => {}
            }
        }
        RelayEnd::Cancelled => {
            // One non-blocking attempt to flush; errors while tearing down
            // stay out of the logs.
            let _ = pump_write(&worker, &mut to_worker, buffer_size);
            let _ = pump_write(&client, &mut to_client, buffer_size);
        }
        RelayEnd::Failed => {}
    }

    close_connections(client, worker).await;
}

fn interest_for(pending: &BytesMut) -> Interest {
    if pending.is_empty() {
        Interest::READABLE
    } else {
        Interest::READABLE | Interest::WRITABLE
    }
}

/// Service one socket after a readiness wakeup: read into `inbound` (bytes
/// headed for the other side), then drain `outbound` (bytes headed here).
/// Returns `Ok(false)` when the peer has closed.
fn pump_side(
    readiness: io::Result<tokio::io::Ready>,
    sock: &TcpStream,
    inbound: &mut BytesMut,
    outbound: &mut BytesMut,
    scratch: &mut [u8],
    chunk: usize,
) -> io::Result<bool> {
    let ready = readiness?;
    if ready.is_readable() && !pump_read(sock, inbound, scratch)? {
        return Ok(false);
    }
    if ready.is_writable() {
        pump_write(sock, outbound, chunk)?;
    }
    Ok(true)
}

/// Read once into `pending`. Returns `Ok(false)` when the peer has closed.
/// A spurious readiness wakeup (`WouldBlock`) is not an error.
fn pump_read(sock: &TcpStream, pending: &mut BytesMut, scratch: &mut [u8]) -> io::Result<bool> {
    match sock.try_read(scratch) {
        Ok(0) => Ok(false),
        Ok(n) => {
            pending.extend_from_slice(&scratch[..n]);
            Ok(true)
        }
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(err) => Err(err),
    }
}

/// Drain `pending` into the socket in `chunk`-sized writes until it is empty
/// or the socket stops accepting.
fn pump_write(sock: &TcpStream, pending: &mut BytesMut, chunk: usize) -> io::Result<()> {
    while !pending.is_empty() {
        let len = chunk.min(pending.len());
        match sock.try_write(&pending[..len]) {
            Ok(n) => pending.advance(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Shut down the write halves and close both sockets, tolerating errors on
/// either step.
async fn close_connections(mut client: TcpStream, mut worker: TcpStream) {
    let _ = client.shutdown().await;
    let _ = worker.shutdown().await;
}
