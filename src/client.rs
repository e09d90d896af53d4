//! Client pool: one shared connection per peer address.
//!
//! Connections are lazy: the first call to an address dials it, later calls
//! reuse it. A connection is a pair of tasks — a writer draining a request
//! queue and a reader routing response frames to their callers by call id —
//! so any number of long-polls can be in flight on one socket at once.
//! On any socket error the connection is dropped and the next call
//! reconnects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::wire::{self, PullRequest, PullResponse};

/// Timeout for establishing a TCP connection to a peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type PendingCalls = Arc<DashMap<u64, oneshot::Sender<PullResponse>>>;

struct ConnHandle {
    tx: mpsc::UnboundedSender<(u64, Vec<u8>)>,
    pending: PendingCalls,
    broken: Arc<AtomicBool>,
}

/// A managed connection to one peer address.
pub struct PeerClient {
    addr: SocketAddr,
    io: Handle,
    conn: Mutex<Option<ConnHandle>>,
    next_call_id: AtomicU64,
    in_flight: AtomicUsize,
    last_used: SyncMutex<Instant>,
}

impl PeerClient {
    fn new(addr: SocketAddr, io: Handle) -> Self {
        Self {
            addr,
            io,
            conn: Mutex::new(None),
            next_call_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            last_used: SyncMutex::new(Instant::now()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Calls currently waiting on a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since this client last issued a call.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Issue one pull call, bounded by `timeout`.
    pub async fn call(&self, req: PullRequest, timeout: Duration) -> Result<PullResponse> {
        *self.last_used.lock() = Instant::now();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let result = self.call_inner(req, timeout).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn call_inner(&self, req: PullRequest, timeout: Duration) -> Result<PullResponse> {
        let payload = wire::encode_request(&req)?;

        let (call_id, rx, pending) = {
            let mut guard = self.conn.lock().await;
            if guard
                .as_ref()
                .map(|c| c.broken.load(Ordering::Acquire))
                .unwrap_or(false)
            {
                *guard = None;
            }
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }

            let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            let (sent, pending) = {
                let conn = guard.as_ref().expect("connection just established");
                conn.pending.insert(call_id, tx);
                let sent = conn.tx.send((call_id, payload)).is_ok();
                if !sent {
                    conn.pending.remove(&call_id);
                    conn.broken.store(true, Ordering::Release);
                }
                (sent, Arc::clone(&conn.pending))
            };
            if !sent {
                *guard = None;
                return Err(ReplicationError::transport(self.addr, "connection closed"));
            }
            (call_id, rx, pending)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ReplicationError::transport(self.addr, "connection lost")),
            Err(_) => {
                pending.remove(&call_id);
                Err(ReplicationError::transport(
                    self.addr,
                    format!("call timed out after {:?}", timeout),
                ))
            }
        }
    }

    async fn connect(&self) -> Result<ConnHandle> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| ReplicationError::transport(self.addr, "connect timed out"))?
            .map_err(|e| ReplicationError::transport(self.addr, format!("connect: {}", e)))?;
        stream.set_nodelay(true).ok();
        metrics::record_client_connection(&self.addr.to_string());
        debug!(peer = %self.addr, "connected to peer");

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut req_rx) = mpsc::unbounded_channel::<(u64, Vec<u8>)>();
        let pending: PendingCalls = Arc::new(DashMap::new());
        let broken = Arc::new(AtomicBool::new(false));

        let writer_broken = Arc::clone(&broken);
        let writer_addr = self.addr;
        self.io.spawn(async move {
            while let Some((call_id, payload)) = req_rx.recv().await {
                if let Err(e) = wire::write_frame(&mut write_half, call_id, &payload).await {
                    debug!(peer = %writer_addr, error = %e, "peer write failed");
                    break;
                }
            }
            writer_broken.store(true, Ordering::Release);
        });

        let reader_pending = Arc::clone(&pending);
        let reader_broken = Arc::clone(&broken);
        let reader_addr = self.addr;
        self.io.spawn(async move {
            loop {
                let (call_id, payload) = match wire::read_frame(&mut read_half).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer = %reader_addr, error = %e, "peer connection closed");
                        break;
                    }
                };
                match wire::decode_response(&payload) {
                    Ok(resp) => {
                        if let Some((_, caller)) = reader_pending.remove(&call_id) {
                            let _ = caller.send(resp);
                        }
                    }
                    Err(e) => {
                        warn!(peer = %reader_addr, error = %e, "undecodable response frame");
                        break;
                    }
                }
            }
            reader_broken.store(true, Ordering::Release);
            // Fail fast for everyone still waiting on this socket.
            reader_pending.clear();
        });

        Ok(ConnHandle { tx, pending, broken })
    }
}

/// Pool of shared peer connections keyed by address.
pub struct ClientPool {
    io: Handle,
    clients: DashMap<SocketAddr, Arc<PeerClient>>,
}

impl ClientPool {
    /// Create a pool whose connection tasks run on `io`.
    pub fn new(io: Handle) -> Self {
        Self {
            io,
            clients: DashMap::new(),
        }
    }

    /// Issue a pull call to `addr`, creating the connection if needed.
    pub async fn call(
        &self,
        addr: SocketAddr,
        req: PullRequest,
        timeout: Duration,
    ) -> Result<PullResponse> {
        let client = self
            .clients
            .entry(addr)
            .or_insert_with(|| Arc::new(PeerClient::new(addr, self.io.clone())))
            .clone();
        client.call(req, timeout).await
    }

    /// Drop clients that have been idle past `max_idle` with nothing in
    /// flight. Returns how many were released.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, client| client.in_flight() > 0 || client.idle_for() < max_idle);
        before - self.clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
