//! Inbound pull service.
//!
//! Accept loop plus per-connection sessions on the I/O pool. Each request
//! frame is dispatched on its own task (a pull may long-poll for its whole
//! wait budget, and the next frame must not wait behind it); responses
//! funnel through a single writer task and carry the request's call id, so
//! they may complete out of order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::db::ReplicaRole;
use crate::metrics;
use crate::registry::DbRegistry;
use crate::wire::{self, PullResponse, PullStatus};

pub(crate) async fn run_service(
    listener: TcpListener,
    registry: Arc<DbRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!(addr = %addr, "replicator service listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    let shutdown = shutdown.clone();
                    tokio::spawn(handle_connection(stream, peer, registry, shutdown));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(addr = %addr, "replicator service stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<DbRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    stream.set_nodelay(true).ok();
    debug!(peer = %peer, "inbound replication connection");
    let (mut read_half, mut write_half) = stream.into_split();

    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<(u64, PullResponse)>();
    let writer = tokio::spawn(async move {
        while let Some((call_id, resp)) = resp_rx.recv().await {
            let payload = match wire::encode_response(&resp) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "failed to encode response");
                    continue;
                }
            };
            if let Err(e) = wire::write_frame(&mut write_half, call_id, &payload).await {
                debug!(peer = %peer, error = %e, "response write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = wire::read_frame(&mut read_half) => match frame {
                Ok((call_id, payload)) => {
                    let registry = Arc::clone(&registry);
                    let resp_tx = resp_tx.clone();
                    tokio::spawn(async move {
                        let resp = handle_request(&registry, &payload).await;
                        let _ = resp_tx.send((call_id, resp));
                    });
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "connection closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(resp_tx);
    let _ = writer.await;
}

async fn handle_request(registry: &DbRegistry, payload: &[u8]) -> PullResponse {
    let req = match wire::decode_request(payload) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "undecodable pull request");
            return PullResponse::status_only(PullStatus::ServerError, 0, ReplicaRole::Leader);
        }
    };

    match registry.get(&req.db_name) {
        None => {
            metrics::record_serve_miss(&req.db_name);
            PullResponse::status_only(PullStatus::DbNotFound, req.from_seq, ReplicaRole::Leader)
        }
        Some(db) => {
            db.serve_pull(req.from_seq, req.max_wait_ms, req.include_ack_seq, req.peer_role)
                .await
        }
    }
}
