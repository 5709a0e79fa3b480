//! Reconnect supervisor: revive failed sessions and re-attach transfers.
//!
//! Direct redial first, then targeted discovery for peers whose IP moved,
//! then give up and mark everything stalled. Progress is never deleted
//! here.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CONNECT_TIMEOUT, DISCOVERY_TIMEOUT};
use crate::discovery;
use crate::engine::Shared;
use crate::events::{Event, FailureKind};
use crate::jobs::{FileJob, JobState};
use crate::session;

/// A failed session's unfinished business.
#[derive(Debug)]
pub struct ReconnectRequest {
    pub peer_device_id: String,
    pub last_addr: Option<SocketAddr>,
    pub jobs: Vec<FileJob>,
}

pub async fn run_supervisor(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<ReconnectRequest>,
) {
    while let Some(req) = rx.recv().await {
        let shared = shared.clone();
        tokio::spawn(async move {
            reconnect(shared, req).await;
        });
    }
}

async fn reconnect(shared: Arc<Shared>, req: ReconnectRequest) {
    let peer_id = req.peer_device_id.clone();
    info!(peer = %peer_id, "reconnecting");
    shared.emit(Event::Reconnecting {
        peer_device_id: peer_id.clone(),
    });
    if let Err(e) = shared.transfers.lock().await.flush_all() {
        warn!("flush before reconnect failed: {e}");
    }

    let mut addr = req.last_addr;
    if addr.is_none() {
        addr = shared
            .trust
            .lock()
            .await
            .get(&peer_id)
            .map(|rec| SocketAddr::new(rec.last_known_ip, shared.config.tcp_port));
    }

    if let Some(addr) = addr {
        if let Some(stream) = dial_loop(&shared, addr).await {
            attach(shared, req, stream, addr).await;
            return;
        }
    }

    // Direct attempts exhausted; maybe the peer's IP changed.
    debug!(peer = %peer_id, "direct reconnect failed, trying targeted discovery");
    if let Some(new_addr) = discovery::lookup(&shared, &peer_id, DISCOVERY_TIMEOUT).await {
        info!(peer = %peer_id, addr = %new_addr, "peer found at new address");
        if let Err(e) = shared.trust.lock().await.touch(&peer_id, new_addr.ip()) {
            warn!("trust record update failed: {e}");
        }
        if let Some(stream) = dial_loop(&shared, new_addr).await {
            attach(shared, req, stream, new_addr).await;
            return;
        }
    }

    give_up(&shared, req).await;
}

/// Up to `max_reconnect_attempts` connects with a fixed interval between
/// them.
async fn dial_loop(shared: &Arc<Shared>, addr: SocketAddr) -> Option<TcpStream> {
    for attempt in 1..=shared.config.max_reconnect_attempts {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => debug!(%addr, attempt, "connect failed: {e}"),
            Err(_) => debug!(%addr, attempt, "connect timed out"),
        }
        tokio::time::sleep(shared.config.reconnect_interval()).await;
    }
    None
}

/// Hand the new transport a fresh session carrying the old session's jobs.
/// The trusted fast path and FILE_RESUME negotiation do the rest.
async fn attach(shared: Arc<Shared>, req: ReconnectRequest, stream: TcpStream, addr: SocketAddr) {
    let peer_id = req.peer_device_id.clone();
    for job in &req.jobs {
        shared
            .jobs
            .lock()
            .await
            .set_state(job.parent, JobState::Queued);
    }
    shared.emit(Event::Reconnected {
        peer_device_id: peer_id.clone(),
    });
    tokio::spawn(async move {
        session::run_initiated(shared, stream, addr, req.jobs).await;
    });
}

/// Every strategy failed: keep records on disk, mark them stalled, tell the
/// user.
async fn give_up(shared: &Arc<Shared>, req: ReconnectRequest) {
    warn!(peer = %req.peer_device_id, "reconnect exhausted; transfers stalled");
    let stalled = shared
        .transfers
        .lock()
        .await
        .stall_pending(&req.peer_device_id);
    match stalled {
        Ok(records) => {
            for rec in records {
                shared.emit(Event::TransferFailed {
                    file_hash: Some(rec.descriptor.file_hash.clone()),
                    kind: FailureKind::Stalled,
                    detail: "peer unreachable".into(),
                });
            }
        }
        Err(e) => warn!("could not mark records stalled: {e}"),
    }
    for job in &req.jobs {
        shared
            .jobs
            .lock()
            .await
            .set_state(job.parent, JobState::Stalled);
    }
}
