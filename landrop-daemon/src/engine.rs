//! The engine: shared state, long-lived workers, and the UI-facing API.
//!
//! Everything a worker needs hangs off `Shared`; the transfer records and
//! the trusted set each have exactly one owner behind a mutex, per the
//! single-writer rule. The engine itself is the abstract interface a
//! front-end drives: submit jobs, watch events, answer pairing prompts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use landrop_core::identity::DeviceIdentity;
use landrop_core::manager::{FlushPolicy, TransferManager};
use landrop_core::store::StateStore;
use landrop_core::trust::{PeerRecord, TrustManager};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, CONNECT_TIMEOUT, DISCOVERY_TIMEOUT};
use crate::discovery::{self, DiscoveredPeer, PeerEntry};
use crate::events::Event;
use crate::jobs::{self, FileJob, JobId, JobProgress, JobTable};
use crate::reconnect::{self, ReconnectRequest};
use crate::session::{self, SessionHandle};

/// State shared by every worker task.
pub struct Shared {
    pub config: Config,
    pub identity: DeviceIdentity,
    pub trust: Mutex<TrustManager>,
    pub transfers: Mutex<TransferManager>,
    pub peers: Mutex<HashMap<String, PeerEntry>>,
    pub sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Codes this instance is currently displaying, by peer device id.
    pub pair_codes: Mutex<HashMap<String, String>>,
    pub jobs: Mutex<JobTable>,
    /// Waiters for targeted discovery answers, by device id.
    pub lookups: Mutex<HashMap<String, Vec<oneshot::Sender<SocketAddr>>>>,
    pub reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    events: broadcast::Sender<Event>,
}

impl Shared {
    /// Build the state stack: store, identity, trust, transfer manager.
    pub fn new(
        config: Config,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<ReconnectRequest>)> {
        let store = StateStore::open(&config.download_dir)
            .with_context(|| format!("opening state dir under {}", config.download_dir.display()))?;
        let identity = DeviceIdentity::load_or_create(&store, config.tcp_port)
            .context("loading device identity")?;
        let trust = TrustManager::load(store.clone()).context("loading trusted devices")?;
        let transfers = TransferManager::new(
            store,
            FlushPolicy {
                chunks_per_sync: config.chunks_per_sync,
                sync_interval: config.state_sync_interval(),
            },
        );
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Self {
            config,
            identity,
            trust: Mutex::new(trust),
            transfers: Mutex::new(transfers),
            peers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            pair_codes: Mutex::new(HashMap::new()),
            jobs: Mutex::new(JobTable::default()),
            lookups: Mutex::new(HashMap::new()),
            reconnect_tx,
            events,
        });
        Ok((shared, reconnect_rx))
    }

    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("peer {0} is neither discovered nor trusted")]
    PeerNotFound(String),
    #[error("no live session with peer {0}")]
    NoSession(String),
    #[error("cannot read {path}: {source}")]
    BadPath {
        path: String,
        source: std::io::Error,
    },
    #[error("unknown job")]
    UnknownJob,
}

/// A pairing code waiting to be transcribed, acceptor side.
#[derive(Debug, Clone)]
pub struct PendingPairCode {
    pub peer_device_id: String,
    pub code: String,
}

/// The running service.
pub struct Engine {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Bind sockets and start every worker: listener, discovery, reconnect
    /// supervisor, periodic state sync.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let (shared, reconnect_rx) = Shared::new(config)?;
        info!(
            device_id = %shared.identity.device_id,
            "engine starting"
        );
        let listener = TcpListener::bind(("0.0.0.0", shared.config.tcp_port))
            .await
            .with_context(|| format!("binding tcp port {}", shared.config.tcp_port))?;

        let mut tasks = Vec::new();
        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = session::run_listener(s, listener).await {
                warn!("listener stopped: {e}");
            }
        }));
        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(s).await {
                warn!("discovery stopped: {e}");
            }
        }));
        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            reconnect::run_supervisor(s, reconnect_rx).await;
        }));
        let s = shared.clone();
        tasks.push(tokio::spawn(async move {
            sync_loop(s).await;
        }));
        Ok(Self { shared, tasks })
    }

    pub fn local_identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.subscribe()
    }

    pub async fn list_peers(&self) -> Vec<DiscoveredPeer> {
        discovery::snapshot(&*self.shared.peers.lock().await)
    }

    pub async fn trusted_peers(&self) -> Vec<PeerRecord> {
        self.shared.trust.lock().await.peers().to_vec()
    }

    /// Drop a peer from the trusted set; the next connection will pair
    /// again.
    pub async fn revoke(&self, peer_device_id: &str) -> bool {
        self.shared
            .trust
            .lock()
            .await
            .revoke(peer_device_id)
            .unwrap_or(false)
    }

    /// Queue a file or directory tree for a peer. Returns the job handle
    /// used with `progress()` and `cancel()`.
    pub async fn send(&self, path: &Path, peer_device_id: &str) -> Result<JobId, EngineError> {
        let job_id = Uuid::new_v4();
        let owned = path.to_path_buf();
        let files = tokio::task::spawn_blocking(move || jobs::expand(job_id, &owned))
            .await
            .map_err(|e| EngineError::BadPath {
                path: path.display().to_string(),
                source: std::io::Error::other(e),
            })?
            .map_err(|e| EngineError::BadPath {
                path: path.display().to_string(),
                source: e,
            })?;
        self.shared
            .jobs
            .lock()
            .await
            .create(job_id, peer_device_id, &files);

        // A live session takes the jobs directly.
        if let Some(handle) = self.shared.sessions.lock().await.get(peer_device_id) {
            if handle.queue_send(files.clone()) {
                return Ok(job_id);
            }
        }
        let addr = self.resolve_peer(peer_device_id).await?;
        let shared = self.shared.clone();
        let peer = peer_device_id.to_string();
        tokio::spawn(async move {
            dial(shared, peer, addr, files).await;
        });
        Ok(job_id)
    }

    /// Find an address for a peer: discovery table, then trusted record,
    /// then a targeted lookup on the wire.
    async fn resolve_peer(&self, peer_device_id: &str) -> Result<SocketAddr, EngineError> {
        if let Some(entry) = self.shared.peers.lock().await.get(peer_device_id) {
            return Ok(entry.addr);
        }
        let trusted = self
            .shared
            .trust
            .lock()
            .await
            .get(peer_device_id)
            .map(|rec| SocketAddr::new(rec.last_known_ip, self.shared.config.tcp_port));
        if let Some(addr) = trusted {
            return Ok(addr);
        }
        if let Some(addr) =
            discovery::lookup(&self.shared, peer_device_id, DISCOVERY_TIMEOUT).await
        {
            return Ok(addr);
        }
        Err(EngineError::PeerNotFound(peer_device_id.to_string()))
    }

    /// Flag a job cancelled. The owning session stops after the in-flight
    /// chunk's ACK deadline; records stay on disk for a later resume.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), EngineError> {
        if self.shared.jobs.lock().await.cancel(job_id) {
            Ok(())
        } else {
            Err(EngineError::UnknownJob)
        }
    }

    pub async fn progress(&self, job_id: JobId) -> Option<JobProgress> {
        self.shared.jobs.lock().await.progress(job_id)
    }

    /// Codes currently displayed on this side, waiting for the remote user
    /// to type them.
    pub async fn pending_pair_codes(&self) -> Vec<PendingPairCode> {
        self.shared
            .pair_codes
            .lock()
            .await
            .iter()
            .map(|(peer, code)| PendingPairCode {
                peer_device_id: peer.clone(),
                code: code.clone(),
            })
            .collect()
    }

    /// Submit the code the user transcribed from the peer's screen.
    pub async fn submit_pair_code(
        &self,
        peer_device_id: &str,
        code: &str,
    ) -> Result<(), EngineError> {
        let sessions = self.shared.sessions.lock().await;
        match sessions.get(peer_device_id) {
            Some(handle) if handle.submit_pair_code(code.to_string()) => Ok(()),
            _ => Err(EngineError::NoSession(peer_device_id.to_string())),
        }
    }

    /// Graceful shutdown: BYE every session, flush all records, stop
    /// workers.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        let sessions: Vec<SessionHandle> =
            self.shared.sessions.lock().await.values().cloned().collect();
        for handle in sessions {
            handle.close();
        }
        // Give sessions a beat to send BYE and flush their transfers.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if let Err(e) = self.shared.transfers.lock().await.flush_all() {
            warn!("final flush failed: {e}");
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// First connection to a peer for a fresh job.
async fn dial(shared: Arc<Shared>, peer_device_id: String, addr: SocketAddr, jobs: Vec<FileJob>) {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            session::run_initiated(shared, stream, addr, jobs).await;
        }
        other => {
            let detail = match other {
                Ok(Err(e)) => e.to_string(),
                _ => "connect timed out".into(),
            };
            warn!(peer = %peer_device_id, %addr, "dial failed: {detail}");
            // Maybe the address is stale; let the supervisor hunt for it.
            let _ = shared.reconnect_tx.send(ReconnectRequest {
                peer_device_id,
                last_addr: Some(addr),
                jobs,
            });
        }
    }
}

/// Periodic write-back of dirty progress, independent of chunk cadence.
async fn sync_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.config.state_sync_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = shared.transfers.lock().await.flush_all() {
            warn!("periodic flush failed: {e}");
        }
    }
}
