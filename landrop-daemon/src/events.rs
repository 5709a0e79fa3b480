//! Structured events surfaced to the UI layer.

use std::net::SocketAddr;
use std::path::PathBuf;

use landrop_core::record::TransferRole;

/// Why a transfer or session gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Protocol,
    Pairing,
    State,
    Integrity,
    Cancelled,
    Stalled,
}

/// Everything a front-end needs to render the service. Delivered over a
/// broadcast channel; slow subscribers miss events rather than stalling the
/// core.
#[derive(Debug, Clone)]
pub enum Event {
    PeerDiscovered {
        device_id: String,
        hostname: String,
        addr: SocketAddr,
    },
    PeerLost {
        device_id: String,
    },
    /// Pairing is needed. On the accepting side `code` carries the digits
    /// to display; on the initiating side it is `None` and the UI should
    /// prompt for the peer's code.
    PairRequest {
        peer_device_id: String,
        code: Option<String>,
    },
    PairFailed {
        peer_device_id: String,
        attempts_left: u32,
    },
    TransferStarted {
        peer_device_id: String,
        file_hash: String,
        file_name: String,
        bytes_total: u64,
        role: TransferRole,
    },
    TransferProgress {
        file_hash: String,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransferComplete {
        file_hash: String,
        file_name: String,
        /// Where the file landed; receiver side only.
        path: Option<PathBuf>,
    },
    TransferFailed {
        file_hash: Option<String>,
        kind: FailureKind,
        detail: String,
    },
    Reconnecting {
        peer_device_id: String,
    },
    Reconnected {
        peer_device_id: String,
    },
}
