//! Shared fixtures for daemon tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::Shared;
use crate::reconnect::ReconnectRequest;

/// Keeps the temp dir and the reconnect queue alive for the test's
/// duration.
pub(crate) struct TestGuard {
    pub _dir: tempfile::TempDir,
    pub reconnect_rx: mpsc::UnboundedReceiver<ReconnectRequest>,
}

/// A full state stack rooted in a temp dir, with a small chunk size so
/// tests exercise multi-chunk paths cheaply.
pub(crate) async fn test_shared() -> (Arc<Shared>, TestGuard) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        download_dir: dir.path().to_path_buf(),
        chunk_size: 1024,
        heartbeat_interval: 1,
        ..Config::default()
    };
    let (shared, reconnect_rx) = Shared::new(config).unwrap();
    (
        shared,
        TestGuard {
            _dir: dir,
            reconnect_rx,
        },
    )
}
