//! Local device identity: stable across IP changes and restarts.
//!
//! `device_id = <hostname>-<user>-<uuid>`. The uuid is generated on first
//! boot and persisted; the id never changes afterwards unless the identity
//! file is deleted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::now_secs;
use crate::store::{StateStore, StoreError};

/// The local device as announced to peers.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub hostname: String,
    pub user: String,
    pub advertised_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    device_id: String,
    uuid: Uuid,
    created_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("identity i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceIdentity {
    /// Load the persisted identity, or generate and persist one on first
    /// boot. A corrupt identity file is quarantined and replaced.
    pub fn load_or_create(
        store: &StateStore,
        advertised_port: u16,
    ) -> Result<Self, IdentityError> {
        let hostname = local_hostname();
        let user = local_user();
        let path = store.identity_path();
        let existing = match store.read_json::<IdentityFile>(&path) {
            Ok(found) => found,
            Err(StoreError::Corrupt(_)) => {
                store.quarantine(&path)?;
                None
            }
            Err(e) => return Err(e.into()),
        };
        let file = match existing {
            Some(f) => f,
            None => {
                let uuid = Uuid::new_v4();
                let file = IdentityFile {
                    device_id: format!("{hostname}-{user}-{uuid}"),
                    uuid,
                    created_at: now_secs(),
                };
                store.write_json(&path, &file)?;
                file
            }
        };
        Ok(Self {
            device_id: file.device_id,
            hostname,
            user,
            advertised_port,
        })
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".into())
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "user".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let first = DeviceIdentity::load_or_create(&store, 9527).unwrap();
        let second = DeviceIdentity::load_or_create(&store, 9527).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert!(first
            .device_id
            .starts_with(&format!("{}-{}-", first.hostname, first.user)));
    }

    #[test]
    fn corrupt_identity_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let first = DeviceIdentity::load_or_create(&store, 9527).unwrap();
        std::fs::write(store.identity_path(), b"garbage").unwrap();
        let second = DeviceIdentity::load_or_create(&store, 9527).unwrap();
        assert_ne!(first.device_id, second.device_id);
    }
}
