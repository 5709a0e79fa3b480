//! Trusted peer set: devices that bypass pairing on reconnect.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::record::now_secs;
use crate::store::{StateStore, StoreError};

/// One trusted peer. `last_known_ip` and `last_seen` are refreshed on every
/// successful connection; the entry itself lives until the user revokes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: String,
    pub hostname: String,
    pub last_known_ip: IpAddr,
    pub trusted_at: u64,
    pub last_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustedFile {
    devices: Vec<PeerRecord>,
}

/// Owner of the trusted-devices list. Every mutation is persisted through
/// the store's atomic write before it returns.
#[derive(Debug)]
pub struct TrustManager {
    store: StateStore,
    devices: Vec<PeerRecord>,
}

impl TrustManager {
    /// Load the trusted set. A corrupt file is quarantined and the set
    /// starts empty.
    pub fn load(store: StateStore) -> Result<Self, StoreError> {
        let path = store.trusted_path();
        let devices = match store.read_json::<TrustedFile>(&path) {
            Ok(Some(f)) => f.devices,
            Ok(None) => Vec::new(),
            Err(StoreError::Corrupt(_)) => {
                store.quarantine(&path)?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self { store, devices })
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d.device_id == device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&PeerRecord> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.devices
    }

    /// Add a peer, or refresh an existing entry in place. Idempotent by
    /// `device_id`.
    pub fn trust(
        &mut self,
        device_id: &str,
        hostname: &str,
        ip: IpAddr,
    ) -> Result<(), StoreError> {
        let now = now_secs();
        match self.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(existing) => {
                existing.hostname = hostname.to_string();
                existing.last_known_ip = ip;
                existing.last_seen = now;
            }
            None => self.devices.push(PeerRecord {
                device_id: device_id.to_string(),
                hostname: hostname.to_string(),
                last_known_ip: ip,
                trusted_at: now,
                last_seen: now,
            }),
        }
        self.persist()
    }

    /// Remove a peer. Returns whether it was present.
    pub fn revoke(&mut self, device_id: &str) -> Result<bool, StoreError> {
        let before = self.devices.len();
        self.devices.retain(|d| d.device_id != device_id);
        let removed = self.devices.len() != before;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Refresh `last_known_ip` and `last_seen` after a successful
    /// connection. Returns false for untrusted peers.
    pub fn touch(&mut self, device_id: &str, ip: IpAddr) -> Result<bool, StoreError> {
        match self.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(d) => {
                d.last_known_ip = ip;
                d.last_seen = now_secs();
                self.persist()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let file = TrustedFile {
            devices: self.devices.clone(),
        };
        self.store.write_json(&self.store.trusted_path(), &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, TrustManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let tm = TrustManager::load(store).unwrap();
        (dir, tm)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn trust_is_idempotent_by_device_id() {
        let (_dir, mut tm) = manager();
        tm.trust("B-u-2222", "bravo", ip("192.168.1.10")).unwrap();
        tm.trust("B-u-2222", "bravo", ip("192.168.1.10")).unwrap();
        assert_eq!(tm.peers().len(), 1);
        assert!(tm.is_trusted("B-u-2222"));
        assert!(!tm.is_trusted("C-u-3333"));
    }

    #[test]
    fn trust_updates_in_place() {
        let (_dir, mut tm) = manager();
        tm.trust("B-u-2222", "bravo", ip("192.168.1.10")).unwrap();
        let trusted_at = tm.get("B-u-2222").unwrap().trusted_at;
        tm.trust("B-u-2222", "bravo-new", ip("192.168.1.25")).unwrap();
        let rec = tm.get("B-u-2222").unwrap();
        assert_eq!(rec.hostname, "bravo-new");
        assert_eq!(rec.last_known_ip, ip("192.168.1.25"));
        assert_eq!(rec.trusted_at, trusted_at);
        assert_eq!(tm.peers().len(), 1);
    }

    #[test]
    fn touch_refreshes_ip_only_for_trusted() {
        let (_dir, mut tm) = manager();
        assert!(!tm.touch("B-u-2222", ip("10.0.0.1")).unwrap());
        tm.trust("B-u-2222", "bravo", ip("192.168.1.10")).unwrap();
        assert!(tm.touch("B-u-2222", ip("192.168.1.25")).unwrap());
        assert_eq!(tm.get("B-u-2222").unwrap().last_known_ip, ip("192.168.1.25"));
    }

    #[test]
    fn revoke_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut tm = TrustManager::load(store.clone()).unwrap();
        tm.trust("B-u-2222", "bravo", ip("192.168.1.10")).unwrap();
        assert!(tm.revoke("B-u-2222").unwrap());
        assert!(!tm.revoke("B-u-2222").unwrap());
        let reloaded = TrustManager::load(store).unwrap();
        assert!(reloaded.peers().is_empty());
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut tm = TrustManager::load(store.clone()).unwrap();
        tm.trust("A-u-1111", "alpha", ip("192.168.1.2")).unwrap();
        tm.trust("B-u-2222", "bravo", ip("192.168.1.3")).unwrap();
        let reloaded = TrustManager::load(store).unwrap();
        assert_eq!(reloaded.peers().len(), 2);
        assert!(reloaded.is_trusted("A-u-1111"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(store.trusted_path(), b"]]").unwrap();
        let tm = TrustManager::load(store).unwrap();
        assert!(tm.peers().is_empty());
    }
}
