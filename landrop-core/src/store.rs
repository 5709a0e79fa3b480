//! Persisted state under `<download_dir>/.lan_share/`.
//!
//! Layout:
//!   device_id.json          local identity, written once
//!   trusted_devices.json    trusted peer set
//!   sending/<hash>.json     sending-side transfer records
//!   receiving/<hash>.json   receiving-side transfer records
//!   receiving/<hash>.part   sparse in-flight data files
//!
//! Every JSON file is written atomically: write `<path>.tmp`, fsync, rename
//! over `<path>`. A `.tmp` left by a crash mid-rename is promoted on the
//! next read. Files that no longer parse are renamed aside with a `.corrupt`
//! suffix instead of being deleted.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::record::{TransferRecord, TransferRole};

/// Directory name under the download dir.
pub const STATE_DIR_NAME: &str = ".lan_share";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt state file {0}")]
    Corrupt(PathBuf),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to the on-disk state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    base: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the state directory under `download_dir`.
    pub fn open(download_dir: &Path) -> io::Result<Self> {
        let base = download_dir.join(STATE_DIR_NAME);
        fs::create_dir_all(base.join(TransferRole::Sending.dir_name()))?;
        fs::create_dir_all(base.join(TransferRole::Receiving.dir_name()))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn identity_path(&self) -> PathBuf {
        self.base.join("device_id.json")
    }

    pub fn trusted_path(&self) -> PathBuf {
        self.base.join("trusted_devices.json")
    }

    pub fn record_path(&self, role: TransferRole, file_hash: &str) -> PathBuf {
        self.base
            .join(role.dir_name())
            .join(format!("{file_hash}.json"))
    }

    /// Sparse in-flight data file for a receiving transfer.
    pub fn part_path(&self, file_hash: &str) -> PathBuf {
        self.base
            .join(TransferRole::Receiving.dir_name())
            .join(format!("{file_hash}.part"))
    }

    /// Atomic write: temp file, fsync, rename over the destination.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let tmp = tmp_path(path);
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a JSON file. A `.tmp` survivor is promoted first (crash between
    /// fsync and rename). Returns `Ok(None)` when neither exists and
    /// `Err(Corrupt)` when the contents no longer parse.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let tmp = tmp_path(path);
        if !path.exists() && tmp.exists() {
            fs::rename(&tmp, path)?;
        }
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| StoreError::Corrupt(path.to_path_buf()))
    }

    /// Move a damaged file aside so a fresh one can take its place.
    pub fn quarantine(&self, path: &Path) -> io::Result<PathBuf> {
        let mut target = path.as_os_str().to_owned();
        target.push(".corrupt");
        let target = PathBuf::from(target);
        fs::rename(path, &target)?;
        Ok(target)
    }

    pub fn save_record(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let path = self.record_path(record.descriptor.role, &record.descriptor.file_hash);
        self.write_json(&path, record)
    }

    /// Load a record; quarantines and reports `None` when it is corrupt or
    /// violates its own invariants, so the caller starts a fresh transfer.
    pub fn load_record(
        &self,
        role: TransferRole,
        file_hash: &str,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let path = self.record_path(role, file_hash);
        match self.read_json::<TransferRecord>(&path) {
            Ok(Some(rec)) if rec.validate().is_ok() => Ok(Some(rec)),
            Ok(Some(_)) | Err(StoreError::Corrupt(_)) => {
                self.quarantine(&path)?;
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn delete_record(&self, role: TransferRole, file_hash: &str) -> io::Result<()> {
        let path = self.record_path(role, file_hash);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// All parseable records for one role. Corrupt files are quarantined on
    /// the way through.
    pub fn list_records(&self, role: TransferRole) -> Result<Vec<TransferRecord>, StoreError> {
        let dir = self.base.join(role.dir_name());
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(rec) = self.load_record(role, hash)? {
                out.push(rec);
            }
        }
        Ok(out)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}
