//! Transfer state manager: single owner of all open transfer records.
//!
//! Workers never touch record JSON directly; they hold a `TransferHandle`
//! and request mutations here. For any `(peer, file_hash, role)` there is at
//! most one open handle; a second `open` returns the existing one. Progress
//! hits disk when `chunks_per_sync` new chunks have landed, when
//! `sync_interval` has elapsed with dirty progress, on `finish`, or on
//! `flush_all` at shutdown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::chunk::ChunkSet;
use crate::record::{TransferDescriptor, TransferRecord, TransferRole};
use crate::store::{StateStore, StoreError};

/// Opaque handle to an open transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

/// When dirty progress must be written back.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub chunks_per_sync: u32,
    pub sync_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            chunks_per_sync: 50,
            sync_interval: Duration::from_secs(5),
        }
    }
}

struct Entry {
    record: TransferRecord,
    dirty_chunks: u32,
    dirty: bool,
    last_flush: Instant,
}

type Key = (String, String, TransferRole);

/// Owns the in-memory mirror of every open `TransferRecord` and serializes
/// writes through the state store.
pub struct TransferManager {
    store: StateStore,
    policy: FlushPolicy,
    entries: HashMap<u64, Entry>,
    by_key: HashMap<Key, u64>,
    next_handle: u64,
}

impl TransferManager {
    pub fn new(store: StateStore, policy: FlushPolicy) -> Self {
        Self {
            store,
            policy,
            entries: HashMap::new(),
            by_key: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Open a transfer. Reuses the existing handle for the same
    /// `(peer, file_hash, role)`; otherwise adopts matching on-disk progress
    /// or starts (and persists) a fresh record. Returns the handle and
    /// whether stored progress was resumed.
    pub fn open(
        &mut self,
        descriptor: TransferDescriptor,
    ) -> Result<(TransferHandle, bool), StoreError> {
        let key = (
            descriptor.peer_device_id.clone(),
            descriptor.file_hash.clone(),
            descriptor.role,
        );
        if let Some(&id) = self.by_key.get(&key) {
            return Ok((TransferHandle(id), true));
        }
        let disk = self
            .store
            .load_record(descriptor.role, &descriptor.file_hash)?;
        let (record, resumed) = match disk {
            Some(mut rec)
                if rec.descriptor.matches_info(&descriptor.to_info())
                    && rec.descriptor.peer_device_id == descriptor.peer_device_id =>
            {
                rec.stalled = false;
                (rec, true)
            }
            _ => (TransferRecord::new(descriptor), false),
        };
        self.store.save_record(&record)?;
        let id = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            id,
            Entry {
                record,
                dirty_chunks: 0,
                dirty: false,
                last_flush: Instant::now(),
            },
        );
        self.by_key.insert(key, id);
        Ok((TransferHandle(id), resumed))
    }

    fn entry(&self, handle: TransferHandle) -> Option<&Entry> {
        self.entries.get(&handle.0)
    }

    /// Record a completed chunk, flushing if the policy says so.
    pub fn mark_complete(
        &mut self,
        handle: TransferHandle,
        index: u32,
    ) -> Result<(), StoreError> {
        let policy = self.policy;
        let Some(entry) = self.entries.get_mut(&handle.0) else {
            return Ok(());
        };
        if entry.record.mark_complete(index) {
            entry.dirty = true;
            entry.dirty_chunks += 1;
        }
        if entry.dirty
            && (entry.dirty_chunks >= policy.chunks_per_sync
                || entry.last_flush.elapsed() >= policy.sync_interval)
        {
            Self::flush_entry(&self.store, entry)?;
        }
        Ok(())
    }

    /// Replace local progress wholesale (the receiver is authoritative on
    /// resume) and persist immediately.
    pub fn adopt_completed(
        &mut self,
        handle: TransferHandle,
        completed: ChunkSet,
    ) -> Result<(), StoreError> {
        let Some(entry) = self.entries.get_mut(&handle.0) else {
            return Ok(());
        };
        entry.record.completed_chunks = completed;
        entry.record.updated_at = crate::record::now_secs();
        entry.dirty = true;
        Self::flush_entry(&self.store, entry)
    }

    pub fn completed_set(&self, handle: TransferHandle) -> ChunkSet {
        self.entry(handle)
            .map(|e| e.record.completed_chunks.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the open record (descriptor + progress).
    pub fn snapshot(&self, handle: TransferHandle) -> Option<TransferRecord> {
        self.entry(handle).map(|e| e.record.clone())
    }

    /// Flush any dirty progress for one transfer regardless of policy.
    pub fn flush(&mut self, handle: TransferHandle) -> Result<(), StoreError> {
        if let Some(entry) = self.entries.get_mut(&handle.0) {
            if entry.dirty {
                Self::flush_entry(&self.store, entry)?;
            }
        }
        Ok(())
    }

    /// Terminal completion: delete the record file and drop the handle.
    pub fn finish(&mut self, handle: TransferHandle) -> Result<(), StoreError> {
        if let Some(entry) = self.entries.remove(&handle.0) {
            let d = &entry.record.descriptor;
            self.by_key
                .remove(&(d.peer_device_id.clone(), d.file_hash.clone(), d.role));
            self.store.delete_record(d.role, &d.file_hash)?;
        }
        Ok(())
    }

    /// Release a handle without deleting the record (session drop, cancel).
    /// Dirty progress is flushed first.
    pub fn close(&mut self, handle: TransferHandle) -> Result<(), StoreError> {
        if let Some(mut entry) = self.entries.remove(&handle.0) {
            if entry.dirty {
                Self::flush_entry(&self.store, &mut entry)?;
            }
            let d = &entry.record.descriptor;
            self.by_key
                .remove(&(d.peer_device_id.clone(), d.file_hash.clone(), d.role));
        }
        Ok(())
    }

    /// Mark an open transfer stalled (reconnect gave up) and persist.
    pub fn mark_stalled(&mut self, handle: TransferHandle) -> Result<(), StoreError> {
        if let Some(entry) = self.entries.get_mut(&handle.0) {
            entry.record.stalled = true;
            entry.dirty = true;
            Self::flush_entry(&self.store, entry)?;
        }
        Ok(())
    }

    /// On-disk records for a peer and role, open or not. Used by the
    /// reconnect supervisor to re-attach transfers.
    pub fn enumerate_pending(
        &self,
        peer_device_id: &str,
        role: TransferRole,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let mut out = Vec::new();
        for rec in self.store.list_records(role)? {
            if rec.descriptor.peer_device_id == peer_device_id {
                out.push(rec);
            }
        }
        // In-memory state may be ahead of disk for open transfers.
        for entry in self.entries.values() {
            let d = &entry.record.descriptor;
            if d.peer_device_id == peer_device_id && d.role == role {
                if let Some(slot) = out
                    .iter_mut()
                    .find(|r| r.descriptor.file_hash == d.file_hash)
                {
                    *slot = entry.record.clone();
                }
            }
        }
        Ok(out)
    }

    /// Mark every on-disk record for a peer stalled (reconnect gave up).
    /// Returns the records touched; they stay on disk for a manual retry.
    pub fn stall_pending(&mut self, peer_device_id: &str) -> Result<Vec<TransferRecord>, StoreError> {
        let mut out = Vec::new();
        for role in [TransferRole::Sending, TransferRole::Receiving] {
            for mut rec in self.store.list_records(role)? {
                if rec.descriptor.peer_device_id == peer_device_id && !rec.stalled {
                    rec.stalled = true;
                    self.store.save_record(&rec)?;
                    out.push(rec);
                }
            }
        }
        Ok(out)
    }

    /// Write back everything dirty. Called on graceful shutdown and by the
    /// periodic sync tick.
    pub fn flush_all(&mut self) -> Result<(), StoreError> {
        for entry in self.entries.values_mut() {
            if entry.dirty {
                Self::flush_entry(&self.store, entry)?;
            }
        }
        Ok(())
    }

    fn flush_entry(store: &StateStore, entry: &mut Entry) -> Result<(), StoreError> {
        store.save_record(&entry.record)?;
        entry.dirty = false;
        entry.dirty_chunks = 0;
        entry.last_flush = Instant::now();
        Ok(())
    }
}
