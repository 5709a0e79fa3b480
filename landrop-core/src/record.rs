//! Persisted transfer state: descriptor + progress.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::{self, ChunkSet};
use crate::protocol::FileInfo;

/// Seconds since the UNIX epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Which half of a transfer this record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferRole {
    Sending,
    Receiving,
}

impl TransferRole {
    /// Subdirectory of the state dir this role's records live in.
    pub fn dir_name(self) -> &'static str {
        match self {
            TransferRole::Sending => "sending",
            TransferRole::Receiving => "receiving",
        }
    }
}

/// Immutable metadata of a single file transfer. The chunk size is recorded
/// here so a peer upgrading its default cannot corrupt an in-progress resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub peer_device_id: String,
    pub role: TransferRole,
    pub created_at: u64,
}

impl TransferDescriptor {
    /// Build a descriptor for a new transfer of known content.
    pub fn new(
        file_hash: String,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
        peer_device_id: String,
        role: TransferRole,
    ) -> Self {
        Self {
            total_chunks: chunk::total_chunks(file_size, chunk_size),
            file_hash,
            file_name,
            file_size,
            chunk_size,
            peer_device_id,
            role,
            created_at: now_secs(),
        }
    }

    /// Build the receiving-side descriptor for an announced file.
    pub fn from_info(info: &FileInfo, peer_device_id: String) -> Self {
        Self {
            file_hash: info.file_hash.clone(),
            file_name: info.file_name.clone(),
            file_size: info.file_size,
            chunk_size: info.chunk_size,
            total_chunks: info.total_chunks,
            peer_device_id,
            role: TransferRole::Receiving,
            created_at: now_secs(),
        }
    }

    /// The FILE_INFO announcement for this descriptor.
    pub fn to_info(&self) -> FileInfo {
        FileInfo {
            file_hash: self.file_hash.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Whether an announcement describes the same content, chunked the same
    /// way. A mismatch means the peer's file changed; stored progress is
    /// useless.
    pub fn matches_info(&self, info: &FileInfo) -> bool {
        self.file_hash == info.file_hash
            && self.file_size == info.file_size
            && self.chunk_size == info.chunk_size
            && self.total_chunks == info.total_chunks
    }
}

/// Descriptor + progress, persisted as one JSON file named by content hash.
/// Unknown top-level fields survive a rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(flatten)]
    pub descriptor: TransferDescriptor,
    pub completed_chunks: ChunkSet,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stalled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl TransferRecord {
    pub fn new(descriptor: TransferDescriptor) -> Self {
        Self {
            descriptor,
            completed_chunks: ChunkSet::new(),
            updated_at: now_secs(),
            stalled: false,
            extra: Map::new(),
        }
    }

    /// Every index completed and the descriptor arithmetic consistent.
    pub fn validate(&self) -> Result<(), RecordError> {
        let d = &self.descriptor;
        if d.file_hash.is_empty() {
            return Err(RecordError::Invalid("empty file_hash"));
        }
        if d.chunk_size == 0 {
            return Err(RecordError::Invalid("zero chunk_size"));
        }
        if d.total_chunks != chunk::total_chunks(d.file_size, d.chunk_size) {
            return Err(RecordError::Invalid("total_chunks does not match size"));
        }
        if let Some(max) = self.completed_chunks.iter().max() {
            if max >= d.total_chunks {
                return Err(RecordError::Invalid("completed index out of range"));
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks.is_complete(self.descriptor.total_chunks)
    }

    /// Bytes covered by the completed set, accounting for the short last
    /// chunk.
    pub fn bytes_done(&self) -> u64 {
        let d = &self.descriptor;
        self.completed_chunks
            .iter()
            .map(|i| chunk::chunk_len(i, d.file_size, d.chunk_size) as u64)
            .sum()
    }

    /// Record one completed chunk; refreshes `updated_at`. Returns true if
    /// the index was new.
    pub fn mark_complete(&mut self, index: u32) -> bool {
        let new = self.completed_chunks.insert(index);
        if new {
            self.updated_at = now_secs();
        }
        new
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid record: {0}")]
    Invalid(&'static str),
}
