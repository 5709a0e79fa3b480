//! Receiving half of a transfer: sparse writes, idempotent acks, final
//! verification and rename.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use landrop_core::chunk;
use landrop_core::integrity;
use landrop_core::manager::TransferHandle;
use landrop_core::protocol::{
    ChunkAck, ErrorFrame, ErrorKind, FileInfo, FileRef, FileResume, Message,
};
use landrop_core::record::{TransferDescriptor, TransferRole};
use landrop_core::store::StoreError;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::Shared;
use crate::events::{Event, FailureKind};

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("target i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The peer broke the protocol; session-fatal, no reconnect.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// What finishing a transfer produced.
pub enum CompleteOutcome {
    /// Hash verified; the file landed at `path`.
    Verified { path: PathBuf, reply: Message },
    /// Hash mismatch; record and `.part` are gone, the peer gets an ERROR.
    Rejected { reply: Message },
}

/// One in-flight receiving transfer.
pub struct ActiveReceive {
    pub handle: TransferHandle,
    pub descriptor: TransferDescriptor,
    part: tokio::fs::File,
    part_path: PathBuf,
    /// Throttles the progress event stream.
    last_progress: Instant,
}

impl ActiveReceive {
    /// Handle FILE_INFO: adopt or discard stored progress, pre-allocate the
    /// `.part` file, and build the ack (plus FILE_RESUME when progress
    /// exists).
    pub async fn start(
        shared: &Arc<Shared>,
        peer_device_id: &str,
        info: &FileInfo,
    ) -> Result<(Self, Vec<Message>), RecvError> {
        if info.file_size > 0 && info.chunk_size == 0 {
            return Err(RecvError::Protocol("zero chunk_size".into()));
        }
        if info.total_chunks != chunk::total_chunks(info.file_size, info.chunk_size.max(1)) {
            return Err(RecvError::Protocol("total_chunks mismatch".into()));
        }
        let descriptor = TransferDescriptor::from_info(info, peer_device_id.to_string());
        let part_path = {
            let transfers = shared.transfers.lock().await;
            transfers.store().part_path(&info.file_hash)
        };
        let part_existed = part_path.exists();
        let (handle, resumed) = shared.transfers.lock().await.open(descriptor.clone())?;
        if resumed && !part_existed {
            // Progress without data is no progress at all.
            warn!(file = %info.file_name, "record found but .part missing; starting over");
            shared
                .transfers
                .lock()
                .await
                .adopt_completed(handle, Default::default())?;
        }
        let part = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)
            .await?;
        part.set_len(info.file_size).await?;

        let completed = shared.transfers.lock().await.completed_set(handle);
        let mut replies = vec![Message::FileInfoAck(FileRef {
            file_hash: info.file_hash.clone(),
        })];
        if !completed.is_empty() {
            info!(
                file = %info.file_name,
                chunks = completed.len(),
                "resuming receive from stored progress"
            );
            replies.push(Message::FileResume(FileResume {
                file_hash: info.file_hash.clone(),
                completed: completed.to_runs(),
            }));
        }
        shared.emit(Event::TransferStarted {
            peer_device_id: peer_device_id.to_string(),
            file_hash: info.file_hash.clone(),
            file_name: info.file_name.clone(),
            bytes_total: info.file_size,
            role: TransferRole::Receiving,
        });
        Ok((
            Self {
                handle,
                descriptor,
                part,
                part_path,
                last_progress: Instant::now(),
            },
            replies,
        ))
    }

    pub fn file_hash(&self) -> &str {
        &self.descriptor.file_hash
    }

    /// Handle FILE_DATA. Duplicates are discarded but still acked so the
    /// sender's bookkeeping converges.
    pub async fn on_data(
        &mut self,
        shared: &Arc<Shared>,
        index: u32,
        data: &[u8],
    ) -> Result<Vec<Message>, RecvError> {
        let d = &self.descriptor;
        if index >= d.total_chunks {
            return Err(RecvError::Protocol(format!(
                "chunk index {index} out of range"
            )));
        }
        let expected = chunk::chunk_len(index, d.file_size, d.chunk_size) as usize;
        if data.len() != expected {
            return Err(RecvError::Protocol(format!(
                "chunk {index} length {} != expected {expected}",
                data.len()
            )));
        }
        let ack = Message::FileAck(ChunkAck { index });
        if shared
            .transfers
            .lock()
            .await
            .completed_set(self.handle)
            .contains(index)
        {
            return Ok(vec![ack]);
        }
        self.part
            .seek(SeekFrom::Start(chunk::chunk_offset(index, d.chunk_size)))
            .await?;
        self.part.write_all(data).await?;
        shared
            .transfers
            .lock()
            .await
            .mark_complete(self.handle, index)?;
        if self.last_progress.elapsed().as_millis() >= 200 {
            self.last_progress = Instant::now();
            if let Some(rec) = shared.transfers.lock().await.snapshot(self.handle) {
                shared.emit(Event::TransferProgress {
                    file_hash: rec.descriptor.file_hash.clone(),
                    bytes_done: rec.bytes_done(),
                    bytes_total: rec.descriptor.file_size,
                });
            }
        }
        Ok(vec![ack])
    }

    /// Handle FILE_COMPLETE: verify the reassembled content, rename into
    /// the download directory, drop the record.
    pub async fn on_complete(self, shared: &Arc<Shared>) -> Result<CompleteOutcome, RecvError> {
        let complete = shared
            .transfers
            .lock()
            .await
            .completed_set(self.handle)
            .is_complete(self.descriptor.total_chunks);
        if !complete {
            return Err(RecvError::Protocol(
                "FILE_COMPLETE before all chunks arrived".into(),
            ));
        }
        self.part.sync_all().await?;
        drop(self.part);

        let part_path = self.part_path.clone();
        let actual = tokio::task::spawn_blocking(move || integrity::hash_file(&part_path))
            .await
            .map_err(std::io::Error::other)??;
        if actual != self.descriptor.file_hash {
            warn!(file = %self.descriptor.file_name, "content hash mismatch, discarding");
            shared.transfers.lock().await.finish(self.handle)?;
            tokio::fs::remove_file(&self.part_path).await.ok();
            shared.emit(Event::TransferFailed {
                file_hash: Some(self.descriptor.file_hash.clone()),
                kind: FailureKind::Integrity,
                detail: "content hash mismatch".into(),
            });
            return Ok(CompleteOutcome::Rejected {
                reply: Message::Error(ErrorFrame {
                    kind: ErrorKind::HashMismatch,
                    detail: "content hash mismatch".into(),
                }),
            });
        }

        let target = final_target(&shared.config.download_dir, &self.descriptor.file_name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = unique_target(target);
        tokio::fs::rename(&self.part_path, &target).await?;
        shared.transfers.lock().await.finish(self.handle)?;
        info!(file = %self.descriptor.file_name, path = %target.display(), "receive complete");
        shared.emit(Event::TransferComplete {
            file_hash: self.descriptor.file_hash.clone(),
            file_name: self.descriptor.file_name.clone(),
            path: Some(target.clone()),
        });
        Ok(CompleteOutcome::Verified {
            path: target,
            reply: Message::FileCompleteAck(FileRef {
                file_hash: self.descriptor.file_hash.clone(),
            }),
        })
    }

    /// Session teardown: flush progress and release the handle; record and
    /// `.part` stay for the next session.
    pub async fn suspend(&self, shared: &Arc<Shared>) -> Result<(), StoreError> {
        let mut transfers = shared.transfers.lock().await;
        transfers.flush(self.handle)?;
        transfers.close(self.handle)
    }
}

/// Map an announced file name onto the download dir, dropping anything that
/// would escape it.
fn final_target(download_dir: &Path, file_name: &str) -> PathBuf {
    let mut out = download_dir.to_path_buf();
    let mut pushed = false;
    for part in file_name.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        out.push(part);
        pushed = true;
    }
    if !pushed {
        out.push("unnamed");
    }
    out
}

/// Avoid clobbering an existing file: `name.ext` becomes `name (1).ext`.
fn unique_target(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for n in 1.. {
        let name = match &ext {
            Some(e) => format!("{stem} ({n}).{e}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_shared;

    fn info_for(data: &[u8], name: &str, chunk_size: u32) -> FileInfo {
        FileInfo {
            file_hash: integrity::hash_bytes(data),
            file_name: name.into(),
            file_size: data.len() as u64,
            chunk_size,
            total_chunks: chunk::total_chunks(data.len() as u64, chunk_size),
        }
    }

    fn chunks_of(data: &[u8], chunk_size: u32) -> Vec<(u32, Vec<u8>)> {
        data.chunks(chunk_size as usize)
            .enumerate()
            .map(|(i, c)| (i as u32, c.to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn receives_and_renames() {
        let (shared, _guard) = test_shared().await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let info = info_for(&data, "blob.bin", 1024);
        let (mut recv, replies) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        for (index, chunk) in chunks_of(&data, 1024) {
            let acks = recv.on_data(&shared, index, &chunk).await.unwrap();
            assert!(matches!(acks[0], Message::FileAck(ChunkAck { index: i }) if i == index));
        }
        let outcome = recv.on_complete(&shared).await.unwrap();
        let path = match outcome {
            CompleteOutcome::Verified { path, reply } => {
                assert!(matches!(reply, Message::FileCompleteAck(_)));
                path
            }
            CompleteOutcome::Rejected { .. } => panic!("hash should verify"),
        };
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        // Record and .part are gone after completion.
        let store = shared.transfers.lock().await.store().clone();
        assert!(store
            .load_record(TransferRole::Receiving, &info.file_hash)
            .unwrap()
            .is_none());
        assert!(!store.part_path(&info.file_hash).exists());
    }

    #[tokio::test]
    async fn duplicate_chunk_writes_once_acks_twice() {
        let (shared, _guard) = test_shared().await;
        let data = vec![0xabu8; 3000];
        let info = info_for(&data, "dup.bin", 1024);
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        let chunks = chunks_of(&data, 1024);
        let (index, payload) = chunks[1].clone();
        let a1 = recv.on_data(&shared, index, &payload).await.unwrap();
        let a2 = recv.on_data(&shared, index, &payload).await.unwrap();
        assert!(matches!(a1[0], Message::FileAck(_)));
        assert!(matches!(a2[0], Message::FileAck(_)));
        let set = shared.transfers.lock().await.completed_set(recv.handle);
        assert_eq!(set.len(), 1);
        // Finish normally; duplicates must not corrupt the content.
        for (i, c) in chunks {
            if i != index {
                recv.on_data(&shared, i, &c).await.unwrap();
            }
        }
        assert!(matches!(
            recv.on_complete(&shared).await.unwrap(),
            CompleteOutcome::Verified { .. }
        ));
    }

    #[tokio::test]
    async fn rejects_bad_index_and_length()  {
        let (shared, _guard) = test_shared().await;
        let data = vec![1u8; 2048];
        let info = info_for(&data, "bad.bin", 1024);
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        assert!(matches!(
            recv.on_data(&shared, 7, &data[..1024]).await,
            Err(RecvError::Protocol(_))
        ));
        assert!(matches!(
            recv.on_data(&shared, 0, &data[..100]).await,
            Err(RecvError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn resume_reports_existing_runs() {
        let (shared, _guard) = test_shared().await;
        let data: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 256) as u8).collect();
        let info = info_for(&data, "resume.bin", 1024);
        // First session: receive chunks 0..=3, then drop mid-transfer.
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        for (index, chunk) in chunks_of(&data, 1024).into_iter().take(4) {
            recv.on_data(&shared, index, &chunk).await.unwrap();
        }
        recv.suspend(&shared).await.unwrap();
        drop(recv);
        // Second session: same announcement resumes with a FILE_RESUME.
        let (mut recv, replies) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            Message::FileResume(r) => assert_eq!(r.completed, vec![(0, 4)]),
            other => panic!("expected FileResume, got {other:?}"),
        }
        for (index, chunk) in chunks_of(&data, 1024).into_iter().skip(4) {
            recv.on_data(&shared, index, &chunk).await.unwrap();
        }
        assert!(matches!(
            recv.on_complete(&shared).await.unwrap(),
            CompleteOutcome::Verified { .. }
        ));
    }

    #[tokio::test]
    async fn mismatched_announcement_discards_progress() {
        let (shared, _guard) = test_shared().await;
        let data = vec![5u8; 4096];
        let info = info_for(&data, "switch.bin", 1024);
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        recv.on_data(&shared, 0, &data[..1024]).await.unwrap();
        recv.suspend(&shared).await.unwrap();
        drop(recv);
        // Same hash, different chunking: stored progress must be discarded.
        let mut changed = info.clone();
        changed.chunk_size = 2048;
        changed.total_chunks = 2;
        let (_recv, replies) = ActiveReceive::start(&shared, "A-u-1111", &changed)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1, "no FILE_RESUME for discarded progress");
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_everything() {
        let (shared, _guard) = test_shared().await;
        let data = vec![9u8; 3000];
        let info = info_for(&data, "tampered.bin", 1024);
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        let mut chunks = chunks_of(&data, 1024);
        // Flip one bit in the middle chunk before it is written.
        chunks[1].1[10] ^= 0x01;
        for (index, chunk) in chunks {
            recv.on_data(&shared, index, &chunk).await.unwrap();
        }
        let store = shared.transfers.lock().await.store().clone();
        let outcome = recv.on_complete(&shared).await.unwrap();
        match outcome {
            CompleteOutcome::Rejected { reply } => match reply {
                Message::Error(e) => assert_eq!(e.kind, ErrorKind::HashMismatch),
                other => panic!("expected Error frame, got {other:?}"),
            },
            CompleteOutcome::Verified { .. } => panic!("hash must not verify"),
        }
        assert!(store
            .load_record(TransferRole::Receiving, &info.file_hash)
            .unwrap()
            .is_none());
        assert!(!store.part_path(&info.file_hash).exists());
    }

    #[tokio::test]
    async fn zero_byte_file_completes_without_data() {
        let (shared, _guard) = test_shared().await;
        let info = info_for(b"", "empty.txt", 65536);
        assert_eq!(info.total_chunks, 0);
        let (recv, replies) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        let outcome = recv.on_complete(&shared).await.unwrap();
        match outcome {
            CompleteOutcome::Verified { path, .. } => {
                assert_eq!(tokio::fs::read(&path).await.unwrap(), b"");
            }
            CompleteOutcome::Rejected { .. } => panic!("empty hash should verify"),
        }
    }

    #[tokio::test]
    async fn collision_gets_numbered_suffix() {
        let (shared, _guard) = test_shared().await;
        let existing = shared.config.download_dir.join("hello.txt");
        tokio::fs::write(&existing, b"already here").await.unwrap();
        let data = b"new content".to_vec();
        let info = info_for(&data, "hello.txt", 1024);
        let (mut recv, _) = ActiveReceive::start(&shared, "A-u-1111", &info)
            .await
            .unwrap();
        recv.on_data(&shared, 0, &data).await.unwrap();
        let outcome = recv.on_complete(&shared).await.unwrap();
        match outcome {
            CompleteOutcome::Verified { path, .. } => {
                assert_eq!(path.file_name().unwrap(), "hello (1).txt");
                assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
            }
            CompleteOutcome::Rejected { .. } => panic!("hash should verify"),
        }
        assert_eq!(
            tokio::fs::read(&existing).await.unwrap(),
            b"already here"
        );
    }

    #[test]
    fn target_paths_cannot_escape() {
        let base = Path::new("/downloads");
        assert_eq!(
            final_target(base, "../../etc/passwd"),
            Path::new("/downloads/etc/passwd")
        );
        assert_eq!(
            final_target(base, "photos/a/1.jpg"),
            Path::new("/downloads/photos/a/1.jpg")
        );
        assert_eq!(final_target(base, "//"), Path::new("/downloads/unnamed"));
    }
}
