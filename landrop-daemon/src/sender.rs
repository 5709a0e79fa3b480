//! Sending half of a transfer: stop-and-wait chunk streaming.
//!
//! The session loop owns this state machine and drives it with frames,
//! command edges, and the ACK deadline. At most one chunk is in flight;
//! the receiver's FILE_RESUME overrides local progress wholesale.

use std::io::SeekFrom;
use std::sync::Arc;

use landrop_core::chunk::{self, ChunkSet};
use landrop_core::integrity;
use landrop_core::manager::TransferHandle;
use landrop_core::protocol::{FileRef, Message};
use landrop_core::record::{TransferDescriptor, TransferRole};
use landrop_core::store::StoreError;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::Shared;
use crate::events::Event;
use crate::jobs::FileJob;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// ACK retries exhausted; recoverable via reconnect.
    #[error("no acknowledgement for chunk {index} after {retries} retries")]
    AckTimeout { index: u32, retries: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    AwaitInfoAck,
    Streaming,
    AwaitCompleteAck,
    Done,
}

/// One in-flight sending transfer.
pub struct ActiveSend {
    pub job: FileJob,
    pub handle: TransferHandle,
    pub descriptor: TransferDescriptor,
    file: tokio::fs::File,
    phase: SendPhase,
    /// Chunk index currently on the wire, if any.
    awaiting: Option<u32>,
    retries: u32,
    /// Bytes already credited to the owning job for this file.
    counted_bytes: u64,
    pub deadline: Instant,
}

impl ActiveSend {
    /// Hash the source, open (or resume) the sending record, and produce
    /// the FILE_INFO announcement.
    pub async fn start(
        shared: &Arc<Shared>,
        peer_device_id: &str,
        job: FileJob,
    ) -> Result<(Self, Message), SendError> {
        let path = job.path.clone();
        let file_hash = tokio::task::spawn_blocking(move || integrity::hash_file(&path))
            .await
            .map_err(|e| std::io::Error::other(e))??;
        let descriptor = TransferDescriptor::new(
            file_hash,
            job.file_name.clone(),
            job.file_size,
            shared.config.chunk_size,
            peer_device_id.to_string(),
            TransferRole::Sending,
        );
        let (handle, resumed) = shared.transfers.lock().await.open(descriptor.clone())?;
        if resumed {
            debug!(
                file = %descriptor.file_name,
                "resuming send from local progress"
            );
        }
        let file = tokio::fs::File::open(&job.path).await?;
        shared.emit(Event::TransferStarted {
            peer_device_id: peer_device_id.to_string(),
            file_hash: descriptor.file_hash.clone(),
            file_name: descriptor.file_name.clone(),
            bytes_total: descriptor.file_size,
            role: TransferRole::Sending,
        });
        let info = Message::FileInfo(descriptor.to_info());
        let mut send = Self {
            job,
            handle,
            descriptor,
            file,
            phase: SendPhase::AwaitInfoAck,
            awaiting: None,
            retries: 0,
            counted_bytes: 0,
            deadline: Instant::now() + shared.config.ack_timeout(),
        };
        send.credit_job_bytes(shared).await;
        Ok((send, info))
    }

    pub fn is_done(&self) -> bool {
        self.phase == SendPhase::Done
    }

    pub fn file_hash(&self) -> &str {
        &self.descriptor.file_hash
    }

    /// Plain FILE_INFO_ACK: continue from whatever we already have on disk.
    pub async fn on_info_ack(&mut self, shared: &Arc<Shared>) -> Result<Vec<Message>, SendError> {
        if self.phase != SendPhase::AwaitInfoAck {
            return Ok(vec![]);
        }
        self.phase = SendPhase::Streaming;
        self.advance(shared).await
    }

    /// FILE_RESUME: the receiver is authoritative; adopt its completed set.
    pub async fn on_resume(
        &mut self,
        shared: &Arc<Shared>,
        runs: &[(u32, u32)],
    ) -> Result<Vec<Message>, SendError> {
        let adopted = ChunkSet::from_runs(runs);
        info!(
            file = %self.descriptor.file_name,
            chunks = adopted.len(),
            "receiver reports existing progress"
        );
        {
            let mut transfers = shared.transfers.lock().await;
            transfers.adopt_completed(self.handle, adopted)?;
        }
        self.credit_job_bytes(shared).await;
        self.emit_progress(shared).await;
        self.phase = SendPhase::Streaming;
        self.advance(shared).await
    }

    /// FILE_ACK for a single chunk.
    pub async fn on_ack(
        &mut self,
        shared: &Arc<Shared>,
        index: u32,
    ) -> Result<Vec<Message>, SendError> {
        if self.awaiting != Some(index) {
            // Late duplicate; the bookkeeping already converged.
            return Ok(vec![]);
        }
        self.awaiting = None;
        shared
            .transfers
            .lock()
            .await
            .mark_complete(self.handle, index)?;
        self.credit_job_bytes(shared).await;
        self.emit_progress(shared).await;
        self.advance(shared).await
    }

    /// FILE_ACK_BATCH: same as a run of single acks.
    pub async fn on_ack_batch(
        &mut self,
        shared: &Arc<Shared>,
        runs: &[(u32, u32)],
    ) -> Result<Vec<Message>, SendError> {
        let acked = ChunkSet::from_runs(runs);
        {
            let mut transfers = shared.transfers.lock().await;
            for index in acked.iter() {
                transfers.mark_complete(self.handle, index)?;
            }
        }
        self.credit_job_bytes(shared).await;
        self.emit_progress(shared).await;
        if let Some(waiting) = self.awaiting {
            if acked.contains(waiting) {
                self.awaiting = None;
                return self.advance(shared).await;
            }
        }
        Ok(vec![])
    }

    /// FILE_COMPLETE_ACK: the receiver verified and renamed; we are done.
    pub async fn on_complete_ack(&mut self, shared: &Arc<Shared>) -> Result<(), SendError> {
        if self.phase != SendPhase::AwaitCompleteAck {
            return Ok(());
        }
        shared.transfers.lock().await.finish(self.handle)?;
        self.phase = SendPhase::Done;
        shared.jobs.lock().await.file_done(self.job.parent);
        info!(file = %self.descriptor.file_name, "send complete");
        shared.emit(Event::TransferComplete {
            file_hash: self.descriptor.file_hash.clone(),
            file_name: self.descriptor.file_name.clone(),
            path: None,
        });
        Ok(())
    }

    /// The ACK deadline passed. Resend the outstanding frame until retries
    /// run out, then raise a recoverable error.
    pub async fn on_deadline(&mut self, shared: &Arc<Shared>) -> Result<Vec<Message>, SendError> {
        self.retries += 1;
        if self.retries > shared.config.max_retry {
            return Err(SendError::AckTimeout {
                index: self.awaiting.unwrap_or(0),
                retries: self.retries - 1,
            });
        }
        self.deadline = Instant::now() + shared.config.ack_timeout();
        match (self.phase, self.awaiting) {
            (SendPhase::Streaming, Some(index)) => {
                debug!(index, retry = self.retries, "resending chunk");
                Ok(vec![self.data_frame(index).await?])
            }
            (SendPhase::AwaitInfoAck, _) => {
                Ok(vec![Message::FileInfo(self.descriptor.to_info())])
            }
            (SendPhase::AwaitCompleteAck, _) => Ok(vec![Message::FileComplete(FileRef {
                file_hash: self.descriptor.file_hash.clone(),
            })]),
            _ => Ok(vec![]),
        }
    }

    /// Send the next missing chunk, or FILE_COMPLETE when none remain.
    async fn advance(&mut self, shared: &Arc<Shared>) -> Result<Vec<Message>, SendError> {
        let completed = shared.transfers.lock().await.completed_set(self.handle);
        let next = completed
            .missing(self.descriptor.total_chunks)
            .into_iter()
            .next();
        self.retries = 0;
        self.deadline = Instant::now() + shared.config.ack_timeout();
        match next {
            Some(index) => {
                self.awaiting = Some(index);
                Ok(vec![self.data_frame(index).await?])
            }
            None => {
                self.awaiting = None;
                self.phase = SendPhase::AwaitCompleteAck;
                Ok(vec![Message::FileComplete(FileRef {
                    file_hash: self.descriptor.file_hash.clone(),
                })])
            }
        }
    }

    async fn data_frame(&mut self, index: u32) -> Result<Message, SendError> {
        let len =
            chunk::chunk_len(index, self.descriptor.file_size, self.descriptor.chunk_size) as usize;
        let offset = chunk::chunk_offset(index, self.descriptor.chunk_size);
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        self.file.read_exact(&mut data).await?;
        Ok(Message::FileData { index, data })
    }

    /// Credit the owning job with bytes the record gained since last time.
    /// Resume and batch acks can jump progress by several chunks at once.
    async fn credit_job_bytes(&mut self, shared: &Arc<Shared>) {
        let Some(rec) = shared.transfers.lock().await.snapshot(self.handle) else {
            return;
        };
        let done = rec.bytes_done();
        let delta = done.saturating_sub(self.counted_bytes);
        if delta > 0 {
            shared.jobs.lock().await.add_bytes(self.job.parent, delta);
            self.counted_bytes = done;
        }
    }

    async fn emit_progress(&self, shared: &Arc<Shared>) {
        if let Some(rec) = shared.transfers.lock().await.snapshot(self.handle) {
            shared.emit(Event::TransferProgress {
                file_hash: rec.descriptor.file_hash.clone(),
                bytes_done: rec.bytes_done(),
                bytes_total: rec.descriptor.file_size,
            });
        }
    }

    /// Cancel or session teardown: flush progress, keep the record.
    pub async fn suspend(&self, shared: &Arc<Shared>) -> Result<(), StoreError> {
        let mut transfers = shared.transfers.lock().await;
        transfers.flush(self.handle)?;
        transfers.close(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_shared;

    async fn write_source(shared: &Arc<Shared>, name: &str, data: &[u8]) -> FileJob {
        let path = shared.config.download_dir.join(name);
        tokio::fs::write(&path, data).await.unwrap();
        FileJob {
            parent: uuid::Uuid::new_v4(),
            path,
            file_name: name.to_string(),
            file_size: data.len() as u64,
        }
    }

    fn data_of(msg: &Message) -> (u32, Vec<u8>) {
        match msg {
            Message::FileData { index, data } => (*index, data.clone()),
            other => panic!("expected FileData, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_all_chunks_in_order() {
        let (shared, _guard) = test_shared().await;
        let body: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let job = write_source(&shared, "seq.bin", &body).await;
        let (mut send, info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        // chunk_size is 1024 in the test config: 3 chunks, last one short.
        match info {
            Message::FileInfo(i) => assert_eq!(i.total_chunks, 3),
            other => panic!("expected FileInfo, got {other:?}"),
        }
        let mut collected = Vec::new();
        let mut out = send.on_info_ack(&shared).await.unwrap();
        for _ in 0..3 {
            let (index, data) = data_of(&out[0]);
            collected.extend_from_slice(&data);
            out = send.on_ack(&shared, index).await.unwrap();
        }
        assert!(matches!(out[0], Message::FileComplete(_)));
        assert_eq!(collected, body);
        send.on_complete_ack(&shared).await.unwrap();
        assert!(send.is_done());
        // Terminal completion deletes the sending record.
        assert!(shared
            .transfers
            .lock()
            .await
            .store()
            .load_record(TransferRole::Sending, send.file_hash())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn resume_skips_receiver_confirmed_chunks() {
        let (shared, _guard) = test_shared().await;
        let body = vec![7u8; 10 * 1024];
        let job = write_source(&shared, "resume.bin", &body).await;
        let (mut send, _info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        // Receiver already has chunks 0..=3.
        let out = send.on_resume(&shared, &[(0, 4)]).await.unwrap();
        let (index, _) = data_of(&out[0]);
        assert_eq!(index, 4);
        let mut seen = vec![index];
        let mut out = send.on_ack(&shared, index).await.unwrap();
        while let Message::FileData { index, .. } = &out[0] {
            seen.push(*index);
            out = send.on_ack(&shared, *index).await.unwrap();
        }
        assert_eq!(seen, vec![4, 5, 6, 7, 8, 9]);
        assert!(matches!(out[0], Message::FileComplete(_)));
    }

    #[tokio::test]
    async fn zero_byte_file_sends_no_data() {
        let (shared, _guard) = test_shared().await;
        let job = write_source(&shared, "empty.txt", b"").await;
        let (mut send, info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        match info {
            Message::FileInfo(i) => {
                assert_eq!(i.total_chunks, 0);
                assert_eq!(i.file_size, 0);
            }
            other => panic!("expected FileInfo, got {other:?}"),
        }
        let out = send.on_info_ack(&shared).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Message::FileComplete(_)));
    }

    #[tokio::test]
    async fn deadline_retries_then_fails() {
        let (shared, _guard) = test_shared().await;
        let job = write_source(&shared, "slow.bin", &[1u8; 2048]).await;
        let (mut send, _info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        let out = send.on_info_ack(&shared).await.unwrap();
        let (index, first) = data_of(&out[0]);
        // max_retry is 3 in the test config: three resends, then the error.
        for _ in 0..shared.config.max_retry {
            let out = send.on_deadline(&shared).await.unwrap();
            let (i, d) = data_of(&out[0]);
            assert_eq!(i, index);
            assert_eq!(d, first);
        }
        assert!(matches!(
            send.on_deadline(&shared).await,
            Err(SendError::AckTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn ack_batch_advances_past_waiting_chunk() {
        let (shared, _guard) = test_shared().await;
        let job = write_source(&shared, "batch.bin", &[9u8; 4096]).await;
        let (mut send, _info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        let out = send.on_info_ack(&shared).await.unwrap();
        let (index, _) = data_of(&out[0]);
        assert_eq!(index, 0);
        // Batch covering chunks 0..=2 of four.
        let out = send.on_ack_batch(&shared, &[(0, 3)]).await.unwrap();
        let (index, _) = data_of(&out[0]);
        assert_eq!(index, 3);
    }

    #[tokio::test]
    async fn duplicate_ack_is_ignored() {
        let (shared, _guard) = test_shared().await;
        let job = write_source(&shared, "dup.bin", &[3u8; 2048]).await;
        let (mut send, _info) = ActiveSend::start(&shared, "B-u-2222", job).await.unwrap();
        let _ = send.on_info_ack(&shared).await.unwrap();
        let out = send.on_ack(&shared, 0).await.unwrap();
        assert!(matches!(out[0], Message::FileData { index: 1, .. }));
        // A replayed ack for 0 must not advance or resend anything.
        let out = send.on_ack(&shared, 0).await.unwrap();
        assert!(out.is_empty());
    }
}
