//! Session lifecycle: handshake, pairing, and the Active frame loop.
//!
//! One task owns each connection. A reader task turns the socket into a
//! frame channel; the session loop multiplexes frames, engine commands,
//! heartbeats, and the sender's ACK deadline, writing replies inline.
//! States: Init -> Handshake -> (Pairing | Trusted) -> Active -> Closing.
//! Transport failures hand pending work to the reconnect supervisor;
//! protocol and pairing failures close without reconnecting.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use landrop_core::protocol::{
    ErrorFrame, ErrorKind, Hello, Message, PairFail, PairReq, PROTOCOL_VERSION,
};
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::events::{Event, FailureKind};
use crate::frames::{self, FrameIoError};
use crate::jobs::{FileJob, JobState};
use crate::receiver::{ActiveReceive, CompleteOutcome, RecvError};
use crate::reconnect::ReconnectRequest;
use crate::sender::{ActiveSend, SendError};

const PAIRING_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_PAIR_ATTEMPTS: u32 = 3;

/// Commands the engine can push into a live session.
#[derive(Debug)]
pub enum SessionCmd {
    QueueSend(Vec<FileJob>),
    SubmitPairCode(String),
    Close,
}

/// Engine-side handle to a session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub peer_device_id: String,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionHandle {
    pub fn queue_send(&self, jobs: Vec<FileJob>) -> bool {
        self.cmd_tx.send(SessionCmd::QueueSend(jobs)).is_ok()
    }

    pub fn submit_pair_code(&self, code: String) -> bool {
        self.cmd_tx.send(SessionCmd::SubmitPairCode(code)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Close);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectRole {
    Initiator,
    Acceptor,
}

/// Why the session loop ended.
enum Teardown {
    /// Peer said BYE or the engine asked us to close.
    Graceful,
    /// Transport died; pending work may reconnect.
    Transport(String),
    /// Peer misbehaved or pairing failed; never reconnect.
    Fatal,
}

/// Accept side of the TCP listener.
pub async fn run_listener(shared: Arc<Shared>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let shared = shared.clone();
        tokio::spawn(async move {
            run_accepted(shared, stream, addr).await;
        });
    }
}

pub async fn run_accepted(shared: Arc<Shared>, stream: TcpStream, peer_addr: SocketAddr) {
    run_session(shared, stream, peer_addr, ConnectRole::Acceptor, Vec::new()).await;
}

pub async fn run_initiated(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    jobs: Vec<FileJob>,
) {
    run_session(shared, stream, peer_addr, ConnectRole::Initiator, jobs).await;
}

async fn run_session(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    role: ConnectRole,
    initial_jobs: Vec<FileJob>,
) {
    let max_frame = shared.config.max_frame_len();
    let (read_half, mut writer) = stream.into_split();
    let mut frame_rx = spawn_reader(read_half, max_frame);

    // Both sides greet immediately; ordering does not matter.
    let hello = Message::Hello(Hello {
        device_id: shared.identity.device_id.clone(),
        hostname: shared.identity.hostname.clone(),
        protocol_version: PROTOCOL_VERSION,
    });
    if frames::write_frame(&mut writer, &hello, max_frame).await.is_err() {
        return;
    }
    let peer = match tokio::time::timeout(shared.config.heartbeat_timeout(), frame_rx.recv()).await
    {
        Ok(Some(Ok(Message::Hello(h)))) => h,
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
            let _ = send_error(&mut writer, max_frame, ErrorKind::Protocol, "expected HELLO").await;
            return;
        }
        _ => return,
    };
    if peer.protocol_version != PROTOCOL_VERSION {
        warn!(
            peer = %peer.device_id,
            theirs = peer.protocol_version,
            "protocol version mismatch"
        );
        let _ = send_error(&mut writer, max_frame, ErrorKind::Version, "version mismatch").await;
        return;
    }
    let peer_id = peer.device_id.clone();
    debug!(peer = %peer_id, addr = %peer_addr, ?role, "session handshake");

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    shared.sessions.lock().await.insert(
        peer_id.clone(),
        SessionHandle {
            peer_device_id: peer_id.clone(),
            cmd_tx,
        },
    );

    let mut queue: VecDeque<FileJob> = initial_jobs.into();
    let handshake = tokio::time::timeout(
        PAIRING_TIMEOUT,
        handshake_phase(
            &shared,
            &mut writer,
            &mut frame_rx,
            &mut cmd_rx,
            &mut queue,
            &peer,
            peer_addr,
            role,
            max_frame,
        ),
    )
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(teardown)) => {
            finish(&shared, &peer_id, teardown, None, None, queue, peer_addr).await;
            return;
        }
        Err(_) => {
            debug!(peer = %peer_id, "pairing timed out");
            finish(&shared, &peer_id, Teardown::Fatal, None, None, queue, peer_addr).await;
            return;
        }
    }
    // Trusted (or freshly paired): refresh the peer record's address.
    if let Err(e) = shared.trust.lock().await.touch(&peer_id, peer_addr.ip()) {
        warn!("trust record update failed: {e}");
    }
    info!(peer = %peer_id, addr = %peer_addr, "session active");

    let (teardown, send, recv, queue) = active_phase(
        &shared,
        &mut writer,
        &mut frame_rx,
        &mut cmd_rx,
        queue,
        &peer_id,
        max_frame,
    )
    .await;
    finish(&shared, &peer_id, teardown, send, recv, queue, peer_addr).await;
}

fn spawn_reader(
    mut read_half: OwnedReadHalf,
    max_frame: usize,
) -> mpsc::UnboundedReceiver<Result<Message, FrameIoError>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match frames::read_frame(&mut read_half, max_frame).await {
                Ok(msg) => {
                    if tx.send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

async fn send_error(
    writer: &mut OwnedWriteHalf,
    max_frame: usize,
    kind: ErrorKind,
    detail: &str,
) -> Result<(), FrameIoError> {
    frames::write_frame(
        writer,
        &Message::Error(ErrorFrame {
            kind,
            detail: detail.to_string(),
        }),
        max_frame,
    )
    .await
}

/// Drive the session from HELLO exchange to Active. `Ok(())` means both
/// sides acknowledged each other, by trust or by pairing.
#[allow(clippy::too_many_arguments)]
async fn handshake_phase(
    shared: &Arc<Shared>,
    writer: &mut OwnedWriteHalf,
    frame_rx: &mut mpsc::UnboundedReceiver<Result<Message, FrameIoError>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
    queue: &mut VecDeque<FileJob>,
    peer: &Hello,
    peer_addr: SocketAddr,
    role: ConnectRole,
    max_frame: usize,
) -> Result<(), Teardown> {
    let peer_id = &peer.device_id;
    let mut acked_sent = false;
    let mut acked_received = false;
    let mut attempts: u32 = 0;
    let mut our_code: Option<String> = None;

    if shared.trust.lock().await.is_trusted(peer_id) {
        frames::write_frame(writer, &Message::HelloAck, max_frame)
            .await
            .map_err(|e| Teardown::Transport(e.to_string()))?;
        acked_sent = true;
    } else {
        match role {
            ConnectRole::Acceptor => {
                // We display a code and wait for the initiator to submit it.
                let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
                shared
                    .pair_codes
                    .lock()
                    .await
                    .insert(peer_id.clone(), code.clone());
                shared.emit(Event::PairRequest {
                    peer_device_id: peer_id.clone(),
                    code: Some(code.clone()),
                });
                our_code = Some(code);
            }
            ConnectRole::Initiator => {
                // The UI must prompt for the acceptor's code. A late
                // HELLO_ACK (the peer trusts us) short-circuits this.
                shared.emit(Event::PairRequest {
                    peer_device_id: peer_id.clone(),
                    code: None,
                });
            }
        }
    }

    while !(acked_sent && acked_received) {
        tokio::select! {
            frame = frame_rx.recv() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(FrameIoError::Closed)) | None => {
                        return Err(Teardown::Transport("connection closed".into()))
                    }
                    Some(Err(FrameIoError::Io(e))) => {
                        return Err(Teardown::Transport(e.to_string()))
                    }
                    Some(Err(_)) => {
                        let _ = send_error(writer, max_frame, ErrorKind::Protocol, "bad frame").await;
                        return Err(Teardown::Fatal);
                    }
                };
                match msg {
                    Message::HelloAck => {
                        // The peer vouches for us; any pairing we set up is
                        // moot.
                        shared.pair_codes.lock().await.remove(peer_id);
                        acked_received = true;
                        if !acked_sent {
                            frames::write_frame(writer, &Message::HelloAck, max_frame)
                                .await
                                .map_err(|e| Teardown::Transport(e.to_string()))?;
                            acked_sent = true;
                        }
                    }
                    Message::PairReq(PairReq { code }) => {
                        let Some(expected) = our_code.as_deref() else {
                            let _ = send_error(writer, max_frame, ErrorKind::Protocol, "unexpected PAIR_REQ").await;
                            return Err(Teardown::Fatal);
                        };
                        if code == expected {
                            shared
                                .trust
                                .lock()
                                .await
                                .trust(peer_id, &peer.hostname, peer_addr.ip())
                                .map_err(|e| Teardown::Transport(e.to_string()))?;
                            shared.pair_codes.lock().await.remove(peer_id);
                            frames::write_frame(writer, &Message::PairOk, max_frame)
                                .await
                                .map_err(|e| Teardown::Transport(e.to_string()))?;
                            acked_sent = true;
                        } else {
                            attempts += 1;
                            if attempts >= MAX_PAIR_ATTEMPTS {
                                warn!(peer = %peer_id, "pairing attempts exhausted");
                                shared.pair_codes.lock().await.remove(peer_id);
                                let _ = send_error(
                                    writer,
                                    max_frame,
                                    ErrorKind::PairingRefused,
                                    "too many bad codes",
                                )
                                .await;
                                shared.emit(Event::TransferFailed {
                                    file_hash: None,
                                    kind: FailureKind::Pairing,
                                    detail: "pairing refused".into(),
                                });
                                return Err(Teardown::Fatal);
                            }
                            frames::write_frame(
                                writer,
                                &Message::PairFail(PairFail {
                                    attempts_left: MAX_PAIR_ATTEMPTS - attempts,
                                }),
                                max_frame,
                            )
                            .await
                            .map_err(|e| Teardown::Transport(e.to_string()))?;
                        }
                    }
                    Message::PairOk => {
                        shared
                            .trust
                            .lock()
                            .await
                            .trust(peer_id, &peer.hostname, peer_addr.ip())
                            .map_err(|e| Teardown::Transport(e.to_string()))?;
                        acked_received = true;
                        if !acked_sent {
                            frames::write_frame(writer, &Message::PairOk, max_frame)
                                .await
                                .map_err(|e| Teardown::Transport(e.to_string()))?;
                            acked_sent = true;
                        }
                    }
                    Message::PairFail(PairFail { attempts_left }) => {
                        shared.emit(Event::PairFailed {
                            peer_device_id: peer_id.clone(),
                            attempts_left,
                        });
                    }
                    Message::Error(e) => {
                        debug!(peer = %peer_id, kind = ?e.kind, "peer error during handshake");
                        return Err(Teardown::Fatal);
                    }
                    Message::Bye => return Err(Teardown::Graceful),
                    other => {
                        debug!(peer = %peer_id, tag = other.wire_tag(), "unexpected frame in handshake");
                        let _ = send_error(writer, max_frame, ErrorKind::Protocol, "unexpected frame").await;
                        return Err(Teardown::Fatal);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::SubmitPairCode(code)) => {
                        frames::write_frame(writer, &Message::PairReq(PairReq { code }), max_frame)
                            .await
                            .map_err(|e| Teardown::Transport(e.to_string()))?;
                    }
                    Some(SessionCmd::QueueSend(jobs)) => queue.extend(jobs),
                    Some(SessionCmd::Close) | None => {
                        let _ = frames::write_frame(writer, &Message::Bye, max_frame).await;
                        return Err(Teardown::Graceful);
                    }
                }
            }
        }
    }
    Ok(())
}

/// The Active state: transfers multiplexed with heartbeats.
async fn active_phase(
    shared: &Arc<Shared>,
    writer: &mut OwnedWriteHalf,
    frame_rx: &mut mpsc::UnboundedReceiver<Result<Message, FrameIoError>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
    mut queue: VecDeque<FileJob>,
    peer_id: &str,
    max_frame: usize,
) -> (
    Teardown,
    Option<ActiveSend>,
    Option<ActiveReceive>,
    VecDeque<FileJob>,
) {
    let mut send: Option<ActiveSend> = None;
    let mut recv: Option<ActiveReceive> = None;
    let mut last_frame = Instant::now();
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    macro_rules! write_or_fail {
        ($msg:expr) => {
            if let Err(e) = frames::write_frame(writer, $msg, max_frame).await {
                return (Teardown::Transport(e.to_string()), send, recv, queue);
            }
        };
    }

    loop {
        // FIFO: pull the next queued file once the wire is idle.
        while send.is_none() {
            let Some(job) = queue.pop_front() else { break };
            if shared.jobs.lock().await.is_cancelled(job.parent) {
                continue;
            }
            let parent = job.parent;
            shared.jobs.lock().await.set_state(parent, JobState::Active);
            match ActiveSend::start(shared, peer_id, job).await {
                Ok((s, info)) => {
                    write_or_fail!(&info);
                    send = Some(s);
                }
                Err(e) => {
                    warn!("cannot start send: {e}");
                    shared.jobs.lock().await.set_state(parent, JobState::Failed);
                    shared.emit(Event::TransferFailed {
                        file_hash: None,
                        kind: FailureKind::State,
                        detail: e.to_string(),
                    });
                }
            }
        }

        let send_deadline = send.as_ref().map(|s| s.deadline);
        tokio::select! {
            frame = frame_rx.recv() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(FrameIoError::Closed)) | None => {
                        return (Teardown::Transport("connection closed".into()), send, recv, queue);
                    }
                    Some(Err(FrameIoError::Io(e))) => {
                        return (Teardown::Transport(e.to_string()), send, recv, queue);
                    }
                    Some(Err(e)) => {
                        // Malformed frame: the peer is misbehaving (S4).
                        warn!(peer = %peer_id, "protocol violation: {e}");
                        let _ = send_error(writer, max_frame, ErrorKind::Protocol, &e.to_string()).await;
                        return (Teardown::Fatal, send, recv, queue);
                    }
                };
                last_frame = Instant::now();
                match msg {
                    Message::Heartbeat => {}
                    Message::Bye => {
                        debug!(peer = %peer_id, "peer closed the session");
                        return (Teardown::Graceful, send, recv, queue);
                    }
                    Message::FileInfo(info) => {
                        if let Some(active) = &recv {
                            if active.file_hash() != info.file_hash {
                                let _ = send_error(writer, max_frame, ErrorKind::Protocol,
                                    "FILE_INFO while another transfer is active").await;
                                return (Teardown::Fatal, send, recv, queue);
                            }
                            // Re-announcement of the same content: restart
                            // resume negotiation.
                            if let Some(active) = recv.take() {
                                let _ = active.suspend(shared).await;
                            }
                        }
                        match ActiveReceive::start(shared, peer_id, &info).await {
                            Ok((r, replies)) => {
                                for reply in &replies {
                                    write_or_fail!(reply);
                                }
                                recv = Some(r);
                            }
                            Err(RecvError::Protocol(detail)) => {
                                let _ = send_error(writer, max_frame, ErrorKind::Protocol, &detail).await;
                                return (Teardown::Fatal, send, recv, queue);
                            }
                            Err(e) => {
                                warn!("cannot start receive: {e}");
                                let _ = send_error(writer, max_frame, ErrorKind::State, &e.to_string()).await;
                            }
                        }
                    }
                    Message::FileData { index, data } => {
                        let Some(active) = recv.as_mut() else {
                            let _ = send_error(writer, max_frame, ErrorKind::Protocol, "FILE_DATA without FILE_INFO").await;
                            return (Teardown::Fatal, send, recv, queue);
                        };
                        match active.on_data(shared, index, &data).await {
                            Ok(replies) => {
                                for reply in &replies {
                                    write_or_fail!(reply);
                                }
                            }
                            Err(RecvError::Protocol(detail)) => {
                                let _ = send_error(writer, max_frame, ErrorKind::Protocol, &detail).await;
                                return (Teardown::Fatal, send, recv, queue);
                            }
                            Err(e) => {
                                // Disk trouble: fail this transfer, keep the
                                // record for a later retry.
                                warn!("receive write failed: {e}");
                                if let Some(active) = recv.take() {
                                    let _ = active.suspend(shared).await;
                                    shared.emit(Event::TransferFailed {
                                        file_hash: Some(active.file_hash().to_string()),
                                        kind: FailureKind::State,
                                        detail: e.to_string(),
                                    });
                                }
                                let _ = send_error(writer, max_frame, ErrorKind::State, &e.to_string()).await;
                            }
                        }
                    }
                    Message::FileComplete(fref) => {
                        let Some(active) = recv.take() else {
                            let _ = send_error(writer, max_frame, ErrorKind::Protocol, "FILE_COMPLETE without FILE_INFO").await;
                            return (Teardown::Fatal, send, recv, queue);
                        };
                        if active.file_hash() != fref.file_hash {
                            let _ = send_error(writer, max_frame, ErrorKind::Protocol, "FILE_COMPLETE hash mismatch").await;
                            return (Teardown::Fatal, send, recv, queue);
                        }
                        match active.on_complete(shared).await {
                            Ok(CompleteOutcome::Verified { reply, .. }) => write_or_fail!(&reply),
                            Ok(CompleteOutcome::Rejected { reply }) => write_or_fail!(&reply),
                            Err(RecvError::Protocol(detail)) => {
                                let _ = send_error(writer, max_frame, ErrorKind::Protocol, &detail).await;
                                return (Teardown::Fatal, send, recv, queue);
                            }
                            Err(e) => {
                                warn!("finalize failed: {e}");
                                let _ = send_error(writer, max_frame, ErrorKind::State, &e.to_string()).await;
                            }
                        }
                    }
                    Message::FileInfoAck(_) | Message::FileResume(_) | Message::FileAck(_)
                    | Message::FileAckBatch(_) | Message::FileCompleteAck(_) => {
                        match drive_sender(shared, &mut send, msg).await {
                            Ok(out) => {
                                // Cancellation takes effect once the
                                // in-flight chunk is acknowledged.
                                let cancelled = match send.as_ref() {
                                    Some(a) => {
                                        shared.jobs.lock().await.is_cancelled(a.job.parent)
                                    }
                                    None => false,
                                };
                                if cancelled {
                                    if let Some(active) = send.take() {
                                        debug!(file = %active.descriptor.file_name, "send cancelled");
                                        let _ = active.suspend(shared).await;
                                    }
                                } else {
                                    for reply in &out {
                                        write_or_fail!(reply);
                                    }
                                }
                            }
                            Err(SendError::AckTimeout { .. }) => unreachable!("acks never time out here"),
                            Err(e) => {
                                warn!("send failed: {e}");
                                if let Some(active) = send.take() {
                                    fail_send(shared, &active, &e).await;
                                }
                            }
                        }
                        // A finished sender unblocks the next queued file.
                        if send.as_ref().is_some_and(|s| s.is_done()) {
                            send = None;
                        }
                    }
                    Message::Error(e) => {
                        match e.kind {
                            ErrorKind::HashMismatch => {
                                // Receiver discarded everything; retrying
                                // from our record would resend nothing.
                                if let Some(active) = send.take() {
                                    warn!(file = %active.descriptor.file_name, "receiver reports hash mismatch");
                                    let _ = shared.transfers.lock().await.finish(active.handle);
                                    shared.jobs.lock().await.set_state(active.job.parent, JobState::Failed);
                                    shared.emit(Event::TransferFailed {
                                        file_hash: Some(active.file_hash().to_string()),
                                        kind: FailureKind::Integrity,
                                        detail: e.detail,
                                    });
                                }
                            }
                            ErrorKind::State => {
                                // The peer's disk is unhappy; keep our
                                // record and stop streaming this file.
                                if let Some(active) = send.take() {
                                    let _ = active.suspend(shared).await;
                                    shared.emit(Event::TransferFailed {
                                        file_hash: Some(active.file_hash().to_string()),
                                        kind: FailureKind::State,
                                        detail: e.detail,
                                    });
                                }
                            }
                            _ => {
                                warn!(peer = %peer_id, kind = ?e.kind, "peer error: {}", e.detail);
                                return (Teardown::Fatal, send, recv, queue);
                            }
                        }
                    }
                    other => {
                        let _ = send_error(writer, max_frame, ErrorKind::Protocol,
                            &format!("unexpected frame 0x{:02x}", other.wire_tag())).await;
                        return (Teardown::Fatal, send, recv, queue);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::QueueSend(jobs)) => queue.extend(jobs),
                    Some(SessionCmd::SubmitPairCode(_)) => {}
                    Some(SessionCmd::Close) | None => {
                        let _ = frames::write_frame(writer, &Message::Bye, max_frame).await;
                        return (Teardown::Graceful, send, recv, queue);
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_frame.elapsed() >= shared.config.heartbeat_timeout() {
                    warn!(peer = %peer_id, "heartbeat timeout");
                    return (Teardown::Transport("heartbeat timeout".into()), send, recv, queue);
                }
                write_or_fail!(&Message::Heartbeat);
            }
            _ = deadline_sleep(send_deadline) => {
                let mut cancelled = false;
                if let Some(active) = send.as_ref() {
                    cancelled = shared.jobs.lock().await.is_cancelled(active.job.parent);
                }
                if cancelled {
                    // User cancel takes effect at the ACK deadline boundary.
                    if let Some(active) = send.take() {
                        let _ = active.suspend(shared).await;
                    }
                    continue;
                }
                if let Some(active) = send.as_mut() {
                    match active.on_deadline(shared).await {
                        Ok(out) => {
                            for reply in &out {
                                write_or_fail!(reply);
                            }
                        }
                        Err(e @ SendError::AckTimeout { .. }) => {
                            warn!(peer = %peer_id, "{e}");
                            return (Teardown::Transport(e.to_string()), send, recv, queue);
                        }
                        Err(e) => {
                            warn!("send failed: {e}");
                            if let Some(active) = send.take() {
                                fail_send(shared, &active, &e).await;
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Route a sender-bound frame into the active send state machine.
async fn drive_sender(
    shared: &Arc<Shared>,
    send: &mut Option<ActiveSend>,
    msg: Message,
) -> Result<Vec<Message>, SendError> {
    let Some(active) = send.as_mut() else {
        // Stray ack after a failed transfer; harmless.
        return Ok(vec![]);
    };
    match msg {
        Message::FileInfoAck(_) => active.on_info_ack(shared).await,
        Message::FileResume(r) => active.on_resume(shared, &r.completed).await,
        Message::FileAck(a) => active.on_ack(shared, a.index).await,
        Message::FileAckBatch(b) => active.on_ack_batch(shared, &b.runs).await,
        Message::FileCompleteAck(_) => {
            active.on_complete_ack(shared).await?;
            Ok(vec![])
        }
        _ => Ok(vec![]),
    }
}

async fn fail_send(shared: &Arc<Shared>, active: &ActiveSend, err: &SendError) {
    let _ = active.suspend(shared).await;
    shared
        .jobs
        .lock()
        .await
        .set_state(active.job.parent, JobState::Failed);
    shared.emit(Event::TransferFailed {
        file_hash: Some(active.file_hash().to_string()),
        kind: FailureKind::State,
        detail: err.to_string(),
    });
}

/// Common teardown: flush and release transfer state, deregister, and hand
/// transport failures with pending work to the reconnect supervisor.
async fn finish(
    shared: &Arc<Shared>,
    peer_id: &str,
    teardown: Teardown,
    send: Option<ActiveSend>,
    recv: Option<ActiveReceive>,
    queue: VecDeque<FileJob>,
    peer_addr: SocketAddr,
) {
    let mut pending_jobs: Vec<FileJob> = Vec::new();
    let had_recv = recv.is_some();
    if let Some(active) = send {
        let _ = active.suspend(shared).await;
        pending_jobs.push(active.job.clone());
    }
    if let Some(active) = recv {
        let _ = active.suspend(shared).await;
    }
    pending_jobs.extend(queue);
    if let Err(e) = shared.transfers.lock().await.flush_all() {
        warn!("flush on teardown failed: {e}");
    }
    shared.sessions.lock().await.remove(peer_id);
    shared.pair_codes.lock().await.remove(peer_id);

    match teardown {
        Teardown::Transport(detail) if !pending_jobs.is_empty() || had_recv => {
            debug!(peer = %peer_id, "session lost ({detail}); scheduling reconnect");
            for job in &pending_jobs {
                shared
                    .jobs
                    .lock()
                    .await
                    .set_state(job.parent, JobState::Reconnecting);
            }
            let _ = shared.reconnect_tx.send(ReconnectRequest {
                peer_device_id: peer_id.to_string(),
                last_addr: Some(peer_addr),
                jobs: pending_jobs,
            });
        }
        Teardown::Transport(detail) => {
            debug!(peer = %peer_id, "session lost ({detail}); nothing pending");
        }
        Teardown::Graceful => {
            debug!(peer = %peer_id, "session closed");
            // Records stay on disk; the user can resubmit to resume.
            for job in &pending_jobs {
                shared
                    .jobs
                    .lock()
                    .await
                    .set_state(job.parent, JobState::Stalled);
            }
        }
        Teardown::Fatal => {
            for job in &pending_jobs {
                shared
                    .jobs
                    .lock()
                    .await
                    .set_state(job.parent, JobState::Failed);
            }
        }
    }
}
