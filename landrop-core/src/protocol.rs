//! Wire protocol: message types, tags, and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Exchanged in HELLO; mismatch is session-fatal.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame type tags. One byte on the wire, directly after the length prefix.
pub mod tag {
    pub const HELLO: u8 = 0x01;
    pub const HELLO_ACK: u8 = 0x02;
    pub const PAIR_REQ: u8 = 0x03;
    pub const PAIR_OK: u8 = 0x04;
    pub const PAIR_FAIL: u8 = 0x05;
    pub const FILE_INFO: u8 = 0x06;
    pub const FILE_INFO_ACK: u8 = 0x07;
    pub const FILE_RESUME: u8 = 0x08;
    pub const FILE_RESUME_OK: u8 = 0x09;
    pub const FILE_DATA: u8 = 0x0a;
    pub const FILE_ACK: u8 = 0x0b;
    pub const FILE_ACK_BATCH: u8 = 0x0c;
    pub const FILE_COMPLETE: u8 = 0x0d;
    pub const FILE_COMPLETE_ACK: u8 = 0x0e;
    pub const HEARTBEAT: u8 = 0x0f;
    pub const BYE: u8 = 0x10;
    pub const ERROR: u8 = 0x11;
}

/// Session handshake greeting, sent by both sides on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: String,
    pub hostname: String,
    pub protocol_version: u32,
}

/// Pairing-code submission from the initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairReq {
    pub code: String,
}

/// Code mismatch; how many attempts the acceptor will still take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairFail {
    pub attempts_left: u32,
}

/// Immutable transfer metadata announced by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// Messages that address a transfer by its content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub file_hash: String,
}

/// Acknowledgement of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAck {
    pub index: u32,
}

/// Receiver-side progress, encoded as sorted (start, len) index runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResume {
    pub file_hash: String,
    pub completed: Vec<(u32, u32)>,
}

/// Batched acknowledgement, same run encoding as FileResume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBatch {
    pub runs: Vec<(u32, u32)>,
}

/// Error categories carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Protocol version mismatch in HELLO.
    Version,
    /// Malformed frame or a frame type invalid for the session state.
    Protocol,
    /// Pairing attempts exhausted.
    PairingRefused,
    /// Final content hash did not match the descriptor.
    HashMismatch,
    /// Receiver-side persistence failure (disk full, permissions).
    State,
}

/// Structured session error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub kind: ErrorKind,
    pub detail: String,
}

/// All wire message types. Payload bodies are JSON objects except
/// `FileData`, which is packed binary (see the wire module).
#[derive(Debug, Clone)]
pub enum Message {
    Hello(Hello),
    HelloAck,
    PairReq(PairReq),
    PairOk,
    PairFail(PairFail),
    FileInfo(FileInfo),
    FileInfoAck(FileRef),
    FileResume(FileResume),
    FileResumeOk(FileRef),
    FileData { index: u32, data: Vec<u8> },
    FileAck(ChunkAck),
    FileAckBatch(AckBatch),
    FileComplete(FileRef),
    FileCompleteAck(FileRef),
    Heartbeat,
    Bye,
    Error(ErrorFrame),
}

impl Message {
    /// The frame type byte for this message.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Message::Hello(_) => tag::HELLO,
            Message::HelloAck => tag::HELLO_ACK,
            Message::PairReq(_) => tag::PAIR_REQ,
            Message::PairOk => tag::PAIR_OK,
            Message::PairFail(_) => tag::PAIR_FAIL,
            Message::FileInfo(_) => tag::FILE_INFO,
            Message::FileInfoAck(_) => tag::FILE_INFO_ACK,
            Message::FileResume(_) => tag::FILE_RESUME,
            Message::FileResumeOk(_) => tag::FILE_RESUME_OK,
            Message::FileData { .. } => tag::FILE_DATA,
            Message::FileAck(_) => tag::FILE_ACK,
            Message::FileAckBatch(_) => tag::FILE_ACK_BATCH,
            Message::FileComplete(_) => tag::FILE_COMPLETE,
            Message::FileCompleteAck(_) => tag::FILE_COMPLETE_ACK,
            Message::Heartbeat => tag::HEARTBEAT,
            Message::Bye => tag::BYE,
            Message::Error(_) => tag::ERROR,
        }
    }
}
