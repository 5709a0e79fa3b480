//! Framing: 4-byte big-endian length prefix + type byte + payload.
//!
//! The length counts the type byte and payload. Payloads are JSON objects,
//! except FILE_DATA which packs `[u32 index][u32 chunk_len]` followed by the
//! raw chunk bytes.

use crate::protocol::{tag, Message};

const LEN_SIZE: usize = 4;
const DATA_HEADER: usize = 8;

/// Frame overhead allowance on top of the chunk size. Frames longer than
/// `chunk_size + FRAME_OVERHEAD` are a protocol violation.
pub const FRAME_OVERHEAD: usize = 64;

/// Maximum frame length (type byte + payload) for a given chunk size.
pub const fn max_frame_len(chunk_size: u32) -> usize {
    chunk_size as usize + FRAME_OVERHEAD
}

/// Encode a message into a single frame.
pub fn encode_frame(msg: &Message, max_len: usize) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_payload(msg)?;
    let frame_len = 1 + payload.len();
    if frame_len > max_len {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_be_bytes());
    out.push(msg.wire_tag());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn encode_payload(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = match msg {
        Message::Hello(m) => serde_json::to_vec(m)?,
        Message::PairReq(m) => serde_json::to_vec(m)?,
        Message::PairFail(m) => serde_json::to_vec(m)?,
        Message::FileInfo(m) => serde_json::to_vec(m)?,
        Message::FileInfoAck(m)
        | Message::FileResumeOk(m)
        | Message::FileComplete(m)
        | Message::FileCompleteAck(m) => serde_json::to_vec(m)?,
        Message::FileResume(m) => serde_json::to_vec(m)?,
        Message::FileAck(m) => serde_json::to_vec(m)?,
        Message::FileAckBatch(m) => serde_json::to_vec(m)?,
        Message::Error(m) => serde_json::to_vec(m)?,
        Message::FileData { index, data } => {
            let mut out = Vec::with_capacity(DATA_HEADER + data.len());
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(data);
            out
        }
        Message::HelloAck | Message::PairOk | Message::Heartbeat | Message::Bye => Vec::new(),
    };
    Ok(body)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame exceeds maximum length")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed. `Truncated` means the buffer ends mid-frame;
/// the caller should retry after reading more.
pub fn decode_frame(bytes: &[u8], max_len: usize) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    let frame_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if frame_len == 0 {
        return Err(FrameDecodeError::Malformed("empty frame".into()));
    }
    if frame_len > max_len {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + frame_len {
        return Err(FrameDecodeError::Truncated);
    }
    let kind = bytes[LEN_SIZE];
    let payload = &bytes[LEN_SIZE + 1..LEN_SIZE + frame_len];
    let msg = decode_payload(kind, payload)?;
    Ok((msg, LEN_SIZE + frame_len))
}

/// Decode the body of a frame whose length prefix was already consumed.
/// `kind` is the type byte, `payload` the remaining frame bytes.
pub fn decode_payload(kind: u8, payload: &[u8]) -> Result<Message, FrameDecodeError> {
    let msg = match kind {
        tag::HELLO => Message::Hello(parse_json(payload)?),
        tag::HELLO_ACK => Message::HelloAck,
        tag::PAIR_REQ => Message::PairReq(parse_json(payload)?),
        tag::PAIR_OK => Message::PairOk,
        tag::PAIR_FAIL => Message::PairFail(parse_json(payload)?),
        tag::FILE_INFO => Message::FileInfo(parse_json(payload)?),
        tag::FILE_INFO_ACK => Message::FileInfoAck(parse_json(payload)?),
        tag::FILE_RESUME => Message::FileResume(parse_json(payload)?),
        tag::FILE_RESUME_OK => Message::FileResumeOk(parse_json(payload)?),
        tag::FILE_DATA => {
            if payload.len() < DATA_HEADER {
                return Err(FrameDecodeError::Malformed("short FILE_DATA header".into()));
            }
            let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let chunk_len =
                u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
            if payload.len() - DATA_HEADER != chunk_len {
                return Err(FrameDecodeError::Malformed(
                    "FILE_DATA length mismatch".into(),
                ));
            }
            Message::FileData {
                index,
                data: payload[DATA_HEADER..].to_vec(),
            }
        }
        tag::FILE_ACK => Message::FileAck(parse_json(payload)?),
        tag::FILE_ACK_BATCH => Message::FileAckBatch(parse_json(payload)?),
        tag::FILE_COMPLETE => Message::FileComplete(parse_json(payload)?),
        tag::FILE_COMPLETE_ACK => Message::FileCompleteAck(parse_json(payload)?),
        tag::HEARTBEAT => Message::Heartbeat,
        tag::BYE => Message::Bye,
        tag::ERROR => Message::Error(parse_json(payload)?),
        other => {
            return Err(FrameDecodeError::Malformed(format!(
                "unknown frame type 0x{other:02x}"
            )))
        }
    };
    Ok(msg)
}

fn parse_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, FrameDecodeError> {
    serde_json::from_slice(payload).map_err(|e| FrameDecodeError::Malformed(e.to_string()))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame truncated")]
    Truncated,
    #[error("frame exceeds maximum length")]
    TooLarge,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorFrame, ErrorKind, FileInfo, FileResume, Hello, PROTOCOL_VERSION};

    const MAX: usize = max_frame_len(0) + 1024;

    fn sample_hello() -> Message {
        Message::Hello(Hello {
            device_id: "atlas-kim-0a1b".into(),
            hostname: "atlas".into(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    #[test]
    fn roundtrip_hello() {
        let frame = encode_frame(&sample_hello(), MAX).unwrap();
        let (decoded, n) = decode_frame(&frame, MAX).unwrap();
        assert_eq!(n, frame.len());
        match decoded {
            Message::Hello(h) => {
                assert_eq!(h.device_id, "atlas-kim-0a1b");
                assert_eq!(h.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_empty_payload_messages() {
        for msg in [Message::HelloAck, Message::PairOk, Message::Heartbeat, Message::Bye] {
            let expect = msg.wire_tag();
            let frame = encode_frame(&msg, MAX).unwrap();
            let (decoded, _) = decode_frame(&frame, MAX).unwrap();
            assert_eq!(decoded.wire_tag(), expect);
        }
    }

    #[test]
    fn roundtrip_file_info() {
        let msg = Message::FileInfo(FileInfo {
            file_hash: "ab".repeat(32),
            file_name: "hello.txt".into(),
            file_size: 200,
            chunk_size: 64,
            total_chunks: 4,
        });
        let frame = encode_frame(&msg, MAX).unwrap();
        let (decoded, _) = decode_frame(&frame, MAX).unwrap();
        match decoded {
            Message::FileInfo(i) => {
                assert_eq!(i.file_size, 200);
                assert_eq!(i.total_chunks, 4);
            }
            other => panic!("expected FileInfo, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_file_data_binary() {
        let data: Vec<u8> = (0..255u8).collect();
        let msg = Message::FileData {
            index: u32::MAX,
            data: data.clone(),
        };
        let frame = encode_frame(&msg, MAX).unwrap();
        let (decoded, _) = decode_frame(&frame, MAX).unwrap();
        match decoded {
            Message::FileData { index, data: d } => {
                assert_eq!(index, u32::MAX);
                assert_eq!(d, data);
            }
            other => panic!("expected FileData, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_resume_runs() {
        let msg = Message::FileResume(FileResume {
            file_hash: "cd".repeat(32),
            completed: vec![(0, 4), (9, 1)],
        });
        let frame = encode_frame(&msg, MAX).unwrap();
        let (decoded, _) = decode_frame(&frame, MAX).unwrap();
        match decoded {
            Message::FileResume(r) => assert_eq!(r.completed, vec![(0, 4), (9, 1)]),
            other => panic!("expected FileResume, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_error_kind() {
        let msg = Message::Error(ErrorFrame {
            kind: ErrorKind::HashMismatch,
            detail: "content hash mismatch".into(),
        });
        let frame = encode_frame(&msg, MAX).unwrap();
        let (decoded, _) = decode_frame(&frame, MAX).unwrap();
        match decoded {
            Message::Error(e) => assert_eq!(e.kind, ErrorKind::HashMismatch),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn partial_buffer_is_truncated() {
        let frame = encode_frame(&sample_hello(), MAX).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2], MAX),
            Err(FrameDecodeError::Truncated)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1], MAX),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut frame = encode_frame(&Message::Heartbeat, MAX).unwrap();
        frame[LEN_SIZE] = 0xff;
        assert!(matches!(
            decode_frame(&frame, MAX),
            Err(FrameDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn file_data_length_mismatch_is_malformed() {
        let msg = Message::FileData {
            index: 5,
            data: vec![1, 2, 3, 4],
        };
        let mut frame = encode_frame(&msg, MAX).unwrap();
        // Corrupt the inner chunk_len so it disagrees with the frame length.
        let len_pos = LEN_SIZE + 1 + 4;
        frame[len_pos + 3] = 9;
        assert!(matches!(
            decode_frame(&frame, MAX),
            Err(FrameDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn oversize_frame_rejected_both_ways() {
        let msg = Message::FileData {
            index: 0,
            data: vec![0u8; 128],
        };
        let small = max_frame_len(64);
        assert!(matches!(
            encode_frame(&msg, small),
            Err(FrameEncodeError::TooLarge)
        ));
        let frame = encode_frame(&msg, MAX).unwrap();
        assert!(matches!(
            decode_frame(&frame, small),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let fa = encode_frame(&sample_hello(), MAX).unwrap();
        let fb = encode_frame(&Message::Heartbeat, MAX).unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf, MAX).unwrap();
        assert!(matches!(m1, Message::Hello(_)));
        let (m2, n2) = decode_frame(&buf[n1..], MAX).unwrap();
        assert!(matches!(m2, Message::Heartbeat));
        assert_eq!(n1 + n2, buf.len());
    }
}
