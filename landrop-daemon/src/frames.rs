//! Async framed message I/O on top of the core codec.

use landrop_core::protocol::Message;
use landrop_core::wire::{self, FrameDecodeError, FrameEncodeError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum FrameIoError {
    /// Clean EOF on a frame boundary.
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    max_len: usize,
) -> Result<(), FrameIoError> {
    let frame = wire::encode_frame(msg, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. EOF before the first length byte is `Closed`; EOF
/// mid-frame is a truncated-frame decode error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Message, FrameIoError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameIoError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len == 0 {
        return Err(FrameDecodeError::Malformed("empty frame".into()).into());
    }
    if frame_len > max_len {
        return Err(FrameDecodeError::TooLarge.into());
    }
    let mut body = vec![0u8; frame_len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameDecodeError::Truncated.into())
        }
        Err(e) => return Err(e.into()),
    }
    Ok(wire::decode_payload(body[0], &body[1..])?)
}
