//! Length-Prefixed Framing
//!
//! TCP is a byte stream: one `read` may return half a message or three of
//! them. Every envelope is therefore written as a 4-byte big-endian length
//! followed by exactly that many body bytes, and the receive side reads
//! exactly one frame at a time before decoding.
//!
//! The body is opaque here; `protocol.rs` owns its encoding.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::ProtocolError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum allowed frame body (1 MiB). Snapshots are a few hundred bytes;
/// anything near this is a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Failure reading a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed the stream cleanly at a frame boundary.
    #[error("connection closed")]
    Closed,

    /// Malformed length prefix or truncated body.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Prefix `body` with its length. The result can be written as-is.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame body.
///
/// Returns `FrameError::Closed` if the stream ends before any byte of a new
/// frame, and `ProtocolError::TruncatedFrame` if it ends mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                ProtocolError::TruncatedFrame.into()
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { len, max: MAX_FRAME_SIZE }.into());
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::TruncatedFrame.into())
        }
        Err(e) => Err(e.into()),
    }
}
