//! # Framing
//!
//! Each message travels as `[Len: u32 LE][Record: Len]`. A clean end of
//! stream between frames is reported as `None`; an end inside a frame is an
//! error.

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::WireError;
use crate::message::ChaincodeMessage;
use crate::message::Record;

/// Default upper bound for a single frame (100 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
}

/// Encodes and writes one message, then flushes.
pub async fn write_message<W>(writer: &mut W, msg: &ChaincodeMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = msg.to_bytes()?;
    let len = u32::try_from(body.len())
        .map_err(|_| FrameError::TooLarge { len: body.len(), max: u32::MAX as usize })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Option<ChaincodeMessage>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return match filled {
                0 => Ok(None),
                _ => Err(FrameError::Truncated),
            };
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e),
    })?;

    Ok(Some(ChaincodeMessage::from_bytes(&body)?))
}
