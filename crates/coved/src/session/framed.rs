//! Async frame I/O: u32 LE length prefix, kind byte, payload.
//!
//! Works over anything `AsyncRead + AsyncWrite`, so the daemon runs it on
//! TCP streams and the tests on in-memory duplex pipes.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cove_core::wire::{FrameKind, WireError, MAX_FRAME_LEN};

use super::SessionError;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), SessionError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(SessionError::Protocol(WireError::FrameTooLarge(
            payload.len(),
        )));
    }
    let len = (1 + payload.len()) as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&[kind as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(FrameKind, Bytes), SessionError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(SessionError::Protocol(WireError::BadPayload(
            "zero-length frame",
        )));
    }
    if len - 1 > MAX_FRAME_LEN {
        return Err(SessionError::Protocol(WireError::FrameTooLarge(len - 1)));
    }

    let mut kind_byte = [0u8; 1];
    reader.read_exact(&mut kind_byte).await?;
    let kind = FrameKind::try_from(kind_byte[0]).map_err(SessionError::Protocol)?;

    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await?;
    Ok((kind, Bytes::from(payload)))
}
