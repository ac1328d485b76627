//! TCP wire format of the data channel.
//!
//! # Wire format
//!
//! ```text
//! HANDSHAKE (dialer -> listener):     [32 bytes: hex token ASCII]
//! AUTH RESPONSE (listener -> dialer): [1 byte: 0x01=OK, 0x00=rejected]
//!
//! PER FRAME (both directions):
//!   [4 bytes BE: frame_len]
//!   [frame_len bytes: one dropwire frame]
//! ```
//!
//! A clean EOF on a frame boundary closes the channel.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;
use crate::token::{SessionToken, TOKEN_LEN};

/// Authentication response: accepted.
pub const AUTH_OK: u8 = 0x01;

/// Authentication response: rejected.
pub const AUTH_REJECTED: u8 = 0x00;

/// Largest frame either side will send or accept (32 MiB).
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Writes one length-prefixed frame. Does not flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), DataChannelError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(DataChannelError::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `None` on EOF before the length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Bytes>, DataChannelError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DataChannelError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DataChannelError::Protocol(format!("connection closed inside a {len} byte frame"))
        } else {
            e.into()
        }
    })?;
    Ok(Some(Bytes::from(buf)))
}

/// Sends the dialer's token. Flushes, since the dialer waits on the verdict.
pub async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &SessionToken,
) -> Result<(), DataChannelError> {
    writer.write_all(token.as_str().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the fixed-width token field. Content is not checked here.
pub async fn read_token<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<[u8; TOKEN_LEN], DataChannelError> {
    let mut raw = [0u8; TOKEN_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(raw)
}

/// Sends the listener's verdict on the token.
pub async fn write_verdict<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accepted: bool,
) -> Result<(), DataChannelError> {
    let byte = if accepted { AUTH_OK } else { AUTH_REJECTED };
    writer.write_all(&[byte]).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the listener's verdict. Any byte other than the two defined ones
/// is a protocol error.
pub async fn read_verdict<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, DataChannelError> {
    match reader.read_u8().await? {
        AUTH_OK => Ok(true),
        AUTH_REJECTED => Ok(false),
        other => Err(DataChannelError::Protocol(format!(
            "unexpected auth verdict 0x{other:02x}"
        ))),
    }
}
