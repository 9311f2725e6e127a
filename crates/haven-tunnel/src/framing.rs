//! Length-prefixed message framing.
//!
//! Every TCP message - handshake or encrypted payload - is a 4-byte
//! big-endian length followed by the body. One framing scheme for the whole
//! wire keeps the reader loop trivial and makes oversized frames rejectable
//! before allocation.

use crate::error::TunnelError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes
pub const LEN_PREFIX_SIZE: usize = 4;

/// Maximum accepted frame body size.
///
/// A virtual-LAN payload is at most an Ethernet frame plus AEAD overhead, so
/// anything near this limit indicates a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns [`TunnelError::Malformed`] if `body` exceeds [`MAX_FRAME_SIZE`],
/// or an I/O variant if the socket write fails.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(TunnelError::Malformed(format!(
            "frame of {} bytes exceeds limit {MAX_FRAME_SIZE}",
            body.len()
        )));
    }

    let len = u32::try_from(body.len())
        .map_err(|_| TunnelError::Malformed("frame length overflow".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// # Errors
///
/// Returns [`TunnelError::Closed`] on clean EOF, [`TunnelError::Malformed`]
/// if the advertised length exceeds [`MAX_FRAME_SIZE`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TunnelError::Malformed(format!(
            "advertised frame of {len} bytes exceeds limit {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
