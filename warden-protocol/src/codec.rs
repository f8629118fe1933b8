//! Length-prefixed JSON framing for [`Envelope`]s.
//!
//! Each frame is a 4-byte big-endian body length followed by the JSON body.

use crate::envelope::Envelope;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed envelope.
///
/// A stream that ends before the length prefix yields
/// [`io::ErrorKind::UnexpectedEof`], which callers treat as the peer closing
/// the channel.
pub async fn read_envelope<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Envelope> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON decode error: {e}"),
        )
    })
}

/// Writes one length-prefixed envelope and flushes.
pub async fn write_envelope<T: AsyncWrite + Unpin>(io: &mut T, envelope: &Envelope) -> io::Result<()> {
    let data = serde_json::to_vec(envelope).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON encode error: {e}"),
        )
    })?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", data.len()),
        ));
    }

    let len_bytes = (data.len() as u32).to_be_bytes();
    io.write_all(&len_bytes).await?;
    io.write_all(&data).await?;
    io.flush().await?;

    Ok(())
}
