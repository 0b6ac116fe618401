//! Length-prefixed framing for the replica sync channel.
//!
//! Every frame is a u32 big-endian payload length followed by the payload
//! bytes. The length is capped so a corrupt prefix cannot trigger an
//! unbounded allocation.

use driftmail_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; generous for mail bodies.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::Frame(format!(
            "frame of {} bytes exceeds cap of {}",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }

    let len = (payload.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| Error::Transport(format!("failed to write frame length: {}", e)))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| Error::Transport(format!("failed to write frame payload: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("failed to flush frame: {}", e)))
}

/// Read one frame. Returns `None` on a clean close at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(format!("failed to read frame length: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Frame(format!(
            "peer announced frame of {} bytes, cap is {}",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("failed to read frame payload: {}", e)))?;

    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let bogus = ((MAX_FRAME_BYTES as u32) + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Frame(_)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_a_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"tru")
            .await
            .unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
