//! Length-prefixed JSON framing
//!
//! Each frame is a big-endian `u32` byte length followed by one JSON encoded
//! [`SyncMessage`].

use crate::error::TransportError;
use crate::protocol::SyncMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a message into a complete frame
///
/// # Errors
/// Returns error if serialization fails or the body is too large
pub fn encode_frame(msg: &SyncMessage) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(msg)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|_| body.len() <= MAX_FRAME_LEN)
        .ok_or(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame
///
/// # Errors
/// Returns error on encoding or socket failure
pub async fn write_frame<W>(writer: &mut W, msg: &SyncMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream
///
/// # Errors
/// Returns error on socket failure, oversized frames or invalid JSON
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<SyncMessage>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &SyncMessage::Ping).await.unwrap();
        write_frame(&mut client, &SyncMessage::Pong).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(SyncMessage::Ping));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(SyncMessage::Pong));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = u32::try_from(MAX_FRAME_LEN + 1).unwrap();
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_a_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{]x").await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[test]
    fn frame_starts_with_length() {
        let frame = encode_frame(&SyncMessage::Ping).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }
}
