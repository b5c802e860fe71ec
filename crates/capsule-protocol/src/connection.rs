//! Length-prefixed framing over any async byte stream.
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! A reader always returns whole frames: short reads are buffered by
//! `read_exact` until the declared length has arrived.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Maximum frame size: 64 MiB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame.
///
/// Returns `None` on a clean disconnect at a frame boundary. A stream that
/// ends partway through a frame is an I/O error.
pub async fn recv_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated(filled, len_buf.len()));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn truncated(got: usize, want: usize) -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("stream ended inside a frame header ({} of {} bytes)", got, want),
    ))
}

/// Encode and send one envelope.
pub async fn send_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let data = envelope.encode()?;
    send_frame(writer, &data).await
}

/// Receive and decode one envelope. Returns `None` on clean disconnect.
pub async fn recv_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Envelope>, ProtocolError> {
    match recv_frame(reader).await? {
        Some(data) => Ok(Some(Envelope::decode(&data)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello world";

        let mut buf = Vec::new();
        send_frame(&mut buf, data).await.unwrap();
        assert_eq!(buf.len(), 4 + data.len());
        assert_eq!(&buf[..4], &(data.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_frame_eof() {
        let buf: &[u8] = &[];
        let mut cursor = std::io::Cursor::new(buf);
        let result = recv_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let len_bytes = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len_bytes.to_vec());
        let result = recv_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        let result = recv_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"complete payload").await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        let result = recv_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_multiple_frames_on_same_stream() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"first").await.unwrap();
        send_frame(&mut buf, b"second").await.unwrap();
        send_frame(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(recv_frame(&mut cursor).await.unwrap().unwrap(), b"first");
        assert_eq!(recv_frame(&mut cursor).await.unwrap().unwrap(), b"second");
        assert_eq!(recv_frame(&mut cursor).await.unwrap().unwrap(), b"");
        assert!(recv_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_writes_are_buffered() {
        let mut encoded = Vec::new();
        send_envelope(&mut encoded, &Envelope::import(1, "m"))
            .await
            .unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for chunk in encoded.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let envelope = recv_envelope(&mut rx).await.unwrap().unwrap();
        assert_eq!(envelope.kind, MessageType::Import);
        assert_eq!(envelope.payload["module"], "m");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_frame_is_malformed() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"not json").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let result = recv_envelope(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }
}
