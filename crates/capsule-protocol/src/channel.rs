//! Transport-agnostic channel halves.
//!
//! The controller and the launcher each hold one reader and one writer. The
//! halves are independent so a background task can own the reader while
//! callers share the writer.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::connection::{recv_envelope, send_envelope};
use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Split a byte transport into channel halves.
pub fn channel<R, W>(reader: R, writer: W) -> (ChannelReader<R>, ChannelWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (ChannelReader::new(reader), ChannelWriter::new(writer))
}

/// Receiving half.
pub struct ChannelReader<R> {
    inner: R,
    closed: bool,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Receive the next envelope. `None` once the peer has hung up.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        if self.closed {
            return Ok(None);
        }
        let envelope = recv_envelope(&mut self.inner).await?;
        if envelope.is_none() {
            self.closed = true;
        }
        Ok(envelope)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Sending half.
pub struct ChannelWriter<W> {
    inner: Option<W>,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let inner = self.inner.as_mut().ok_or(ProtocolError::Closed)?;
        send_envelope(inner, envelope).await
    }

    /// Flush and shut the transport down. The peer sees EOF. Idempotent.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut inner) = self.inner.take() {
            inner.flush().await?;
            inner.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CallPayload, MessageType};
    use crate::value::{Kwargs, Value};

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let (mut client_rx, mut client_tx) = channel(client_read, client_write);
        let (mut server_rx, mut server_tx) = channel(server_read, server_write);

        let call = CallPayload::new("m", "add", vec![Value::Int(2), Value::Int(3)], Kwargs::new());
        client_tx.send(&Envelope::call(1, &call).unwrap()).await.unwrap();

        let request = server_rx.recv().await.unwrap().unwrap();
        assert_eq!(request.kind, MessageType::Call);
        let payload: CallPayload = request.payload_as().unwrap();
        let sum = payload.args[0].as_i64().unwrap() + payload.args[1].as_i64().unwrap();
        server_tx
            .send(&Envelope::result(request.id, &Value::Int(sum)).unwrap())
            .await
            .unwrap();

        let response = client_rx.recv().await.unwrap().unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.payload_as::<Value>().unwrap(), Value::Int(5));
    }

    #[tokio::test]
    async fn test_close_gives_peer_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut tx = ChannelWriter::new(client_write);
        let mut rx = ChannelReader::new(server_read);

        tx.send(&Envelope::shutdown(1)).await.unwrap();
        tx.close().await.unwrap();
        tx.close().await.unwrap();
        assert!(tx.is_closed());

        assert_eq!(rx.recv().await.unwrap().unwrap().kind, MessageType::Shutdown);
        assert!(rx.recv().await.unwrap().is_none());
        assert!(rx.is_closed());
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let mut tx = ChannelWriter::new(client);
        tx.close().await.unwrap();
        let err = tx.send(&Envelope::ready()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }
}
