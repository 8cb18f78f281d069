//! Plain TCP transport with stream framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::stream::{StreamCodec, HEADER_SIZE};
use crate::transport::{Link, LinkListener, LinkStatus, Transport};

/// TCP byte-stream transport.
pub struct TcpTransport {
    addr: String,
    timeout: Duration,
    codec: StreamCodec,
    link: Link,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    /// Create a transport for `host:port`, not yet connected.
    pub fn new(addr: impl Into<String>, timeout: Duration, codec: StreamCodec) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            codec,
            link: Link::default(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::connection(format!("TCP connect {}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Read one length-prefixed frame from a byte-stream half.
pub(super) async fn read_stream_frame<R>(reader: &mut R, codec: &StreamCodec) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = codec.decode_header(&header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame to a byte-stream half.
pub(super) async fn write_stream_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(&StreamCodec::encode(frame)).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        self.link.set_status(LinkStatus::Connecting);
        debug!(addr = %self.addr, "tcp connecting");

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.link.set_status(LinkStatus::Closed);
                return Err(e);
            }
        };

        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

        self.link.mark_connected(local, remote);
        Ok(())
    }

    async fn close(&self) {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.link.mark_closed();
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotConnected)?;
        match read_stream_frame(reader, &self.codec).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                drop(guard);
                self.link.mark_closed();
                Err(e)
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        match write_stream_frame(writer, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                self.link.mark_closed();
                Err(e)
            }
        }
    }

    fn status(&self) -> LinkStatus {
        self.link.status()
    }

    fn set_status(&self, status: LinkStatus) {
        self.link.set_status(status);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    fn set_listener(&self, listener: Arc<dyn LinkListener>) {
        self.link.set_listener(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_frame_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let codec = StreamCodec::default();
            let frame = read_stream_frame(&mut sock, &codec).await.unwrap();
            write_stream_frame(&mut sock, &frame).await.unwrap();
        });

        let transport =
            TcpTransport::new(addr.to_string(), Duration::from_secs(5), StreamCodec::default());
        transport.connect().await.unwrap();
        assert_eq!(transport.status(), LinkStatus::Connected);
        assert!(transport.remote_addr().is_some());

        let payload = vec![0x42u8; 64];
        transport.write_frame(&payload).await.unwrap();
        let echoed = transport.read_frame().await.unwrap();
        assert_eq!(echoed, payload);

        transport.close().await;
        assert_eq!(transport.status(), LinkStatus::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_before_connect_fails() {
        let transport =
            TcpTransport::new("127.0.0.1:1", Duration::from_secs(1), StreamCodec::default());
        assert!(matches!(
            transport.read_frame().await,
            Err(Error::NotConnected)
        ));
    }
}
