use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;

use super::error::{FrameError, TransportError};
use super::frame::FrameSplitter;
use super::DeviceIdentity;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type DeviceStream = Box<dyn AsyncStream>;

/// Opens raw byte streams to a device.
///
/// Production code dials TCP; tests plug in an in-memory device.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<DeviceStream, TransportError>>;
}

pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        identity: &'a DeviceIdentity,
    ) -> BoxFuture<'a, Result<DeviceStream, TransportError>> {
        Box::pin(async move {
            let addr = (identity.address, identity.port);
            debug!("Dialing device at {}:{}", identity.address, identity.port);
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as DeviceStream)
        })
    }
}

/// One open device connection, split into frames.
pub struct DeviceTransport {
    framed: Framed<DeviceStream, FrameSplitter>,
}

impl DeviceTransport {
    pub fn new(stream: DeviceStream) -> Self {
        Self {
            framed: Framed::new(stream, FrameSplitter),
        }
    }

    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Next raw frame or framing error. Cancel safe.
    pub async fn next(&mut self) -> Result<Result<BytesMut, FrameError>, TransportError> {
        match self.framed.next().await {
            Some(Ok(item)) => Ok(item),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Err(TransportError::Closed),
        }
    }

    pub async fn next_before(
        &mut self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Result<BytesMut, FrameError>, TransportError> {
        tokio::time::timeout_at(deadline, self.next())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }
}
