//! Opening byte streams to brokers

use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::{debug, instrument};

use crate::connection::BrokerDetails;

/// A byte stream the connection engine can drive
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed byte stream returned by a [`Connector`]
pub type BoxedIo = Box<dyn Io>;

/// Opens a byte stream to a broker
///
/// The connection asks its connector for a fresh stream on every connection
/// attempt, including every attempt made during failover.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to `broker`
    async fn connect(&self, broker: &BrokerDetails) -> Result<BoxedIo, io::Error>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Creates a connector that waits at most `connect_timeout` for the
    /// TCP handshake
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip_all, fields(host = %broker.host, port = broker.port))]
    async fn connect(&self, broker: &BrokerDetails) -> Result<BoxedIo, io::Error> {
        let addr = (broker.host.as_str(), broker.port);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        debug!("connected");
        Ok(Box::new(stream))
    }
}
