//! Byte stream transport
//!
//! [`Transport`] wraps a `Framed` stream with the version specific
//! [`WireCodec`] and an optional idle timeout. Items fed into the sink are
//! only written out when the sink is flushed.

use std::{task::Poll, time::Duration};

use futures_util::{Future, Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{framing::Item, util::IdleTimeout};

mod codec;
pub mod connector;
mod error;

pub use codec::{SegmentCodec, WireCodec};
pub use connector::{Connector, TcpConnector};
pub use error::Error;

pin_project! {
    /// Framed transport with idle timeout detection
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, WireCodec>,
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds the codec to the byte stream
    pub fn bind(io: Io, codec: WireCodec, idle_timeout: Option<Duration>) -> Self {
        let framed = Framed::new(io, codec);
        let idle_timeout = match idle_timeout {
            Some(duration) => match duration.is_zero() {
                true => None,
                false => Some(IdleTimeout::new(duration)),
            },
            None => None,
        };

        Self {
            framed,
            idle_timeout,
        }
    }

    /// Applies a newly negotiated max frame size
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) -> Result<&mut Self, Error> {
        self.framed.codec_mut().set_max_frame_size(max_frame_size)?;
        Ok(self)
    }

    /// Sets or clears the idle timeout. A zero duration disables it.
    pub fn set_idle_timeout(&mut self, duration: Option<Duration>) -> &mut Self {
        self.idle_timeout = match duration {
            Some(d) if !d.is_zero() => Some(IdleTimeout::new(d)),
            _ => None,
        };
        self
    }
}

impl<Io> Sink<Item> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
        let this = self.project();
        this.framed.start_send(item).map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Item, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(delay) = this.idle_timeout.as_mut() {
                    delay.reset();
                }
                Poll::Ready(next.map(|result| result.map_err(Into::into)))
            }
            Poll::Pending => {
                if let Some(delay) = this.idle_timeout.as_mut() {
                    if let Poll::Ready(()) = std::pin::Pin::new(delay).poll(cx) {
                        return Poll::Ready(Some(Err(Error::IdleTimeout)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_test::io::Builder;

    use super::{Error, Transport, WireCodec};
    use crate::framing::{Item, Method, ProtocolEvent, ProtocolVersion};

    #[tokio::test]
    async fn header_is_written_verbatim() {
        let mock = Builder::new().write(b"AMQP\x00\x00\x09\x01").build();
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 4096).unwrap();
        let mut transport = Transport::bind(mock, codec, None);
        let header = ProtocolVersion::V0_9_1.header();
        transport.send(Item::ProtocolHeader(header)).await.unwrap();
    }

    #[tokio::test]
    async fn fed_items_are_written_on_flush() {
        let mock = Builder::new()
            .write(&[1, 0, 1, 0, 0, 0, 4, 0, 90, 0, 20, 0xCE, 8, 0, 0, 0, 0, 0, 0, 0xCE])
            .build();
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 4096).unwrap();
        let mut transport = Transport::bind(mock, codec, None);
        transport
            .feed(Item::Event(ProtocolEvent::new(1, Method::TxCommit)))
            .await
            .unwrap();
        transport.feed(Item::Heartbeat).await.unwrap();
        transport.flush().await.unwrap();
    }

    #[tokio::test]
    async fn incoming_method_is_decoded() {
        let mock = Builder::new()
            .read(&[1, 0, 0, 0, 0, 0, 4, 0, 10, 0, 51, 0xCE])
            .build();
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 4096).unwrap();
        let mut transport = Transport::bind(mock, codec, None);
        let item = transport.next().await.unwrap().unwrap();
        assert_eq!(
            item,
            Item::Event(ProtocolEvent::new(0, Method::ConnectionCloseOk))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_the_idle_timeout() {
        let mock = Builder::new().wait(Duration::from_secs(10)).build();
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 4096).unwrap();
        let mut transport = Transport::bind(mock, codec, Some(Duration::from_secs(2)));
        let outcome = transport.next().await;
        assert!(matches!(outcome, Some(Err(Error::IdleTimeout))));
    }
}
