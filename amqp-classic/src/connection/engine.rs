//! The engine owns the transport and multiplexes incoming methods,
//! outgoing items and heartbeats

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{error::TryRecvError, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::{
    constants::DEFAULT_SEGMENTED_MAX_FRAME_SIZE,
    dispatch::Dispatch,
    failover,
    framing::Item,
    state::ConnectionState,
    transport::{self, Transport},
    util::Running,
    Error,
};

use super::{heartbeat::HeartBeat, ConnectionInner};

/// Transport parameters settled by `connection.tune`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tuning {
    /// 0 means no limit
    pub max_frame_size: u32,
    pub heartbeat: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

/// Work handed to the engine
#[derive(Debug)]
pub(crate) enum Outgoing {
    Item { item: Item, flush: bool },
    Reconfigure(Tuning),
    /// Flush what is queued and stop
    Close,
}

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    inner: Arc<ConnectionInner>,
    outgoing: UnboundedReceiver<Outgoing>,
    heartbeat: HeartBeat,
    epoch: u64,
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        transport: Transport<Io>,
        inner: Arc<ConnectionInner>,
        outgoing: UnboundedReceiver<Outgoing>,
        epoch: u64,
    ) -> Self {
        Self {
            transport,
            inner,
            outgoing,
            heartbeat: HeartBeat::never(),
            epoch,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.event_loop())
    }

    fn is_stale(&self) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) != self.epoch
    }

    async fn on_incoming(
        &mut self,
        incoming: Result<Item, transport::Error>,
    ) -> Result<Running, Error> {
        match incoming? {
            Item::ProtocolHeader(header) => {
                let (major, minor) = header.reported_version();
                debug!(major, minor, "broker answered with a protocol header");
                Err(Error::ProtocolVersionMismatch { major, minor })
            }
            Item::Heartbeat => {
                trace!("heartbeat received");
                Ok(Running::Continue)
            }
            Item::Event(event) => {
                trace!(channel = event.channel, method = %event.method.kind(), "received");
                let dispatcher = self.inner.dispatcher();
                match dispatcher.dispatch(&self.inner, &event)? {
                    Dispatch::Handled(running) => {
                        self.inner.listeners.notify(&event);
                        Ok(running)
                    }
                    Dispatch::NotApplicable => {
                        if !self.inner.listeners.notify(&event) {
                            debug!(
                                channel = event.channel,
                                method = %event.method.kind(),
                                "no waiter accepted method"
                            );
                        }
                        Ok(Running::Continue)
                    }
                    Dispatch::UnsupportedByVersion => Ok(Running::Continue),
                }
            }
        }
    }

    fn reconfigure(&mut self, tuning: Tuning) -> Result<(), Error> {
        let max_frame_size = match (tuning.max_frame_size, self.inner.version().is_segmented()) {
            (0, true) => DEFAULT_SEGMENTED_MAX_FRAME_SIZE,
            (0, false) => u32::MAX,
            (size, _) => size,
        };
        self.transport.set_max_frame_size(max_frame_size)?;
        self.transport.set_idle_timeout(tuning.idle_timeout);
        self.heartbeat = HeartBeat::from_period(tuning.heartbeat);
        debug!(
            max_frame_size,
            heartbeat = ?self.heartbeat.period(),
            idle_timeout = ?tuning.idle_timeout,
            "transport reconfigured"
        );
        Ok(())
    }

    /// Writes everything already queued, flushing once at the end of the
    /// batch unless an item asked for an earlier flush
    async fn on_outgoing(&mut self, first: Outgoing) -> Result<Running, Error> {
        let mut next = Some(first);
        let mut running = Running::Continue;
        while let Some(outgoing) = next.take() {
            match outgoing {
                Outgoing::Item { item, flush } => {
                    self.transport.feed(item).await?;
                    if flush {
                        self.transport.flush().await?;
                    }
                }
                Outgoing::Reconfigure(tuning) => self.reconfigure(tuning)?,
                Outgoing::Close => {
                    running = Running::Stop;
                    break;
                }
            }
            next = match self.outgoing.try_recv() {
                Ok(outgoing) => Some(outgoing),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }
        self.transport.flush().await?;
        Ok(running)
    }

    async fn on_heartbeat(&mut self) -> Result<Running, Error> {
        match self.inner.state.current_state() {
            ConnectionState::NotOpened | ConnectionState::Open => {
                trace!("sending heartbeat");
                self.transport.send(Item::Heartbeat).await?;
            }
            _ => {}
        }
        Ok(Running::Continue)
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            if self.is_stale() {
                return Ok(());
            }

            let result = tokio::select! {
                _ = self.heartbeat.next() => self.on_heartbeat().await,
                incoming = self.transport.next() => match incoming {
                    Some(incoming) => self.on_incoming(incoming).await,
                    None => Err(Error::from(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "broker closed the byte stream",
                    ))),
                },
                outgoing = self.outgoing.recv() => match outgoing {
                    Some(outgoing) => self.on_outgoing(outgoing).await,
                    None => Ok(Running::Stop),
                },
            };

            match result? {
                Running::Continue => {}
                Running::Stop => return Ok(()),
            }
        }
    }

    async fn shutdown(&mut self, result: &Result<(), Error>) {
        if let Err(error) = result {
            if error.is_transport_failure() {
                return;
            }
        }
        while let Ok(outgoing) = self.outgoing.try_recv() {
            if let Outgoing::Item { item, .. } = outgoing {
                if self.transport.feed(item).await.is_err() {
                    return;
                }
            }
        }
        if let Err(error) = self.transport.close().await {
            debug!(%error, "closing transport failed");
        }
    }

    async fn event_loop(mut self) {
        let result = self.run().await;
        match &result {
            Ok(()) => debug!(epoch = self.epoch, "connection engine stopped"),
            Err(error) if error.is_retryable() => {
                warn!(epoch = self.epoch, %error, "connection engine stopped")
            }
            Err(error) => error!(epoch = self.epoch, %error, "connection engine stopped"),
        }

        let action = failover::engine_stopping(&self.inner, self.epoch, &result);
        self.shutdown(&result).await;

        // The old transport must be gone before a failover reconnects
        let inner = self.inner.clone();
        drop(self);
        failover::on_engine_stopped(inner, action, result).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_test::io::Builder;

    use super::*;
    use crate::{
        connection::ConnectionSettings,
        framing::{legacy::LegacyCodec, Method, ProtocolEvent, ProtocolVersion},
        sasl::SaslRegistry,
        transport::{TcpConnector, WireCodec},
    };
    use tokio_util::codec::Encoder;

    fn encode(items: Vec<Item>) -> Vec<u8> {
        let mut codec = LegacyCodec::new(131_072);
        let mut buf = bytes::BytesMut::new();
        for item in items {
            codec.encode(item, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn inner() -> Arc<ConnectionInner> {
        let settings = ConnectionSettings {
            protocol_version: ProtocolVersion::V0_9_1,
            ..Default::default()
        };
        Arc::new(ConnectionInner::new(
            settings,
            Arc::new(SaslRegistry::with_builtin()),
            Arc::new(TcpConnector::default()),
        ))
    }

    #[tokio::test]
    async fn queued_items_are_written_in_order_and_close_stops() {
        let first = ProtocolEvent::new(1, Method::BasicAck {
            delivery_tag: 1,
            multiple: false,
        });
        let second = ProtocolEvent::new(1, Method::BasicAck {
            delivery_tag: 2,
            multiple: false,
        });
        let expected = encode(vec![Item::Event(first.clone()), Item::Event(second.clone())]);
        let mock = Builder::new().write(&expected).build();

        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 131_072).unwrap();
        let transport = Transport::bind(mock, codec, None);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = ConnectionEngine::new(transport, inner(), rx, 0);

        tx.send(Outgoing::Item {
            item: Item::Event(second),
            flush: false,
        })
        .unwrap();
        tx.send(Outgoing::Close).unwrap();
        let running = engine
            .on_outgoing(Outgoing::Item {
                item: Item::Event(first),
                flush: false,
            })
            .await
            .unwrap();
        assert_eq!(running, Running::Stop);
    }

    #[tokio::test]
    async fn protocol_header_from_broker_is_a_version_mismatch() {
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 131_072).unwrap();
        let transport = Transport::bind(Builder::new().build(), codec, None);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut engine = ConnectionEngine::new(transport, inner(), rx, 0);

        let header = ProtocolVersion::V0_8.header();
        match engine.on_incoming(Ok(Item::ProtocolHeader(header))).await {
            Err(Error::ProtocolVersionMismatch { major, minor }) => {
                assert_eq!((major, minor), (8, 0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_reply_is_offered_to_waiters_only() {
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 131_072).unwrap();
        let transport = Transport::bind(Builder::new().build(), codec, None);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut engine = ConnectionEngine::new(transport, inner(), rx, 0);

        let reply = ProtocolEvent::new(
            1,
            Method::SessionAttached {
                name: Bytes::from_static(b"s"),
            },
        );
        // session.attached does not exist in 0-9-1
        let running = engine.on_incoming(Ok(Item::Event(reply))).await.unwrap();
        assert_eq!(running, Running::Continue);
    }
}
