#![allow(dead_code)]

//! A scripted in-memory broker
//!
//! Every connection attempt made through [`ScriptedConnector`] pops the next
//! script registered for the broker's host and runs it against the server
//! end of a duplex pipe.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    io,
    sync::Arc,
    time::Duration,
};

use amqp_classic::{
    framing::{
        legacy::LegacyCodec, BasicProperties, ContentHeader, FieldTable, Item, Method, MethodKind,
        ProtocolEvent, ProtocolHeader, ProtocolVersion,
    },
    sasl::SaslProfile,
    transport::{connector::BoxedIo, Connector, WireCodec},
    BrokerDetails, ConnectionFactory, ConnectionSettings, FailoverPolicy,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{io::DuplexStream, task::JoinHandle};
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Script = Box<dyn FnOnce(MockBroker) -> BoxFuture<'static, ()> + Send>;

/// Framing the broker side of a scripted connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Legacy,
    Segmented,
}

impl Framing {
    fn codec(self) -> WireCodec {
        match self {
            Self::Legacy => WireCodec::Legacy(LegacyCodec::new(1 << 20)),
            Self::Segmented => WireCodec::for_version(ProtocolVersion::V0_10, u16::MAX as u32)
                .expect("segmented codec"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    scripts: Arc<Mutex<HashMap<String, VecDeque<(Framing, Script)>>>>,
    attempts: Arc<Mutex<Vec<String>>>,
    brokers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ScriptedConnector {
    /// Queues a script for the next connection to `host`
    pub fn script<F, Fut>(&self, host: &str, script: F)
    where
        F: FnOnce(MockBroker) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.script_with(host, Framing::Legacy, script)
    }

    /// Queues a script that speaks 0-10 segment framing
    pub fn script_segmented<F, Fut>(&self, host: &str, script: F)
    where
        F: FnOnce(MockBroker) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.script_with(host, Framing::Segmented, script)
    }

    fn script_with<F, Fut>(&self, host: &str, framing: Framing, script: F)
    where
        F: FnOnce(MockBroker) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let script: Script = Box::new(move |broker| Box::pin(script(broker)));
        self.scripts
            .lock()
            .entry(host.to_string())
            .or_default()
            .push_back((framing, script));
    }

    /// Hosts in the order connections were attempted
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn factory(&self) -> ConnectionFactory {
        ConnectionFactory::new().with_connector(self.clone())
    }

    /// Waits for every broker script and re-raises their panics
    pub async fn join_brokers(&self) {
        let handles: Vec<_> = self.brokers.lock().drain(..).collect();
        for handle in handles {
            tokio::time::timeout(RECV_TIMEOUT, handle)
                .await
                .expect("broker script did not finish")
                .expect("broker script panicked");
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, broker: &BrokerDetails) -> Result<BoxedIo, io::Error> {
        self.attempts.lock().push(broker.host.clone());
        let script = self
            .scripts
            .lock()
            .get_mut(&broker.host)
            .and_then(VecDeque::pop_front);
        let (framing, script) = script.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no script for host")
        })?;

        let (client, server) = tokio::io::duplex(1 << 16);
        let handle = tokio::spawn(script(MockBroker::new(server, framing)));
        self.brokers.lock().push(handle);
        Ok(Box::new(client))
    }
}

/// Parameters of the broker side of the handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    pub version: (u8, u8),
    pub mechanisms: &'static str,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub known_hosts: String,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            version: (0, 9),
            mechanisms: "PLAIN AMQPLAIN",
            channel_max: 0,
            frame_max: 131_072,
            heartbeat: 0,
            known_hosts: String::new(),
        }
    }
}

/// What the client sent during the handshake
#[derive(Debug)]
pub struct HandshakeLog {
    pub header: ProtocolHeader,
    pub start_ok: ProtocolEvent,
    pub tune_ok: ProtocolEvent,
    pub open: ProtocolEvent,
}

pub struct MockBroker {
    framed: Framed<DuplexStream, WireCodec>,
    /// Every method received so far
    pub received: Vec<ProtocolEvent>,
}

impl MockBroker {
    fn new(io: DuplexStream, framing: Framing) -> Self {
        Self {
            framed: Framed::new(io, framing.codec()),
            received: Vec::new(),
        }
    }

    /// `None` once the client has closed the stream
    pub async fn recv(&mut self) -> Option<Item> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
                .await
                .expect("client went quiet");
            match next {
                Some(Ok(Item::Heartbeat)) => continue,
                Some(Ok(Item::Event(event))) => {
                    self.received.push(event.clone());
                    return Some(Item::Event(event));
                }
                Some(Ok(item)) => return Some(item),
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn expect_header(&mut self) -> ProtocolHeader {
        match self.recv().await {
            Some(Item::ProtocolHeader(header)) => header,
            other => panic!("expected a protocol header, got {:?}", other),
        }
    }

    pub async fn expect(&mut self, kind: MethodKind) -> ProtocolEvent {
        match self.recv().await {
            Some(Item::Event(event)) if event.method.kind() == kind => event,
            other => panic!("expected {}, got {:?}", kind, other),
        }
    }

    pub async fn send(&mut self, channel: u16, method: Method) {
        self.send_event(ProtocolEvent::new(channel, method)).await
    }

    pub async fn send_event(&mut self, event: ProtocolEvent) {
        self.framed
            .send(Item::Event(event))
            .await
            .expect("client end dropped");
    }

    pub async fn send_header(&mut self, header: ProtocolHeader) {
        self.framed
            .send(Item::ProtocolHeader(header))
            .await
            .expect("client end dropped");
    }

    pub async fn deliver(&mut self, channel: u16, consumer_tag: &str, delivery_tag: u64, body: &'static [u8]) {
        let deliver = Method::BasicDeliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q".into(),
        };
        let event = ProtocolEvent::new(channel, deliver).with_content(
            ContentHeader::basic(body.len() as u64, BasicProperties::default()),
            Bytes::from_static(body),
        );
        self.send_event(event).await
    }

    /// Runs the broker side up to `connection.open`, without answering it
    pub async fn handshake_until_open(&mut self, params: &Handshake) -> HandshakeLog {
        let header = self.expect_header().await;
        self.send(
            0,
            Method::ConnectionStart {
                version_major: params.version.0,
                version_minor: params.version.1,
                server_properties: FieldTable::new(),
                mechanisms: Bytes::from_static(params.mechanisms.as_bytes()),
                locales: Bytes::from_static(b"en_US"),
            },
        )
        .await;
        let start_ok = self.expect(MethodKind::ConnectionStartOk).await;
        self.send(
            0,
            Method::ConnectionTune {
                channel_max: params.channel_max,
                frame_max: params.frame_max,
                heartbeat_min: 0,
                heartbeat_max: params.heartbeat,
            },
        )
        .await;
        let tune_ok = self.expect(MethodKind::ConnectionTuneOk).await;
        let open = self.expect(MethodKind::ConnectionOpen).await;
        HandshakeLog {
            header,
            start_ok,
            tune_ok,
            open,
        }
    }

    pub async fn handshake(&mut self, params: &Handshake) -> HandshakeLog {
        let log = self.handshake_until_open(params).await;
        self.send(
            0,
            Method::ConnectionOpenOk {
                known_hosts: params.known_hosts.clone(),
            },
        )
        .await;
        log
    }

    /// Answers requests until `kind` arrives, which is returned unanswered
    pub async fn serve_until(&mut self, kind: MethodKind) -> ProtocolEvent {
        loop {
            let event = match self.recv().await {
                Some(Item::Event(event)) => event,
                other => panic!("stream ended while waiting for {}: {:?}", kind, other),
            };
            if event.method.kind() == kind {
                return event;
            }
            self.answer(&event).await;
        }
    }

    /// Answers requests until the client closes the stream
    pub async fn serve(&mut self) {
        while let Some(item) = self.recv().await {
            if let Item::Event(event) = item {
                self.answer(&event).await;
            }
        }
    }

    /// Sends the reply a cooperative broker would send, if any
    pub async fn answer(&mut self, event: &ProtocolEvent) {
        let reply = match &event.method {
            Method::ChannelOpen => Some(Method::ChannelOpenOk),
            Method::SessionAttach { name, .. } => Some(Method::SessionAttached { name: name.clone() }),
            Method::ChannelClose { .. } => Some(Method::ChannelCloseOk),
            Method::ChannelFlow { active } => Some(Method::ChannelFlowOk { active: *active }),
            Method::BasicQos { .. } => Some(Method::BasicQosOk),
            Method::QueueDeclare { queue, .. } => Some(Method::QueueDeclareOk {
                queue: match queue.is_empty() {
                    true => "amq.gen-1".into(),
                    false => queue.clone(),
                },
                message_count: 0,
                consumer_count: 0,
            }),
            Method::QueueBind { .. } => Some(Method::QueueBindOk),
            Method::BasicConsume { consumer_tag, .. } => Some(Method::BasicConsumeOk {
                consumer_tag: consumer_tag.clone(),
            }),
            Method::BasicCancel { consumer_tag, .. } => Some(Method::BasicCancelOk {
                consumer_tag: consumer_tag.clone(),
            }),
            Method::BasicRecover { .. } => Some(Method::BasicRecoverOk),
            Method::TxSelect => Some(Method::TxSelectOk),
            Method::TxCommit => Some(Method::TxCommitOk),
            Method::TxRollback => Some(Method::TxRollbackOk),
            Method::ConnectionClose { .. } => Some(Method::ConnectionCloseOk),
            _ => None,
        };
        if let Some(reply) = reply {
            self.send(event.channel, reply).await;
        }
    }

    /// Kinds of every method received so far
    pub fn received_kinds(&self) -> Vec<MethodKind> {
        self.received.iter().map(|e| e.method.kind()).collect()
    }
}

/// Settings for brokers that accept `guest`/`guest` over PLAIN
pub fn settings(hosts: &[&str]) -> ConnectionSettings {
    ConnectionSettings {
        client_id: "test-client".into(),
        profile: SaslProfile::Plain {
            username: "guest".into(),
            password: "guest".into(),
        },
        sync_timeout: Duration::from_secs(2),
        state_wait_timeout: Duration::from_secs(2),
        failover: FailoverPolicy {
            retries: 0,
            connect_delay: Duration::ZERO,
            cycle_count: 1,
        },
        brokers: hosts
            .iter()
            .map(|host| BrokerDetails::new(*host, 5672))
            .collect(),
        ..Default::default()
    }
}

/// Polls `condition` until it holds or a second has passed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
