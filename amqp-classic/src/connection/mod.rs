//! Connection to a broker
//!
//! A [`Connection`] owns one physical transport at a time, driven by a
//! spawned [`ConnectionEngine`](engine::ConnectionEngine). Callers hand the
//! engine [`Outgoing`] items through an unbounded queue and wait for the
//! correlated reply on a [`BlockingWaiter`] that the engine resolves when
//! the reply arrives.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    constants::{
        CONNECTION_CHANNEL, DEFAULT_CHANNEL_MAX, DEFAULT_LEGACY_MAX_FRAME_SIZE,
        DEFAULT_SEGMENTED_MAX_FRAME_SIZE, REPLY_SUCCESS,
    },
    dispatch::MethodDispatcher,
    failover::{self, FailoverPlan, FailoverState, FailoverStatus},
    framing::{FieldTable, Item, Method, MethodKind, ProtocolEvent, ProtocolVersion},
    sasl::{SaslClient, SaslRegistry},
    session::{self, Session, SessionInner, SessionOptions, SessionRegistry},
    state::{ConnectionState, StateManager},
    transport::{Connector, TcpConnector, Transport, WireCodec},
    waiter::{BlockingWaiter, WaiterRegistry},
    Error,
};

mod builder;
pub(crate) mod engine;
pub mod heartbeat;
mod settings;

pub use builder::Builder;
pub use settings::*;

use engine::{ConnectionEngine, Outgoing};

/// Receives failures that end a connection and returned messages
pub trait ExceptionListener: Send + Sync + 'static {
    /// Called once per terminal failure and once per returned message
    fn on_exception(&self, error: &Error);
}

impl<F> ExceptionListener for F
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    fn on_exception(&self, error: &Error) {
        self(error)
    }
}

/// Observes failover
pub trait ConnectionListener: Send + Sync + 'static {
    /// Called before reconnecting. Returning `false` abandons failover.
    fn pre_failover(&self, redirect: bool) -> bool {
        let _ = redirect;
        true
    }

    /// Called once sessions have been restored on the new connection
    fn failover_complete(&self) {}
}

/// Opens connections and owns the state they share
///
/// The SASL registry and the connector are injected into every connection
/// the factory opens.
#[derive(Clone)]
pub struct ConnectionFactory {
    sasl: Arc<SaslRegistry>,
    connector: Arc<dyn Connector>,
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("sasl", &self.sasl)
            .finish()
    }
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory {
    /// Built-in SASL mechanisms over plain TCP
    pub fn new() -> Self {
        Self {
            sasl: Arc::new(SaslRegistry::with_builtin()),
            connector: Arc::new(TcpConnector::default()),
        }
    }

    /// Replaces the SASL registry
    pub fn with_sasl_registry(mut self, registry: SaslRegistry) -> Self {
        self.sasl = Arc::new(registry);
        self
    }

    /// Replaces the connector
    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// The SASL registry handed to new connections
    pub fn sasl_registry(&self) -> &SaslRegistry {
        &self.sasl
    }

    /// Connects to the first reachable broker of `settings`
    #[instrument(skip_all, fields(client_id = %settings.client_id))]
    pub async fn open(&self, settings: ConnectionSettings) -> Result<Connection, Error> {
        settings.validate()?;
        let inner = Arc::new(ConnectionInner::new(
            settings,
            self.sasl.clone(),
            self.connector.clone(),
        ));
        let mut plan = FailoverPlan::new(
            inner.settings.failover.clone(),
            inner.settings.brokers.clone(),
            0,
        );
        match failover::connect(&inner, &mut plan).await {
            Ok(()) => Ok(Connection { inner }),
            Err(error) => {
                inner.closed.store(true, Ordering::SeqCst);
                inner.clear_outgoing();
                inner.failover.abandon(error.clone());
                Err(error)
            }
        }
    }
}

/// Values settled during tuning
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub version: ProtocolVersion,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub server_properties: FieldTable,
    pub known_hosts: Vec<BrokerDetails>,
}

impl Negotiated {
    fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: initial_frame_max(version),
            heartbeat: 0,
            server_properties: FieldTable::new(),
            known_hosts: Vec::new(),
        }
    }
}

/// Frame size used until tuning completes
fn initial_frame_max(version: ProtocolVersion) -> u32 {
    match version.is_segmented() {
        true => DEFAULT_SEGMENTED_MAX_FRAME_SIZE,
        false => DEFAULT_LEGACY_MAX_FRAME_SIZE,
    }
}

/// Whether a synchronous write may bypass the failover latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Normal,
    /// Used by the failover coordinator to restore sessions
    Failover,
}

pub(crate) struct ConnectionInner {
    pub settings: ConnectionSettings,
    pub sasl: Arc<SaslRegistry>,
    pub connector: Arc<dyn Connector>,
    pub state: StateManager,
    pub negotiated: Mutex<Negotiated>,
    pub sasl_client: Mutex<Option<Box<dyn SaslClient>>>,
    dispatcher: Mutex<Arc<MethodDispatcher>>,
    pub sessions: Mutex<SessionRegistry>,
    pub listeners: WaiterRegistry<ProtocolEvent>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    pub failover: FailoverState,
    connection_listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    exception_listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
    pub closing: AtomicBool,
    pub closed: AtomicBool,
    pub terminal_reported: AtomicBool,
    pub established: AtomicBool,
    pub epoch: AtomicU64,
    broker_index: AtomicUsize,
    broker: Mutex<Option<BrokerDetails>>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("state", &self.state.current_state())
            .field("negotiated", &*self.negotiated.lock())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn new(
        settings: ConnectionSettings,
        sasl: Arc<SaslRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let version = settings.protocol_version;
        Self {
            settings,
            sasl,
            connector,
            state: StateManager::default(),
            negotiated: Mutex::new(Negotiated::new(version)),
            sasl_client: Mutex::new(None),
            dispatcher: Mutex::new(Arc::new(MethodDispatcher::for_version(version))),
            sessions: Mutex::new(SessionRegistry::default()),
            listeners: WaiterRegistry::default(),
            outgoing: Mutex::new(None),
            failover: FailoverState::default(),
            connection_listeners: Mutex::new(Vec::new()),
            exception_listener: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            terminal_reported: AtomicBool::new(false),
            established: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            broker_index: AtomicUsize::new(0),
            broker: Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.negotiated.lock().version
    }

    /// Switches method routing to `version`
    pub fn set_version(&self, version: ProtocolVersion) {
        let mut negotiated = self.negotiated.lock();
        if negotiated.version != version {
            debug!(from = %negotiated.version, to = %version, "protocol version change");
            negotiated.version = version;
            *self.dispatcher.lock() = Arc::new(MethodDispatcher::for_version(version));
        }
    }

    pub fn dispatcher(&self) -> Arc<MethodDispatcher> {
        self.dispatcher.lock().clone()
    }

    /// The broker being connected to, or the last one connected to
    pub fn broker(&self) -> Option<BrokerDetails> {
        self.broker.lock().clone()
    }

    pub fn broker_index(&self) -> usize {
        self.broker_index.load(Ordering::SeqCst)
    }

    pub fn set_broker_index(&self, index: usize) {
        self.broker_index.store(index, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<(), Error> {
        match self.is_closed() || self.closing.load(Ordering::SeqCst) {
            true => Err(Error::ConnectionClosed),
            false => Ok(()),
        }
    }

    fn unavailable(&self) -> Error {
        match self.failover.is_in_progress() {
            true => Error::FailoverInProgress,
            false => Error::ConnectionClosed,
        }
    }

    /// Hands an item to the engine
    pub fn send(&self, outgoing: Outgoing) -> Result<(), Error> {
        let sender = self.outgoing.lock().clone();
        match sender {
            Some(sender) => sender.send(outgoing).map_err(|_| self.unavailable()),
            None => Err(self.unavailable()),
        }
    }

    pub fn clear_outgoing(&self) {
        self.outgoing.lock().take();
    }

    /// Queues a method without waiting for any reply
    pub fn write(&self, event: ProtocolEvent, flush: bool) -> Result<(), Error> {
        self.dispatcher().check_outgoing(event.method.kind())?;
        trace!(channel = event.channel, method = %event.method.kind(), flush, "queue");
        self.send(Outgoing::Item {
            item: Item::Event(event),
            flush,
        })
    }

    /// Writes a method and waits for one of `expect` on the same channel
    pub async fn sync_write(
        &self,
        event: ProtocolEvent,
        expect: &[MethodKind],
    ) -> Result<ProtocolEvent, Error> {
        self.sync_write_with(event, expect, WriteMode::Normal).await
    }

    /// Writes a method and waits for one of `expect` on the same channel
    ///
    /// The waiter is registered before the method is queued so that a fast
    /// reply cannot be missed. A `channel.close` or `session.detached` on
    /// the channel fails the call.
    pub async fn sync_write_with(
        &self,
        event: ProtocolEvent,
        expect: &[MethodKind],
        mode: WriteMode,
    ) -> Result<ProtocolEvent, Error> {
        let channel = event.channel;
        let expected: Arc<[MethodKind]> = expect.into();
        let description = format!(
            "{} on channel {}",
            expected
                .iter()
                .map(|kind| kind.name())
                .collect::<Vec<_>>()
                .join(" or "),
            channel
        );
        let accepted = expected.clone();
        let waiter = BlockingWaiter::new(description, move |reply: &ProtocolEvent| {
            let kind = reply.method.kind();
            reply.channel == channel
                && (accepted.contains(&kind)
                    || (channel != CONNECTION_CHANNEL
                        && matches!(kind, MethodKind::ChannelClose | MethodKind::SessionDetached)))
        });
        let registration = self.listeners.register(Arc::new(waiter));

        if mode == WriteMode::Normal {
            self.failover.ensure_not_in_progress()?;
        }
        self.write(event, true)?;
        let reply = registration
            .waiter()
            .block(self.settings.sync_timeout)
            .await?;
        reply_to_result(reply)
    }

    pub fn session(&self, channel: u16) -> Option<Arc<SessionInner>> {
        self.sessions.lock().get(channel)
    }

    /// Sessions in ascending channel order
    pub fn sessions_sorted(&self) -> Vec<Arc<SessionInner>> {
        self.sessions.lock().sorted()
    }

    pub fn release_session(&self, channel: u16) {
        self.sessions.lock().release(channel);
    }

    pub fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.connection_listeners.lock().clone()
    }

    /// Passes an error to the exception listener without ending anything
    pub fn report_exception(&self, error: &Error) {
        let listener = self.exception_listener.lock().clone();
        match listener {
            Some(listener) => listener.on_exception(error),
            None => warn!(%error, "no exception listener set"),
        }
    }

    /// Resets per attempt state and installs a fresh outgoing queue
    fn begin_attempt(
        &self,
        broker: &BrokerDetails,
        version: ProtocolVersion,
    ) -> (u64, mpsc::UnboundedReceiver<Outgoing>) {
        self.state.reset();
        self.established.store(false, Ordering::SeqCst);
        *self.negotiated.lock() = Negotiated::new(version);
        *self.dispatcher.lock() = Arc::new(MethodDispatcher::for_version(version));
        self.sasl_client.lock().take();
        *self.broker.lock() = Some(broker.clone());

        let (sender, receiver) = mpsc::unbounded_channel();
        *self.outgoing.lock() = Some(sender);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        (epoch, receiver)
    }

    /// Makes a running engine stale and stops it
    fn abandon_attempt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.clear_outgoing();
    }
}

fn reply_to_result(reply: ProtocolEvent) -> Result<ProtocolEvent, Error> {
    match &reply.method {
        Method::ChannelClose {
            reply_code,
            reply_text,
            ..
        } => Err(Error::ChannelClosedByPeer {
            channel: reply.channel,
            reply_code: *reply_code,
            reply_text: reply_text.clone(),
        }),
        Method::SessionDetached { name, code } => Err(Error::SessionDetached(format!(
            "session {} detached with code {}",
            String::from_utf8_lossy(name),
            code
        ))),
        _ => Ok(reply),
    }
}

/// Opens a connection to `broker`, retrying once with the version the
/// broker asks for if it rejects the proposed one
pub(crate) async fn establish(
    inner: &Arc<ConnectionInner>,
    broker: &BrokerDetails,
) -> Result<(), Error> {
    let requested = inner.settings.protocol_version;
    let error = match establish_with_version(inner, broker, requested).await {
        Err(error @ Error::ProtocolVersionMismatch { .. }) => error,
        other => return other,
    };

    let offered = match &error {
        Error::ProtocolVersionMismatch { major, minor } => {
            match ProtocolVersion::from_numbers(*major, *minor) {
                Some(version) => Some(version),
                None if inner.settings.accept_broker_version => Some(ProtocolVersion::latest()),
                None => None,
            }
        }
        _ => None,
    };
    match offered {
        Some(version) if version != requested => {
            info!(%requested, offered = %version, "broker rejected protocol version, retrying");
            establish_with_version(inner, broker, version).await
        }
        _ => Err(error),
    }
}

#[instrument(skip_all, fields(broker = %broker, %version))]
async fn establish_with_version(
    inner: &Arc<ConnectionInner>,
    broker: &BrokerDetails,
    version: ProtocolVersion,
) -> Result<(), Error> {
    let io = inner.connector.connect(broker).await?;
    let codec = WireCodec::for_version(version, initial_frame_max(version))?;
    let transport = Transport::bind(io, codec, None);

    let (epoch, receiver) = inner.begin_attempt(broker, version);
    // Registered before the header goes out so no transition is missed
    let waiter = inner
        .state
        .create_waiter(&[ConnectionState::Open, ConnectionState::Closed]);
    inner.send(Outgoing::Item {
        item: Item::ProtocolHeader(version.header()),
        flush: true,
    })?;

    let engine = ConnectionEngine::new(transport, inner.clone(), receiver, epoch);
    let handle = engine.spawn();

    let outcome = waiter.await_state(inner.settings.state_wait_timeout).await;
    match outcome {
        Ok(ConnectionState::Open) => {
            inner.established.store(true, Ordering::SeqCst);
            *inner.engine.lock() = Some(handle);
            info!(version = %inner.version(), "connection open");
            Ok(())
        }
        Ok(state) => {
            inner.abandon_attempt();
            handle.abort();
            Err(inner.state.take_last_error().unwrap_or_else(|| {
                Error::Protocol(format!("connection reached {} during handshake", state))
            }))
        }
        Err(error) => {
            inner.abandon_attempt();
            handle.abort();
            debug!(%error, "connection attempt failed");
            Err(error)
        }
    }
}

/// Marks the connection closed once a client initiated close has finished
pub(crate) async fn finalize_close(inner: &Arc<ConnectionInner>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.clear_outgoing();
    inner.state.change_state(ConnectionState::Closed);
    let sessions = inner.sessions.lock().drain();
    for session in sessions {
        session.mark_closed(Error::ConnectionClosed);
    }
    inner.listeners.propagate_error(Error::ConnectionClosed).await;
    inner.failover.abandon(Error::ConnectionClosed);
    info!("connection closed");
}

/// A connection to a broker
///
/// Dropping the connection stops its engine.
#[derive(Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a builder for [`Connection`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Opens a connection with the default [`ConnectionFactory`]
    pub async fn open(settings: ConnectionSettings) -> Result<Self, Error> {
        ConnectionFactory::new().open(settings).await
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current_state()
    }

    /// Version in use
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version()
    }

    /// Highest usable channel id
    pub fn channel_max(&self) -> u16 {
        self.inner.negotiated.lock().channel_max
    }

    /// Negotiated max frame size, 0 if unlimited
    pub fn max_frame_size(&self) -> u32 {
        self.inner.negotiated.lock().frame_max
    }

    /// Negotiated heartbeat interval, `None` if heartbeats are disabled
    pub fn heartbeat(&self) -> Option<Duration> {
        match self.inner.negotiated.lock().heartbeat {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Properties the broker sent in `connection.start`
    pub fn server_properties(&self) -> FieldTable {
        self.inner.negotiated.lock().server_properties.clone()
    }

    /// Alternative brokers advertised in `connection.open-ok`
    pub fn known_hosts(&self) -> Vec<BrokerDetails> {
        self.inner.negotiated.lock().known_hosts.clone()
    }

    /// The broker currently connected to
    pub fn current_broker(&self) -> Option<BrokerDetails> {
        self.inner.broker()
    }

    /// Whether failover is idle, running or has given up
    pub fn failover_status(&self) -> FailoverStatus {
        self.inner.failover.status()
    }

    /// The error kept by the state machine when nobody was waiting for it
    pub fn last_error(&self) -> Option<Error> {
        self.inner.state.last_error()
    }

    /// Forgets the kept error
    pub fn clear_last_error(&self) {
        self.inner.state.clear_last_error()
    }

    /// Whether the connection has been closed for good
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Sets the listener told about terminal failures and returned messages
    pub fn set_exception_listener(&self, listener: impl ExceptionListener) {
        *self.inner.exception_listener.lock() = Some(Arc::new(listener));
    }

    /// Adds a failover listener
    pub fn add_connection_listener(&self, listener: impl ConnectionListener) {
        self.inner.connection_listeners.lock().push(Arc::new(listener));
    }

    /// Opens a session on the next free channel
    pub async fn create_session(&self, options: SessionOptions) -> Result<Session, Error> {
        let inner = &self.inner;
        let options = &options;
        let session = failover::protected(inner, || async move {
            session::create(inner, options.clone()).await
        })
        .await?;
        Ok(Session::new(inner.clone(), session))
    }

    /// Closes every session, then the connection
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.is_closed() || inner.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        if inner.failover.block_until_not_failing_over().await.is_err() {
            return Ok(());
        }
        inner.closing.store(true, Ordering::SeqCst);

        for session in inner.sessions_sorted() {
            if let Err(error) = session::close(inner, &session).await {
                debug!(channel = session.channel, %error, "session close failed");
            }
        }

        let mut result = Ok(());
        if inner.state.current_state() == ConnectionState::Open {
            inner.state.change_state(ConnectionState::Closing);
            let close = ProtocolEvent::new(
                CONNECTION_CHANNEL,
                Method::ConnectionClose {
                    reply_code: REPLY_SUCCESS,
                    reply_text: "client close".into(),
                    class_id: 0,
                    method_id: 0,
                },
            );
            let reply = inner
                .sync_write_with(close, &[MethodKind::ConnectionCloseOk], WriteMode::Failover)
                .await;
            if let Err(error) = reply {
                warn!(%error, "broker did not confirm close");
                result = Err(error);
            }
        }

        let _ = inner.send(Outgoing::Close);
        let handle = inner.engine.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                error!(%error, "connection engine panicked");
            }
        }
        finalize_close(inner).await;
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.inner.is_closed() || self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.state.current_state() == ConnectionState::Open {
            let close = ProtocolEvent::new(
                CONNECTION_CHANNEL,
                Method::ConnectionClose {
                    reply_code: REPLY_SUCCESS,
                    reply_text: "client dropped".into(),
                    class_id: 0,
                    method_id: 0,
                },
            );
            let _ = self.inner.write(close, true);
        }
        let _ = self.inner.send(Outgoing::Close);
    }
}
