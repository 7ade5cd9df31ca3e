//! Sessions bound to a channel
//!
//! A session issues commands on its channel and keeps the bookkeeping that
//! acknowledgement, transactions and prefetch credit need. Everything a
//! session declares or subscribes to is recorded so that it can be
//! replayed on a new connection after failover.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slab::Slab;
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::{
    connection::{ConnectionInner, WriteMode},
    constants::{MIN_USABLE_CHANNEL_NUM, REPLY_SUCCESS},
    dispatch::SessionOpen,
    failover,
    framing::{FieldTable, Method, MethodKind, ProtocolEvent},
    Error,
};

pub(crate) mod consumer;
mod credit;
mod producer;

pub use consumer::{Consumer, ConsumerOptions, Message, MessageListener};
pub use producer::Producer;

use consumer::{ConsumerInner, Threshold};
use credit::{is_managing_credit, Credit, CreditAction};

/// When received messages are settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcknowledgeMode {
    /// Each message is acknowledged as it is handed to the application
    #[default]
    Auto,
    /// The application acknowledges explicitly
    Client,
    /// Like `Auto`, duplicates are tolerated
    DupsOk,
    /// Messages are settled by `commit` and `rollback`
    Transacted,
}

/// Who decides whether rejected messages come back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectBehaviour {
    /// Rejected messages are requeued
    #[default]
    Normal,
    /// Rejected messages are not requeued and the broker applies its own
    /// dead lettering
    Server,
}

/// Session parameters. Unset prefetch marks fall back to the connection
/// settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Acknowledge mode
    pub acknowledge_mode: AcknowledgeMode,
    /// Prefetch window and delivery queue high water mark
    pub prefetch_high: Option<u16>,
    /// Delivery queue low water mark
    pub prefetch_low: Option<u16>,
    /// Reject behaviour on recover and rollback
    pub reject_behaviour: RejectBehaviour,
}

impl SessionOptions {
    /// Options for a session with the given acknowledge mode
    pub fn new(acknowledge_mode: AcknowledgeMode) -> Self {
        Self {
            acknowledge_mode,
            ..Default::default()
        }
    }

    /// Options for a transacted session
    pub fn transacted() -> Self {
        Self::new(AcknowledgeMode::Transacted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub acknowledge_mode: AcknowledgeMode,
    pub prefetch_high: u16,
    pub prefetch_low: u16,
    pub reject_behaviour: RejectBehaviour,
}

/// Result of `queue.declare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Queue name, generated by the broker for an empty name
    pub queue: String,
    /// Messages ready in the queue
    pub message_count: u32,
    /// Active consumers of the queue
    pub consumer_count: u32,
}

/// `queue.declare` flags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    #[allow(missing_docs)]
    pub passive: bool,
    #[allow(missing_docs)]
    pub durable: bool,
    #[allow(missing_docs)]
    pub exclusive: bool,
    #[allow(missing_docs)]
    pub auto_delete: bool,
    /// Broker specific arguments
    pub arguments: FieldTable,
}

/* -------------------------------------------------------------------------- */
/*                                  Registry                                  */
/* -------------------------------------------------------------------------- */

/// Channel id allocation and the sessions using them
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    ids: Slab<()>,
    sessions: BTreeMap<u16, Arc<SessionInner>>,
}

impl SessionRegistry {
    /// Reserves the lowest free channel id
    pub fn allocate(&mut self, channel_max: u16) -> Result<u16, Error> {
        let entry = self.ids.vacant_entry();
        let channel = entry.key() + MIN_USABLE_CHANNEL_NUM as usize;
        if channel > channel_max as usize {
            return Err(Error::ChannelLimitReached(channel_max));
        }
        entry.insert(());
        Ok(channel as u16)
    }

    pub fn insert(&mut self, session: Arc<SessionInner>) -> Result<(), Error> {
        let channel = session.channel;
        if self.sessions.contains_key(&channel) {
            return Err(Error::IllegalState(format!(
                "channel {} is already in use",
                channel
            )));
        }
        self.sessions.insert(channel, session);
        Ok(())
    }

    pub fn release(&mut self, channel: u16) {
        self.sessions.remove(&channel);
        if let Some(key) = (channel as usize).checked_sub(MIN_USABLE_CHANNEL_NUM as usize) {
            if self.ids.contains(key) {
                self.ids.remove(key);
            }
        }
    }

    pub fn get(&self, channel: u16) -> Option<Arc<SessionInner>> {
        self.sessions.get(&channel).cloned()
    }

    /// Sessions in ascending channel order
    pub fn sorted(&self) -> Vec<Arc<SessionInner>> {
        self.sessions.values().cloned().collect()
    }

    /// Removes every session and frees every id
    pub fn drain(&mut self) -> Vec<Arc<SessionInner>> {
        self.ids.clear();
        std::mem::take(&mut self.sessions).into_values().collect()
    }
}

/* -------------------------------------------------------------------------- */
/*                                SessionInner                                */
/* -------------------------------------------------------------------------- */

#[derive(Debug)]
struct SessionState {
    closed: Option<Error>,
    unacknowledged_tags: BTreeSet<u64>,
    delivered_tags: BTreeSet<u64>,
    credit: Credit,
    suspended: bool,
    threshold_suspend: bool,
    consumers: BTreeMap<String, Arc<ConsumerInner>>,
    resources: Vec<Method>,
    next_consumer_tag: u64,
    /// Publishes or deliveries since the last commit or rollback
    transaction_dirty: bool,
    /// A failover happened while the transaction was dirty
    failed_over_dirty: bool,
}

pub(crate) struct SessionInner {
    pub channel: u16,
    pub options: ResolvedOptions,
    /// Held by every operation and by failover, which takes the locks of
    /// all sessions in ascending channel order
    pub op_lock: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    /// `false` while the broker has paused publishing
    flow: watch::Sender<bool>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("channel", &self.channel)
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl SessionInner {
    pub fn new(channel: u16, options: ResolvedOptions) -> Self {
        let (flow, _) = watch::channel(true);
        Self {
            channel,
            options,
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                closed: None,
                unacknowledged_tags: BTreeSet::new(),
                delivered_tags: BTreeSet::new(),
                credit: Credit::new(options.prefetch_high),
                suspended: false,
                threshold_suspend: false,
                consumers: BTreeMap::new(),
                resources: Vec::new(),
                next_consumer_tag: 1,
                transaction_dirty: false,
                failed_over_dirty: false,
            }),
            flow,
        }
    }

    pub fn ensure_open(&self) -> Result<(), Error> {
        match self.state.lock().closed {
            Some(_) => Err(Error::SessionClosed(self.channel)),
            None => Ok(()),
        }
    }

    /// Why the session closed
    pub fn close_reason(&self) -> Option<Error> {
        self.state.lock().closed.clone()
    }

    /// Closes the session locally. The first reason is kept.
    pub fn mark_closed(&self, reason: Error) {
        let consumers: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                debug!(channel = self.channel, %reason, "session closed");
                state.closed = Some(reason);
            }
            std::mem::take(&mut state.consumers).into_values().collect()
        };
        for consumer in consumers {
            consumer.mark_closed();
        }
        self.flow.send_replace(true);
    }

    pub fn prefetch(&self) -> u16 {
        self.state.lock().credit.prefetch()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
    }

    /// Broker side `channel.flow`
    pub fn set_flow(&self, active: bool) {
        debug!(channel = self.channel, active, "broker changed channel flow");
        self.flow.send_replace(active);
    }

    pub fn subscribe_flow(&self) -> watch::Receiver<bool> {
        self.flow.subscribe()
    }

    pub fn consumer(&self, tag: &str) -> Option<Arc<ConsumerInner>> {
        self.state.lock().consumers.get(tag).cloned()
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerInner>> {
        self.state.lock().consumers.values().cloned().collect()
    }

    pub fn remove_consumer(&self, tag: &str) -> Option<Arc<ConsumerInner>> {
        self.state.lock().consumers.remove(tag)
    }

    pub fn has_message_listeners(&self) -> bool {
        self.state
            .lock()
            .consumers
            .values()
            .any(|consumer| consumer.has_listener())
    }

    fn next_consumer_tag(&self) -> String {
        let mut state = self.state.lock();
        let n = state.next_consumer_tag;
        state.next_consumer_tag += 1;
        format!("ctag-{}-{}", self.channel, n)
    }

    fn record_resource(&self, method: Method) {
        self.state.lock().resources.push(method);
    }

    pub fn record_unacknowledged(&self, tag: u64, managing: bool) {
        let mut state = self.state.lock();
        state.unacknowledged_tags.insert(tag);
        if managing {
            state.credit.increment();
        }
    }

    pub fn record_delivered(&self, tag: u64, managing: bool) {
        let mut state = self.state.lock();
        state.delivered_tags.insert(tag);
        state.transaction_dirty = true;
        if managing {
            state.credit.increment();
        }
    }

    pub fn unacknowledged_tags(&self) -> Vec<u64> {
        self.state.lock().unacknowledged_tags.iter().copied().collect()
    }

    /// Forgets `delivery_tag`, or every tag up to it with `multiple`.
    /// Returns whether any of them was outstanding.
    pub fn forget_unacknowledged(&self, delivery_tag: u64, multiple: bool) -> bool {
        let mut state = self.state.lock();
        match multiple {
            true => {
                let before = state.unacknowledged_tags.len();
                state.unacknowledged_tags.retain(|tag| *tag > delivery_tag);
                state.unacknowledged_tags.len() != before
            }
            false => state.unacknowledged_tags.remove(&delivery_tag),
        }
    }

    /// Forgets a single tag, whether handed out for acknowledgement or
    /// delivered inside a transaction. Returns whether it was tracked.
    pub fn forget_outstanding(&self, delivery_tag: u64) -> bool {
        let mut state = self.state.lock();
        let unacknowledged = state.unacknowledged_tags.remove(&delivery_tag);
        state.delivered_tags.remove(&delivery_tag) || unacknowledged
    }

    /// A transacted publish went out
    pub fn mark_transaction_dirty(&self) {
        if self.options.acknowledge_mode == AcknowledgeMode::Transacted {
            self.state.lock().transaction_dirty = true;
        }
    }

    /// Whether a failover lost work of the current transaction. Clears
    /// the flag.
    fn take_failed_over_dirty(&self) -> bool {
        std::mem::take(&mut self.state.lock().failed_over_dirty)
    }

    fn transaction_ended(&self) {
        let mut state = self.state.lock();
        state.transaction_dirty = false;
        state.credit.reset();
    }

    /// Queues a delivery for its consumer. Returns `true` when the high
    /// water mark was reached and the channel should be suspended.
    pub fn on_deliver(&self, event: &ProtocolEvent) -> Result<bool, Error> {
        let message = consumer::Message::from_delivery(event)
            .ok_or_else(|| Error::Protocol("expected basic.deliver".into()))?;
        let consumer = match self.consumer(&message.consumer_tag) {
            Some(consumer) => consumer,
            None => {
                warn!(
                    channel = self.channel,
                    consumer = %message.consumer_tag,
                    tag = message.delivery_tag,
                    "delivery for unknown consumer"
                );
                return Ok(false);
            }
        };
        trace!(channel = self.channel, tag = message.delivery_tag, "delivery queued");
        match consumer.queue.push(message) {
            Some(Threshold::High) => {
                let mut state = self.state.lock();
                match state.threshold_suspend || state.suspended {
                    true => Ok(false),
                    false => {
                        state.threshold_suspend = true;
                        Ok(true)
                    }
                }
            }
            _ => Ok(false),
        }
    }

    /// Forgets everything tied to the old connection
    pub fn failover_prep(&self) {
        let consumers = {
            let mut state = self.state.lock();
            state.unacknowledged_tags.clear();
            state.delivered_tags.clear();
            state.credit.reset();
            state.credit.take_changed();
            state.suspended = false;
            state.threshold_suspend = false;
            if std::mem::take(&mut state.transaction_dirty) {
                state.failed_over_dirty = true;
            }
            state.consumers.values().cloned().collect::<Vec<_>>()
        };
        for consumer in consumers {
            let dropped = consumer.queue.clear();
            if !dropped.is_empty() {
                debug!(channel = self.channel, count = dropped.len(), "dropped prefetched messages");
            }
        }
        self.flow.send_replace(true);
    }
}

/* -------------------------------------------------------------------------- */
/*                          Operations on the channel                         */
/* -------------------------------------------------------------------------- */

fn event(session: &SessionInner, method: Method) -> ProtocolEvent {
    ProtocolEvent::new(session.channel, method)
}

fn session_name(connection: &ConnectionInner, channel: u16) -> bytes::Bytes {
    let client_id = match connection.settings.client_id.is_empty() {
        true => "client",
        false => connection.settings.client_id.as_str(),
    };
    bytes::Bytes::from(format!("{}-{}", client_id, channel))
}

/// Opens the channel and applies the transaction and prefetch settings
async fn open(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
    mode: WriteMode,
) -> Result<(), Error> {
    match connection.dispatcher().capabilities().session_open {
        SessionOpen::ChannelOpen => {
            connection
                .sync_write_with(
                    event(session, Method::ChannelOpen),
                    &[MethodKind::ChannelOpenOk],
                    mode,
                )
                .await?;
        }
        SessionOpen::SessionAttach => {
            let attach = Method::SessionAttach {
                name: session_name(connection, session.channel),
                force: false,
            };
            connection
                .sync_write_with(event(session, attach), &[MethodKind::SessionAttached], mode)
                .await?;
        }
    }

    if session.options.acknowledge_mode == AcknowledgeMode::Transacted {
        connection
            .sync_write_with(
                event(session, Method::TxSelect),
                &[MethodKind::TxSelectOk],
                mode,
            )
            .await?;
    }

    let prefetch = session.prefetch();
    if prefetch > 0 {
        apply(connection, session, CreditAction::Qos(prefetch), mode).await?;
    } else if is_managing_credit(session.options.acknowledge_mode, prefetch) {
        apply(connection, session, CreditAction::Suspend(true), mode).await?;
    }
    Ok(())
}

async fn apply(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
    action: CreditAction,
    mode: WriteMode,
) -> Result<(), Error> {
    match action {
        CreditAction::Qos(prefetch_count) => {
            let qos = Method::BasicQos {
                prefetch_size: 0,
                prefetch_count,
                global: false,
            };
            connection
                .sync_write_with(event(session, qos), &[MethodKind::BasicQosOk], mode)
                .await?;
        }
        CreditAction::Suspend(suspend) => {
            let flow = Method::ChannelFlow { active: !suspend };
            connection
                .sync_write_with(event(session, flow), &[MethodKind::ChannelFlowOk], mode)
                .await?;
            session.set_suspended(suspend);
        }
    }
    Ok(())
}

/// Creates a session on the next free channel and opens it
#[instrument(skip_all)]
pub(crate) async fn create(
    connection: &Arc<ConnectionInner>,
    options: SessionOptions,
) -> Result<Arc<SessionInner>, Error> {
    connection.ensure_open()?;
    let resolved = ResolvedOptions {
        acknowledge_mode: options.acknowledge_mode,
        prefetch_high: options
            .prefetch_high
            .unwrap_or(connection.settings.prefetch_high),
        prefetch_low: options
            .prefetch_low
            .unwrap_or(connection.settings.prefetch_low),
        reject_behaviour: options.reject_behaviour,
    };
    if resolved.prefetch_low > resolved.prefetch_high {
        return Err(Error::InvalidConfiguration(format!(
            "prefetch low mark {} is above high mark {}",
            resolved.prefetch_low, resolved.prefetch_high
        )));
    }

    let channel_max = connection.negotiated.lock().channel_max;
    let session = {
        let mut sessions = connection.sessions.lock();
        let channel = sessions.allocate(channel_max)?;
        let session = Arc::new(SessionInner::new(channel, resolved));
        if let Err(error) = sessions.insert(session.clone()) {
            sessions.release(channel);
            return Err(error);
        }
        session
    };

    if let Err(error) = open(connection, &session, WriteMode::Normal).await {
        debug!(channel = session.channel, %error, "session open failed");
        session.mark_closed(error.clone());
        connection.release_session(session.channel);
        return Err(error);
    }
    debug!(channel = session.channel, "session open");
    Ok(session)
}

/// Closes the channel and frees its id
pub(crate) async fn close(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<(), Error> {
    if session.ensure_open().is_err() {
        connection.release_session(session.channel);
        return Ok(());
    }
    let result = match connection.dispatcher().capabilities().session_open {
        // Detaching is left to the broker when the connection goes away
        SessionOpen::SessionAttach => Ok(()),
        SessionOpen::ChannelOpen => {
            let close = Method::ChannelClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "client close".into(),
                class_id: 0,
                method_id: 0,
            };
            connection
                .sync_write_with(
                    event(session, close),
                    &[MethodKind::ChannelCloseOk],
                    WriteMode::Failover,
                )
                .await
                .map(|_| ())
        }
    };
    session.mark_closed(Error::SessionClosed(session.channel));
    connection.release_session(session.channel);
    result
}

/// Reopens a session on a new connection and replays what it declared
pub(crate) async fn resubscribe(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<(), Error> {
    if session.ensure_open().is_err() {
        return Ok(());
    }
    open(connection, session, WriteMode::Failover).await?;

    let resources = session.state.lock().resources.clone();
    for method in resources {
        let expect = match method.kind() {
            MethodKind::QueueDeclare => MethodKind::QueueDeclareOk,
            MethodKind::QueueBind => MethodKind::QueueBindOk,
            other => {
                warn!(channel = session.channel, method = %other, "not replayable");
                continue;
            }
        };
        connection
            .sync_write_with(event(session, method), &[expect], WriteMode::Failover)
            .await?;
    }

    for consumer in session.consumers() {
        connection
            .sync_write_with(
                event(session, consumer.consume_method()),
                &[MethodKind::BasicConsumeOk],
                WriteMode::Failover,
            )
            .await?;
        debug!(channel = session.channel, consumer = %consumer.tag, "resubscribed");
    }
    Ok(())
}

pub(crate) async fn ensure_credit_for_receive(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<bool, Error> {
    let actions = {
        let mut state = session.state.lock();
        let suspended = state.suspended;
        state.credit.ensure_for_receive(suspended)
    };
    for action in &actions {
        apply(connection, session, *action, WriteMode::Normal).await?;
    }
    Ok(!actions.is_empty())
}

pub(crate) async fn reduce_credit_to_original_size(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<(), Error> {
    let action = {
        let mut state = session.state.lock();
        let managing = is_managing_credit(session.options.acknowledge_mode, state.credit.prefetch());
        state.credit.reduce_to_original(managing)
    };
    match action {
        Some(action) => apply(connection, session, action, WriteMode::Normal).await,
        None => Ok(()),
    }
}

/// Suspends an auto acknowledging session with no prefetch once the single
/// message it asked for has been delivered
pub(crate) fn stop_flow_if_necessary(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<(), Error> {
    let stop = {
        let mut state = session.state.lock();
        let auto_like = matches!(
            session.options.acknowledge_mode,
            AcknowledgeMode::Auto | AcknowledgeMode::DupsOk
        );
        match auto_like && state.credit.prefetch() == 0 && state.credit.take_changed() {
            true => {
                state.suspended = true;
                true
            }
            false => false,
        }
    };
    if stop {
        connection.write(event(session, Method::ChannelFlow { active: false }), true)?;
    }
    Ok(())
}

/// Suspends the channel once a consumer queue reaches its high water mark
pub(crate) fn on_high_water_mark(connection: &Arc<ConnectionInner>, session: &Arc<SessionInner>) {
    let connection = connection.clone();
    let session = session.clone();
    tokio::spawn(async move {
        if let Err(error) =
            apply(&connection, &session, CreditAction::Suspend(true), WriteMode::Normal).await
        {
            debug!(channel = session.channel, %error, "suspend above high water mark failed");
        }
    });
}

/// Resumes a channel that was suspended by the high water mark
pub(crate) async fn on_low_water_mark(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) {
    let resume = std::mem::replace(&mut session.state.lock().threshold_suspend, false);
    if resume {
        if let Err(error) =
            apply(connection, session, CreditAction::Suspend(false), WriteMode::Normal).await
        {
            debug!(channel = session.channel, %error, "resume below low water mark failed");
        }
    }
}

fn reject_method(session: &SessionInner, delivery_tag: u64, requeue: bool) -> Option<ProtocolEvent> {
    let send = match session.options.acknowledge_mode {
        AcknowledgeMode::Client | AcknowledgeMode::Transacted => true,
        AcknowledgeMode::Auto | AcknowledgeMode::DupsOk => session.has_message_listeners(),
    };
    match send {
        true => {
            debug!(channel = session.channel, delivery_tag, requeue, "rejecting");
            Some(event(
                session,
                Method::BasicReject {
                    delivery_tag,
                    requeue,
                },
            ))
        }
        false => None,
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Session                                  */
/* -------------------------------------------------------------------------- */

/// A session on one channel of a [`Connection`](crate::Connection)
///
/// Every operation waits out a failover in progress and is retried once the
/// connection is back.
#[derive(Debug, Clone)]
pub struct Session {
    connection: Arc<ConnectionInner>,
    inner: Arc<SessionInner>,
}

macro_rules! protected {
    ($session:expr, |$connection:ident, $inner:ident| $body:expr) => {{
        let $connection = &$session.connection;
        let $inner = &$session.inner;
        failover::protected($connection, || async move {
            let _guard = $inner.op_lock.lock().await;
            $inner.ensure_open()?;
            $body
        })
        .await
    }};
}

/// Like `protected!` but never replays the body on a new connection
macro_rules! protected_once {
    ($session:expr, |$connection:ident, $inner:ident| $body:expr) => {{
        let $connection = &$session.connection;
        let $inner = &$session.inner;
        failover::protected_once($connection, || async move {
            let _guard = $inner.op_lock.lock().await;
            $inner.ensure_open()?;
            $body
        })
        .await
    }};
}

impl Session {
    pub(crate) fn new(connection: Arc<ConnectionInner>, inner: Arc<SessionInner>) -> Self {
        Self { connection, inner }
    }

    /// Channel id
    pub fn channel(&self) -> u16 {
        self.inner.channel
    }

    /// Acknowledge mode
    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.inner.options.acknowledge_mode
    }

    /// Whether the session has been closed, and why
    pub fn close_reason(&self) -> Option<Error> {
        self.inner.close_reason()
    }

    /// Whether the broker currently lets this session publish
    pub fn is_flow_active(&self) -> bool {
        *self.inner.subscribe_flow().borrow()
    }

    /// Whether the client suspended delivery on this channel
    pub fn is_suspended(&self) -> bool {
        self.inner.is_suspended()
    }

    /// Delivery tags handed to the application and not yet acknowledged
    pub fn unacknowledged_tags(&self) -> Vec<u64> {
        self.inner.unacknowledged_tags()
    }

    /// Acknowledges `delivery_tag`, or every tag up to it with `multiple`
    ///
    /// A client acknowledging session sends nothing for tags it no longer
    /// tracks, which includes every tag delivered before a failover. Those
    /// messages are redelivered by the new broker.
    pub async fn acknowledge(&self, delivery_tag: u64, multiple: bool) -> Result<(), Error> {
        let result = protected_once!(self, |connection, inner| {
            let mode = inner.options.acknowledge_mode;
            let outstanding = inner.forget_unacknowledged(delivery_tag, multiple);
            if mode == AcknowledgeMode::Client && !outstanding {
                debug!(channel = inner.channel, delivery_tag, multiple, "nothing to acknowledge");
                return Ok(());
            }
            let ack = event(
                inner,
                Method::BasicAck {
                    delivery_tag,
                    multiple,
                },
            );
            connection.write(ack, mode != AcknowledgeMode::Transacted)
        });
        settled_by_failover(result)
    }

    /// Acknowledges every message handed out so far and restores the
    /// prefetch window
    pub async fn acknowledge_all(&self) -> Result<(), Error> {
        let result = protected_once!(self, |connection, inner| {
            reduce_credit_to_original_size(connection, inner).await?;
            loop {
                let tag = inner.state.lock().unacknowledged_tags.pop_first();
                let Some(delivery_tag) = tag else { break };
                let ack = event(
                    inner,
                    Method::BasicAck {
                        delivery_tag,
                        multiple: false,
                    },
                );
                connection.write(ack, true)?;
            }
            inner.state.lock().credit.reset();
            Ok(())
        });
        settled_by_failover(result)
    }

    /// Rejects a message. Sessions that settle on delivery without a
    /// message listener have nothing to reject and send nothing, and
    /// neither does a tag the session no longer tracks.
    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        let result = protected_once!(self, |connection, inner| {
            let tracked = inner.forget_outstanding(delivery_tag);
            let untracked_mode = matches!(
                inner.options.acknowledge_mode,
                AcknowledgeMode::Auto | AcknowledgeMode::DupsOk
            );
            if !(tracked || untracked_mode) {
                debug!(channel = inner.channel, delivery_tag, "nothing to reject");
                return Ok(());
            }
            match reject_method(inner, delivery_tag, requeue) {
                Some(reject) => connection.write(reject, true),
                None => Ok(()),
            }
        });
        settled_by_failover(result)
    }

    /// Asks the broker to redeliver everything not yet acknowledged
    ///
    /// With [`RejectBehaviour::Server`] unacknowledged messages are
    /// rejected without requeue first.
    #[instrument(skip(self), fields(channel = self.inner.channel))]
    pub async fn recover(&self) -> Result<(), Error> {
        protected!(self, |connection, inner| {
            if inner.options.reject_behaviour == RejectBehaviour::Server
                && inner.options.acknowledge_mode != AcknowledgeMode::Transacted
            {
                for tag in inner.unacknowledged_tags() {
                    if let Some(reject) = reject_method(inner, tag, false) {
                        connection.write(reject, false)?;
                    }
                }
            }
            inner.state.lock().unacknowledged_tags.clear();
            for consumer in inner.consumers() {
                consumer.queue.clear();
            }

            let flavour = connection.dispatcher().capabilities().recover;
            connection
                .sync_write(event(inner, flavour.request(false)), &[flavour.reply])
                .await?;
            inner.state.lock().credit.reset();
            Ok(())
        })
    }

    /// Acknowledges delivered messages and commits the transaction
    ///
    /// Fails with [`Error::TransactionRolledBack`] when a failover lost
    /// work of the transaction, either before or during the commit. The
    /// session is left with a fresh transaction.
    #[instrument(skip(self), fields(channel = self.inner.channel))]
    pub async fn commit(&self) -> Result<(), Error> {
        let result = protected_once!(self, |connection, inner| {
            ensure_transacted(inner)?;
            if inner.take_failed_over_dirty() {
                warn!(channel = inner.channel, "transaction lost to failover, rolling back");
                rollback_transaction(connection, inner).await?;
                return Err(Error::TransactionRolledBack);
            }
            let delivered = std::mem::take(&mut inner.state.lock().delivered_tags);
            for delivery_tag in delivered {
                let ack = event(
                    inner,
                    Method::BasicAck {
                        delivery_tag,
                        multiple: false,
                    },
                );
                connection.write(ack, false)?;
            }
            reduce_credit_to_original_size(connection, inner).await?;
            connection
                .sync_write(event(inner, Method::TxCommit), &[MethodKind::TxCommitOk])
                .await?;
            inner.transaction_ended();
            Ok(())
        });
        match result {
            Err(Error::FailoverInProgress) => match self.inner.take_failed_over_dirty() {
                true => {
                    warn!(channel = self.inner.channel, "commit interrupted by failover");
                    Err(Error::TransactionRolledBack)
                }
                false => Ok(()),
            },
            other => other,
        }
    }

    /// Releases delivered messages and rolls the transaction back
    ///
    /// A rollback interrupted by failover succeeds: the broker discarded the
    /// transaction with the old connection.
    #[instrument(skip(self), fields(channel = self.inner.channel))]
    pub async fn rollback(&self) -> Result<(), Error> {
        let result = protected_once!(self, |connection, inner| {
            ensure_transacted(inner)?;
            inner.take_failed_over_dirty();
            rollback_transaction(connection, inner).await
        });
        match result {
            Err(Error::FailoverInProgress) => {
                self.inner.take_failed_over_dirty();
                Ok(())
            }
            other => other,
        }
    }

    /// Changes the prefetch window
    pub async fn set_prefetch_limits(&self, prefetch: u16) -> Result<(), Error> {
        protected!(self, |connection, inner| {
            inner.state.lock().credit.set_prefetch(prefetch);
            if prefetch > 0 {
                apply(connection, inner, CreditAction::Qos(prefetch), WriteMode::Normal).await?;
            }
            Ok(())
        })
    }

    /// Stops or restarts deliveries on the channel
    pub async fn suspend_channel(&self, suspend: bool) -> Result<(), Error> {
        protected!(self, |connection, inner| {
            apply(connection, inner, CreditAction::Suspend(suspend), WriteMode::Normal).await
        })
    }

    /// Opens the prefetch window for one more message if it is full.
    /// Returns whether anything was sent.
    pub async fn ensure_credit_for_receive(&self) -> Result<bool, Error> {
        protected!(self, |connection, inner| {
            ensure_credit_for_receive(connection, inner).await
        })
    }

    /// Undoes [`ensure_credit_for_receive`](Self::ensure_credit_for_receive)
    pub async fn reduce_credit_to_original_size(&self) -> Result<(), Error> {
        protected!(self, |connection, inner| {
            reduce_credit_to_original_size(connection, inner).await
        })
    }

    /// Suspends an auto acknowledging, zero prefetch session whose window
    /// was opened for a receive
    pub fn stop_flow_if_necessary(&self) -> Result<(), Error> {
        self.inner.ensure_open()?;
        stop_flow_if_necessary(&self.connection, &self.inner)
    }

    /// Declares a queue. An empty name asks the broker to generate one.
    pub async fn declare_queue(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<DeclaredQueue, Error> {
        let options = &options;
        protected!(self, |connection, inner| {
            let declare = Method::QueueDeclare {
                queue: queue.to_string(),
                passive: options.passive,
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                no_wait: false,
                arguments: options.arguments.clone(),
            };
            let reply = connection
                .sync_write(event(inner, declare), &[MethodKind::QueueDeclareOk])
                .await?;
            match reply.method {
                Method::QueueDeclareOk {
                    queue: declared,
                    message_count,
                    consumer_count,
                } => {
                    inner.record_resource(Method::QueueDeclare {
                        queue: declared.clone(),
                        passive: options.passive,
                        durable: options.durable,
                        exclusive: options.exclusive,
                        auto_delete: options.auto_delete,
                        no_wait: false,
                        arguments: options.arguments.clone(),
                    });
                    Ok(DeclaredQueue {
                        queue: declared,
                        message_count,
                        consumer_count,
                    })
                }
                other => Err(Error::Protocol(format!(
                    "expected queue.declare-ok, got {}",
                    other.kind()
                ))),
            }
        })
    }

    /// Binds a queue to an exchange
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let arguments = &arguments;
        protected!(self, |connection, inner| {
            let bind = Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments: arguments.clone(),
            };
            connection
                .sync_write(event(inner, bind.clone()), &[MethodKind::QueueBindOk])
                .await?;
            inner.record_resource(bind);
            Ok(())
        })
    }

    /// Subscribes to `queue`
    #[instrument(skip(self, options), fields(channel = self.inner.channel))]
    pub async fn create_consumer(
        &self,
        queue: &str,
        options: ConsumerOptions,
    ) -> Result<Consumer, Error> {
        let options = &options;
        let consumer = protected!(self, |connection, inner| {
            let tag = match &options.consumer_tag {
                Some(tag) => tag.clone(),
                None => inner.next_consumer_tag(),
            };
            let consumer = Arc::new(ConsumerInner::new(
                tag.clone(),
                queue.to_string(),
                options.clone(),
                inner.options.prefetch_high,
                inner.options.prefetch_low,
            ));
            {
                let mut state = inner.state.lock();
                if state.consumers.contains_key(&tag) {
                    return Err(Error::IllegalState(format!(
                        "consumer tag {} is already in use",
                        tag
                    )));
                }
                // Registered first, deliveries may follow consume-ok at once
                state.consumers.insert(tag.clone(), consumer.clone());
            }
            let reply = connection
                .sync_write(
                    event(inner, consumer.consume_method()),
                    &[MethodKind::BasicConsumeOk],
                )
                .await;
            match reply {
                Ok(_) => Ok(consumer),
                Err(error) => {
                    inner.remove_consumer(&tag);
                    Err(error)
                }
            }
        })?;
        Ok(Consumer::new(
            self.connection.clone(),
            self.inner.clone(),
            consumer,
        ))
    }

    /// Creates a producer publishing to `exchange` with `routing_key`
    pub fn create_producer(&self, exchange: &str, routing_key: &str) -> Result<Producer, Error> {
        self.inner.ensure_open()?;
        Ok(Producer::new(
            self.connection.clone(),
            self.inner.clone(),
            exchange.to_string(),
            routing_key.to_string(),
        ))
    }

    /// Closes the session
    pub async fn close(&self) -> Result<(), Error> {
        let connection = &self.connection;
        let inner = &self.inner;
        failover::protected(connection, || async move {
            let _guard = inner.op_lock.lock().await;
            close(connection, inner).await
        })
        .await
    }
}

/// Settlements lost to a failover need no resend, the new broker
/// redelivers those messages
fn settled_by_failover(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::FailoverInProgress) => Ok(()),
        other => other,
    }
}

async fn rollback_transaction(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
) -> Result<(), Error> {
    let requeue = session.options.reject_behaviour == RejectBehaviour::Normal;
    let delivered = std::mem::take(&mut session.state.lock().delivered_tags);
    for tag in delivered {
        if let Some(reject) = reject_method(session, tag, requeue) {
            connection.write(reject, false)?;
        }
    }
    for consumer in session.consumers() {
        for tag in consumer.queue.clear() {
            if let Some(reject) = reject_method(session, tag, true) {
                connection.write(reject, false)?;
            }
        }
    }
    connection
        .sync_write(event(session, Method::TxRollback), &[MethodKind::TxRollbackOk])
        .await?;
    session.transaction_ended();
    Ok(())
}

fn ensure_transacted(session: &SessionInner) -> Result<(), Error> {
    match session.options.acknowledge_mode {
        AcknowledgeMode::Transacted => Ok(()),
        mode => Err(Error::IllegalState(format!(
            "session on channel {} is not transacted ({:?})",
            session.channel, mode
        ))),
    }
}
