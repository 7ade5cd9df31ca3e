//! Consumers and their delivery queues

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, instrument, trace, warn};

use crate::{
    connection::ConnectionInner,
    framing::{BasicProperties, FieldTable, Method, MethodKind, ProtocolEvent},
    Error,
};

use super::{credit::is_managing_credit, AcknowledgeMode, SessionInner};

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Tag used to acknowledge or reject the message
    pub delivery_tag: u64,
    /// The broker delivered this message before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Consumer the message was delivered to
    pub consumer_tag: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

impl Message {
    pub(crate) fn from_delivery(event: &ProtocolEvent) -> Option<Self> {
        match &event.method {
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => Some(Self {
                delivery_tag: *delivery_tag,
                redelivered: *redelivered,
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                consumer_tag: consumer_tag.clone(),
                properties: event
                    .header
                    .as_ref()
                    .map(|header| header.properties.clone())
                    .unwrap_or_default(),
                body: event.body.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Crossing of a prefetch water mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Threshold {
    /// The queue filled up to the high mark
    High,
    /// The queue drained down to the low mark
    Low,
}

#[derive(Debug, Default)]
struct Queued {
    messages: VecDeque<Message>,
    closed: bool,
}

/// Messages waiting for the application, with water marks that drive
/// channel suspension
#[derive(Debug)]
pub(crate) struct DeliveryQueue {
    queued: Mutex<Queued>,
    notify: Notify,
    high: usize,
    low: usize,
}

impl DeliveryQueue {
    /// A zero high mark disables the water marks
    pub fn new(high: u16, low: u16) -> Self {
        Self {
            queued: Mutex::new(Queued::default()),
            notify: Notify::new(),
            high: high as usize,
            low: low as usize,
        }
    }

    pub fn push(&self, message: Message) -> Option<Threshold> {
        let len = {
            let mut queued = self.queued.lock();
            if queued.closed {
                debug!(tag = message.delivery_tag, "dropping delivery for closed consumer");
                return None;
            }
            queued.messages.push_back(message);
            queued.messages.len()
        };
        self.notify.notify_waiters();
        match self.high > 0 && len == self.high {
            true => Some(Threshold::High),
            false => None,
        }
    }

    pub fn pop(&self) -> Option<(Message, Option<Threshold>)> {
        let mut queued = self.queued.lock();
        let before = queued.messages.len();
        let message = queued.messages.pop_front()?;
        let threshold = match self.high > 0 && before == self.low {
            true => Some(Threshold::Low),
            false => None,
        };
        Some((message, threshold))
    }

    /// Waits up to `timeout` for a message. `None` once the queue is
    /// closed or the timeout elapsed.
    pub async fn pop_wait(
        &self,
        timeout: Option<Duration>,
    ) -> Option<(Message, Option<Threshold>)> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.notify.notified();
            if let Some(popped) = self.pop() {
                return Some(popped);
            }
            if self.queued.lock().closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queued.lock().messages.len()
    }

    /// Removes every queued message, returning their delivery tags
    pub fn clear(&self) -> Vec<u64> {
        let mut queued = self.queued.lock();
        queued.messages.drain(..).map(|m| m.delivery_tag).collect()
    }

    pub fn close(&self) {
        self.queued.lock().closed = true;
        self.notify.notify_waiters();
    }
}

/// Receives messages pushed by the broker
pub trait MessageListener: Send + Sync + 'static {
    /// Called once per message, in delivery order
    fn on_message(&self, message: Message);
}

impl<F> MessageListener for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// Subscription parameters
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Consumer tag. Generated when `None`.
    pub consumer_tag: Option<String>,
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// The broker settles messages on delivery
    pub no_ack: bool,
    /// No other consumer may use the queue
    pub exclusive: bool,
    /// Broker specific arguments
    pub arguments: FieldTable,
}

pub(crate) struct ConsumerInner {
    pub tag: String,
    pub queue_name: String,
    pub options: ConsumerOptions,
    pub queue: DeliveryQueue,
    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ConsumerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerInner")
            .field("tag", &self.tag)
            .field("queue_name", &self.queue_name)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl ConsumerInner {
    pub fn new(
        tag: String,
        queue_name: String,
        options: ConsumerOptions,
        high: u16,
        low: u16,
    ) -> Self {
        Self {
            tag,
            queue_name,
            options,
            queue: DeliveryQueue::new(high, low),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// `basic.consume` for this subscription
    pub fn consume_method(&self) -> Method {
        Method::BasicConsume {
            queue: self.queue_name.clone(),
            consumer_tag: self.tag.clone(),
            no_local: self.options.no_local,
            no_ack: self.options.no_ack,
            exclusive: self.options.exclusive,
            no_wait: false,
            arguments: self.options.arguments.clone(),
        }
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Settles a message handed to the application according to the session's
/// acknowledge mode
async fn after_receive(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
    consumer: &ConsumerInner,
    message: &Message,
    threshold: Option<Threshold>,
) -> Result<(), Error> {
    if threshold == Some(Threshold::Low) {
        super::on_low_water_mark(connection, session).await;
    }

    let mode = session.options.acknowledge_mode;
    let managing = is_managing_credit(mode, session.prefetch());
    match mode {
        AcknowledgeMode::Client => session.record_unacknowledged(message.delivery_tag, managing),
        AcknowledgeMode::Transacted => session.record_delivered(message.delivery_tag, managing),
        AcknowledgeMode::Auto | AcknowledgeMode::DupsOk => {}
    }
    trace!(
        channel = session.channel,
        tag = message.delivery_tag,
        consumer = %consumer.tag,
        "message handed to application"
    );
    Ok(())
}

/// Acknowledges auto mode deliveries once the application has them
fn post_deliver(
    connection: &Arc<ConnectionInner>,
    session: &Arc<SessionInner>,
    consumer: &ConsumerInner,
    message: &Message,
) -> Result<(), Error> {
    match session.options.acknowledge_mode {
        AcknowledgeMode::Auto | AcknowledgeMode::DupsOk if !consumer.options.no_ack => {
            let ack = ProtocolEvent::new(
                session.channel,
                Method::BasicAck {
                    delivery_tag: message.delivery_tag,
                    multiple: false,
                },
            );
            connection.write(ack, true)?;
            super::stop_flow_if_necessary(connection, session)
        }
        _ => Ok(()),
    }
}

/// Receives messages from one subscription
#[derive(Debug)]
pub struct Consumer {
    connection: Arc<ConnectionInner>,
    session: Arc<SessionInner>,
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub(crate) fn new(
        connection: Arc<ConnectionInner>,
        session: Arc<SessionInner>,
        inner: Arc<ConsumerInner>,
    ) -> Self {
        Self {
            connection,
            session,
            inner,
        }
    }

    /// Consumer tag
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Queue consumed from
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Waits up to `timeout` for a message
    ///
    /// When the session manages credit, the prefetch window is opened for
    /// exactly one message for the duration of the call.
    #[instrument(skip(self), fields(channel = self.session.channel, consumer = %self.inner.tag))]
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, Error> {
        self.receive_inner(Some(timeout)).await
    }

    /// Takes a message if one is already queued
    pub async fn receive_no_wait(&self) -> Result<Option<Message>, Error> {
        self.receive_inner(Some(Duration::ZERO)).await
    }

    async fn receive_inner(&self, timeout: Option<Duration>) -> Result<Option<Message>, Error> {
        if self.inner.has_listener() {
            return Err(Error::IllegalState(
                "cannot receive while a message listener is set".into(),
            ));
        }
        self.session.ensure_open()?;
        if self.inner.is_closed() {
            return Ok(None);
        }

        let managing = is_managing_credit(
            self.session.options.acknowledge_mode,
            self.session.prefetch(),
        );
        let modified = match managing {
            true => super::ensure_credit_for_receive(&self.connection, &self.session).await?,
            false => false,
        };

        let popped = self.inner.queue.pop_wait(timeout).await;
        match popped {
            Some((message, threshold)) => {
                after_receive(
                    &self.connection,
                    &self.session,
                    &self.inner,
                    &message,
                    threshold,
                )
                .await?;
                post_deliver(&self.connection, &self.session, &self.inner, &message)?;
                Ok(Some(message))
            }
            None => {
                if modified {
                    super::reduce_credit_to_original_size(&self.connection, &self.session).await?;
                }
                Ok(None)
            }
        }
    }

    /// Switches the consumer to push delivery
    ///
    /// Messages are handed to `listener` on a dedicated task in delivery
    /// order until the consumer or its session closes.
    pub fn set_message_listener(&self, listener: impl MessageListener) -> Result<(), Error> {
        self.session.ensure_open()?;
        let listener: Arc<dyn MessageListener> = Arc::new(listener);
        {
            let mut slot = self.inner.listener.lock();
            if slot.is_some() {
                return Err(Error::IllegalState("message listener already set".into()));
            }
            *slot = Some(listener.clone());
        }

        let connection = self.connection.clone();
        let session = self.session.clone();
        let consumer = self.inner.clone();
        tokio::spawn(async move {
            while let Some((message, threshold)) = consumer.queue.pop_wait(None).await {
                if let Err(error) =
                    after_receive(&connection, &session, &consumer, &message, threshold).await
                {
                    warn!(%error, "delivery bookkeeping failed");
                }
                listener.on_message(message.clone());
                if let Err(error) = post_deliver(&connection, &session, &consumer, &message) {
                    warn!(%error, tag = message.delivery_tag, "auto acknowledge failed");
                }
            }
            debug!(consumer = %consumer.tag, "message listener stopped");
        });
        Ok(())
    }

    /// Cancels the subscription
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let connection = &self.connection;
        let session = &self.session;
        let consumer = &self.inner;
        crate::failover::protected(connection, || async move {
            let _guard = session.op_lock.lock().await;
            if session.ensure_open().is_ok() {
                let cancel = ProtocolEvent::new(
                    session.channel,
                    Method::BasicCancel {
                        consumer_tag: consumer.tag.clone(),
                        no_wait: false,
                    },
                );
                connection
                    .sync_write(cancel, &[MethodKind::BasicCancelOk])
                    .await?;
            }
            Ok(())
        })
        .await?;
        self.session.remove_consumer(&self.inner.tag);
        self.inner.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tag: u64) -> Message {
        Message {
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q".into(),
            consumer_tag: "c".into(),
            properties: BasicProperties::default(),
            body: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn water_marks_fire_once_on_crossing() {
        let queue = DeliveryQueue::new(3, 1);
        assert_eq!(queue.push(message(1)), None);
        assert_eq!(queue.push(message(2)), None);
        assert_eq!(queue.push(message(3)), Some(Threshold::High));
        assert_eq!(queue.push(message(4)), None);

        assert_eq!(queue.pop().map(|(_, t)| t), Some(None));
        assert_eq!(queue.pop().map(|(_, t)| t), Some(None));
        assert_eq!(queue.pop().map(|(_, t)| t), Some(None));
        assert_eq!(queue.pop().map(|(_, t)| t), Some(Some(Threshold::Low)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn zero_high_mark_disables_flow_control() {
        let queue = DeliveryQueue::new(0, 0);
        assert_eq!(queue.push(message(1)), None);
        assert_eq!(queue.pop().map(|(_, t)| t), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wait_times_out_then_sees_later_push() {
        let queue = Arc::new(DeliveryQueue::new(0, 0));
        assert!(queue.pop_wait(Some(Duration::from_millis(10))).await.is_none());

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop_wait(None).await });
        tokio::task::yield_now().await;
        queue.push(message(7));
        let (received, _) = waiter.await.unwrap().unwrap();
        assert_eq!(received.delivery_tag, 7);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(DeliveryQueue::new(0, 0));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop_wait(None).await });
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(queue.push(message(1)), None);
        assert_eq!(queue.len(), 0);
    }
}
