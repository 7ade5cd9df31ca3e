//! Rendezvous between a caller that waits for an event and the engine task
//! that receives it

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use slab::Slab;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace, warn};

use crate::Error;

/// How long [`BlockingWaiter::error`] waits for the blocked caller to pick
/// the error up
pub(crate) const ERROR_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug)]
struct Slot<T> {
    outcome: Option<Result<T, Error>>,
    waiting: bool,
    closed: bool,
    consumed: bool,
    error_pending_ack: bool,
}

/// Single-shot waiter that is resolved by the first accepted event, an
/// error, a timeout or closure, whichever happens first
pub struct BlockingWaiter<T> {
    accepts: Predicate<T>,
    description: String,
    slot: Mutex<Slot<T>>,
    resolved: Notify,
    error_ack: Notify,
}

impl<T> std::fmt::Debug for BlockingWaiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingWaiter")
            .field("description", &self.description)
            .finish()
    }
}

impl<T> BlockingWaiter<T>
where
    T: Clone,
{
    /// Creates a waiter that is resolved by the first event for which
    /// `accepts` returns `true`
    pub fn new(
        description: impl Into<String>,
        accepts: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            accepts: Box::new(accepts),
            description: description.into(),
            slot: Mutex::new(Slot {
                outcome: None,
                waiting: false,
                closed: false,
                consumed: false,
                error_pending_ack: false,
            }),
            resolved: Notify::new(),
            error_ack: Notify::new(),
        }
    }

    /// What this waiter is waiting for
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Offers an event. Returns whether the event satisfied the waiter.
    pub fn received(&self, event: &T) -> bool {
        if !(self.accepts)(event) {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.closed || slot.consumed || slot.outcome.is_some() {
            trace!(waiter = %self.description, "already resolved");
            return true;
        }
        slot.outcome = Some(Ok(event.clone()));
        drop(slot);
        self.resolved.notify_one();
        true
    }

    /// Resolves the waiter with an error
    ///
    /// If a caller is blocked, this waits until the caller has taken the
    /// error, bounded by [`ERROR_ACK_TIMEOUT`]. Errors arriving after the
    /// first one are logged and dropped. Errors on a closed waiter are
    /// ignored.
    pub async fn error(&self, error: Error) {
        let must_wait = {
            let mut slot = self.slot.lock();
            if slot.closed {
                debug!(waiter = %self.description, %error, "ignoring error on closed waiter");
                return;
            }
            if slot.outcome.is_some() || slot.consumed {
                warn!(
                    waiter = %self.description,
                    %error,
                    "new error arrived while the previous outcome was not yet processed"
                );
                return;
            }
            slot.outcome = Some(Err(error));
            if slot.waiting {
                slot.error_pending_ack = true;
            }
            slot.waiting
        };
        self.resolved.notify_one();

        if must_wait
            && tokio::time::timeout(ERROR_ACK_TIMEOUT, self.error_ack.notified())
                .await
                .is_err()
        {
            warn!(waiter = %self.description, "blocked caller did not acknowledge error");
        }
    }

    /// Waits until the waiter is resolved or `timeout` elapses
    ///
    /// A waiter resolves once. Blocking again after the outcome was taken
    /// is an illegal state.
    pub async fn block(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.resolved.notified();
            {
                let mut slot = self.slot.lock();
                if let Some(outcome) = slot.outcome.take() {
                    slot.consumed = true;
                    slot.waiting = false;
                    if slot.error_pending_ack {
                        slot.error_pending_ack = false;
                        self.error_ack.notify_one();
                    }
                    return outcome;
                }
                if slot.consumed {
                    return Err(Error::IllegalState(format!(
                        "waiter for {} was already resolved",
                        self.description
                    )));
                }
                if slot.closed {
                    return Err(Error::WaiterClosed);
                }
                slot.waiting = true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut slot = self.slot.lock();
                if slot.outcome.is_none() {
                    slot.outcome = Some(Err(Error::timeout(timeout, self.description.clone())));
                }
            }
        }
    }

    /// Closes the waiter. A blocked caller is released with
    /// [`Error::WaiterClosed`] and later errors are ignored.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        if slot.closed {
            return;
        }
        slot.closed = true;
        if slot.waiting && slot.outcome.is_none() {
            slot.outcome = Some(Err(Error::WaiterClosed));
        }
        if slot.error_pending_ack {
            slot.error_pending_ack = false;
            self.error_ack.notify_one();
        }
        drop(slot);
        self.resolved.notify_one();
    }

    /// Whether the waiter has been closed
    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}

/// A set of waiters that all see every event and every error
pub(crate) struct WaiterRegistry<T> {
    waiters: Mutex<Slab<Arc<BlockingWaiter<T>>>>,
}

impl<T> std::fmt::Debug for WaiterRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterRegistry")
            .field("len", &self.waiters.lock().len())
            .finish()
    }
}

impl<T> Default for WaiterRegistry<T> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(Slab::new()),
        }
    }
}

impl<T> WaiterRegistry<T>
where
    T: Clone,
{
    /// Registers a waiter. The waiter is closed and removed when the
    /// returned registration is dropped, whichever way the caller exits.
    pub fn register(&self, waiter: Arc<BlockingWaiter<T>>) -> Registration<'_, T> {
        let key = self.waiters.lock().insert(waiter.clone());
        Registration {
            registry: self,
            key,
            waiter,
        }
    }

    fn snapshot(&self) -> Vec<Arc<BlockingWaiter<T>>> {
        self.waiters
            .lock()
            .iter()
            .map(|(_, waiter)| waiter.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Offers an event to every waiter. Returns whether any accepted it.
    pub fn notify(&self, event: &T) -> bool {
        let mut accepted = false;
        for waiter in self.snapshot() {
            accepted |= waiter.received(event);
        }
        accepted
    }

    /// Resolves every registered waiter with `error`
    pub async fn propagate_error(&self, error: Error) {
        let waiters = self.snapshot();
        let errors = waiters.iter().map(|w| w.error(error.clone()));
        futures_util::future::join_all(errors).await;
    }
}

/// Guard returned by [`WaiterRegistry::register`]
pub(crate) struct Registration<'a, T>
where
    T: Clone,
{
    registry: &'a WaiterRegistry<T>,
    key: usize,
    waiter: Arc<BlockingWaiter<T>>,
}

impl<'a, T> Registration<'a, T>
where
    T: Clone,
{
    pub fn waiter(&self) -> &BlockingWaiter<T> {
        &self.waiter
    }
}

impl<'a, T> Drop for Registration<'a, T>
where
    T: Clone,
{
    fn drop(&mut self) {
        self.waiter.close();
        let mut waiters = self.registry.waiters.lock();
        if waiters.contains(self.key) {
            waiters.remove(self.key);
        }
    }
}
