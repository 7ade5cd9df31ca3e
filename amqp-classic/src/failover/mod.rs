//! Reconnecting after a lost connection
//!
//! When the engine of an established connection stops with a retryable
//! error, the engine task itself runs the failover: it fails every pending
//! waiter with [`Error::FailoverInProgress`], asks the
//! [`ConnectionListener`](crate::ConnectionListener)s for permission, locks
//! every session in ascending channel order, reconnects following the
//! [`FailoverPolicy`] and replays each session's declarations and
//! subscriptions on the new connection. Public operations wrapped in
//! [`protected`] wait for the outcome and then run again.

use std::{future::Future, sync::atomic::Ordering, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    connection::{self, engine::Outgoing, BrokerDetails, ConnectionInner},
    constants::{CONNECTION_CHANNEL, INTERNAL_ERROR},
    framing::{Method, ProtocolEvent},
    session,
    state::ConnectionState,
    Error,
};

mod policy;

pub use policy::FailoverPolicy;
pub(crate) use policy::{Attempt, FailoverPlan};

/// Where the connection stands with respect to failover
#[derive(Debug, Clone)]
pub enum FailoverStatus {
    /// A transport is established, or no failure has happened yet
    Connected,
    /// The connection was lost and is being re-established
    InProgress,
    /// Failover gave up, or the connection was closed
    Abandoned(Error),
}

impl FailoverStatus {
    /// Whether a reconnection is running
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

/// Failover status shared by the engine task and callers
#[derive(Debug)]
pub(crate) struct FailoverState {
    status: watch::Sender<FailoverStatus>,
    pending_redirect: Mutex<Option<(String, Vec<String>)>>,
}

impl Default for FailoverState {
    fn default() -> Self {
        let (status, _) = watch::channel(FailoverStatus::Connected);
        Self {
            status,
            pending_redirect: Mutex::new(None),
        }
    }
}

impl FailoverState {
    pub fn status(&self) -> FailoverStatus {
        self.status.borrow().clone()
    }

    /// Returns `false` if a failover is already running or the connection
    /// was abandoned
    pub fn begin(&self) -> bool {
        self.status.send_if_modified(|status| match status {
            FailoverStatus::Connected => {
                *status = FailoverStatus::InProgress;
                true
            }
            _ => false,
        })
    }

    pub fn complete(&self) {
        self.status.send_if_modified(|status| match status {
            FailoverStatus::InProgress => {
                *status = FailoverStatus::Connected;
                true
            }
            _ => false,
        });
    }

    /// Terminal. Later calls keep the first error.
    pub fn abandon(&self, error: Error) {
        self.status.send_if_modified(|status| match status {
            FailoverStatus::Abandoned(_) => false,
            _ => {
                *status = FailoverStatus::Abandoned(error);
                true
            }
        });
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.borrow().is_in_progress()
    }

    pub fn ensure_not_in_progress(&self) -> Result<(), Error> {
        match self.is_in_progress() {
            true => Err(Error::FailoverInProgress),
            false => Ok(()),
        }
    }

    /// Waits for a running failover to finish
    ///
    /// Returns the abandoning error if the connection is gone.
    pub async fn block_until_not_failing_over(&self) -> Result<(), Error> {
        let mut status = self.status.subscribe();
        let settled = status
            .wait_for(|status| !status.is_in_progress())
            .await
            .map(|status| status.clone());
        match settled {
            Ok(FailoverStatus::Abandoned(error)) => Err(error),
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    pub fn set_pending_redirect(&self, host: String, known_hosts: Vec<String>) {
        *self.pending_redirect.lock() = Some((host, known_hosts));
    }

    pub fn take_pending_redirect(&self) -> Option<(String, Vec<String>)> {
        self.pending_redirect.lock().take()
    }
}

/// Runs `op`, waiting out a failover before the first try and running it
/// again whenever it was interrupted by one
pub(crate) async fn protected<T, F, Fut>(inner: &ConnectionInner, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    loop {
        inner.failover.block_until_not_failing_over().await?;
        match op().await {
            Err(Error::FailoverInProgress) => {
                debug!("operation interrupted by failover, retrying");
            }
            other => return other,
        }
    }
}

/// Runs `op` at most once, after waiting out a failover
///
/// For operations whose effect does not survive a reconnect, such as
/// settling deliveries or ending a transaction. An interruption returns
/// [`Error::FailoverInProgress`] once the failover has finished.
pub(crate) async fn protected_once<T, F, Fut>(inner: &ConnectionInner, op: F) -> Result<T, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    inner.failover.block_until_not_failing_over().await?;
    match op().await {
        Err(Error::FailoverInProgress) => {
            inner.failover.block_until_not_failing_over().await?;
            Err(Error::FailoverInProgress)
        }
        other => other,
    }
}

/// Whether the next broker of the plan should be tried after `error`
fn try_next_broker(error: &Error) -> bool {
    error.is_retryable()
        || matches!(
            error,
            Error::TimeoutExpired { .. } | Error::Framing(_) | Error::WaiterClosed
        )
}

fn apply_redirect(plan: &mut FailoverPlan, host: &str, known_hosts: &[String]) {
    let target = match BrokerDetails::from_host_port(host) {
        Ok(target) => target,
        Err(error) => {
            warn!(%host, %error, "ignoring unusable redirect target");
            return;
        }
    };
    let known_hosts = known_hosts
        .iter()
        .filter_map(|known| match BrokerDetails::from_host_port(known) {
            Ok(known) => Some(known),
            Err(error) => {
                debug!(%known, %error, "ignoring unusable known host");
                None
            }
        })
        .collect();
    plan.redirect(target, known_hosts);
}

/// Works through `plan` until a connection is open
///
/// Redirects put their targets ahead of the remaining attempts. Errors that
/// say nothing about the other brokers, such as a refused login, end the
/// search at once.
pub(crate) async fn connect(inner: &Arc<ConnectionInner>, plan: &mut FailoverPlan) -> Result<(), Error> {
    let mut last_error = None;
    while let Some(Attempt {
        broker,
        index,
        delay,
    }) = plan.next()
    {
        if !delay.is_zero() {
            debug!(?delay, "waiting before next attempt");
            tokio::time::sleep(delay).await;
        }
        if inner.closing.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        info!(%broker, "connecting");
        match connection::establish(inner, &broker).await {
            Ok(()) => {
                if let Some(index) = index {
                    inner.set_broker_index(index);
                }
                inner.failover.take_pending_redirect();
                return Ok(());
            }
            Err(Error::Redirect { host, known_hosts }) => {
                inner.failover.take_pending_redirect();
                apply_redirect(plan, &host, &known_hosts);
                last_error = Some(Error::Redirect { host, known_hosts });
            }
            Err(error) if try_next_broker(&error) => {
                warn!(%broker, %error, "connection attempt failed");
                last_error = Some(error);
            }
            Err(error) => {
                warn!(%broker, %error, "connection attempt failed, not retrying");
                return Err(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::InvalidConfiguration("no broker to connect to".into())))
}

/// What to do after an engine stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopAction {
    /// A newer engine has taken over
    Stale,
    /// The client is closing the connection
    Closing,
    /// The connection never opened
    Handshake,
    /// Reconnect
    Failover,
    /// The connection broke while a failover was already running
    Interrupted,
    /// Close the connection for good
    Terminate,
}

/// Decides how to handle a stopped engine. Runs before the transport is
/// shut down so that callers see the failover status change first.
pub(crate) fn engine_stopping(
    inner: &ConnectionInner,
    epoch: u64,
    result: &Result<(), Error>,
) -> StopAction {
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        return StopAction::Stale;
    }
    if inner.closing.load(Ordering::SeqCst) || inner.is_closed() {
        return StopAction::Closing;
    }
    if !inner.established.load(Ordering::SeqCst) {
        return StopAction::Handshake;
    }
    match result {
        Err(error) if error.is_retryable() && inner.settings.failover_enabled => {
            match inner.failover.begin() {
                true => {
                    inner.clear_outgoing();
                    StopAction::Failover
                }
                false => StopAction::Interrupted,
            }
        }
        _ => StopAction::Terminate,
    }
}

pub(crate) async fn on_engine_stopped(
    inner: Arc<ConnectionInner>,
    action: StopAction,
    result: Result<(), Error>,
) {
    debug!(?action, "engine stopped");
    match (action, result) {
        (StopAction::Stale, _) => {}
        (StopAction::Closing, Ok(())) => {}
        (StopAction::Closing, Err(error)) | (StopAction::Interrupted, Err(error)) => {
            inner.listeners.propagate_error(error).await;
        }
        (StopAction::Interrupted, Ok(())) => {
            inner.listeners.propagate_error(Error::ConnectionClosed).await;
        }
        (StopAction::Handshake, Ok(())) => inner.state.change_state(ConnectionState::Closed),
        (StopAction::Handshake, Err(error)) => inner.state.error(error).await,
        (StopAction::Failover, Ok(())) => terminate(&inner, Error::ConnectionClosed).await,
        (StopAction::Failover, Err(error)) => fail_over(inner, error).await,
        (StopAction::Terminate, result) => {
            let error = result.err().unwrap_or(Error::ConnectionClosed);
            terminate(&inner, error).await
        }
    }
}

#[instrument(skip_all, fields(cause = %cause))]
async fn fail_over(inner: Arc<ConnectionInner>, cause: Error) {
    warn!("connection lost, failing over");
    inner
        .listeners
        .propagate_error(Error::FailoverInProgress)
        .await;

    let redirect = inner.failover.take_pending_redirect();
    let listeners = inner.connection_listeners();
    if !listeners
        .iter()
        .all(|listener| listener.pre_failover(redirect.is_some()))
    {
        info!("failover vetoed by connection listener");
        terminate(&inner, cause).await;
        return;
    }

    // Ascending channel order on every path that takes more than one
    let sessions = inner.sessions_sorted();
    let mut guards = Vec::with_capacity(sessions.len());
    for session in &sessions {
        guards.push(session.op_lock.lock().await);
    }
    for session in &sessions {
        session.failover_prep();
    }

    let mut plan = FailoverPlan::new(
        inner.settings.failover.clone(),
        inner.settings.brokers.clone(),
        inner.broker_index(),
    );
    if let Some((host, known_hosts)) = redirect {
        apply_redirect(&mut plan, &host, &known_hosts);
    }

    let result = loop {
        if let Err(error) = connect(&inner, &mut plan).await {
            break Err(error);
        }
        match resubscribe_all(&inner, &sessions).await {
            Ok(()) => break Ok(()),
            // The new connection broke while sessions were replayed on it
            Err(error) if try_next_broker(&error) || matches!(error, Error::FailoverInProgress) => {
                warn!(broker = ?inner.broker(), %error, "resubscribe failed, trying next broker");
                for session in &sessions {
                    session.failover_prep();
                }
            }
            Err(error) => break Err(error),
        }
    };
    drop(guards);

    match result {
        Ok(()) => {
            inner.failover.complete();
            info!(broker = ?inner.broker(), "failover complete");
            for listener in listeners {
                listener.failover_complete();
            }
        }
        Err(error) => {
            error!(%error, "failover failed");
            terminate(&inner, cause).await;
        }
    }
}

async fn resubscribe_all(
    inner: &Arc<ConnectionInner>,
    sessions: &[Arc<session::SessionInner>],
) -> Result<(), Error> {
    for session in sessions {
        session::resubscribe(inner, session).await?;
    }
    Ok(())
}

/// Closes the connection after an unrecoverable failure and reports it
/// to the exception listener exactly once
async fn terminate(inner: &Arc<ConnectionInner>, error: Error) {
    if inner.terminal_reported.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.closed.store(true, Ordering::SeqCst);
    close_transport(inner, &error);
    inner.clear_outgoing();
    inner.state.error(error.clone()).await;
    inner.state.change_state(ConnectionState::Closed);

    let sessions = inner.sessions.lock().drain();
    for session in sessions {
        session.mark_closed(error.clone());
    }
    inner.listeners.propagate_error(error.clone()).await;
    inner.failover.abandon(error.clone());
    error!(%error, "connection terminated");
    inner.report_exception(&error);
}

/// Tells a still open broker why the connection is going away, then stops
/// the engine once the close is flushed. Nothing waits for `close-ok`.
fn close_transport(inner: &ConnectionInner, error: &Error) {
    let open = inner.established.load(Ordering::SeqCst)
        && inner.state.current_state() == ConnectionState::Open;
    if open {
        let close = ProtocolEvent::new(
            CONNECTION_CHANNEL,
            Method::ConnectionClose {
                reply_code: INTERNAL_ERROR,
                reply_text: error.to_string(),
                class_id: 0,
                method_id: 0,
            },
        );
        if let Err(error) = inner.write(close, true) {
            debug!(%error, "could not send connection close");
        }
    }
    if let Err(error) = inner.send(Outgoing::Close) {
        debug!(%error, "engine already stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn status_transitions() {
        let state = FailoverState::default();
        assert!(matches!(state.status(), FailoverStatus::Connected));
        assert!(state.begin());
        assert!(!state.begin());
        assert!(state.is_in_progress());
        assert!(matches!(
            state.ensure_not_in_progress(),
            Err(Error::FailoverInProgress)
        ));
        state.complete();
        assert!(state.block_until_not_failing_over().await.is_ok());

        state.abandon(Error::ConnectionClosed);
        state.abandon(Error::IdleTimeout);
        assert!(!state.begin());
        assert!(matches!(
            state.block_until_not_failing_over().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn waiting_callers_are_released_on_completion() {
        let state = Arc::new(FailoverState::default());
        state.begin();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.block_until_not_failing_over().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        state.complete();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn redirect_targets_lead_the_plan() {
        let brokers = vec![BrokerDetails::new("c", 5672)];
        let mut plan = FailoverPlan::new(FailoverPolicy::default(), brokers, 0);
        apply_redirect(&mut plan, "a:5672", &["b:5673".to_string(), "".to_string()]);

        let hosts: Vec<_> = plan.by_ref().take(3).map(|a| a.broker.host).collect();
        assert_eq!(hosts, ["a", "b", "c"]);
    }

    #[test]
    fn only_connection_level_errors_move_to_next_broker() {
        assert!(try_next_broker(&Error::IdleTimeout));
        assert!(try_next_broker(&Error::timeout(Duration::from_secs(1), "open")));
        assert!(!try_next_broker(&Error::AuthenticationFailure("no".into())));
        assert!(!try_next_broker(&Error::ProtocolVersionMismatch { major: 9, minor: 9 }));
    }
}
