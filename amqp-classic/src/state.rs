//! Connection lifecycle states and waiting for them

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    waiter::{BlockingWaiter, Registration, WaiterRegistry},
    Error,
};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Protocol header not yet answered
    NotStarted,
    /// `connection.start-ok` sent, waiting for `connection.tune`
    NotTuned,
    /// `connection.open` sent, waiting for `connection.open-ok`
    NotOpened,
    /// Ready for sessions
    Open,
    /// A close is in progress
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct Current {
    state: ConnectionState,
    last_error: Option<Error>,
}

/// Holds the current [`ConnectionState`] and wakes waiters on transitions
#[derive(Debug)]
pub(crate) struct StateManager {
    current: Mutex<Current>,
    waiters: WaiterRegistry<ConnectionState>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self {
            current: Mutex::new(Current {
                state: ConnectionState::NotStarted,
                last_error: None,
            }),
            waiters: WaiterRegistry::default(),
        }
    }
}

impl StateManager {
    pub fn current_state(&self) -> ConnectionState {
        self.current.lock().state
    }

    /// Transitions to `new_state` and offers it to every waiter while the
    /// state lock is held, so waiters observe transitions in order
    pub fn change_state(&self, new_state: ConnectionState) {
        let mut current = self.current.lock();
        debug!(from = %current.state, to = %new_state, "connection state change");
        current.state = new_state;
        self.waiters.notify(&new_state);
    }

    /// Starts over for a new connection attempt
    pub fn reset(&self) {
        let mut current = self.current.lock();
        current.state = ConnectionState::NotStarted;
        current.last_error = None;
    }

    /// Fails the connection
    ///
    /// Transport failures move straight to `Closed`, protocol failures to
    /// `Closing`. Waiters see the error rather than the new state. With
    /// nobody waiting, the error is kept for the next
    /// caller to collect with [`take_last_error`](Self::take_last_error).
    pub async fn error(&self, error: Error) {
        let new_state = match error.is_transport_failure() {
            true => ConnectionState::Closed,
            false => ConnectionState::Closing,
        };
        {
            let mut current = self.current.lock();
            debug!(from = %current.state, to = %new_state, %error, "connection state change on error");
            current.state = new_state;
            if self.waiters.is_empty() {
                info!(%error, "no state waiters, keeping error for later");
                current.last_error = Some(error.clone());
            }
        }
        self.waiters.propagate_error(error).await;
    }

    pub fn last_error(&self) -> Option<Error> {
        self.current.lock().last_error.clone()
    }

    pub fn clear_last_error(&self) {
        self.current.lock().last_error = None;
    }

    pub fn take_last_error(&self) -> Option<Error> {
        self.current.lock().last_error.take()
    }

    /// Registers a waiter for any of `states`. The current state is
    /// captured under the same lock as the registration, so no transition
    /// between the two can be missed.
    pub fn create_waiter(&self, states: &[ConnectionState]) -> StateWaiter<'_> {
        let awaited: Arc<[ConnectionState]> = states.into();
        let current = self.current.lock();
        let accepted = awaited.clone();
        let description = format!("one of the states {:?}", states);
        let waiter = BlockingWaiter::new(description, move |s: &ConnectionState| {
            accepted.contains(s)
        });
        let registration = self.waiters.register(Arc::new(waiter));
        StateWaiter {
            start_state: current.state,
            awaited,
            registration,
        }
    }
}

/// Waits for the connection to reach one of a set of states
pub(crate) struct StateWaiter<'a> {
    start_state: ConnectionState,
    awaited: Arc<[ConnectionState]>,
    registration: Registration<'a, ConnectionState>,
}

impl<'a> StateWaiter<'a> {
    /// Returns immediately if the state at registration time was already
    /// awaited. The waiter is closed and deregistered on return.
    pub async fn await_state(self, timeout: Duration) -> Result<ConnectionState, Error> {
        if self.awaited.contains(&self.start_state) {
            return Ok(self.start_state);
        }
        let start_state = self.start_state;
        self.registration
            .waiter()
            .block(timeout)
            .await
            .map_err(|err| match err {
                Error::TimeoutExpired { timeout, .. } => Error::TimeoutExpired {
                    timeout,
                    waiting_for: format!(
                        "one of the states {:?}, state at start was {}",
                        self.awaited, start_state
                    ),
                },
                other => other,
            })
    }
}
