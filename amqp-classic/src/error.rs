//! Errors surfaced by connections, sessions and waiters

use std::{io, sync::Arc, time::Duration};

use crate::{framing, transport};

/// Error type shared by every public operation of the client
///
/// The type is `Clone` so that a single failure can be fanned out to every
/// caller blocked on the connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The broker does not speak a protocol version this client supports
    #[error("Protocol version {major}-{minor} is not supported")]
    ProtocolVersionMismatch {
        /// Major version reported by the broker
        major: u8,
        /// Minor version reported by the broker
        minor: u8,
    },

    /// SASL negotiation failed or the broker refused access
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Every channel id up to the negotiated channel max is in use
    #[error("No channel id available up to channel max {0}")]
    ChannelLimitReached(u16),

    /// A blocking call did not complete in time
    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    TimeoutExpired {
        /// The timeout that elapsed
        timeout: Duration,
        /// Description of what was being awaited
        waiting_for: String,
    },

    /// The broker closed the connection
    #[error("Connection closed by broker with reply code {reply_code}: {reply_text}")]
    ConnectionClosedByPeer {
        /// Reply code sent by the broker
        reply_code: u16,
        /// Reply text sent by the broker
        reply_text: String,
    },

    /// The broker closed a channel
    #[error("Channel {channel} closed by broker with reply code {reply_code}: {reply_text}")]
    ChannelClosedByPeer {
        /// Channel that was closed
        channel: u16,
        /// Reply code sent by the broker
        reply_code: u16,
        /// Reply text sent by the broker
        reply_text: String,
    },

    /// The underlying byte stream failed
    #[error("Transport failure: {0}")]
    TransportFailure(Arc<io::Error>),

    /// Nothing was received from the broker within the heartbeat timeout
    #[error("Idle timeout")]
    IdleTimeout,

    /// The broker detached a 0-10 session
    #[error("Session detached by broker: {0}")]
    SessionDetached(String),

    /// Bytes on the wire could not be framed or decoded
    #[error("Framing error: {0}")]
    Framing(String),

    /// A method arrived that is not legal in the current state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection has been closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A session has been closed
    #[error("Session {0} is closed")]
    SessionClosed(u16),

    /// The waiter was closed before it was resolved
    #[error("Waiter was closed")]
    WaiterClosed,

    /// The connection was lost and is being re-established
    #[error("Failover in progress")]
    FailoverInProgress,

    /// A failover discarded uncommitted work. The broker rolled the
    /// transaction back.
    #[error("Transaction rolled back after failover")]
    TransactionRolledBack,

    /// The broker redirected the connection elsewhere
    #[error("Connection redirected to {host}")]
    Redirect {
        /// The host the broker redirected to
        host: String,
        /// Other hosts the broker advertised
        known_hosts: Vec<String>,
    },

    /// A mandatory or immediate message could not be routed
    #[error("Message returned with reply code {reply_code}: {reply_text}")]
    MessageReturned {
        /// Reply code sent by the broker
        reply_code: u16,
        /// Reply text sent by the broker
        reply_text: String,
        /// Exchange the message was published to
        exchange: String,
        /// Routing key the message was published with
        routing_key: String,
    },

    /// The operation is not valid for the current session or connection
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Settings or a broker url could not be used
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    pub(crate) fn timeout(timeout: Duration, waiting_for: impl Into<String>) -> Self {
        Self::TimeoutExpired {
            timeout,
            waiting_for: waiting_for.into(),
        }
    }

    /// Whether the connection could be re-established after this error
    ///
    /// Only losses of the byte stream, heartbeat timeouts, redirects and a
    /// broker close with `CONNECTION_FORCED` qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportFailure(_) | Self::IdleTimeout | Self::Redirect { .. } => true,
            Self::ConnectionClosedByPeer { reply_code, .. } => {
                *reply_code == crate::constants::CONNECTION_FORCED
            }
            _ => false,
        }
    }

    /// Whether this error means the byte stream itself is gone
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::IdleTimeout)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::TransportFailure(Arc::new(err))
    }
}

impl From<framing::Error> for Error {
    fn from(err: framing::Error) -> Self {
        match err {
            framing::Error::Io(err) => Self::TransportFailure(Arc::new(err)),
            other => Self::Framing(other.to_string()),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::TransportFailure(Arc::new(err)),
            transport::Error::IdleTimeout => Self::IdleTimeout,
            transport::Error::Framing(err) => err.into(),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ConnectionClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_forced_close_is_retryable() {
        let forced = Error::ConnectionClosedByPeer {
            reply_code: crate::constants::CONNECTION_FORCED,
            reply_text: "shutdown".into(),
        };
        assert!(forced.is_retryable());

        let refused = Error::ConnectionClosedByPeer {
            reply_code: crate::constants::ACCESS_REFUSED,
            reply_text: "no".into(),
        };
        assert!(!refused.is_retryable());

        let io = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_retryable());
        assert!(io.is_transport_failure());
        assert!(!Error::AuthenticationFailure("bad".into()).is_retryable());
    }
}
