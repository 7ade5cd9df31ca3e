//! Routes incoming methods to handlers
//!
//! Versions differ in which methods exist and in how a few operations are
//! spelled on the wire. Rather than layering one dispatcher per version on
//! top of another, a single [`MethodDispatcher`] is built from the
//! version's [`VersionCapabilities`] and one table of handlers.

use std::{collections::HashMap, sync::Arc};

use tracing::warn;

use crate::{
    connection::ConnectionInner,
    framing::{Method, MethodKind, ProtocolEvent, ProtocolVersion},
    util::Running,
    Error,
};

pub(crate) mod handlers;

/// Handles one incoming method on the engine task
pub(crate) type Handler = fn(&Arc<ConnectionInner>, &ProtocolEvent) -> Result<Running, Error>;

/// Outcome of [`MethodDispatcher::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// A handler processed the method
    Handled(Running),
    /// No handler is registered; the method is only offered to waiters
    NotApplicable,
    /// The negotiated version does not have this method
    UnsupportedByVersion,
}

/// How a session asks the broker to redeliver unacknowledged messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverFlavour {
    /// Method sent
    pub request: MethodKind,
    /// Method awaited
    pub reply: MethodKind,
}

impl RecoverFlavour {
    /// Builds the request
    pub fn request(&self, requeue: bool) -> Method {
        match self.request {
            MethodKind::BasicRecoverSync => Method::BasicRecoverSync { requeue },
            _ => Method::BasicRecover { requeue },
        }
    }
}

/// How a session is opened on its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOpen {
    /// `channel.open`, answered by `channel.open-ok`
    ChannelOpen,
    /// `session.attach`, answered by `session.attached` or `session.detached`
    SessionAttach,
}

/// What a protocol version can do
#[derive(Debug)]
pub struct VersionCapabilities {
    /// The version described
    pub version: ProtocolVersion,
    /// Methods the version does not define
    pub unsupported: &'static [MethodKind],
    /// Recover request and its reply
    pub recover: RecoverFlavour,
    /// Session opening
    pub session_open: SessionOpen,
}

impl VersionCapabilities {
    /// Whether `kind` exists in this version
    pub fn supports(&self, kind: MethodKind) -> bool {
        !self.unsupported.contains(&kind)
    }
}

static V0_8: VersionCapabilities = VersionCapabilities {
    version: ProtocolVersion::V0_8,
    unsupported: &[
        MethodKind::SessionAttach,
        MethodKind::SessionAttached,
        MethodKind::SessionDetached,
        MethodKind::ConnectionHeartbeat,
        MethodKind::BasicRecoverSync,
        MethodKind::BasicRecoverOk,
        MethodKind::QueueUnbind,
        MethodKind::QueueUnbindOk,
    ],
    // Brokers speaking 0-8 answer `basic.recover` with `basic.recover-sync-ok`
    recover: RecoverFlavour {
        request: MethodKind::BasicRecover,
        reply: MethodKind::BasicRecoverSyncOk,
    },
    session_open: SessionOpen::ChannelOpen,
};

static V0_9: VersionCapabilities = VersionCapabilities {
    version: ProtocolVersion::V0_9,
    unsupported: &[
        MethodKind::SessionAttach,
        MethodKind::SessionAttached,
        MethodKind::SessionDetached,
        MethodKind::ConnectionHeartbeat,
        MethodKind::BasicRecoverOk,
    ],
    recover: RecoverFlavour {
        request: MethodKind::BasicRecoverSync,
        reply: MethodKind::BasicRecoverSyncOk,
    },
    session_open: SessionOpen::ChannelOpen,
};

static V0_9_1: VersionCapabilities = VersionCapabilities {
    version: ProtocolVersion::V0_9_1,
    unsupported: &[
        MethodKind::SessionAttach,
        MethodKind::SessionAttached,
        MethodKind::SessionDetached,
        MethodKind::ConnectionHeartbeat,
        MethodKind::ConnectionRedirect,
        MethodKind::BasicRecoverSync,
        MethodKind::BasicRecoverSyncOk,
    ],
    recover: RecoverFlavour {
        request: MethodKind::BasicRecover,
        reply: MethodKind::BasicRecoverOk,
    },
    session_open: SessionOpen::ChannelOpen,
};

static V0_10: VersionCapabilities = VersionCapabilities {
    version: ProtocolVersion::V0_10,
    unsupported: &[
        MethodKind::ChannelOpen,
        MethodKind::ChannelOpenOk,
        MethodKind::BasicRecoverSync,
        MethodKind::BasicRecoverSyncOk,
    ],
    recover: RecoverFlavour {
        request: MethodKind::BasicRecover,
        reply: MethodKind::BasicRecoverOk,
    },
    session_open: SessionOpen::SessionAttach,
};

impl ProtocolVersion {
    /// Capability table of this version
    pub fn capabilities(&self) -> &'static VersionCapabilities {
        match self {
            Self::V0_8 => &V0_8,
            Self::V0_9 => &V0_9,
            Self::V0_9_1 => &V0_9_1,
            Self::V0_10 => &V0_10,
        }
    }
}

/// Routes methods of one protocol version to their handlers
pub(crate) struct MethodDispatcher {
    capabilities: &'static VersionCapabilities,
    handlers: HashMap<MethodKind, Handler>,
}

impl std::fmt::Debug for MethodDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDispatcher")
            .field("version", &self.capabilities.version)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl MethodDispatcher {
    pub fn for_version(version: ProtocolVersion) -> Self {
        let capabilities = version.capabilities();
        let handlers = handlers::table()
            .into_iter()
            .filter(|(kind, _)| capabilities.supports(*kind))
            .collect();
        Self {
            capabilities,
            handlers,
        }
    }

    pub fn capabilities(&self) -> &'static VersionCapabilities {
        self.capabilities
    }

    /// Runs the handler registered for the event's method
    pub fn dispatch(
        &self,
        connection: &Arc<ConnectionInner>,
        event: &ProtocolEvent,
    ) -> Result<Dispatch, Error> {
        let kind = event.method.kind();
        if !self.capabilities.supports(kind) {
            warn!(
                channel = event.channel,
                method = %kind,
                version = %self.capabilities.version,
                "method is not part of the negotiated version"
            );
            return Ok(Dispatch::UnsupportedByVersion);
        }
        match self.handlers.get(&kind) {
            Some(handler) => handler(connection, event).map(Dispatch::Handled),
            None => Ok(Dispatch::NotApplicable),
        }
    }

    /// Refuses to send methods the negotiated version does not define
    pub fn check_outgoing(&self, kind: MethodKind) -> Result<(), Error> {
        match self.capabilities.supports(kind) {
            true => Ok(()),
            false => Err(Error::IllegalState(format!(
                "{} is not supported by protocol version {}",
                kind, self.capabilities.version
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_flavour_follows_version() {
        assert_eq!(
            ProtocolVersion::V0_8.capabilities().recover.request,
            MethodKind::BasicRecover
        );
        assert_eq!(
            ProtocolVersion::V0_8.capabilities().recover.reply,
            MethodKind::BasicRecoverSyncOk
        );
        assert_eq!(
            ProtocolVersion::V0_9.capabilities().recover.request(true),
            Method::BasicRecoverSync { requeue: true }
        );
        assert_eq!(
            ProtocolVersion::V0_9_1.capabilities().recover.reply,
            MethodKind::BasicRecoverOk
        );
    }

    #[test]
    fn only_0_10_attaches_sessions() {
        for version in ProtocolVersion::ALL {
            let expected = match version {
                ProtocolVersion::V0_10 => SessionOpen::SessionAttach,
                _ => SessionOpen::ChannelOpen,
            };
            assert_eq!(version.capabilities().session_open, expected);
        }
    }

    #[test]
    fn unsupported_methods_are_not_routed() {
        let dispatcher = MethodDispatcher::for_version(ProtocolVersion::V0_9_1);
        assert!(dispatcher
            .check_outgoing(MethodKind::BasicRecoverSync)
            .is_err());
        assert!(dispatcher.check_outgoing(MethodKind::BasicRecover).is_ok());
        assert!(!dispatcher.handlers.contains_key(&MethodKind::ConnectionRedirect));
        assert!(dispatcher.handlers.contains_key(&MethodKind::ConnectionStart));

        let dispatcher = MethodDispatcher::for_version(ProtocolVersion::V0_10);
        assert!(dispatcher.handlers.contains_key(&MethodKind::SessionDetached));
    }
}
