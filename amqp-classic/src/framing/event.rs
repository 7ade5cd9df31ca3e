use bytes::Bytes;

use super::{ContentHeader, Method};

/// A method addressed to a channel, with its content if it carries any
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    /// Channel the method travels on
    pub channel: u16,

    /// The method itself
    pub method: Method,

    /// Content header, present on content-bearing methods
    pub header: Option<ContentHeader>,

    /// Content body. `None` when the body is empty.
    pub body: Option<Bytes>,

    /// Asks the peer to confirm completion. Only meaningful for 0-10
    /// commands.
    pub sync: bool,
}

impl ProtocolEvent {
    /// Creates an event without content
    pub fn new(channel: u16, method: Method) -> Self {
        Self {
            channel,
            method,
            header: None,
            body: None,
            sync: false,
        }
    }

    /// Attaches content to the event
    pub fn with_content(mut self, header: ContentHeader, body: Bytes) -> Self {
        self.header = Some(header);
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    /// Marks the event as requiring a completion from the peer
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}
