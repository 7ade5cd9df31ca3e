//! Wire representation of protocol versions, methods, content and frames
//!
//! Two framings are supported. 0-8, 0-9 and 0-9-1 use [`legacy`] frames
//! terminated by `0xCE`. 0-10 uses [`segment`] frames that are fragmented
//! by the [`Disassembler`] and reassembled by the [`Assembler`].

use std::{convert::TryFrom, fmt};

use bytes::Bytes;

pub mod assembler;
pub mod content;
pub mod disassembler;
mod error;
pub mod event;
pub mod field;
pub mod legacy;
pub mod method;
pub mod segment;

pub use assembler::Assembler;
pub use content::{BasicProperties, ContentHeader};
pub use disassembler::Disassembler;
pub use error::Error;
pub use event::ProtocolEvent;
pub use field::{FieldTable, FieldValue};
pub use method::{ArgumentLayout, Method, MethodKind};

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Protocol versions spoken by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum ProtocolVersion {
    /// AMQP 0-8
    #[serde(rename = "0-8")]
    V0_8,
    /// AMQP 0-9
    #[serde(rename = "0-9")]
    V0_9,
    /// AMQP 0-9-1
    #[serde(rename = "0-9-1")]
    V0_9_1,
    /// AMQP 0-10
    #[serde(rename = "0-10")]
    V0_10,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V0_9_1
    }
}

impl ProtocolVersion {
    /// Every supported version, newest first
    pub const ALL: [ProtocolVersion; 4] = [Self::V0_10, Self::V0_9_1, Self::V0_9, Self::V0_8];

    /// The newest version this client supports
    pub fn latest() -> Self {
        Self::ALL[0]
    }

    /// Major version as reported in `connection.start`
    pub fn major(&self) -> u8 {
        match self {
            Self::V0_8 => 8,
            Self::V0_9 | Self::V0_9_1 | Self::V0_10 => 0,
        }
    }

    /// Minor version as reported in `connection.start`
    pub fn minor(&self) -> u8 {
        match self {
            Self::V0_8 => 0,
            Self::V0_9 => 9,
            Self::V0_9_1 => 91,
            Self::V0_10 => 10,
        }
    }

    /// Looks up a version by the major and minor numbers a broker reports
    pub fn from_numbers(major: u8, minor: u8) -> Option<Self> {
        match (major, minor) {
            (8, 0) => Some(Self::V0_8),
            (0, 9) => Some(Self::V0_9),
            (0, 91) | (9, 1) => Some(Self::V0_9_1),
            (0, 10) => Some(Self::V0_10),
            _ => None,
        }
    }

    /// Whether this version uses 0-10 segmented framing
    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::V0_10)
    }

    /// The header the client sends to open a connection with this version
    pub fn header(&self) -> ProtocolHeader {
        match self {
            Self::V0_8 => ProtocolHeader::new(1, 1, 8, 0),
            Self::V0_9 => ProtocolHeader::new(1, 1, 0, 9),
            Self::V0_9_1 => ProtocolHeader::new(0, 0, 9, 1),
            Self::V0_10 => ProtocolHeader::new(1, 1, 0, 10),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::V0_8 => "0-8",
            Self::V0_9 => "0-9",
            Self::V0_9_1 => "0-9-1",
            Self::V0_10 => "0-10",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0-8" | "0_8" => Ok(Self::V0_8),
            "0-9" | "0_9" => Ok(Self::V0_9),
            "0-9-1" | "0_9_1" | "0-91" => Ok(Self::V0_9_1),
            "0-10" | "0_10" => Ok(Self::V0_10),
            _ => Err(crate::Error::InvalidConfiguration(format!(
                "unknown protocol version {}",
                s
            ))),
        }
    }
}

/// The eight byte protocol header exchanged before any frame
///
/// The four bytes after `AMQP` are kept verbatim because the versions lay
/// them out differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol class or id byte
    pub protocol_class: u8,

    /// Protocol instance byte
    pub instance: u8,

    /// First version byte
    pub major: u8,

    /// Second version byte
    pub minor: u8,
}

impl ProtocolHeader {
    /// Creates a new protocol header
    pub fn new(protocol_class: u8, instance: u8, major: u8, minor: u8) -> Self {
        Self {
            protocol_class,
            instance,
            major,
            minor,
        }
    }

    /// The version this header announces, if it is one this client knows
    pub fn version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::ALL
            .iter()
            .copied()
            .find(|v| v.header() == *self)
    }

    /// The `(major, minor)` pair to report when the header is rejected
    pub fn reported_version(&self) -> (u8, u8) {
        match self.version() {
            Some(v) => (v.major(), v.minor()),
            None => (self.major, self.minor),
        }
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PROTOCOL_HEADER_PREFIX[0], // b'A'
            PROTOCOL_HEADER_PREFIX[1], // b'M'
            PROTOCOL_HEADER_PREFIX[2], // b'Q'
            PROTOCOL_HEADER_PREFIX[3], // b'P'
            value.protocol_class,
            value.instance,
            value.major,
            value.minor,
        ]
    }
}

impl From<ProtocolHeader> for Bytes {
    fn from(header: ProtocolHeader) -> Self {
        let bytes: [u8; 8] = header.into();
        Bytes::copy_from_slice(&bytes[..])
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        Ok(Self::new(v[4], v[5], v[6], v[7]))
    }
}

impl<'a> TryFrom<&'a [u8]> for ProtocolHeader {
    type Error = &'a [u8];

    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        if value.len() != 8 || value[..4] != PROTOCOL_HEADER_PREFIX[..] {
            return Err(value);
        }
        Ok(Self::new(value[4], value[5], value[6], value[7]))
    }
}

/// Whether the buffered bytes start with a protocol header rather than a
/// frame. `A` is never a valid frame type or frame flag byte.
pub(crate) fn starts_with_protocol_header(src: &[u8]) -> bool {
    src.first() == Some(&PROTOCOL_HEADER_PREFIX[0])
}

/// Unit of traffic exchanged between the connection engine and the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Protocol header, sent once by the client and echoed by a broker
    /// that rejects the proposed version
    ProtocolHeader(ProtocolHeader),

    /// A method with optional content
    Event(ProtocolEvent),

    /// Keep-alive
    Heartbeat,
}

impl From<ProtocolEvent> for Item {
    fn from(event: ProtocolEvent) -> Self {
        Self::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::{ProtocolHeader, ProtocolVersion};

    #[test]
    fn headers_round_trip_to_versions() {
        for version in ProtocolVersion::ALL {
            let bytes: [u8; 8] = version.header().into();
            let header = ProtocolHeader::try_from(bytes).unwrap();
            assert_eq!(header.version(), Some(version));
        }
    }

    #[test]
    fn broker_reported_0_9_maps_to_0_9() {
        assert_eq!(ProtocolVersion::from_numbers(0, 9), Some(ProtocolVersion::V0_9));
        assert_eq!(ProtocolVersion::from_numbers(0, 91), Some(ProtocolVersion::V0_9_1));
        assert_eq!(ProtocolVersion::from_numbers(8, 0), Some(ProtocolVersion::V0_8));
        assert_eq!(ProtocolVersion::from_numbers(1, 0), None);
    }

    #[test]
    fn non_amqp_header_is_rejected() {
        let raw = *b"HTTP/1.1";
        assert!(ProtocolHeader::try_from(raw).is_err());
    }

    #[test]
    fn unknown_header_reports_raw_numbers() {
        let header = ProtocolHeader::new(1, 1, 0, 7);
        assert_eq!(header.version(), None);
        assert_eq!(header.reported_version(), (0, 7));
    }
}
