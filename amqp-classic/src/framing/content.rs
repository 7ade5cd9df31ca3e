//! Content header and basic properties

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    field::{read_short_str, read_table, read_u16, read_u64, read_u8, write_short_str, write_table},
    Error, FieldTable,
};

/// Content header sent between a content-bearing method and its body
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Class of the method that carries the content
    pub class_id: u16,

    /// Total size of the body in bytes
    pub body_size: u64,

    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Header for a basic-class message with the given body size
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: 60,
            body_size,
            properties,
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        dst.put_u16(self.class_id);
        dst.put_u16(0); // weight
        dst.put_u64(self.body_size);
        self.properties.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let class_id = read_u16(src)?;
        let _weight = read_u16(src)?;
        let body_size = read_u64(src)?;
        let properties = BasicProperties::decode(src)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }
}

/// Properties of a basic-class message. Presence is encoded as a 16 bit
/// flag word, highest bit first.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

const CONTENT_TYPE: u16 = 1 << 15;
const CONTENT_ENCODING: u16 = 1 << 14;
const HEADERS: u16 = 1 << 13;
const DELIVERY_MODE: u16 = 1 << 12;
const PRIORITY: u16 = 1 << 11;
const CORRELATION_ID: u16 = 1 << 10;
const REPLY_TO: u16 = 1 << 9;
const EXPIRATION: u16 = 1 << 8;
const MESSAGE_ID: u16 = 1 << 7;
const TIMESTAMP: u16 = 1 << 6;
const TYPE: u16 = 1 << 5;
const USER_ID: u16 = 1 << 4;
const APP_ID: u16 = 1 << 3;
const CLUSTER_ID: u16 = 1 << 2;

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag
            }
        };
        set(self.content_type.is_some(), CONTENT_TYPE);
        set(self.content_encoding.is_some(), CONTENT_ENCODING);
        set(self.headers.is_some(), HEADERS);
        set(self.delivery_mode.is_some(), DELIVERY_MODE);
        set(self.priority.is_some(), PRIORITY);
        set(self.correlation_id.is_some(), CORRELATION_ID);
        set(self.reply_to.is_some(), REPLY_TO);
        set(self.expiration.is_some(), EXPIRATION);
        set(self.message_id.is_some(), MESSAGE_ID);
        set(self.timestamp.is_some(), TIMESTAMP);
        set(self.message_type.is_some(), TYPE);
        set(self.user_id.is_some(), USER_ID);
        set(self.app_id.is_some(), APP_ID);
        set(self.cluster_id.is_some(), CLUSTER_ID);
        flags
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        dst.put_u16(self.flags());

        let short_strs_head = [&self.content_type, &self.content_encoding];
        for value in short_strs_head.into_iter().flatten() {
            write_short_str(dst, value)?;
        }
        if let Some(headers) = &self.headers {
            write_table(dst, headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            dst.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            dst.put_u8(priority);
        }
        let short_strs_mid = [
            &self.correlation_id,
            &self.reply_to,
            &self.expiration,
            &self.message_id,
        ];
        for value in short_strs_mid.into_iter().flatten() {
            write_short_str(dst, value)?;
        }
        if let Some(timestamp) = self.timestamp {
            dst.put_u64(timestamp);
        }
        let short_strs_tail = [
            &self.message_type,
            &self.user_id,
            &self.app_id,
            &self.cluster_id,
        ];
        for value in short_strs_tail.into_iter().flatten() {
            write_short_str(dst, value)?;
        }
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, Error> {
        let flags = read_u16(src)?;
        let short_str = |src: &mut Bytes, flag: u16| -> Result<Option<String>, Error> {
            match flags & flag {
                0 => Ok(None),
                _ => read_short_str(src).map(Some),
            }
        };

        let content_type = short_str(src, CONTENT_TYPE)?;
        let content_encoding = short_str(src, CONTENT_ENCODING)?;
        let headers = match flags & HEADERS {
            0 => None,
            _ => Some(read_table(src)?),
        };
        let delivery_mode = match flags & DELIVERY_MODE {
            0 => None,
            _ => Some(read_u8(src)?),
        };
        let priority = match flags & PRIORITY {
            0 => None,
            _ => Some(read_u8(src)?),
        };
        let correlation_id = short_str(src, CORRELATION_ID)?;
        let reply_to = short_str(src, REPLY_TO)?;
        let expiration = short_str(src, EXPIRATION)?;
        let message_id = short_str(src, MESSAGE_ID)?;
        let timestamp = match flags & TIMESTAMP {
            0 => None,
            _ => Some(read_u64(src)?),
        };
        let message_type = short_str(src, TYPE)?;
        let user_id = short_str(src, USER_ID)?;
        let app_id = short_str(src, APP_ID)?;
        let cluster_id = short_str(src, CLUSTER_ID)?;

        Ok(Self {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            message_type,
            user_id,
            app_id,
            cluster_id,
        })
    }
}
