//! Framing for 0-8, 0-9 and 0-9-1
//!
//! ```text
//! +------+---------+---------+-------------+-----------+
//! | type | channel |  size   |   payload   | frame-end |
//! |  u8  |   u16   |   u32   | size octets |   0xCE    |
//! +------+---------+---------+-------------+-----------+
//! ```

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::FRAME_END;

use super::{
    starts_with_protocol_header, ArgumentLayout, ContentHeader, Error, Item, Method,
    ProtocolEvent, ProtocolHeader,
};

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;

/// type + channel + size
const FRAME_HEADER_SIZE: usize = 7;

/// Header plus the end octet
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// A content-bearing method whose header or body is still arriving
#[derive(Debug)]
struct PartialContent {
    method: Method,
    header: Option<ContentHeader>,
    body: BytesMut,
}

/// Encoder and decoder for legacy frames
#[derive(Debug)]
pub struct LegacyCodec {
    max_frame_size: usize,
    partial: HashMap<u16, PartialContent>,
}

impl LegacyCodec {
    /// Creates a codec that rejects frames larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            partial: HashMap::new(),
        }
    }

    /// Current max frame size, including overhead
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Applies a newly negotiated max frame size to subsequent frames
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    fn put_frame(
        &self,
        dst: &mut BytesMut,
        frame_type: u8,
        channel: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let size = payload.len() + FRAME_OVERHEAD;
        if size > self.max_frame_size {
            return Err(Error::MaxFrameSizeExceeded {
                size,
                max: self.max_frame_size,
            });
        }
        dst.reserve(size);
        dst.put_u8(frame_type);
        dst.put_u16(channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }

    fn encode_event(&self, event: ProtocolEvent, dst: &mut BytesMut) -> Result<(), Error> {
        let mut payload = BytesMut::new();
        event.method.encode(&mut payload, ArgumentLayout::Legacy)?;
        self.put_frame(dst, FRAME_METHOD, event.channel, &payload)?;

        if let Some(header) = &event.header {
            payload.clear();
            header.encode(&mut payload)?;
            self.put_frame(dst, FRAME_HEADER, event.channel, &payload)?;

            if let Some(body) = &event.body {
                let chunk_size = self.max_frame_size.saturating_sub(FRAME_OVERHEAD).max(1);
                for chunk in body.chunks(chunk_size) {
                    self.put_frame(dst, FRAME_BODY, event.channel, chunk)?;
                }
            }
        }
        Ok(())
    }

    /// Feeds one complete frame into the per-channel content state.
    /// Returns an item once a method and all of its content have arrived.
    fn on_frame(
        &mut self,
        frame_type: u8,
        channel: u16,
        mut payload: Bytes,
    ) -> Result<Option<Item>, Error> {
        match frame_type {
            FRAME_METHOD => {
                if self.partial.contains_key(&channel) {
                    return Err(Error::framing(format!(
                        "method frame on channel {} while content is incomplete",
                        channel
                    )));
                }
                let method = Method::decode(&mut payload, ArgumentLayout::Legacy)?;
                if method.kind().has_content() {
                    self.partial.insert(
                        channel,
                        PartialContent {
                            method,
                            header: None,
                            body: BytesMut::new(),
                        },
                    );
                    Ok(None)
                } else {
                    Ok(Some(Item::Event(ProtocolEvent::new(channel, method))))
                }
            }
            FRAME_HEADER => {
                let partial = self.partial.get_mut(&channel).ok_or_else(|| {
                    Error::framing(format!("content header without method on channel {}", channel))
                })?;
                if partial.header.is_some() {
                    return Err(Error::framing("duplicate content header"));
                }
                let header = ContentHeader::decode(&mut payload)?;
                let complete = header.body_size == 0;
                partial.header = Some(header);
                if complete {
                    Ok(self.complete(channel))
                } else {
                    Ok(None)
                }
            }
            FRAME_BODY => {
                let partial = self.partial.get_mut(&channel).ok_or_else(|| {
                    Error::framing(format!("content body without method on channel {}", channel))
                })?;
                let expected = match &partial.header {
                    Some(header) => header.body_size,
                    None => return Err(Error::framing("content body before content header")),
                };
                partial.body.extend_from_slice(&payload);
                let received = partial.body.len() as u64;
                if received > expected {
                    return Err(Error::framing(format!(
                        "content body of {} bytes exceeds declared size {}",
                        received, expected
                    )));
                }
                if received == expected {
                    Ok(self.complete(channel))
                } else {
                    Ok(None)
                }
            }
            FRAME_HEARTBEAT => Ok(Some(Item::Heartbeat)),
            other => Err(Error::framing(format!("unknown frame type {}", other))),
        }
    }

    fn complete(&mut self, channel: u16) -> Option<Item> {
        self.partial.remove(&channel).map(|partial| {
            let PartialContent {
                method,
                header,
                body,
            } = partial;
            let mut event = ProtocolEvent::new(channel, method);
            event.header = header;
            if !body.is_empty() {
                event.body = Some(body.freeze());
            }
            Item::Event(event)
        })
    }
}

impl Encoder<Item> for LegacyCodec {
    type Error = Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Item::ProtocolHeader(header) => {
                let buf: [u8; 8] = header.into();
                dst.put_slice(&buf);
                Ok(())
            }
            Item::Heartbeat => self.put_frame(dst, FRAME_HEARTBEAT, 0, &[]),
            Item::Event(event) => self.encode_event(event, dst),
        }
    }
}

impl Decoder for LegacyCodec {
    type Item = Item;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Several frames may be buffered. Keep going until an item is
        // complete or more bytes are needed.
        loop {
            if starts_with_protocol_header(src) {
                if src.len() < 8 {
                    return Ok(None);
                }
                let raw = src.split_to(8);
                let header = ProtocolHeader::try_from(&raw[..])
                    .map_err(|_| Error::framing("malformed protocol header"))?;
                return Ok(Some(Item::ProtocolHeader(header)));
            }

            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let frame_type = src[0];
            let channel = u16::from_be_bytes([src[1], src[2]]);
            let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
            let total = size + FRAME_OVERHEAD;
            if total > self.max_frame_size {
                return Err(Error::MaxFrameSizeExceeded {
                    size: total,
                    max: self.max_frame_size,
                });
            }
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(total);
            frame.advance(FRAME_HEADER_SIZE);
            let payload = frame.split_to(size).freeze();
            if frame[0] != FRAME_END {
                return Err(Error::framing(format!(
                    "frame end octet {:#x} is not {:#x}",
                    frame[0], FRAME_END
                )));
            }

            if let Some(item) = self.on_frame(frame_type, channel, payload)? {
                return Ok(Some(item));
            }
        }
    }
}
