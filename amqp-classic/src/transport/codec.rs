//! Codec selected by protocol version

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::framing::{
    legacy::LegacyCodec,
    segment::{Frame, FrameCodec},
    starts_with_protocol_header, Assembler, Disassembler, Error, Item, Method, ProtocolEvent,
    ProtocolHeader, ProtocolVersion,
};

/// 0-10 framing: events go through the [`Disassembler`] on the way out and
/// the [`Assembler`] on the way in
#[derive(Debug)]
pub struct SegmentCodec {
    frames: FrameCodec,
    disassembler: Disassembler,
    assembler: Assembler,
    scratch: Vec<Frame>,
}

impl SegmentCodec {
    /// Creates a codec for the given max frame size
    pub fn new(max_frame_size: u32) -> Result<Self, Error> {
        Ok(Self {
            frames: FrameCodec::new(max_frame_size as usize),
            disassembler: Disassembler::new(max_frame_size)?,
            assembler: Assembler::new(),
            scratch: Vec::new(),
        })
    }

    fn set_max_frame_size(&mut self, max_frame_size: u32) -> Result<(), Error> {
        self.disassembler.set_max_frame_size(max_frame_size)?;
        self.frames.set_max_frame_size(max_frame_size as usize);
        Ok(())
    }

    fn encode_event(&mut self, event: &ProtocolEvent, dst: &mut BytesMut) -> Result<(), Error> {
        self.scratch.clear();
        self.disassembler.disassemble(event, &mut self.scratch)?;
        for frame in self.scratch.drain(..) {
            self.frames.encode(frame, dst)?;
        }
        Ok(())
    }
}

impl Encoder<Item> for SegmentCodec {
    type Error = Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Item::ProtocolHeader(header) => {
                let buf: [u8; 8] = header.into();
                dst.put_slice(&buf);
                Ok(())
            }
            Item::Heartbeat => {
                let heartbeat = ProtocolEvent::new(0, Method::ConnectionHeartbeat);
                self.encode_event(&heartbeat, dst)
            }
            Item::Event(event) => self.encode_event(&event, dst),
        }
    }
}

impl Decoder for SegmentCodec {
    type Item = Item;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
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

            let frame = match self.frames.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            if let Some(event) = self.assembler.receive(frame)? {
                let item = match event.method {
                    Method::ConnectionHeartbeat => Item::Heartbeat,
                    _ => Item::Event(event),
                };
                return Ok(Some(item));
            }
        }
    }
}

/// The codec for whichever framing the negotiated version uses
#[derive(Debug)]
pub enum WireCodec {
    /// 0-8, 0-9 and 0-9-1
    Legacy(LegacyCodec),
    /// 0-10
    Segmented(SegmentCodec),
}

impl WireCodec {
    /// Creates the codec for `version` with the given initial max frame size
    pub fn for_version(version: ProtocolVersion, max_frame_size: u32) -> Result<Self, Error> {
        match version.is_segmented() {
            true => SegmentCodec::new(max_frame_size).map(Self::Segmented),
            false => Ok(Self::Legacy(LegacyCodec::new(max_frame_size as usize))),
        }
    }

    /// Applies a newly negotiated max frame size to subsequent frames
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) -> Result<(), Error> {
        match self {
            Self::Legacy(codec) => {
                codec.set_max_frame_size(max_frame_size as usize);
                Ok(())
            }
            Self::Segmented(codec) => codec.set_max_frame_size(max_frame_size),
        }
    }
}

impl Encoder<Item> for WireCodec {
    type Error = Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(codec) => codec.encode(item, dst),
            Self::Segmented(codec) => codec.encode(item, dst),
        }
    }
}

impl Decoder for WireCodec {
    type Item = Item;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            Self::Legacy(codec) => codec.decode(src),
            Self::Segmented(codec) => codec.decode(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    #[test]
    fn segmented_heartbeat_is_a_control() {
        let mut codec = WireCodec::for_version(ProtocolVersion::V0_10, 4096).unwrap();
        let mut buf = BytesMut::new();
        codec.encode(Item::Heartbeat, &mut buf).unwrap();
        assert_eq!(buf[1], 0); // control segment
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Item::Heartbeat));
    }

    #[test]
    fn legacy_codec_is_chosen_for_0_9_1() {
        let codec = WireCodec::for_version(ProtocolVersion::V0_9_1, 131_072).unwrap();
        assert!(matches!(codec, WireCodec::Legacy(_)));
    }

    #[test]
    fn segmented_codec_rejects_oversized_max_frame() {
        assert!(WireCodec::for_version(ProtocolVersion::V0_10, 131_072).is_err());
    }
}
