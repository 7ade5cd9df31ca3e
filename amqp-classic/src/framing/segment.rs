//! 0-10 frames
//!
//! ```text
//! +-------+------+------+----------+-------+---------+---------+
//! | flags | type | size | reserved | track | channel | payload |
//! |  u8   |  u8  | u16  |    u8    |  u8   |   u16   |         |
//! +-------+------+------+----------+-------+---------+---------+
//! ```
//!
//! `size` counts the eight byte header as well as the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Error;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 8;

/// First frame of a segment
pub const FIRST_FRAME: u8 = 0x02;
/// Last frame of a segment
pub const LAST_FRAME: u8 = 0x01;
/// First segment of an event
pub const FIRST_SEG: u8 = 0x08;
/// Last segment of an event
pub const LAST_SEG: u8 = 0x04;

/// Track used by controls
pub const TRACK_CONTROL: u8 = 0;
/// Track used by commands and their content
pub const TRACK_COMMAND: u8 = 1;

/// Kind of segment a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    /// Connection and session controls
    Control = 0,
    /// Commands
    Command = 1,
    /// Content header
    Header = 2,
    /// Content body
    Body = 3,
}

impl TryFrom<u8> for SegmentType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let val = match value {
            0 => Self::Control,
            1 => Self::Command,
            2 => Self::Header,
            3 => Self::Body,
            _ => return Err(value),
        };
        Ok(val)
    }
}

/// A single 0-10 frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// `FIRST_FRAME`, `LAST_FRAME`, `FIRST_SEG` and `LAST_SEG` bits
    pub flags: u8,

    /// Segment type
    pub segment_type: SegmentType,

    /// Track marker
    pub track: u8,

    /// Channel
    pub channel: u16,

    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Value of the size field: payload plus header
    pub fn size(&self) -> usize {
        self.payload.len() + HEADER_SIZE
    }

    /// Whether this frame starts a segment
    pub fn is_first_frame(&self) -> bool {
        self.flags & FIRST_FRAME != 0
    }

    /// Whether this frame ends a segment
    pub fn is_last_frame(&self) -> bool {
        self.flags & LAST_FRAME != 0
    }

    /// Whether this frame belongs to the first segment of an event
    pub fn is_first_segment(&self) -> bool {
        self.flags & FIRST_SEG != 0
    }

    /// Whether this frame belongs to the last segment of an event
    pub fn is_last_segment(&self) -> bool {
        self.flags & LAST_SEG != 0
    }
}

/// Encoder and decoder of individual frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec that rejects frames larger than `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Applies a newly negotiated max frame size
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.size();
        if size > u16::MAX as usize {
            return Err(Error::MaxFrameSizeExceeded {
                size,
                max: u16::MAX as usize,
            });
        }
        dst.reserve(size);
        dst.put_u8(item.flags);
        dst.put_u8(item.segment_type as u8);
        dst.put_u16(size as u16);
        dst.put_u8(0);
        dst.put_u8(item.track);
        dst.put_u16(item.channel);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = u16::from_be_bytes([src[2], src[3]]) as usize;
        if size < HEADER_SIZE {
            return Err(Error::framing(format!(
                "frame size {} is smaller than the header",
                size
            )));
        }
        if size > self.max_frame_size {
            return Err(Error::MaxFrameSizeExceeded {
                size,
                max: self.max_frame_size,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(size);
        let flags = raw.get_u8();
        let segment_type = SegmentType::try_from(raw.get_u8())
            .map_err(|t| Error::framing(format!("unknown segment type {}", t)))?;
        let _size = raw.get_u16();
        let _reserved = raw.get_u8();
        let track = raw.get_u8();
        let channel = raw.get_u16();

        Ok(Some(Frame {
            flags,
            segment_type,
            track,
            channel,
            payload: raw.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    #[test]
    fn header_layout() {
        let frame = Frame {
            flags: FIRST_SEG | LAST_SEG | FIRST_FRAME | LAST_FRAME,
            segment_type: SegmentType::Command,
            track: TRACK_COMMAND,
            channel: 0x0102,
            payload: Bytes::from_static(b"abc"),
        };
        let mut buf = BytesMut::new();
        FrameCodec::new(1024).encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x0f, 1, 0, 11, 0, 1, 0x01, 0x02, b'a', b'b', b'c']
        );

        let decoded = FrameCodec::new(1024).decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn size_below_header_is_rejected() {
        let mut src = BytesMut::from(&[0x03u8, 0, 0, 4, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec::new(1024).decode(&mut src),
            Err(Error::FramingError(_))
        ));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut src = BytesMut::from(&[0x03u8, 1, 0, 12, 0, 1, 0, 0, b'a'][..]);
        assert_eq!(FrameCodec::new(1024).decode(&mut src).unwrap(), None);
        assert_eq!(src.len(), 9);
    }
}
