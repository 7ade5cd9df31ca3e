//! Turns events into 0-10 frames

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    segment::{
        Frame, SegmentType, FIRST_FRAME, FIRST_SEG, HEADER_SIZE, LAST_FRAME, LAST_SEG,
        TRACK_COMMAND, TRACK_CONTROL,
    },
    ArgumentLayout, Error, ProtocolEvent,
};

/// Prefix of a command segment asking for completion
pub const COMMAND_SYNC: u16 = 0x0101;
/// Prefix of a command segment that does not ask for completion
pub const COMMAND_NO_SYNC: u16 = 0x0100;

/// Exclusive upper bound on the max frame size
const MAX_FRAME_LIMIT: u32 = 64 * 1024;

/// Splits events into method, header and body segments and each segment
/// into frames of at most the negotiated size.
///
/// The disassembler only produces frames. Writing and flushing them is left
/// to the transport, which flushes only when asked so that non-sync writes
/// can be batched.
#[derive(Debug, Clone)]
pub struct Disassembler {
    max_payload: usize,
}

impl Disassembler {
    /// Creates a disassembler for the given max frame size, which must lie
    /// strictly between the header size and 64KiB
    pub fn new(max_frame: u32) -> Result<Self, Error> {
        Ok(Self {
            max_payload: max_payload(max_frame)?,
        })
    }

    /// Largest payload carried by one frame
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Applies a renegotiated max frame size. Events already disassembled
    /// are unaffected.
    pub fn set_max_frame_size(&mut self, max_frame: u32) -> Result<(), Error> {
        self.max_payload = max_payload(max_frame)?;
        Ok(())
    }

    /// Appends the frames that carry `event` to `out`
    pub fn disassemble(&self, event: &ProtocolEvent, out: &mut Vec<Frame>) -> Result<(), Error> {
        let segment_type = event.method.kind().segment_type();

        let mut method = BytesMut::new();
        if segment_type == SegmentType::Command {
            method.put_u16(if event.sync {
                COMMAND_SYNC
            } else {
                COMMAND_NO_SYNC
            });
        }
        event.method.encode(&mut method, ArgumentLayout::Segmented)?;

        let has_payload = event.header.is_some();
        let method_flags = if has_payload {
            FIRST_SEG
        } else {
            FIRST_SEG | LAST_SEG
        };
        let track = match segment_type {
            SegmentType::Control => TRACK_CONTROL,
            _ => TRACK_COMMAND,
        };
        self.fragment(method_flags, segment_type, track, event.channel, method.freeze(), out);

        if let Some(header) = &event.header {
            let mut buf = BytesMut::new();
            header.encode(&mut buf)?;
            let header_flags = if event.body.is_none() { LAST_SEG } else { 0 };
            self.fragment(
                header_flags,
                SegmentType::Header,
                track,
                event.channel,
                buf.freeze(),
                out,
            );

            if let Some(body) = &event.body {
                self.fragment(
                    LAST_SEG,
                    SegmentType::Body,
                    track,
                    event.channel,
                    body.clone(),
                    out,
                );
            }
        }
        Ok(())
    }

    /// Emits at least one frame, even for an empty segment
    fn fragment(
        &self,
        flags: u8,
        segment_type: SegmentType,
        track: u8,
        channel: u16,
        mut segment: Bytes,
        out: &mut Vec<Frame>,
    ) {
        let mut first = true;
        loop {
            let size = segment.len().min(self.max_payload);
            let payload = segment.split_to(size);

            let mut frame_flags = flags;
            if first {
                frame_flags |= FIRST_FRAME;
                first = false;
            }
            if segment.is_empty() {
                frame_flags |= LAST_FRAME;
            }

            out.push(Frame {
                flags: frame_flags,
                segment_type,
                track,
                channel,
                payload,
            });

            if segment.is_empty() {
                break;
            }
        }
    }
}

fn max_payload(max_frame: u32) -> Result<usize, Error> {
    if max_frame as usize <= HEADER_SIZE || max_frame >= MAX_FRAME_LIMIT {
        return Err(Error::InvalidMaxFrameSize(max_frame));
    }
    Ok(max_frame as usize - HEADER_SIZE)
}
