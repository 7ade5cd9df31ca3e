//! Reassembles 0-10 frames into events

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use super::{
    disassembler::COMMAND_SYNC,
    segment::{Frame, SegmentType},
    ArgumentLayout, ContentHeader, Error, Method, ProtocolEvent,
};

/// An event whose header or body segment has not arrived yet
#[derive(Debug)]
struct PendingEvent {
    method: Method,
    sync: bool,
    header: Option<ContentHeader>,
}

/// Collects frames into segments and segments into events
///
/// Fragments are buffered per channel and segment type, so frames of other
/// channels may be interleaved with a segment that is still arriving.
#[derive(Debug, Default)]
pub struct Assembler {
    fragments: HashMap<(u16, SegmentType), BytesMut>,
    pending: HashMap<u16, PendingEvent>,
}

impl Assembler {
    /// Creates an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame. Returns an event once its last segment is complete.
    pub fn receive(&mut self, frame: Frame) -> Result<Option<ProtocolEvent>, Error> {
        let key = (frame.channel, frame.segment_type);

        if frame.is_first_frame() {
            if self.fragments.contains_key(&key) {
                return Err(Error::framing(format!(
                    "{:?} segment on channel {} restarted before it was complete",
                    frame.segment_type, frame.channel
                )));
            }
            if frame.is_last_frame() {
                return self.on_segment(&frame, frame.payload.clone());
            }
            self.fragments
                .insert(key, BytesMut::from(&frame.payload[..]));
            return Ok(None);
        }

        let buf = self.fragments.get_mut(&key).ok_or_else(|| {
            Error::framing(format!(
                "continuation of {:?} segment on channel {} without a first frame",
                frame.segment_type, frame.channel
            ))
        })?;
        buf.extend_from_slice(&frame.payload);

        if frame.is_last_frame() {
            let segment = self
                .fragments
                .remove(&key)
                .map(BytesMut::freeze)
                .unwrap_or_default();
            return self.on_segment(&frame, segment);
        }
        Ok(None)
    }

    fn on_segment(
        &mut self,
        frame: &Frame,
        mut segment: Bytes,
    ) -> Result<Option<ProtocolEvent>, Error> {
        let channel = frame.channel;
        match frame.segment_type {
            SegmentType::Control | SegmentType::Command => {
                if self.pending.contains_key(&channel) {
                    return Err(Error::framing(format!(
                        "method on channel {} while content is incomplete",
                        channel
                    )));
                }
                let sync = if frame.segment_type == SegmentType::Command {
                    if segment.remaining() < 2 {
                        return Err(Error::decode("command segment without sync header"));
                    }
                    segment.get_u16() == COMMAND_SYNC
                } else {
                    false
                };
                let method = Method::decode(&mut segment, ArgumentLayout::Segmented)?;
                let pending = PendingEvent {
                    method,
                    sync,
                    header: None,
                };
                if frame.is_last_segment() {
                    Ok(Some(into_event(channel, pending, None)))
                } else {
                    self.pending.insert(channel, pending);
                    Ok(None)
                }
            }
            SegmentType::Header => {
                let pending = self.pending.get_mut(&channel).ok_or_else(|| {
                    Error::framing(format!("header segment without method on channel {}", channel))
                })?;
                pending.header = Some(ContentHeader::decode(&mut segment)?);
                if frame.is_last_segment() {
                    Ok(self
                        .pending
                        .remove(&channel)
                        .map(|pending| into_event(channel, pending, None)))
                } else {
                    Ok(None)
                }
            }
            SegmentType::Body => {
                let pending = self.pending.remove(&channel).ok_or_else(|| {
                    Error::framing(format!("body segment without method on channel {}", channel))
                })?;
                if pending.header.is_none() {
                    return Err(Error::framing("body segment before header segment"));
                }
                Ok(Some(into_event(channel, pending, Some(segment))))
            }
        }
    }
}

fn into_event(channel: u16, pending: PendingEvent, body: Option<Bytes>) -> ProtocolEvent {
    ProtocolEvent {
        channel,
        method: pending.method,
        header: pending.header,
        body: body.filter(|b| !b.is_empty()),
        sync: pending.sync,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::framing::{BasicProperties, Disassembler};

    fn deliver(channel: u16, body: &'static [u8]) -> ProtocolEvent {
        let method = Method::BasicDeliver {
            consumer_tag: format!("ctag-{}", channel),
            delivery_tag: channel as u64,
            redelivered: false,
            exchange: "".into(),
            routing_key: "queue".into(),
        };
        ProtocolEvent::new(channel, method).with_content(
            ContentHeader::basic(body.len() as u64, BasicProperties::default()),
            Bytes::from_static(body),
        )
    }

    fn frames(event: &ProtocolEvent, max_frame: u32) -> Vec<Frame> {
        let mut out = Vec::new();
        Disassembler::new(max_frame)
            .unwrap()
            .disassemble(event, &mut out)
            .unwrap();
        out
    }

    #[test]
    fn reassembles_for_every_frame_size() {
        let event = deliver(1, b"the quick brown fox jumps over the lazy dog");
        for max_frame in [9u32, 10, 12, 16, 17, 64, 4096] {
            let mut assembler = Assembler::new();
            let mut out = Vec::new();
            for frame in frames(&event, max_frame) {
                if let Some(event) = assembler.receive(frame).unwrap() {
                    out.push(event);
                }
            }
            assert_eq!(out, vec![event.clone()], "max frame {}", max_frame);
        }
    }

    #[test]
    fn interleaved_channels_are_kept_apart() {
        let a = deliver(1, b"first message body");
        let b = deliver(2, b"second");
        let frames_a = frames(&a, 16);
        let frames_b = frames(&b, 16);

        // alternate frames of the two events
        let mut wire = Vec::new();
        let mut ia = frames_a.into_iter();
        let mut ib = frames_b.into_iter();
        loop {
            match (ia.next(), ib.next()) {
                (None, None) => break,
                (x, y) => wire.extend(x.into_iter().chain(y)),
            }
        }

        let mut assembler = Assembler::new();
        let mut out = Vec::new();
        for frame in wire {
            if let Some(event) = assembler.receive(frame).unwrap() {
                out.push(event);
            }
        }
        assert_eq!(out.len(), 2);
        assert!(out.contains(&a));
        assert!(out.contains(&b));
    }

    #[test]
    fn continuation_without_first_frame_is_rejected() {
        let event = deliver(1, b"0123456789");
        let mut frames = frames(&event, 12);
        frames.remove(0);
        let mut assembler = Assembler::new();
        assert!(matches!(
            assembler.receive(frames.remove(0)),
            Err(Error::FramingError(_))
        ));
    }

    #[test]
    fn sync_flag_survives() {
        let event = ProtocolEvent::new(3, Method::TxCommit).with_sync(true);
        let mut assembler = Assembler::new();
        let mut out = None;
        for frame in frames(&event, 4096) {
            out = assembler.receive(frame).unwrap();
        }
        assert_eq!(out, Some(event));
    }
}
