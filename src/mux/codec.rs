//! Multiplexer frame codec.
//!
//! Frames are laid out as:
//! - varint: `stream_id << 3 | frame type`
//! - varint: payload length
//! - N bytes: payload
//!
//! Frame types 1..=6 come in receiver/initiator pairs so that both ends can
//! allocate stream ids independently without colliding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{BridgeError, Result};

/// Largest encoded varint we accept (u64 needs at most 10 bytes).
const MAX_VARINT_LEN: usize = 10;

/// What a frame does to its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Open,
    Data,
    Close,
    Reset,
}

/// A single multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u64,
    pub kind: FrameKind,
    /// Set when the sender of this frame is the side that opened the stream.
    pub from_initiator: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: u64) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open,
            from_initiator: true,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u64, from_initiator: bool, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            from_initiator,
            payload,
        }
    }

    pub fn close(stream_id: u64, from_initiator: bool) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
            from_initiator,
            payload: Bytes::new(),
        }
    }

    pub fn reset(stream_id: u64, from_initiator: bool) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Reset,
            from_initiator,
            payload: Bytes::new(),
        }
    }

    fn type_code(&self) -> u64 {
        match (self.kind, self.from_initiator) {
            (FrameKind::Open, _) => 0,
            (FrameKind::Data, false) => 1,
            (FrameKind::Data, true) => 2,
            (FrameKind::Close, false) => 3,
            (FrameKind::Close, true) => 4,
            (FrameKind::Reset, false) => 5,
            (FrameKind::Reset, true) => 6,
        }
    }

    fn from_header(header: u64, payload: Bytes) -> Result<Self> {
        let stream_id = header >> 3;
        let (kind, from_initiator) = match header & 0b111 {
            0 => (FrameKind::Open, true),
            1 => (FrameKind::Data, false),
            2 => (FrameKind::Data, true),
            3 => (FrameKind::Close, false),
            4 => (FrameKind::Close, true),
            5 => (FrameKind::Reset, false),
            6 => (FrameKind::Reset, true),
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unknown frame type {} on stream {}",
                    other, stream_id
                )))
            }
        };

        Ok(Self {
            stream_id,
            kind,
            from_initiator,
            payload,
        })
    }
}

/// Codec for multiplexer frames.
#[derive(Debug)]
pub struct MuxCodec {
    max_frame_size: usize,
}

impl MuxCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

/// Reads a varint starting at `offset`. Returns the value and the number of
/// bytes it occupied, or `None` if `src` ends before the varint does.
fn peek_varint(src: &[u8], offset: usize) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = src.get(offset + i) else {
            return Ok(None);
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(BridgeError::Protocol("varint too long".to_string()))
}

fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((header, header_len)) = peek_varint(src, 0)? else {
            return Ok(None);
        };
        let Some((length, length_len)) = peek_varint(src, header_len)? else {
            return Ok(None);
        };

        let length = usize::try_from(length)
            .map_err(|_| BridgeError::Protocol("frame length overflow".to_string()))?;
        if length > self.max_frame_size {
            return Err(BridgeError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        let prefix = header_len + length_len;
        if src.len() < prefix + length {
            src.reserve(prefix + length - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        let payload = src.split_to(length).freeze();
        Frame::from_header(header, payload).map(Some)
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = BridgeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_size {
            return Err(BridgeError::Protocol(format!(
                "refusing to send {} byte frame (limit {})",
                frame.payload.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(2 * MAX_VARINT_LEN + frame.payload.len());
        put_varint(dst, frame.stream_id << 3 | frame.type_code());
        put_varint(dst, frame.payload.len() as u64);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
