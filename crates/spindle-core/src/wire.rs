//! Length-prefixed framing.
//!
//! One frame per logical message: a `u32` big-endian length followed by
//! exactly that many payload bytes. Frames are pipelinable — a single read
//! may carry several complete frames plus the head of another, and a frame
//! may arrive spread over arbitrarily many reads. [`FrameCodec`] buffers
//! partial input across feeds and never yields a payload until every byte
//! of it has arrived.

use bytes::{Buf, Bytes, BytesMut};
use core::fmt;

/// Length-prefix size on the wire.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame's payload. A peer announcing more than
/// this is treated as corrupt rather than allocated for.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing and serialization errors.
#[derive(Debug)]
pub enum WireError {
    /// Announced frame length exceeds the configured maximum.
    Oversize { len: usize, max: usize },
    /// Payload could not be serialized.
    Encode(String),
    /// Payload could not be deserialized.
    Decode(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize { len, max } => {
                write!(f, "frame of {len} bytes exceeds maximum {max}")
            }
            Self::Encode(msg) => write!(f, "serialize error: {msg}"),
            Self::Decode(msg) => write!(f, "deserialize error: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Incremental frame reassembler.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Slice off the next complete frame, if one is fully buffered.
    ///
    /// Returns `Ok(None)` while the header or payload is still partial;
    /// leftover bytes stay buffered for the next call.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(WireError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes currently buffered (partial frames included).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Wrap a serialized payload in a length-prefixed frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut codec = FrameCodec::new();
        codec.push(&frame(b"hello"));
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(codec.next_frame().unwrap(), None);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn partial_frames_stay_buffered_across_feeds() {
        let wire = frame(b"split me");
        let mut codec = FrameCodec::new();
        // Deliver one byte at a time: nothing surfaces until the last one.
        for chunk in &wire[..wire.len() - 1] {
            codec.push(std::slice::from_ref(chunk));
            assert_eq!(codec.next_frame().unwrap(), None);
        }
        codec.push(&wire[wire.len() - 1..]);
        assert_eq!(
            codec.next_frame().unwrap().as_deref(),
            Some(&b"split me"[..])
        );
    }

    #[test]
    fn pipelined_frames_all_drain_and_leftover_survives() {
        let mut wire = frame(b"one");
        wire.extend_from_slice(&frame(b"two"));
        let tail = frame(b"three");
        wire.extend_from_slice(&tail[..3]); // header fragment of a third frame

        let mut codec = FrameCodec::new();
        codec.push(&wire);
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(codec.next_frame().unwrap(), None);

        codec.push(&tail[3..]);
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(&b"three"[..]));
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let mut codec = FrameCodec::new();
        codec.push(&frame(b""));
        assert_eq!(codec.next_frame().unwrap().as_deref(), Some(&b""[..]));
    }

    #[test]
    fn oversize_announcement_is_rejected() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        codec.push(&frame(&[0u8; 9]));
        assert!(matches!(
            codec.next_frame(),
            Err(WireError::Oversize { len: 9, max: 8 })
        ));
    }
}
