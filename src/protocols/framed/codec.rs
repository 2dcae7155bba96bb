//! Length-prefixed framing.
//!
//! Wire format: `<u32 big-endian length><payload>`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;

pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may declare.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length exceeds `MAX_FRAME_LEN`.
    TooLarge { declared: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge { declared } => write!(
                f,
                "frame length {} exceeds maximum of {}",
                declared, MAX_FRAME_LEN
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Streaming decoder. Input may arrive in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered and not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// An oversized declared length is reported without consuming anything;
    /// the connection is not recoverable after that.
    pub fn try_extract(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let declared = u32::from_be_bytes(header) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge { declared });
        }
        if self.buf.len() < HEADER_LEN + declared {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }
}

/// Prefix `payload` with its length.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            declared: payload.len(),
        });
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Encoded frames waiting to be sent, oldest first.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    queue: VecDeque<Bytes>,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.queue.push_back(encode(payload)?);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.try_extract().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        for size in [0, 1, 4095, MAX_FRAME_LEN] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut decoder = FrameDecoder::new();
            decoder.extend(&encode(&payload).unwrap());

            let frame = decoder.try_extract().unwrap().unwrap();
            assert_eq!(frame.len(), size);
            assert_eq!(&frame[..], &payload[..]);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(&frame[..], b"\x00\x00\x00\x03abc");
    }

    #[test]
    fn test_chunking_does_not_matter() {
        let mut stream = Vec::new();
        let big = [7u8; 300];
        let payloads: [&[u8]; 4] = [b"first", b"", b"third frame", &big];
        for payload in payloads {
            stream.extend_from_slice(&encode(payload).unwrap());
        }

        let mut whole = FrameDecoder::new();
        whole.extend(&stream);
        let expected = decode_all(&mut whole);
        assert_eq!(expected.len(), 4);

        let mut bytewise = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in &stream {
            bytewise.extend(std::slice::from_ref(byte));
            got.extend(decode_all(&mut bytewise));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"\x00\x00\x00\x05he");
        assert_eq!(decoder.try_extract().unwrap(), None);
        decoder.extend(b"llo\x00\x00");
        assert_eq!(decoder.try_extract().unwrap().unwrap(), Bytes::from_static(b"hello"));
        // Remainder kept for the next frame
        assert_eq!(decoder.buffered(), 2);
        assert_eq!(decoder.try_extract().unwrap(), None);
    }

    #[test]
    fn test_oversized_declared_length_never_emitted() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        decoder.extend(&vec![0u8; 64]);

        for _ in 0..3 {
            assert_eq!(
                decoder.try_extract(),
                Err(FrameError::TooLarge {
                    declared: MAX_FRAME_LEN + 1
                })
            );
        }
        // Nothing consumed
        assert_eq!(decoder.buffered(), HEADER_LEN + 64);
    }

    #[test]
    fn test_encoder_is_fifo() {
        let mut encoder = FrameEncoder::new();
        encoder.push(b"a").unwrap();
        encoder.push(b"bc").unwrap();
        assert_eq!(encoder.len(), 2);
        assert_eq!(&encoder.pop().unwrap()[..], b"\x00\x00\x00\x01a");
        assert_eq!(&encoder.pop().unwrap()[..], b"\x00\x00\x00\x02bc");
        assert!(encoder.is_empty());

        assert!(encoder.push(&vec![0u8; MAX_FRAME_LEN + 1]).is_err());
        assert!(encoder.is_empty());
    }
}
