//! Serial API framing.
//!
//! The device speaks `0x94 0xC3 <len_hi> <len_lo> <protobuf>` on the wire.
//! Older firmware and some bridges use SLIP instead; [`FrameDecoder`] accepts
//! either and stops feeding the SLIP path once a length-prefixed frame has been
//! seen, so the two decoders never both report the same bytes.
use bytes::{Buf, BytesMut};

use super::slip::SlipDecoder;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;
/// Largest payload the firmware will emit.
pub const MAX_FRAME_SIZE: usize = 512;

/// Incremental decoder for length-prefixed frames.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete payload, if any. Garbage before a header (boot log text,
    /// debug output) is skipped; a header with an impossible length is treated
    /// as noise and the search resumes one byte later.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == START1) {
                Some(pos) => self.buf.advance(pos),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_FRAME_SIZE {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }

    /// Bytes held while waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Prefix a protobuf payload with the serial API header.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

/// Both framings behind one `push`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    stream: StreamFramer,
    slip: SlipDecoder,
    length_framing_seen: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.stream.push(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.stream.next_frame() {
            self.length_framing_seen = true;
            frames.push(frame);
        }
        if !self.length_framing_seen {
            frames.extend(self.slip.push(data));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::slip::slip_encode;

    #[test]
    fn frame_split_across_reads() {
        let framed = encode_frame(&[1, 2, 3, 4, 5]).unwrap();
        let mut f = StreamFramer::new();
        f.push(&framed[..3]);
        assert!(f.next_frame().is_none());
        f.push(&framed[3..]);
        assert_eq!(f.next_frame(), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn skips_log_text_and_bad_headers() {
        let mut input = b"INFO | boot ok\r\n".to_vec();
        input.extend_from_slice(&[START1, 0x00]);
        input.extend_from_slice(&[START1, START2, 0xFF, 0xFF]);
        input.extend(encode_frame(b"hello").unwrap());
        let mut f = StreamFramer::new();
        f.push(&input);
        assert_eq!(f.next_frame(), Some(b"hello".to_vec()));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut input = encode_frame(&[9]).unwrap();
        input.extend(encode_frame(&[8, 7]).unwrap());
        let mut d = FrameDecoder::new();
        assert_eq!(d.push(&input), vec![vec![9], vec![8, 7]]);
    }

    #[test]
    fn slip_only_until_length_framing_appears() {
        let mut d = FrameDecoder::new();
        assert_eq!(d.push(&slip_encode(&[1, 2])), vec![vec![1, 2]]);
        assert_eq!(d.push(&encode_frame(&[3]).unwrap()), vec![vec![3]]);
        assert!(d.push(&slip_encode(&[4, 5])).is_empty());
    }
}
