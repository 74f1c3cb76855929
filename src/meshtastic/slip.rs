//! SLIP framing (RFC 1055) as used by some Meshtastic serial bridges.

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Frames longer than this are discarded.
const MAX_SLIP_FRAME: usize = 1024;

#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    esc: bool,
    overflow: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every frame completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in data {
            if b == END {
                if !self.buf.is_empty() && !self.overflow {
                    frames.push(std::mem::take(&mut self.buf));
                }
                self.buf.clear();
                self.esc = false;
                self.overflow = false;
                continue;
            }
            let byte = if self.esc {
                self.esc = false;
                match b {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    // Protocol violation: keep the byte as-is.
                    other => other,
                }
            } else if b == ESC {
                self.esc = true;
                continue;
            } else {
                b
            };
            if self.buf.len() >= MAX_SLIP_FRAME {
                self.overflow = true;
                continue;
            }
            self.buf.push(byte);
        }
        frames
    }
}

pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}
