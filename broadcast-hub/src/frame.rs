use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Newline-delimited framing for raw byte streams.
///
/// Payload bytes are passed through untouched apart from the terminator
/// (`\n` or `\r\n`), which keeps the transport usable from netcat-style tools.
#[derive(Debug, Clone)]
pub struct LineFrameCodec {
    max_frame_bytes: usize,
    // Bytes already scanned for a newline in the current buffer.
    scanned: usize,
}

impl LineFrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
        }
    }

    fn take_frame(&mut self, src: &mut BytesMut, newline_at: usize) -> Bytes {
        self.scanned = 0;
        let mut frame = src.split_to(newline_at + 1);
        frame.truncate(newline_at);
        if frame.last() == Some(&b'\r') {
            frame.truncate(newline_at - 1);
        }
        frame.freeze()
    }
}

impl Default for LineFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for LineFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') {
            let newline_at = self.scanned + offset;
            let payload_len = if newline_at > 0 && src[newline_at - 1] == b'\r' {
                newline_at - 1
            } else {
                newline_at
            };
            if payload_len > self.max_frame_bytes {
                return Err(frame_too_long(self.max_frame_bytes));
            }
            return Ok(Some(self.take_frame(src, newline_at)));
        }

        // One extra byte may be the `\r` of a pending `\r\n`.
        if src.len() > self.max_frame_bytes.saturating_add(1) {
            return Err(frame_too_long(self.max_frame_bytes));
        }
        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() > self.max_frame_bytes {
            return Err(frame_too_long(self.max_frame_bytes));
        }
        // Unterminated trailing frame.
        Ok(Some(src.split().freeze()))
    }
}

impl Encoder<Bytes> for LineFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(payload.len() + 1);
        dst.put(payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn frame_too_long(limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame exceeds {limit} bytes"),
    )
}
