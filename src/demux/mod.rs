//! Decoder for the multiplexed container log wire format.
//!
//! A follow log stream interleaves stdout and stderr as length-prefixed
//! frames: an 8-byte header `[kind, 0, 0, 0, len_be_u32]` followed by
//! exactly `len` payload bytes. Frames arrive split arbitrarily across
//! reads, so the decoder buffers until a whole frame is available.
//!
//! TTY-attached containers serve unframed bytes instead; the decoder then
//! runs in raw pass-through mode and treats everything as stdout.

use bytes::{Buf, Bytes, BytesMut};

/// Size of the fixed frame header.
const HEADER_LEN: usize = 8;

/// Default upper bound on a single frame payload. A header declaring more
/// than this is treated as stream corruption rather than allocated.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame header: unknown stream descriptor {0}")]
    MalformedFrame(u8),
    #[error("frame payload length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Which standard stream a frame or line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Multiplexed,
    Raw,
}

/// Incremental frame decoder.
///
/// Feed raw read chunks with [`FrameDecoder::extend`] and drain complete
/// frames with [`FrameDecoder::next_frame`]. The emitted frame sequence is
/// invariant under how the input was chunked.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    mode: Mode,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Decoder for the framed (non-TTY) wire format.
    pub fn multiplexed() -> Self {
        Self::new(Mode::Multiplexed, DEFAULT_MAX_FRAME_LEN)
    }

    /// Pass-through decoder for TTY streams; all bytes become stdout frames.
    pub fn raw() -> Self {
        Self::new(Mode::Raw, DEFAULT_MAX_FRAME_LEN)
    }

    fn new(mode: Mode, max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            mode,
            max_frame_len,
        }
    }

    #[cfg(test)]
    fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Appends a raw read chunk to the internal buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete frame, or `None` if more input is needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] for an unknown stream descriptor and
    /// [`Error::FrameTooLarge`] for a declared payload length above the
    /// configured maximum. Both indicate an unusable stream; the decoder must
    /// be discarded afterwards.
    pub fn next_frame(&mut self) -> Result<Option<LogFrame>, Error> {
        match self.mode {
            Mode::Raw => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let payload = self.buf.split().freeze();
                Ok(Some(LogFrame {
                    kind: StreamKind::Stdout,
                    payload,
                }))
            }
            Mode::Multiplexed => {
                if self.buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let kind = match self.buf[0] {
                    // Descriptor 0 is stdin echoed back on the combined
                    // stream; attribute it to stdout.
                    0 | 1 => StreamKind::Stdout,
                    2 => StreamKind::Stderr,
                    other => return Err(Error::MalformedFrame(other)),
                };
                let len = u32::from_be_bytes([
                    self.buf[4],
                    self.buf[5],
                    self.buf[6],
                    self.buf[7],
                ]) as usize;
                if len > self.max_frame_len {
                    return Err(Error::FrameTooLarge {
                        len,
                        max: self.max_frame_len,
                    });
                }
                if self.buf.len() < HEADER_LEN + len {
                    return Ok(None);
                }
                self.buf.advance(HEADER_LEN);
                let payload = self.buf.split_to(len).freeze();
                Ok(Some(LogFrame { kind, payload }))
            }
        }
    }
}

/// Splits frame payloads into discrete lines.
///
/// Payloads are split on line feeds; a payload not ending in one leaves its
/// tail in a per-stream-kind carry-over buffer that is prefixed onto the
/// next payload of the same kind, so a line spanning several frames is
/// emitted exactly once and never split. Carry-over is capped at the frame
/// size limit; an overlong line is flushed early instead of growing without
/// bound.
#[derive(Debug)]
pub struct LineAssembler {
    carry_stdout: Vec<u8>,
    carry_stderr: Vec<u8>,
    max_line_len: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            carry_stdout: Vec::new(),
            carry_stderr: Vec::new(),
            max_line_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    fn carry_mut(&mut self, kind: StreamKind) -> &mut Vec<u8> {
        match kind {
            StreamKind::Stdout => &mut self.carry_stdout,
            StreamKind::Stderr => &mut self.carry_stderr,
        }
    }

    /// Consumes a frame and appends the complete lines it finishes to `out`.
    pub fn push(&mut self, frame: &LogFrame, out: &mut Vec<(StreamKind, String)>) {
        let kind = frame.kind;
        let max = self.max_line_len;
        let carry = self.carry_mut(kind);
        let mut rest: &[u8] = &frame.payload;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];
            let text = if carry.is_empty() {
                decode_line(line)
            } else {
                carry.extend_from_slice(line);
                let text = decode_line(carry);
                carry.clear();
                text
            };
            out.push((kind, text));
        }

        if !rest.is_empty() {
            carry.extend_from_slice(rest);
            if carry.len() > max {
                let text = decode_line(carry);
                carry.clear();
                out.push((kind, text));
            }
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes one raw line, dropping a trailing carriage return.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
