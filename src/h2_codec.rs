//! HTTP/2 WINDOW_UPDATE frame codec.
//!
//! A sans-I/O encoder and a resumable parser for WINDOW_UPDATE frames
//! (RFC 7540 Section 6.9). The parser is a byte-driven state machine: bytes
//! may be fed in slices of any size, including one byte at a time, and the
//! listener sees exactly the frames it would see if the whole buffer had
//! been fed at once. Frames of other types are framed and skipped.
//!
//! Reference: RFC 7540 (HTTP/2)

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// HTTP/2 frame types (RFC 7540 Section 6)
#[allow(dead_code)]
pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// HTTP/2 error codes (RFC 7540 Section 7)
#[allow(dead_code)]
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const SETTINGS_TIMEOUT: u32 = 0x4;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const CONNECT_ERROR: u32 = 0xa;
    pub const ENHANCE_YOUR_CALM: u32 = 0xb;
    pub const INADEQUATE_SECURITY: u32 = 0xc;
    pub const HTTP_1_1_REQUIRED: u32 = 0xd;
}

/// Length of the frame header preceding every payload.
pub const FRAME_HEADER_LENGTH: usize = 9;

/// Payload length of a WINDOW_UPDATE frame.
pub const WINDOW_UPDATE_LENGTH: usize = 4;

/// Initial SETTINGS_MAX_FRAME_SIZE (RFC 7540 Section 6.5.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest flow-control window increment (2^31 - 1).
pub const MAX_WINDOW_DELTA: u32 = 0x7FFF_FFFF;

const RESERVED_BIT_MASK: u32 = 0x7FFF_FFFF;

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2FrameHeader {
    pub length: u32,      // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,   // 31 bits (high bit reserved)
}

impl H2FrameHeader {
    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        let [l0, l1, l2, frame_type, flags, s0, s1, s2, s3, ..] = *data else {
            return None;
        };
        let length = u32::from_be_bytes([0, l0, l1, l2]);
        let stream_id = u32::from_be_bytes([s0, s1, s2, s3]) & RESERVED_BIT_MASK;
        Some(Self {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    /// Append the 9 header bytes to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        let [_, l0, l1, l2] = self.length.to_be_bytes();
        buf.put_slice(&[l0, l1, l2, self.frame_type, self.flags]);
        buf.put_u32(self.stream_id & RESERVED_BIT_MASK);
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_LENGTH + self.length as usize
    }
}

/// A WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub window_delta: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, window_delta: u32) -> Self {
        Self {
            stream_id,
            window_delta,
        }
    }

    /// Updates the window of a single stream.
    pub fn is_stream_window_update(&self) -> bool {
        self.stream_id != 0
    }

    /// Updates the connection-level window.
    pub fn is_session_window_update(&self) -> bool {
        self.stream_id == 0
    }
}

/// Append a WINDOW_UPDATE frame to `buf` and return the number of bytes written.
///
/// `stream_id` 0 updates the connection-level window.
pub fn write_window_update(buf: &mut BytesMut, stream_id: u32, window_delta: u32) -> Result<usize> {
    if stream_id > RESERVED_BIT_MASK {
        return Err(Error::InvalidStreamId(stream_id));
    }
    if window_delta > MAX_WINDOW_DELTA {
        return Err(Error::InvalidWindowDelta(window_delta));
    }
    buf.reserve(FRAME_HEADER_LENGTH + WINDOW_UPDATE_LENGTH);
    H2FrameHeader {
        length: WINDOW_UPDATE_LENGTH as u32,
        frame_type: frame_type::WINDOW_UPDATE,
        flags: 0,
        stream_id,
    }
    .encode(buf);
    buf.put_u32(window_delta);
    trace!(stream_id, window_delta, "WINDOW_UPDATE generated");
    Ok(FRAME_HEADER_LENGTH + WINDOW_UPDATE_LENGTH)
}

/// Create a WINDOW_UPDATE frame to replenish flow control window
pub fn create_window_update(stream_id: u32, window_delta: u32) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LENGTH + WINDOW_UPDATE_LENGTH);
    write_window_update(&mut buf, stream_id, window_delta)?;
    Ok(buf.freeze())
}

/// Receives what [`H2FrameParser`] finds in the byte stream.
pub trait FrameListener {
    fn on_window_update(&mut self, frame: WindowUpdateFrame);

    /// A frame of a type this parser does not decode was skipped.
    fn on_skipped(&mut self, _header: &H2FrameHeader) {}

    /// A stream error; parsing continues with the next frame.
    fn on_stream_failure(&mut self, _stream_id: u32, _error_code: u32, _reason: &str) {}

    /// A connection error; the parser ignores further input until reset.
    fn on_connection_failure(&mut self, _error_code: u32, _reason: &str) {}
}

impl FrameListener for Vec<WindowUpdateFrame> {
    fn on_window_update(&mut self, frame: WindowUpdateFrame) {
        self.push(frame);
    }
}

/// Configuration for [`H2FrameParser`].
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Largest accepted frame payload (SETTINGS_MAX_FRAME_SIZE).
    pub max_frame_size: u32,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ParserConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    WindowUpdate(H2FrameHeader),
    Skip { header: H2FrameHeader, remaining: usize },
    Failed,
}

/// Resumable HTTP/2 frame parser.
///
/// Partial headers and bodies are kept in fixed accumulators, so no frame is
/// ever buffered as a whole. The state returns to `Header` after each frame.
#[derive(Debug)]
pub struct H2FrameParser<L> {
    listener: L,
    config: ParserConfig,
    state: ParseState,
    header: [u8; FRAME_HEADER_LENGTH],
    body: [u8; WINDOW_UPDATE_LENGTH],
    filled: usize,
}

impl<L: FrameListener> H2FrameParser<L> {
    pub fn new(listener: L) -> Self {
        Self::with_config(listener, ParserConfig::default())
    }

    pub fn with_config(listener: L, config: ParserConfig) -> Self {
        Self {
            listener,
            config,
            state: ParseState::Header,
            header: [0; FRAME_HEADER_LENGTH],
            body: [0; WINDOW_UPDATE_LENGTH],
            filled: 0,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    /// True after a connection error, until [`reset`](Self::reset).
    pub fn is_failed(&self) -> bool {
        self.state == ParseState::Failed
    }

    /// Drop any partial frame and clear a connection error.
    pub fn reset(&mut self) {
        self.state = ParseState::Header;
        self.filled = 0;
    }

    /// Feed bytes to the parser and return how many were consumed.
    ///
    /// Everything is consumed unless a connection error stops the parser.
    pub fn parse(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < data.len() {
            let input = &data[consumed..];
            let state = self.state;
            consumed += match state {
                ParseState::Failed => break,
                ParseState::Header => {
                    let n = fill(&mut self.header, &mut self.filled, input);
                    if self.filled == FRAME_HEADER_LENGTH {
                        self.filled = 0;
                        if let Some(header) = H2FrameHeader::parse(&self.header) {
                            self.on_header(header);
                        }
                    }
                    n
                }
                ParseState::WindowUpdate(header) => {
                    let n = fill(&mut self.body, &mut self.filled, input);
                    if self.filled == WINDOW_UPDATE_LENGTH {
                        self.filled = 0;
                        self.state = ParseState::Header;
                        self.on_window_update_body(header);
                    }
                    n
                }
                ParseState::Skip { header, remaining } => {
                    let n = remaining.min(input.len());
                    if n == remaining {
                        self.state = ParseState::Header;
                        self.on_skipped(header);
                    } else {
                        self.state = ParseState::Skip {
                            header,
                            remaining: remaining - n,
                        };
                    }
                    n
                }
            };
        }
        consumed
    }

    fn on_header(&mut self, header: H2FrameHeader) {
        if header.length > self.config.max_frame_size {
            self.connection_failure(error_code::FRAME_SIZE_ERROR, "invalid_frame_length");
            return;
        }
        match header.frame_type {
            frame_type::WINDOW_UPDATE if header.length as usize != WINDOW_UPDATE_LENGTH => {
                self.connection_failure(error_code::FRAME_SIZE_ERROR, "invalid_window_update_frame");
            }
            frame_type::WINDOW_UPDATE => self.state = ParseState::WindowUpdate(header),
            _ if header.length == 0 => self.on_skipped(header),
            _ => {
                self.state = ParseState::Skip {
                    header,
                    remaining: header.length as usize,
                }
            }
        }
    }

    fn on_window_update_body(&mut self, header: H2FrameHeader) {
        let window_delta = u32::from_be_bytes(self.body) & RESERVED_BIT_MASK;
        if window_delta == 0 {
            if header.stream_id == 0 {
                self.connection_failure(error_code::PROTOCOL_ERROR, "invalid_window_update_frame");
            } else {
                debug!(stream_id = header.stream_id, "zero WINDOW_UPDATE on stream");
                self.listener.on_stream_failure(
                    header.stream_id,
                    error_code::PROTOCOL_ERROR,
                    "invalid_window_update_frame",
                );
            }
            return;
        }
        trace!(stream_id = header.stream_id, window_delta, "WINDOW_UPDATE parsed");
        self.listener
            .on_window_update(WindowUpdateFrame::new(header.stream_id, window_delta));
    }

    fn on_skipped(&mut self, header: H2FrameHeader) {
        trace!(frame_type = header.frame_type, length = header.length, "frame skipped");
        self.listener.on_skipped(&header);
    }

    fn connection_failure(&mut self, error: u32, reason: &str) {
        warn!(error_code = error, reason, "HTTP/2 connection failure");
        self.state = ParseState::Failed;
        self.listener.on_connection_failure(error, reason);
    }
}

/// Copy from `input` into `buf[*filled..]`; returns the number of bytes copied.
fn fill(buf: &mut [u8], filled: &mut usize, input: &[u8]) -> usize {
    let n = (buf.len() - *filled).min(input.len());
    buf[*filled..*filled + n].copy_from_slice(&input[..n]);
    *filled += n;
    n
}
