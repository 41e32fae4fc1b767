//! Game protocol decoder: WebSocket framing (RFC 6455) over a raw byte stream.
//!
//! Each direction of a connection is decoded independently and moves through
//! three phases:
//!
//! ```text
//! Handshake ──(CRLFCRLF or non-HTTP first byte)──▶ Frames
//!     │                                              │
//!     └──────(header too large)──▶ Passthrough ◀─(malformed frame)
//! ```
//!
//! Once a direction is in passthrough it never resynchronises: the buffered
//! bytes and every later chunk are emitted as undecoded frames so forwarding
//! and observability keep working.
//!
//! Frame headers are read with tungstenite's `FrameHeader`; the checks that
//! decide between decoding and passthrough stay here.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use tracing::debug;
use tungstenite::protocol::frame::FrameHeader;
use tungstenite::protocol::frame::coding::{Control, Data, OpCode};

use super::frame::{Decoded, Direction, Frame};

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest HTTP upgrade head we are willing to buffer.
const MAX_HANDSHAKE: usize = 16 * 1024;

/// WebSocket opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data; the game protocol rides on these.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    fn from_wire(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Data(Data::Continue) => Some(Opcode::Continuation),
            OpCode::Data(Data::Text) => Some(Opcode::Text),
            OpCode::Data(Data::Binary) => Some(Opcode::Binary),
            OpCode::Control(Control::Close) => Some(Opcode::Close),
            OpCode::Control(Control::Ping) => Some(Opcode::Ping),
            OpCode::Control(Control::Pong) => Some(Opcode::Pong),
            OpCode::Data(Data::Reserved(_)) | OpCode::Control(Control::Reserved(_)) => None,
        }
    }

    /// Control frames (close, ping, pong).
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    /// Final fragment of a message.
    pub fin: bool,
    /// RSV1 set (permessage-deflate).
    pub compressed: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the sender masked the payload (client frames).
    pub masked: bool,
    /// Payload with the mask removed.
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Frames,
    Passthrough,
}

/// Decoding state for one direction of one connection.
#[derive(Debug)]
struct StreamDecoder {
    phase: Phase,
    buf: BytesMut,
}

impl StreamDecoder {
    fn new() -> Self {
        Self {
            phase: Phase::Handshake,
            buf: BytesMut::new(),
        }
    }
}

/// Connection-scoped WebSocket decoder.
#[derive(Debug)]
pub struct WebSocketEngine {
    max_payload: usize,
    inbound: StreamDecoder,
    outbound: StreamDecoder,
}

impl WebSocketEngine {
    /// Create a decoder rejecting payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            inbound: StreamDecoder::new(),
            outbound: StreamDecoder::new(),
        }
    }

    /// Buffer `bytes` and return an iterator over the frames now complete.
    ///
    /// Frames are parsed as the iterator is advanced. Anything not consumed
    /// stays buffered and is yielded by a later call.
    pub fn on_bytes(&mut self, direction: Direction, bytes: &[u8]) -> Decode<'_> {
        let stream = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        stream.buf.extend_from_slice(bytes);
        Decode {
            stream,
            direction,
            max_payload: self.max_payload,
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound.buf.len(),
            Direction::Outbound => self.outbound.buf.len(),
        }
    }
}

impl Default for WebSocketEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Lazy iterator over frames decoded from one direction's buffer.
#[derive(Debug)]
pub struct Decode<'a> {
    stream: &'a mut StreamDecoder,
    direction: Direction,
    max_payload: usize,
}

impl Iterator for Decode<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            let buf = &mut self.stream.buf;
            match self.stream.phase {
                Phase::Handshake => {
                    let first = *buf.first()?;
                    if !first.is_ascii_uppercase() {
                        self.stream.phase = Phase::Frames;
                        continue;
                    }
                    if let Some(end) = find_head_end(buf) {
                        let head = buf.split_to(end).freeze();
                        self.stream.phase = Phase::Frames;
                        let start_line = head
                            .split(|b| *b == b'\r')
                            .next()
                            .map(|line| String::from_utf8_lossy(line).into_owned())
                            .unwrap_or_default();
                        return Some(Frame::decoded(
                            self.direction,
                            head,
                            Decoded::Handshake { start_line },
                        ));
                    }
                    if buf.len() > MAX_HANDSHAKE {
                        debug!("{} handshake exceeds {} bytes, passing through", self.direction, MAX_HANDSHAKE);
                        self.stream.phase = Phase::Passthrough;
                        continue;
                    }
                    return None;
                }
                Phase::Frames => match parse_header(buf, self.max_payload) {
                    Header::Incomplete => return None,
                    Header::Malformed(reason) => {
                        debug!("Malformed {} WebSocket frame ({}), passing through", self.direction, reason);
                        self.stream.phase = Phase::Passthrough;
                    }
                    Header::Complete(head) => {
                        let total = head.len + head.payload_len;
                        if buf.len() < total {
                            return None;
                        }
                        let raw = buf.split_to(total).freeze();
                        let payload = unmask(raw.slice(head.len..), head.mask);
                        let frame = WsFrame {
                            fin: head.fin,
                            compressed: head.compressed,
                            opcode: head.opcode,
                            masked: head.mask.is_some(),
                            payload,
                        };
                        return Some(Frame::decoded(self.direction, raw, Decoded::WebSocket(frame)));
                    }
                },
                Phase::Passthrough => {
                    if buf.is_empty() {
                        return None;
                    }
                    return Some(Frame::raw(self.direction, buf.split().freeze()));
                }
            }
        }
    }
}

/// Offset just past the `\r\n\r\n` ending an HTTP head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

#[derive(Debug)]
struct FrameHead {
    fin: bool,
    compressed: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    len: usize,
    payload_len: usize,
}

#[derive(Debug)]
enum Header {
    Incomplete,
    Malformed(&'static str),
    Complete(FrameHead),
}

fn parse_header(buf: &[u8], max_payload: usize) -> Header {
    let mut cursor = Cursor::new(buf);
    let (head, payload_len) = match FrameHeader::parse(&mut cursor) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Header::Incomplete,
        // tungstenite rejects reserved opcodes while parsing
        Err(_) => return Header::Malformed("reserved opcode"),
    };

    let Some(opcode) = Opcode::from_wire(head.opcode) else {
        return Header::Malformed("reserved opcode");
    };
    if head.rsv2 || head.rsv3 {
        return Header::Malformed("reserved bits set");
    }
    if payload_len >> 63 != 0 {
        return Header::Malformed("length high bit set");
    }
    if opcode.is_control() && (!head.is_final || payload_len > 125) {
        return Header::Malformed("invalid control frame");
    }
    if payload_len > max_payload as u64 {
        return Header::Malformed("payload exceeds limit");
    }

    Header::Complete(FrameHead {
        fin: head.is_final,
        compressed: head.rsv1,
        opcode,
        mask: head.mask,
        len: cursor.position() as usize,
        payload_len: payload_len as usize,
    })
}

fn unmask(payload: Bytes, mask: Option<[u8; 4]>) -> Bytes {
    let Some(key) = mask else {
        return payload;
    };
    let mut data = payload.to_vec();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    Bytes::from(data)
}
