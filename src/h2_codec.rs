//! HTTP/2 frame codec.
//!
//! Pure data transforms over the 9-byte frame header and the fixed-format
//! payloads (SETTINGS, WINDOW_UPDATE, RST_STREAM, PING, GOAWAY, PRIORITY,
//! ALTSVC). Nothing in here performs I/O or keeps state; the connection's
//! read loop and write pipeline drive it.
//!
//! Reference: RFC 7540 (HTTP/2), RFC 7838 §4 (ALTSVC)

use crate::error::{Error, Result};

/// HTTP/2 frame types (RFC 7540 Section 6, RFC 7838 Section 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
    AltSvc = 0xa,
}

impl FrameType {
    /// Highest frame type this codec understands.
    pub const LAST: FrameType = FrameType::AltSvc;

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            0xa => Self::AltSvc,
            _ => return None,
        })
    }
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 SETTINGS identifiers (RFC 7540 Section 6.5.2)
pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// HTTP/2 error codes (RFC 7540 Section 7)
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

    pub fn name(code: u32) -> &'static str {
        match code {
            NO_ERROR => "NO_ERROR",
            PROTOCOL_ERROR => "PROTOCOL_ERROR",
            INTERNAL_ERROR => "INTERNAL_ERROR",
            FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            SETTINGS_TIMEOUT => "SETTINGS_TIMEOUT",
            STREAM_CLOSED => "STREAM_CLOSED",
            FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            REFUSED_STREAM => "REFUSED_STREAM",
            CANCEL => "CANCEL",
            COMPRESSION_ERROR => "COMPRESSION_ERROR",
            CONNECT_ERROR => "CONNECT_ERROR",
            ENHANCE_YOUR_CALM => "ENHANCE_YOUR_CALM",
            INADEQUATE_SECURITY => "INADEQUATE_SECURITY",
            HTTP_1_1_REQUIRED => "HTTP_1_1_REQUIRED",
            _ => "UNKNOWN_ERROR",
        }
    }
}

/// Size of every frame header.
pub const FRAME_HEADER_SIZE: usize = 9;
/// Largest payload accepted from the peer and emitted by us (the RFC minimum
/// for SETTINGS_MAX_FRAME_SIZE, which we never raise).
pub const MAX_FRAME_PAYLOAD: usize = 16384;
/// Upper bound the peer may announce for SETTINGS_MAX_FRAME_SIZE.
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

pub const SETTING_ENTRY_SIZE: usize = 6;
pub const PRIORITY_SIZE: usize = 5;
pub const PING_SIZE: usize = 8;
pub const WINDOW_UPDATE_SIZE: usize = 4;
pub const RST_STREAM_SIZE: usize = 4;
pub const GOAWAY_MIN_SIZE: usize = 8;

/// RFC default for both the connection and per-stream windows.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;
/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;
/// Clears the reserved high bit of stream ids and other 31-bit fields.
pub const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// The HTTP/2 connection preface (24 bytes)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// A parsed HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2FrameHeader {
    pub length: u32,      // 24 bits
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,   // 31 bits (high bit reserved)
}

impl H2FrameHeader {
    pub fn new(length: u32, frame_type: FrameType, flags: u8, stream_id: u32) -> Self {
        Self {
            length,
            frame_type: frame_type as u8,
            flags,
            stream_id,
        }
    }

    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & STREAM_ID_MASK;

        Some(Self {
            length,
            frame_type: data[3],
            flags: data[4],
            stream_id,
        })
    }

    /// Serialize this header into the first 9 bytes of `dest`.
    pub fn write_to(&self, dest: &mut [u8]) {
        debug_assert!(self.length as usize <= MAX_FRAME_PAYLOAD);
        debug_assert!(self.frame_type <= FrameType::LAST as u8);

        dest[0] = (self.length >> 16) as u8;
        dest[1] = (self.length >> 8) as u8;
        dest[2] = self.length as u8;
        dest[3] = self.frame_type;
        dest[4] = self.flags;
        dest[5..9].copy_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
    }

    /// The frame type, if it is one this codec knows about.
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    /// Total frame size including header
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.length as usize
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Check if END_STREAM flag is set
    pub fn is_end_stream(&self) -> bool {
        self.has_flag(flags::END_STREAM)
    }

    /// Check if END_HEADERS flag is set
    pub fn is_end_headers(&self) -> bool {
        self.has_flag(flags::END_HEADERS)
    }

    /// Check if the ACK flag is set (SETTINGS and PING)
    pub fn is_ack(&self) -> bool {
        self.has_flag(flags::ACK)
    }
}

/// Write a frame header into `dest`. Inverse of [`H2FrameHeader::parse`].
pub fn write_frame_header(dest: &mut [u8], length: usize, frame_type: FrameType, flags: u8, stream_id: u32) {
    H2FrameHeader::new(length as u32, frame_type, flags, stream_id).write_to(dest);
}

/// Strip padding (PADDED flag) and, for HEADERS, the priority block
/// (PRIORITY flag) from a DATA or HEADERS payload.
pub fn strip_padding_and_priority<'a>(header: &H2FrameHeader, payload: &'a [u8]) -> Result<&'a [u8]> {
    let mut body = payload;

    if header.has_flag(flags::PADDED) {
        let Some((&pad_length, rest)) = body.split_first() else {
            return Err(Error::protocol(format!(
                "PADDED frame of type {} with no payload", header.frame_type
            )));
        };
        let pad_length = pad_length as usize;
        if pad_length > rest.len() {
            return Err(Error::protocol(format!(
                "Invalid padding length {} in frame with {} byte payload", pad_length, payload.len()
            )));
        }
        body = &rest[..rest.len() - pad_length];
    }

    if header.frame_type == FrameType::Headers as u8 && header.has_flag(flags::PRIORITY) {
        if body.len() < PRIORITY_SIZE {
            return Err(Error::protocol("PRIORITY HEADERS frame with insufficient data"));
        }
        body = &body[PRIORITY_SIZE..]; // Skip stream dependency (4 bytes) + weight (1 byte)
    }

    Ok(body)
}

/// Read a big-endian u32 from the first four bytes of `data`.
pub fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Read a 31-bit value (reserved high bit cleared).
pub fn read_u31(data: &[u8]) -> u32 {
    read_u32(data) & STREAM_ID_MASK
}

/// Iterate the `(identifier, value)` entries of a SETTINGS payload whose
/// length has already been validated as a multiple of six.
pub fn settings_entries(payload: &[u8]) -> impl Iterator<Item = (u16, u32)> + '_ {
    payload.chunks_exact(SETTING_ENTRY_SIZE).map(|entry| {
        (u16::from_be_bytes([entry[0], entry[1]]), read_u32(&entry[2..]))
    })
}

/// Contents of an ALTSVC frame (RFC 7838 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvc<'a> {
    pub origin: &'a [u8],
    pub field_value: &'a [u8],
}

/// Parse an ALTSVC payload. Structurally invalid payloads yield `None`;
/// RFC 7838 asks receivers to ignore them rather than fail the connection.
pub fn parse_alt_svc(payload: &[u8]) -> Option<AltSvc<'_>> {
    if payload.len() < 2 {
        return None;
    }
    let origin_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let rest = &payload[2..];
    if origin_len > rest.len() {
        return None;
    }
    let (origin, field_value) = rest.split_at(origin_len);
    Some(AltSvc { origin, field_value })
}

// ============================================================================
// Fixed-size frame writers (used by the write pipeline on buffer slices)
// ============================================================================

pub const SETTINGS_ACK_FRAME_SIZE: usize = FRAME_HEADER_SIZE;
pub const PING_FRAME_SIZE: usize = FRAME_HEADER_SIZE + PING_SIZE;
pub const WINDOW_UPDATE_FRAME_SIZE: usize = FRAME_HEADER_SIZE + WINDOW_UPDATE_SIZE;
pub const RST_STREAM_FRAME_SIZE: usize = FRAME_HEADER_SIZE + RST_STREAM_SIZE;

/// Size of a SETTINGS frame carrying `count` entries.
pub fn settings_frame_size(count: usize) -> usize {
    FRAME_HEADER_SIZE + count * SETTING_ENTRY_SIZE
}

/// Write a SETTINGS frame; returns bytes written.
pub fn write_settings(dest: &mut [u8], settings: &[(u16, u32)]) -> usize {
    write_frame_header(dest, settings.len() * SETTING_ENTRY_SIZE, FrameType::Settings, 0, 0);
    let mut pos = FRAME_HEADER_SIZE;
    for (id, value) in settings {
        dest[pos..pos + 2].copy_from_slice(&id.to_be_bytes());
        dest[pos + 2..pos + 6].copy_from_slice(&value.to_be_bytes());
        pos += SETTING_ENTRY_SIZE;
    }
    pos
}

pub fn write_settings_ack(dest: &mut [u8]) -> usize {
    write_frame_header(dest, 0, FrameType::Settings, flags::ACK, 0);
    SETTINGS_ACK_FRAME_SIZE
}

/// Write a WINDOW_UPDATE frame. stream_id=0 updates the connection-level window.
pub fn write_window_update(dest: &mut [u8], stream_id: u32, increment: u32) -> usize {
    write_frame_header(dest, WINDOW_UPDATE_SIZE, FrameType::WindowUpdate, 0, stream_id);
    dest[FRAME_HEADER_SIZE..WINDOW_UPDATE_FRAME_SIZE].copy_from_slice(&(increment & MAX_WINDOW_SIZE).to_be_bytes());
    WINDOW_UPDATE_FRAME_SIZE
}

pub fn write_rst_stream(dest: &mut [u8], stream_id: u32, error_code: u32) -> usize {
    write_frame_header(dest, RST_STREAM_SIZE, FrameType::RstStream, 0, stream_id);
    dest[FRAME_HEADER_SIZE..RST_STREAM_FRAME_SIZE].copy_from_slice(&error_code.to_be_bytes());
    RST_STREAM_FRAME_SIZE
}

pub fn write_ping(dest: &mut [u8], data: [u8; 8], ack: bool) -> usize {
    write_frame_header(dest, PING_SIZE, FrameType::Ping, if ack { flags::ACK } else { 0 }, 0);
    dest[FRAME_HEADER_SIZE..PING_FRAME_SIZE].copy_from_slice(&data);
    PING_FRAME_SIZE
}

/// Bytes needed to carry a header block of `block_len` bytes as one HEADERS
/// frame plus as many CONTINUATION frames as needed.
pub fn header_frames_size(block_len: usize) -> usize {
    let frames = block_len.div_ceil(MAX_FRAME_PAYLOAD).max(1);
    block_len + frames * FRAME_HEADER_SIZE
}

/// Write a header block as HEADERS + CONTINUATION frames. END_HEADERS goes
/// on the last fragment, END_STREAM (if requested) on the HEADERS frame.
pub fn write_header_frames(dest: &mut [u8], stream_id: u32, block: &[u8], end_stream: bool) -> usize {
    let mut chunks = block.chunks(MAX_FRAME_PAYLOAD).peekable();
    let mut pos = 0;
    let mut frame_type = FrameType::Headers;
    let mut frame_flags = if end_stream { flags::END_STREAM } else { 0 };

    loop {
        let chunk = chunks.next().unwrap_or_default();
        if chunks.peek().is_none() {
            frame_flags |= flags::END_HEADERS;
        }
        write_frame_header(&mut dest[pos..], chunk.len(), frame_type, frame_flags, stream_id);
        pos += FRAME_HEADER_SIZE;
        dest[pos..pos + chunk.len()].copy_from_slice(chunk);
        pos += chunk.len();

        if chunks.peek().is_none() {
            return pos;
        }
        frame_type = FrameType::Continuation;
        frame_flags = 0;
    }
}

pub fn write_data_frame(dest: &mut [u8], stream_id: u32, data: &[u8], end_stream: bool) -> usize {
    let frame_flags = if end_stream { flags::END_STREAM } else { 0 };
    write_frame_header(dest, data.len(), FrameType::Data, frame_flags, stream_id);
    dest[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + data.len()].copy_from_slice(data);
    FRAME_HEADER_SIZE + data.len()
}

// ============================================================================
// Whole-frame builders
// ============================================================================

/// Build an arbitrary frame from header fields and a payload.
pub fn create_frame(frame_type: FrameType, flags_byte: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_HEADER_SIZE];
    write_frame_header(&mut frame, payload.len(), frame_type, flags_byte, stream_id);
    frame.extend_from_slice(payload);
    frame
}

pub fn create_settings(settings: &[(u16, u32)]) -> Vec<u8> {
    let mut frame = vec![0u8; settings_frame_size(settings.len())];
    write_settings(&mut frame, settings);
    frame
}

pub fn create_settings_ack() -> Vec<u8> {
    let mut frame = vec![0u8; SETTINGS_ACK_FRAME_SIZE];
    write_settings_ack(&mut frame);
    frame
}

pub fn create_window_update(stream_id: u32, increment: u32) -> Vec<u8> {
    let mut frame = vec![0u8; WINDOW_UPDATE_FRAME_SIZE];
    write_window_update(&mut frame, stream_id, increment);
    frame
}

pub fn create_rst_stream(stream_id: u32, error_code: u32) -> Vec<u8> {
    let mut frame = vec![0u8; RST_STREAM_FRAME_SIZE];
    write_rst_stream(&mut frame, stream_id, error_code);
    frame
}

pub fn create_ping(data: [u8; 8], ack: bool) -> Vec<u8> {
    let mut frame = vec![0u8; PING_FRAME_SIZE];
    write_ping(&mut frame, data, ack);
    frame
}

/// Create a GOAWAY frame
pub fn create_goaway(last_stream_id: u32, error_code: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(GOAWAY_MIN_SIZE);
    payload.extend_from_slice(&(last_stream_id & STREAM_ID_MASK).to_be_bytes());
    payload.extend_from_slice(&error_code.to_be_bytes());
    create_frame(FrameType::GoAway, 0, 0, &payload)
}

/// Create an ALTSVC frame (RFC 7838 Section 4)
pub fn create_alt_svc(stream_id: u32, origin: &[u8], field_value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + origin.len() + field_value.len());
    payload.extend_from_slice(&(origin.len() as u16).to_be_bytes());
    payload.extend_from_slice(origin);
    payload.extend_from_slice(field_value);
    create_frame(FrameType::AltSvc, 0, stream_id, &payload)
}
