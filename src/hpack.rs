//! HPACK: Header Compression for HTTP/2 (RFC 7541)
//!
//! Decoding is delegated to `fluke-hpack`, which owns the per-connection
//! dynamic table. Header block fragments (HEADERS + CONTINUATION) are fed in
//! as they arrive and decoded once END_HEADERS is seen; decoded fields are
//! handed to a [`HeaderHandler`].
//!
//! Encoding never touches a dynamic table: requests are serialized with the
//! static table and literal-without-indexing representations only, so header
//! blocks can be built outside the connection lock and in any order.

use crate::error::{Error, Result};

/// A decoded HTTP/2 header
#[derive(Debug, Clone, PartialEq)]
pub struct H2Header {
    pub name: String,
    pub value: String,
}

impl H2Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Maximum accumulated header block size (256 KB).
/// Prevents unbounded memory growth from malicious/buggy CONTINUATION floods.
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Receives decoded header fields.
pub trait HeaderHandler {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<()>;

    /// Called by the connection once the whole block has been decoded.
    fn on_headers_complete(&mut self, _end_stream: bool) {}
}

/// Sink for header blocks of streams that are already gone. The block must
/// still be decoded to keep the dynamic table in sync with the peer.
#[derive(Debug, Default)]
pub struct NoopHeaderHandler;

impl HeaderHandler for NoopHeaderHandler {
    fn on_header(&mut self, _name: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Collects headers into a Vec.
impl HeaderHandler for Vec<H2Header> {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        self.push(H2Header::new(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        Ok(())
    }
}

/// HPACK decoder for HTTP/2 header blocks.
/// Wraps `fluke_hpack::Decoder` which maintains dynamic table state per-connection.
pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
    pending_block: Vec<u8>,
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder")
            .field("pending_block", &self.pending_block.len())
            .finish()
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Decoder::new(),
            pending_block: Vec::new(),
        }
    }

    /// Feed one header block fragment. Fields are delivered to `handler` when
    /// `end_headers` completes the block.
    pub fn decode(&mut self, fragment: &[u8], end_headers: bool, handler: &mut dyn HeaderHandler) -> Result<()> {
        let new_size = self.pending_block.len() + fragment.len();
        if new_size > MAX_HEADER_BLOCK_SIZE {
            self.pending_block.clear();
            return Err(Error::Hpack(format!(
                "Header block too large ({} bytes, max {})",
                new_size, MAX_HEADER_BLOCK_SIZE
            )));
        }
        self.pending_block.extend_from_slice(fragment);
        if !end_headers {
            return Ok(());
        }

        let block = std::mem::take(&mut self.pending_block);
        let pairs = self
            .inner
            .decode(&block)
            .map_err(|e| Error::Hpack(format!("{:?}", e)))?;
        for (name, value) in pairs {
            handler.on_header(&name, &value)?;
        }
        Ok(())
    }

    /// Finish the current header block. Fails if fragments are still pending.
    pub fn complete_decode(&mut self) -> Result<()> {
        if self.pending_block.is_empty() {
            Ok(())
        } else {
            let len = self.pending_block.len();
            self.pending_block.clear();
            Err(Error::Hpack(format!("Incomplete header block ({} bytes pending)", len)))
        }
    }

    /// Decode a complete HPACK-encoded header block into H2Headers.
    pub fn decode_block(&mut self, data: &[u8]) -> Result<Vec<H2Header>> {
        let mut headers = Vec::new();
        self.decode(data, true, &mut headers)?;
        Ok(headers)
    }
}

// ============================================================================
// Static table (RFC 7541 Appendix A)
// ============================================================================

pub mod static_index {
    pub const AUTHORITY: usize = 1;
    pub const METHOD_GET: usize = 2;
    pub const METHOD_POST: usize = 3;
    pub const PATH_SLASH: usize = 4;
    pub const PATH_INDEX_HTML: usize = 5;
    pub const SCHEME_HTTP: usize = 6;
    pub const SCHEME_HTTPS: usize = 7;
    pub const STATUS_200: usize = 8;
    pub const CONTENT_LENGTH: usize = 28;
    pub const COOKIE: usize = 32;
}

const STATIC_TABLE_NAMES: [&str; 61] = [
    ":authority",
    ":method",
    ":method",
    ":path",
    ":path",
    ":scheme",
    ":scheme",
    ":status",
    ":status",
    ":status",
    ":status",
    ":status",
    ":status",
    ":status",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "accept-ranges",
    "accept",
    "access-control-allow-origin",
    "age",
    "allow",
    "authorization",
    "cache-control",
    "content-disposition",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-range",
    "content-type",
    "cookie",
    "date",
    "etag",
    "expect",
    "expires",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "last-modified",
    "link",
    "location",
    "max-forwards",
    "proxy-authenticate",
    "proxy-authorization",
    "range",
    "referer",
    "refresh",
    "retry-after",
    "server",
    "set-cookie",
    "strict-transport-security",
    "transfer-encoding",
    "user-agent",
    "vary",
    "via",
    "www-authenticate",
];

/// Static table index of the first entry with this (lowercase) name.
pub fn static_name_index(name: &str) -> Option<usize> {
    STATIC_TABLE_NAMES.iter().position(|n| *n == name).map(|i| i + 1)
}

// ============================================================================
// Encoding primitives
// ============================================================================

/// Encode an HPACK integer with an N-bit prefix (RFC 7541 Section 5.1).
/// `first_byte` carries the representation bits above the prefix.
pub fn encode_integer(value: usize, prefix_bits: u8, first_byte: u8, dest: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dest.push(first_byte | value as u8);
        return;
    }

    dest.push(first_byte | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dest.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dest.push(rest as u8);
}

/// Indexed header field (RFC 7541 Section 6.1).
pub fn encode_indexed_header(index: usize, dest: &mut Vec<u8>) {
    encode_integer(index, 7, 0x80, dest);
}

/// Literal header field without indexing, indexed name (RFC 7541 Section 6.2.2).
pub fn encode_literal_header_without_indexing(name_index: usize, value: &[u8], dest: &mut Vec<u8>) {
    encode_integer(name_index, 4, 0x00, dest);
    encode_string_literal(value, dest);
}

/// Literal header field without indexing, new name.
pub fn encode_literal_header_without_indexing_new_name(name: &[u8], value: &[u8], dest: &mut Vec<u8>) {
    dest.push(0x00);
    encode_string_literal(name, dest);
    encode_string_literal(value, dest);
}

/// Literal header field without indexing whose value is several values
/// joined by `separator`.
pub fn encode_literal_header_values(name: &[u8], values: &[&[u8]], separator: &[u8], dest: &mut Vec<u8>) {
    match static_name_index(&String::from_utf8_lossy(name)) {
        Some(index) => encode_integer(index, 4, 0x00, dest),
        None => {
            dest.push(0x00);
            encode_string_literal(name, dest);
        }
    }
    encode_string_literals(values, separator, dest);
}

/// String literal without Huffman coding (RFC 7541 Section 5.2).
pub fn encode_string_literal(value: &[u8], dest: &mut Vec<u8>) {
    encode_integer(value.len(), 7, 0x00, dest);
    dest.extend_from_slice(value);
}

/// Several values emitted as one string literal, joined by `separator`.
pub fn encode_string_literals(values: &[&[u8]], separator: &[u8], dest: &mut Vec<u8>) {
    let len = values.iter().map(|v| v.len()).sum::<usize>() + separator.len() * values.len().saturating_sub(1);
    encode_integer(len, 7, 0x00, dest);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            dest.extend_from_slice(separator);
        }
        dest.extend_from_slice(value);
    }
}

// ============================================================================
// Tests
// ============================================================================
