//! Request bodies and request header serialization.

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{request, Method};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::hpack::{self, static_index};
use crate::pool::ConnectionPool;

/// Body of an outgoing request.
#[derive(Debug, Default)]
pub struct RequestBody {
    kind: BodyKind,
}

#[derive(Debug, Default)]
pub(crate) enum BodyKind {
    #[default]
    Empty,
    Full(Bytes),
    /// Chunks are sent as they arrive; the sender closing the channel ends the body.
    Streaming(mpsc::Receiver<Bytes>),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn streaming(chunks: mpsc::Receiver<Bytes>) -> Self {
        Self {
            kind: BodyKind::Streaming(chunks),
        }
    }

    /// True when no DATA frame will be sent (END_STREAM rides on HEADERS).
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Full(bytes) => bytes.is_empty(),
            BodyKind::Streaming(_) => false,
        }
    }

    pub(crate) fn into_kind(self) -> BodyKind {
        match self.kind {
            BodyKind::Full(bytes) if bytes.is_empty() => BodyKind::Empty,
            kind => kind,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self {
            kind: BodyKind::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<()> for RequestBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

/// Headers that only have meaning on an HTTP/1.1 hop (RFC 7540 §8.1.2.2).
fn is_connection_specific(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::UPGRADE
        || *name == header::TRANSFER_ENCODING
        || name.as_str() == "proxy-connection"
        || name.as_str() == "keep-alive"
}

fn method_carries_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// Serialize request headers into an HPACK block using only the static
/// table and literals without indexing.
pub fn encode_request_headers(
    parts: &request::Parts,
    body_is_empty: bool,
    pool: &dyn ConnectionPool,
    dest: &mut Vec<u8>,
) -> Result<()> {
    if parts.method == Method::CONNECT {
        return Err(Error::InvalidRequest("CONNECT is not supported".into()));
    }

    if parts.method == Method::GET {
        hpack::encode_indexed_header(static_index::METHOD_GET, dest);
    } else if parts.method == Method::POST {
        hpack::encode_indexed_header(static_index::METHOD_POST, dest);
    } else {
        hpack::encode_literal_header_without_indexing(static_index::METHOD_GET, parts.method.as_str().as_bytes(), dest);
    }

    let scheme = if pool.is_secure() {
        static_index::SCHEME_HTTPS
    } else {
        static_index::SCHEME_HTTP
    };
    hpack::encode_indexed_header(scheme, dest);

    hpack::encode_literal_header_without_indexing(static_index::AUTHORITY, pool.authority().as_bytes(), dest);

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if path == "/" || path.is_empty() {
        hpack::encode_indexed_header(static_index::PATH_SLASH, dest);
    } else {
        hpack::encode_literal_header_without_indexing(static_index::PATH_SLASH, path.as_bytes(), dest);
    }

    let mut cookies: Vec<&[u8]> = Vec::new();
    for name in parts.headers.keys() {
        if *name == header::HOST || is_connection_specific(name) {
            continue;
        }
        if *name == header::TE {
            let trailers = parts
                .headers
                .get_all(header::TE)
                .iter()
                .flat_map(|v| v.as_bytes().split(|b| *b == b','))
                .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"trailers"));
            if trailers {
                hpack::encode_literal_header_without_indexing_new_name(b"te", b"trailers", dest);
            }
            continue;
        }
        if *name == header::COOKIE {
            cookies.extend(parts.headers.get_all(header::COOKIE).iter().map(|v| v.as_bytes()));
            continue;
        }

        let values: Vec<&[u8]> = parts.headers.get_all(name).iter().map(|v| v.as_bytes()).collect();
        hpack::encode_literal_header_values(name.as_str().as_bytes(), &values, b", ", dest);
    }

    let stored_cookies = pool.cookie_header(&parts.uri);
    if let Some(stored) = &stored_cookies {
        cookies.push(stored.as_bytes());
    }
    if !cookies.is_empty() {
        hpack::encode_integer(static_index::COOKIE, 4, 0x00, dest);
        hpack::encode_string_literals(&cookies, b"; ", dest);
    }

    if body_is_empty && method_carries_body(&parts.method) && !parts.headers.contains_key(header::CONTENT_LENGTH) {
        hpack::encode_literal_header_without_indexing(static_index::CONTENT_LENGTH, b"0", dest);
    }

    Ok(())
}
