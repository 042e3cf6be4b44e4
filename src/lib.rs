//! h2-mux: a client-side HTTP/2 connection multiplexer
//!
//! This crate runs many concurrent request/response exchanges over one
//! already-established transport (TLS or cleartext with prior knowledge).
//!
//! # Features
//!
//! - **Frame Codec**: RFC 7540 frame headers and fixed-format payloads
//!   (SETTINGS, WINDOW_UPDATE, RST_STREAM, PING, GOAWAY, PRIORITY, ALTSVC)
//! - **HPACK**: decoding via fluke-hpack, stateless static-table encoding
//! - **Flow Control**: per-stream and connection send windows as FIFO credit
//!   queues, batched WINDOW_UPDATEs on the receive side
//! - **Serialized Writes**: one writer task; HEADERS + CONTINUATION
//!   sequences are never interleaved with other frames
//! - **Lifecycle**: GOAWAY draining, abort propagation, keepalive PINGs and
//!   RTT estimation
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use h2_mux::{Http2Config, Http2Connection, OriginPool, RequestBody};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> h2_mux::Result<()> {
//! let tcp = tokio::net::TcpStream::connect("127.0.0.1:8080").await?;
//! let pool = Arc::new(OriginPool::new("127.0.0.1:8080", false));
//! let conn = Http2Connection::setup(tcp, pool, Http2Config::default()).await?;
//!
//! let request = http::Request::get("http://127.0.0.1:8080/").body(RequestBody::empty()).unwrap();
//! let response = conn.send(request, CancellationToken::new()).await?;
//! println!("{}", response.status());
//! let body = response.into_body().collect().await?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Http2Connection`] owns the stream table and the shared state
//! - a reader task parses frames and dispatches them to streams
//! - a writer task drains the [`write_queue`] into the transport
//! - [`ConnectionPool`] is the hook back into whatever pools connections
//!
//! It does NOT provide server support, server push, priority scheduling or
//! HTTP/1.1 upgrade.

pub mod array_buffer;
pub mod config;
pub mod connection;
pub mod credit_manager;
pub mod error;
mod frame_reader;
pub mod h2_codec;
pub mod hpack;
pub mod keepalive;
pub mod pool;
pub mod request;
pub mod stream;
pub mod write_queue;

pub use config::{Http2Config, KeepAlivePolicy, CONNECTION_WINDOW_SIZE};
pub use connection::Http2Connection;
pub use error::{Error, Result};
pub use h2_codec::{error_code, flags, settings_id, FrameType, H2FrameHeader, CONNECTION_PREFACE};
pub use hpack::{H2Header, HeaderHandler, HpackDecoder};
pub use pool::{ConnectionPool, OriginPool};
pub use request::RequestBody;
pub use stream::ResponseBody;
