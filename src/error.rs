//! Error types for the HTTP/2 multiplexer.
//!
//! A single latched connection error is handed to every open stream, so
//! errors are cheap to clone: I/O errors are shared behind an `Arc`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::h2_codec::error_code;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

fn code_name(code: &u32) -> &'static str {
    error_code::name(*code)
}

/// Errors that can occur on an HTTP/2 connection or one of its streams.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connection-fatal violation. The code tells frame-size, protocol and
    /// flow-control errors apart.
    #[error("HTTP/2 {}: {message}", code_name(.code))]
    Protocol { code: u32, message: String },

    /// The peer reset a single stream.
    #[error("stream {stream_id} reset by peer: {}", code_name(.code))]
    StreamReset {
        stream_id: u32,
        code: u32,
        retryable: bool,
    },

    /// The stream was above the last stream id announced in a GOAWAY.
    #[error("stream {stream_id} not processed: GOAWAY with last stream id {last_stream_id} ({})", code_name(.code))]
    GoAway {
        stream_id: u32,
        last_stream_id: u32,
        code: u32,
    },

    /// Transport failure after the handshake.
    #[error("connection I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer closed the transport in the middle of a frame.
    #[error("premature end of stream: expected {expected} bytes, received {received}")]
    PrematureEof { expected: usize, received: usize },

    /// The peer closed the transport on a frame boundary.
    #[error("connection closed by peer while awaiting a frame")]
    MissingFrame,

    #[error("HPACK decode error: {0}")]
    Hpack(String),

    /// A credit manager or the connection was torn down underneath a waiter.
    #[error("HTTP/2 connection disposed")]
    Disposed,

    /// The connection no longer accepts new streams.
    #[error("HTTP/2 connection is shutting down")]
    ShuttingDown,

    #[error("operation cancelled")]
    Cancelled,

    /// Transport failure while writing the connection preface.
    #[error("connection not established: {0}")]
    ConnectionNotEstablished(Arc<io::Error>),

    #[error("keepalive PING not acknowledged within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Client-facing wrapper returned from [`crate::Http2Connection::send`].
    #[error("HTTP/2 request failed: {source}")]
    RequestFailed {
        allow_retry: bool,
        #[source]
        source: Box<Error>,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Create a PROTOCOL_ERROR.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: error_code::PROTOCOL_ERROR,
            message: message.into(),
        }
    }

    /// Create a FRAME_SIZE_ERROR.
    pub fn frame_size(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: error_code::FRAME_SIZE_ERROR,
            message: message.into(),
        }
    }

    /// Create a FLOW_CONTROL_ERROR.
    pub fn flow_control(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: error_code::FLOW_CONTROL_ERROR,
            message: message.into(),
        }
    }

    /// The RFC 7540 error code carried by this error, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Protocol { code, .. }
            | Self::StreamReset { code, .. }
            | Self::GoAway { code, .. } => Some(*code),
            Self::Hpack(_) => Some(error_code::COMPRESSION_ERROR),
            Self::RequestFailed { source, .. } => source.code(),
            _ => None,
        }
    }

    /// Whether a request that failed with this error may be resubmitted on
    /// another connection without risk of a duplicated server-side effect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StreamReset { retryable, .. } => *retryable,
            Self::GoAway { .. }
            | Self::Io(_)
            | Self::PrematureEof { .. }
            | Self::MissingFrame
            | Self::Disposed
            | Self::ShuttingDown
            | Self::KeepAliveTimeout(_) => true,
            Self::RequestFailed { allow_retry, .. } => *allow_retry,
            Self::Protocol { .. }
            | Self::Hpack(_)
            | Self::Cancelled
            | Self::ConnectionNotEstablished(_)
            | Self::InvalidRequest(_) => false,
        }
    }

    /// Wrap into the client-facing request error. Cancellation and already
    /// wrapped errors pass through untouched.
    pub fn into_request_error(self) -> Self {
        match self {
            Self::Cancelled | Self::RequestFailed { .. } => self,
            other => Self::RequestFailed {
                allow_retry: other.is_retryable(),
                source: Box::new(other),
            },
        }
    }
}
