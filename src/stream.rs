//! One request/response exchange as seen from the connection.
//!
//! The read loop feeds a stream decoded header blocks, DATA payloads and
//! resets; the caller consumes the response through [`ResponseBody`]. Side
//! effects that need the connection (RST_STREAM, WINDOW_UPDATE, removal from
//! the stream table) go through [`StreamHost`] and always run after the
//! stream's own lock has been released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::credit_manager::CreditManager;
use crate::error::{Error, Result};
use crate::h2_codec::error_code;
use crate::hpack::HeaderHandler;

/// Connection-side services a stream calls back into.
pub(crate) trait StreamHost: Send + Sync {
    fn remove_stream(&self, stream_id: u32);

    fn send_rst_stream(&self, stream_id: u32, code: u32);

    fn send_window_update(&self, stream_id: u32, increment: u32);
}

/// Final (non-informational) response headers.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub end_stream: bool,
}

/// Accumulates one decoded header block.
#[derive(Debug, Default)]
pub(crate) struct HeaderBlock {
    status: Option<StatusCode>,
    headers: HeaderMap,
    regular_seen: bool,
    error: Option<String>,
}

impl HeaderBlock {
    fn add(&mut self, name: &[u8], value: &[u8]) -> std::result::Result<(), String> {
        if let Some(pseudo) = name.strip_prefix(b":") {
            if self.regular_seen {
                return Err("pseudo-header field after regular header field".into());
            }
            if pseudo != b"status" {
                return Err(format!("unexpected pseudo-header :{}", String::from_utf8_lossy(pseudo)));
            }
            if self.status.is_some() {
                return Err("duplicate :status".into());
            }
            let status = StatusCode::from_bytes(value)
                .map_err(|_| format!("invalid :status {:?}", String::from_utf8_lossy(value)))?;
            self.status = Some(status);
            return Ok(());
        }

        self.regular_seen = true;
        let name = HeaderName::from_lowercase(name)
            .map_err(|_| format!("invalid header name {:?}", String::from_utf8_lossy(name)))?;
        let value = HeaderValue::from_bytes(value).map_err(|_| format!("invalid value for header {}", name))?;
        self.headers.append(name, value);
        Ok(())
    }
}

impl HeaderHandler for HeaderBlock {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        // Malformed fields are a stream error, reported once the block is complete.
        if self.error.is_none() {
            if let Err(message) = self.add(name, value) {
                self.error = Some(message);
            }
        }
        Ok(())
    }
}

/// Header handler bound to a live stream.
pub(crate) struct StreamHeaderHandler<'a> {
    stream: &'a Http2Stream,
    block: HeaderBlock,
}

impl<'a> StreamHeaderHandler<'a> {
    pub fn new(stream: &'a Http2Stream) -> Self {
        Self {
            stream,
            block: HeaderBlock::default(),
        }
    }
}

impl HeaderHandler for StreamHeaderHandler<'_> {
    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        self.block.on_header(name, value)
    }

    fn on_headers_complete(&mut self, end_stream: bool) {
        self.stream.on_headers_complete(std::mem::take(&mut self.block), end_stream);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseProgress {
    AwaitingHeaders,
    ReceivingBody,
    Complete,
}

struct StreamState {
    response: ResponseProgress,
    head_tx: Option<oneshot::Sender<Result<ResponseHead>>>,
    data_tx: Option<mpsc::UnboundedSender<Result<Bytes>>>,
    trailers: Option<HeaderMap>,
    request_complete: bool,
    reset: Option<Error>,
    /// Bytes the peer may still send before we extend the window.
    recv_window: i64,
    /// Received bytes consumed but not yet returned via WINDOW_UPDATE.
    unacked_recv: u32,
    removed: bool,
}

/// Deferred side effects collected under the stream lock.
#[derive(Default)]
struct Followup {
    rst: Option<u32>,
    window_update: Option<u32>,
    cancel_body: bool,
    dispose_credit: bool,
    remove: bool,
}

/// Connection-side state of one stream.
pub struct Http2Stream {
    id: u32,
    host: Weak<dyn StreamHost>,
    send_credit: CreditManager,
    body_cancel: CancellationToken,
    initial_recv_window: u32,
    state: Mutex<StreamState>,
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Http2Stream")
            .field("id", &self.id)
            .field("response", &state.response)
            .field("request_complete", &state.request_complete)
            .field("reset", &state.reset)
            .finish()
    }
}

impl Http2Stream {
    pub(crate) fn new(
        id: u32,
        host: Weak<dyn StreamHost>,
        send_window: i32,
        recv_window: u32,
        request_complete: bool,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
        data_tx: mpsc::UnboundedSender<Result<Bytes>>,
    ) -> Self {
        Self {
            id,
            host,
            send_credit: CreditManager::new("stream", id, send_window),
            body_cancel: CancellationToken::new(),
            initial_recv_window: recv_window,
            state: Mutex::new(StreamState {
                response: ResponseProgress::AwaitingHeaders,
                head_tx: Some(head_tx),
                data_tx: Some(data_tx),
                trailers: None,
                request_complete,
                reset: None,
                recv_window: recv_window as i64,
                unacked_recv: 0,
                removed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send window for request DATA.
    pub(crate) fn send_credit(&self) -> &CreditManager {
        &self.send_credit
    }

    /// Cancelled when the request body must stop (reset, or response finished
    /// first) and once the exchange is over in both directions.
    pub(crate) fn body_cancel_token(&self) -> &CancellationToken {
        &self.body_cancel
    }

    pub fn is_response_complete(&self) -> bool {
        self.lock().response == ResponseProgress::Complete
    }

    pub fn reset_error(&self) -> Option<Error> {
        self.lock().reset.clone()
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.lock().trailers.clone()
    }

    fn apply(&self, followup: Followup) {
        if followup.cancel_body {
            self.body_cancel.cancel();
        }
        if followup.dispose_credit {
            self.send_credit.dispose();
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };
        if let Some(code) = followup.rst {
            host.send_rst_stream(self.id, code);
        }
        if let Some(increment) = followup.window_update {
            host.send_window_update(self.id, increment);
        }
        if followup.remove {
            host.remove_stream(self.id);
        }
    }

    fn check_done(state: &mut StreamState, followup: &mut Followup) {
        let finished =
            state.reset.is_some() || (state.request_complete && state.response == ResponseProgress::Complete);
        if finished && !state.removed {
            state.removed = true;
            followup.remove = true;
            // Releases anything still linked to the body token.
            followup.cancel_body = true;
        }
    }

    fn fail(state: &mut StreamState, err: Error, followup: &mut Followup) {
        state.reset = Some(err.clone());
        if let Some(tx) = state.head_tx.take() {
            let _ = tx.send(Err(err));
        } else if let Some(tx) = state.data_tx.take() {
            let _ = tx.send(Err(err));
        }
        state.data_tx = None;
        followup.cancel_body = true;
        followup.dispose_credit = true;
        Self::check_done(state, followup);
    }

    fn stream_error(&self, state: &mut StreamState, code: u32, message: String, followup: &mut Followup) {
        debug!(stream_id = self.id, code = error_code::name(code), %message, "stream error");
        followup.rst = Some(code);
        Self::fail(state, Error::Protocol { code, message }, followup);
    }

    fn complete_response(&self, state: &mut StreamState, followup: &mut Followup) {
        state.response = ResponseProgress::Complete;
        state.data_tx = None;
        if !state.request_complete {
            // Response finished before the request body: stop sending it.
            trace!(stream_id = self.id, "response completed before request body");
            state.request_complete = true;
            followup.rst = Some(error_code::CANCEL);
            followup.cancel_body = true;
        }
        Self::check_done(state, followup);
    }

    pub(crate) fn on_headers_complete(&self, block: HeaderBlock, end_stream: bool) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            if state.reset.is_some() {
                return;
            }
            if let Some(message) = block.error {
                self.stream_error(&mut state, error_code::PROTOCOL_ERROR, message, &mut followup);
            } else {
                match state.response {
                    ResponseProgress::AwaitingHeaders => match block.status {
                        None => self.stream_error(
                            &mut state,
                            error_code::PROTOCOL_ERROR,
                            "response headers without :status".into(),
                            &mut followup,
                        ),
                        Some(status) if status == StatusCode::SWITCHING_PROTOCOLS => self.stream_error(
                            &mut state,
                            error_code::PROTOCOL_ERROR,
                            "101 Switching Protocols is not allowed in HTTP/2".into(),
                            &mut followup,
                        ),
                        Some(status) if status.is_informational() => {
                            if end_stream {
                                self.stream_error(
                                    &mut state,
                                    error_code::PROTOCOL_ERROR,
                                    format!("informational {} with END_STREAM", status.as_u16()),
                                    &mut followup,
                                );
                            } else {
                                trace!(stream_id = self.id, status = status.as_u16(), "informational response");
                            }
                        }
                        Some(status) => {
                            trace!(stream_id = self.id, status = status.as_u16(), end_stream, "response headers");
                            state.response = ResponseProgress::ReceivingBody;
                            if let Some(tx) = state.head_tx.take() {
                                let _ = tx.send(Ok(ResponseHead {
                                    status,
                                    headers: block.headers,
                                    end_stream,
                                }));
                            }
                            if end_stream {
                                self.complete_response(&mut state, &mut followup);
                            }
                        }
                    },
                    ResponseProgress::ReceivingBody => {
                        if !end_stream {
                            self.stream_error(
                                &mut state,
                                error_code::PROTOCOL_ERROR,
                                "trailers without END_STREAM".into(),
                                &mut followup,
                            );
                        } else if block.status.is_some() {
                            self.stream_error(
                                &mut state,
                                error_code::PROTOCOL_ERROR,
                                "pseudo-header in trailers".into(),
                                &mut followup,
                            );
                        } else {
                            trace!(stream_id = self.id, count = block.headers.len(), "trailers");
                            state.trailers = Some(block.headers);
                            self.complete_response(&mut state, &mut followup);
                        }
                    }
                    ResponseProgress::Complete => self.stream_error(
                        &mut state,
                        error_code::STREAM_CLOSED,
                        "HEADERS after END_STREAM".into(),
                        &mut followup,
                    ),
                }
            }
        }
        self.apply(followup);
    }

    /// `flow_len` is the frame's full payload length including padding,
    /// which counts against the receive window.
    pub(crate) fn on_data(&self, data: &[u8], flow_len: usize, end_stream: bool) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            if state.reset.is_some() {
                return;
            }
            match state.response {
                ResponseProgress::AwaitingHeaders => self.stream_error(
                    &mut state,
                    error_code::PROTOCOL_ERROR,
                    "DATA before response headers".into(),
                    &mut followup,
                ),
                ResponseProgress::Complete => self.stream_error(
                    &mut state,
                    error_code::STREAM_CLOSED,
                    "DATA after END_STREAM".into(),
                    &mut followup,
                ),
                ResponseProgress::ReceivingBody => {
                    if flow_len as i64 > state.recv_window {
                        let message = format!(
                            "DATA of {} bytes exceeds stream receive window {}",
                            flow_len, state.recv_window
                        );
                        self.stream_error(&mut state, error_code::FLOW_CONTROL_ERROR, message, &mut followup);
                    } else {
                        state.recv_window -= flow_len as i64;
                        // Padding is consumed on arrival.
                        state.unacked_recv += (flow_len - data.len()) as u32;
                        if !data.is_empty() {
                            if let Some(tx) = &state.data_tx {
                                let _ = tx.send(Ok(Bytes::copy_from_slice(data)));
                            }
                        }
                        if end_stream {
                            self.complete_response(&mut state, &mut followup);
                        }
                    }
                }
            }
        }
        self.apply(followup);
    }

    /// The caller took `len` body bytes; extend the peer's send window once
    /// half of the initial window has been consumed.
    pub(crate) fn on_data_consumed(&self, len: usize) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            if state.reset.is_some() || state.response == ResponseProgress::Complete {
                return;
            }
            state.unacked_recv += len as u32;
            if state.unacked_recv >= self.initial_recv_window / 2 {
                let increment = std::mem::take(&mut state.unacked_recv);
                state.recv_window += increment as i64;
                followup.window_update = Some(increment);
            }
        }
        self.apply(followup);
    }

    /// Reset without notifying the peer: RST_STREAM received, GOAWAY or abort.
    pub(crate) fn on_reset(&self, err: Error) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            if state.reset.is_some() || state.removed {
                return;
            }
            debug!(stream_id = self.id, error = %err, "stream reset");
            Self::fail(&mut state, err, &mut followup);
        }
        self.apply(followup);
    }

    /// Reset and tell the peer with RST_STREAM(`code`).
    pub(crate) fn reset_locally(&self, code: u32, err: Error) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            if state.reset.is_some() || state.removed {
                return;
            }
            debug!(stream_id = self.id, code = error_code::name(code), error = %err, "resetting stream");
            followup.rst = Some(code);
            Self::fail(&mut state, err, &mut followup);
        }
        self.apply(followup);
    }

    /// Abandon the exchange (caller cancelled or dropped the response).
    pub fn cancel(&self) {
        self.reset_locally(error_code::CANCEL, Error::Cancelled);
    }

    pub(crate) fn on_request_body_sent(&self) {
        let mut followup = Followup::default();
        {
            let mut state = self.lock();
            state.request_complete = true;
            Self::check_done(&mut state, &mut followup);
        }
        self.apply(followup);
    }

    pub(crate) fn on_request_body_failed(&self, err: Error) {
        let already_done = {
            let state = self.lock();
            state.request_complete || state.reset.is_some()
        };
        if !already_done {
            self.reset_locally(error_code::CANCEL, err);
        }
    }
}

/// Streaming response body.
///
/// Dropping an unfinished body resets the stream with CANCEL.
pub struct ResponseBody {
    stream: Arc<Http2Stream>,
    data_rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    done: bool,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("stream_id", &self.stream.id())
            .field("done", &self.done)
            .finish()
    }
}

impl ResponseBody {
    pub(crate) fn new(stream: Arc<Http2Stream>, data_rx: mpsc::UnboundedReceiver<Result<Bytes>>) -> Self {
        Self {
            stream,
            data_rx,
            done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream.id()
    }

    /// Next chunk of the body, or `None` once END_STREAM has been consumed.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.data_rx.recv().await {
            Some(Ok(bytes)) => {
                self.stream.on_data_consumed(bytes.len());
                Ok(Some(bytes))
            }
            Some(Err(err)) => {
                self.done = true;
                Err(err.into_request_error())
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Read the remaining body into one buffer.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Trailing headers, available once the body has been read to the end.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.stream.trailers()
    }

    /// True once END_STREAM arrived and every buffered chunk has been taken.
    pub fn is_end_stream(&self) -> bool {
        self.done || (self.stream.is_response_complete() && self.data_rx.is_empty())
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if !self.done && !self.stream.is_response_complete() {
            self.stream.cancel();
        }
    }
}
