//! The HTTP/2 connection: setup, stream table, request submission and teardown.
//!
//! One [`Http2Connection`] owns a transport split into a read half (driven by
//! the frame reader task) and a write half (driven by the write pipeline
//! task). Everything else is shared state behind one lock:
//!
//! ```text
//!   send() ──► WriteQueueEntry ──► WritePipeline ──► transport
//!                                                        │
//!   Http2Stream ◄── FrameReader ◄────────────────────────┘
//! ```
//!
//! The connection is destroyed (tasks stopped, credit managers disposed,
//! pool notified) once the stream table is empty and the connection is either
//! disposed, draining after GOAWAY, or aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::Http2Config;
use crate::credit_manager::CreditManager;
use crate::error::{Error, Result};
use crate::frame_reader::FrameReader;
use crate::h2_codec::{
    self, settings_id, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, MAX_WINDOW_SIZE, PING_FRAME_SIZE,
    RST_STREAM_FRAME_SIZE, SETTINGS_ACK_FRAME_SIZE, WINDOW_UPDATE_FRAME_SIZE,
};
use crate::keepalive::{self, KeepAlive, KeepAliveAction, RttEstimator};
use crate::pool::ConnectionPool;
use crate::request::{encode_request_headers, BodyKind, RequestBody};
use crate::stream::{Http2Stream, ResponseBody, ResponseHead, StreamHost};
use crate::write_queue::{PipelineOwner, WritePipeline, WriteQueueEntry};

/// Concurrent stream limit assumed until the peer's first SETTINGS arrives.
pub const INITIAL_MAX_CONCURRENT_STREAMS: i32 = 100;
/// Largest client-initiated stream id.
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

struct ConnState {
    streams: HashMap<u32, Arc<Http2Stream>>,
    next_stream_id: u32,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE; send window of new streams.
    initial_send_window: i32,
    /// Fixed by GOAWAY (smallest id seen) or stream id exhaustion.
    last_stream_id: Option<u32>,
    abort_error: Option<Error>,
    disposed: bool,
    destroyed: bool,
    /// Received DATA bytes not yet returned to the peer's connection window.
    pending_window_update: i32,
}

/// Shared connection state. Streams, the reader and the writer all hold it.
pub(crate) struct ConnectionInner {
    config: Http2Config,
    pool: Arc<dyn ConnectionPool>,
    state: Mutex<ConnState>,
    connection_credit: CreditManager,
    stream_slots: CreditManager,
    write_tx: mpsc::UnboundedSender<WriteQueueEntry>,
    shutdown: CancellationToken,
    keepalive: Option<KeepAlive>,
    rtt: RttEstimator,
}

/// Cancels the stream on drop unless disarmed, so an abandoned `send` never
/// leaves a stream behind in the table.
struct StreamGuard(Option<Arc<Http2Stream>>);

impl StreamGuard {
    fn disarm(mut self) -> Option<Arc<Http2Stream>> {
        self.0.take()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(stream) = self.0.take() {
            stream.cancel();
        }
    }
}

impl ConnectionInner {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn pool(&self) -> &dyn ConnectionPool {
        self.pool.as_ref()
    }

    pub(crate) fn connection_credit(&self) -> &CreditManager {
        &self.connection_credit
    }

    pub(crate) fn active_stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    fn enqueue(&self, entry: WriteQueueEntry) -> Result<()> {
        self.write_tx
            .send(entry)
            .map_err(|_| self.abort_error().unwrap_or(Error::ShuttingDown))
    }

    fn queue_control<F>(&self, frame: &'static str, byte_count: usize, write: F)
    where
        F: FnOnce(&mut [u8]) -> Result<bool> + Send + 'static,
    {
        if let Err(err) = self.enqueue(WriteQueueEntry::detached(byte_count, Box::new(write))) {
            debug!(frame, error = %err, "failed to queue control frame");
        }
    }

    pub(crate) fn send_settings_ack(&self) {
        trace!("sending SETTINGS ACK");
        self.queue_control("SETTINGS ACK", SETTINGS_ACK_FRAME_SIZE, |dest| {
            h2_codec::write_settings_ack(dest);
            Ok(true)
        });
    }

    pub(crate) fn send_ping(&self, payload: [u8; 8], ack: bool) {
        trace!(ack, "sending PING");
        self.queue_control("PING", PING_FRAME_SIZE, move |dest| {
            h2_codec::write_ping(dest, payload, ack);
            Ok(true)
        });
    }

    fn send_window_update_frame(&self, stream_id: u32, increment: u32) {
        trace!(stream_id, increment, "sending WINDOW_UPDATE");
        self.queue_control("WINDOW_UPDATE", WINDOW_UPDATE_FRAME_SIZE, move |dest| {
            h2_codec::write_window_update(dest, stream_id, increment);
            Ok(true)
        });
    }

    /// Resolve a stream addressed by an incoming frame. `None` means it was
    /// ours but has already been closed.
    pub(crate) fn get_stream(&self, stream_id: u32) -> Result<Option<Arc<Http2Stream>>> {
        if stream_id == 0 {
            return Err(Error::protocol("stream frame on stream 0"));
        }
        let state = self.lock();
        if stream_id % 2 == 0 || stream_id >= state.next_stream_id {
            return Err(Error::protocol(format!("frame for idle stream {}", stream_id)));
        }
        Ok(state.streams.get(&stream_id).cloned())
    }

    fn allocate_stream(
        self: &Arc<Self>,
        request_complete: bool,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
        data_tx: mpsc::UnboundedSender<Result<Bytes>>,
    ) -> Result<Arc<Http2Stream>> {
        let (stream, exhausted) = {
            let mut state = self.lock();
            if let Some(err) = &state.abort_error {
                return Err(err.clone());
            }
            if state.disposed || state.last_stream_id.is_some() {
                return Err(Error::ShuttingDown);
            }

            let id = state.next_stream_id;
            let host: Weak<dyn StreamHost> = Arc::downgrade(self) as Weak<dyn StreamHost>;
            let stream = Arc::new(Http2Stream::new(
                id,
                host,
                state.initial_send_window,
                self.config.initial_stream_window_size,
                request_complete,
                head_tx,
                data_tx,
            ));
            state.streams.insert(id, stream.clone());
            state.next_stream_id += 2;

            let exhausted = state.next_stream_id > MAX_STREAM_ID;
            if exhausted {
                state.last_stream_id = Some(id);
            }
            (stream, exhausted)
        };

        if exhausted {
            debug!(stream_id = stream.id(), "stream ids exhausted, draining connection");
            self.pool.invalidate_connection();
            self.stream_slots.dispose();
        }
        Ok(stream)
    }

    async fn acquire_stream_slot(&self, cancel: &CancellationToken) -> Result<()> {
        if self.stream_slots.try_acquire_no_wait(1) {
            return Ok(());
        }
        trace!("waiting for a concurrent stream slot");
        match self.stream_slots.acquire(1, cancel).await {
            Ok(_) => Ok(()),
            Err(Error::Disposed) => Err(Error::ShuttingDown),
            Err(err) => Err(err),
        }
    }

    fn check_usable(&self) -> Result<()> {
        let state = self.lock();
        if let Some(err) = &state.abort_error {
            return Err(err.clone());
        }
        if state.disposed || state.last_stream_id.is_some() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    async fn send_request(
        self: Arc<Self>,
        request: Request<RequestBody>,
        cancel: &CancellationToken,
    ) -> Result<Response<ResponseBody>> {
        let (parts, body) = request.into_parts();
        let body = body.into_kind();
        let end_stream = matches!(body, BodyKind::Empty);

        self.check_usable()?;
        self.acquire_stream_slot(cancel).await?;

        let mut block = Vec::new();
        if let Err(err) = encode_request_headers(&parts, end_stream, self.pool.as_ref(), &mut block) {
            let _ = self.stream_slots.adjust_credit(1);
            return Err(err);
        }

        let (head_tx, head_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = oneshot::channel::<StreamGuard>();
        // Flush right away unless DATA frames are about to follow.
        let flush = !matches!(body, BodyKind::Full(_));

        let conn = self.clone();
        let (entry, handle) = WriteQueueEntry::new(
            h2_codec::header_frames_size(block.len()),
            Box::new(move |dest| {
                let stream = conn.allocate_stream(end_stream, head_tx, data_tx)?;
                h2_codec::write_header_frames(dest, stream.id(), &block, end_stream);
                trace!(stream_id = stream.id(), len = block.len(), end_stream, "sending HEADERS");
                // The body cannot follow without credit, and the peer only
                // grants it for a stream it has seen.
                let blocked = !stream.send_credit().is_credit_available()
                    || !conn.connection_credit.is_credit_available();
                // If the caller is gone, the returned guard cancels the stream.
                let _ = stream_tx.send(StreamGuard(Some(stream)));
                Ok(flush || blocked)
            }),
        );

        let written = match self.enqueue(entry) {
            Ok(()) => handle.wait(cancel).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            let _ = self.stream_slots.adjust_credit(1);
            return Err(err);
        }
        let guard = stream_rx.await.map_err(|_| Error::Disposed)?;
        let Some(stream) = guard.0.clone() else {
            return Err(Error::Disposed);
        };

        let streaming_body = matches!(body, BodyKind::Streaming(_));
        if !end_stream {
            let conn = self.clone();
            let body_stream = stream.clone();
            tokio::spawn(async move {
                let body_cancel = body_stream.body_cancel_token().clone();
                match conn.send_body(&body_stream, body, &body_cancel).await {
                    Ok(()) => {
                        trace!(stream_id = body_stream.id(), "request body sent");
                        body_stream.on_request_body_sent();
                    }
                    Err(err) => {
                        debug!(stream_id = body_stream.id(), error = %err, "request body send failed");
                        body_stream.on_request_body_failed(err);
                    }
                }
            });
        }

        let head = tokio::select! {
            biased;
            head = head_rx => head.map_err(|_| Error::Disposed)??,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        if streaming_body {
            // From here on the caller's token also governs the duplex body.
            let body_cancel = stream.body_cancel_token().clone();
            let request_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = request_cancel.cancelled() => body_cancel.cancel(),
                    _ = body_cancel.cancelled() => {}
                }
            });
        }

        let stream = guard.disarm().unwrap_or(stream);
        trace!(stream_id = stream.id(), status = head.status.as_u16(), end_stream = head.end_stream, "response ready");
        let mut response = Response::new(ResponseBody::new(stream, data_rx));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        *response.version_mut() = Version::HTTP_2;
        Ok(response)
    }

    async fn send_body(&self, stream: &Http2Stream, body: BodyKind, cancel: &CancellationToken) -> Result<()> {
        match body {
            BodyKind::Empty => Ok(()),
            BodyKind::Full(bytes) => self.send_data(stream, bytes, true, true, cancel).await,
            BodyKind::Streaming(mut chunks) => loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    chunk = chunks.recv() => chunk,
                };
                match chunk {
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        // Flush when the source has nothing else ready.
                        let idle = chunks.is_empty();
                        self.send_data(stream, chunk, false, idle, cancel).await?;
                    }
                    None => return self.write_data(stream.id(), Bytes::new(), true, true, cancel).await,
                }
            },
        }
    }

    /// Send `data` as DATA frames, each bounded by the max frame size and the
    /// credit granted by the stream and connection windows.
    async fn send_data(
        &self,
        stream: &Http2Stream,
        mut data: Bytes,
        end_stream: bool,
        flush_at_end: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while !data.is_empty() {
            let wanted = data.len().min(MAX_FRAME_PAYLOAD) as i32;
            let stream_granted = stream.send_credit().acquire(wanted, cancel).await?;
            let granted = match self.connection_credit.acquire(stream_granted, cancel).await {
                Ok(granted) => granted,
                Err(err) => {
                    let _ = stream.send_credit().adjust_credit(stream_granted);
                    return Err(err);
                }
            };
            if granted < stream_granted {
                stream.send_credit().adjust_credit(stream_granted - granted)?;
            }

            let chunk = data.split_to(granted as usize);
            let last = data.is_empty();
            let end = end_stream && last;
            let flush = (last && flush_at_end)
                || !self.connection_credit.is_credit_available()
                || !stream.send_credit().is_credit_available();
            self.write_data(stream.id(), chunk, end, flush, cancel).await?;
        }
        Ok(())
    }

    async fn write_data(
        &self,
        stream_id: u32,
        chunk: Bytes,
        end_stream: bool,
        flush: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let len = chunk.len();
        trace!(stream_id, len, end_stream, "sending DATA");
        let (entry, handle) = WriteQueueEntry::new(
            FRAME_HEADER_SIZE + len,
            Box::new(move |dest| {
                h2_codec::write_data_frame(dest, stream_id, &chunk, end_stream);
                Ok(flush || end_stream)
            }),
        );
        self.enqueue(entry)?;
        let result = handle.wait(cancel).await;
        if matches!(result, Err(Error::Cancelled)) && len > 0 {
            // Never written: the connection window was not spent.
            let _ = self.connection_credit.adjust_credit(len as i32);
        }
        result
    }

    /// Return received DATA bytes to the peer in batches of 1/8 of the
    /// connection window.
    pub(crate) fn extend_window(&self, amount: u32) {
        let increment = {
            let mut state = self.lock();
            state.pending_window_update = state.pending_window_update.saturating_add(amount as i32);
            if state.pending_window_update < self.config.connection_window_threshold() {
                return;
            }
            std::mem::take(&mut state.pending_window_update)
        };
        self.send_window_update_frame(0, increment as u32);
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE applies retroactively to every open stream.
    pub(crate) fn apply_initial_window_size(&self, value: u32) -> Result<()> {
        if value > MAX_WINDOW_SIZE {
            return Err(Error::flow_control(format!(
                "SETTINGS_INITIAL_WINDOW_SIZE {} exceeds {}",
                value, MAX_WINDOW_SIZE
            )));
        }
        let mut state = self.lock();
        let delta = value as i32 - state.initial_send_window;
        state.initial_send_window = value as i32;
        debug!(value, delta, streams = state.streams.len(), "peer changed initial window size");
        for stream in state.streams.values() {
            stream.send_credit().adjust_credit(delta)?;
        }
        Ok(())
    }

    pub(crate) fn adjust_stream_slots(&self, delta: i32) -> Result<()> {
        self.stream_slots.adjust_credit(delta)
    }

    pub(crate) fn on_frame_received(&self) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.on_frame_received(Instant::now());
        }
    }

    pub(crate) fn on_data_received(&self) {
        if let Some(payload) = self.rtt.on_data_received(Instant::now()) {
            self.send_ping(keepalive::encode_ping_payload(payload), false);
        }
    }

    pub(crate) fn on_ping_ack(&self, payload: i64) -> Result<()> {
        let now = Instant::now();
        if payload < 0 {
            self.rtt.on_ping_ack(payload, now);
            return Ok(());
        }
        match &self.keepalive {
            Some(keepalive) => keepalive.on_ping_ack(payload, now),
            None => Err(Error::protocol(format!("unexpected PING ACK {}", payload))),
        }
    }

    pub(crate) fn process_alt_svc(&self, stream_id: u32, payload: &[u8]) {
        let Some(alt_svc) = h2_codec::parse_alt_svc(payload) else {
            trace!(stream_id, "ignoring malformed ALTSVC");
            return;
        };
        let applies = if stream_id == 0 {
            alt_svc.origin == self.pool.origin().as_bytes()
        } else {
            alt_svc.origin.is_empty()
        };
        if !applies {
            trace!(stream_id, "ignoring ALTSVC for another origin");
            return;
        }
        match std::str::from_utf8(alt_svc.field_value) {
            Ok(value) => self.pool.handle_alt_svc(value),
            Err(_) => trace!(stream_id, "ignoring non-UTF-8 ALTSVC value"),
        }
    }

    /// GOAWAY: streams above `last_stream_id` were never processed and are
    /// reset as retryable; the rest finish normally.
    pub(crate) fn start_graceful_shutdown(&self, last_stream_id: u32, code: u32) {
        let (affected, last) = {
            let mut state = self.lock();
            let last = state.last_stream_id.map_or(last_stream_id, |current| current.min(last_stream_id));
            state.last_stream_id = Some(last);
            let affected: Vec<_> = state
                .streams
                .values()
                .filter(|stream| stream.id() > last)
                .cloned()
                .collect();
            (affected, last)
        };

        debug!(
            last_stream_id = last,
            code = h2_codec::error_code::name(code),
            reset = affected.len(),
            "received GOAWAY"
        );
        self.pool.invalidate_connection();
        self.stream_slots.dispose();
        for stream in affected {
            stream.on_reset(Error::GoAway {
                stream_id: stream.id(),
                last_stream_id: last,
                code,
            });
        }
        self.check_for_shutdown();
    }

    pub(crate) fn dispose(&self) {
        {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        debug!("disposing HTTP/2 connection");
        self.stream_slots.dispose();
        self.check_for_shutdown();
    }

    fn check_for_shutdown(&self) {
        let destroy = {
            let mut state = self.lock();
            let draining = state.disposed || state.last_stream_id.is_some() || state.abort_error.is_some();
            if state.destroyed || !state.streams.is_empty() || !draining {
                false
            } else {
                state.destroyed = true;
                true
            }
        };
        if destroy {
            self.destroy();
        }
    }

    fn destroy(&self) {
        debug!("destroying HTTP/2 connection");
        self.shutdown.cancel();
        self.connection_credit.dispose();
        self.stream_slots.dispose();
        self.pool.on_connection_closed();
    }

    async fn run_keep_alive(self: Arc<Self>) {
        let Some(keepalive) = &self.keepalive else {
            return;
        };
        let tick = keepalive.tick_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
            match keepalive.poll(Instant::now(), self.active_stream_count()) {
                KeepAliveAction::Idle => {}
                KeepAliveAction::SendPing(payload) => self.send_ping(keepalive::encode_ping_payload(payload), false),
                KeepAliveAction::TimedOut => {
                    warn!(timeout = ?self.config.keep_alive_ping_timeout, "keepalive PING timed out");
                    self.abort(Error::KeepAliveTimeout(self.config.keep_alive_ping_timeout));
                    break;
                }
            }
        }
    }
}

impl StreamHost for ConnectionInner {
    fn remove_stream(&self, stream_id: u32) {
        let removed = self.lock().streams.remove(&stream_id).is_some();
        if removed {
            trace!(stream_id, "stream removed");
            let _ = self.stream_slots.adjust_credit(1);
            self.check_for_shutdown();
        }
    }

    fn send_rst_stream(&self, stream_id: u32, code: u32) {
        trace!(stream_id, code = h2_codec::error_code::name(code), "sending RST_STREAM");
        self.queue_control("RST_STREAM", RST_STREAM_FRAME_SIZE, move |dest| {
            h2_codec::write_rst_stream(dest, stream_id, code);
            Ok(true)
        });
    }

    fn send_window_update(&self, stream_id: u32, increment: u32) {
        self.send_window_update_frame(stream_id, increment);
    }
}

impl PipelineOwner for ConnectionInner {
    fn abort_error(&self) -> Option<Error> {
        self.lock().abort_error.clone()
    }

    /// Latch `err` (first caller wins) and reset every tracked stream with it.
    fn abort(&self, err: Error) {
        let streams: Vec<_> = {
            let mut state = self.lock();
            if state.abort_error.is_some() {
                trace!(error = %err, "connection already aborted");
                return;
            }
            state.abort_error = Some(err.clone());
            state.streams.values().cloned().collect()
        };

        warn!(error = %err, streams = streams.len(), "aborting HTTP/2 connection");
        self.pool.invalidate_connection();
        self.stream_slots.dispose();
        for stream in streams {
            stream.on_reset(err.clone());
        }
        self.check_for_shutdown();
    }
}

/// A client-side HTTP/2 connection multiplexing requests over one transport.
///
/// Dropping the handle disposes the connection: no new requests are
/// accepted and the transport is closed once in-flight streams finish.
pub struct Http2Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("authority", &self.inner.pool.authority())
            .field("active_streams", &self.active_stream_count())
            .field("usable", &self.is_usable())
            .finish()
    }
}

impl Http2Connection {
    /// Write the connection preface, our SETTINGS and the connection window
    /// increase in one flush, then start the reader and writer tasks.
    pub async fn setup<T>(transport: T, pool: Arc<dyn ConnectionPool>, config: Http2Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let (read_half, mut write_half) = tokio::io::split(transport);

        let window_increment = config.connection_window_size - h2_codec::DEFAULT_INITIAL_WINDOW_SIZE;
        let mut preface = vec![0u8; h2_codec::settings_frame_size(2) + WINDOW_UPDATE_FRAME_SIZE];
        let mut len = h2_codec::write_settings(
            &mut preface,
            &[
                (settings_id::ENABLE_PUSH, 0),
                (settings_id::INITIAL_WINDOW_SIZE, config.initial_stream_window_size),
            ],
        );
        if window_increment > 0 {
            len += h2_codec::write_window_update(&mut preface[len..], 0, window_increment);
        }
        preface.truncate(len);

        let handshake = async {
            write_half.write_all(h2_codec::CONNECTION_PREFACE).await?;
            write_half.write_all(&preface).await?;
            write_half.flush().await
        };
        if let Err(err) = handshake.await {
            debug!(authority = pool.authority(), error = %err, "HTTP/2 setup failed");
            return Err(Error::ConnectionNotEstablished(Arc::new(err)));
        }

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let keepalive = config.keep_alive_ping_delay.map(|delay| {
            KeepAlive::new(
                delay,
                config.keep_alive_ping_timeout,
                config.keep_alive_policy,
                Instant::now(),
            )
        });
        let inner = Arc::new(ConnectionInner {
            pool,
            state: Mutex::new(ConnState {
                streams: HashMap::new(),
                next_stream_id: 1,
                initial_send_window: h2_codec::DEFAULT_INITIAL_WINDOW_SIZE as i32,
                last_stream_id: None,
                abort_error: None,
                disposed: false,
                destroyed: false,
                pending_window_update: 0,
            }),
            connection_credit: CreditManager::new(
                "connection",
                0,
                h2_codec::DEFAULT_INITIAL_WINDOW_SIZE as i32,
            ),
            stream_slots: CreditManager::new("stream slots", 0, INITIAL_MAX_CONCURRENT_STREAMS),
            write_tx,
            shutdown: CancellationToken::new(),
            keepalive,
            rtt: RttEstimator::new(config.rtt_probes),
            config,
        });

        let pipeline = WritePipeline::new(write_half, write_rx);
        let write_task = tokio::spawn(pipeline.run(inner.clone(), inner.shutdown.clone()));
        tokio::spawn(supervise_write_pipeline(inner.clone(), write_task));
        tokio::spawn(FrameReader::new(read_half, inner.clone()).run());
        if inner.keepalive.is_some() {
            tokio::spawn(inner.clone().run_keep_alive());
        }

        debug!(authority = inner.pool.authority(), "HTTP/2 connection established");
        inner.pool.on_connection_established();
        Ok(Self { inner })
    }

    /// Send one request and wait for the response headers.
    ///
    /// Errors come back wrapped in [`Error::RequestFailed`] carrying whether
    /// the request may safely be retried on another connection; cancellation
    /// through `cancel` yields [`Error::Cancelled`].
    pub async fn send(&self, request: Request<RequestBody>, cancel: CancellationToken) -> Result<Response<ResponseBody>> {
        self.inner
            .clone()
            .send_request(request, &cancel)
            .await
            .map_err(Error::into_request_error)
    }

    /// Stop accepting requests; the transport closes after the last stream.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Fail the connection and every open stream with `err`. Only the first
    /// abort has any effect.
    pub fn abort(&self, err: Error) {
        self.inner.abort(err);
    }

    pub fn abort_error(&self) -> Option<Error> {
        self.inner.abort_error()
    }

    /// Whether new requests may be submitted.
    pub fn is_usable(&self) -> bool {
        self.inner.check_usable().is_ok()
    }

    pub fn active_stream_count(&self) -> usize {
        self.inner.active_stream_count()
    }

    /// Smallest round-trip time measured with RTT PINGs.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.inner.rtt.min_rtt()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl Drop for Http2Connection {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

async fn supervise_write_pipeline(inner: Arc<ConnectionInner>, task: JoinHandle<()>) {
    if let Err(err) = task.await {
        if err.is_panic() {
            error!("HTTP/2 write pipeline panicked");
            debug_assert!(false, "write pipeline panicked: {}", err);
            inner.abort(Error::Io(Arc::new(std::io::Error::other("write pipeline panicked"))));
        }
    }
}
