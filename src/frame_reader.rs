//! Inbound half of the connection: reads frames off the transport and
//! dispatches them to the connection and its streams.
//!
//! Any error returned while processing a frame is connection-fatal and aborts
//! the connection; stream-level problems are handled by the stream itself.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::array_buffer::ArrayBuffer;
use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::h2_codec::{
    self, error_code, settings_id, FrameType, H2FrameHeader, FRAME_HEADER_SIZE, GOAWAY_MIN_SIZE,
    MAX_FRAME_PAYLOAD, MAX_FRAME_SIZE_LIMIT, PING_SIZE, PRIORITY_SIZE, RST_STREAM_SIZE, SETTING_ENTRY_SIZE,
    WINDOW_UPDATE_SIZE,
};
use crate::hpack::{HeaderHandler, HpackDecoder, NoopHeaderHandler};
use crate::keepalive;
use crate::stream::StreamHeaderHandler;
use crate::write_queue::PipelineOwner;

const INITIAL_INCOMING_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) struct FrameReader<R> {
    reader: R,
    incoming: ArrayBuffer,
    /// Bytes of the previous frame still at the front of `incoming`.
    pending_discard: usize,
    conn: Arc<ConnectionInner>,
    decoder: HpackDecoder,
    expecting_settings_ack: bool,
    max_concurrent_streams: i32,
}

fn decode_fragment(
    decoder: &mut HpackDecoder,
    fragment: &[u8],
    end_headers: bool,
    handler: Option<&mut StreamHeaderHandler<'_>>,
) -> Result<()> {
    match handler {
        Some(handler) => decoder.decode(fragment, end_headers, handler),
        // Blocks for closed streams must still be decoded to keep the
        // dynamic table in sync.
        None => decoder.decode(fragment, end_headers, &mut NoopHeaderHandler),
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R, conn: Arc<ConnectionInner>) -> Self {
        Self {
            reader,
            incoming: ArrayBuffer::with_capacity(INITIAL_INCOMING_BUFFER_SIZE),
            pending_discard: 0,
            conn,
            decoder: HpackDecoder::new(),
            expecting_settings_ack: true,
            max_concurrent_streams: crate::connection::INITIAL_MAX_CONCURRENT_STREAMS,
        }
    }

    /// Read until the transport fails, the peer misbehaves or the connection
    /// shuts down. Failures abort the connection.
    pub(crate) async fn run(mut self) {
        let shutdown = self.conn.shutdown_token().clone();
        let result = tokio::select! {
            result = self.read_frames() => result,
            _ = shutdown.cancelled() => Ok(()),
        };
        if let Err(err) = result {
            debug!(error = %err, "frame reader stopped");
            self.conn.abort(err);
        } else {
            trace!("frame reader exiting");
        }
    }

    async fn read_frames(&mut self) -> Result<()> {
        let header = self.read_frame().await?;
        if header.kind() != Some(FrameType::Settings) || header.is_ack() {
            return Err(Error::protocol(format!(
                "expected SETTINGS as the first frame, got type {}",
                header.frame_type
            )));
        }
        self.process_settings(&header, true)?;

        loop {
            let header = self.read_frame().await?;
            self.process_frame(header).await?;
        }
    }

    /// Make sure `n` bytes are buffered. `Ok(false)` on a clean EOF before
    /// any byte of the frame arrived.
    async fn fill(&mut self, n: usize, frame_start: bool) -> Result<bool> {
        self.incoming.ensure_available_space(n.saturating_sub(self.incoming.active_len()));
        while self.incoming.active_len() < n {
            let read = self.reader.read(self.incoming.available_span()).await?;
            if read == 0 {
                let received = self.incoming.active_len();
                if frame_start && received == 0 {
                    return Ok(false);
                }
                return Err(Error::PrematureEof { expected: n, received });
            }
            self.incoming.commit(read);
        }
        Ok(true)
    }

    /// Read one complete frame. Its payload is
    /// `incoming.active_span()[FRAME_HEADER_SIZE..header.total_size()]`
    /// until the next call.
    async fn read_frame(&mut self) -> Result<H2FrameHeader> {
        self.incoming.discard(std::mem::take(&mut self.pending_discard));

        if !self.fill(FRAME_HEADER_SIZE, true).await? {
            return Err(Error::MissingFrame);
        }
        let header = H2FrameHeader::parse(self.incoming.active_span())
            .ok_or_else(|| Error::protocol("truncated frame header"))?;
        if header.length as usize > MAX_FRAME_PAYLOAD {
            return Err(Error::frame_size(format!(
                "frame of {} bytes exceeds maximum frame size {}",
                header.length, MAX_FRAME_PAYLOAD
            )));
        }

        self.fill(header.total_size(), false).await?;
        self.pending_discard = header.total_size();
        trace!(
            frame_type = header.frame_type,
            flags = header.flags,
            stream_id = header.stream_id,
            length = header.length,
            "received frame"
        );
        self.conn.on_frame_received();
        Ok(header)
    }

    fn payload(&self, header: &H2FrameHeader) -> &[u8] {
        &self.incoming.active_span()[FRAME_HEADER_SIZE..header.total_size()]
    }

    async fn process_frame(&mut self, header: H2FrameHeader) -> Result<()> {
        match header.kind() {
            Some(FrameType::Data) => self.process_data(&header),
            Some(FrameType::Headers) => self.process_headers(header).await,
            Some(FrameType::Priority) => {
                if header.length as usize != PRIORITY_SIZE {
                    return Err(Error::frame_size(format!("PRIORITY of {} bytes", header.length)));
                }
                if header.stream_id == 0 {
                    return Err(Error::protocol("PRIORITY on stream 0"));
                }
                Ok(())
            }
            Some(FrameType::RstStream) => self.process_rst_stream(&header),
            Some(FrameType::Settings) => self.process_settings(&header, false),
            Some(FrameType::PushPromise) => Err(Error::protocol("PUSH_PROMISE received with push disabled")),
            Some(FrameType::Ping) => self.process_ping(&header),
            Some(FrameType::GoAway) => self.process_goaway(&header),
            Some(FrameType::WindowUpdate) => self.process_window_update(&header),
            Some(FrameType::Continuation) => Err(Error::protocol(format!(
                "CONTINUATION on stream {} without a preceding HEADERS",
                header.stream_id
            ))),
            Some(FrameType::AltSvc) => {
                self.conn.process_alt_svc(header.stream_id, self.payload(&header));
                Ok(())
            }
            None => Err(Error::protocol(format!("unknown frame type {}", header.frame_type))),
        }
    }

    fn process_settings(&mut self, header: &H2FrameHeader, initial: bool) -> Result<()> {
        if header.stream_id != 0 {
            return Err(Error::protocol(format!("SETTINGS on stream {}", header.stream_id)));
        }
        if header.is_ack() {
            if header.length != 0 {
                return Err(Error::frame_size("SETTINGS ACK with a payload"));
            }
            if !self.expecting_settings_ack {
                return Err(Error::protocol("unexpected SETTINGS ACK"));
            }
            self.expecting_settings_ack = false;
            trace!("peer acknowledged our SETTINGS");
            return Ok(());
        }
        if header.length as usize % SETTING_ENTRY_SIZE != 0 {
            return Err(Error::frame_size(format!("SETTINGS of {} bytes", header.length)));
        }

        let payload = &self.incoming.active_span()[FRAME_HEADER_SIZE..header.total_size()];
        let mut saw_max_concurrent = false;
        for (id, value) in h2_codec::settings_entries(payload) {
            match id {
                settings_id::MAX_CONCURRENT_STREAMS => {
                    saw_max_concurrent = true;
                    let limit = value.min(i32::MAX as u32) as i32;
                    let delta = limit - self.max_concurrent_streams;
                    self.max_concurrent_streams = limit;
                    debug!(limit, "peer set max concurrent streams");
                    self.conn.adjust_stream_slots(delta)?;
                }
                settings_id::INITIAL_WINDOW_SIZE => self.conn.apply_initial_window_size(value)?,
                settings_id::MAX_FRAME_SIZE => {
                    if !(MAX_FRAME_PAYLOAD as u32..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        return Err(Error::protocol(format!("invalid SETTINGS_MAX_FRAME_SIZE {}", value)));
                    }
                }
                _ => trace!(id, value, "ignoring setting"),
            }
        }

        if initial && !saw_max_concurrent {
            // No limit announced: effectively unbounded.
            let delta = i32::MAX - self.max_concurrent_streams;
            self.max_concurrent_streams = i32::MAX;
            self.conn.adjust_stream_slots(delta)?;
        }
        self.conn.send_settings_ack();
        Ok(())
    }

    async fn process_headers(&mut self, header: H2FrameHeader) -> Result<()> {
        let stream = self.conn.get_stream(header.stream_id)?;
        let mut handler = stream.as_deref().map(StreamHeaderHandler::new);

        let fragment = h2_codec::strip_padding_and_priority(
            &header,
            &self.incoming.active_span()[FRAME_HEADER_SIZE..header.total_size()],
        )?;
        let mut end_headers = header.is_end_headers();
        decode_fragment(&mut self.decoder, fragment, end_headers, handler.as_mut())?;

        while !end_headers {
            let next = self.read_frame().await?;
            if next.kind() != Some(FrameType::Continuation) || next.stream_id != header.stream_id {
                return Err(Error::protocol(format!(
                    "expected CONTINUATION for stream {}, got type {} on stream {}",
                    header.stream_id, next.frame_type, next.stream_id
                )));
            }
            end_headers = next.is_end_headers();
            let fragment = &self.incoming.active_span()[FRAME_HEADER_SIZE..next.total_size()];
            decode_fragment(&mut self.decoder, fragment, end_headers, handler.as_mut())?;
        }
        self.decoder.complete_decode()?;

        if let Some(handler) = handler.as_mut() {
            handler.on_headers_complete(header.is_end_stream());
        }
        Ok(())
    }

    fn process_data(&self, header: &H2FrameHeader) -> Result<()> {
        let stream = self.conn.get_stream(header.stream_id)?;
        let data = h2_codec::strip_padding_and_priority(header, self.payload(header))?;
        if let Some(stream) = &stream {
            stream.on_data(data, header.length as usize, header.is_end_stream());
        }
        if !data.is_empty() {
            self.conn.on_data_received();
        }
        // Padding and DATA for closed streams still count against the
        // connection window.
        if header.length > 0 {
            self.conn.extend_window(header.length);
        }
        Ok(())
    }

    fn process_window_update(&self, header: &H2FrameHeader) -> Result<()> {
        if header.length as usize != WINDOW_UPDATE_SIZE {
            return Err(Error::frame_size(format!("WINDOW_UPDATE of {} bytes", header.length)));
        }
        let increment = h2_codec::read_u31(self.payload(header));
        if increment == 0 {
            return Err(Error::protocol(format!(
                "WINDOW_UPDATE with zero increment on stream {}",
                header.stream_id
            )));
        }

        if header.stream_id == 0 {
            trace!(increment, "connection window update");
            return self.conn.connection_credit().adjust_credit(increment as i32);
        }
        if let Some(stream) = self.conn.get_stream(header.stream_id)? {
            trace!(stream_id = header.stream_id, increment, "stream window update");
            stream.send_credit().adjust_credit(increment as i32)?;
        }
        Ok(())
    }

    fn process_rst_stream(&self, header: &H2FrameHeader) -> Result<()> {
        if header.length as usize != RST_STREAM_SIZE {
            return Err(Error::frame_size(format!("RST_STREAM of {} bytes", header.length)));
        }
        if header.stream_id == 0 {
            return Err(Error::protocol("RST_STREAM on stream 0"));
        }
        let code = h2_codec::read_u32(self.payload(header));
        if let Some(stream) = self.conn.get_stream(header.stream_id)? {
            stream.on_reset(Error::StreamReset {
                stream_id: header.stream_id,
                code,
                retryable: code == error_code::REFUSED_STREAM,
            });
        }
        Ok(())
    }

    fn process_goaway(&self, header: &H2FrameHeader) -> Result<()> {
        if (header.length as usize) < GOAWAY_MIN_SIZE {
            return Err(Error::frame_size(format!("GOAWAY of {} bytes", header.length)));
        }
        if header.stream_id != 0 {
            return Err(Error::protocol(format!("GOAWAY on stream {}", header.stream_id)));
        }
        let payload = self.payload(header);
        let last_stream_id = h2_codec::read_u31(payload);
        let code = h2_codec::read_u32(&payload[4..]);
        let debug_data = &payload[GOAWAY_MIN_SIZE..];
        if !debug_data.is_empty() {
            debug!(debug_data = %String::from_utf8_lossy(debug_data), "GOAWAY debug data");
        }
        self.conn.start_graceful_shutdown(last_stream_id, code);
        Ok(())
    }

    fn process_ping(&self, header: &H2FrameHeader) -> Result<()> {
        if header.length as usize != PING_SIZE {
            return Err(Error::frame_size(format!("PING of {} bytes", header.length)));
        }
        if header.stream_id != 0 {
            return Err(Error::protocol(format!("PING on stream {}", header.stream_id)));
        }
        let payload = self.payload(header);
        if header.is_ack() {
            let value = keepalive::decode_ping_payload(payload)
                .ok_or_else(|| Error::frame_size("PING ACK payload"))?;
            return self.conn.on_ping_ack(value);
        }
        let mut echo = [0u8; PING_SIZE];
        echo.copy_from_slice(payload);
        self.conn.send_ping(echo, true);
        Ok(())
    }
}
