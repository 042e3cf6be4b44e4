//! Serialized write pipeline.
//!
//! Every byte sent on the connection goes through one queue consumed by a
//! single task. Producers submit a [`WriteQueueEntry`]: a declared byte count
//! plus a closure that fills exactly that many bytes of the shared outgoing
//! buffer. A multi-frame sequence (HEADERS + CONTINUATION) is written by one
//! closure, so it can never be interleaved with another producer's frames.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::array_buffer::ArrayBuffer;
use crate::error::{Error, Result};

/// Once this much is buffered, an entry that would not fit is preceded by a flush.
pub const UNFLUSHED_OUTGOING_BUFFER_SIZE: usize = 32 * 1024;
const INITIAL_OUTGOING_BUFFER_SIZE: usize = 4096;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Fills the given slice (exactly the declared byte count); returns whether
/// the buffer should be flushed once the queue drains.
pub type WriteAction = Box<dyn FnOnce(&mut [u8]) -> Result<bool> + Send>;

/// One pending write.
pub struct WriteQueueEntry {
    byte_count: usize,
    action: WriteAction,
    completion: Option<oneshot::Sender<Result<()>>>,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for WriteQueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueueEntry")
            .field("byte_count", &self.byte_count)
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl WriteQueueEntry {
    /// An entry whose outcome the producer awaits through the returned handle.
    pub fn new(byte_count: usize, action: WriteAction) -> (Self, WriteHandle) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(PENDING));
        let entry = Self {
            byte_count,
            action,
            completion: Some(tx),
            state: state.clone(),
        };
        (entry, WriteHandle { rx, state })
    }

    /// An entry nobody waits on (control frames).
    pub fn detached(byte_count: usize, action: WriteAction) -> Self {
        Self {
            byte_count,
            action,
            completion: None,
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Disable cancellation. False if the producer already cancelled.
    fn try_start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn complete(&mut self, result: Result<()>) {
        match self.completion.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(err) = result {
                    debug!(error = %err, bytes = self.byte_count, "detached write failed");
                }
            }
        }
    }
}

/// Producer side of a [`WriteQueueEntry`].
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<()>>,
    state: Arc<AtomicU8>,
}

impl WriteHandle {
    /// Wait for the write to complete. Cancellation only wins while the
    /// entry has not been started; a started write always runs to completion.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            result = &mut self.rx => result.unwrap_or(Err(Error::Disposed)),
            _ = cancel.cancelled() => {
                let cancelled = self
                    .state
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if cancelled {
                    Err(Error::Cancelled)
                } else {
                    self.rx.await.unwrap_or(Err(Error::Disposed))
                }
            }
        }
    }
}

/// What the pipeline needs from the connection that owns it.
pub trait PipelineOwner: Send + Sync {
    /// The latched abort error, if the connection has been aborted.
    fn abort_error(&self) -> Option<Error>;

    fn abort(&self, err: Error);
}

/// The single consumer: owns the transport's write half and the outgoing buffer.
pub struct WritePipeline<W> {
    writer: W,
    outgoing: ArrayBuffer,
    rx: mpsc::UnboundedReceiver<WriteQueueEntry>,
}

impl<W: AsyncWrite + Unpin> WritePipeline<W> {
    pub fn new(writer: W, rx: mpsc::UnboundedReceiver<WriteQueueEntry>) -> Self {
        Self {
            writer,
            outgoing: ArrayBuffer::with_capacity(INITIAL_OUTGOING_BUFFER_SIZE),
            rx,
        }
    }

    /// Drain the queue until `shutdown` fires or every producer is gone,
    /// then close the write half.
    pub async fn run<O: PipelineOwner + ?Sized>(mut self, owner: Arc<O>, shutdown: CancellationToken) {
        loop {
            let first = tokio::select! {
                biased;
                entry = self.rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let mut flush_requested = false;
            let mut next = Some(first);
            while let Some(entry) = next.take() {
                self.process_entry(entry, owner.as_ref(), &mut flush_requested).await;
                next = self.rx.try_recv().ok();
            }

            if flush_requested && !self.outgoing.is_empty() {
                if let Err(err) = self.flush().await {
                    owner.abort(err);
                }
            }
        }

        trace!("write pipeline exiting");
        // Frames queued right before teardown still go out.
        let mut flush_requested = false;
        while let Ok(entry) = self.rx.try_recv() {
            self.process_entry(entry, owner.as_ref(), &mut flush_requested).await;
        }
        if owner.abort_error().is_none() && !self.outgoing.is_empty() {
            let _ = self.flush().await;
        }
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "error shutting down transport write half");
        }
    }

    async fn process_entry<O: PipelineOwner + ?Sized>(
        &mut self,
        mut entry: WriteQueueEntry,
        owner: &O,
        flush_requested: &mut bool,
    ) {
        if let Some(err) = owner.abort_error() {
            if entry.try_start() {
                entry.complete(Err(err));
            }
            return;
        }

        let active = self.outgoing.active_len();
        if active > 0 && active + entry.byte_count > UNFLUSHED_OUTGOING_BUFFER_SIZE {
            if let Err(err) = self.flush().await {
                owner.abort(err.clone());
                if entry.try_start() {
                    entry.complete(Err(err));
                }
                return;
            }
        }

        if !entry.try_start() {
            trace!(bytes = entry.byte_count, "write cancelled before it started");
            return;
        }

        let byte_count = entry.byte_count;
        self.outgoing.ensure_available_space(byte_count);
        let action = std::mem::replace(&mut entry.action, Box::new(|_| Ok(false)));
        match action(&mut self.outgoing.available_span()[..byte_count]) {
            Ok(flush) => {
                self.outgoing.commit(byte_count);
                *flush_requested |= flush;
                entry.complete(Ok(()));
            }
            Err(err) => entry.complete(Err(err)),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let len = self.outgoing.active_len();
        trace!(bytes = len, "flushing outgoing buffer");
        self.writer.write_all(self.outgoing.active_span()).await?;
        self.writer.flush().await?;
        self.outgoing.discard(len);
        Ok(())
    }
}
