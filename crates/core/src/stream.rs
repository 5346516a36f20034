//! Bounded ordered chunk hand-off
//!
//! A StreamChannel carries a generated chunk sequence from a worker thread
//! to an asynchronous consumer. The producer blocks when the channel is
//! full (backpressure) and observes consumer-side cancellation on its next
//! push attempt; the consumer suspends on the runtime until a chunk, an
//! error, or end-of-stream is available, in push order.

use crate::callable::ChunkPayload;
use offramp_common::{metrics::METRICS, OfframpError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;

/// One ordered unit of a streamed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Monotonically increasing per-request sequence number, gap-free
    pub seq: u64,

    /// Chunk payload
    pub payload: ChunkPayload,

    /// Terminal flag; set only on the empty end-of-stream marker
    pub last: bool,
}

impl Chunk {
    fn data(seq: u64, payload: ChunkPayload) -> Self {
        Self {
            seq,
            payload,
            last: false,
        }
    }

    fn terminal(seq: u64) -> Self {
        Self {
            seq,
            payload: ChunkPayload::Text(String::new()),
            last: true,
        }
    }
}

type Delivery = std::result::Result<Chunk, OfframpError>;

/// State shared between the two halves of the channel
struct StreamShared {
    /// No further pushes are accepted once set
    closed: AtomicBool,

    /// Terminal error parked here when the buffer has no room for it
    fault: Mutex<Option<OfframpError>>,

    /// Wakes the consumer when a parked error must preempt buffered chunks
    aborted: Notify,
}

/// Bounded, ordered hand-off queue for one streaming request
pub struct StreamChannel;

impl StreamChannel {
    /// Create a channel with bounded capacity
    pub fn create(capacity: usize) -> (StreamProducer, StreamConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(StreamShared {
            closed: AtomicBool::new(false),
            fault: Mutex::new(None),
            aborted: Notify::new(),
        });

        let producer = StreamProducer {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            shared: shared.clone(),
        };
        let consumer = StreamConsumer {
            rx,
            shared,
            done: false,
        };
        (producer, consumer)
    }
}

/// Producing half, held by the worker thread
#[derive(Clone)]
pub struct StreamProducer {
    tx: mpsc::Sender<Delivery>,
    seq: Arc<AtomicU64>,
    shared: Arc<StreamShared>,
}

impl StreamProducer {
    /// Push one payload, blocking the calling thread while the channel is
    /// full
    ///
    /// Returns the chunk's sequence number, or a cancellation error once
    /// the consumer has closed the channel. Must only be called from a
    /// worker thread, never from the async side.
    pub fn push(&self, payload: ChunkPayload) -> Result<u64> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(OfframpError::cancelled("stream closed"));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tx
            .blocking_send(Ok(Chunk::data(seq, payload)))
            .map_err(|_| {
                self.shared.closed.store(true, Ordering::Release);
                OfframpError::cancelled("stream closed by consumer")
            })?;

        METRICS.stream.chunks_pushed.inc();
        Ok(seq)
    }

    /// Terminate the stream with an error
    ///
    /// Blocks like `push` if the channel is full; a no-op once the channel
    /// is closed.
    pub fn push_error(&self, err: OfframpError) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("stream already closed, dropping error: {}", err);
            return;
        }
        let _ = self.tx.blocking_send(Err(err));
    }

    /// Terminate the stream normally, emitting the empty terminal marker
    ///
    /// A no-op once the channel is closed.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.blocking_send(Ok(Chunk::terminal(seq)));
    }

    /// Terminate the stream with an error without ever blocking
    ///
    /// Used by the supervisor's shutdown sweep, which runs on the async
    /// side and cannot wait for a full buffer to drain: when the buffer
    /// has no room the error is parked and the consumer is woken directly.
    pub(crate) fn abort(&self, err: OfframpError) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(send_err) = self.tx.try_send(Err(err)) {
            if let Err(err) = send_err.into_inner() {
                *self.shared.fault.lock() = Some(err);
            }
            self.shared.aborted.notify_one();
        }
    }

    /// Whether the channel has been closed from either side
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Consuming half, held by the asynchronous side
pub struct StreamConsumer {
    rx: mpsc::Receiver<Delivery>,
    shared: Arc<StreamShared>,
    done: bool,
}

impl StreamConsumer {
    /// Suspend until the next chunk, an error, or end-of-stream
    ///
    /// Chunks arrive in push order; the final item of a successful stream
    /// is the terminal marker, after which `next` returns `None`.
    pub async fn next(&mut self) -> Option<Result<Chunk>> {
        if self.done {
            return None;
        }

        if let Some(err) = self.shared.fault.lock().take() {
            self.done = true;
            return Some(Err(err));
        }

        tokio::select! {
            item = self.rx.recv() => match item {
                Some(Ok(chunk)) => {
                    if chunk.last {
                        self.done = true;
                    }
                    Some(Ok(chunk))
                }
                Some(Err(err)) => {
                    self.done = true;
                    Some(Err(err))
                }
                None => {
                    self.done = true;
                    self.shared.fault.lock().take().map(Err)
                }
            },
            _ = self.shared.aborted.notified() => {
                self.done = true;
                let err = self
                    .shared
                    .fault
                    .lock()
                    .take()
                    .unwrap_or_else(|| OfframpError::shutdown("stream aborted"));
                Some(Err(err))
            }
        }
    }

    /// Close the channel from the consumer side
    ///
    /// Wakes a producer blocked in `push`; the worker observes the closed
    /// channel on its next push attempt and abandons the generator.
    /// Dropping the consumer has the same effect.
    pub fn cancel(&mut self) {
        if !self.done {
            METRICS.stream.streams_cancelled.inc();
        }
        self.done = true;
        self.shared.closed.store(true, Ordering::Release);
        self.rx.close();
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        if !self.done {
            METRICS.stream.streams_cancelled.inc();
        }
        self.shared.closed.store(true, Ordering::Release);
    }
}
