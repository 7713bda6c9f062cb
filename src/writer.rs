//! Dedicated writer task for outbound envelopes.
//!
//! The WebSocket sink is owned by exactly one task; every sender goes through
//! an mpsc queue. Concurrent callers therefore never interleave partial frames
//! on the wire, and no lock is held across socket writes.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► WebSocket sink
//! Caller N ─┘
//! ```
//!
//! Ready frames are batched with `feed` and flushed once. When the connection's
//! shutdown token fires, the writer sends a Close frame and stops; frames still
//! queued at that point are dropped (their callers are failed by teardown).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::error::{DaemonError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// A frame queued for the writer task.
#[derive(Debug)]
pub struct OutboundFrame {
    message: WsMessage,
    // Released once the frame has been written (or dropped).
    _permit: OwnedSemaphorePermit,
}

impl OutboundFrame {
    /// Size of the frame payload in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.message.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum frames queued or in flight before senders wait.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by every caller of the connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, config: &WriterConfig, pending: Arc<AtomicUsize>) -> Self {
        Self {
            tx,
            permits: Arc::new(Semaphore::new(config.max_pending_frames.max(1))),
            pending,
            timeout: config.backpressure_timeout,
        }
    }

    /// Queue one text frame.
    ///
    /// Waits while the queue is saturated, up to the backpressure timeout.
    ///
    /// # Errors
    ///
    /// - `BackpressureTimeout` if the queue stayed full.
    /// - `Cancelled` if `cancel` fired first.
    /// - `ConnectionLost` if the writer task is gone.
    pub async fn send_text(&self, text: String, cancel: &CancellationToken) -> Result<()> {
        let enqueue = async {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| writer_gone())?;

            // Counted only once a channel slot is held, so a dropped wait
            // leaves the counter untouched.
            let slot = self.tx.reserve().await.map_err(|_| writer_gone())?;
            self.pending.fetch_add(1, Ordering::AcqRel);
            slot.send(OutboundFrame {
                message: WsMessage::text(text),
                _permit: permit,
            });
            Ok(())
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(DaemonError::Cancelled),
            result = tokio::time::timeout(self.timeout, enqueue) => {
                result.unwrap_or(Err(DaemonError::BackpressureTimeout))
            }
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

fn writer_gone() -> DaemonError {
    DaemonError::ConnectionLost("writer stopped".to_string())
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when `shutdown` fires, when every handle is dropped, or on the
/// first write error. A write error cancels `shutdown` so the rest of the
/// connection tears down with it.
pub fn spawn_writer_task<W>(
    sink: W,
    config: WriterConfig,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: Sink<WsMessage, Error = WsError> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle::new(tx, &config, pending.clone());

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, sink, pending, shutdown.clone()).await;
        if let Err(e) = &result {
            tracing::error!("Writer error: {}", e);
            shutdown.cancel();
        }
        result
    });

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the sink.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: W,
    pending: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut sink, batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        result?;
    }

    // Graceful close: send a Close frame and flush. The peer may already be gone.
    rx.close();
    while rx.try_recv().is_ok() {
        pending.fetch_sub(1, Ordering::Release);
    }
    if let Err(e) = sink.close().await {
        tracing::debug!("close handshake not completed: {}", e);
    }
    Ok(())
}

/// Feed a batch into the sink and flush once.
async fn write_batch<W>(sink: &mut W, batch: Vec<OutboundFrame>) -> Result<()>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    for frame in batch {
        tracing::trace!(bytes = frame.size(), "writing frame");
        sink.feed(frame.message).await?;
    }
    sink.flush().await?;
    Ok(())
}
