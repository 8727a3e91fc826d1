//! One physical connection: a reader task, a writer task and an outbound queue.
//!
//! The reader decodes frames and hands each one to a [`FrameHandler`]. The
//! writer drains an [`OutboundQueue`] in FIFO order. The first transport
//! fault on either side raises a single [`Disconnected`] event; after that
//! both tasks stay parked until the connection is disposed. A connection
//! never heals itself.

use crate::cancel::CancellationToken;
use crate::config::ConnectionConfig;
use crate::frame::{read_frame, write_frame, FrameError};
use crate::message::Frame;
use crate::transport::{BoxedReader, BoxedWriter, DuplexStream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives every frame decoded by a connection's reader.
///
/// Called on the reader task, so implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle_frame(&self, frame: Frame);
}

impl<F> FrameHandler for F
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    fn handle_frame(&self, frame: Frame) {
        self(frame)
    }
}

/// Raised once when a connection's transport fails.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub connection_id: u64,
    pub kind: std::io::ErrorKind,
    pub message: String,
}

struct QueueInner {
    frames: Mutex<VecDeque<Frame>>,
    wake: Notify,
}

/// FIFO of frames waiting to be written, shared between producers and the writer.
///
/// Enqueueing releases a single-permit wake signal; repeated wakes before
/// the writer runs coalesce into one.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                frames: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
            }),
        }
    }

    fn frames(&self) -> std::sync::MutexGuard<'_, VecDeque<Frame>> {
        self.inner.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a frame and wake the writer.
    pub fn push_back(&self, frame: impl Into<Frame>) {
        self.frames().push_back(frame.into());
        self.inner.wake.notify_one();
    }

    /// Append several frames in order under one lock.
    pub fn extend(&self, frames: impl IntoIterator<Item = Frame>) {
        self.frames().extend(frames);
        self.inner.wake.notify_one();
    }

    /// Put a frame back at the head of the queue.
    pub fn push_front(&self, frame: Frame) {
        self.frames().push_front(frame);
        self.inner.wake.notify_one();
    }

    pub fn pop_front(&self) -> Option<Frame> {
        self.frames().pop_front()
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&self) -> Vec<Frame> {
        self.frames().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    /// Whether both handles refer to the same queue.
    pub fn same_queue(&self, other: &OutboundQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release the wake signal without queueing anything.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    async fn woken(&self) {
        self.inner.wake.notified().await
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .finish()
    }
}

struct Shared {
    id: u64,
    handler: Arc<dyn FrameHandler>,
    outbound: OutboundQueue,
    stop: CancellationToken,
    faulted: AtomicBool,
    fault: Mutex<Option<Disconnected>>,
    events: broadcast::Sender<Disconnected>,
}

impl Shared {
    /// Latch the first transport fault and announce it.
    fn raise_fault(&self, err: &std::io::Error) {
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = Disconnected {
            connection_id: self.id,
            kind: err.kind(),
            message: err.to_string(),
        };
        warn!("Connection {} disconnected: {}", self.id, err);
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = Some(event.clone());
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// A started or unstarted connection over one stream pair.
///
/// Dropping the handle disposes the connection.
pub struct Connection {
    shared: Arc<Shared>,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Connection {
    /// Build an unstarted connection over one duplex stream.
    pub fn new<S: DuplexStream>(stream: S, handler: Arc<dyn FrameHandler>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), handler)
    }

    /// Build an unstarted connection over separate input and output streams.
    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        Self::with_outbound(reader, writer, OutboundQueue::new(), handler)
    }

    /// Build an unstarted connection whose writer drains `outbound`.
    ///
    /// Frames already in the queue are written first once the connection
    /// starts.
    pub fn with_outbound(
        reader: BoxedReader,
        writer: BoxedWriter,
        outbound: OutboundQueue,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(ConnectionConfig::EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                handler,
                outbound,
                stop: CancellationToken::new(),
                faulted: AtomicBool::new(false),
                fault: Mutex::new(None),
                events,
            }),
            io: Mutex::new(Some((reader, writer))),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Spawn the reader and writer tasks. Later calls do nothing.
    pub fn start(&self) {
        if self.disposed.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some((reader, writer)) = self.io.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return;
        };

        debug!("Starting connection {}", self.shared.id);
        tokio::spawn(read_loop(self.shared.clone(), reader));
        tokio::spawn(write_loop(self.shared.clone(), writer));
    }

    /// Queue a frame for the writer.
    pub fn enqueue(&self, frame: impl Into<Frame>) {
        self.shared.outbound.push_back(frame);
    }

    /// The queue the writer drains; registries and dispatchers bind to it.
    pub fn outbound(&self) -> OutboundQueue {
        self.shared.outbound.clone()
    }

    /// Take every frame that has not been written yet.
    pub fn drain_outbound(&self) -> Vec<Frame> {
        self.shared.outbound.drain()
    }

    /// Receive future Disconnected events.
    pub fn subscribe(&self) -> broadcast::Receiver<Disconnected> {
        self.shared.events.subscribe()
    }

    /// The fault that disconnected this connection, if any.
    pub fn fault(&self) -> Option<Disconnected> {
        self.shared
            .fault
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the Disconnected event, even if it was raised earlier.
    ///
    /// Returns `None` if the connection is disposed without a fault.
    pub async fn disconnected(&self) -> Option<Disconnected> {
        let mut events = self.subscribe();
        if let Some(event) = self.fault() {
            return Some(event);
        }
        loop {
            tokio::select! {
                _ = self.shared.stop.cancelled() => return self.fault(),
                event = events.recv() => match event {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return self.fault(),
                },
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop both tasks and close the stream. Safe to call more than once.
    ///
    /// Frames still queued stay available through [`drain_outbound`](Self::drain_outbound).
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Disposing connection {}", self.shared.id);
        self.shared.stop.cancel();
        self.shared.outbound.wake();
        // Never started: dropping the halves closes the stream
        drop(self.io.lock().unwrap_or_else(|e| e.into_inner()).take());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("disposed", &self.is_disposed())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: BoxedReader) {
    loop {
        let result = tokio::select! {
            _ = shared.stop.cancelled() => break,
            result = read_frame(&mut reader) => result,
        };

        match result {
            Ok(frame) => shared.handler.handle_frame(frame),
            Err(FrameError::Protocol(message)) => {
                warn!("Connection {} dropped a bad frame: {}", shared.id, message);
            }
            Err(FrameError::Transport(err)) => {
                shared.raise_fault(&err);
                shared.stop.cancelled().await;
                break;
            }
        }
    }
    debug!("Reader for connection {} stopped", shared.id);
}

async fn write_loop(shared: Arc<Shared>, mut writer: BoxedWriter) {
    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        let frame = match shared.outbound.pop_front() {
            Some(frame) => frame,
            None => {
                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    _ = shared.outbound.woken() => {}
                }
                continue;
            }
        };

        let written = tokio::select! {
            _ = shared.stop.cancelled() => None,
            result = write_frame(&mut writer, &frame) => Some(result),
        };
        let Some(result) = written else {
            shared.outbound.push_front(frame);
            break;
        };

        match result {
            Ok(()) => {}
            Err(FrameError::Protocol(message)) => {
                warn!(
                    "Connection {} dropped an unencodable frame (token {}): {}",
                    shared.id,
                    frame.token(),
                    message
                );
            }
            Err(FrameError::Transport(err)) => {
                shared.outbound.push_front(frame);
                shared.raise_fault(&err);
                shared.stop.cancelled().await;
                break;
            }
        }
    }

    let _ = tokio::time::timeout(ConnectionConfig::SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    debug!("Writer for connection {} stopped", shared.id);
}
