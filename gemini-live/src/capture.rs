//! Microphone capture into realtime input.
//!
//! [`AudioCapture`] pulls frames from a [`MediaSource`], re-slices them into
//! fixed-duration chunks, and sends each one as a `realtimeInput` message.
//! When the transport falls behind, the queue between the source and the
//! session is bounded by [`BackpressurePolicy`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{AudioChunk, AudioFormat};
use crate::error::{Error, Result};
use crate::events::LogRecord;
use crate::session::Session;

/// A live audio input.
#[async_trait]
pub trait MediaSource: Send {
    /// Returns the next captured frame, or `None` when the device is done.
    ///
    /// Must be cancel-safe.
    async fn next_frame(&mut self) -> Option<Result<AudioChunk>>;

    /// Releases the device.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A source fed through a channel, e.g. from a device callback thread.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<AudioChunk>,
}

impl ChannelSource {
    /// Creates a source and the sender that feeds it.
    pub fn new(capacity: usize) -> (mpsc::Sender<AudioChunk>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl MediaSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<AudioChunk>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// What to do when chunks arrive faster than the session drains them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Keep reading the source and discard the oldest queued chunk.
    #[default]
    DropOldest,
    /// Stop reading the source until the queue has room. Bytes already
    /// read wait in the chunker; nothing is discarded.
    Pause,
}

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Format the source must deliver.
    pub format: AudioFormat,
    /// Duration of each outbound chunk.
    pub chunk_duration: Duration,
    /// Chunks held while the transport is behind.
    pub queue_capacity: usize,
    /// Outbound frames allowed in the session queue before capture holds
    /// back.
    pub max_in_flight: usize,
    pub policy: BackpressurePolicy,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: AudioFormat::input(),
            chunk_duration: Duration::from_millis(40),
            queue_capacity: 8,
            max_in_flight: 4,
            policy: BackpressurePolicy::default(),
        }
    }
}

impl CaptureOptions {
    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chunk_duration(mut self, duration: Duration) -> Self {
        self.chunk_duration = duration;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_in_flight(mut self, frames: usize) -> Self {
        self.max_in_flight = frames;
        self
    }

    fn validate(&self) -> Result<usize> {
        let chunk_bytes = self.format.bytes_in_duration(self.chunk_duration);
        if chunk_bytes == 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk duration {:?} holds no {} frames",
                self.chunk_duration, self.format
            )));
        }
        if self.queue_capacity == 0 || self.max_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "queue_capacity and max_in_flight must be positive".into(),
            ));
        }
        Ok(chunk_bytes)
    }
}

/// Live capture counters.
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// A point-in-time copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureCounters {
    /// Chunks cut from source frames.
    pub captured: u64,
    /// Chunks handed to the session.
    pub sent: u64,
    /// Chunks discarded by backpressure or because the session was down.
    pub dropped: u64,
    /// Source or format errors.
    pub errors: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            captured: self.captured.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Re-slices arbitrary frames into fixed-size chunks.
#[derive(Debug)]
struct Chunker {
    format: AudioFormat,
    chunk_bytes: usize,
    pending: BytesMut,
}

impl Chunker {
    fn new(format: AudioFormat, chunk_bytes: usize) -> Self {
        Self {
            format,
            chunk_bytes,
            pending: BytesMut::with_capacity(chunk_bytes * 2),
        }
    }

    /// Appends a source frame to the pending bytes.
    fn push(&mut self, frame: &AudioChunk) -> Result<()> {
        if frame.format() != self.format {
            return Err(Error::audio(format!(
                "source delivered {}, capture expects {}",
                frame.format(),
                self.format
            )));
        }
        self.pending.extend_from_slice(frame.data());
        Ok(())
    }

    /// Whether a full chunk is pending.
    fn has_chunk(&self) -> bool {
        self.pending.len() >= self.chunk_bytes
    }

    /// Cuts the next full chunk, if one is pending.
    fn next_chunk(&mut self) -> Option<AudioChunk> {
        if !self.has_chunk() {
            return None;
        }
        let data = self.pending.split_to(self.chunk_bytes).freeze();
        AudioChunk::new(self.format, data).ok()
    }

    /// Returns the trailing partial chunk, if any.
    fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        AudioChunk::new(self.format, self.pending.split().freeze()).ok()
    }
}

/// A running capture task.
///
/// Dropping the handle stops capture without waiting for the source to be
/// released; use [`stop`](Self::stop) to wait.
pub struct AudioCapture {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
}

impl AudioCapture {
    /// Starts streaming `source` into `session`.
    ///
    /// The session does not need to be connected yet; chunks produced while
    /// it is not active are dropped and counted, and streaming resumes once
    /// it is.
    pub fn start<S>(session: &Session, source: S, options: CaptureOptions) -> Result<Self>
    where
        S: MediaSource + 'static,
    {
        let chunk_bytes = options.validate()?;
        let cancel = CancellationToken::new();
        let stats = Arc::new(CaptureStats::default());

        let worker = Worker {
            session: session.clone(),
            source: Box::new(source),
            chunker: Chunker::new(options.format, chunk_bytes),
            queue: VecDeque::with_capacity(options.queue_capacity),
            options,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(worker.run(cancel.clone()));

        Ok(Self {
            cancel,
            handle: Some(handle),
            stats,
        })
    }

    /// Stops capture and waits until the source has been released.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> CaptureCounters {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    session: Session,
    source: Box<dyn MediaSource>,
    chunker: Chunker,
    queue: VecDeque<AudioChunk>,
    options: CaptureOptions,
    stats: Arc<CaptureStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Open,
    Ended,
    Failed,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let drained = self.session.drain_notifier();
        let mut state = SourceState::Open;

        loop {
            self.pump(state == SourceState::Ended);
            if state != SourceState::Open && self.queue.is_empty() && !self.chunker.has_chunk() {
                break;
            }

            let paused = self.options.policy == BackpressurePolicy::Pause && self.queue_full();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = drained.notified(), if !self.queue.is_empty() => {}

                frame = self.source.next_frame(), if !paused && state == SourceState::Open => match frame {
                    Some(Ok(frame)) => self.accept(&frame),
                    Some(Err(e)) => {
                        CaptureStats::inc(&self.stats.errors);
                        self.session
                            .log(LogRecord::error("capture", format!("source failed: {}", e)));
                        state = SourceState::Failed;
                    }
                    None => {
                        debug!("capture source finished");
                        state = SourceState::Ended;
                    }
                },
            }
        }

        if let Err(e) = self.source.close().await {
            self.session
                .log(LogRecord::warn("capture", format!("closing source: {}", e)));
        }
        debug!("capture stopped: {:?}", self.stats.snapshot());
    }

    fn accept(&mut self, frame: &AudioChunk) {
        if let Err(e) = self.chunker.push(frame) {
            CaptureStats::inc(&self.stats.errors);
            self.session
                .log(LogRecord::warn("capture", format!("frame dropped: {}", e)));
        }
    }

    /// Cuts and forwards until the session has no room or nothing is left.
    fn pump(&mut self, with_tail: bool) {
        loop {
            self.cut(with_tail);
            if self.forward() == 0 {
                break;
            }
        }
    }

    fn queue_full(&self) -> bool {
        self.queue.len() >= self.options.queue_capacity
    }

    /// Moves pending bytes into the queue. Under [`BackpressurePolicy::Pause`]
    /// surplus bytes stay in the chunker until the queue has room.
    fn cut(&mut self, with_tail: bool) {
        let pause = self.options.policy == BackpressurePolicy::Pause;
        while !(pause && self.queue_full()) {
            let Some(chunk) = self.chunker.next_chunk() else {
                break;
            };
            CaptureStats::inc(&self.stats.captured);
            self.enqueue(chunk);
        }
        if with_tail && !self.chunker.has_chunk() && !(pause && self.queue_full()) {
            if let Some(rest) = self.chunker.flush() {
                CaptureStats::inc(&self.stats.captured);
                self.enqueue(rest);
            }
        }
    }

    fn enqueue(&mut self, chunk: AudioChunk) {
        if self.queue_full() {
            self.queue.pop_front();
            CaptureStats::inc(&self.stats.dropped);
        }
        self.queue.push_back(chunk);
    }

    /// Hands queued chunks to the session while it has room. Returns how
    /// many chunks left the queue.
    fn forward(&mut self) -> usize {
        let mut handed = 0;
        while !self.queue.is_empty() && self.session.outbound_backlog() < self.options.max_in_flight {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            handed += 1;
            match self.session.send_audio(&chunk) {
                Ok(()) => CaptureStats::inc(&self.stats.sent),
                Err(Error::NotConnected) => CaptureStats::inc(&self.stats.dropped),
                Err(e) => {
                    warn!("capture chunk dropped: {}", e);
                    CaptureStats::inc(&self.stats.dropped);
                }
            }
        }
        handed
    }
}
