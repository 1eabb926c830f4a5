//! Playback scheduling for model audio.
//!
//! The scheduler keeps a "next playable time" cursor so inbound chunks queue
//! back to back. Times are offsets from the player's [`Clock`] origin.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::audio::AudioChunk;
use crate::error::Result;

// ============================================================================
// Clock
// ============================================================================

/// Monotonic time source for playback.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Clock backed by [`tokio::time::Instant`], so paused test time applies.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Output device seam.
///
/// Called with the player lock held, never the session state lock. A sink
/// may query or send on its session but must not block, and must not call
/// back into playback (`set_audio_sink`, `playback_schedule`).
pub trait AudioSink: Send {
    /// Queues `chunk` to start playing at `at`.
    fn schedule(&mut self, at: Duration, chunk: &AudioChunk) -> Result<()>;

    /// Silences everything queued to play after `now`.
    fn cancel(&mut self, now: Duration);
}

/// Sink that discards audio.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn schedule(&mut self, _at: Duration, _chunk: &AudioChunk) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self, _now: Duration) {}
}

// ============================================================================
// Scheduler
// ============================================================================

/// A chunk's playback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub turn: u64,
    pub start: Duration,
    pub end: Duration,
}

/// Gap-free playback cursor.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: Duration,
    lead: Duration,
    scheduled: VecDeque<ScheduledChunk>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the first chunk after an idle period by `lead`.
    pub fn with_lead(lead: Duration) -> Self {
        Self {
            lead,
            ..Default::default()
        }
    }

    /// End of the last scheduled chunk.
    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    /// Windows not yet finished, in start order.
    pub fn scheduled(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.scheduled.iter()
    }

    /// Places a chunk of `duration` right after the previous one, or at
    /// `now + lead` if playback has run dry.
    pub fn schedule(&mut self, now: Duration, turn: u64, duration: Duration) -> ScheduledChunk {
        self.prune(now);
        let start = if self.cursor <= now {
            now + self.lead
        } else {
            self.cursor
        };
        let entry = ScheduledChunk {
            turn,
            start,
            end: start + duration,
        };
        self.cursor = entry.end;
        self.scheduled.push_back(entry);
        entry
    }

    /// Undoes the most recent [`schedule`](Self::schedule).
    pub fn rollback(&mut self, entry: &ScheduledChunk) {
        if self.scheduled.back() == Some(entry) {
            self.scheduled.pop_back();
            self.cursor = self.scheduled.back().map_or(Duration::ZERO, |c| c.end);
        }
    }

    /// Discards every window still playing or yet to play and resets the
    /// cursor to `now`. Returns the number of windows discarded.
    pub fn interrupt(&mut self, now: Duration) -> usize {
        self.prune(now);
        let dropped = self.scheduled.len();
        self.scheduled.clear();
        self.cursor = now;
        dropped
    }

    /// Forgets windows that ended at or before `now`.
    pub fn prune(&mut self, now: Duration) {
        while self.scheduled.front().is_some_and(|c| c.end <= now) {
            self.scheduled.pop_front();
        }
    }
}

// ============================================================================
// Player
// ============================================================================

/// Scheduler bound to an output sink and a clock.
pub struct AudioPlayer {
    scheduler: PlaybackScheduler,
    sink: Box<dyn AudioSink>,
    clock: Arc<dyn Clock>,
}

impl AudioPlayer {
    pub fn new(sink: Box<dyn AudioSink>, clock: Arc<dyn Clock>, lead: Duration) -> Self {
        Self {
            scheduler: PlaybackScheduler::with_lead(lead),
            sink,
            clock,
        }
    }

    /// Replaces the sink. Playback already handed to the old sink is
    /// cancelled.
    pub fn set_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.interrupt();
        self.sink = sink;
    }

    /// Schedules a chunk. If the sink refuses it the chunk is dropped and
    /// the cursor is left where it was.
    pub fn enqueue(&mut self, turn: u64, chunk: &AudioChunk) -> Result<ScheduledChunk> {
        let now = self.clock.now();
        let entry = self.scheduler.schedule(now, turn, chunk.duration());
        if let Err(e) = self.sink.schedule(entry.start, chunk) {
            self.scheduler.rollback(&entry);
            return Err(e);
        }
        Ok(entry)
    }

    /// Drops all pending playback. Returns the number of windows dropped.
    pub fn interrupt(&mut self) -> usize {
        let now = self.clock.now();
        let dropped = self.scheduler.interrupt(now);
        self.sink.cancel(now);
        dropped
    }

    /// Windows not yet finished, in start order.
    pub fn schedule(&mut self) -> Vec<ScheduledChunk> {
        self.scheduler.prune(self.clock.now());
        self.scheduler.scheduled().copied().collect()
    }

    pub fn cursor(&self) -> Duration {
        self.scheduler.cursor()
    }
}

impl std::fmt::Debug for AudioPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayer")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
