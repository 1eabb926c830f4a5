//! Session events and the publish/subscribe bus.
//!
//! Every event belongs to one [`Channel`]. Handlers are invoked on the task
//! that produced the event, in production order, with no lock held, so a
//! handler may subscribe, unsubscribe or call back into the session.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::audio::AudioChunk;
use crate::transport::CloseFrame;
use crate::types::{ServerContent, ToolCall};

// ============================================================================
// Channels
// ============================================================================

/// Named event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Open,
    SetupComplete,
    Close,
    Log,
    Content,
    Audio,
    ToolCall,
    ToolCallCancellation,
    Interrupted,
    TurnComplete,
    GoAway,
}

impl Channel {
    pub const ALL: [Channel; 11] = [
        Channel::Open,
        Channel::SetupComplete,
        Channel::Close,
        Channel::Log,
        Channel::Content,
        Channel::Audio,
        Channel::ToolCall,
        Channel::ToolCallCancellation,
        Channel::Interrupted,
        Channel::TurnComplete,
        Channel::GoAway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Open => "open",
            Channel::SetupComplete => "setupcomplete",
            Channel::Close => "close",
            Channel::Log => "log",
            Channel::Content => "content",
            Channel::Audio => "audio",
            Channel::ToolCall => "toolcall",
            Channel::ToolCallCancellation => "toolcallcancellation",
            Channel::Interrupted => "interrupted",
            Channel::TurnComplete => "turncomplete",
            Channel::GoAway => "goaway",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Channel::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    ClientRequested,
    /// The service sent a close frame.
    ServerClosed,
    /// The transport failed or vanished without a close frame.
    TransportError,
    /// `setupComplete` did not arrive in time.
    SetupTimeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientRequested => "client_requested",
            CloseReason::ServerClosed => "server_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::SetupTimeout => "setup_timeout",
        }
    }
}

/// Payload of the `close` event; also kept as the session's last close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub reason: CloseReason,
    /// Websocket close code, when the peer sent one.
    pub code: Option<u16>,
    pub message: String,
    /// True if the session ended by an orderly close handshake.
    pub clean: bool,
}

impl CloseInfo {
    pub fn client() -> Self {
        Self {
            reason: CloseReason::ClientRequested,
            code: None,
            message: "client disconnected".into(),
            clean: true,
        }
    }

    pub fn server(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                reason: CloseReason::ServerClosed,
                clean: frame.code == crate::transport::CLOSE_NORMAL,
                code: Some(frame.code),
                message: frame.reason,
            },
            None => Self {
                reason: CloseReason::ServerClosed,
                code: None,
                message: String::new(),
                clean: true,
            },
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            reason: CloseReason::TransportError,
            code: None,
            message: message.into(),
            clean: false,
        }
    }

    pub fn setup_timeout() -> Self {
        Self {
            reason: CloseReason::SetupTimeout,
            code: None,
            message: "timed out waiting for setupComplete".into(),
            clean: false,
        }
    }
}

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Payload of the `log` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Dotted origin tag, e.g. `server.toolCall` or `playback`.
    pub source: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn debug(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, source, message)
    }

    pub fn info(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, source, message)
    }

    pub fn warn(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, source, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, source, message)
    }

    /// Mirrors the record into `tracing`.
    pub(crate) fn trace(&self) {
        match self.level {
            LogLevel::Debug => tracing::debug!(source = %self.source, "{}", self.message),
            LogLevel::Info => tracing::info!(source = %self.source, "{}", self.message),
            LogLevel::Warn => tracing::warn!(source = %self.source, "{}", self.message),
            LogLevel::Error => tracing::error!(source = %self.source, "{}", self.message),
        }
    }
}

/// An event published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The transport is up and `setup` has been queued.
    Open,
    SetupComplete,
    Close(CloseInfo),
    Log(LogRecord),
    /// Non-audio parts of one server content fragment.
    Content(ServerContent),
    /// One decoded chunk of model audio.
    Audio(AudioChunk),
    ToolCall(ToolCall),
    ToolCallCancellation(Vec<String>),
    Interrupted,
    TurnComplete,
    GoAway { time_left: Option<String> },
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::Open => Channel::Open,
            Event::SetupComplete => Channel::SetupComplete,
            Event::Close(_) => Channel::Close,
            Event::Log(_) => Channel::Log,
            Event::Content(_) => Channel::Content,
            Event::Audio(_) => Channel::Audio,
            Event::ToolCall(_) => Channel::ToolCall,
            Event::ToolCallCancellation(_) => Channel::ToolCallCancellation,
            Event::Interrupted => Channel::Interrupted,
            Event::TurnComplete => Channel::TurnComplete,
            Event::GoAway { .. } => Channel::GoAway,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    id: u64,
    channel: Channel,
}

impl SubscriptionId {
    pub fn channel(&self) -> Channel {
        self.channel
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Typed publish/subscribe fan-out.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<Channel, Vec<(u64, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, channel: Channel, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(channel)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionId { id, channel }
    }

    /// Removes a handler. Returns false if it was already gone.
    ///
    /// A dispatch pass already in progress still reaches the handler.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&subscription.channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        before != list.len()
    }

    /// Delivers `event` to every handler subscribed to its channel when the
    /// call began.
    pub fn publish(&self, event: &Event) {
        let snapshot: Vec<Handler> = match self.handlers.read().get(&event.channel()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.handlers.read().get(&channel).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventBus")
            .field("subscriptions", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

/// Receives events from a set of channels, in publish order.
///
/// Unsubscribes from the bus when dropped.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
}

impl EventStream {
    pub(crate) fn new(bus: Arc<EventBus>, channels: &[Channel]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = channels
            .iter()
            .map(|&channel| {
                let tx = tx.clone();
                bus.subscribe(channel, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        Self {
            rx,
            bus,
            subscriptions,
        }
    }

    /// Waits for the next event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns an already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.bus.unsubscribe(subscription);
        }
    }
}
