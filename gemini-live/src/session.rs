//! Live session: transport ownership, state and outbound sends.
//!
//! A [`Session`] is a cheap handle; clones share one live connection. Each
//! connection attempt gets a generation number, and the read and write
//! loops of a superseded generation cannot affect the current one.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioChunk, AudioFormat};
use crate::client::ClientSettings;
use crate::error::{Error, Result};
use crate::events::{
    Channel, CloseInfo, CloseReason, Event, EventBus, EventStream, LogRecord, SubscriptionId,
};
use crate::message::{ClientMessage, decode_all, encode, truncate_for_log};
use crate::playback::{AudioPlayer, AudioSink, ScheduledChunk};
use crate::state::{Effect, ModelTurn, SessionState, SessionStatus};
use crate::tools::{InvocationStatus, ToolInvocation};
use crate::transport::{Frame, FrameSink, FrameSource};
use crate::types::{
    Blob, Configuration, FunctionResponse, MIME_IMAGE_JPEG, MIME_IMAGE_PNG, Part, ToolCall,
};

/// How long `disconnect` waits for the transport to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a live session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    settings: Arc<ClientSettings>,
    bus: Arc<EventBus>,
    shared: Mutex<Shared>,
    player: Mutex<AudioPlayer>,
    generation: AtomicU64,
    drained: Arc<Notify>,
}

struct Shared {
    state: SessionState,
    link: Option<Link>,
}

/// The attached transport of one connection attempt.
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    backlog: Arc<AtomicUsize>,
    cancel: CancellationToken,
    setup_tx: Option<oneshot::Sender<Result<()>>>,
    write: Option<JoinHandle<()>>,
}

impl Link {
    fn enqueue(&self, frame: Frame) -> Result<()> {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        self.outbound.send(frame).map_err(|_| {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            Error::NotConnected
        })
    }
}

impl Session {
    pub(crate) fn new(settings: Arc<ClientSettings>, sink: Box<dyn AudioSink>) -> Self {
        let player = AudioPlayer::new(sink, settings.clock.clone(), settings.playback_lead);
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                settings,
                bus: Arc::new(EventBus::new()),
                shared: Mutex::new(Shared {
                    state: SessionState::new(),
                    link: None,
                }),
                player: Mutex::new(player),
                generation: AtomicU64::new(0),
                drained: Arc::new(Notify::new()),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the transport, sends `setup` and waits for `setupComplete`.
    ///
    /// Fails with [`Error::AlreadyConnected`] if a connection is live,
    /// [`Error::Connection`] if the transport cannot be established,
    /// [`Error::Timeout`] if either step takes too long, and
    /// [`Error::SessionClosed`] if `disconnect` is called meanwhile.
    pub async fn connect(&self, config: Configuration) -> Result<()> {
        let inner = &self.inner;
        let setup = encode(&ClientMessage::Setup(config.clone()))?;

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (setup_tx, setup_rx) = oneshot::channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        {
            let mut shared = inner.shared.lock();
            shared.state.begin_connect(config)?;
            let link = Link {
                generation,
                outbound,
                backlog: backlog.clone(),
                cancel: cancel.clone(),
                setup_tx: Some(setup_tx),
                write: None,
            };
            // setup is always the first frame on the wire
            link.enqueue(setup)?;
            shared.link = Some(link);
        }

        let settings = &inner.settings;
        debug!(session = %inner.id, "Connecting to: {}", settings.endpoint.url);

        let dial = tokio::time::timeout(
            settings.connect_timeout,
            settings.dialer.dial(&settings.endpoint),
        );
        let (mut sink, source) = tokio::select! {
            biased;
            dialed = dial => match dialed {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    inner.teardown(generation, CloseInfo::transport(e.to_string()));
                    return Err(e);
                }
                Err(_) => {
                    let msg = format!("connect timed out after {:?}", settings.connect_timeout);
                    inner.teardown(generation, CloseInfo::transport(msg.clone()));
                    return Err(Error::Timeout(msg));
                }
            },
            _ = cancel.cancelled() => return Err(Error::SessionClosed),
        };

        // disconnect may have ended this generation while the dial finished
        if !inner.is_live(generation) {
            let _ = sink.close().await;
            return Err(Error::SessionClosed);
        }
        inner.emit(Event::Open);

        let write = tokio::spawn(write_loop(
            Arc::downgrade(inner),
            generation,
            sink,
            outbound_rx,
            backlog,
            cancel.clone(),
            settings.outbound_delay,
            inner.drained.clone(),
        ));
        tokio::spawn(read_loop(
            Arc::downgrade(inner),
            generation,
            source,
            cancel.clone(),
        ));
        if let Some(link) = inner.shared.lock().link.as_mut() {
            if link.generation == generation {
                link.write = Some(write);
            }
        }

        tokio::select! {
            acked = setup_rx => acked.unwrap_or(Err(Error::SessionClosed)),
            _ = tokio::time::sleep(settings.setup_timeout) => {
                inner.teardown(generation, CloseInfo::setup_timeout());
                Err(Error::Timeout(format!(
                    "no setupComplete after {:?}",
                    settings.setup_timeout
                )))
            }
        }
    }

    /// Closes the session. Idempotent.
    ///
    /// Frames still queued are discarded, pending tool invocations are
    /// cancelled, and a suspended `connect` fails.
    pub async fn disconnect(&self) {
        let generation = {
            let mut shared = self.inner.shared.lock();
            let Some(generation) = shared.link.as_ref().map(|l| l.generation) else {
                return;
            };
            shared.state.begin_close();
            generation
        };
        if let Some(write) = self.inner.teardown(generation, CloseInfo::client()) {
            if tokio::time::timeout(CLOSE_TIMEOUT, write).await.is_err() {
                warn!(session = %self.inner.id, "timed out closing transport");
            }
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Sends one user turn.
    pub fn send_text(&self, parts: Vec<Part>, turn_complete: bool) -> Result<()> {
        self.send(&ClientMessage::ClientContent {
            parts,
            turn_complete,
        })
    }

    /// Streams one media chunk. Never waits.
    pub fn send_realtime_chunk(
        &self,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.send(&ClientMessage::RealtimeInput(Blob::new(mime_type, data)))
    }

    /// Streams one PCM chunk with its rate-qualified mime type.
    pub fn send_audio(&self, chunk: &AudioChunk) -> Result<()> {
        self.send(&ClientMessage::RealtimeInput(Blob::from_audio(chunk)))
    }

    /// Streams one video frame as a JPEG image.
    pub fn send_video_frame(&self, jpeg: impl Into<Bytes>) -> Result<()> {
        self.send_image(MIME_IMAGE_JPEG, jpeg)
    }

    /// Streams one still image. Only JPEG and PNG are accepted.
    pub fn send_image(&self, mime_type: &str, data: impl Into<Bytes>) -> Result<()> {
        if mime_type != MIME_IMAGE_JPEG && mime_type != MIME_IMAGE_PNG {
            return Err(Error::InvalidConfig(format!(
                "unsupported image type {}",
                mime_type
            )));
        }
        self.send(&ClientMessage::RealtimeInput(Blob::new(mime_type, data)))
    }

    /// Answers a batch of tool invocations.
    ///
    /// Answers for cancelled invocations are dropped; if nothing is left the
    /// call is a no-op. Unknown or already answered ids fail the whole batch
    /// with [`Error::UnknownInvocation`] and nothing is sent.
    pub fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        let accepted = match shared.state.tools().prepare_response(&responses) {
            Ok(accepted) => accepted,
            Err(e) => {
                drop(shared);
                self.inner
                    .log(LogRecord::warn("client.toolResponse", e.to_string()));
                return Err(e);
            }
        };
        if accepted.is_empty() {
            return Ok(());
        }

        shared.state.ensure_active()?;
        let frame = encode(&ClientMessage::ToolResponse(accepted.clone()))?;
        let link = shared.link.as_ref().ok_or(Error::NotConnected)?;
        link.enqueue(frame)?;
        shared.state.tools_mut().mark_answered(&accepted);
        Ok(())
    }

    /// Answers a single invocation.
    pub fn respond(&self, id: impl Into<String>, response: serde_json::Value) -> Result<()> {
        self.send_tool_response(vec![FunctionResponse::new(id, response)])
    }

    fn send(&self, msg: &ClientMessage) -> Result<()> {
        let frame = encode(msg)?;
        let shared = self.inner.shared.lock();
        shared.state.ensure_active()?;
        let link = shared.link.as_ref().ok_or(Error::NotConnected)?;
        if let Frame::Text(text) = &frame {
            match msg {
                ClientMessage::RealtimeInput(_) => trace!("Sending: {}", truncate_for_log(text, 200)),
                _ => debug!("Sending: {}", truncate_for_log(text, 500)),
            }
        }
        link.enqueue(frame)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Registers `handler` on `channel`.
    pub fn subscribe<F>(&self, channel: Channel, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(channel, handler)
    }

    /// Removes a handler. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(subscription)
    }

    /// Registers a callback invoked once per `toolCall` batch.
    pub fn on_tool_call<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ToolCall) + Send + Sync + 'static,
    {
        self.subscribe(Channel::ToolCall, move |event| {
            if let Event::ToolCall(call) = event {
                handler(call);
            }
        })
    }

    /// Streams events from every channel.
    pub fn events(&self) -> EventStream {
        self.events_on(&Channel::ALL)
    }

    /// Streams events from the given channels.
    pub fn events_on(&self, channels: &[Channel]) -> EventStream {
        EventStream::new(self.inner.bus.clone(), channels)
    }

    /// Publishes a diagnostic on the `log` channel.
    pub(crate) fn log(&self, record: LogRecord) {
        self.inner.log(record);
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.shared.lock().state.status()
    }

    pub fn model_turn(&self) -> ModelTurn {
        self.inner.shared.lock().state.model_turn()
    }

    pub fn turn_id(&self) -> u64 {
        self.inner.shared.lock().state.turn_id()
    }

    /// Configuration of the current or last connection.
    pub fn configuration(&self) -> Option<Configuration> {
        self.inner.shared.lock().state.configuration().cloned()
    }

    /// How the last connection ended.
    pub fn last_close(&self) -> Option<CloseInfo> {
        self.inner.shared.lock().state.last_close().cloned()
    }

    pub fn invocation_status(&self, id: &str) -> Option<InvocationStatus> {
        self.inner.shared.lock().state.invocation_status(id)
    }

    pub fn pending_invocations(&self) -> Vec<ToolInvocation> {
        self.inner.shared.lock().state.pending_invocations()
    }

    /// Frames queued but not yet written to the transport.
    pub fn outbound_backlog(&self) -> usize {
        self.inner
            .shared
            .lock()
            .link
            .as_ref()
            .map_or(0, |l| l.backlog.load(Ordering::SeqCst))
    }

    /// Notified each time the write loop finishes a frame, and on close.
    pub fn drain_notifier(&self) -> Arc<Notify> {
        self.inner.drained.clone()
    }

    /// Replaces the playback sink.
    pub fn set_audio_sink(&self, sink: Box<dyn AudioSink>) {
        self.inner.player.lock().set_sink(sink);
    }

    /// Playback windows that have not finished yet.
    pub fn playback_schedule(&self) -> Vec<ScheduledChunk> {
        self.inner.player.lock().schedule()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: Event) {
        if let Event::Log(record) = &event {
            record.trace();
        }
        self.bus.publish(&event);
    }

    fn log(&self, record: LogRecord) {
        self.emit(Event::Log(record));
    }

    fn is_live(&self, generation: u64) -> bool {
        Self::is_current(&self.shared.lock(), generation)
    }

    fn is_current(shared: &Shared, generation: u64) -> bool {
        shared
            .link
            .as_ref()
            .is_some_and(|l| l.generation == generation)
    }

    /// Decodes and applies one inbound frame. Returns false once the
    /// generation is over.
    fn on_frame(&self, generation: u64, frame: Frame) -> bool {
        if let Frame::Text(text) = &frame {
            debug!("Received: {}", truncate_for_log(text, 500));
        }
        let msgs = match decode_all(&frame) {
            Ok(msgs) => msgs,
            Err(e) => {
                self.log(LogRecord::warn("codec", format!("frame dropped: {}", e)));
                return true;
            }
        };

        let effects: Vec<Effect> = {
            let mut shared = self.shared.lock();
            if !Self::is_current(&shared, generation) {
                return false;
            }
            msgs.into_iter()
                .flat_map(|msg| shared.state.apply(msg))
                .collect()
        };
        self.run_effects(generation, effects)
    }

    fn run_effects(&self, generation: u64, effects: Vec<Effect>) -> bool {
        let mut alive = true;
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.emit(event),
                Effect::Play { turn, blob } => self.play(turn, blob),
                Effect::InterruptPlayback => {
                    let dropped = self.player.lock().interrupt();
                    debug!(session = %self.id, "interrupted, dropped {} scheduled chunks", dropped);
                }
                Effect::SetupAcked => {
                    let tx = {
                        let mut shared = self.shared.lock();
                        shared
                            .link
                            .as_mut()
                            .filter(|l| l.generation == generation)
                            .and_then(|l| l.setup_tx.take())
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(Ok(()));
                    }
                }
                Effect::Close(info) => {
                    self.teardown(generation, info);
                    alive = false;
                }
            }
        }
        alive
    }

    fn play(&self, turn: u64, blob: Blob) {
        let Some(format) = AudioFormat::from_mime_type(&blob.mime_type) else {
            self.log(LogRecord::warn(
                "playback",
                format!("unsupported audio type {}", blob.mime_type),
            ));
            return;
        };
        let chunk = match AudioChunk::new(format, blob.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.log(LogRecord::warn("playback", format!("chunk dropped: {}", e)));
                return;
            }
        };

        self.emit(Event::Audio(chunk.clone()));
        let scheduled = self.player.lock().enqueue(turn, &chunk);
        if let Err(e) = scheduled {
            self.log(LogRecord::warn("playback", format!("chunk dropped: {}", e)));
        }
    }

    /// Ends `generation`. Returns the write loop handle if this call did the
    /// teardown.
    fn teardown(&self, generation: u64, info: CloseInfo) -> Option<JoinHandle<()>> {
        let (mut link, effects) = {
            let mut shared = self.shared.lock();
            if !Self::is_current(&shared, generation) {
                return None;
            }
            let link = shared.link.take()?;
            (link, shared.state.finish_close(info.clone()))
        };

        link.cancel.cancel();
        if let Some(tx) = link.setup_tx.take() {
            let err = match info.reason {
                CloseReason::ClientRequested => Error::SessionClosed,
                CloseReason::SetupTimeout => Error::Timeout(info.message.clone()),
                _ => Error::connection(info.message.clone()),
            };
            let _ = tx.send(Err(err));
        }
        self.player.lock().interrupt();
        self.drained.notify_one();

        match info.reason {
            CloseReason::TransportError => {
                error!(session = %self.id, "connection lost: {}", info.message)
            }
            CloseReason::ServerClosed => {
                info!(session = %self.id, code = ?info.code, "closed by server: {}", info.message)
            }
            _ => debug!(session = %self.id, "closed: {}", info.message),
        }

        for effect in effects {
            if let Effect::Emit(event) = effect {
                self.emit(event);
            }
        }
        link.write.take()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.shared.get_mut().link.take() {
            link.cancel.cancel();
        }
    }
}

// ============================================================================
// Transport loops
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    backlog: Arc<AtomicUsize>,
    cancel: CancellationToken,
    delay: Duration,
    drained: Arc<Notify>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let result = sink.send(frame).await;
        backlog.fetch_sub(1, Ordering::SeqCst);
        drained.notify_one();

        if let Err(e) = result {
            error!("Write error: {}", e);
            if let Some(inner) = inner.upgrade() {
                inner.teardown(generation, CloseInfo::transport(e.to_string()));
            }
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Close error: {}", e);
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut source: Box<dyn FrameSource>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = source.next_frame() => next,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match next {
            Some(Ok(frame)) => {
                if !inner.on_frame(generation, frame) {
                    return;
                }
            }
            Some(Err(e)) => {
                error!("Read error: {}", e);
                inner.teardown(generation, CloseInfo::transport(e.to_string()));
                return;
            }
            None => {
                inner.teardown(generation, CloseInfo::transport("connection lost"));
                return;
            }
        }
    }
}
