//! Session state machine.
//!
//! [`SessionState::apply`] consumes one decoded server message and returns
//! the effects it implies. It never performs I/O; the session runs the
//! effects after releasing its lock.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::events::{CloseInfo, Event, LogRecord};
use crate::message::{ServerMessage, truncate_for_log};
use crate::tools::{InvocationStatus, ToolCorrelator, ToolInvocation};
use crate::transport::CloseFrame;
use crate::types::{Blob, Configuration, Part, ServerContent};

/// Top-level session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    AwaitingSetupAck,
    Active,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::AwaitingSetupAck => "awaiting_setup_ack",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }

    /// True while a transport is attached.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionStatus::AwaitingSetupAck | SessionStatus::Active | SessionStatus::Closing
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the model is doing within an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelTurn {
    #[default]
    Idle,
    Responding,
    Interrupted,
}

/// Side effects of a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(Event),
    /// Schedule model audio belonging to `turn`.
    Play { turn: u64, blob: Blob },
    /// Drop all scheduled playback.
    InterruptPlayback,
    /// Resolve the pending `connect`.
    SetupAcked,
    /// Tear the transport down.
    Close(CloseInfo),
}

fn log(record: LogRecord) -> Effect {
    Effect::Emit(Event::Log(record))
}

/// Mutable session state, guarded by the session lock.
#[derive(Debug, Default)]
pub struct SessionState {
    status: SessionStatus,
    model_turn: ModelTurn,
    turn_id: u64,
    config: Option<Configuration>,
    tools: ToolCorrelator,
    last_close: Option<CloseInfo>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn model_turn(&self) -> ModelTurn {
        self.model_turn
    }

    /// Identifier of the current (or last) model turn. Starts at 0 and
    /// increases by one each time the model starts responding.
    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.config.as_ref()
    }

    pub fn last_close(&self) -> Option<&CloseInfo> {
        self.last_close.as_ref()
    }

    pub fn invocation_status(&self, id: &str) -> Option<InvocationStatus> {
        self.tools.status(id)
    }

    pub fn pending_invocations(&self) -> Vec<ToolInvocation> {
        self.tools.pending()
    }

    pub fn tools(&self) -> &ToolCorrelator {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolCorrelator {
        &mut self.tools
    }

    /// Starts a new session with `config`.
    ///
    /// Fails with [`Error::AlreadyConnected`] unless the state is idle or
    /// closed; configuration cannot be replaced on a live session.
    pub fn begin_connect(&mut self, config: Configuration) -> Result<()> {
        match self.status {
            SessionStatus::Idle | SessionStatus::Closed => {}
            _ => return Err(Error::AlreadyConnected),
        }
        self.status = SessionStatus::AwaitingSetupAck;
        self.model_turn = ModelTurn::Idle;
        self.config = Some(config);
        self.tools.reset();
        Ok(())
    }

    /// Returns `Ok` if sends are accepted.
    pub fn ensure_active(&self) -> Result<()> {
        if self.status == SessionStatus::Active {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Applies one inbound message.
    pub fn apply(&mut self, msg: ServerMessage) -> Vec<Effect> {
        let kind = msg.kind();
        match self.status {
            SessionStatus::AwaitingSetupAck => match msg {
                ServerMessage::SetupComplete => {
                    self.status = SessionStatus::Active;
                    vec![Effect::SetupAcked, Effect::Emit(Event::SetupComplete)]
                }
                ServerMessage::Close(frame) => self.closed_by_server(frame),
                _ => vec![log(LogRecord::warn(
                    format!("server.{}", kind),
                    "rejected: received before setupComplete",
                ))],
            },
            SessionStatus::Active => self.apply_active(msg),
            _ => {
                debug!("ignoring {} in state {}", kind, self.status);
                Vec::new()
            }
        }
    }

    fn apply_active(&mut self, msg: ServerMessage) -> Vec<Effect> {
        match msg {
            ServerMessage::SetupComplete => vec![log(LogRecord::warn(
                "server.setupComplete",
                "duplicate setupComplete ignored",
            ))],
            ServerMessage::ServerContent(content) => self.apply_content(content),
            ServerMessage::ToolCall(call) => {
                self.tools.register(&call);
                vec![Effect::Emit(Event::ToolCall(call))]
            }
            ServerMessage::ToolCallCancellation(ids) => {
                let cancelled = self.tools.cancel(&ids);
                debug!("cancelled {} of {} invocations", cancelled.len(), ids.len());
                vec![Effect::Emit(Event::ToolCallCancellation(ids))]
            }
            ServerMessage::GoAway { time_left } => vec![
                log(LogRecord::warn(
                    "server.goAway",
                    format!(
                        "server closing soon, time left: {}",
                        time_left.as_deref().unwrap_or("unknown")
                    ),
                )),
                Effect::Emit(Event::GoAway { time_left }),
            ],
            ServerMessage::UsageMetadata(usage) => vec![log(LogRecord::debug(
                "server.usageMetadata",
                truncate_for_log(&usage.to_string(), 200),
            ))],
            ServerMessage::Close(frame) => self.closed_by_server(frame),
        }
    }

    fn apply_content(&mut self, content: ServerContent) -> Vec<Effect> {
        let mut effects = Vec::new();

        if content.interrupted {
            self.model_turn = ModelTurn::Interrupted;
            effects.push(Effect::InterruptPlayback);
            effects.push(Effect::Emit(Event::Interrupted));
        }

        if !content.parts.is_empty() {
            if self.model_turn != ModelTurn::Responding {
                self.turn_id += 1;
                self.model_turn = ModelTurn::Responding;
            }

            let (audio, other): (Vec<Part>, Vec<Part>) =
                content.parts.into_iter().partition(Part::is_audio);

            if !other.is_empty() {
                effects.push(Effect::Emit(Event::Content(ServerContent {
                    parts: other,
                    interrupted: content.interrupted,
                    turn_complete: content.turn_complete,
                })));
            }
            for part in audio {
                if let Part::InlineData(blob) = part {
                    effects.push(Effect::Play {
                        turn: self.turn_id,
                        blob,
                    });
                }
            }
        }

        if content.turn_complete {
            self.model_turn = ModelTurn::Idle;
            effects.push(Effect::Emit(Event::TurnComplete));
        }
        effects
    }

    fn closed_by_server(&mut self, frame: Option<CloseFrame>) -> Vec<Effect> {
        self.status = SessionStatus::Closing;
        vec![Effect::Close(CloseInfo::server(frame))]
    }

    /// Enters `Closing`. Returns false if no session is live.
    pub fn begin_close(&mut self) -> bool {
        if !self.status.is_live() {
            return false;
        }
        self.status = SessionStatus::Closing;
        true
    }

    /// Enters `Closed`, cancelling all pending invocations.
    ///
    /// Returns no effects if the session was not live.
    pub fn finish_close(&mut self, info: CloseInfo) -> Vec<Effect> {
        if !self.status.is_live() {
            return Vec::new();
        }
        let cancelled = self.tools.cancel_all();
        self.status = SessionStatus::Closed;
        self.model_turn = ModelTurn::Idle;
        self.last_close = Some(info.clone());

        let mut effects = Vec::new();
        if !cancelled.is_empty() {
            effects.push(log(LogRecord::debug(
                "session",
                format!("cancelled pending invocations: {}", cancelled.join(", ")),
            )));
        }
        effects.push(Effect::Emit(Event::Close(info)));
        effects
    }
}
