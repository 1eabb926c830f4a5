//! Tool-call bookkeeping.
//!
//! The model requests invocations in `toolCall` batches and the caller
//! answers them whenever it likes, in any order. The correlator only tracks
//! which ids are still owed an answer.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{FunctionCall, FunctionResponse, ToolCall};

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Answered,
    Cancelled,
}

/// A pending invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
    pub status: InvocationStatus,
}

impl From<&FunctionCall> for ToolInvocation {
    fn from(call: &FunctionCall) -> Self {
        Self {
            id: call.id.clone(),
            function_name: call.name.clone(),
            arguments: call.args.clone(),
            status: InvocationStatus::Pending,
        }
    }
}

/// Tracks invocation ids for one session.
///
/// Pending invocations are held in full; once resolved only the id and its
/// final status are kept, so late answers can be told apart from unknown
/// ids.
#[derive(Debug, Default)]
pub struct ToolCorrelator {
    pending: HashMap<String, ToolInvocation>,
    resolved: HashMap<String, InvocationStatus>,
}

impl ToolCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every invocation in the batch `Pending`.
    pub fn register(&mut self, call: &ToolCall) {
        for fc in &call.function_calls {
            if self.pending.contains_key(&fc.id) {
                warn!("duplicate pending invocation id {}, keeping first", fc.id);
                continue;
            }
            self.resolved.remove(&fc.id);
            debug!("tool call pending: {} ({})", fc.id, fc.name);
            self.pending.insert(fc.id.clone(), ToolInvocation::from(fc));
        }
    }

    /// Validates a response batch before it is sent.
    ///
    /// Answers for cancelled ids are dropped silently. Unknown,
    /// already-answered and repeated ids fail the whole batch with
    /// [`Error::UnknownInvocation`]. State is never changed here; call
    /// [`mark_answered`](Self::mark_answered) once the batch is queued.
    pub fn prepare_response(&self, responses: &[FunctionResponse]) -> Result<Vec<FunctionResponse>> {
        let mut seen = HashSet::new();
        let mut unknown = Vec::new();
        let mut accepted = Vec::with_capacity(responses.len());

        for response in responses {
            if !seen.insert(response.id.as_str()) {
                unknown.push(response.id.clone());
                continue;
            }
            if self.pending.contains_key(&response.id) {
                accepted.push(response.clone());
                continue;
            }
            match self.resolved.get(&response.id) {
                Some(InvocationStatus::Cancelled) => {
                    debug!("ignoring response for cancelled invocation {}", response.id);
                }
                _ => unknown.push(response.id.clone()),
            }
        }

        if !unknown.is_empty() {
            return Err(Error::UnknownInvocation(unknown));
        }
        Ok(accepted)
    }

    /// Moves the ids from `Pending` to `Answered`.
    pub fn mark_answered(&mut self, responses: &[FunctionResponse]) {
        for response in responses {
            if self.pending.remove(&response.id).is_some() {
                self.resolved
                    .insert(response.id.clone(), InvocationStatus::Answered);
            }
        }
    }

    /// Cancels the listed ids. Returns the ids that were pending.
    pub fn cancel(&mut self, ids: &[String]) -> Vec<String> {
        let mut cancelled = Vec::new();
        for id in ids {
            if self.pending.remove(id).is_some() {
                self.resolved.insert(id.clone(), InvocationStatus::Cancelled);
                cancelled.push(id.clone());
            }
        }
        cancelled
    }

    /// Cancels everything still pending. Returns the cancelled ids.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.pending.drain().map(|(id, _)| id).collect();
        for id in &ids {
            self.resolved.insert(id.clone(), InvocationStatus::Cancelled);
        }
        ids
    }

    pub fn status(&self, id: &str) -> Option<InvocationStatus> {
        if self.pending.contains_key(id) {
            return Some(InvocationStatus::Pending);
        }
        self.resolved.get(id).copied()
    }

    /// Pending invocations, in no particular order.
    pub fn pending(&self) -> Vec<ToolInvocation> {
        self.pending.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forgets resolved ids. Pending ones survive.
    pub fn reset(&mut self) {
        self.resolved.clear();
    }
}
