//! Type definitions for the Gemini Live API.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::AudioChunk;

// ============================================================================
// Models
// ============================================================================

/// Gemini 2.0 Flash experimental, the original Live model.
pub const MODEL_GEMINI_2_0_FLASH_EXP: &str = "models/gemini-2.0-flash-exp";
/// Gemini 2.0 Flash Live.
pub const MODEL_GEMINI_2_0_FLASH_LIVE: &str = "models/gemini-2.0-flash-live-001";
/// Gemini Live 2.5 Flash preview.
pub const MODEL_GEMINI_LIVE_2_5_FLASH_PREVIEW: &str = "models/gemini-live-2.5-flash-preview";

// ============================================================================
// Voices
// ============================================================================

pub const VOICE_AOEDE: &str = "Aoede";
pub const VOICE_CHARON: &str = "Charon";
pub const VOICE_FENRIR: &str = "Fenrir";
pub const VOICE_KORE: &str = "Kore";
pub const VOICE_PUCK: &str = "Puck";

// ============================================================================
// Media types
// ============================================================================

pub const MIME_IMAGE_JPEG: &str = "image/jpeg";
pub const MIME_IMAGE_PNG: &str = "image/png";

// ============================================================================
// Configuration Types
// ============================================================================

/// What the model answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseModality {
    #[default]
    Text,
    Audio,
    /// Text and audio in the same turn.
    Mixed,
}

impl ResponseModality {
    /// Wire names, upper-case as the service expects.
    pub fn wire_names(&self) -> &'static [&'static str] {
        match self {
            ResponseModality::Text => &["TEXT"],
            ResponseModality::Audio => &["AUDIO"],
            ResponseModality::Mixed => &["TEXT", "AUDIO"],
        }
    }

    /// Parses wire names, case-insensitively.
    pub fn from_wire_names<S: AsRef<str>>(names: &[S]) -> Option<Self> {
        let mut text = false;
        let mut audio = false;
        for name in names {
            match name.as_ref().to_ascii_uppercase().as_str() {
                "TEXT" => text = true,
                "AUDIO" => audio = true,
                _ => return None,
            }
        }
        match (text, audio) {
            (true, true) => Some(ResponseModality::Mixed),
            (true, false) => Some(ResponseModality::Text),
            (false, true) => Some(ResponseModality::Audio),
            (false, false) => None,
        }
    }
}

impl fmt::Display for ResponseModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseModality::Text => write!(f, "text"),
            ResponseModality::Audio => write!(f, "audio"),
            ResponseModality::Mixed => write!(f, "mixed"),
        }
    }
}

/// Voice selection for audio responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechConfig {
    /// Name of a prebuilt voice, e.g. [`VOICE_AOEDE`].
    pub voice_name: String,
}

impl SpeechConfig {
    pub fn voice(name: impl Into<String>) -> Self {
        Self {
            voice_name: name.into(),
        }
    }
}

/// A user-declared function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON schema of the arguments object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: serde_json::Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

/// A capability declared to the model at setup.
#[derive(Debug, Clone, PartialEq)]
pub enum Tool {
    /// Builtin grounding with Google Search.
    GoogleSearch,
    /// Builtin code execution.
    CodeExecution,
    /// A group of user-declared functions.
    Functions(Vec<FunctionDeclaration>),
}

/// Session configuration, sent once as the `setup` message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    /// Model identifier, sent verbatim (e.g. `models/gemini-2.0-flash-exp`).
    pub model: String,
    pub response_modalities: ResponseModality,
    pub speech_config: Option<SpeechConfig>,
    pub max_output_tokens: Option<u32>,
    pub system_instruction: Option<String>,
    pub tools: Vec<Tool>,
}

impl Configuration {
    /// Creates a text-only configuration for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_modalities(mut self, modalities: ResponseModality) -> Self {
        self.response_modalities = modalities;
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.speech_config = Some(SpeechConfig::voice(voice));
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(text.into());
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Names of all declared functions, in declaration order.
    pub fn function_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter_map(|t| match t {
                Tool::Functions(decls) => Some(decls),
                _ => None,
            })
            .flatten()
            .map(|d| d.name.as_str())
            .collect()
    }
}

// ============================================================================
// Content Types
// ============================================================================

/// Inline binary media with its mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime_type: String,
    pub data: Bytes,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Wraps a PCM chunk with its rate-qualified mime type.
    pub fn from_audio(chunk: &AudioChunk) -> Self {
        Self {
            mime_type: chunk.format().mime_type(),
            data: chunk.data().clone(),
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// One element of a content turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    InlineData(Blob),
    ExecutableCode { language: String, code: String },
    CodeExecutionResult { outcome: String, output: String },
    /// A part shape this client does not model, kept verbatim.
    Other(serde_json::Value),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Returns true for inline audio, which is routed to playback.
    pub fn is_audio(&self) -> bool {
        matches!(self, Part::InlineData(blob) if blob.is_audio())
    }
}

/// Model output for one server turn fragment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerContent {
    pub parts: Vec<Part>,
    /// The service abandoned its turn because the user spoke over it.
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl ServerContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A batch of invocations carried by one `toolCall` message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

/// The result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub response: serde_json::Value,
}

impl FunctionResponse {
    pub fn new(id: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            response,
        }
    }
}
