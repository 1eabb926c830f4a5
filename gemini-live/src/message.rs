//! Message codec for the Live wire schema.
//!
//! Every frame is one JSON object whose single top-level key names the
//! message kind. Binary media rides inside the JSON as base64 `inlineData` /
//! `mediaChunks`; the service may deliver its JSON in either text or binary
//! websocket frames and both decode identically.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::transport::{CloseFrame, Frame};
use crate::types::*;

// ============================================================================
// Message kinds
// ============================================================================

pub const KIND_SETUP: &str = "setup";
pub const KIND_CLIENT_CONTENT: &str = "clientContent";
pub const KIND_REALTIME_INPUT: &str = "realtimeInput";
pub const KIND_TOOL_RESPONSE: &str = "toolResponse";

pub const KIND_SETUP_COMPLETE: &str = "setupComplete";
pub const KIND_SERVER_CONTENT: &str = "serverContent";
pub const KIND_TOOL_CALL: &str = "toolCall";
pub const KIND_TOOL_CALL_CANCELLATION: &str = "toolCallCancellation";
pub const KIND_GO_AWAY: &str = "goAway";
pub const KIND_USAGE_METADATA: &str = "usageMetadata";
pub const KIND_CLOSE: &str = "close";

/// Messages sent from the client to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Session configuration; always the first message.
    Setup(Configuration),
    /// One user turn.
    ClientContent {
        parts: Vec<Part>,
        turn_complete: bool,
    },
    /// A streamed audio or video chunk.
    RealtimeInput(Blob),
    ToolResponse(Vec<FunctionResponse>),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => KIND_SETUP,
            ClientMessage::ClientContent { .. } => KIND_CLIENT_CONTENT,
            ClientMessage::RealtimeInput(_) => KIND_REALTIME_INPUT,
            ClientMessage::ToolResponse(_) => KIND_TOOL_RESPONSE,
        }
    }
}

/// Messages received from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetupComplete,
    ServerContent(ServerContent),
    ToolCall(ToolCall),
    ToolCallCancellation(Vec<String>),
    /// The service will close the connection soon.
    GoAway { time_left: Option<String> },
    UsageMetadata(Value),
    /// The transport was closed by the peer.
    Close(Option<CloseFrame>),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SetupComplete => KIND_SETUP_COMPLETE,
            ServerMessage::ServerContent(_) => KIND_SERVER_CONTENT,
            ServerMessage::ToolCall(_) => KIND_TOOL_CALL,
            ServerMessage::ToolCallCancellation(_) => KIND_TOOL_CALL_CANCELLATION,
            ServerMessage::GoAway { .. } => KIND_GO_AWAY,
            ServerMessage::UsageMetadata(_) => KIND_USAGE_METADATA,
            ServerMessage::Close(_) => KIND_CLOSE,
        }
    }
}

// ============================================================================
// Client messages
// ============================================================================

/// Encodes a client message into a text frame.
pub fn encode(msg: &ClientMessage) -> Result<Frame> {
    let body = match msg {
        ClientMessage::Setup(config) => config_to_value(config),
        ClientMessage::ClientContent {
            parts,
            turn_complete,
        } => json!({
            "turns": [{
                "role": "user",
                "parts": parts.iter().map(part_to_value).collect::<Vec<_>>(),
            }],
            "turnComplete": turn_complete,
        }),
        ClientMessage::RealtimeInput(blob) => json!({
            "mediaChunks": [blob_to_value(blob)],
        }),
        ClientMessage::ToolResponse(responses) => json!({
            "functionResponses": serde_json::to_value(responses)?,
        }),
    };
    let mut envelope = Map::new();
    envelope.insert(msg.kind().to_string(), body);
    Ok(Frame::Text(serde_json::to_string(&envelope)?))
}

/// Decodes a client frame. Used by in-process servers and tests.
pub fn decode_client(frame: &Frame) -> Result<ClientMessage> {
    let value = frame_json(frame)?;
    let (kind, body) = single_key(&value)?;
    match kind {
        KIND_SETUP => Ok(ClientMessage::Setup(config_from_value(body)?)),
        KIND_CLIENT_CONTENT => {
            let mut parts = Vec::new();
            if let Some(turns) = body.get("turns") {
                for turn in array(turns, "clientContent.turns")? {
                    for part in array_field(turn, "parts", "clientContent.turns")? {
                        parts.push(part_from_value(part)?);
                    }
                }
            }
            Ok(ClientMessage::ClientContent {
                parts,
                turn_complete: bool_field(body, "turnComplete", "clientContent")?,
            })
        }
        KIND_REALTIME_INPUT => {
            let chunks = array_field(body, "mediaChunks", "realtimeInput")?;
            match chunks.as_slice() {
                [chunk] => Ok(ClientMessage::RealtimeInput(blob_from_value(chunk)?)),
                _ => Err(Error::protocol(format!(
                    "realtimeInput: expected one media chunk, got {}",
                    chunks.len()
                ))),
            }
        }
        KIND_TOOL_RESPONSE => {
            let responses = body
                .get("functionResponses")
                .cloned()
                .ok_or_else(|| missing("toolResponse", "functionResponses"))?;
            let responses = serde_json::from_value(responses)
                .map_err(|e| Error::protocol(format!("toolResponse: {}", e)))?;
            Ok(ClientMessage::ToolResponse(responses))
        }
        other => Err(Error::protocol(format!(
            "unrecognised client message: {}",
            other
        ))),
    }
}

// ============================================================================
// Server messages
// ============================================================================

/// Decodes a server frame.
///
/// An unknown tag or malformed payload yields [`Error::Protocol`]; the
/// caller drops the frame and keeps the session alive.
pub fn decode(frame: &Frame) -> Result<ServerMessage> {
    if let Frame::Close(close) = frame {
        return Ok(ServerMessage::Close(close.clone()));
    }
    let value = frame_json(frame)?;
    decode_object(server_object(&value)?)
}

/// Decodes a server frame together with the usage report it may carry.
///
/// The service attaches `usageMetadata` next to other messages; it comes
/// back as a second [`ServerMessage::UsageMetadata`] after the primary one.
pub fn decode_all(frame: &Frame) -> Result<Vec<ServerMessage>> {
    if let Frame::Close(close) = frame {
        return Ok(vec![ServerMessage::Close(close.clone())]);
    }
    let value = frame_json(frame)?;
    let obj = server_object(&value)?;
    let primary = decode_object(obj)?;
    let usage = match (&primary, obj.get(KIND_USAGE_METADATA)) {
        (ServerMessage::UsageMetadata(_), _) | (_, None) => None,
        (_, Some(usage)) => Some(ServerMessage::UsageMetadata(usage.clone())),
    };
    Ok(std::iter::once(primary).chain(usage).collect())
}

fn server_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::protocol("frame is not a JSON object"))
}

fn decode_object(obj: &Map<String, Value>) -> Result<ServerMessage> {
    if obj.contains_key(KIND_SETUP_COMPLETE) {
        return Ok(ServerMessage::SetupComplete);
    }
    if let Some(content) = obj.get(KIND_SERVER_CONTENT) {
        return server_content_from_value(content).map(ServerMessage::ServerContent);
    }
    if let Some(call) = obj.get(KIND_TOOL_CALL) {
        let mut function_calls = Vec::new();
        for item in array_field(call, "functionCalls", KIND_TOOL_CALL)? {
            let mut fc: FunctionCall = serde_json::from_value(item.clone())
                .map_err(|e| Error::protocol(format!("toolCall.functionCalls: {}", e)))?;
            if fc.args.is_null() {
                fc.args = json!({});
            }
            function_calls.push(fc);
        }
        return Ok(ServerMessage::ToolCall(ToolCall { function_calls }));
    }
    if let Some(cancel) = obj.get(KIND_TOOL_CALL_CANCELLATION) {
        let ids = array_field(cancel, "ids", KIND_TOOL_CALL_CANCELLATION)?
            .iter()
            .map(|id| {
                id.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::protocol("toolCallCancellation: id is not a string"))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(ServerMessage::ToolCallCancellation(ids));
    }
    if let Some(go_away) = obj.get(KIND_GO_AWAY) {
        let time_left = go_away
            .get("timeLeft")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(ServerMessage::GoAway { time_left });
    }
    if let Some(usage) = obj.get(KIND_USAGE_METADATA) {
        return Ok(ServerMessage::UsageMetadata(usage.clone()));
    }

    let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
    Err(Error::protocol(format!(
        "unrecognised server message: [{}]",
        keys.join(", ")
    )))
}

/// Encodes a server message. Used by in-process servers and tests.
pub fn encode_server(msg: &ServerMessage) -> Result<Frame> {
    let body = match msg {
        ServerMessage::SetupComplete => json!({}),
        ServerMessage::ServerContent(content) => {
            let mut body = Map::new();
            if !content.parts.is_empty() {
                body.insert(
                    "modelTurn".into(),
                    json!({ "parts": content.parts.iter().map(part_to_value).collect::<Vec<_>>() }),
                );
            }
            if content.interrupted {
                body.insert("interrupted".into(), json!(true));
            }
            if content.turn_complete {
                body.insert("turnComplete".into(), json!(true));
            }
            Value::Object(body)
        }
        ServerMessage::ToolCall(call) => json!({
            "functionCalls": serde_json::to_value(&call.function_calls)?,
        }),
        ServerMessage::ToolCallCancellation(ids) => json!({ "ids": ids }),
        ServerMessage::GoAway { time_left } => match time_left {
            Some(t) => json!({ "timeLeft": t }),
            None => json!({}),
        },
        ServerMessage::UsageMetadata(usage) => usage.clone(),
        ServerMessage::Close(close) => return Ok(Frame::Close(close.clone())),
    };
    let mut envelope = Map::new();
    envelope.insert(msg.kind().to_string(), body);
    Ok(Frame::Text(serde_json::to_string(&envelope)?))
}

fn server_content_from_value(v: &Value) -> Result<ServerContent> {
    let mut content = ServerContent {
        interrupted: bool_field(v, "interrupted", KIND_SERVER_CONTENT)?,
        turn_complete: bool_field(v, "turnComplete", KIND_SERVER_CONTENT)?,
        ..Default::default()
    };
    if let Some(turn) = v.get("modelTurn") {
        if let Some(parts) = turn.get("parts") {
            for part in array(parts, "serverContent.modelTurn.parts")? {
                content.parts.push(part_from_value(part)?);
            }
        }
    }
    Ok(content)
}

// ============================================================================
// Configuration
// ============================================================================

fn config_to_value(config: &Configuration) -> Value {
    let mut generation = Map::new();
    generation.insert(
        "responseModalities".into(),
        json!(config.response_modalities.wire_names()),
    );
    if let Some(ref speech) = config.speech_config {
        generation.insert(
            "speechConfig".into(),
            json!({
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": speech.voice_name }
                }
            }),
        );
    }
    if let Some(tokens) = config.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(tokens));
    }

    let mut setup = Map::new();
    setup.insert("model".into(), json!(config.model));
    setup.insert("generationConfig".into(), Value::Object(generation));
    if let Some(ref text) = config.system_instruction {
        setup.insert(
            "systemInstruction".into(),
            json!({ "parts": [{ "text": text }] }),
        );
    }
    if !config.tools.is_empty() {
        setup.insert(
            "tools".into(),
            Value::Array(config.tools.iter().map(tool_to_value).collect()),
        );
    }
    Value::Object(setup)
}

fn config_from_value(v: &Value) -> Result<Configuration> {
    let mut config = Configuration::new(str_field(v, "model", KIND_SETUP)?);

    if let Some(generation) = v.get("generationConfig") {
        if let Some(modalities) = generation.get("responseModalities") {
            let names = match modalities {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|i| {
                        i.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| Error::protocol("setup: modality is not a string"))
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => return Err(Error::protocol("setup: invalid responseModalities")),
            };
            config.response_modalities = ResponseModality::from_wire_names(&names)
                .ok_or_else(|| Error::protocol("setup: unknown response modality"))?;
        }
        if let Some(voice) =
            generation.pointer("/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName")
        {
            let voice = voice
                .as_str()
                .ok_or_else(|| Error::protocol("setup: voiceName is not a string"))?;
            config.speech_config = Some(SpeechConfig::voice(voice));
        }
        if let Some(tokens) = generation.get("maxOutputTokens") {
            let tokens = tokens
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| Error::protocol("setup: maxOutputTokens must be an integer"))?;
            config.max_output_tokens = Some(tokens);
        }
    }

    if let Some(instruction) = v.get("systemInstruction") {
        let texts: Vec<&str> = array_field(instruction, "parts", "setup.systemInstruction")?
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        config.system_instruction = Some(texts.join("\n"));
    }

    if let Some(tools) = v.get("tools") {
        for tool in array(tools, "setup.tools")? {
            config.tools.push(tool_from_value(tool)?);
        }
    }
    Ok(config)
}

fn tool_to_value(tool: &Tool) -> Value {
    match tool {
        Tool::GoogleSearch => json!({ "googleSearch": {} }),
        Tool::CodeExecution => json!({ "codeExecution": {} }),
        Tool::Functions(decls) => json!({ "functionDeclarations": decls }),
    }
}

fn tool_from_value(v: &Value) -> Result<Tool> {
    if v.get("googleSearch").is_some() {
        return Ok(Tool::GoogleSearch);
    }
    if v.get("codeExecution").is_some() {
        return Ok(Tool::CodeExecution);
    }
    if let Some(decls) = v.get("functionDeclarations") {
        let decls = serde_json::from_value(decls.clone())
            .map_err(|e| Error::protocol(format!("setup.tools: {}", e)))?;
        return Ok(Tool::Functions(decls));
    }
    Err(Error::protocol("setup.tools: unrecognised tool"))
}

// ============================================================================
// Parts
// ============================================================================

fn part_to_value(part: &Part) -> Value {
    match part {
        Part::Text(text) => json!({ "text": text }),
        Part::InlineData(blob) => json!({ "inlineData": blob_to_value(blob) }),
        Part::ExecutableCode { language, code } => json!({
            "executableCode": { "language": language, "code": code }
        }),
        Part::CodeExecutionResult { outcome, output } => json!({
            "codeExecutionResult": { "outcome": outcome, "output": output }
        }),
        Part::Other(value) => value.clone(),
    }
}

fn part_from_value(v: &Value) -> Result<Part> {
    if !v.is_object() {
        return Err(Error::protocol("part is not an object"));
    }
    if let Some(text) = v.get("text") {
        return text
            .as_str()
            .map(Part::text)
            .ok_or_else(|| Error::protocol("part.text is not a string"));
    }
    if let Some(blob) = v.get("inlineData") {
        return blob_from_value(blob).map(Part::InlineData);
    }
    if let Some(code) = v.get("executableCode") {
        return Ok(Part::ExecutableCode {
            language: opt_str(code, "language"),
            code: str_field(code, "code", "executableCode")?.to_string(),
        });
    }
    if let Some(result) = v.get("codeExecutionResult") {
        return Ok(Part::CodeExecutionResult {
            outcome: opt_str(result, "outcome"),
            output: opt_str(result, "output"),
        });
    }
    Ok(Part::Other(v.clone()))
}

fn blob_to_value(blob: &Blob) -> Value {
    json!({
        "mimeType": blob.mime_type,
        "data": BASE64.encode(&blob.data),
    })
}

fn blob_from_value(v: &Value) -> Result<Blob> {
    let mime_type = str_field(v, "mimeType", "inlineData")?;
    let data = BASE64
        .decode(str_field(v, "data", "inlineData")?)
        .map_err(|e| Error::protocol(format!("inlineData: invalid base64: {}", e)))?;
    Ok(Blob::new(mime_type, data))
}

// ============================================================================
// Helpers
// ============================================================================

fn frame_json(frame: &Frame) -> Result<Value> {
    match frame {
        Frame::Text(text) => serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("invalid JSON: {}", e))),
        Frame::Binary(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol(format!("invalid JSON in binary frame: {}", e))),
        Frame::Close(_) => Err(Error::protocol("close frame carries no message")),
    }
}

fn single_key(v: &Value) -> Result<(&str, &Value)> {
    let obj = v
        .as_object()
        .ok_or_else(|| Error::protocol("frame is not a JSON object"))?;
    let mut entries = obj.iter();
    match (entries.next(), entries.next()) {
        (Some((k, body)), None) => Ok((k.as_str(), body)),
        _ => Err(Error::protocol(format!(
            "expected exactly one message key, got {}",
            obj.len()
        ))),
    }
}

fn missing(ctx: &str, key: &str) -> Error {
    Error::protocol(format!("{}: missing field `{}`", ctx, key))
}

fn str_field<'a>(v: &'a Value, key: &str, ctx: &str) -> Result<&'a str> {
    v.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(ctx, key))
}

fn opt_str(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(v: &Value, key: &str, ctx: &str) -> Result<bool> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(Error::protocol(format!("{}: `{}` is not a bool", ctx, key))),
    }
}

fn array<'a>(v: &'a Value, ctx: &str) -> Result<&'a Vec<Value>> {
    v.as_array()
        .ok_or_else(|| Error::protocol(format!("{}: expected an array", ctx)))
}

fn array_field<'a>(v: &'a Value, key: &str, ctx: &str) -> Result<&'a Vec<Value>> {
    array(v.get(key).ok_or_else(|| missing(ctx, key))?, ctx)
}

/// Shortens a payload for log output.
pub(crate) fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
