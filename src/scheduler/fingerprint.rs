//! Request parsing and session fingerprinting.
//!
//! Decodes Anthropic Messages and Gemini GenerateContent bodies into a
//! [`ParsedRequest`], derives the 32-hex session fingerprint used for sticky
//! routing, and builds the per-turn digest chain that lets a continuing
//! conversation recover its binding when the client omits a session id.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::xxh64;

use crate::forward::error::{GatewayError, GatewayResult};

/// Inbound wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Anthropic,
    Gemini,
}

/// Caller identity mixed into path-3 fingerprints so identical first
/// messages from different users never collide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub client_ip: String,
    pub user_agent: String,
    pub api_key_id: String,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub id: String,
    pub wire: WireFormat,
    pub model: String,
    pub stream: bool,
    pub body: Value,
    pub system: Option<Value>,
    pub messages: Vec<Value>,
    pub metadata_user_id: Option<String>,
    pub session_context: SessionContext,
}

static SESSION_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"session_([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
        .expect("session uuid pattern")
});

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// Coerce the `stream` field to a bool the way clients actually send it.
pub fn stream_flag(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

/// Decode a request body for routing.
///
/// For Gemini the model arrives in the URL, not the body; callers pass it
/// through `model_override`, along with the stream flag implied by the
/// `:streamGenerateContent` endpoint.
pub fn parse(
    body: Value,
    wire: WireFormat,
    model_override: Option<&str>,
    stream_override: Option<bool>,
    session_context: SessionContext,
) -> GatewayResult<ParsedRequest> {
    if !body.is_object() {
        return Err(GatewayError::InvalidRequest(
            "request body must be a JSON object".to_string(),
        ));
    }

    let model = match model_override {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => body
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GatewayError::InvalidRequest("missing or empty 'model' field".to_string())
            })?,
    };

    let stream = stream_override.unwrap_or_else(|| stream_flag(&body));

    let (system, messages, metadata_user_id) = match wire {
        WireFormat::Anthropic => {
            let messages = body
                .get("messages")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(|| {
                    GatewayError::InvalidRequest("'messages' must be an array".to_string())
                })?;
            let system = body.get("system").cloned().filter(|v| !v.is_null());
            let metadata_user_id = body
                .get("metadata")
                .and_then(|m| m.get("user_id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            (system, messages, metadata_user_id)
        }
        WireFormat::Gemini => {
            let contents = body
                .get("contents")
                .and_then(|v| v.as_array())
                .cloned()
                .ok_or_else(|| {
                    GatewayError::InvalidRequest("'contents' must be an array".to_string())
                })?;
            let system = body
                .get("systemInstruction")
                .or_else(|| body.get("system_instruction"))
                .cloned()
                .filter(|v| !v.is_null());
            (system, contents, None)
        }
    };

    Ok(ParsedRequest {
        id: new_request_id(),
        wire,
        model,
        stream,
        body,
        system,
        messages,
        metadata_user_id,
        session_context,
    })
}

fn hex_fingerprint(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(&digest[..16])
}

fn first_user_message_text(messages: &[Value]) -> String {
    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
        if role != "user" {
            continue;
        }
        return match message.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => message
                .get("parts")
                .map(|p| p.to_string())
                .unwrap_or_default(),
        };
    }
    String::new()
}

fn ephemeral_system_block(system: &Value) -> Option<&Value> {
    let first = system.as_array()?.first()?;
    let kind = first.get("cache_control")?.get("type")?.as_str()?;
    (kind == "ephemeral").then_some(first)
}

/// Derive the stable 32-hex session fingerprint.
///
/// Priority: explicit `metadata.user_id` session uuid, then the
/// ephemeral-cached system block, then a hash over the whole conversation
/// plus the caller identity.
pub fn fingerprint(parsed: &ParsedRequest) -> String {
    if let Some(meta) = &parsed.metadata_user_id {
        if let Some(caps) = SESSION_UUID.captures(meta) {
            return caps[1].to_lowercase().replace('-', "");
        }
    }

    if let Some(system) = &parsed.system {
        if let Some(block) = ephemeral_system_block(system) {
            let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
            let seed = format!("{}{}", text, first_user_message_text(&parsed.messages));
            return hex_fingerprint(seed.as_bytes());
        }
    }

    let system = parsed
        .system
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let messages = Value::Array(parsed.messages.clone()).to_string();
    let ctx = &parsed.session_context;
    let seed = format!(
        "{}{}{}\x00{}\x00{}",
        system, messages, ctx.client_ip, ctx.user_agent, ctx.api_key_id
    );
    hex_fingerprint(seed.as_bytes())
}

fn base36(mut value: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ascii")
}

fn role_prefix(role: &str) -> char {
    match role {
        "system" => 's',
        "user" => 'u',
        "assistant" => 'a',
        "model" => 'm',
        _ => 'u',
    }
}

fn turn_digest(role: &str, content: &Value) -> String {
    // serde_json renders object keys in sorted order, which makes this a
    // canonical serialization.
    let canonical = content.to_string();
    format!("{}:{}", role_prefix(role), base36(xxh64(canonical.as_bytes(), 0)))
}

/// Role-prefixed, hyphen-joined digest of every conversation turn.
///
/// An unbroken conversation's chain at round N is a strict prefix of its
/// chain at round N+1, which is what allows longest-prefix session
/// recovery.
pub fn build_digest_chain(parsed: &ParsedRequest) -> String {
    let mut segments = Vec::with_capacity(parsed.messages.len() + 1);

    if let Some(system) = &parsed.system {
        segments.push(turn_digest("system", system));
    }

    for message in &parsed.messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = message
            .get("content")
            .or_else(|| message.get("parts"))
            .cloned()
            .unwrap_or(Value::Null);
        segments.push(turn_digest(role, &content));
    }

    segments.join("-")
}
