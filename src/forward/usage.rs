//! Canonical usage extraction.
//!
//! Upstream vendors report token usage in different shapes; billing works
//! on one. Decoders turn raw SSE payloads into [`UpstreamEvent`]s and the
//! usage math lives here, not at call sites.

use serde_json::Value;

/// Canonical token usage for billing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub input: i64,
    pub output: i64,
    pub cache_creation: i64,
    pub cache_read: i64,
    pub cache_creation_5m: i64,
    pub cache_creation_1h: i64,
}

impl Usage {
    /// Input-side tokens, the base for the long-context threshold.
    pub fn total_input(&self) -> i64 {
        self.input + self.cache_creation + self.cache_read
    }

    pub fn total(&self) -> i64 {
        self.total_input() + self.output
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

fn field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or(0).max(0)
}

/// Decode an Anthropic `usage` object.
///
/// Some OpenAI-compatible vendors serve Anthropic-shaped responses with the
/// standard cache field zeroed and their own `cached_tokens` set; the alias
/// back-fills the canonical field.
pub fn from_anthropic_usage(usage: &Value) -> Usage {
    let mut out = Usage {
        input: field(usage, "input_tokens"),
        output: field(usage, "output_tokens"),
        cache_creation: field(usage, "cache_creation_input_tokens"),
        cache_read: field(usage, "cache_read_input_tokens"),
        cache_creation_5m: 0,
        cache_creation_1h: 0,
    };
    if let Some(breakdown) = usage.get("cache_creation") {
        out.cache_creation_5m = field(breakdown, "ephemeral_5m_input_tokens");
        out.cache_creation_1h = field(breakdown, "ephemeral_1h_input_tokens");
        if out.cache_creation == 0 {
            out.cache_creation = out.cache_creation_5m + out.cache_creation_1h;
        }
    }
    let cached_alias = field(usage, "cached_tokens");
    if out.cache_read == 0 && cached_alias > 0 {
        out.cache_read = cached_alias;
    }
    out
}

/// Decode a Gemini `usageMetadata` object. Thought tokens count as output;
/// cached content is subtracted from the prompt count and billed as cache
/// reads.
pub fn from_gemini_usage_metadata(metadata: &Value) -> Usage {
    let prompt = field(metadata, "promptTokenCount");
    let cached = field(metadata, "cachedContentTokenCount");
    let candidates = field(metadata, "candidatesTokenCount");
    let thoughts = field(metadata, "thoughtsTokenCount");
    Usage {
        input: (prompt - cached).max(0),
        output: candidates + thoughts,
        cache_creation: 0,
        cache_read: cached,
        cache_creation_5m: 0,
        cache_creation_1h: 0,
    }
}

/// Vendor response shapes, decoded once per SSE payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    MessageStart { usage: Usage },
    MessageDelta { usage: Usage },
    ContentBlockDelta,
    GeminiChunk { usage: Option<Usage> },
    Error { message: String },
    Other,
}

pub fn decode_anthropic_event(payload: &Value) -> UpstreamEvent {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("message_start") => {
            let usage = payload
                .get("message")
                .and_then(|m| m.get("usage"))
                .map(from_anthropic_usage)
                .unwrap_or_default();
            UpstreamEvent::MessageStart { usage }
        }
        Some("message_delta") => {
            let usage = payload
                .get("usage")
                .map(from_anthropic_usage)
                .unwrap_or_default();
            UpstreamEvent::MessageDelta { usage }
        }
        Some("content_block_delta") => UpstreamEvent::ContentBlockDelta,
        Some("error") => {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error")
                .to_string();
            UpstreamEvent::Error { message }
        }
        _ => UpstreamEvent::Other,
    }
}

pub fn decode_gemini_chunk(payload: &Value) -> UpstreamEvent {
    if let Some(error) = payload.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("upstream error")
            .to_string();
        return UpstreamEvent::Error { message };
    }
    let usage = payload
        .get("usageMetadata")
        .map(from_gemini_usage_metadata);
    UpstreamEvent::GeminiChunk { usage }
}

/// Accumulates usage over a stream's lifetime.
///
/// Anthropic reports input in `message_start` and the final output count in
/// `message_delta`; Gemini repeats a growing `usageMetadata` on every
/// chunk. Either way the tracker converges on the final canonical tuple.
#[derive(Debug, Default, Clone)]
pub struct UsageTracker {
    usage: Usage,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::MessageStart { usage } => {
                self.usage.input = usage.input;
                self.usage.cache_creation = usage.cache_creation;
                self.usage.cache_read = usage.cache_read;
                self.usage.cache_creation_5m = usage.cache_creation_5m;
                self.usage.cache_creation_1h = usage.cache_creation_1h;
                if usage.output > 0 {
                    self.usage.output = usage.output;
                }
            }
            UpstreamEvent::MessageDelta { usage } => {
                if usage.output > 0 {
                    self.usage.output = usage.output;
                }
                // Some vendors only report totals at the end.
                if usage.input > 0 && self.usage.input == 0 {
                    self.usage.input = usage.input;
                }
                if usage.cache_read > 0 && self.usage.cache_read == 0 {
                    self.usage.cache_read = usage.cache_read;
                }
            }
            UpstreamEvent::GeminiChunk { usage: Some(usage) } => {
                // Counts are cumulative; later chunks supersede.
                self.usage = *usage;
            }
            _ => {}
        }
    }

    pub fn current(&self) -> Usage {
        self.usage
    }

    /// Final output is known once a `message_delta` carried it.
    pub fn has_output(&self) -> bool {
        self.usage.output > 0
    }
}

/// Reconcile a buffered (non-streaming) Anthropic-shaped body in place:
/// back-filled cache fields are written back so the client sees the same
/// numbers billing used. Returns the canonical usage.
pub fn reconcile_anthropic_body(body: &mut Value) -> Usage {
    let Some(usage_value) = body.get("usage") else {
        return Usage::default();
    };
    let usage = from_anthropic_usage(usage_value);
    if let Some(obj) = body.get_mut("usage").and_then(|u| u.as_object_mut()) {
        let reported = obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if usage.cache_read > 0 && reported == 0 {
            obj.insert(
                "cache_read_input_tokens".to_string(),
                Value::from(usage.cache_read),
            );
        }
    }
    usage
}
