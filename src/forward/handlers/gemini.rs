//! Gemini GenerateContent forwarding and Anthropic<->Gemini cross-mapping.
//!
//! Native Gemini accounts serve the `/v1beta` wire directly. Gemini
//! accounts can also service Anthropic-wire requests (and Anthropic
//! accounts the Gemini wire) through the request/response/stream
//! conversions in this module.

use axum::body::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::accounts::{AccountType, Platform};
use crate::forward::client::{self, parse_sse_data, TimeoutClass};
use crate::forward::context::ForwardContext;
use crate::forward::error::{GatewayError, GatewayResult};
use crate::forward::usage::{
    self, decode_anthropic_event, decode_gemini_chunk, from_gemini_usage_metadata, UpstreamEvent,
    UsageTracker,
};
use crate::scheduler::ParsedRequest;
use crate::state::Gateway;

use super::{relay_sse, AttemptOutcome, StreamAdapter, StreamAttempt};

/// Allowed top-level fields for GenerateContent
const ALLOWED_FIELDS: &[&str] = &[
    "contents",
    "systemInstruction",
    "system_instruction",
    "generationConfig",
    "generation_config",
    "tools",
    "toolConfig",
    "tool_config",
    "safetySettings",
    "safety_settings",
    "cachedContent",
];

pub struct GeminiHandler;

fn filter_payload(payload: &Value, allowed: &[&str]) -> Value {
    if let Some(obj) = payload.as_object() {
        let filtered: Map<String, Value> = obj
            .iter()
            .filter(|(key, _)| allowed.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(filtered)
    } else {
        payload.clone()
    }
}

fn gemini_path(ctx: &ForwardContext, stream: bool) -> String {
    if stream {
        format!(
            "/v1beta/models/{}:streamGenerateContent?alt=sse",
            ctx.upstream_model
        )
    } else {
        format!("/v1beta/models/{}:generateContent", ctx.upstream_model)
    }
}

impl GeminiHandler {
    pub(crate) fn build_headers(
        &self,
        ctx: &ForwardContext,
        bearer: Option<&str>,
    ) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        match ctx.account.account_type {
            AccountType::Oauth | AccountType::SetupToken => {
                let token = bearer.ok_or_else(|| {
                    GatewayError::Internal("oauth account without access token".to_string())
                })?;
                headers.insert(
                    "authorization",
                    HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                        GatewayError::Internal("access token is not header-safe".to_string())
                    })?,
                );
                if let Some(project_id) = ctx.account.credentials().project_id() {
                    headers.insert(
                        "x-goog-user-project",
                        HeaderValue::from_str(&project_id).map_err(|_| {
                            GatewayError::Internal("project id is not header-safe".to_string())
                        })?,
                    );
                }
            }
            AccountType::Apikey | AccountType::Upstream => {
                let key = ctx.account.credentials().api_key().ok_or_else(|| {
                    GatewayError::Internal("api-key account without api_key".to_string())
                })?;
                headers.insert(
                    "x-goog-api-key",
                    HeaderValue::from_str(&key).map_err(|_| {
                        GatewayError::Internal("api key is not header-safe".to_string())
                    })?,
                );
            }
        }
        Ok(headers)
    }

    async fn prepare(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        body: Value,
        stream: bool,
    ) -> GatewayResult<(String, HeaderMap, Value)> {
        let base = ctx.account.effective_base_url();
        client::validate_upstream_url(&base, gw.settings.allow_private_upstreams).await?;
        let url = format!("{}{}", base, gemini_path(ctx, stream));
        let bearer = crate::oauth::bearer_token(gw, &ctx.account).await?;
        let headers = self.build_headers(ctx, bearer.as_deref())?;
        Ok((url, headers, body))
    }

    pub async fn attempt_buffered(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
    ) -> GatewayResult<AttemptOutcome> {
        if ctx.account.platform != Platform::Gemini {
            return gemini_request_via_anthropic(gw, ctx, parsed).await;
        }

        let body = filter_payload(&parsed.body, ALLOWED_FIELDS);
        let (url, headers, body) = self.prepare(gw, ctx, body, false).await?;
        let http = client::client_for(&ctx.account, &gw.settings, TimeoutClass::Buffered)?;
        let response = client::post_json(&http, &url, headers, &body).await?;

        let status = response.status().as_u16();
        let resp_headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Upstream(format!("reading upstream body: {}", e)))?;

        if !(200..300).contains(&status) {
            return Ok(AttemptOutcome::Failure {
                status,
                headers: resp_headers,
                body: text,
            });
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Upstream(format!("parsing upstream response: {}", e)))?;
        let usage = value
            .get("usageMetadata")
            .map(from_gemini_usage_metadata)
            .unwrap_or_default();
        Ok(AttemptOutcome::Success { body: value, usage })
    }

    pub async fn attempt_stream(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
        tx: &mpsc::Sender<Bytes>,
    ) -> GatewayResult<StreamAttempt> {
        if ctx.account.platform != Platform::Gemini {
            return gemini_stream_via_anthropic(gw, ctx, parsed, tx).await;
        }

        let body = filter_payload(&parsed.body, ALLOWED_FIELDS);
        let (url, headers, body) = self.prepare(gw, ctx, body, true).await?;
        let http = client::client_for(&ctx.account, &gw.settings, TimeoutClass::Streaming)?;
        let response = client::post_json(&http, &url, headers, &body).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let resp_headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Ok(StreamAttempt::Failure {
                status,
                headers: resp_headers,
                body: text,
            });
        }

        let mut adapter = GeminiPassthrough;
        let outcome = relay_sse(response, &mut adapter, tx, &gw.settings.scheduler).await;
        Ok(StreamAttempt::Streamed(outcome))
    }
}

/// Forwards native Gemini SSE frames unchanged while harvesting usage.
struct GeminiPassthrough;

impl StreamAdapter for GeminiPassthrough {
    fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes> {
        if let Some(data) = parse_sse_data(line) {
            if !client::is_sse_done(data) {
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    tracker.observe(&decode_gemini_chunk(&value));
                }
            }
        }
        vec![Bytes::from(format!("{}\n", line))]
    }

    fn finish(&mut self, _tracker: &UsageTracker) -> Vec<Bytes> {
        Vec::new()
    }
}

// ============================================================================
// Anthropic wire served by a Gemini account
// ============================================================================

fn anthropic_content_to_parts(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({"text": text})],
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(|t| json!({"text": t})),
                    Some("image") => {
                        let source = block.get("source")?;
                        Some(json!({
                            "inlineData": {
                                "mimeType": source.get("media_type").cloned().unwrap_or(json!("image/png")),
                                "data": source.get("data").cloned().unwrap_or(json!("")),
                            }
                        }))
                    }
                    Some("tool_use") => Some(json!({
                        "functionCall": {
                            "name": block.get("name").cloned().unwrap_or(json!("")),
                            "args": block.get("input").cloned().unwrap_or(json!({})),
                        }
                    })),
                    Some("tool_result") => Some(json!({
                        "functionResponse": {
                            "name": block.get("tool_use_id").cloned().unwrap_or(json!("tool")),
                            "response": {"result": block.get("content").cloned().unwrap_or(Value::Null)},
                        }
                    })),
                    // Thinking blocks never cross the format boundary.
                    _ => None,
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn anthropic_system_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Map an Anthropic Messages body onto GenerateContent.
pub(crate) fn anthropic_to_gemini_request(body: &Value) -> Value {
    let mut out = Map::new();

    let contents: Vec<Value> = body
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| {
            messages
                .iter()
                .map(|message| {
                    let role = match message.get("role").and_then(|r| r.as_str()) {
                        Some("assistant") => "model",
                        _ => "user",
                    };
                    let parts = message
                        .get("content")
                        .map(anthropic_content_to_parts)
                        .unwrap_or_default();
                    json!({"role": role, "parts": parts})
                })
                .collect()
        })
        .unwrap_or_default();
    out.insert("contents".to_string(), Value::Array(contents));

    if let Some(system) = body.get("system") {
        let text = anthropic_system_text(system);
        if !text.is_empty() {
            out.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": text}]}),
            );
        }
    }

    let mut generation = Map::new();
    if let Some(max) = body.get("max_tokens").and_then(|v| v.as_i64()) {
        generation.insert("maxOutputTokens".to_string(), Value::from(max));
    }
    for (from, to) in [("temperature", "temperature"), ("top_p", "topP"), ("top_k", "topK")] {
        if let Some(v) = body.get(from) {
            if !v.is_null() {
                generation.insert(to.to_string(), v.clone());
            }
        }
    }
    if let Some(stops) = body.get("stop_sequences") {
        if !stops.is_null() {
            generation.insert("stopSequences".to_string(), stops.clone());
        }
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?;
                Some(json!({
                    "name": name,
                    "description": tool.get("description").cloned().unwrap_or(json!("")),
                    "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                }))
            })
            .collect();
        if !declarations.is_empty() {
            out.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
    }

    Value::Object(out)
}

fn map_gemini_finish_reason(reason: Option<&str>, saw_tool_use: bool) -> &'static str {
    if saw_tool_use {
        return "tool_use";
    }
    match reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

/// Map a GenerateContent response onto an Anthropic message.
pub(crate) fn gemini_to_anthropic_response(response: &Value, model: &str) -> Value {
    let mut content = Vec::new();
    let mut saw_tool_use = false;
    let mut finish_reason = None;

    if let Some(candidate) = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        finish_reason = candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string());
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                        content.push(json!({"type": "thinking", "thinking": text}));
                    } else {
                        content.push(json!({"type": "text", "text": text}));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    saw_tool_use = true;
                    content.push(json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                        "name": call.get("name").cloned().unwrap_or(json!("")),
                        "input": call.get("args").cloned().unwrap_or(json!({})),
                    }));
                }
            }
        }
    }

    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let usage = response
        .get("usageMetadata")
        .map(from_gemini_usage_metadata)
        .unwrap_or_default();

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": map_gemini_finish_reason(finish_reason.as_deref(), saw_tool_use),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.input,
            "output_tokens": usage.output,
            "cache_creation_input_tokens": usage.cache_creation,
            "cache_read_input_tokens": usage.cache_read,
        }
    })
}

pub(crate) async fn anthropic_request_via_gemini(
    gw: &Gateway,
    ctx: &ForwardContext,
    parsed: &ParsedRequest,
) -> GatewayResult<AttemptOutcome> {
    let handler = GeminiHandler;
    let anthropic_body = super::anthropic::AnthropicHandler.transform_request(ctx, parsed);
    let body = anthropic_to_gemini_request(&anthropic_body);

    let (url, headers, body) = handler.prepare(gw, ctx, body, false).await?;
    let http = client::client_for(&ctx.account, &gw.settings, TimeoutClass::Buffered)?;
    let response = client::post_json(&http, &url, headers, &body).await?;

    let status = response.status().as_u16();
    let resp_headers = response.headers().clone();
    let text = response
        .text()
        .await
        .map_err(|e| GatewayError::Upstream(format!("reading upstream body: {}", e)))?;
    if !(200..300).contains(&status) {
        return Ok(AttemptOutcome::Failure {
            status,
            headers: resp_headers,
            body: text,
        });
    }

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| GatewayError::Upstream(format!("parsing upstream response: {}", e)))?;
    let converted = gemini_to_anthropic_response(&value, &ctx.model);
    let usage = value
        .get("usageMetadata")
        .map(from_gemini_usage_metadata)
        .unwrap_or_default();
    Ok(AttemptOutcome::Success {
        body: converted,
        usage,
    })
}

pub(crate) async fn anthropic_stream_via_gemini(
    gw: &Gateway,
    ctx: &ForwardContext,
    parsed: &ParsedRequest,
    tx: &mpsc::Sender<Bytes>,
) -> GatewayResult<StreamAttempt> {
    let handler = GeminiHandler;
    let anthropic_body = super::anthropic::AnthropicHandler.transform_request(ctx, parsed);
    let body = anthropic_to_gemini_request(&anthropic_body);

    let (url, headers, body) = handler.prepare(gw, ctx, body, true).await?;
    let http = client::client_for(&ctx.account, &gw.settings, TimeoutClass::Streaming)?;
    let response = client::post_json(&http, &url, headers, &body).await?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let resp_headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        return Ok(StreamAttempt::Failure {
            status,
            headers: resp_headers,
            body: text,
        });
    }

    let mut adapter = GeminiToAnthropic::new(&ctx.model);
    let outcome = relay_sse(response, &mut adapter, tx, &gw.settings.scheduler).await;
    Ok(StreamAttempt::Streamed(outcome))
}

/// Converts a Gemini SSE stream into Anthropic Messages events.
struct GeminiToAnthropic {
    model: String,
    started: bool,
    block_open: bool,
    finished: bool,
}

fn sse_frame(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
}

impl GeminiToAnthropic {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            started: false,
            block_open: false,
            finished: false,
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>, tracker: &UsageTracker) {
        if self.started {
            return;
        }
        self.started = true;
        let start = json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": tracker.current().input, "output_tokens": 0}
            }
        });
        out.push(sse_frame("message_start", &start));
    }

    fn ensure_block(&mut self, out: &mut Vec<Bytes>) {
        if self.block_open {
            return;
        }
        self.block_open = true;
        let start = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""}
        });
        out.push(sse_frame("content_block_start", &start));
    }

    fn close_block(&mut self, out: &mut Vec<Bytes>) {
        if !self.block_open {
            return;
        }
        self.block_open = false;
        out.push(sse_frame(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": 0}),
        ));
    }
}

impl StreamAdapter for GeminiToAnthropic {
    fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes> {
        let mut out = Vec::new();
        let Some(data) = parse_sse_data(line) else {
            return out;
        };
        if client::is_sse_done(data) {
            return out;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return out;
        };

        tracker.observe(&decode_gemini_chunk(&chunk));
        self.ensure_started(&mut out, tracker);

        let Some(candidate) = chunk
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return out;
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                let Some(text) = part.get("text").and_then(|t| t.as_str()) else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }
                self.ensure_block(&mut out);
                let delta = json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": text}
                });
                out.push(sse_frame("content_block_delta", &delta));
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            self.close_block(&mut out);
            self.finished = true;
            let delta = json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_gemini_finish_reason(Some(reason), false),
                    "stop_sequence": null
                },
                "usage": {"output_tokens": tracker.current().output}
            });
            out.push(sse_frame("message_delta", &delta));
        }

        out
    }

    fn finish(&mut self, tracker: &UsageTracker) -> Vec<Bytes> {
        let mut out = Vec::new();
        if !self.started {
            return out;
        }
        self.close_block(&mut out);
        if !self.finished {
            let delta = json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": tracker.current().output}
            });
            out.push(sse_frame("message_delta", &delta));
        }
        out.push(sse_frame("message_stop", &json!({"type": "message_stop"})));
        out
    }
}

// ============================================================================
// Gemini wire served by an Anthropic account
// ============================================================================

fn gemini_parts_to_anthropic_content(parts: &Value) -> Vec<Value> {
    let Some(parts) = parts.as_array() else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|part| {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                return Some(json!({"type": "text", "text": text}));
            }
            if let Some(call) = part.get("functionCall") {
                return Some(json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                    "name": call.get("name").cloned().unwrap_or(json!("")),
                    "input": call.get("args").cloned().unwrap_or(json!({})),
                }));
            }
            if let Some(response) = part.get("functionResponse") {
                return Some(json!({
                    "type": "tool_result",
                    "tool_use_id": response.get("name").cloned().unwrap_or(json!("tool")),
                    "content": response
                        .get("response")
                        .and_then(|r| r.get("result"))
                        .cloned()
                        .unwrap_or(Value::Null),
                }));
            }
            None
        })
        .collect()
}

/// Anthropic requires `max_tokens`; used when the Gemini request sets none.
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Map a GenerateContent body onto Anthropic Messages.
pub(crate) fn gemini_to_anthropic_request(body: &Value, model: &str) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), Value::from(model));

    let messages: Vec<Value> = body
        .get("contents")
        .and_then(|c| c.as_array())
        .map(|contents| {
            contents
                .iter()
                .map(|content| {
                    let role = match content.get("role").and_then(|r| r.as_str()) {
                        Some("model") => "assistant",
                        _ => "user",
                    };
                    let blocks = content
                        .get("parts")
                        .map(gemini_parts_to_anthropic_content)
                        .unwrap_or_default();
                    json!({"role": role, "content": blocks})
                })
                .collect()
        })
        .unwrap_or_default();
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(instruction) = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"))
    {
        let text: String = instruction
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        if !text.is_empty() {
            out.insert("system".to_string(), Value::from(text));
        }
    }

    let generation = body
        .get("generationConfig")
        .or_else(|| body.get("generation_config"));
    let max_tokens = generation
        .and_then(|g| g.get("maxOutputTokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_MAX_TOKENS);
    out.insert("max_tokens".to_string(), Value::from(max_tokens));
    if let Some(generation) = generation {
        for (from, to) in [("temperature", "temperature"), ("topP", "top_p"), ("topK", "top_k")] {
            if let Some(v) = generation.get(from) {
                if !v.is_null() {
                    out.insert(to.to_string(), v.clone());
                }
            }
        }
        if let Some(stops) = generation.get("stopSequences") {
            if !stops.is_null() {
                out.insert("stop_sequences".to_string(), stops.clone());
            }
        }
    }

    if let Some(declarations) = body
        .get("tools")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.get("functionDeclarations"))
        .and_then(|d| d.as_array())
    {
        let tools: Vec<Value> = declarations
            .iter()
            .filter_map(|decl| {
                let name = decl.get("name")?.as_str()?;
                Some(json!({
                    "name": name,
                    "description": decl.get("description").cloned().unwrap_or(json!("")),
                    "input_schema": decl.get("parameters").cloned().unwrap_or(json!({})),
                }))
            })
            .collect();
        if !tools.is_empty() {
            out.insert("tools".to_string(), Value::Array(tools));
        }
    }

    Value::Object(out)
}

/// Map an Anthropic message onto a GenerateContent response.
pub(crate) fn anthropic_to_gemini_response(response: &Value, model: &str) -> Value {
    let mut parts = Vec::new();
    if let Some(blocks) = response.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        parts.push(json!({"text": text}));
                    }
                }
                Some("tool_use") => parts.push(json!({
                    "functionCall": {
                        "name": block.get("name").cloned().unwrap_or(json!("")),
                        "args": block.get("input").cloned().unwrap_or(json!({})),
                    }
                })),
                _ => {}
            }
        }
    }

    let usage = response
        .get("usage")
        .map(usage::from_anthropic_usage)
        .unwrap_or_default();
    let finish = match response.get("stop_reason").and_then(|r| r.as_str()) {
        Some("max_tokens") => "MAX_TOKENS",
        _ => "STOP",
    };

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish,
            "index": 0
        }],
        "modelVersion": model,
        "usageMetadata": {
            "promptTokenCount": usage.input + usage.cache_read,
            "candidatesTokenCount": usage.output,
            "cachedContentTokenCount": usage.cache_read,
            "totalTokenCount": usage.total(),
        }
    })
}

pub(crate) async fn gemini_request_via_anthropic(
    gw: &Gateway,
    ctx: &ForwardContext,
    parsed: &ParsedRequest,
) -> GatewayResult<AttemptOutcome> {
    let anthropic_body = gemini_to_anthropic_request(&parsed.body, &ctx.upstream_model);
    let anthropic_parsed = reparse_as_anthropic(parsed, anthropic_body)?;

    match super::anthropic::AnthropicHandler
        .attempt_buffered(gw, ctx, &anthropic_parsed)
        .await?
    {
        AttemptOutcome::Success { body, usage } => Ok(AttemptOutcome::Success {
            body: anthropic_to_gemini_response(&body, &ctx.model),
            usage,
        }),
        failure => Ok(failure),
    }
}

pub(crate) async fn gemini_stream_via_anthropic(
    gw: &Gateway,
    ctx: &ForwardContext,
    parsed: &ParsedRequest,
    tx: &mpsc::Sender<Bytes>,
) -> GatewayResult<StreamAttempt> {
    let anthropic_body = gemini_to_anthropic_request(&parsed.body, &ctx.upstream_model);
    let anthropic_parsed = reparse_as_anthropic(parsed, anthropic_body)?;

    let handler = super::anthropic::AnthropicHandler;
    let (url, mut headers, mut body) = handler
        .prepare_for_stream(gw, ctx, &anthropic_parsed)
        .await?;
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), Value::Bool(true));
    }

    let http = client::client_for(&ctx.account, &gw.settings, TimeoutClass::Streaming)?;
    let response = client::post_json(&http, &url, headers, &body).await?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let resp_headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        return Ok(StreamAttempt::Failure {
            status,
            headers: resp_headers,
            body: text,
        });
    }

    let mut adapter = AnthropicToGemini::new(&ctx.model);
    let outcome = relay_sse(response, &mut adapter, tx, &gw.settings.scheduler).await;
    Ok(StreamAttempt::Streamed(outcome))
}

fn reparse_as_anthropic(parsed: &ParsedRequest, body: Value) -> GatewayResult<ParsedRequest> {
    let mut converted = crate::scheduler::fingerprint::parse(
        body,
        crate::scheduler::WireFormat::Anthropic,
        Some(&parsed.model),
        Some(parsed.stream),
        parsed.session_context.clone(),
    )?;
    converted.id = parsed.id.clone();
    Ok(converted)
}

/// Converts an Anthropic Messages SSE stream into Gemini chunks.
struct AnthropicToGemini {
    model: String,
    finished: bool,
}

impl AnthropicToGemini {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finished: false,
        }
    }

    fn chunk(&self, text: &str, finish: Option<&str>, tracker: &UsageTracker) -> Bytes {
        let mut candidate = Map::new();
        candidate.insert(
            "content".to_string(),
            json!({"role": "model", "parts": if text.is_empty() { json!([]) } else { json!([{"text": text}]) }}),
        );
        candidate.insert("index".to_string(), json!(0));
        if let Some(reason) = finish {
            candidate.insert("finishReason".to_string(), json!(reason));
        }
        let usage = tracker.current();
        let mut body = Map::new();
        body.insert("candidates".to_string(), json!([Value::Object(candidate)]));
        body.insert("modelVersion".to_string(), json!(self.model));
        if finish.is_some() {
            body.insert(
                "usageMetadata".to_string(),
                json!({
                    "promptTokenCount": usage.input + usage.cache_read,
                    "candidatesTokenCount": usage.output,
                    "cachedContentTokenCount": usage.cache_read,
                    "totalTokenCount": usage.total(),
                }),
            );
        }
        Bytes::from(format!("data: {}\n\n", Value::Object(body)))
    }
}

impl StreamAdapter for AnthropicToGemini {
    fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes> {
        let mut out = Vec::new();
        let Some(data) = parse_sse_data(line) else {
            return out;
        };
        if client::is_sse_done(data) {
            return out;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return out;
        };

        let decoded = decode_anthropic_event(&event);
        tracker.observe(&decoded);

        match decoded {
            UpstreamEvent::ContentBlockDelta => {
                if let Some(text) = event
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                {
                    if !text.is_empty() {
                        out.push(self.chunk(text, None, tracker));
                    }
                }
            }
            UpstreamEvent::MessageDelta { .. } => {
                let reason = match event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    Some("max_tokens") => "MAX_TOKENS",
                    _ => "STOP",
                };
                self.finished = true;
                out.push(self.chunk("", Some(reason), tracker));
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self, tracker: &UsageTracker) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![self.chunk("", Some("STOP"), tracker)]
    }
}
