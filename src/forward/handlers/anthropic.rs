//! Anthropic Messages forwarding.
//!
//! Serves every account platform behind the `/v1/messages` wire: native
//! Anthropic and Antigravity accounts, OpenAI-compatible relays speaking
//! the same format, and Gemini accounts through the cross-format mapping
//! in [`super::gemini`].

use axum::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::accounts::{AccountType, Platform};
use crate::forward::client::{self, parse_sse_data, TimeoutClass};
use crate::forward::context::ForwardContext;
use crate::forward::error::{GatewayError, GatewayResult};
use crate::forward::usage::{self, decode_anthropic_event, UsageTracker};
use crate::scheduler::ParsedRequest;
use crate::state::Gateway;

use super::{gemini, relay_sse, AttemptOutcome, StreamAdapter, StreamAttempt};

/// Allowed fields for the Messages API
const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "stream",
    "system",
    "temperature",
    "top_p",
    "top_k",
    "stop_sequences",
    "metadata",
    "tools",
    "tool_choice",
    "thinking",
    "betas",
];

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta tokens the OAuth surface requires.
const REQUIRED_OAUTH_BETAS: &[&str] = &["oauth-2025-04-20", "interleaved-thinking-2025-05-14"];

/// Beta tokens stripped from client requests before forwarding.
const STRIPPED_BETAS: &[&str] = &["context-1m-2025-08-07"];

/// Canonical system-prompt signature the OAuth upstream expects.
const CLI_SYSTEM_SIGNATURE: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

const CLI_USER_AGENT: &str = "claude-cli/1.0.83 (external, cli)";

static PATH_LEAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/(?:Users|home)/[\w.-]+(?:/[\w.-]+)*|[A-Za-z]:\\(?:[\w.-]+\\?)+)")
        .expect("path leak pattern")
});

pub struct AnthropicHandler;

/// Merge required beta tokens with the client's, dropping the strip set.
/// Order is `required` then surviving incoming tokens; duplicates are
/// removed case-sensitively and re-merging is a no-op.
pub fn merge_anthropic_beta(required: &[&str], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = required.iter().map(|s| s.to_string()).collect();
    for token in incoming {
        let token = token.trim();
        if token.is_empty()
            || out.iter().any(|t| t == token)
            || STRIPPED_BETAS.contains(&token)
        {
            continue;
        }
        out.push(token.to_string());
    }
    out
}

fn incoming_betas(body: &Value) -> Vec<String> {
    body.get("betas")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Filter payload to only include allowed fields
fn filter_payload(payload: &Value, allowed: &[&str]) -> Value {
    if let Some(obj) = payload.as_object() {
        let filtered: serde_json::Map<String, Value> = obj
            .iter()
            .filter(|(key, _)| allowed.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(filtered)
    } else {
        payload.clone()
    }
}

fn scrub_text(text: &str) -> String {
    PATH_LEAK.replace_all(text, "").into_owned()
}

/// Normalize the system prompt for an OAuth upstream: scrub path leaks and
/// make sure the first block carries the canonical CLI signature.
fn sanitize_system(body: &mut Value, oauth: bool) {
    let Some(obj) = body.as_object_mut() else { return };

    let system = obj.get("system").cloned();
    let mut blocks: Vec<Value> = match system {
        Some(Value::String(text)) => vec![serde_json::json!({
            "type": "text",
            "text": scrub_text(&text),
        })],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|mut block| {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    let scrubbed = scrub_text(text);
                    block["text"] = Value::String(scrubbed);
                }
                block
            })
            .collect(),
        _ => Vec::new(),
    };

    if oauth {
        let has_signature = blocks
            .first()
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|t| t.trim_start().starts_with(CLI_SYSTEM_SIGNATURE))
            .unwrap_or(false);
        if !has_signature {
            blocks.insert(
                0,
                serde_json::json!({"type": "text", "text": CLI_SYSTEM_SIGNATURE}),
            );
        }
    }

    if blocks.is_empty() {
        obj.remove("system");
    } else {
        obj.insert("system".to_string(), Value::Array(blocks));
    }
}

/// Drop `thinking`/`redacted_thinking` blocks from assistant turns. Their
/// signatures are account-bound and reject on any other account.
fn strip_thinking_blocks(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for message in messages {
        if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        content.retain(|block| {
            !matches!(
                block.get("type").and_then(|t| t.as_str()),
                Some("thinking") | Some("redacted_thinking")
            )
        });
    }
}

fn uses_oauth(ctx: &ForwardContext) -> bool {
    matches!(
        ctx.account.account_type,
        AccountType::Oauth | AccountType::SetupToken
    )
}

impl AnthropicHandler {
    pub(crate) fn transform_request(&self, ctx: &ForwardContext, parsed: &ParsedRequest) -> Value {
        let mut body = filter_payload(&parsed.body, ALLOWED_FIELDS);
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(ctx.upstream_model.clone()),
            );
            // `betas` travels in the header, not the body.
            obj.remove("betas");
        }
        sanitize_system(&mut body, uses_oauth(ctx));
        if ctx.crossed_account {
            strip_thinking_blocks(&mut body);
        }
        body
    }

    pub(crate) fn build_headers(
        &self,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
        bearer: Option<&str>,
    ) -> GatewayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

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
                // The OAuth surface checks for its own client.
                headers.insert("user-agent", HeaderValue::from_static(CLI_USER_AGENT));
                headers.insert("x-app", HeaderValue::from_static("cli"));
                headers.insert(
                    "anthropic-dangerous-direct-browser-access",
                    HeaderValue::from_static("true"),
                );
                let betas =
                    merge_anthropic_beta(REQUIRED_OAUTH_BETAS, &incoming_betas(&parsed.body));
                headers.insert(
                    "anthropic-beta",
                    HeaderValue::from_str(&betas.join(",")).map_err(|_| {
                        GatewayError::Internal("beta tokens are not header-safe".to_string())
                    })?,
                );
            }
            AccountType::Apikey | AccountType::Upstream => {
                let key = ctx.account.credentials().api_key().ok_or_else(|| {
                    GatewayError::Internal("api-key account without api_key".to_string())
                })?;
                if ctx.account.platform == Platform::OpenAI {
                    headers.insert(
                        "authorization",
                        HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|_| {
                            GatewayError::Internal("api key is not header-safe".to_string())
                        })?,
                    );
                } else {
                    headers.insert(
                        "x-api-key",
                        HeaderValue::from_str(&key).map_err(|_| {
                            GatewayError::Internal("api key is not header-safe".to_string())
                        })?,
                    );
                }
                let incoming = incoming_betas(&parsed.body);
                if !incoming.is_empty() {
                    let betas = merge_anthropic_beta(&[], &incoming);
                    if !betas.is_empty() {
                        headers.insert(
                            "anthropic-beta",
                            HeaderValue::from_str(&betas.join(",")).map_err(|_| {
                                GatewayError::Internal("beta tokens are not header-safe".to_string())
                            })?,
                        );
                    }
                }
            }
        }
        Ok(headers)
    }

    async fn prepare(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
        path: &str,
    ) -> GatewayResult<(String, HeaderMap, Value)> {
        let base = ctx.account.effective_base_url();
        client::validate_upstream_url(&base, gw.settings.allow_private_upstreams).await?;
        let url = format!("{}{}", base, path);

        let bearer = crate::oauth::bearer_token(gw, &ctx.account).await?;
        let headers = self.build_headers(ctx, parsed, bearer.as_deref())?;
        let body = self.transform_request(ctx, parsed);
        Ok((url, headers, body))
    }

    /// URL/headers/body for a Messages stream; used directly by the
    /// Gemini-wire cross-mapping, which supplies its own stream adapter.
    pub(crate) async fn prepare_for_stream(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
    ) -> GatewayResult<(String, HeaderMap, Value)> {
        self.prepare(gw, ctx, parsed, "/v1/messages").await
    }

    pub async fn attempt_buffered(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
    ) -> GatewayResult<AttemptOutcome> {
        if ctx.account.platform == Platform::Gemini {
            return gemini::anthropic_request_via_gemini(gw, ctx, parsed).await;
        }

        let (url, mut headers, mut body) = self.prepare(gw, ctx, parsed, "/v1/messages").await?;
        headers.insert("accept", HeaderValue::from_static("application/json"));
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(false));
        }

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

        let mut value: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Upstream(format!("parsing upstream response: {}", e)))?;
        let usage = usage::reconcile_anthropic_body(&mut value);
        Ok(AttemptOutcome::Success { body: value, usage })
    }

    pub async fn attempt_stream(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
        tx: &mpsc::Sender<Bytes>,
    ) -> GatewayResult<StreamAttempt> {
        if ctx.account.platform == Platform::Gemini {
            return gemini::anthropic_stream_via_gemini(gw, ctx, parsed, tx).await;
        }

        let (url, mut headers, mut body) = self.prepare(gw, ctx, parsed, "/v1/messages").await?;
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

        let mut adapter = AnthropicPassthrough::default();
        let outcome = relay_sse(response, &mut adapter, tx, &gw.settings.scheduler).await;
        Ok(StreamAttempt::Streamed(outcome))
    }

    /// Billing-gated token counting; no slot accounting, no usage record.
    pub async fn count_tokens(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
    ) -> GatewayResult<AttemptOutcome> {
        let (url, headers, mut body) = self
            .prepare(gw, ctx, parsed, "/v1/messages/count_tokens")
            .await?;
        if let Some(obj) = body.as_object_mut() {
            obj.remove("stream");
            obj.remove("max_tokens");
        }

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
        Ok(AttemptOutcome::Success {
            body: value,
            usage: usage::Usage::default(),
        })
    }
}

/// Forwards native Anthropic SSE frames unchanged while harvesting usage.
/// Mid-stream upstream error events pass through as-is; they are already
/// in the client's wire format.
#[derive(Default)]
struct AnthropicPassthrough;

impl StreamAdapter for AnthropicPassthrough {
    fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes> {
        if let Some(data) = parse_sse_data(line) {
            if !client::is_sse_done(data) {
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    tracker.observe(&decode_anthropic_event(&value));
                }
            }
        }
        vec![Bytes::from(format!("{}\n", line))]
    }

    fn finish(&mut self, _tracker: &UsageTracker) -> Vec<Bytes> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Account, AccountStatus};
    use chrono::Utc;
    use serde_json::json;

    fn account(account_type: AccountType, platform: Platform) -> Account {
        Account {
            id: 1,
            name: "a".to_string(),
            platform,
            account_type,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency_cap: 0,
            priority: 0,
            credentials: json!({"api_key": "sk-test", "access_token": "oat-test"}),
            extra: json!({}),
            proxy_id: None,
            groups: vec![1],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            last_used_at: None,
        }
    }

    fn parsed(body: Value) -> ParsedRequest {
        crate::scheduler::fingerprint::parse(
            body,
            crate::scheduler::WireFormat::Anthropic,
            None,
            None,
            Default::default(),
        )
        .unwrap()
    }

    fn ctx(account_type: AccountType, platform: Platform, crossed: bool) -> ForwardContext {
        let parsed = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let mut c = ForwardContext::new(account(account_type, platform), &parsed, crossed);
        c.crossed_account = crossed;
        c
    }

    #[test]
    fn beta_merge_order_and_dedup() {
        let incoming = vec![
            "interleaved-thinking-2025-05-14".to_string(),
            "context-1m-2025-08-07".to_string(),
            "files-api-2025-04-14".to_string(),
            "files-api-2025-04-14".to_string(),
        ];
        let merged = merge_anthropic_beta(REQUIRED_OAUTH_BETAS, &incoming);
        assert_eq!(
            merged,
            vec![
                "oauth-2025-04-20",
                "interleaved-thinking-2025-05-14",
                "files-api-2025-04-14"
            ]
        );
    }

    #[test]
    fn beta_merge_is_idempotent() {
        let incoming = vec!["files-api-2025-04-14".to_string()];
        let once = merge_anthropic_beta(REQUIRED_OAUTH_BETAS, &incoming);
        let twice = merge_anthropic_beta(REQUIRED_OAUTH_BETAS, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn beta_merge_is_case_sensitive() {
        let incoming = vec!["OAuth-2025-04-20".to_string()];
        let merged = merge_anthropic_beta(REQUIRED_OAUTH_BETAS, &incoming);
        assert!(merged.contains(&"OAuth-2025-04-20".to_string()));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn oauth_headers_carry_identity_and_betas() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Oauth, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "betas": ["files-api-2025-04-14"]
        }));
        let headers = handler.build_headers(&c, &p, Some("oat-test")).unwrap();

        assert_eq!(headers["authorization"], "Bearer oat-test");
        assert_eq!(headers["user-agent"], CLI_USER_AGENT);
        let betas = headers["anthropic-beta"].to_str().unwrap();
        assert!(betas.starts_with("oauth-2025-04-20,interleaved-thinking-2025-05-14"));
        assert!(betas.contains("files-api-2025-04-14"));
        assert!(!headers.contains_key("x-api-key"));
    }

    #[test]
    fn apikey_headers_use_x_api_key() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Apikey, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let headers = handler.build_headers(&c, &p, None).unwrap();
        assert_eq!(headers["x-api-key"], "sk-test");
        assert!(!headers.contains_key("authorization"));
    }

    #[test]
    fn openai_platform_uses_bearer() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Apikey, Platform::OpenAI, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let headers = handler.build_headers(&c, &p, None).unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-test");
    }

    #[test]
    fn transform_filters_and_maps_model() {
        let handler = AnthropicHandler;
        let mut c = ctx(AccountType::Apikey, Platform::Anthropic, false);
        c.upstream_model = "claude-sonnet-4-5-20250929".to_string();
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
            "unknown_field": true
        }));
        let body = handler.transform_request(&c, &p);
        assert_eq!(body["model"], "claude-sonnet-4-5-20250929");
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("unknown_field").is_none());
    }

    #[test]
    fn oauth_system_gains_signature_and_loses_paths() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Oauth, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "system": "Working dir is /Users/alice/projects/secret. Be helpful.",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = handler.transform_request(&c, &p);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], CLI_SYSTEM_SIGNATURE);
        let rest = system[1]["text"].as_str().unwrap();
        assert!(!rest.contains("/Users/alice"));
        assert!(rest.contains("Be helpful."));
    }

    #[test]
    fn existing_signature_is_not_duplicated() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Oauth, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "system": [{"type": "text", "text": CLI_SYSTEM_SIGNATURE}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = handler.transform_request(&c, &p);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 1);
    }

    #[test]
    fn apikey_accounts_keep_string_system_shape() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Apikey, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "system": "plain instructions",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = handler.transform_request(&c, &p);
        // Converted to block form by sanitization but without a signature.
        assert_eq!(body["system"][0]["text"], "plain instructions");
    }

    #[test]
    fn crossed_account_strips_thinking_blocks() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Apikey, Platform::Anthropic, true);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "question"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "...", "signature": "sig"},
                    {"type": "redacted_thinking", "data": "..."},
                    {"type": "text", "text": "answer"}
                ]},
                {"role": "user", "content": "follow-up"}
            ]
        }));
        let body = handler.transform_request(&c, &p);
        let assistant = &body["messages"][1]["content"];
        assert_eq!(assistant.as_array().unwrap().len(), 1);
        assert_eq!(assistant[0]["type"], "text");
    }

    #[test]
    fn same_account_keeps_thinking_blocks() {
        let handler = AnthropicHandler;
        let c = ctx(AccountType::Apikey, Platform::Anthropic, false);
        let p = parsed(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "...", "signature": "sig"},
                    {"type": "text", "text": "answer"}
                ]}
            ]
        }));
        let body = handler.transform_request(&c, &p);
        assert_eq!(body["messages"][0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn windows_paths_are_scrubbed() {
        assert!(!scrub_text(r"log at C:\Users\bob\app.log end").contains(r"C:\Users"));
        assert!(scrub_text("no paths here").contains("no paths here"));
    }
}
