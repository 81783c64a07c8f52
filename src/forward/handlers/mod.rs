//! Platform handlers.
//!
//! One handler per inbound wire format. Each handler serves every account
//! platform behind that format, converting between wire formats where the
//! account's vendor differs from the client's.

pub mod anthropic;
pub mod gemini;

use axum::body::Bytes;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::forward::client::drain_sse_lines;
use crate::forward::context::ForwardContext;
use crate::forward::error::GatewayResult;
use crate::forward::usage::{Usage, UsageTracker};
use crate::scheduler::{ParsedRequest, WireFormat};
use crate::state::Gateway;

/// Result of one buffered forwarding attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// 2xx; the reconciled body is what goes back to the client.
    Success { body: Value, usage: Usage },
    /// Non-2xx; handed to the retry controller for classification.
    Failure {
        status: u16,
        headers: HeaderMap,
        body: String,
    },
}

/// Result of one streaming attempt.
#[derive(Debug)]
pub enum StreamAttempt {
    /// Upstream accepted and the relay ran to its end.
    Streamed(StreamOutcome),
    /// Upstream refused before any frame reached the client; retryable.
    Failure {
        status: u16,
        headers: HeaderMap,
        body: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub client_disconnect: bool,
}

/// Wire-format dispatch.
pub enum WireHandler {
    Anthropic(anthropic::AnthropicHandler),
    Gemini(gemini::GeminiHandler),
}

pub fn handler_for(wire: WireFormat) -> WireHandler {
    match wire {
        WireFormat::Anthropic => WireHandler::Anthropic(anthropic::AnthropicHandler),
        WireFormat::Gemini => WireHandler::Gemini(gemini::GeminiHandler),
    }
}

impl WireHandler {
    pub async fn attempt_buffered(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
    ) -> GatewayResult<AttemptOutcome> {
        match self {
            WireHandler::Anthropic(h) => h.attempt_buffered(gw, ctx, parsed).await,
            WireHandler::Gemini(h) => h.attempt_buffered(gw, ctx, parsed).await,
        }
    }

    pub async fn attempt_stream(
        &self,
        gw: &Gateway,
        ctx: &ForwardContext,
        parsed: &ParsedRequest,
        tx: &mpsc::Sender<Bytes>,
    ) -> GatewayResult<StreamAttempt> {
        match self {
            WireHandler::Anthropic(h) => h.attempt_stream(gw, ctx, parsed, tx).await,
            WireHandler::Gemini(h) => h.attempt_stream(gw, ctx, parsed, tx).await,
        }
    }
}

/// Per-line stream adaptation: translate upstream SSE lines into client
/// frames and harvest usage along the way.
pub trait StreamAdapter: Send {
    fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes>;

    /// Frames emitted after upstream ends cleanly.
    fn finish(&mut self, tracker: &UsageTracker) -> Vec<Bytes>;
}

/// Relay an accepted upstream SSE response to the client.
///
/// The read loop runs under the upstream deadline, independent of the
/// client connection. A failed client send flips `client_disconnect` and
/// reading continues solely for usage extraction, bounded by the drain
/// window or until the final output count is known.
pub async fn relay_sse(
    response: reqwest::Response,
    adapter: &mut dyn StreamAdapter,
    tx: &mpsc::Sender<Bytes>,
    cfg: &SchedulerConfig,
) -> StreamOutcome {
    let deadline = Instant::now() + std::time::Duration::from_secs(cfg.upstream_deadline_secs);
    let idle = std::time::Duration::from_secs(cfg.stream_idle_timeout_secs);
    let drain_window = std::time::Duration::from_secs(cfg.drain_window_secs);

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut tracker = UsageTracker::new();
    let mut client_disconnect = false;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if Instant::now() >= deadline {
            tracing::warn!("upstream deadline reached mid-stream");
            break;
        }
        if let Some(limit) = drain_deadline {
            if Instant::now() >= limit {
                tracing::debug!("drain window elapsed after client disconnect");
                break;
            }
        }

        let chunk = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                tracing::warn!("upstream stream idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "upstream stream read error");
                break;
            }
            Ok(Some(Ok(bytes))) => bytes,
        };

        for line in drain_sse_lines(&mut buffer, &chunk, cfg.max_sse_line_bytes) {
            let frames = adapter.on_line(&line, &mut tracker);
            if client_disconnect {
                continue;
            }
            for frame in frames {
                // A stalled client counts as gone; the write path must not
                // wedge the read loop past its deadlines.
                let sent = tokio::time::timeout(idle, tx.send(frame)).await;
                if !matches!(sent, Ok(Ok(()))) {
                    client_disconnect = true;
                    drain_deadline = Some(Instant::now() + drain_window);
                    tracing::info!("client disconnected, draining upstream for usage");
                    break;
                }
            }
        }

        // Once the final output count arrived there is nothing left to
        // drain for.
        if client_disconnect && tracker.has_output() {
            break;
        }
    }

    if !client_disconnect {
        for frame in adapter.finish(&tracker) {
            if tx.send(frame).await.is_err() {
                client_disconnect = true;
                break;
            }
        }
    }

    StreamOutcome {
        usage: tracker.current(),
        client_disconnect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::client::parse_sse_data;
    use crate::forward::usage::decode_anthropic_event;

    /// Minimal passthrough adapter for exercising the relay loop directly.
    struct Passthrough;

    impl StreamAdapter for Passthrough {
        fn on_line(&mut self, line: &str, tracker: &mut UsageTracker) -> Vec<Bytes> {
            if let Some(data) = parse_sse_data(line) {
                if let Ok(value) = serde_json::from_str(data) {
                    tracker.observe(&decode_anthropic_event(&value));
                }
            }
            vec![Bytes::from(format!("{}\n", line))]
        }

        fn finish(&mut self, _tracker: &UsageTracker) -> Vec<Bytes> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn relay_forwards_and_harvests() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":11}}}\n",
            "\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n",
            "\n",
        );
        let response = http_response(body);
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let mut adapter = Passthrough;

        let outcome = relay_sse(response, &mut adapter, &tx, &SchedulerConfig::default()).await;
        assert!(!outcome.client_disconnect);
        assert_eq!(outcome.usage.input, 11);
        assert_eq!(outcome.usage.output, 5);

        drop(tx);
        let mut forwarded = Vec::new();
        while let Some(frame) = rx.recv().await {
            forwarded.extend_from_slice(&frame);
        }
        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.contains("message_start"));
        assert!(text.contains("message_delta"));
    }

    #[tokio::test]
    async fn relay_drains_after_disconnect() {
        let body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hello\"}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n",
        );
        let response = http_response(body);
        // Zero-capacity receiver dropped immediately: every send fails.
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        let mut adapter = Passthrough;

        let outcome = relay_sse(response, &mut adapter, &tx, &SchedulerConfig::default()).await;
        assert!(outcome.client_disconnect);
        // Usage was still collected from the drained tail.
        assert_eq!(outcome.usage.input, 9);
        assert_eq!(outcome.usage.output, 42);
    }

    fn http_response(body: &'static str) -> reqwest::Response {
        reqwest::Response::from(http::Response::new(body))
    }
}
