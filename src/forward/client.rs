//! HTTP client utilities for upstream forwarding.
//!
//! Clients are pooled per `(proxy, timeout class)` so accounts sharing an
//! exit share connections. Upstream hosts are resolved before first use and
//! private address space is refused unless the operator opts in.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use reqwest::{header::HeaderMap, Client, Proxy, Response};
use serde_json::Value;

use crate::accounts::Account;
use crate::config::Settings;
use crate::forward::error::{GatewayError, GatewayResult};

/// Timeout class for a pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    /// Buffered request/response exchanges.
    Buffered,
    /// SSE relays; the overall deadline is enforced by the read loop, the
    /// client only bounds connect time.
    Streaming,
}

static CLIENT_POOL: Lazy<DashMap<(String, TimeoutClass), Client>> = Lazy::new(DashMap::new);

fn build_client(proxy: Option<(&str, Option<(&str, &str)>)>, class: TimeoutClass) -> GatewayResult<Client> {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));
    builder = match class {
        TimeoutClass::Buffered => builder.timeout(Duration::from_secs(120)),
        TimeoutClass::Streaming => builder,
    };

    if let Some((url, auth)) = proxy {
        let mut p = Proxy::all(url)
            .map_err(|e| GatewayError::Internal(format!("invalid proxy url: {}", e)))?;
        if let Some((user, pass)) = auth {
            p = p.basic_auth(user, pass);
        }
        builder = builder.proxy(p);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// Pooled client for an account, honoring its proxy binding.
pub fn client_for(
    account: &Account,
    settings: &Settings,
    class: TimeoutClass,
) -> GatewayResult<Client> {
    let proxy = account
        .proxy_id
        .as_deref()
        .and_then(|id| settings.proxy_endpoint(id));

    let pool_key = (
        proxy.map(|p| p.url.clone()).unwrap_or_default(),
        class,
    );
    if let Some(client) = CLIENT_POOL.get(&pool_key) {
        return Ok(client.clone());
    }

    let client = build_client(
        proxy.map(|p| {
            (
                p.url.as_str(),
                p.username
                    .as_deref()
                    .zip(p.password.as_deref()),
            )
        }),
        class,
    )?;
    CLIENT_POOL.insert(pool_key, client.clone());
    Ok(client)
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Refuse upstream URLs that resolve into private address space unless the
/// operator allows them.
pub async fn validate_upstream_url(url: &str, allow_private: bool) -> GatewayResult<()> {
    if allow_private {
        return Ok(());
    }
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| GatewayError::Internal(format!("invalid upstream url '{}': {}", url, e)))?;
    let Some(host) = parsed.host_str() else {
        return Err(GatewayError::Internal(format!(
            "upstream url '{}' has no host",
            url
        )));
    };
    let port = parsed.port_or_known_default().unwrap_or(443);

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(GatewayError::Internal(format!(
                "upstream '{}' resolves to a private address",
                host
            )));
        }
        return Ok(());
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| GatewayError::Upstream(format!("resolving '{}': {}", host, e)))?;
    for addr in addrs {
        if is_private_ip(addr.ip()) {
            return Err(GatewayError::Internal(format!(
                "upstream '{}' resolves to a private address",
                host
            )));
        }
    }
    Ok(())
}

/// POST a JSON body upstream, mapping connection-level failures.
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> GatewayResult<Response> {
    client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("upstream request timed out: {}", e))
            } else {
                GatewayError::Upstream(format!("upstream request failed: {}", e))
            }
        })
}

/// Parse an SSE line's data payload.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Check if an SSE payload marks stream end.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete SSE lines from a byte buffer.
///
/// Handles chunked responses where line breaks split across reads. A line
/// that outgrows `max_line_bytes` without terminating is dropped to keep a
/// misbehaving upstream from ballooning memory.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8], max_line_bytes: usize) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };

        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > max_line_bytes {
            tracing::warn!(len = line.len(), "dropping oversized SSE line");
            continue;
        }

        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    if buffer.len() > max_line_bytes {
        tracing::warn!(len = buffer.len(), "discarding oversized partial SSE line");
        buffer.clear();
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_LINE: usize = 1024 * 1024;

    #[test]
    fn parse_sse_data_variants() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message_start"), None);
        assert_eq!(parse_sse_data("hello"), None);
    }

    #[test]
    fn drain_sse_lines_partial() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":", MAX_LINE);
        assert!(lines.is_empty());

        let lines = drain_sse_lines(&mut buffer, b"1}\n", MAX_LINE);
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_sse_lines_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\n", MAX_LINE);
        assert_eq!(lines, vec!["data: ok"]);
    }

    #[test]
    fn oversized_line_is_dropped() {
        let mut buffer = Vec::new();
        let mut chunk = vec![b'x'; 64];
        chunk.push(b'\n');
        chunk.extend_from_slice(b"data: ok\n");
        let lines = drain_sse_lines(&mut buffer, &chunk, 32);
        assert_eq!(lines, vec!["data: ok"]);
    }

    #[tokio::test]
    async fn private_ip_literals_are_refused() {
        assert!(validate_upstream_url("https://10.0.0.5/v1", false)
            .await
            .is_err());
        assert!(validate_upstream_url("https://127.0.0.1:8080/v1", false)
            .await
            .is_err());
        assert!(validate_upstream_url("https://[::1]/v1", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn private_ips_allowed_when_opted_in() {
        assert!(validate_upstream_url("https://10.0.0.5/v1", true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn public_ip_literal_passes() {
        assert!(validate_upstream_url("https://8.8.8.8/v1", false)
            .await
            .is_ok());
    }
}
