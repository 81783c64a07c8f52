//! Inbound request middleware.
//!
//! Resolves the caller's API key to its user/group/subscription record and
//! extracts the session context that feeds fingerprinting.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::accounts::{ApiKeyStatus, UserStatus};
use crate::forward::context::AuthedCaller;
use crate::forward::error::{GatewayError, GatewayResult};
use crate::scheduler::SessionContext;
use crate::state::Gateway;

/// Extract the client's API key from request headers.
///
/// Priority order:
/// 1. `Authorization: Bearer <key>`
/// 2. `x-api-key` (Anthropic style)
/// 3. `x-goog-api-key` (Gemini style)
pub fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = auth.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(token) = header_value(headers, name) {
            return Some(token);
        }
    }

    None
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// SHA-256 hex digest used to look up stored API keys.
pub fn hash_api_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Resolve the caller or fail with 401.
pub async fn authenticate(gw: &Gateway, headers: &HeaderMap) -> GatewayResult<AuthedCaller> {
    let token = extract_request_token(headers)
        .ok_or_else(|| GatewayError::AuthError("missing API key".to_string()))?;

    let api_key = gw
        .directory
        .get_api_key_by_hash(&hash_api_key(&token))
        .await?
        .ok_or_else(|| GatewayError::AuthError("invalid API key".to_string()))?;
    if api_key.status != ApiKeyStatus::Active {
        return Err(GatewayError::AuthError("API key is disabled".to_string()));
    }

    let user = gw
        .directory
        .get_user(api_key.user_id)
        .await?
        .ok_or_else(|| GatewayError::AuthError("user not found".to_string()))?;
    if user.status != UserStatus::Active {
        return Err(GatewayError::AuthError("user is disabled".to_string()));
    }

    let group = gw
        .directory
        .get_group(api_key.group_id)
        .await?
        .ok_or_else(|| GatewayError::AuthError("API key has no routing group".to_string()))?;
    if !user.allowed_groups.is_empty() && !user.allowed_groups.contains(&group.id) {
        return Err(GatewayError::AuthError(
            "user is not allowed in this group".to_string(),
        ));
    }

    let subscription = gw.directory.get_subscription(user.id, group.id).await?;

    Ok(AuthedCaller {
        api_key,
        user,
        group,
        subscription,
    })
}

/// Caller identity for fingerprinting. The forwarded-for chain wins over
/// the socket address so fingerprints survive load balancers.
pub fn session_context(
    headers: &HeaderMap,
    remote_addr: Option<&str>,
    api_key_id: i64,
) -> SessionContext {
    let client_ip = header_value(headers, "x-forwarded-for")
        .map(|chain| {
            chain
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .or_else(|| header_value(headers, "x-real-ip"))
        .or_else(|| remote_addr.map(|a| a.to_string()))
        .unwrap_or_default();

    SessionContext {
        client_ip,
        user_agent: header_value(headers, "user-agent").unwrap_or_default(),
        api_key_id: api_key_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_priority_bearer_first() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-a"));
        headers.insert("x-api-key", HeaderValue::from_static("tok-b"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("tok-a"));
    }

    #[test]
    fn token_falls_back_to_api_key_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("tok-b"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("tok-b"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("tok-g"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("tok-g"));
    }

    #[test]
    fn missing_token_is_none() {
        assert_eq!(extract_request_token(&HeaderMap::new()), None);
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = hash_api_key("sk-test");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_api_key("sk-test"));
        assert_ne!(h, hash_api_key("sk-test2"));
    }

    #[test]
    fn forwarded_for_wins_over_remote_addr() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("user-agent", HeaderValue::from_static("client/1.0"));
        let ctx = session_context(&headers, Some("192.168.1.1:5000"), 42);
        assert_eq!(ctx.client_ip, "203.0.113.7");
        assert_eq!(ctx.user_agent, "client/1.0");
        assert_eq!(ctx.api_key_id, "42");
    }

    #[test]
    fn remote_addr_is_fallback() {
        let ctx = session_context(&HeaderMap::new(), Some("192.168.1.1:5000"), 1);
        assert_eq!(ctx.client_ip, "192.168.1.1:5000");
    }
}
