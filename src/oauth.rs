//! Upstream OAuth token management.
//!
//! OAuth and setup-token accounts carry a refresh token; access tokens are
//! refreshed shortly before expiry and the rotated credentials persist
//! through the repository. Antigravity access tokens are additionally
//! cached in the shared store so sibling instances reuse them.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::accounts::{Account, AccountType, Platform};
use crate::forward::error::{GatewayError, GatewayResult};
use crate::state::Gateway;

const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh when the access token has less than this long to live.
fn refresh_margin() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

fn antigravity_cache_key(account: &Account) -> String {
    format!("ag:account:{}", account.id)
}

/// Resolve the bearer token for an account, refreshing when it is about to
/// expire. API-key accounts have no bearer.
pub async fn bearer_token(gw: &Gateway, account: &Account) -> GatewayResult<Option<String>> {
    match account.account_type {
        AccountType::Apikey | AccountType::Upstream => Ok(None),
        AccountType::Oauth | AccountType::SetupToken => {
            if account.platform == Platform::Antigravity {
                return antigravity_token(gw, account).await.map(Some);
            }
            let creds = account.credentials();
            let near_expiry = creds
                .expires_at()
                .map(|at| at - Utc::now() < refresh_margin())
                .unwrap_or(false);
            if near_expiry && creds.refresh_token().is_some() {
                return refresh_access_token(gw, account).await.map(Some);
            }
            match creds.access_token() {
                Some(token) => Ok(Some(token)),
                None if creds.refresh_token().is_some() => {
                    refresh_access_token(gw, account).await.map(Some)
                }
                None => Err(GatewayError::Internal(format!(
                    "account {} has neither access token nor refresh token",
                    account.id
                ))),
            }
        }
    }
}

/// Antigravity tokens are shared through the KV store with a TTL that
/// undercuts the real expiry by the refresh margin.
async fn antigravity_token(gw: &Gateway, account: &Account) -> GatewayResult<String> {
    let key = antigravity_cache_key(account);
    if let Some(token) = gw.kv.get(&key).await? {
        return Ok(token);
    }

    let token = refresh_access_token(gw, account).await?;

    if let Ok(Some(fresh)) = gw.accounts.get_by_id(account.id).await {
        if let Some(expires_at) = fresh.credentials().expires_at() {
            let ttl = (expires_at - Utc::now()) - refresh_margin();
            if let Ok(ttl) = ttl.to_std() {
                gw.kv.set(&key, &token, Some(ttl)).await?;
                if let Some(project_id) = fresh.credentials().project_id() {
                    gw.kv
                        .set(&format!("ag:{}", project_id), &token, Some(ttl))
                        .await?;
                }
            }
        }
    }
    Ok(token)
}

/// Refresh the account's access token against the vendor endpoint and
/// persist the rotated credentials.
pub async fn refresh_access_token(gw: &Gateway, account: &Account) -> GatewayResult<String> {
    let refresh_token = account.credentials().refresh_token().ok_or_else(|| {
        GatewayError::Internal(format!("account {} has no refresh token", account.id))
    })?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| GatewayError::Internal(format!("building oauth client: {}", e)))?;

    let response = match account.platform {
        Platform::Anthropic | Platform::Antigravity | Platform::OpenAI => http
            .post(ANTHROPIC_TOKEN_URL)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await,
        Platform::Gemini => http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await,
    }
    .map_err(|e| GatewayError::Upstream(format!("token refresh request failed: {}", e)))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| GatewayError::Upstream(format!("token refresh response: {}", e)))?;

    if !status.is_success() {
        return Err(GatewayError::Upstream(format!(
            "token refresh returned {}: {}",
            status, body
        )));
    }

    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Upstream("token refresh without access_token".to_string()))?
        .to_string();

    persist_rotation(gw, account, &access_token, &body).await;

    tracing::info!(account_id = account.id, "refreshed upstream access token");
    Ok(access_token)
}

async fn persist_rotation(gw: &Gateway, account: &Account, access_token: &str, body: &Value) {
    let Ok(Some(mut fresh)) = gw.accounts.get_by_id(account.id).await else {
        return;
    };
    let Some(creds) = fresh.credentials.as_object_mut() else {
        return;
    };
    creds.insert("access_token".to_string(), Value::from(access_token));
    if let Some(rotated) = body.get("refresh_token").and_then(|v| v.as_str()) {
        if !rotated.is_empty() {
            creds.insert("refresh_token".to_string(), Value::from(rotated));
        }
    }
    if let Some(expires_in) = body.get("expires_in").and_then(|v| v.as_i64()) {
        let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
        creds.insert("expires_at".to_string(), Value::from(expires_at.to_rfc3339()));
    }
    if let Err(e) = gw.accounts.update(fresh).await {
        tracing::warn!(account_id = account.id, error = %e, "failed to persist rotated credentials");
    }
}
