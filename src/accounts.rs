//! Account, group, API-key and user data model.
//!
//! Accounts are created and administered outside this service; the gateway
//! reads them through [`crate::store::repo::AccountRepository`] and mutates
//! only the transient scheduling fields. Credentials and the `extra` bag
//! stay untyped JSON for persistence compatibility; typed views expose the
//! fields the forwarding path needs.

use chrono::{DateTime, Utc};
use serde_json::Value;

pub type AccountId = i64;
pub type GroupId = i64;
pub type UserId = i64;
pub type ApiKeyId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    OpenAI,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Platform::Anthropic),
            "openai" => Some(Platform::OpenAI),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAI => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    /// Model families this platform serves without an explicit mapping.
    pub fn supports_model_family(&self, model: &str) -> bool {
        match self {
            Platform::Anthropic | Platform::Antigravity => model.starts_with("claude"),
            Platform::Gemini => model.starts_with("gemini"),
            // OpenAI-compatible upstreams only serve what their mapping claims.
            Platform::OpenAI => false,
        }
    }

    /// Default API origin when the account carries no `base_url`.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Platform::Anthropic => "https://api.anthropic.com",
            Platform::OpenAI => "https://api.openai.com",
            Platform::Gemini => "https://generativelanguage.googleapis.com",
            Platform::Antigravity => "https://api.anthropic.com",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Oauth,
    SetupToken,
    Apikey,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingMode {
    Mixed,
    RoundRobin,
    LoadAware,
}

impl Default for SchedulingMode {
    fn default() -> Self {
        SchedulingMode::Mixed
    }
}

/// One upstream credential.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub status: AccountStatus,
    /// Operator kill-switch; `temp_unschedulable_until` overrides it.
    pub schedulable: bool,
    /// 0 = unlimited.
    pub concurrency_cap: u32,
    /// Smaller is preferred.
    pub priority: i32,
    /// Untyped credential store (access_token, refresh_token, expires_at,
    /// api_key, base_url, project_id, ...).
    pub credentials: Value,
    /// Untyped extension store (model_mapping, model_rate_limits,
    /// account_uuid, ...).
    pub extra: Value,
    pub proxy_id: Option<String>,
    pub groups: Vec<GroupId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overload_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn credentials(&self) -> CredentialsView<'_> {
        CredentialsView(&self.credentials)
    }

    pub fn extra(&self) -> ExtraView<'_> {
        ExtraView(&self.extra)
    }

    /// Live schedulability check, applied both when snapshots materialize
    /// and again per candidate at selection time.
    pub fn is_schedulable_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Active || !self.schedulable {
            return false;
        }
        if matches!(self.temp_unschedulable_until, Some(t) if t > now) {
            return false;
        }
        if matches!(self.rate_limit_reset_at, Some(t) if t > now) {
            return false;
        }
        if matches!(self.overload_until, Some(t) if t > now) {
            return false;
        }
        true
    }

    /// Whether this account may serve `model`: an explicit mapping claim
    /// wins; with no mapping at all the platform's native family decides.
    pub fn allows_model(&self, model: &str) -> bool {
        match self.extra().model_mapping() {
            Some(mapping) => mapping.contains_key(model),
            None => self.platform.supports_model_family(model),
        }
    }

    /// Upstream model id after applying the account's mapping.
    pub fn mapped_model(&self, model: &str) -> String {
        self.extra()
            .model_mapping()
            .and_then(|m| m.get(model))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| model.to_string())
    }

    /// Per-model rate limit from `extra.model_rate_limits`.
    pub fn model_rate_limited(&self, model: &str, now: DateTime<Utc>) -> bool {
        self.extra()
            .model_rate_limit_reset(model)
            .map(|reset| reset > now)
            .unwrap_or(false)
    }

    /// Effective API origin. Antigravity API-key accounts are routed through
    /// the vendor's dedicated path prefix.
    pub fn effective_base_url(&self) -> String {
        let base = self
            .credentials()
            .base_url()
            .unwrap_or_else(|| self.platform.default_base_url().to_string());
        let base = base.trim_end_matches('/').to_string();
        if self.platform == Platform::Antigravity && self.account_type == AccountType::Apikey {
            format!("{}/antigravity", base)
        } else {
            base
        }
    }

    /// True when the credential can be refreshed after a 401/403.
    pub fn has_refreshable_token(&self) -> bool {
        matches!(self.account_type, AccountType::Oauth | AccountType::SetupToken)
            && self.credentials().refresh_token().is_some()
    }
}

/// Typed read view over the untyped credential store.
pub struct CredentialsView<'a>(&'a Value);

impl<'a> CredentialsView<'a> {
    fn str_field(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    pub fn access_token(&self) -> Option<String> {
        self.str_field("access_token")
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.str_field("refresh_token")
    }

    pub fn api_key(&self) -> Option<String> {
        self.str_field("api_key")
    }

    pub fn base_url(&self) -> Option<String> {
        self.str_field("base_url")
    }

    pub fn project_id(&self) -> Option<String> {
        self.str_field("project_id")
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.0.get("expires_at") {
            Some(Value::String(s)) => s.parse().ok(),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            _ => None,
        }
    }
}

/// Typed read view over the untyped `extra` store.
pub struct ExtraView<'a>(&'a Value);

impl<'a> ExtraView<'a> {
    /// `extra.model_mapping`: requested model -> upstream model. An empty
    /// object counts as "no routing configured".
    pub fn model_mapping(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0
            .get("model_mapping")
            .and_then(|v| v.as_object())
            .filter(|m| !m.is_empty())
    }

    pub fn model_rate_limit_reset(&self, model: &str) -> Option<DateTime<Utc>> {
        self.0
            .get("model_rate_limits")?
            .get(model)?
            .get("reset_at")?
            .as_str()?
            .parse()
            .ok()
    }

    pub fn account_uuid(&self) -> Option<String> {
        self.0
            .get("account_uuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// A named routing policy over a set of accounts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub daily_limit_usd: Option<f64>,
    pub weekly_limit_usd: Option<f64>,
    pub monthly_limit_usd: Option<f64>,
    pub is_exclusive: bool,
    pub mode: SchedulingMode,
    pub is_subscription_type: bool,
    pub allow_negative_balance: bool,
}

impl Group {
    pub fn allows_negative_balance(&self) -> bool {
        self.allow_negative_balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Disabled,
}

/// End-user credential; the bound group decides the routing bucket.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub user_id: UserId,
    /// SHA-256 hex digest of the secret.
    pub hashed_secret: String,
    pub group_id: GroupId,
    pub status: ApiKeyStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance_usd: f64,
    /// 0 = unlimited.
    pub concurrency_cap: u32,
    pub status: UserStatus,
    pub allowed_groups: Vec<GroupId>,
}

/// Subscription window for subscription-typed groups.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Subscription {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub expires_at: DateTime<Utc>,
}
