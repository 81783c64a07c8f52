//! Gateway configuration.
//!
//! Settings are loaded from a TOML file (`$RELAY_GATEWAY_CONFIG`, falling
//! back to `<data_dir>/relay-gateway/config.toml`). Every section carries
//! serde defaults so a partial file, or no file at all, yields a runnable
//! configuration.

use std::{fs, path::PathBuf};

use crate::error::{AppError, AppResult};

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    /// Listen address for the inbound HTTP server.
    pub listen: String,
    /// Model ids exposed through `GET /v1/models`.
    pub supported_models: Vec<String>,
    /// Per-model pricing table.
    pub pricing: Vec<ModelPrice>,
    /// Long-context billing surcharge.
    pub long_context: LongContextConfig,
    /// Scheduling and forwarding tunables.
    pub scheduler: SchedulerConfig,
    /// Operator rules that mark an account temporarily unschedulable when an
    /// upstream response matches.
    pub unschedulable_rules: Vec<TempUnschedulableRule>,
    /// Named outbound proxies, referenced by account `proxy_id`.
    pub proxies: Vec<ProxyEndpoint>,
    /// Permit upstream base URLs that resolve to private address space.
    pub allow_private_upstreams: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            supported_models: vec![
                "claude-sonnet-4-5".to_string(),
                "claude-opus-4-1".to_string(),
                "claude-haiku-4-5".to_string(),
                "gemini-2.5-pro".to_string(),
                "gemini-2.5-flash".to_string(),
            ],
            pricing: Vec::new(),
            long_context: LongContextConfig::default(),
            scheduler: SchedulerConfig::default(),
            unschedulable_rules: Vec::new(),
            proxies: Vec::new(),
            allow_private_upstreams: false,
        }
    }
}

/// Pricing entry, USD per million tokens.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ModelPrice {
    pub model: String,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_creation_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    /// Group- or operator-level multiplier applied on top of base rates.
    pub rate_multiplier: f64,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            model: String::new(),
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_creation_per_mtok: 3.75,
            cache_read_per_mtok: 0.3,
            rate_multiplier: 1.0,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LongContextConfig {
    /// Input tokens beyond this threshold bill at `extra_multiplier` x base.
    pub threshold_tokens: i64,
    pub extra_multiplier: f64,
}

impl Default for LongContextConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 200_000,
            extra_multiplier: 2.0,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upstream `retryDelay` at or above this many seconds skips in-place
    /// retry and fails over immediately.
    pub short_retry_threshold_secs: u64,
    /// In-place retry attempts for short-delay rate limits.
    pub max_in_place_attempts: u32,
    /// Hard deadline for slot acquisition.
    pub wait_deadline_secs: u64,
    /// Poll interval while waiting for a slot.
    pub wait_poll_ms: u64,
    /// Heartbeat interval for streaming requests stuck in the wait queue.
    pub wait_heartbeat_secs: u64,
    /// How long to keep reading upstream after the client disconnects.
    pub drain_window_secs: u64,
    /// Abort a stream after this long without a byte from upstream.
    pub stream_idle_timeout_secs: u64,
    /// Overall upstream deadline, independent of the client connection.
    pub upstream_deadline_secs: u64,
    /// Sticky-session binding TTL.
    pub session_ttl_secs: u64,
    /// Fallback per-model rate-limit window when the upstream gives none.
    pub default_model_rate_limit_secs: u64,
    /// Capacity-exhausted retries in single-account mode.
    pub capacity_retry_attempts: u32,
    /// Per-attempt wait clamp in single-account capacity retries.
    pub capacity_retry_max_wait_secs: u64,
    /// Total wait bound across single-account capacity retries.
    pub capacity_retry_total_wait_secs: u64,
    /// Network-error retries before failing over.
    pub network_retry_attempts: u32,
    /// Cooldown applied when an upstream reports overload (529).
    pub overload_cooldown_secs: u64,
    /// Ceiling on an SSE line read from upstream.
    pub max_sse_line_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            short_retry_threshold_secs: 7,
            max_in_place_attempts: 1,
            wait_deadline_secs: 60,
            wait_poll_ms: 100,
            wait_heartbeat_secs: 5,
            drain_window_secs: 30,
            stream_idle_timeout_secs: 60,
            upstream_deadline_secs: 600,
            session_ttl_secs: 300,
            default_model_rate_limit_secs: 60,
            capacity_retry_attempts: 3,
            capacity_retry_max_wait_secs: 15,
            capacity_retry_total_wait_secs: 30,
            network_retry_attempts: 3,
            overload_cooldown_secs: 60,
            max_sse_line_bytes: 1024 * 1024,
        }
    }
}

/// Operator rule: when an upstream response matches the status code and any
/// keyword, the account is parked for `duration_secs`.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TempUnschedulableRule {
    pub name: String,
    pub status_codes: Vec<u16>,
    /// Case-insensitive substrings matched against the response body. Empty
    /// means the status codes alone match.
    pub keywords: Vec<String>,
    pub retry_enabled: bool,
    /// In-place retries before parking; capped at 10.
    pub retry_count: u32,
    pub duration_secs: u64,
}

impl Default for TempUnschedulableRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            status_codes: Vec::new(),
            keywords: Vec::new(),
            retry_enabled: false,
            retry_count: 0,
            duration_secs: 300,
        }
    }
}

impl TempUnschedulableRule {
    pub fn matches(&self, status: u16, body: &str) -> bool {
        if !self.status_codes.contains(&status) {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }
        let lowered = body.to_lowercase();
        self.keywords
            .iter()
            .any(|kw| lowered.contains(&kw.to_lowercase()))
    }

    /// Effective retry budget, bounded so a misconfigured rule cannot spin.
    pub fn effective_retry_count(&self) -> u32 {
        self.retry_count.min(10)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProxyEndpoint {
    pub id: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Settings {
    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.pricing
            .iter()
            .find(|p| p.model == model || model.starts_with(&p.model))
            .cloned()
            .unwrap_or_else(|| ModelPrice {
                model: model.to_string(),
                ..ModelPrice::default()
            })
    }

    pub fn proxy_endpoint(&self, proxy_id: &str) -> Option<&ProxyEndpoint> {
        self.proxies.iter().find(|p| p.id == proxy_id)
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RELAY_GATEWAY_CONFIG") {
        return PathBuf::from(path);
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    fs::create_dir_all(&p).ok();
    p.push("config.toml");
    p
}

/// Load settings from disk, falling back to defaults when the file is
/// missing. A malformed file is an error rather than a silent default.
pub fn load() -> AppResult<Settings> {
    let path = config_path();
    match fs::read_to_string(&path) {
        Ok(raw) => {
            toml::from_str(&raw).map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(e) => Err(AppError::Io(e)),
    }
}

pub fn save(settings: &Settings) -> AppResult<()> {
    let raw = toml::to_string_pretty(settings)
        .map_err(|e| AppError::Config(format!("serialize settings: {}", e)))?;
    fs::write(config_path(), raw)?;
    Ok(())
}
