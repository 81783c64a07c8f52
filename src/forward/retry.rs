//! Upstream failure classification and retry/failover decisions.
//!
//! Classification turns `(status, headers, body)` into a typed failure.
//! The controller then decides, per attempt, between an in-place retry on
//! the same account, a failover to another account (with the appropriate
//! rate-limit or unschedulability mark), or surfacing the error to the
//! client. In single-account retry mode the controller never switches and
//! never writes rate-limit state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{SchedulerConfig, TempUnschedulableRule};
use crate::forward::error::GatewayError;

/// Typed upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFailure {
    /// 5xx or otherwise retryable server-side failure.
    Transient { status: u16, message: String },
    /// Account-wide rate limit.
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// Rate limit scoped to the requested model.
    ModelRateLimited {
        retry_delay: Option<Duration>,
        capacity_exhausted: bool,
    },
    /// 403 carrying billing markers.
    QuotaExceeded { message: String },
    /// 401/403 that a token refresh may cure.
    AuthExpired { status: u16 },
    /// Google "service not enabled" responses.
    ServiceDisabled { message: String },
    /// The vendor's prompt-length 400.
    PromptTooLong { message: String },
    /// Upstream overload (529).
    Overloaded,
    /// Any other 4xx; surfaced untouched.
    Fatal { status: u16, body: String },
    /// Connection-level failure, no HTTP status.
    Network { message: String },
}

/// What to do about a failure.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Retry on the same account after sleeping `delay`; `refresh_auth`
    /// asks the pipeline for a token refresh first.
    RetryInPlace { delay: Duration, refresh_auth: bool },
    /// Exclude this account and re-enter selection, applying `mark` first.
    SwitchAccount { mark: AccountMark, drop_sticky: bool },
    /// Stop; the error goes to the client.
    Surface(GatewayError),
}

/// State pushed onto the failed account before failover.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountMark {
    None,
    RateLimited { reset_at: DateTime<Utc> },
    ModelRateLimited { model: String, reset_at: DateTime<Utc> },
    Overloaded { until: DateTime<Utc> },
    TempUnschedulable { until: DateTime<Utc>, reason: String },
}

/// Parse Google's `retryDelay` shape: `"39s"`, `"3.5s"`.
pub fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim().strip_suffix('s')?;
    let secs: f64 = trimmed.parse().ok()?;
    if secs < 0.0 || !secs.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_epoch(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = headers.get(name)?.to_str().ok()?.trim().parse().ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Anthropic unified rate-limit windows: if any window's utilization has
/// reached 1.0 the account is limited until the latest exceeded reset.
fn unified_rate_limit_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let mut latest: Option<DateTime<Utc>> = None;
    for window in ["5h", "7d"] {
        let utilization = header_f64(
            headers,
            &format!("anthropic-ratelimit-unified-{}-utilization", window),
        );
        let reset = header_epoch(
            headers,
            &format!("anthropic-ratelimit-unified-{}-reset", window),
        );
        if let (Some(utilization), Some(reset)) = (utilization, reset) {
            if utilization >= 1.0 && latest.map(|t| reset > t).unwrap_or(true) {
                latest = Some(reset);
            }
        }
    }
    latest
}

struct GoogleError {
    status: String,
    reason: String,
    retry_delay: Option<Duration>,
    message: String,
}

fn parse_google_error(body: &str) -> Option<GoogleError> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    let status = error
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    let mut reason = String::new();
    let mut retry_delay = None;
    if let Some(details) = error.get("details").and_then(|d| d.as_array()) {
        for detail in details {
            if let Some(r) = detail.get("reason").and_then(|r| r.as_str()) {
                reason = r.to_string();
            }
            if let Some(delay) = detail.get("retryDelay").and_then(|d| d.as_str()) {
                retry_delay = parse_retry_delay(delay);
            }
        }
    }
    Some(GoogleError {
        status,
        reason,
        retry_delay,
        message,
    })
}

const PROMPT_TOO_LONG_PHRASE: &str = "prompt is too long";

/// Derive a typed failure from an upstream response.
pub fn classify(status: u16, headers: &HeaderMap, body: &str) -> UpstreamFailure {
    let google = parse_google_error(body);

    if status == 429 || status == 503 {
        if let Some(g) = &google {
            let capacity = g.reason == "MODEL_CAPACITY_EXHAUSTED";
            let limited = matches!(g.status.as_str(), "RESOURCE_EXHAUSTED" | "UNAVAILABLE")
                && (capacity || g.reason == "RATE_LIMIT_EXCEEDED");
            if limited {
                return UpstreamFailure::ModelRateLimited {
                    retry_delay: g.retry_delay,
                    capacity_exhausted: capacity,
                };
            }
        }
    }

    match status {
        429 => {
            if let Some(reset_at) = unified_rate_limit_reset(headers) {
                return UpstreamFailure::RateLimited {
                    reset_at: Some(reset_at),
                };
            }
            let reset_at = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
            UpstreamFailure::RateLimited { reset_at }
        }
        401 => UpstreamFailure::AuthExpired { status },
        403 => {
            let lowered = body.to_lowercase();
            if lowered.contains("service_disabled")
                || lowered.contains("has not been used in project")
            {
                return UpstreamFailure::ServiceDisabled {
                    message: truncate(body, 300),
                };
            }
            if lowered.contains("billing") || lowered.contains("credit balance") {
                return UpstreamFailure::QuotaExceeded {
                    message: truncate(body, 300),
                };
            }
            UpstreamFailure::AuthExpired { status }
        }
        400 => {
            if body.to_lowercase().contains(PROMPT_TOO_LONG_PHRASE) {
                return UpstreamFailure::PromptTooLong {
                    message: truncate(body, 300),
                };
            }
            UpstreamFailure::Fatal {
                status,
                body: body.to_string(),
            }
        }
        529 => UpstreamFailure::Overloaded,
        s if s >= 500 => UpstreamFailure::Transient {
            status,
            message: truncate(body, 300),
        },
        s => UpstreamFailure::Fatal {
            status,
            body: body.to_string(),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Per-request retry state machine.
pub struct RetryController {
    cfg: SchedulerConfig,
    rules: Vec<TempUnschedulableRule>,
    single_account_mode: bool,
    in_place_attempts: u32,
    capacity_attempts: u32,
    capacity_waited: Duration,
    rule_attempts: u32,
    auth_refreshed: bool,
    network_attempts: u32,
}

impl RetryController {
    pub fn new(
        cfg: SchedulerConfig,
        rules: Vec<TempUnschedulableRule>,
        single_account_mode: bool,
    ) -> Self {
        Self {
            cfg,
            rules,
            single_account_mode,
            in_place_attempts: 0,
            capacity_attempts: 0,
            capacity_waited: Duration::ZERO,
            rule_attempts: 0,
            auth_refreshed: false,
            network_attempts: 0,
        }
    }

    /// Reset per-account counters after a successful failover; the next
    /// account starts with a clean budget.
    pub fn account_switched(&mut self) {
        self.in_place_attempts = 0;
        self.rule_attempts = 0;
        self.auth_refreshed = false;
        self.network_attempts = 0;
    }

    fn default_model_reset(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.cfg.default_model_rate_limit_secs as i64)
    }

    fn switch(&self, mark: AccountMark) -> RetryDecision {
        if self.single_account_mode {
            // Never switch, never mark: surface once the budget is gone.
            return RetryDecision::Surface(GatewayError::Upstream(
                "upstream unavailable and no alternate account".to_string(),
            ));
        }
        RetryDecision::SwitchAccount {
            mark,
            drop_sticky: true,
        }
    }

    /// Decide what to do about `failure` on behalf of `model`. The raw
    /// status/body pair is consulted for operator rules, which take
    /// precedence over the built-in table.
    pub fn decide(
        &mut self,
        model: &str,
        failure: &UpstreamFailure,
        raw_status: u16,
        raw_body: &str,
    ) -> RetryDecision {
        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(raw_status, raw_body))
            .cloned();
        if let Some(rule) = rule {
            return self.decide_rule(&rule);
        }

        match failure {
            UpstreamFailure::ModelRateLimited {
                retry_delay,
                capacity_exhausted,
            } => self.decide_model_rate_limited(model, *retry_delay, *capacity_exhausted),

            UpstreamFailure::RateLimited { reset_at } => {
                let reset = reset_at.unwrap_or_else(|| self.default_model_reset());
                self.switch(AccountMark::RateLimited { reset_at: reset })
            }

            UpstreamFailure::Overloaded => {
                let until =
                    Utc::now() + chrono::Duration::seconds(self.cfg.overload_cooldown_secs as i64);
                self.switch(AccountMark::Overloaded { until })
            }

            UpstreamFailure::AuthExpired { .. } => {
                if !self.auth_refreshed {
                    self.auth_refreshed = true;
                    return RetryDecision::RetryInPlace {
                        delay: Duration::ZERO,
                        refresh_auth: true,
                    };
                }
                self.switch(AccountMark::None)
            }

            UpstreamFailure::QuotaExceeded { message } => {
                tracing::warn!(%message, "upstream quota exhausted, failing over");
                self.switch(AccountMark::None)
            }

            UpstreamFailure::ServiceDisabled { message } => {
                tracing::warn!(%message, "upstream service disabled, failing over");
                self.switch(AccountMark::None)
            }

            UpstreamFailure::Network { message } => {
                if self.network_attempts < self.cfg.network_retry_attempts {
                    self.network_attempts += 1;
                    let delay = backoff_delay(self.network_attempts);
                    return RetryDecision::RetryInPlace {
                        delay,
                        refresh_auth: false,
                    };
                }
                tracing::warn!(%message, "network retries exhausted, failing over");
                self.switch(AccountMark::None)
            }

            UpstreamFailure::Transient { status, message } => {
                if self.network_attempts < self.cfg.network_retry_attempts {
                    self.network_attempts += 1;
                    return RetryDecision::RetryInPlace {
                        delay: backoff_delay(self.network_attempts),
                        refresh_auth: false,
                    };
                }
                tracing::warn!(status, %message, "transient upstream failure, failing over");
                self.switch(AccountMark::None)
            }

            UpstreamFailure::PromptTooLong { message } => {
                RetryDecision::Surface(GatewayError::PromptTooLong(message.clone()))
            }

            UpstreamFailure::Fatal { status, body } => {
                RetryDecision::Surface(GatewayError::UpstreamStatus {
                    status: *status,
                    body: body.clone(),
                })
            }
        }
    }

    fn decide_model_rate_limited(
        &mut self,
        model: &str,
        retry_delay: Option<Duration>,
        capacity_exhausted: bool,
    ) -> RetryDecision {
        if capacity_exhausted && self.single_account_mode {
            // Bounded in-place loop; model rate-limit state is never touched
            // in this mode.
            if self.capacity_attempts >= self.cfg.capacity_retry_attempts {
                return RetryDecision::Surface(GatewayError::Upstream(
                    "model capacity exhausted".to_string(),
                ));
            }
            let base = retry_delay.unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1));
            let delay = base.min(Duration::from_secs(self.cfg.capacity_retry_max_wait_secs));
            let total = Duration::from_secs(self.cfg.capacity_retry_total_wait_secs);
            if self.capacity_waited + delay > total {
                return RetryDecision::Surface(GatewayError::Upstream(
                    "model capacity exhausted".to_string(),
                ));
            }
            self.capacity_attempts += 1;
            self.capacity_waited += delay;
            return RetryDecision::RetryInPlace {
                delay,
                refresh_auth: false,
            };
        }

        let threshold = Duration::from_secs(self.cfg.short_retry_threshold_secs);
        let short = retry_delay.map(|d| d < threshold).unwrap_or(false);

        if short && self.in_place_attempts < self.cfg.max_in_place_attempts {
            self.in_place_attempts += 1;
            return RetryDecision::RetryInPlace {
                delay: retry_delay.unwrap_or(Duration::from_secs(1)),
                refresh_auth: false,
            };
        }

        // Long delay, unknown delay, or in-place budget exhausted: park the
        // model on this account and move on.
        let reset_at = retry_delay
            .map(|d| {
                Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
            })
            .unwrap_or_else(|| self.default_model_reset());
        self.switch(AccountMark::ModelRateLimited {
            model: model.to_string(),
            reset_at,
        })
    }

    fn decide_rule(&mut self, rule: &TempUnschedulableRule) -> RetryDecision {
        if rule.retry_enabled && self.rule_attempts < rule.effective_retry_count() {
            self.rule_attempts += 1;
            return RetryDecision::RetryInPlace {
                delay: backoff_delay(self.rule_attempts),
                refresh_auth: false,
            };
        }
        let until = Utc::now() + chrono::Duration::seconds(rule.duration_secs as i64);
        let reason = if rule.name.is_empty() {
            "operator rule matched".to_string()
        } else {
            rule.name.clone()
        };
        self.switch(AccountMark::TempUnschedulable { until, reason })
    }
}

/// Exponential backoff with jitter, bounded at 3 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 300u64;
    let exp = (1u64 << attempt.min(4)) * base_ms;
    let capped = exp.min(3_000);
    let jitter = rand::random::<u64>() % (capped / 4 + 1);
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn controller(single: bool) -> RetryController {
        RetryController::new(cfg(), Vec::new(), single)
    }

    fn google_body(status: &str, reason: &str, delay: &str) -> String {
        serde_json::json!({
            "error": {
                "code": 429,
                "status": status,
                "message": "try later",
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": reason},
                    {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": delay}
                ]
            }
        })
        .to_string()
    }

    #[test]
    fn parse_retry_delay_variants() {
        assert_eq!(parse_retry_delay("39s"), Some(Duration::from_secs(39)));
        assert_eq!(
            parse_retry_delay("3.5s"),
            Some(Duration::from_secs_f64(3.5))
        );
        assert_eq!(parse_retry_delay("oops"), None);
        assert_eq!(parse_retry_delay("5"), None);
    }

    #[test]
    fn classify_google_model_limit() {
        let body = google_body("RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", "39s");
        let failure = classify(429, &HeaderMap::new(), &body);
        assert_eq!(
            failure,
            UpstreamFailure::ModelRateLimited {
                retry_delay: Some(Duration::from_secs(39)),
                capacity_exhausted: false,
            }
        );
    }

    #[test]
    fn classify_capacity_exhausted_on_503() {
        let body = google_body("UNAVAILABLE", "MODEL_CAPACITY_EXHAUSTED", "39s");
        let failure = classify(503, &HeaderMap::new(), &body);
        assert!(matches!(
            failure,
            UpstreamFailure::ModelRateLimited {
                capacity_exhausted: true,
                ..
            }
        ));
    }

    #[test]
    fn classify_unified_headers() {
        let mut headers = HeaderMap::new();
        let reset = Utc::now().timestamp() + 1800;
        headers.insert(
            "anthropic-ratelimit-unified-5h-utilization",
            HeaderValue::from_static("1.02"),
        );
        headers.insert(
            "anthropic-ratelimit-unified-5h-reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        headers.insert(
            "anthropic-ratelimit-unified-7d-utilization",
            HeaderValue::from_static("0.4"),
        );

        let failure = classify(429, &headers, "{}");
        match failure {
            UpstreamFailure::RateLimited { reset_at: Some(at) } => {
                assert_eq!(at.timestamp(), reset);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unified_headers_below_threshold_use_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "anthropic-ratelimit-unified-5h-utilization",
            HeaderValue::from_static("0.7"),
        );
        headers.insert("retry-after", HeaderValue::from_static("120"));
        let failure = classify(429, &headers, "{}");
        match failure {
            UpstreamFailure::RateLimited { reset_at: Some(at) } => {
                let secs = (at - Utc::now()).num_seconds();
                assert!((115..=125).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classify_prompt_too_long() {
        let failure = classify(
            400,
            &HeaderMap::new(),
            "{\"error\":{\"message\":\"prompt is too long: 250000 tokens > 200000 maximum\"}}",
        );
        assert!(matches!(failure, UpstreamFailure::PromptTooLong { .. }));
    }

    #[test]
    fn classify_plain_400_is_fatal() {
        let failure = classify(400, &HeaderMap::new(), "{\"error\":\"bad field\"}");
        assert!(matches!(failure, UpstreamFailure::Fatal { status: 400, .. }));
    }

    #[test]
    fn classify_auth_and_billing() {
        assert!(matches!(
            classify(401, &HeaderMap::new(), "{}"),
            UpstreamFailure::AuthExpired { status: 401 }
        ));
        assert!(matches!(
            classify(403, &HeaderMap::new(), "your credit balance is too low"),
            UpstreamFailure::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify(403, &HeaderMap::new(), "SERVICE_DISABLED: enable the API"),
            UpstreamFailure::ServiceDisabled { .. }
        ));
    }

    #[test]
    fn short_delay_retries_in_place_then_marks_and_switches() {
        let mut ctl = controller(false);
        let failure = UpstreamFailure::ModelRateLimited {
            retry_delay: Some(Duration::from_secs(3)),
            capacity_exhausted: false,
        };

        match ctl.decide("claude-sonnet-4-5", &failure, 429, "{}") {
            RetryDecision::RetryInPlace { delay, .. } => {
                assert_eq!(delay, Duration::from_secs(3))
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Budget (default 1) exhausted: mark the model and switch.
        match ctl.decide("claude-sonnet-4-5", &failure, 429, "{}") {
            RetryDecision::SwitchAccount {
                mark: AccountMark::ModelRateLimited { model, reset_at },
                drop_sticky,
            } => {
                assert_eq!(model, "claude-sonnet-4-5");
                assert!(drop_sticky);
                let secs = (reset_at - Utc::now()).num_seconds();
                assert!((0..=4).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn long_delay_switches_immediately() {
        let mut ctl = controller(false);
        let failure = UpstreamFailure::ModelRateLimited {
            retry_delay: Some(Duration::from_secs(15)),
            capacity_exhausted: false,
        };
        match ctl.decide("claude-sonnet-4-5", &failure, 429, "{}") {
            RetryDecision::SwitchAccount {
                mark: AccountMark::ModelRateLimited { reset_at, .. },
                ..
            } => {
                let secs = (reset_at - Utc::now()).num_seconds();
                assert!((12..=16).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_delay_uses_default_window() {
        let mut ctl = controller(false);
        let failure = UpstreamFailure::ModelRateLimited {
            retry_delay: None,
            capacity_exhausted: false,
        };
        match ctl.decide("claude-sonnet-4-5", &failure, 429, "{}") {
            RetryDecision::SwitchAccount {
                mark: AccountMark::ModelRateLimited { reset_at, .. },
                ..
            } => {
                let secs = (reset_at - Utc::now()).num_seconds();
                assert!((55..=62).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn single_account_capacity_loop_is_bounded_and_markless() {
        let mut ctl = controller(true);
        let failure = UpstreamFailure::ModelRateLimited {
            retry_delay: Some(Duration::from_secs(39)),
            capacity_exhausted: true,
        };

        let mut waited = Duration::ZERO;
        let mut retries = 0;
        loop {
            match ctl.decide("gemini-2.5-pro", &failure, 503, "{}") {
                RetryDecision::RetryInPlace { delay, .. } => {
                    // Each wait is clamped to the per-attempt ceiling.
                    assert!(delay <= Duration::from_secs(15));
                    waited += delay;
                    retries += 1;
                    assert!(retries <= 3);
                }
                RetryDecision::Surface(_) => break,
                RetryDecision::SwitchAccount { .. } => {
                    panic!("single-account mode must never switch")
                }
            }
        }
        assert!(waited <= Duration::from_secs(30));
        assert!(retries >= 1);
    }

    #[test]
    fn single_account_mode_never_marks_on_rate_limit() {
        let mut ctl = controller(true);
        let failure = UpstreamFailure::RateLimited { reset_at: None };
        match ctl.decide("claude-sonnet-4-5", &failure, 429, "{}") {
            RetryDecision::Surface(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn auth_expired_refreshes_once_then_switches() {
        let mut ctl = controller(false);
        let failure = UpstreamFailure::AuthExpired { status: 401 };

        match ctl.decide("claude-sonnet-4-5", &failure, 401, "{}") {
            RetryDecision::RetryInPlace { refresh_auth, .. } => assert!(refresh_auth),
            other => panic!("unexpected: {:?}", other),
        }
        match ctl.decide("claude-sonnet-4-5", &failure, 401, "{}") {
            RetryDecision::SwitchAccount {
                mark: AccountMark::None,
                ..
            } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn network_errors_back_off_then_switch() {
        let mut ctl = controller(false);
        let failure = UpstreamFailure::Network {
            message: "connection reset".to_string(),
        };
        let mut retries = 0;
        loop {
            match ctl.decide("claude-sonnet-4-5", &failure, 0, "") {
                RetryDecision::RetryInPlace { .. } => retries += 1,
                RetryDecision::SwitchAccount { .. } => break,
                other => panic!("unexpected: {:?}", other),
            }
            assert!(retries <= 3);
        }
        assert_eq!(retries, 3);
    }

    #[test]
    fn operator_rule_retries_then_parks() {
        let rule = TempUnschedulableRule {
            name: "org-disabled".to_string(),
            status_codes: vec![403],
            keywords: vec!["organization".to_string()],
            retry_enabled: true,
            retry_count: 2,
            duration_secs: 600,
        };
        let mut ctl = RetryController::new(cfg(), vec![rule], false);
        let failure = UpstreamFailure::AuthExpired { status: 403 };
        let body = "organization has been disabled";

        assert!(matches!(
            ctl.decide("m", &failure, 403, body),
            RetryDecision::RetryInPlace { .. }
        ));
        assert!(matches!(
            ctl.decide("m", &failure, 403, body),
            RetryDecision::RetryInPlace { .. }
        ));
        match ctl.decide("m", &failure, 403, body) {
            RetryDecision::SwitchAccount {
                mark: AccountMark::TempUnschedulable { until, reason },
                ..
            } => {
                assert_eq!(reason, "org-disabled");
                let secs = (until - Utc::now()).num_seconds();
                assert!((595..=605).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn rule_without_retry_parks_immediately() {
        let rule = TempUnschedulableRule {
            name: "hard-stop".to_string(),
            status_codes: vec![400],
            keywords: vec!["banned".to_string()],
            retry_enabled: false,
            retry_count: 0,
            duration_secs: 60,
        };
        let mut ctl = RetryController::new(cfg(), vec![rule], false);
        let failure = UpstreamFailure::Fatal {
            status: 400,
            body: "account banned".to_string(),
        };
        assert!(matches!(
            ctl.decide("m", &failure, 400, "account banned"),
            RetryDecision::SwitchAccount {
                mark: AccountMark::TempUnschedulable { .. },
                ..
            }
        ));
    }

    #[test]
    fn fatal_and_prompt_too_long_surface() {
        let mut ctl = controller(false);
        assert!(matches!(
            ctl.decide(
                "m",
                &UpstreamFailure::Fatal {
                    status: 404,
                    body: "{}".to_string()
                },
                404,
                "{}"
            ),
            RetryDecision::Surface(GatewayError::UpstreamStatus { status: 404, .. })
        ));
        assert!(matches!(
            ctl.decide(
                "m",
                &UpstreamFailure::PromptTooLong {
                    message: "prompt is too long".to_string()
                },
                400,
                "prompt is too long"
            ),
            RetryDecision::Surface(GatewayError::PromptTooLong(_))
        ));
    }

    #[test]
    fn overload_marks_and_switches() {
        let mut ctl = controller(false);
        match ctl.decide("m", &UpstreamFailure::Overloaded, 529, "overloaded") {
            RetryDecision::SwitchAccount {
                mark: AccountMark::Overloaded { until },
                ..
            } => {
                let secs = (until - Utc::now()).num_seconds();
                assert!((55..=62).contains(&secs));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
