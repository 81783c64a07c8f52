//! Billing gate and cost model.
//!
//! Eligibility runs twice per request: once before the wait queue and again
//! after slot acquisition, because a peer request may exhaust the quota
//! while this one waits. Costs come off the canonical usage tuple with a
//! long-context surcharge on input tokens past the configured threshold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::accounts::{Group, Subscription, User};
use crate::config::{LongContextConfig, ModelPrice, Settings};
use crate::db::UsageStore;
use crate::forward::error::{GatewayError, GatewayResult};
use crate::forward::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingWindow {
    Daily,
    Weekly,
    Monthly,
}

impl BillingWindow {
    pub fn label(&self) -> &'static str {
        match self {
            BillingWindow::Daily => "daily",
            BillingWindow::Weekly => "weekly",
            BillingWindow::Monthly => "monthly",
        }
    }

    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            // Calendar day; rolling windows for the longer periods.
            BillingWindow::Daily => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .unwrap_or(now),
            BillingWindow::Weekly => now - Duration::days(7),
            BillingWindow::Monthly => now - Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct BillingGate {
    usage: Arc<UsageStore>,
    settings: Arc<Settings>,
}

impl BillingGate {
    pub fn new(usage: Arc<UsageStore>, settings: Arc<Settings>) -> Self {
        Self { usage, settings }
    }

    /// Subscription groups need a live subscription with headroom in every
    /// configured window; wallet groups need a positive balance.
    pub fn check_eligibility(
        &self,
        user: &User,
        group: &Group,
        subscription: Option<&Subscription>,
    ) -> GatewayResult<()> {
        if group.is_subscription_type {
            let sub = subscription.ok_or_else(|| {
                GatewayError::BillingDenied("no active subscription for this group".to_string())
            })?;
            let now = Utc::now();
            if sub.expires_at <= now {
                return Err(GatewayError::BillingDenied(
                    "subscription has expired".to_string(),
                ));
            }
            for (limit, window) in [
                (group.daily_limit_usd, BillingWindow::Daily),
                (group.weekly_limit_usd, BillingWindow::Weekly),
                (group.monthly_limit_usd, BillingWindow::Monthly),
            ] {
                let Some(limit) = limit else { continue };
                let spent = self
                    .usage
                    .spent_since(user.id, group.id, window.start(now))?;
                if spent >= limit {
                    return Err(GatewayError::BillingDenied(format!(
                        "{} quota exhausted: ${:.4} / ${:.4}",
                        window.label(),
                        spent,
                        limit
                    )));
                }
            }
            return Ok(());
        }

        if user.balance_usd <= 0.0 && !group.allows_negative_balance() {
            return Err(GatewayError::BillingDenied(
                "insufficient balance".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cost_for(&self, model: &str, usage: &Usage) -> f64 {
        let price = self.settings.price_for(model);
        compute_cost(usage, &price, &self.settings.long_context)
    }

    /// Remaining quota (subscription) or balance (wallet) for `GET /v1/usage`.
    pub fn quota_report(
        &self,
        user: &User,
        group: &Group,
        subscription: Option<&Subscription>,
    ) -> GatewayResult<Value> {
        if group.is_subscription_type {
            let now = Utc::now();
            let mut windows = serde_json::Map::new();
            for (limit, window) in [
                (group.daily_limit_usd, BillingWindow::Daily),
                (group.weekly_limit_usd, BillingWindow::Weekly),
                (group.monthly_limit_usd, BillingWindow::Monthly),
            ] {
                let Some(limit) = limit else { continue };
                let spent = self
                    .usage
                    .spent_since(user.id, group.id, window.start(now))?;
                windows.insert(
                    window.label().to_string(),
                    json!({
                        "limit_usd": limit,
                        "used_usd": spent,
                        "remaining_usd": (limit - spent).max(0.0),
                    }),
                );
            }
            return Ok(json!({
                "mode": "subscription",
                "expires_at": subscription.map(|s| s.expires_at.to_rfc3339()),
                "windows": windows,
            }));
        }
        Ok(json!({
            "mode": "wallet",
            "balance_usd": user.balance_usd,
        }))
    }
}

/// Cost of one request in USD.
///
/// Input tokens beyond the long-context threshold bill at the surcharge
/// multiplier; cache and output tokens bill once at their base rates.
pub fn compute_cost(usage: &Usage, price: &ModelPrice, long_ctx: &LongContextConfig) -> f64 {
    const MTOK: f64 = 1_000_000.0;

    let total_input = usage.total_input();
    let excess = (total_input - long_ctx.threshold_tokens)
        .max(0)
        .min(usage.input);
    let base_input = usage.input - excess;

    let input_cost = base_input as f64 / MTOK * price.input_per_mtok
        + excess as f64 / MTOK * price.input_per_mtok * long_ctx.extra_multiplier;
    let cache_cost = usage.cache_creation as f64 / MTOK * price.cache_creation_per_mtok
        + usage.cache_read as f64 / MTOK * price.cache_read_per_mtok;
    let output_cost = usage.output as f64 / MTOK * price.output_per_mtok;

    (input_cost + cache_cost + output_cost) * price.rate_multiplier
}
