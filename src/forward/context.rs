//! Forwarding context structures.
//!
//! The authenticated caller, the parsed request, and the per-attempt
//! context handed to platform handlers.

use crate::accounts::{Account, ApiKey, Group, Subscription, User};
use crate::scheduler::ParsedRequest;

/// Resolved caller identity, produced by the middleware before anything
/// else runs.
#[derive(Debug, Clone)]
pub struct AuthedCaller {
    pub api_key: ApiKey,
    pub user: User,
    pub group: Group,
    pub subscription: Option<Subscription>,
}

/// Explicit per-request options. Carried as a value, not a context key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Never switch accounts or write rate-limit state; wait out capacity
    /// failures in place. Set when the operator runs a single account in
    /// the bucket.
    pub single_account_retry: bool,
}

/// One forwarding attempt against one account.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub account: Account,
    /// Model id as the client requested it.
    pub model: String,
    /// Model id to send upstream, after the account's mapping.
    pub upstream_model: String,
    pub stream: bool,
    pub request_id: String,
    /// True once a failover moved this conversation off its original
    /// account; thinking blocks with foreign signatures must be stripped.
    pub crossed_account: bool,
}

impl ForwardContext {
    pub fn new(account: Account, parsed: &ParsedRequest, crossed_account: bool) -> Self {
        let upstream_model = account.mapped_model(&parsed.model);
        Self {
            account,
            model: parsed.model.clone(),
            upstream_model,
            stream: parsed.stream,
            request_id: parsed.id.clone(),
            crossed_account,
        }
    }
}
