//! Request forwarding pipeline.
//!
//! ```text
//! parse+fingerprint -> wait-queue admit -> user slot -> billing recheck
//!   -> pick account -> account slot -> forward (retry/failover) -> record
//! ```
//!
//! Slots release in reverse order through guard drops on every exit path.
//! Streaming requests commit to an SSE response up front; failures after
//! that point travel as SSE `error` events, never as status changes.

pub mod client;
pub mod context;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod middleware;
pub mod retry;
pub mod usage;

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::accounts::AccountId;
use crate::db::UsageRecord;
use crate::scheduler::{fingerprint, ParsedRequest, SelectRequest, Selection};
use crate::state::Gateway;

use context::{AuthedCaller, ForwardContext, ForwardOptions};
use error::{GatewayError, GatewayResult};
use handlers::{handler_for, AttemptOutcome, StreamAttempt, WireHandler};
use retry::{AccountMark, RetryController, RetryDecision, UpstreamFailure};
use usage::Usage;

/// Outcome of a completed forward, for the usage record.
struct Completed {
    account_id: AccountId,
    usage: Usage,
    client_disconnect: bool,
}

/// Non-streaming entry point: the reconciled upstream body or an error.
pub async fn handle_buffered(
    gw: Arc<Gateway>,
    caller: AuthedCaller,
    parsed: ParsedRequest,
    options: ForwardOptions,
) -> GatewayResult<Value> {
    // First billing gate, before any queueing.
    gw.billing
        .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())?;

    let _wait_guard = gw
        .limiter
        .join_wait_queue(caller.user.id, caller.user.concurrency_cap)
        .await?;

    let _user_guard = gw
        .limiter
        .acquire_user_slot_waiting(caller.user.id, caller.user.concurrency_cap, None)
        .await?;

    // Second gate: a peer may have drained the quota while we waited.
    gw.billing
        .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())?;

    let mut body = None;
    let completed = drive_attempts(&gw, &caller, &parsed, options, None, &mut body).await?;
    record_completion(&gw, &caller, &parsed, completed);

    body.ok_or_else(|| GatewayError::Internal("forward completed without a body".to_string()))
}

/// Streaming entry point. The SSE response is committed immediately; the
/// pipeline runs in a detached task feeding the body channel, decoupled
/// from the client connection.
pub async fn handle_streaming(
    gw: Arc<Gateway>,
    caller: AuthedCaller,
    parsed: ParsedRequest,
    options: ForwardOptions,
) -> Response {
    // First billing gate still gets a proper HTTP status.
    if let Err(err) =
        gw.billing
            .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())
    {
        return err.into_response();
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        if let Err(err) = stream_pipeline(&gw, &caller, &parsed, options, &tx).await {
            tracing::info!(request_id = %parsed.id, error = %err, "stream pipeline ended with error");
            let _ = tx.send(Bytes::from(err.sse_event())).await;
        }
    });

    let stream = async_stream::stream! {
        while let Some(bytes) = rx.recv().await {
            yield Ok::<_, std::io::Error>(bytes);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Token counting: billing-gated, no slot accounting, no usage record, one
/// attempt against the selected account.
pub async fn handle_count_tokens(
    gw: Arc<Gateway>,
    caller: AuthedCaller,
    parsed: ParsedRequest,
) -> GatewayResult<Value> {
    gw.billing
        .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())?;

    let fp = fingerprint::fingerprint(&parsed);
    let chain = fingerprint::build_digest_chain(&parsed);
    let excluded = HashSet::new();
    let selection = gw
        .selector
        .select(&SelectRequest {
            group: &caller.group,
            platform: wire_platform(parsed.wire),
            model: &parsed.model,
            fingerprint: &fp,
            digest_chain: &chain,
            excluded: &excluded,
        })
        .await?;

    let ctx = ForwardContext::new(selection.account, &parsed, false);
    match handlers::anthropic::AnthropicHandler
        .count_tokens(&gw, &ctx, &parsed)
        .await?
    {
        AttemptOutcome::Success { body, .. } => Ok(body),
        AttemptOutcome::Failure { status, body, .. } => {
            Err(GatewayError::UpstreamStatus { status, body })
        }
    }
}

async fn stream_pipeline(
    gw: &Arc<Gateway>,
    caller: &AuthedCaller,
    parsed: &ParsedRequest,
    options: ForwardOptions,
    tx: &mpsc::Sender<Bytes>,
) -> GatewayResult<()> {
    let _wait_guard = gw
        .limiter
        .join_wait_queue(caller.user.id, caller.user.concurrency_cap)
        .await?;

    let _user_guard = gw
        .limiter
        .acquire_user_slot_waiting(caller.user.id, caller.user.concurrency_cap, Some(tx))
        .await?;

    gw.billing
        .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())?;

    let completed = drive_attempts(gw, caller, parsed, options, Some(tx), &mut None).await?;
    record_completion(gw, caller, parsed, completed);
    Ok(())
}

/// Select-acquire-forward loop with in-place retry and account failover.
///
/// For buffered requests the winning body lands in `buffered_body`; for
/// streaming, frames flow through `stream_tx` as they arrive.
async fn drive_attempts(
    gw: &Arc<Gateway>,
    caller: &AuthedCaller,
    parsed: &ParsedRequest,
    options: ForwardOptions,
    stream_tx: Option<&mpsc::Sender<Bytes>>,
    buffered_body: &mut Option<Value>,
) -> GatewayResult<Completed> {
    let fp = fingerprint::fingerprint(parsed);
    let chain = fingerprint::build_digest_chain(parsed);
    let handler = handler_for(parsed.wire);

    let mut excluded: HashSet<AccountId> = HashSet::new();
    let mut controller = RetryController::new(
        gw.settings.scheduler.clone(),
        gw.settings.unschedulable_rules.clone(),
        options.single_account_retry,
    );
    let mut crossed_account = false;

    loop {
        let selection = gw
            .selector
            .select(&SelectRequest {
                group: &caller.group,
                platform: wire_platform(parsed.wire),
                model: &parsed.model,
                fingerprint: &fp,
                digest_chain: &chain,
                excluded: &excluded,
            })
            .await?;

        let account_guard = gw
            .limiter
            .acquire_account_slot_waiting(
                selection.account.id,
                selection.account.concurrency_cap,
                stream_tx,
            )
            .await?;

        match attempt_account(
            gw,
            parsed,
            &handler,
            &selection,
            &mut controller,
            crossed_account,
            stream_tx,
            buffered_body,
        )
        .await?
        {
            AccountResult::Done(completed) => {
                account_guard.release().await;
                return Ok(completed);
            }
            AccountResult::Failover { mark, drop_sticky } => {
                apply_mark(gw, selection.account.id, &parsed.model, mark).await;
                if drop_sticky && selection.sticky {
                    let _ = gw.sessions.delete(caller.group.id, &fp).await;
                }
                excluded.insert(selection.account.id);
                account_guard.release().await;
                controller.account_switched();
                crossed_account = true;
                tracing::info!(
                    request_id = %parsed.id,
                    failed_account = selection.account.id,
                    "failing over to another account"
                );
            }
        }
    }
}

enum AccountResult {
    Done(Completed),
    Failover { mark: AccountMark, drop_sticky: bool },
}

/// All attempts against a single account, including in-place retries.
#[allow(clippy::too_many_arguments)]
async fn attempt_account(
    gw: &Arc<Gateway>,
    parsed: &ParsedRequest,
    handler: &WireHandler,
    selection: &Selection,
    controller: &mut RetryController,
    crossed_account: bool,
    stream_tx: Option<&mpsc::Sender<Bytes>>,
    buffered_body: &mut Option<Value>,
) -> GatewayResult<AccountResult> {
    let mut ctx = ForwardContext::new(selection.account.clone(), parsed, crossed_account);

    loop {
        let (failure, status, raw_body) =
            match run_attempt(gw, handler, &ctx, parsed, stream_tx, buffered_body).await {
                Ok(completed) => return Ok(AccountResult::Done(completed)),
                Err(AttemptFailure::Classified {
                    failure,
                    status,
                    body,
                }) => (failure, status, body),
                Err(AttemptFailure::Hard(err)) => return Err(err),
            };

        match controller.decide(&parsed.model, &failure, status, &raw_body) {
            RetryDecision::RetryInPlace {
                delay,
                refresh_auth,
            } => {
                if refresh_auth {
                    match crate::oauth::refresh_access_token(gw, &ctx.account).await {
                        Ok(_) => {
                            // Pick up rotated credentials for the next attempt.
                            if let Ok(Some(fresh)) = gw.accounts.get_by_id(ctx.account.id).await {
                                ctx.account = fresh;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(account_id = ctx.account.id, error = %e, "token refresh failed");
                        }
                    }
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                tracing::debug!(
                    request_id = %parsed.id,
                    account_id = ctx.account.id,
                    "retrying in place"
                );
            }
            RetryDecision::SwitchAccount { mark, drop_sticky } => {
                return Ok(AccountResult::Failover { mark, drop_sticky });
            }
            RetryDecision::Surface(err) => return Err(err),
        }
    }
}

enum AttemptFailure {
    Classified {
        failure: UpstreamFailure,
        status: u16,
        body: String,
    },
    Hard(GatewayError),
}

/// One forwarding attempt. `Ok` completes the request; failures the retry
/// controller can reason about come back as `Classified`.
async fn run_attempt(
    gw: &Arc<Gateway>,
    handler: &WireHandler,
    ctx: &ForwardContext,
    parsed: &ParsedRequest,
    stream_tx: Option<&mpsc::Sender<Bytes>>,
    buffered_body: &mut Option<Value>,
) -> Result<Completed, AttemptFailure> {
    if let Some(tx) = stream_tx {
        match handler.attempt_stream(gw, ctx, parsed, tx).await {
            Ok(StreamAttempt::Streamed(outcome)) => Ok(Completed {
                account_id: ctx.account.id,
                usage: outcome.usage,
                client_disconnect: outcome.client_disconnect,
            }),
            Ok(StreamAttempt::Failure {
                status,
                headers,
                body,
            }) => Err(AttemptFailure::Classified {
                failure: retry::classify(status, &headers, &body),
                status,
                body,
            }),
            Err(err) => Err(network_failure(err)),
        }
    } else {
        match handler.attempt_buffered(gw, ctx, parsed).await {
            Ok(AttemptOutcome::Success { body, usage }) => {
                *buffered_body = Some(body);
                Ok(Completed {
                    account_id: ctx.account.id,
                    usage,
                    client_disconnect: false,
                })
            }
            Ok(AttemptOutcome::Failure {
                status,
                headers,
                body,
            }) => Err(AttemptFailure::Classified {
                failure: retry::classify(status, &headers, &body),
                status,
                body,
            }),
            Err(err) => Err(network_failure(err)),
        }
    }
}

fn network_failure(err: GatewayError) -> AttemptFailure {
    match err {
        GatewayError::Upstream(message) | GatewayError::Timeout(message) => {
            AttemptFailure::Classified {
                failure: UpstreamFailure::Network {
                    message: message.clone(),
                },
                status: 0,
                body: message,
            }
        }
        other => AttemptFailure::Hard(other),
    }
}

fn wire_platform(wire: crate::scheduler::WireFormat) -> crate::accounts::Platform {
    match wire {
        crate::scheduler::WireFormat::Anthropic => crate::accounts::Platform::Anthropic,
        crate::scheduler::WireFormat::Gemini => crate::accounts::Platform::Gemini,
    }
}

async fn apply_mark(gw: &Arc<Gateway>, account_id: AccountId, model: &str, mark: AccountMark) {
    let result = match mark {
        AccountMark::None => Ok(()),
        AccountMark::RateLimited { reset_at } => {
            gw.accounts.set_rate_limited(account_id, reset_at).await
        }
        AccountMark::ModelRateLimited { model: marked, reset_at } => {
            let key = if marked.is_empty() { model } else { &marked };
            gw.accounts
                .set_model_rate_limit(account_id, key, reset_at)
                .await
        }
        AccountMark::Overloaded { until } => gw.accounts.set_overload(account_id, until).await,
        AccountMark::TempUnschedulable { until, reason } => {
            gw.accounts
                .set_temp_unschedulable(account_id, until, &reason)
                .await
        }
    };
    if let Err(e) = result {
        tracing::warn!(account_id, error = %e, "failed to mark account");
    }
}

/// Best-effort usage recording after the response is settled. Failures are
/// logged and never affect the client.
fn record_completion(
    gw: &Arc<Gateway>,
    caller: &AuthedCaller,
    parsed: &ParsedRequest,
    completed: Completed,
) {
    let now = Utc::now();
    let record = UsageRecord {
        request_id: parsed.id.clone(),
        user_id: caller.user.id,
        group_id: caller.group.id,
        account_id: completed.account_id,
        model: parsed.model.clone(),
        usage: completed.usage,
        cost_usd: gw.billing.cost_for(&parsed.model, &completed.usage),
        client_disconnect: completed.client_disconnect,
        recorded_at: now,
    };

    let gw = Arc::clone(gw);
    tokio::spawn(async move {
        let account_id = record.account_id;
        let write = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let gw2 = Arc::clone(&gw);
            let rec = record;
            let stored =
                tokio::task::spawn_blocking(move || gw2.usage_log.record(&rec).map(|_| rec))
                    .await
                    .map_err(|e| crate::error::AppError::Internal(e.to_string()))??;
            gw.accounts
                .update_last_used([(account_id, stored.recorded_at)].into_iter().collect())
                .await?;
            Ok::<_, crate::error::AppError>(())
        })
        .await;
        match write {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "usage record failed"),
            Err(_) => tracing::warn!("usage record timed out"),
        }
    });
}
