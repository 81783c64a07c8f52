//! Inbound HTTP server.
//!
//! Anthropic-style endpoints under `/v1`, Gemini-style under `/v1beta`,
//! plus the usage and model listings. Authentication resolves the caller's
//! API key; the bound group decides the routing bucket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::forward::context::{AuthedCaller, ForwardOptions};
use crate::forward::error::{GatewayError, GatewayResult};
use crate::forward::middleware;
use crate::scheduler::{fingerprint, BucketKey, ParsedRequest, SessionContext, WireFormat};
use crate::state::Gateway;

pub fn build_router(gw: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(list_models))
        .route("/v1/usage", get(usage_report))
        .route("/v1beta/*endpoint", post(gemini_generate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gw)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

struct RequestParts {
    caller: AuthedCaller,
    context: SessionContext,
}

async fn resolve_caller(
    gw: &Gateway,
    headers: &HeaderMap,
    addr: Option<&ConnectInfo<SocketAddr>>,
) -> GatewayResult<RequestParts> {
    let caller = middleware::authenticate(gw, headers).await?;
    let remote = addr.map(|a| a.0.ip().to_string());
    let context = middleware::session_context(headers, remote.as_deref(), caller.api_key.id);
    Ok(RequestParts { caller, context })
}

/// Single-account retry mode engages when exactly one account serves the
/// caller's bucket: waiting beats erroring out when there is nowhere to
/// fail over to.
async fn forward_options(gw: &Gateway, caller: &AuthedCaller, parsed: &ParsedRequest) -> ForwardOptions {
    let platform = match parsed.wire {
        WireFormat::Anthropic => crate::accounts::Platform::Anthropic,
        WireFormat::Gemini => crate::accounts::Platform::Gemini,
    };
    let bucket = BucketKey {
        group_id: caller.group.id,
        platform,
        mode: caller.group.mode,
    };
    let single = match gw.snapshots.list_schedulable(bucket).await {
        Ok(snapshot) => snapshot.accounts.len() == 1,
        Err(_) => false,
    };
    ForwardOptions {
        single_account_retry: single,
    }
}

async fn messages(
    State(gw): State<Arc<Gateway>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let parts = match resolve_caller(&gw, &headers, addr.as_ref()).await {
        Ok(parts) => parts,
        Err(err) => return err.into_response(),
    };
    let parsed = match fingerprint::parse(payload, WireFormat::Anthropic, None, None, parts.context)
    {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };

    let options = forward_options(&gw, &parts.caller, &parsed).await;
    if parsed.stream {
        crate::forward::handle_streaming(gw, parts.caller, parsed, options).await
    } else {
        match crate::forward::handle_buffered(gw, parts.caller, parsed, options).await {
            Ok(body) => Json(body).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

async fn count_tokens(
    State(gw): State<Arc<Gateway>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let parts = match resolve_caller(&gw, &headers, addr.as_ref()).await {
        Ok(parts) => parts,
        Err(err) => return err.into_response(),
    };
    let parsed = match fingerprint::parse(payload, WireFormat::Anthropic, None, None, parts.context)
    {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };
    match crate::forward::handle_count_tokens(gw, parts.caller, parsed).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_models(
    State(gw): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = middleware::authenticate(&gw, &headers).await {
        return err.into_response();
    }
    let models: Vec<Value> = gw
        .settings
        .supported_models
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "system",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": models})).into_response()
}

async fn usage_report(State(gw): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    let caller = match middleware::authenticate(&gw, &headers).await {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    let mut report = match gw
        .billing
        .quota_report(&caller.user, &caller.group, caller.subscription.as_ref())
    {
        Ok(report) => report,
        Err(err) => return err.into_response(),
    };

    let since = crate::billing::BillingWindow::Daily.start(chrono::Utc::now());
    if let Ok((requests, tokens, cost)) = gw.usage_log.user_summary_since(caller.user.id, since) {
        report["today"] = json!({
            "requests": requests,
            "tokens": tokens,
            "cost_usd": cost,
        });
    }
    Json(report).into_response()
}

/// Parse a `/v1beta` wildcard tail such as
/// `models/gemini-2.5-pro:streamGenerateContent` into `(model, stream)`.
fn parse_gemini_endpoint(endpoint: &str) -> GatewayResult<(String, bool)> {
    let rest = endpoint
        .strip_prefix("models/")
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unsupported endpoint '{}'", endpoint)))?;
    let (model, action) = rest.rsplit_once(':').ok_or_else(|| {
        GatewayError::InvalidRequest(format!("missing action in endpoint '{}'", endpoint))
    })?;
    if model.is_empty() {
        return Err(GatewayError::InvalidRequest("missing model".to_string()));
    }
    match action {
        "generateContent" => Ok((model.to_string(), false)),
        "streamGenerateContent" => Ok((model.to_string(), true)),
        other => Err(GatewayError::InvalidRequest(format!(
            "unsupported action '{}'",
            other
        ))),
    }
}

async fn gemini_generate(
    State(gw): State<Arc<Gateway>>,
    Path(endpoint): Path<String>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let (model, stream) = match parse_gemini_endpoint(&endpoint) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };
    let parts = match resolve_caller(&gw, &headers, addr.as_ref()).await {
        Ok(parts) => parts,
        Err(err) => return err.into_response(),
    };
    let parsed = match fingerprint::parse(
        payload,
        WireFormat::Gemini,
        Some(&model),
        Some(stream),
        parts.context,
    ) {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };

    let options = forward_options(&gw, &parts.caller, &parsed).await;
    if parsed.stream {
        crate::forward::handle_streaming(gw, parts.caller, parsed, options).await
    } else {
        match crate::forward::handle_buffered(gw, parts.caller, parsed, options).await {
            Ok(body) => Json(body).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

/// Serve until SIGINT/SIGTERM.
pub async fn serve(gw: Arc<Gateway>) -> crate::error::AppResult<()> {
    let listen = gw.settings.listen.clone();
    let app = build_router(gw);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_endpoint_parsing() {
        assert_eq!(
            parse_gemini_endpoint("models/gemini-2.5-pro:generateContent").unwrap(),
            ("gemini-2.5-pro".to_string(), false)
        );
        assert_eq!(
            parse_gemini_endpoint("models/gemini-2.5-flash:streamGenerateContent").unwrap(),
            ("gemini-2.5-flash".to_string(), true)
        );
        assert!(parse_gemini_endpoint("models/gemini-2.5-pro").is_err());
        assert!(parse_gemini_endpoint("tunedModels/x:generateContent").is_err());
        assert!(parse_gemini_endpoint("models/gemini:embedContent").is_err());
    }
}
