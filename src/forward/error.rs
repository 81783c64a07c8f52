//! Request-path error types.
//!
//! Every internal error carries a kind tag; mapping to HTTP happens only
//! here, at the outermost boundary. Mid-stream failures never change the
//! HTTP status; they are emitted as SSE `error` events instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Actor whose slot acquisition timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotActor {
    User,
    Account,
}

impl SlotActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotActor::User => "user",
            SlotActor::Account => "account",
        }
    }
}

/// Error types for the forwarding pipeline
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Missing or invalid API key
    AuthError(String),
    /// Body parse failure or bad parameters
    InvalidRequest(String),
    /// Balance or quota exhausted
    BillingDenied(String),
    /// The selector found no schedulable account
    NoAvailableAccounts,
    /// Wait-queue ceiling reached before slot acquisition even started
    TooManyPending,
    /// Concurrency wait expired
    SlotTimeout(SlotActor),
    /// Upstream 400 matching the vendor's prompt-length phrase
    PromptTooLong(String),
    /// Non-retryable upstream 4xx, surfaced with its original status
    UpstreamStatus { status: u16, body: String },
    /// Upstream failure after retry/failover was exhausted
    Upstream(String),
    /// Per-operation timeout
    Timeout(String),
    /// Internal invariant failure
    Internal(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::AuthError(msg) => write!(f, "Authentication failed: {}", msg),
            GatewayError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            GatewayError::BillingDenied(msg) => write!(f, "Billing denied: {}", msg),
            GatewayError::NoAvailableAccounts => write!(f, "No available accounts"),
            GatewayError::TooManyPending => write!(f, "Too many pending requests"),
            GatewayError::SlotTimeout(actor) => {
                write!(f, "Timed out waiting for a {} slot", actor.as_str())
            }
            GatewayError::PromptTooLong(msg) => write!(f, "Prompt too long: {}", msg),
            GatewayError::UpstreamStatus { status, body } => {
                write!(f, "Upstream returned {}: {}", status, body)
            }
            GatewayError::Upstream(msg) => write!(f, "Upstream failure: {}", msg),
            GatewayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<crate::error::AppError> for GatewayError {
    fn from(err: crate::error::AppError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl GatewayError {
    /// Error kind in the Anthropic-compatible envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthError(_) => "authentication_error",
            GatewayError::InvalidRequest(_) | GatewayError::PromptTooLong(_) => {
                "invalid_request_error"
            }
            GatewayError::BillingDenied(_) => "billing_error",
            GatewayError::TooManyPending | GatewayError::SlotTimeout(_) => "rate_limit_error",
            GatewayError::NoAvailableAccounts
            | GatewayError::UpstreamStatus { .. }
            | GatewayError::Upstream(_)
            | GatewayError::Timeout(_)
            | GatewayError::Internal(_) => "api_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthError(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) | GatewayError::PromptTooLong(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::BillingDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::NoAvailableAccounts => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::TooManyPending | GatewayError::SlotTimeout(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic-compatible error envelope.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }

    /// SSE frame for failures after streaming has started.
    pub fn sse_event(&self) -> String {
        format!("data: {}\n\n", self.envelope())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Upstream fatal errors pass the vendor body through untouched so
        // clients see the original diagnostics.
        if let GatewayError::UpstreamStatus { body, .. } = &self {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
                return (status, Json(value)).into_response();
            }
        }
        tracing::debug!(status = %status, kind = self.kind(), "returning error response");
        (status, Json(self.envelope())).into_response()
    }
}

/// Result type alias for forwarding operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            GatewayError::AuthError("no key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::BillingDenied("empty".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NoAvailableAccounts.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::SlotTimeout(SlotActor::User).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::PromptTooLong("prompt is too long".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn envelope_shape() {
        let env = GatewayError::TooManyPending.envelope();
        assert_eq!(env["type"], "error");
        assert_eq!(env["error"]["type"], "rate_limit_error");
        assert!(env["error"]["message"].is_string());
    }

    #[test]
    fn sse_event_is_data_framed() {
        let frame = GatewayError::BillingDenied("quota exhausted".into()).sse_event();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn upstream_status_passes_status_through() {
        let err = GatewayError::UpstreamStatus {
            status: 422,
            body: "{}".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::from_u16(422).unwrap());
    }
}
