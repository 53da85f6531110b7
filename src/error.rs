//! Error taxonomy for the orchestration and tool execution engine.
//!
//! Every variant corresponds to a kind named at the core boundary:
//! short-circuiting gate failures (`Unauthenticated`, `TierForbidden`,
//! `OverQuota`), provider failures (`ProviderTransient`/`ProviderPermanent`),
//! tool failures (`ToolValidationError`, `ToolRuntimeError`, `ToolTimeout`,
//! `ToolCancelled`), and the two non-erroneous-but-terminal outcomes
//! (`LoopBoundExceeded`, `Cancelled`). `Internal` is the catch-all for bugs
//! and is never shown verbatim to a client — see `client_message`.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy.
#[derive(Error, Debug)]
pub enum Error {
    /// No valid credential was presented.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The user's tier excludes the requested model, tool, or feature.
    #[error("tier forbids access to {resource}")]
    TierForbidden { resource: String },

    /// A quota reservation failed; `reset_at` names when the counter resets.
    #[error("over quota: {counter} resets at {reset_at}")]
    OverQuota {
        counter: String,
        reset_at: DateTime<Utc>,
    },

    /// A transient provider failure; retry-eligible.
    #[error("provider error (transient): {detail}")]
    ProviderTransient { detail: String },

    /// A non-retryable provider failure.
    #[error("provider error (permanent): {detail}")]
    ProviderPermanent { detail: String },

    /// The adapter could not parse a tool call's arguments by stream end.
    #[error("malformed tool call {call_id}")]
    MalformedToolCall { call_id: String },

    /// Schema validation rejected a tool call's arguments.
    #[error("tool {call_id} failed validation: {message}")]
    ToolValidationError { call_id: String, message: String },

    /// A tool handler returned an error.
    #[error("tool {call_id} failed: {detail}")]
    ToolRuntimeError { call_id: String, detail: String },

    /// A tool handler exceeded its deadline.
    #[error("tool {call_id} timed out")]
    ToolTimeout { call_id: String },

    /// A tool invocation was cancelled by the request or an explicit stop.
    #[error("tool {call_id} cancelled")]
    ToolCancelled { call_id: String },

    /// The model requested an unregistered tool id.
    #[error("unknown tool {tool_id}")]
    UnknownTool { tool_id: String },

    /// A user-confirmation tool was rejected by the user.
    #[error("tool {call_id} rejected by user")]
    UserRejected { call_id: String },

    /// A user-confirmation tool received no answer within the approval window.
    #[error("tool {call_id} approval timed out")]
    ApprovalTimeout { call_id: String },

    /// A per-user concurrency cap was exceeded and the queue is full.
    #[error("tool dispatch rejected: backpressure on user {user_id}")]
    BackpressureRejected { user_id: String },

    /// The orchestrator's agentic loop hit its iteration cap with tool-use
    /// still pending. Non-erroneous: a correctness bound, not a bug.
    #[error("loop bound exceeded after {iterations} iterations")]
    LoopBoundExceeded { iterations: u32 },

    /// The request was cancelled by its caller.
    #[error("request cancelled")]
    Cancelled,

    /// HTTP transport failure talking to a provider or tool backend.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration detected at startup or snapshot construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid caller input that is not one of the named kinds above.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A bug. Never exposed verbatim to a client; surfaced as a generic 5xx.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn tier_forbidden(resource: impl Into<String>) -> Self {
        Error::TierForbidden {
            resource: resource.into(),
        }
    }

    pub fn over_quota(counter: impl Into<String>, reset_at: DateTime<Utc>) -> Self {
        Error::OverQuota {
            counter: counter.into(),
            reset_at,
        }
    }

    pub fn provider_transient(detail: impl Into<String>) -> Self {
        Error::ProviderTransient {
            detail: detail.into(),
        }
    }

    pub fn provider_permanent(detail: impl Into<String>) -> Self {
        Error::ProviderPermanent {
            detail: detail.into(),
        }
    }

    pub fn malformed_tool_call(call_id: impl Into<String>) -> Self {
        Error::MalformedToolCall {
            call_id: call_id.into(),
        }
    }

    pub fn tool_validation(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ToolValidationError {
            call_id: call_id.into(),
            message: message.into(),
        }
    }

    pub fn tool_runtime(call_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::ToolRuntimeError {
            call_id: call_id.into(),
            detail: detail.into(),
        }
    }

    pub fn tool_timeout(call_id: impl Into<String>) -> Self {
        Error::ToolTimeout {
            call_id: call_id.into(),
        }
    }

    pub fn tool_cancelled(call_id: impl Into<String>) -> Self {
        Error::ToolCancelled {
            call_id: call_id.into(),
        }
    }

    pub fn unknown_tool(tool_id: impl Into<String>) -> Self {
        Error::UnknownTool {
            tool_id: tool_id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The `kind` tag sent to clients in `error{kind, message}` frames (§7).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "Unauthenticated",
            Error::TierForbidden { .. } => "TierForbidden",
            Error::OverQuota { .. } => "OverQuota",
            Error::ProviderTransient { .. } => "ProviderTransient",
            Error::ProviderPermanent { .. } | Error::Http(_) => "ProviderPermanent",
            Error::MalformedToolCall { .. } => "MalformedToolCall",
            Error::ToolValidationError { .. } => "ToolValidationError",
            Error::ToolRuntimeError { .. } => "ToolRuntimeError",
            Error::ToolTimeout { .. } => "ToolTimeout",
            Error::ToolCancelled { .. } => "ToolCancelled",
            Error::UnknownTool { .. } => "UnknownTool",
            Error::UserRejected { .. } => "UserRejected",
            Error::ApprovalTimeout { .. } => "ApprovalTimeout",
            Error::BackpressureRejected { .. } => "BackpressureRejected",
            Error::LoopBoundExceeded { .. } => "LoopBoundExceeded",
            Error::Cancelled => "Cancelled",
            Error::Json(_) | Error::Config(_) | Error::InvalidInput(_) | Error::Internal(_) => {
                "Internal"
            }
        }
    }

    /// Whether retry is ever appropriate for this kind (used by `retry.rs`
    /// as a conservative first filter; provider adapters still consult the
    /// underlying transient/permanent split directly).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ProviderTransient { .. } | Error::Http(_))
    }

    /// Whether the client should ever see this error's message verbatim.
    /// `Internal`/`Json`/`Http` never should (§7); everything else may.
    pub fn client_message(&self) -> String {
        match self {
            Error::Internal(_) | Error::Json(_) | Error::Http(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_quota_names_counter_and_reset() {
        let reset_at = Utc::now();
        let err = Error::over_quota("messages_total", reset_at);
        assert_eq!(err.kind(), "OverQuota");
        assert!(err.to_string().contains("messages_total"));
    }

    #[test]
    fn internal_errors_are_masked_for_clients() {
        let err = Error::internal("bug: index out of bounds");
        assert_eq!(err.client_message(), "an internal error occurred");
    }

    #[test]
    fn tier_forbidden_is_not_masked() {
        let err = Error::tier_forbidden("model:opus");
        assert!(err.client_message().contains("model:opus"));
    }

    #[test]
    fn loop_bound_is_not_an_internal_kind() {
        let err = Error::LoopBoundExceeded { iterations: 5 };
        assert_eq!(err.kind(), "LoopBoundExceeded");
    }

    #[test]
    fn only_transient_provider_and_http_are_retryable() {
        assert!(Error::provider_transient("timeout").is_retryable());
        assert!(!Error::provider_permanent("bad request").is_retryable());
        assert!(!Error::tool_timeout("call_1").is_retryable());
    }

    #[test]
    fn json_error_converts_via_from() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
