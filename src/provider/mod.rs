//! Provider Adapter Layer (§4.1): a uniform asynchronous streaming
//! interface over heterogeneous LLM back-ends, normalized into one event
//! stream regardless of which wire protocol the upstream speaks.
//!
//! Two adapter families are implemented: [`family_a::NativeBlockAdapter`]
//! for back-ends that natively understand multi-block content with
//! tool-use, and [`family_b::OpenAiStyleAdapter`] for back-ends that use a
//! flat messages array and stream tool calls as structured deltas. Both
//! implement the same [`ProviderAdapter`] trait so the orchestrator never
//! branches on provider family.

pub mod family_a;
pub mod family_b;
pub mod sse;

use crate::model::Message;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// A tool the model is permitted to call this turn, already filtered by
/// policy (§4.2 selection).
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Decoding parameters a request may carry.
#[derive(Debug, Clone, Default)]
pub struct DecodingParams {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
}

/// One call to a provider's `stream` operation.
pub struct ProviderRequest {
    pub provider_id: String,
    pub model_id: String,
    /// The working list: conversation history plus the new turn's messages,
    /// already normalized (§4.1 "ordered list of conversation content blocks").
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub tools: Vec<ToolSpec>,
    pub decoding: DecodingParams,
    pub cancellation: CancellationToken,
}

/// Kind of a `ProviderError` event, mirroring the taxonomy names the spec
/// calls them by (not the engine-wide `Error` enum — provider errors are
/// reified as stream events so the orchestrator can react mid-stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    MalformedToolCall,
    Transient,
    Permanent,
}

/// A normalized event yielded by a provider adapter's stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ToolUseStart {
        call_id: String,
        tool_name: String,
    },
    ToolUseArgumentsDelta {
        call_id: String,
        fragment: String,
    },
    ToolUseEnd {
        call_id: String,
        parsed_arguments: serde_json::Value,
    },
    UsageReport {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    Done {
        stop_reason: String,
    },
    ProviderError {
        kind: ProviderErrorKind,
        retryable: bool,
        detail: String,
    },
}

/// Uniform streaming contract every provider family implements.
///
/// Guarantees (§4.1): text deltas for a turn are emitted in arrival order;
/// `ToolUseEnd` for a given call id is emitted exactly once, only after all
/// of that call's argument deltas; `Done` is always the stream's last event
/// on success; cancellation ends the sequence promptly with no further
/// events. The adapter itself never retries — that policy lives in the
/// orchestrator (§4.3).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn stream(&self, request: ProviderRequest) -> crate::Result<BoxStream<'static, StreamEvent>>;
}
