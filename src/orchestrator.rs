//! The Agent Orchestrator (§4.3): one bounded agentic loop per chat
//! request — model call, tool dispatch, model call again, until the model
//! stops asking for tools or the loop bound is reached.
//!
//! Grounded on the SDK's own `Client::auto_execute_loop` (collect blocks →
//! split text/tool-use → dispatch tools → append results → resend),
//! generalized from sequential per-tool execution to a concurrent batch
//! dispatch with stable, call-order result placement, and from the
//! teacher's single in-process hook chain to the registry-backed
//! [`crate::tools::ToolExecutor`].

use crate::config::EngineConfig;
#[cfg(test)]
use crate::events::SseEvent;
use crate::events::SseSink;
use crate::model::{
    Agent, ContentBlock, ConversationId, Message, MessageRole, Tier, TokenUsage,
    ToolId, ToolInvocation, ToolOutcomeKind, ToolUseBlock, UserId,
};
#[cfg(test)]
use crate::model::{AgentId, CallId};
#[cfg(not(test))]
use crate::model::CallId;
use crate::provider::{DecodingParams, ProviderAdapter, ProviderErrorKind, ProviderRequest, StreamEvent};
use crate::retry::{retry_with_backoff_conditional, RetryConfig};
use crate::tools::{ToolCallRequest, ToolExecutor, ToolRegistry};
use crate::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Set of instantiated provider adapters, keyed by provider id (§4.1 — the
/// orchestrator never branches on provider family; it just looks the
/// adapter up and calls `stream`).
pub type ProviderTable = HashMap<String, Arc<dyn ProviderAdapter>>;

/// Everything needed to run one chat turn (§6 "chat streaming endpoint").
pub struct TurnRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub agent: Arc<Agent>,
    pub tier: Tier,
    pub provider_id: String,
    pub model_id: String,
    pub system_prompt: String,
    pub decoding: DecodingParams,
    /// Already-truncated conversation tail (§4.7 `load_conversation_tail`).
    pub history: Vec<Message>,
    pub new_message: Message,
    pub sink: SseSink,
    pub cancellation: CancellationToken,
    /// Whether the model is offered tools at all for this turn (§6
    /// "tools-enabled flag"). `false` means the agent's tool list is never
    /// even shown to the provider.
    pub tools_enabled: bool,
}

/// Why the loop stopped.
#[derive(Debug, Clone)]
pub enum TurnStopReason {
    Natural(String),
    LoopBoundExceeded,
    Cancelled,
    ProviderPermanent(String),
}

impl TurnStopReason {
    fn label(&self) -> String {
        match self {
            TurnStopReason::Natural(reason) => reason.clone(),
            TurnStopReason::LoopBoundExceeded => "loop_bound_exceeded".to_string(),
            TurnStopReason::Cancelled => "cancelled".to_string(),
            TurnStopReason::ProviderPermanent(_) => "provider_error".to_string(),
        }
    }
}

/// What one request produced: at most one new assistant message (§4.3
/// "persistence of exactly one assistant message per request") plus the
/// token usage observed along the way.
pub struct TurnOutcome {
    pub assistant_message: Option<Message>,
    pub usage: TokenUsage,
    pub stop_reason: TurnStopReason,
    /// One audit row per tool call made during the turn, in call order,
    /// across every round (§4.2 step 6, §6 "audit log of tool invocations").
    pub invocations: Vec<ToolInvocation>,
}

pub struct Orchestrator {
    providers: Arc<ProviderTable>,
    tool_registry: Arc<ToolRegistry>,
    tools: Arc<ToolExecutor>,
    retry_config: RetryConfig,
    loop_bound: u32,
}

impl Orchestrator {
    pub fn new(providers: Arc<ProviderTable>, tool_registry: Arc<ToolRegistry>, tools: Arc<ToolExecutor>, config: &EngineConfig) -> Self {
        Self {
            providers,
            tool_registry,
            tools,
            retry_config: RetryConfig::new().with_max_attempts(config.provider_retry_attempts),
            loop_bound: config.loop_bound,
        }
    }

    /// Runs the bounded agentic loop for one request.
    pub async fn run_turn(&self, request: TurnRequest) -> TurnOutcome {
        let Some(adapter) = self.providers.get(&request.provider_id).cloned() else {
            let _ = request
                .sink
                .error("provider_permanent", format!("unknown provider {}", request.provider_id))
                .await;
            let _ = request.sink.done(Some("provider_error".to_string())).await;
            return TurnOutcome {
                assistant_message: None,
                usage: TokenUsage::default(),
                stop_reason: TurnStopReason::ProviderPermanent("unknown provider".into()),
                invocations: Vec::new(),
            };
        };

        let tools = if request.tools_enabled {
            self.tool_registry.select_for(request.tier, &request.agent)
        } else {
            Vec::new()
        };

        let mut working: Vec<Message> = request.history.clone();
        working.push(request.new_message.clone());

        let mut usage_total = TokenUsage::default();
        let mut final_content: Vec<ContentBlock> = Vec::new();
        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut stop_reason = TurnStopReason::Natural("stop".to_string());

        for iteration in 0..self.loop_bound {
            if request.cancellation.is_cancelled() {
                stop_reason = TurnStopReason::Cancelled;
                break;
            }

            let provider_request = ProviderRequest {
                provider_id: request.provider_id.clone(),
                model_id: request.model_id.clone(),
                messages: working.clone(),
                system_prompt: request.system_prompt.clone(),
                tools: tools.clone(),
                decoding: request.decoding.clone(),
                cancellation: request.cancellation.child_token(),
            };

            let round = self.run_provider_round(adapter.as_ref(), provider_request, &request.sink).await;

            match round {
                Ok(RoundOutcome::Success {
                    text,
                    tool_uses,
                    usage,
                    stop,
                }) => {
                    usage_total.merge(usage);

                    let mut content_blocks: Vec<ContentBlock> = Vec::new();
                    if !text.is_empty() {
                        content_blocks.push(ContentBlock::text(text));
                    }
                    for tool_use in &tool_uses {
                        content_blocks.push(ContentBlock::ToolUse(tool_use.clone()));
                    }

                    if tool_uses.is_empty() {
                        final_content.extend(content_blocks);
                        stop_reason = TurnStopReason::Natural(stop);
                        break;
                    }

                    final_content.extend(content_blocks.clone());
                    working.push(Message::new(request.conversation_id, MessageRole::Assistant, content_blocks));

                    let (result_blocks, round_invocations) = self.dispatch_tool_batch(&request, &tool_uses).await;
                    final_content.extend(result_blocks.clone());
                    invocations.extend(round_invocations);
                    working.push(Message::new(request.conversation_id, MessageRole::ToolResult, result_blocks));

                    if iteration + 1 == self.loop_bound {
                        stop_reason = TurnStopReason::LoopBoundExceeded;
                        final_content.push(ContentBlock::text(
                            "Reached the maximum number of tool-use iterations for this turn.",
                        ));
                    }
                }
                Ok(RoundOutcome::Permanent(detail)) => {
                    let _ = request.sink.error("provider_permanent", detail.clone()).await;
                    final_content.push(ContentBlock::text(format!("[provider error: {detail}]")));
                    stop_reason = TurnStopReason::ProviderPermanent(detail);
                    break;
                }
                Err(e) => {
                    let _ = request.sink.error(e.kind(), e.client_message()).await;
                    final_content.push(ContentBlock::text(format!("[provider error: {}]", e.client_message())));
                    stop_reason = TurnStopReason::ProviderPermanent(e.client_message());
                    break;
                }
            }
        }

        // §9 Open Question 1: a cancelled request discards partial text but
        // still commits the token usage already reported by the provider.
        let assistant_message = if matches!(stop_reason, TurnStopReason::Cancelled) {
            None
        } else {
            let mut message = Message::new(request.conversation_id, MessageRole::Assistant, final_content);
            message.usage = Some(usage_total);
            Some(message)
        };

        let _ = request.sink.done(Some(stop_reason.label())).await;

        TurnOutcome {
            assistant_message,
            usage: usage_total,
            stop_reason,
            invocations,
        }
    }

    /// Dispatches a batch of tool-use blocks concurrently, placing results
    /// back in call order rather than completion order (§5 ordering
    /// guarantee for a tool batch). Returns the content blocks alongside
    /// each call's audit row so the caller can persist both.
    async fn dispatch_tool_batch(
        &self,
        request: &TurnRequest,
        tool_uses: &[ToolUseBlock],
    ) -> (Vec<ContentBlock>, Vec<ToolInvocation>) {
        let mut pending = Vec::with_capacity(tool_uses.len());
        for tool_use in tool_uses {
            let _ = request
                .sink
                .tool_start(tool_use.call_id.to_string(), tool_use.tool_name.clone())
                .await;
            let call = ToolCallRequest {
                call_id: tool_use.call_id.clone(),
                tool_id: ToolId::from(tool_use.tool_name.clone()),
                arguments: tool_use.arguments.clone(),
                user_id: request.user_id,
                conversation_id: request.conversation_id,
                agent_id: request.agent.id,
                cancellation: request.cancellation.clone(),
            };
            pending.push(self.tools.execute(call));
        }

        let records = futures::future::join_all(pending).await;
        let mut blocks = Vec::with_capacity(records.len());
        let mut invocations = Vec::with_capacity(records.len());
        for record in records {
            match record.result.outcome {
                ToolOutcomeKind::Success => {
                    let _ = request
                        .sink
                        .tool_complete(record.result.call_id.to_string(), 0, record.result.payload.clone())
                        .await;
                }
                _ => {
                    let _ = request
                        .sink
                        .tool_error(
                            record.result.call_id.to_string(),
                            format!("{:?}", record.result.outcome),
                            record.result.payload.to_string(),
                        )
                        .await;
                }
            }
            blocks.push(ContentBlock::ToolResult(record.result));
            invocations.push(record.invocation);
        }
        (blocks, invocations)
    }

    /// One model round-trip, retried with backoff while the failure is a
    /// transient provider error; a `restart` marker precedes every retry so
    /// the client knows to discard whatever partial tokens it already
    /// rendered for this round (§4.1, §4.3 failure semantics).
    async fn run_provider_round(
        &self,
        adapter: &dyn ProviderAdapter,
        request: ProviderRequest,
        sink: &SseSink,
    ) -> Result<RoundOutcome> {
        let attempt = AtomicU32::new(0);
        retry_with_backoff_conditional(self.retry_config.clone(), || {
            let attempt_no = attempt.fetch_add(1, Ordering::SeqCst);
            let cloned_request = ProviderRequest {
                provider_id: request.provider_id.clone(),
                model_id: request.model_id.clone(),
                messages: request.messages.clone(),
                system_prompt: request.system_prompt.clone(),
                tools: request.tools.clone(),
                decoding: request.decoding.clone(),
                cancellation: request.cancellation.clone(),
            };
            async move {
                if attempt_no > 0 {
                    let _ = sink.restart().await;
                }
                self.consume_round(adapter, cloned_request, sink).await
            }
        })
        .await
    }

    async fn consume_round(&self, adapter: &dyn ProviderAdapter, request: ProviderRequest, sink: &SseSink) -> Result<RoundOutcome> {
        let mut stream = adapter.stream(request).await?;

        let mut text = String::new();
        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut tool_uses: Vec<ToolUseBlock> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut stop = "stop".to_string();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta(fragment) => {
                    text.push_str(&fragment);
                    let _ = sink.token(fragment).await;
                }
                StreamEvent::ToolUseStart { call_id, tool_name } => {
                    tool_names.insert(call_id, tool_name);
                }
                StreamEvent::ToolUseArgumentsDelta { .. } => {}
                StreamEvent::ToolUseEnd { call_id, parsed_arguments } => {
                    let tool_name = tool_names.get(&call_id).cloned().unwrap_or_default();
                    tool_uses.push(ToolUseBlock {
                        call_id: CallId::from(call_id),
                        tool_name,
                        arguments: parsed_arguments,
                    });
                }
                StreamEvent::UsageReport {
                    input_tokens,
                    output_tokens,
                    cached_tokens,
                } => usage.merge(TokenUsage {
                    input_tokens,
                    output_tokens,
                    cached_tokens,
                }),
                StreamEvent::Done { stop_reason } => stop = stop_reason,
                StreamEvent::ProviderError {
                    kind: ProviderErrorKind::Transient,
                    detail,
                    ..
                } => return Err(Error::provider_transient(detail)),
                StreamEvent::ProviderError { detail, .. } => return Ok(RoundOutcome::Permanent(detail)),
            }
        }

        Ok(RoundOutcome::Success {
            text,
            tool_uses,
            usage,
            stop,
        })
    }
}

enum RoundOutcome {
    Success {
        text: String,
        tool_uses: Vec<ToolUseBlock>,
        usage: TokenUsage,
        stop: String,
    },
    Permanent(String),
}
