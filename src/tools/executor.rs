//! The tool execution contract (§4.2): lookup, schema validation,
//! confirmation rendezvous, a per-user concurrency cap, a hard deadline,
//! and an audit record — six steps shared by every tool regardless of its
//! handler, so a handler itself never has to implement timeout or
//! cancellation logic.

use super::registry::{ToolHandlerContext, ToolRegistry};
use crate::config::ToolDeadlines;
use crate::events::{EventBus, ObserverEvent};
use crate::model::{
    AgentId, CallId, ConversationId, InvocationOutcome, ToolId, ToolInvocation, ToolOutcomeKind,
    ToolResultContentBlock, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

/// Caps a tool's recorded output so one runaway handler can't blow up a
/// conversation's token budget; truncation is flagged, never silent.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// One dispatch request: everything [`ToolExecutor::execute`] needs beyond
/// the catalog and config it already holds.
pub struct ToolCallRequest {
    pub call_id: CallId,
    pub tool_id: ToolId,
    pub arguments: serde_json::Value,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub cancellation: CancellationToken,
}

/// The two things the orchestrator needs back: the content block that goes
/// into the conversation, and the audit row.
pub struct ToolExecutionRecord {
    pub result: ToolResultContentBlock,
    pub invocation: ToolInvocation,
}

/// Rendezvous point between a pending confirmation and whoever answers it
/// (typically a WebSocket command handler in `http`). One pending sender
/// per in-flight call id.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<CallId, oneshot::Sender<bool>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(&self, call_id: CallId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, tx);
        rx
    }

    /// Answers a pending confirmation. Returns `false` if no call with
    /// that id was waiting (already timed out, already answered, or never
    /// required confirmation).
    pub fn resolve(&self, call_id: &CallId, approved: bool) -> bool {
        if let Some(tx) = self.pending.lock().remove(call_id) {
            tx.send(approved).is_ok()
        } else {
            false
        }
    }
}

/// Tracks in-flight and queued tool calls per user, keyed separately for
/// confirmation-requiring tools (which typically carry a tighter cap) so a
/// burst of low-stakes calls can't starve a pending confirmed one.
struct ConcurrencySlot {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_capacity: usize,
}

impl ConcurrencySlot {
    fn new(permits: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1) as usize)),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_capacity: permits.max(1) as usize * 2,
        }
    }
}

#[derive(Default)]
struct ConcurrencyLimiter {
    standard: Mutex<HashMap<UserId, Arc<ConcurrencySlot>>>,
    confirmation: Mutex<HashMap<UserId, Arc<ConcurrencySlot>>>,
}

impl ConcurrencyLimiter {
    fn slot_for(&self, user_id: UserId, confirmation: bool, permits: u32) -> Arc<ConcurrencySlot> {
        let map = if confirmation { &self.confirmation } else { &self.standard };
        map.lock()
            .entry(user_id)
            .or_insert_with(|| Arc::new(ConcurrencySlot::new(permits)))
            .clone()
    }

    /// Acquires a permit, rejecting immediately once the bounded queue
    /// (running + waiting) is full rather than growing unbounded (§4.2
    /// "Concurrency policy").
    async fn acquire(
        &self,
        user_id: UserId,
        confirmation: bool,
        permits: u32,
    ) -> crate::Result<tokio::sync::OwnedSemaphorePermit> {
        let slot = self.slot_for(user_id, confirmation, permits);
        let previously_queued = slot.queued.fetch_add(1, Ordering::SeqCst);
        if previously_queued >= slot.queue_capacity {
            slot.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(crate::Error::Internal(format!(
                "backpressure rejected for user {user_id}"
            )));
        }
        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| crate::Error::Internal("concurrency semaphore closed".into()));
        slot.queued.fetch_sub(1, Ordering::SeqCst);
        permit
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    deadlines: ToolDeadlines,
    events: Arc<EventBus>,
    approvals: Arc<ApprovalGate>,
    concurrency: ConcurrencyLimiter,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, deadlines: ToolDeadlines, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            deadlines,
            events,
            approvals: Arc::new(ApprovalGate::new()),
            concurrency: ConcurrencyLimiter::default(),
        }
    }

    pub fn approvals(&self) -> Arc<ApprovalGate> {
        self.approvals.clone()
    }

    fn village_topic(&self, user_id: UserId) -> String {
        EventBus::village_topic(user_id)
    }

    fn fail(
        &self,
        mut invocation: ToolInvocation,
        outcome: InvocationOutcome,
        tool_outcome: ToolOutcomeKind,
        call_id: CallId,
        message: String,
    ) -> ToolExecutionRecord {
        invocation.finish(outcome, message.clone(), false);
        self.events.publish(
            &self.village_topic(invocation.user_id),
            ObserverEvent::ToolError {
                call_id: call_id.to_string(),
                kind: format!("{outcome:?}"),
            },
        );
        ToolExecutionRecord {
            result: ToolResultContentBlock {
                call_id,
                outcome: tool_outcome,
                payload: serde_json::json!({ "error": message }),
            },
            invocation,
        }
    }

    /// Runs the full six-step contract for one tool call. Never returns
    /// `Err` for ordinary tool failures — every failure mode in §4.2 is
    /// reified as a [`ToolExecutionRecord`] whose result block carries the
    /// failure, so a batch of tool calls can partially fail without
    /// aborting the orchestrator's loop.
    pub async fn execute(&self, call: ToolCallRequest) -> ToolExecutionRecord {
        let ToolCallRequest {
            call_id,
            tool_id,
            arguments,
            user_id,
            conversation_id,
            agent_id,
            cancellation,
        } = call;

        let input_summary = truncate_for_audit(&arguments);
        let mut invocation = ToolInvocation::start(
            call_id.clone(),
            tool_id.clone(),
            user_id,
            conversation_id,
            agent_id,
            input_summary,
        );

        // 1. Lookup.
        let Some(registered) = self.registry.get(&tool_id).cloned() else {
            return self.fail(
                invocation,
                InvocationOutcome::UnknownTool,
                ToolOutcomeKind::RuntimeError,
                call_id,
                format!("unknown tool {tool_id}"),
            );
        };

        // 2. Schema validation.
        if let Err(detail) = validate_arguments(&registered.descriptor.input_schema, &arguments) {
            return self.fail(
                invocation,
                InvocationOutcome::ValidationError,
                ToolOutcomeKind::ValidationError,
                call_id,
                detail,
            );
        }

        // 3. Announce start.
        self.events.publish(
            &self.village_topic(user_id),
            ObserverEvent::ToolStart {
                call_id: call_id.to_string(),
                tool_name: registered.descriptor.name.clone(),
            },
        );

        // 4. Confirmation rendezvous, if the tool requires it.
        if registered.descriptor.capabilities.requires_confirmation {
            self.events
                .publish(&self.village_topic(user_id), ObserverEvent::ApprovalNeeded {
                    call_id: call_id.to_string(),
                });
            let receiver = self.approvals.request(call_id.clone());
            let decision = tokio::time::timeout(self.deadlines.approval_window, receiver).await;
            match decision {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    return self.fail(
                        invocation,
                        InvocationOutcome::UserRejected,
                        ToolOutcomeKind::Cancelled,
                        call_id,
                        "rejected by user".into(),
                    );
                }
                Ok(Err(_)) | Err(_) => {
                    return self.fail(
                        invocation,
                        InvocationOutcome::ApprovalTimeout,
                        ToolOutcomeKind::Timeout,
                        call_id,
                        "approval timed out".into(),
                    );
                }
            }
        }

        // 5. Per-user concurrency cap.
        let permits = if registered.descriptor.capabilities.requires_confirmation {
            self.deadlines.confirmation_max_concurrency_per_user
        } else if registered.descriptor.capabilities.max_concurrency_per_user > 0 {
            registered.descriptor.capabilities.max_concurrency_per_user
        } else {
            self.deadlines.default_max_concurrency_per_user
        };
        let _permit = match self
            .concurrency
            .acquire(user_id, registered.descriptor.capabilities.requires_confirmation, permits)
            .await
        {
            Ok(permit) => permit,
            Err(_) => {
                return self.fail(
                    invocation,
                    InvocationOutcome::BackpressureRejected,
                    ToolOutcomeKind::RuntimeError,
                    call_id,
                    "too many concurrent calls for this user".into(),
                );
            }
        };

        // 6. Run with a hard deadline, racing cancellation.
        let ctx = ToolHandlerContext {
            user_id,
            conversation_id,
            agent_id,
            cancellation: cancellation.clone(),
        };
        let deadline = self.deadlines.timeout_for(&tool_id.0);
        let started = std::time::Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(RunFailure::Cancelled),
            result = tokio::time::timeout(deadline, (registered.handler)(arguments, ctx)) => {
                match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(RunFailure::Runtime(e.client_message())),
                    Err(_) => Err(RunFailure::Timeout),
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                let (payload, truncated) = truncate_output(value);
                invocation.finish(InvocationOutcome::Success, payload.to_string(), truncated);
                self.events.publish(
                    &self.village_topic(user_id),
                    ObserverEvent::ToolComplete {
                        call_id: call_id.to_string(),
                        elapsed_ms,
                    },
                );
                ToolExecutionRecord {
                    result: ToolResultContentBlock {
                        call_id,
                        outcome: ToolOutcomeKind::Success,
                        payload,
                    },
                    invocation,
                }
            }
            Err(RunFailure::Timeout) => self.fail(
                invocation,
                InvocationOutcome::Timeout,
                ToolOutcomeKind::Timeout,
                call_id,
                format!("tool exceeded its {:?} deadline", deadline),
            ),
            Err(RunFailure::Cancelled) => self.fail(
                invocation,
                InvocationOutcome::Cancelled,
                ToolOutcomeKind::Cancelled,
                call_id,
                "request cancelled".into(),
            ),
            Err(RunFailure::Runtime(detail)) => self.fail(
                invocation,
                InvocationOutcome::RuntimeError,
                ToolOutcomeKind::RuntimeError,
                call_id,
                detail,
            ),
        }
    }
}

enum RunFailure {
    Timeout,
    Cancelled,
    Runtime(String),
}

fn validate_arguments(schema: &serde_json::Value, arguments: &serde_json::Value) -> Result<(), String> {
    let compiled =
        jsonschema::JSONSchema::compile(schema).map_err(|e| format!("invalid tool schema: {e}"))?;
    match compiled.validate(arguments) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ")),
    }
}

fn truncate_for_audit(value: &serde_json::Value) -> String {
    let rendered = value.to_string();
    if rendered.len() > MAX_OUTPUT_BYTES {
        format!("{}...<truncated>", &rendered[..MAX_OUTPUT_BYTES])
    } else {
        rendered
    }
}

fn truncate_output(value: serde_json::Value) -> (serde_json::Value, bool) {
    let rendered = value.to_string();
    if rendered.len() <= MAX_OUTPUT_BYTES {
        return (value, false);
    }
    let truncated: String = rendered.chars().take(MAX_OUTPUT_BYTES).collect();
    (serde_json::json!({ "truncated_output": truncated }), true)
}
