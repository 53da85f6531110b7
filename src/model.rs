//! Domain entities shared by the orchestrator, the council engine, and the
//! quota gate: users, conversations, messages and their content blocks,
//! agents, tools, and the bookkeeping records (`ToolInvocation`,
//! `UsageCounter`, `CouncilSession`, `StreamSubscription`).
//!
//! Identifiers are newtype-wrapped `Uuid`s, following the same
//! validate-at-construction spirit as the SDK's `ModelName`/`BaseUrl`
//! wrappers, so a `UserId` can never be accidentally passed where a
//! `ConversationId` is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(ConversationId);
uuid_id!(MessageId);
uuid_id!(AgentId);
uuid_id!(SessionId);

/// A tool-call identifier. Providers mint these (or the adapter does, for
/// families that don't); they are opaque strings rather than UUIDs because
/// family-B providers assign their own call id format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable string identifier for a registered tool (e.g. `"calculator"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolId(pub String);

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ToolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ToolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Subscription tier. Ordered: feature gates compare tiers monotonically
/// rather than matching on a fixed set of names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trial,
    Seeker,
    Alchemist,
    Adept,
    Opus,
    Azothic,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Trial => "trial",
            Tier::Seeker => "seeker",
            Tier::Alchemist => "alchemist",
            Tier::Adept => "adept",
            Tier::Opus => "opus",
            Tier::Azothic => "azothic",
        };
        write!(f, "{s}")
    }
}

/// A registered user of the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tier: Tier,
    /// Audited diagnostic flag (§9 Open Question 3). Never consulted by the
    /// quota gate's tier check itself; callers that want dev-mode behavior
    /// must read it explicitly.
    pub dev_mode: bool,
    /// Opaque references to provider-specific credentials, if the user
    /// brings their own keys. The core never inspects these.
    pub provider_credentials: Vec<String>,
}

impl User {
    pub fn new(tier: Tier) -> Self {
        Self {
            id: UserId::new(),
            tier,
            dev_mode: false,
            provider_credentials: Vec::new(),
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolResult,
}

/// An atomic unit of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultContentBlock),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock { text: text.into() })
    }

    /// The call id a tool-use or tool-result block carries, if any.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ContentBlock::ToolUse(b) => Some(&b.call_id),
            ContentBlock::ToolResult(b) => Some(&b.call_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub media_type: String,
    /// Base64-encoded image bytes, or a URL depending on `is_url`.
    pub data: String,
    pub is_url: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub call_id: CallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of a tool invocation as recorded into the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcomeKind {
    Success,
    Timeout,
    ValidationError,
    RuntimeError,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultContentBlock {
    pub call_id: CallId,
    pub outcome: ToolOutcomeKind,
    /// Success payload, or an error text when `outcome != Success`.
    pub payload: serde_json::Value,
}

/// Input/output/cached token accounting for a single message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn merge(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

/// A single message in a conversation or council transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn new(conversation_id: ConversationId, role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content,
            created_at: Utc::now(),
            agent_id: None,
            usage: None,
        }
    }

    pub fn user(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::User, vec![ContentBlock::text(text)])
    }

    /// Every `ToolUse` block in this message's content, in order.
    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUseBlock> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse(t) => Some(t),
            _ => None,
        })
    }

    /// Validates invariant 1 (§8): every tool-use block is immediately
    /// followed, among this message's content, by a tool-result block with
    /// the same call id.
    pub fn tool_pairs_are_complete(&self) -> bool {
        let mut pending: Vec<&CallId> = Vec::new();
        for block in &self.content {
            match block {
                ContentBlock::ToolUse(t) => pending.push(&t.call_id),
                ContentBlock::ToolResult(r) => {
                    if let Some(pos) = pending.iter().position(|id| *id == &r.call_id) {
                        pending.remove(pos);
                    }
                }
                _ => {}
            }
        }
        pending.is_empty()
    }
}

/// An append-only, optionally-forked sequence of messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: UserId,
    pub messages: Vec<Message>,
    pub parent_conversation_id: Option<ConversationId>,
    pub fork_anchor_message_id: Option<MessageId>,
}

impl Conversation {
    pub fn new(owner: UserId) -> Self {
        Self {
            id: ConversationId::new(),
            owner,
            messages: Vec::new(),
            parent_conversation_id: None,
            fork_anchor_message_id: None,
        }
    }
}

/// Whether an agent runs under ordinary constraints or an elevated mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Standard,
    Elevated,
}

/// A named persona: read-only configuration consulted by the orchestrator
/// and the council engine, never mutated at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub system_prompt_template: String,
    pub allowed_tools: Vec<ToolId>,
    pub default_model: String,
    pub mode: AgentMode,
}

/// Capability flags a tool descriptor declares at registration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolCapabilities {
    pub requires_user_context: bool,
    pub may_suspend_long: bool,
    pub requires_confirmation: bool,
    pub max_concurrency_per_user: u32,
}

/// Static, immutable-after-registration description of a tool. The handler
/// itself lives in `tools::registry` — this is the catalog-facing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: ToolId,
    pub name: String,
    pub category: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub capabilities: ToolCapabilities,
    /// Minimum tier required to see this tool at all.
    pub minimum_tier: Tier,
}

/// Terminal outcome of a single tool call, used for the audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    Timeout,
    ValidationError,
    RuntimeError,
    Cancelled,
    UnknownTool,
    UserRejected,
    ApprovalTimeout,
    BackpressureRejected,
}

/// Ephemeral audit record of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: CallId,
    pub tool_id: ToolId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<InvocationOutcome>,
    /// Truncated for audit; never the full payload if it exceeds the cap.
    pub input_summary: String,
    pub output_summary: String,
    pub output_truncated: bool,
}

impl ToolInvocation {
    pub fn start(
        call_id: CallId,
        tool_id: ToolId,
        user_id: UserId,
        conversation_id: ConversationId,
        agent_id: AgentId,
        input_summary: String,
    ) -> Self {
        Self {
            call_id,
            tool_id,
            user_id,
            conversation_id,
            agent_id,
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            input_summary,
            output_summary: String::new(),
            output_truncated: false,
        }
    }

    pub fn finish(&mut self, outcome: InvocationOutcome, output_summary: String, truncated: bool) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.output_summary = output_summary;
        self.output_truncated = truncated;
    }
}

/// A named, atomic per-user-per-period counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    MessagesTotal,
    MessagesHaiku,
    MessagesSonnet,
    MessagesOpus,
    MessagesOther,
    MusicGenerations,
    CouncilSessions,
    CouncilRounds,
    JamSessions,
    TrainingJobs,
    VaultBytes,
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CounterKind::MessagesTotal => "messages_total",
            CounterKind::MessagesHaiku => "messages_haiku",
            CounterKind::MessagesSonnet => "messages_sonnet",
            CounterKind::MessagesOpus => "messages_opus",
            CounterKind::MessagesOther => "messages_other",
            CounterKind::MusicGenerations => "music_generations",
            CounterKind::CouncilSessions => "council_sessions",
            CounterKind::CouncilRounds => "council_rounds",
            CounterKind::JamSessions => "jam_sessions",
            CounterKind::TrainingJobs => "training_jobs",
            CounterKind::VaultBytes => "vault_bytes",
        };
        write!(f, "{s}")
    }
}

/// A single (user, counter, period) ledger row.
#[derive(Debug, Clone, Copy)]
pub struct UsageCounter {
    pub count: u64,
    pub limit: u64,
    pub period_start: DateTime<Utc>,
    pub period_reset_at: DateTime<Utc>,
}

impl UsageCounter {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Council session lifecycle state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
}

/// Why a council session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Consensus,
    RoundCapReached,
    Stopped,
    Cancelled,
}

/// One turn's worth of transcript content in a council session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: SessionMessageRole,
    pub agent_id: Option<AgentId>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageRole {
    Agent,
    HumanInterject,
}

/// A running or completed multi-agent deliberation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSession {
    pub id: SessionId,
    pub topic: String,
    pub owner: UserId,
    pub participants: Vec<AgentId>,
    pub max_rounds: u32,
    pub current_round: u32,
    pub state: SessionState,
    pub termination_reason: Option<TerminationReason>,
    pub model_override: Option<String>,
    pub transcript: Vec<SessionMessage>,
}

impl CouncilSession {
    pub fn new(owner: UserId, topic: impl Into<String>, participants: Vec<AgentId>, max_rounds: u32) -> Self {
        Self {
            id: SessionId::new(),
            topic: topic.into(),
            owner,
            participants,
            max_rounds,
            current_round: 0,
            state: SessionState::Pending,
            termination_reason: None,
            model_override: None,
            transcript: Vec::new(),
        }
    }
}

/// A request-scoped binding between a caller and the event stream it reads.
#[derive(Debug)]
pub struct StreamSubscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl StreamSubscription {
    pub fn new(user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_monotonically_ordered() {
        assert!(Tier::Trial < Tier::Seeker);
        assert!(Tier::Seeker < Tier::Alchemist);
        assert!(Tier::Alchemist < Tier::Adept);
        assert!(Tier::Adept < Tier::Opus);
        assert!(Tier::Opus < Tier::Azothic);
    }

    #[test]
    fn tool_pairs_are_complete_detects_orphan_tool_use() {
        let conv_id = ConversationId::new();
        let call_id = CallId::from("call_1");
        let msg = Message::new(
            conv_id,
            MessageRole::Assistant,
            vec![ContentBlock::ToolUse(ToolUseBlock {
                call_id: call_id.clone(),
                tool_name: "calculator".into(),
                arguments: serde_json::json!({"a": 2, "b": 3}),
            })],
        );
        assert!(!msg.tool_pairs_are_complete());
    }

    #[test]
    fn tool_pairs_are_complete_accepts_matched_pair() {
        let conv_id = ConversationId::new();
        let call_id = CallId::from("call_1");
        let msg = Message::new(
            conv_id,
            MessageRole::Assistant,
            vec![
                ContentBlock::ToolUse(ToolUseBlock {
                    call_id: call_id.clone(),
                    tool_name: "calculator".into(),
                    arguments: serde_json::json!({}),
                }),
                ContentBlock::ToolResult(ToolResultContentBlock {
                    call_id: call_id.clone(),
                    outcome: ToolOutcomeKind::Success,
                    payload: serde_json::json!(5),
                }),
            ],
        );
        assert!(msg.tool_pairs_are_complete());
    }

    #[test]
    fn usage_counter_remaining_saturates_at_zero() {
        let counter = UsageCounter {
            count: 10,
            limit: 5,
            period_start: Utc::now(),
            period_reset_at: Utc::now(),
        };
        assert_eq!(counter.remaining(), 0);
    }
}
