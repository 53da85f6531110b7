//! # Conclave — Agent Orchestration and Tool Execution Engine
//!
//! The backend core for a multi-tenant conversational AI product: a
//! provider-agnostic streaming layer, a bounded agentic tool-use loop, a
//! tool registry and dispatcher, a multi-agent council deliberation
//! engine, and the quota gate and event bus that tie them to a request.
//!
//! ## Architecture
//!
//! - **model**: domain entities — users, conversations, messages, agents,
//!   tools, council sessions.
//! - **config**: immutable startup configuration — tier policy table,
//!   provider registry, tool deadlines.
//! - **error** / **retry**: the engine-wide error taxonomy and the
//!   exponential-backoff retry policy built on top of it.
//! - **provider**: the uniform streaming adapter trait, with one
//!   implementation per upstream wire format.
//! - **tools**: the tool catalog and its six-step execution contract.
//! - **orchestrator**: the bounded agentic loop for a single chat turn.
//! - **council**: multi-agent round-based deliberation with human
//!   interjection and convergence detection.
//! - **quota**: per-user reserve/commit/release counters against the
//!   tier policy table.
//! - **events**: SSE framing to the request owner plus topic-scoped
//!   broadcast to observers.
//! - **repository**: the conversation/branch persistence contract.
//! - **context**: token estimation and conversation-tail truncation.
//! - **http**: the axum adapter layer binding the above to HTTP/WebSocket.

pub mod config;
pub mod context;
pub mod council;
pub mod error;
pub mod events;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod repository;
pub mod retry;
pub mod tools;

pub use error::{Error, Result};

/// The most commonly used types for building a request handler around this
/// engine. Import with `use conclave::prelude::*;`.
pub mod prelude {
    pub use crate::config::{CapabilityBundle, EngineConfig, PolicyTable, ProviderEntry, ProviderFamily, ToolDeadlines};
    pub use crate::council::{ConvergenceRule, CouncilEngine};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, ObserverEvent, SseEvent, SseSink};
    pub use crate::model::{
        Agent, AgentId, CallId, Conversation, ConversationId, Message, MessageId, MessageRole, SessionId,
        Tier, ToolDescriptor, ToolId, User, UserId,
    };
    pub use crate::orchestrator::{Orchestrator, ProviderTable, TurnOutcome, TurnRequest, TurnStopReason};
    pub use crate::provider::{ProviderAdapter, ProviderRequest, StreamEvent};
    pub use crate::quota::QuotaGate;
    pub use crate::repository::Repository;
    pub use crate::tools::{ToolExecutor, ToolRegistry};
}
