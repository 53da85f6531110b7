//! Tool Registry & Executor (§4.2): an immutable-after-startup catalog of
//! callable tools, plus the execution contract that validates arguments,
//! gates on confirmation and concurrency, and enforces a hard deadline.
//!
//! Generalized from the SDK's flat `Vec<Arc<Tool>>` + `ToolHandler` pair
//! into an indexed catalog with a tier/agent selection filter
//! ([`registry`]) and a separate dispatch pipeline ([`executor`]) that the
//! orchestrator calls once per tool-use block in a batch.

pub mod executor;
pub mod registry;

pub use executor::{ApprovalGate, ToolCallRequest, ToolExecutionRecord, ToolExecutor};
pub use registry::{RegisteredTool, ToolHandler, ToolHandlerContext, ToolRegistry, ToolRegistryBuilder};
