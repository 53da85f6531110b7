//! The tool catalog: a `ToolId -> RegisteredTool` map built once at startup
//! and never mutated afterward, plus the tier/agent selection filter that
//! narrows it down to what one turn's provider request may call (§4.2
//! "Selection").

use crate::model::{Agent, AgentId, ConversationId, Tier, ToolDescriptor, ToolId, UserId};
use crate::provider::ToolSpec;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler needs about the call site besides the arguments
/// themselves, mirroring the SDK's rationale for boxing handlers: the
/// registry stores handlers of different concrete closures behind one
/// `Arc<dyn Fn>`, so the call-site context has to travel as a plain value
/// rather than captured generically.
#[derive(Debug, Clone)]
pub struct ToolHandlerContext {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub cancellation: CancellationToken,
}

/// A tool's executable logic. `Arc` so the same handler can be shared by
/// the registry and any in-flight invocation; `Pin<Box<dyn Future>>`
/// because handlers are arbitrary async closures with distinct concrete
/// future types that must be type-erased to live in one map.
pub type ToolHandler = Arc<
    dyn Fn(Value, ToolHandlerContext) -> Pin<Box<dyn Future<Output = crate::Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// One catalog entry: static metadata plus the handler that runs it.
#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub handler: ToolHandler,
}

/// The immutable-after-startup tool catalog.
pub struct ToolRegistry {
    tools: HashMap<ToolId, RegisteredTool>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, id: &ToolId) -> Option<&RegisteredTool> {
        self.tools.get(id)
    }

    pub fn descriptor(&self, id: &ToolId) -> Option<&ToolDescriptor> {
        self.tools.get(id).map(|t| &t.descriptor)
    }

    /// The subset of the catalog a given tier and agent may call this
    /// turn, rendered as the normalized [`ToolSpec`] the provider layer
    /// expects. Order follows catalog insertion order, not tier or name,
    /// so repeated calls produce a stable tool list for a fixed agent.
    pub fn select_for(&self, tier: Tier, agent: &Agent) -> Vec<ToolSpec> {
        agent
            .allowed_tools
            .iter()
            .filter_map(|id| self.tools.get(id))
            .filter(|t| t.descriptor.minimum_tier <= tier)
            .map(|t| ToolSpec {
                name: t.descriptor.name.clone(),
                description: t.descriptor.description.clone(),
                input_schema: t.descriptor.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<ToolId, RegisteredTool>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, descriptor: ToolDescriptor, handler: ToolHandler) -> Self {
        let id = descriptor.id.clone();
        self.tools.insert(id, RegisteredTool { descriptor, handler });
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentMode, ToolCapabilities};

    fn descriptor(id: &str, minimum_tier: Tier) -> ToolDescriptor {
        ToolDescriptor {
            id: ToolId::from(id),
            name: id.to_string(),
            category: "test".into(),
            description: "a test tool".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            capabilities: ToolCapabilities::default(),
            minimum_tier,
        }
    }

    fn noop_handler() -> ToolHandler {
        Arc::new(|_args, _ctx| Box::pin(async { Ok(serde_json::json!({})) }))
    }

    fn agent_allowing(tools: Vec<&str>) -> Agent {
        Agent {
            id: AgentId::new(),
            name: "tester".into(),
            system_prompt_template: String::new(),
            allowed_tools: tools.into_iter().map(ToolId::from).collect(),
            default_model: "model-x".into(),
            mode: AgentMode::Standard,
        }
    }

    #[test]
    fn select_for_excludes_tools_below_tier() {
        let registry = ToolRegistry::builder()
            .register(descriptor("calculator", Tier::Trial), noop_handler())
            .register(descriptor("vault_write", Tier::Opus), noop_handler())
            .build();
        let agent = agent_allowing(vec!["calculator", "vault_write"]);

        let specs = registry.select_for(Tier::Trial, &agent);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "calculator");
    }

    #[test]
    fn select_for_excludes_tools_not_allowed_for_agent() {
        let registry = ToolRegistry::builder()
            .register(descriptor("calculator", Tier::Trial), noop_handler())
            .register(descriptor("search", Tier::Trial), noop_handler())
            .build();
        let agent = agent_allowing(vec!["calculator"]);

        let specs = registry.select_for(Tier::Azothic, &agent);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "calculator");
    }

    #[test]
    fn unknown_tool_lookup_returns_none() {
        let registry = ToolRegistry::builder().build();
        assert!(registry.get(&ToolId::from("ghost")).is_none());
    }
}
