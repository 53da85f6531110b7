//! Static engine configuration: the tier → capability policy table, the
//! provider registry, and tool deadlines, all loaded once at process start
//! into an immutable snapshot (§4.5, §9 "global mutable configuration").
//!
//! Tests build alternate `EngineConfig` snapshots directly rather than
//! touching environment variables or a global singleton.

use crate::model::Tier;
use crate::Error;
use std::collections::HashMap;
use std::time::Duration;

/// Which adapter family a provider belongs to (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// Multi-block content with native tool-use.
    NativeBlock,
    /// Flat messages array, `tools` field, streaming tool-call deltas.
    OpenAiStyle,
}

/// Registration of one upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub family: ProviderFamily,
    pub base_url: String,
}

/// A tier's capability bundle: what it may do and how much of it.
#[derive(Debug, Clone)]
pub struct CapabilityBundle {
    pub max_messages_per_period: u64,
    pub max_model_family_messages: HashMap<String, u64>,
    pub allowed_models: Vec<String>,
    pub tools_enabled: bool,
    pub max_context_window_tokens: usize,
    pub council_enabled: bool,
    pub music_enabled: bool,
    pub jam_enabled: bool,
    pub training_enabled: bool,
    pub developer_mode_enabled: bool,
}

impl CapabilityBundle {
    pub fn allows_model(&self, model_id: &str) -> bool {
        self.allowed_models.iter().any(|m| m == model_id)
    }
}

/// Tier → capability bundle, loaded once at startup (§4.5).
#[derive(Debug, Clone)]
pub struct PolicyTable {
    bundles: HashMap<Tier, CapabilityBundle>,
}

impl PolicyTable {
    pub fn new(bundles: HashMap<Tier, CapabilityBundle>) -> Self {
        Self { bundles }
    }

    pub fn bundle_for(&self, tier: Tier) -> Option<&CapabilityBundle> {
        self.bundles.get(&tier)
    }
}

/// Per-tool deadline and concurrency defaults, overridable per tool id.
#[derive(Debug, Clone)]
pub struct ToolDeadlines {
    pub default_timeout: Duration,
    pub overrides: HashMap<String, Duration>,
    pub default_max_concurrency_per_user: u32,
    pub confirmation_max_concurrency_per_user: u32,
    pub approval_window: Duration,
}

impl Default for ToolDeadlines {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            overrides: HashMap::new(),
            default_max_concurrency_per_user: 3,
            confirmation_max_concurrency_per_user: 1,
            approval_window: Duration::from_secs(60),
        }
    }
}

impl ToolDeadlines {
    pub fn timeout_for(&self, tool_id: &str) -> Duration {
        self.overrides
            .get(tool_id)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// The immutable, process-wide engine configuration snapshot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy_table: PolicyTable,
    pub providers: HashMap<String, ProviderEntry>,
    pub tool_deadlines: ToolDeadlines,
    pub loop_bound: u32,
    pub provider_retry_attempts: u32,
    pub provider_stream_inactivity_timeout: Duration,
    pub convergence_threshold: f64,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for `EngineConfig`, validating on `build()` in the same spirit
/// as the SDK's `AgentOptionsBuilder`.
#[derive(Default)]
pub struct EngineConfigBuilder {
    policy_table: Option<PolicyTable>,
    providers: HashMap<String, ProviderEntry>,
    tool_deadlines: ToolDeadlines,
    loop_bound: Option<u32>,
    provider_retry_attempts: Option<u32>,
    provider_stream_inactivity_timeout: Option<Duration>,
    convergence_threshold: Option<f64>,
}

impl EngineConfigBuilder {
    pub fn policy_table(mut self, table: PolicyTable) -> Self {
        self.policy_table = Some(table);
        self
    }

    pub fn provider(mut self, entry: ProviderEntry) -> Self {
        self.providers.insert(entry.provider_id.clone(), entry);
        self
    }

    pub fn tool_deadlines(mut self, deadlines: ToolDeadlines) -> Self {
        self.tool_deadlines = deadlines;
        self
    }

    pub fn loop_bound(mut self, bound: u32) -> Self {
        self.loop_bound = Some(bound);
        self
    }

    pub fn provider_retry_attempts(mut self, attempts: u32) -> Self {
        self.provider_retry_attempts = Some(attempts);
        self
    }

    pub fn provider_stream_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.provider_stream_inactivity_timeout = Some(timeout);
        self
    }

    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> crate::Result<EngineConfig> {
        let policy_table = self
            .policy_table
            .ok_or_else(|| Error::config("policy_table is required"))?;

        if self.providers.is_empty() {
            return Err(Error::config("at least one provider must be registered"));
        }

        let threshold = self.convergence_threshold.unwrap_or(0.8);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::config("convergence_threshold must be in [0.0, 1.0]"));
        }

        Ok(EngineConfig {
            policy_table,
            providers: self.providers,
            tool_deadlines: self.tool_deadlines,
            loop_bound: self.loop_bound.unwrap_or(5),
            provider_retry_attempts: self.provider_retry_attempts.unwrap_or(2),
            provider_stream_inactivity_timeout: self
                .provider_stream_inactivity_timeout
                .unwrap_or(Duration::from_secs(60)),
            convergence_threshold: threshold,
        })
    }
}
