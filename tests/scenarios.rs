//! End-to-end scenarios for the orchestration engine: one provider
//! adapter and one in-memory repository driven through the public
//! surface exactly as `http.rs` would, without any HTTP plumbing.

use async_trait::async_trait;
use conclave::prelude::*;
use conclave::council::{ConvergenceRule, CouncilEngine, SessionTurnParams};
use conclave::model::{
    Agent, AgentId, AgentMode, ConversationId, CounterKind, ToolCapabilities, ToolDescriptor, ToolId,
};
use conclave::provider::{ProviderRequest, StreamEvent};
use conclave::quota::QuotaGate;
use conclave::repository::{InMemoryRepository, Repository};
use conclave::tools::{ToolExecutor, ToolRegistry};
use futures::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Plays back a fixed sequence of rounds, one `Vec<StreamEvent>` consumed
/// per `stream()` call — the same test double shape `orchestrator.rs`
/// uses internally, reused here for black-box scenarios.
struct ScriptedAdapter {
    rounds: StdMutex<Vec<Vec<StreamEvent>>>,
}

impl ScriptedAdapter {
    fn new(rounds: Vec<Vec<StreamEvent>>) -> Arc<dyn ProviderAdapter> {
        Arc::new(Self { rounds: StdMutex::new(rounds) })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn stream(&self, _request: ProviderRequest) -> conclave::Result<BoxStream<'static, StreamEvent>> {
        let mut rounds = self.rounds.lock().unwrap();
        let events = if rounds.is_empty() { Vec::new() } else { rounds.remove(0) };
        Ok(Box::pin(stream::iter(events)))
    }
}

fn bundle(max_messages: u64) -> CapabilityBundle {
    CapabilityBundle {
        max_messages_per_period: max_messages,
        max_model_family_messages: HashMap::new(),
        allowed_models: vec!["model-x".into()],
        tools_enabled: true,
        max_context_window_tokens: 32_000,
        council_enabled: true,
        music_enabled: false,
        jam_enabled: false,
        training_enabled: false,
        developer_mode_enabled: false,
    }
}

fn policy(max_messages: u64) -> Arc<PolicyTable> {
    let mut bundles = HashMap::new();
    bundles.insert(Tier::Trial, bundle(max_messages));
    Arc::new(PolicyTable::new(bundles))
}

fn engine_config() -> EngineConfig {
    EngineConfig::builder()
        .policy_table(PolicyTable::new({
            let mut b = HashMap::new();
            b.insert(Tier::Trial, bundle(100));
            b
        }))
        .provider(ProviderEntry {
            provider_id: "house".into(),
            family: ProviderFamily::OpenAiStyle,
            base_url: "https://example.com".into(),
        })
        .build()
        .unwrap()
}

fn agent_with_tools(tools: Vec<&str>) -> Arc<Agent> {
    Arc::new(Agent {
        id: AgentId::new(),
        name: "assistant".into(),
        system_prompt_template: String::new(),
        allowed_tools: tools.into_iter().map(ToolId::from).collect(),
        default_model: "model-x".into(),
        mode: AgentMode::Standard,
    })
}

fn tool_descriptor(name: &str) -> ToolDescriptor {
    ToolDescriptor {
        id: ToolId::from(name),
        name: name.into(),
        category: "test".into(),
        description: format!("{name} tool"),
        input_schema: serde_json::json!({"type": "object"}),
        capabilities: ToolCapabilities::default(),
        minimum_tier: Tier::Trial,
    }
}

fn orchestrator_with(
    adapter: Arc<dyn ProviderAdapter>,
    registry: ToolRegistry,
) -> Orchestrator {
    let mut providers = ProviderTable::new();
    providers.insert("house".into(), adapter);
    let registry = Arc::new(registry);
    let executor = Arc::new(ToolExecutor::new(registry.clone(), ToolDeadlines::default(), Arc::new(EventBus::new())));
    Orchestrator::new(Arc::new(providers), registry, executor, &engine_config())
}

fn turn_request(conversation_id: ConversationId, agent: Arc<Agent>, text: &str, sink: SseSink) -> TurnRequest {
    TurnRequest {
        user_id: UserId::new(),
        conversation_id,
        agent,
        tier: Tier::Trial,
        provider_id: "house".into(),
        model_id: "model-x".into(),
        system_prompt: String::new(),
        decoding: Default::default(),
        history: Vec::new(),
        new_message: Message::user(conversation_id, text),
        sink,
        cancellation: CancellationToken::new(),
        tools_enabled: true,
    }
}

// Scenario A — single tool round trip: two tools dispatch in the same
// round, their results feed a second provider turn that produces the
// final text.
#[tokio::test]
async fn scenario_a_single_tool_round_trip() {
    let adapter = ScriptedAdapter::new(vec![
        vec![
            StreamEvent::TextDelta("Let me check.".into()),
            StreamEvent::ToolUseStart { call_id: "c1".into(), tool_name: "calculator".into() },
            StreamEvent::ToolUseEnd { call_id: "c1".into(), parsed_arguments: serde_json::json!({"expr": "2+3"}) },
            StreamEvent::ToolUseStart { call_id: "c2".into(), tool_name: "get_current_time".into() },
            StreamEvent::ToolUseEnd { call_id: "c2".into(), parsed_arguments: serde_json::json!({}) },
            StreamEvent::Done { stop_reason: "tool_calls".into() },
        ],
        vec![
            StreamEvent::TextDelta("2+3=5; the time is T.".into()),
            StreamEvent::Done { stop_reason: "stop".into() },
        ],
    ]);

    let registry = ToolRegistry::builder()
        .register(
            tool_descriptor("calculator"),
            Arc::new(|_args, _ctx| Box::pin(async move { Ok(serde_json::json!(5)) })),
        )
        .register(
            tool_descriptor("get_current_time"),
            Arc::new(|_args, _ctx| Box::pin(async move { Ok(serde_json::json!("T")) })),
        )
        .build();

    let orchestrator = orchestrator_with(adapter, registry);
    let agent = agent_with_tools(vec!["calculator", "get_current_time"]);
    let conversation_id = ConversationId::new();
    let (sink, mut rx) = SseSink::channel(64);

    let outcome = orchestrator
        .run_turn(turn_request(conversation_id, agent, "What is 2+3 and the current time?", sink))
        .await;

    let assistant = outcome.assistant_message.expect("one assistant message persisted");
    let tool_use_count = assistant.tool_uses().count();
    assert_eq!(tool_use_count, 2);
    assert!(matches!(outcome.stop_reason, TurnStopReason::Natural(_)));

    let mut tool_starts = 0;
    let mut tool_completes = 0;
    let mut saw_done = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SseEvent::ToolStart { .. } => tool_starts += 1,
            SseEvent::ToolComplete { .. } => tool_completes += 1,
            SseEvent::Done { .. } => saw_done = true,
            _ => {}
        }
    }
    assert_eq!(tool_starts, 2);
    assert_eq!(tool_completes, 2);
    assert!(saw_done);
}

// Scenario B — over-quota on pre-flight: reserve fails before any
// provider call, leaving the counter untouched.
#[tokio::test]
async fn scenario_b_over_quota_blocks_before_any_provider_call() {
    let gate = QuotaGate::new(policy(0));
    let user = UserId::new();

    let result = gate.reserve(user, Tier::Trial, CounterKind::MessagesTotal, 1).await;
    assert!(matches!(result, Err(Error::OverQuota { counter, .. }) if counter == "messages_total"));

    // A second attempt observes the exact same failure — nothing was
    // incremented by the rejected reservation.
    let result2 = gate.reserve(user, Tier::Trial, CounterKind::MessagesTotal, 1).await;
    assert!(matches!(result2, Err(Error::OverQuota { .. })));
}

// Scenario C — tool timeout is recoverable: the handler sleeps past the
// deadline, the executor records a timeout, and the orchestrator still
// completes the turn using that outcome as the tool result.
#[tokio::test]
async fn scenario_c_tool_timeout_is_recoverable() {
    let adapter = ScriptedAdapter::new(vec![
        vec![
            StreamEvent::ToolUseStart { call_id: "c1".into(), tool_name: "slow_tool".into() },
            StreamEvent::ToolUseEnd { call_id: "c1".into(), parsed_arguments: serde_json::json!({}) },
            StreamEvent::Done { stop_reason: "tool_calls".into() },
        ],
        vec![
            StreamEvent::TextDelta("The tool timed out, but here is what I can tell you.".into()),
            StreamEvent::Done { stop_reason: "stop".into() },
        ],
    ]);

    let registry = ToolRegistry::builder()
        .register(
            tool_descriptor("slow_tool"),
            Arc::new(|_args, _ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!("too late"))
                })
            }),
        )
        .build();

    let mut providers = ProviderTable::new();
    providers.insert("house".into(), adapter);
    let registry = Arc::new(registry);
    let mut deadlines = ToolDeadlines::default();
    deadlines.default_timeout = Duration::from_millis(20);
    let executor = Arc::new(ToolExecutor::new(registry.clone(), deadlines, Arc::new(EventBus::new())));
    let orchestrator = Orchestrator::new(Arc::new(providers), registry, executor, &engine_config());

    let agent = agent_with_tools(vec!["slow_tool"]);
    let conversation_id = ConversationId::new();
    let (sink, mut rx) = SseSink::channel(64);

    let outcome = orchestrator
        .run_turn(turn_request(conversation_id, agent, "run the slow tool", sink))
        .await;

    let assistant = outcome.assistant_message.expect("turn completes despite the timeout");
    assert!(matches!(outcome.stop_reason, TurnStopReason::Natural(_)));
    assert!(!assistant.content.is_empty());

    let mut saw_tool_error = false;
    while let Ok(event) = rx.try_recv() {
        if let SseEvent::ToolError { .. } = event {
            saw_tool_error = true;
        }
    }
    assert!(saw_tool_error);
}

// Scenario D — cancellation mid-stream: cancelling before the turn starts
// discards the would-be assistant message and still reaches `done`.
#[tokio::test]
async fn scenario_d_cancellation_discards_the_assistant_message() {
    let adapter = ScriptedAdapter::new(vec![vec![StreamEvent::TextDelta("should not be persisted".into())]]);
    let registry = ToolRegistry::builder().build();
    let orchestrator = orchestrator_with(adapter, registry);

    let agent = agent_with_tools(vec![]);
    let conversation_id = ConversationId::new();
    let (sink, mut rx) = SseSink::channel(64);
    let mut request = turn_request(conversation_id, agent, "hello", sink);
    request.cancellation.cancel();

    let outcome = orchestrator.run_turn(request).await;

    assert!(outcome.assistant_message.is_none());
    assert!(matches!(outcome.stop_reason, TurnStopReason::Cancelled));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.last(), Some(SseEvent::Done { .. })));
}

// Scenario F — convergence termination: every agent's round-4 message
// contains the consensus cue, so the session ends with `consensus`
// before the round cap is reached.
#[tokio::test]
async fn scenario_f_convergence_ends_the_session_with_consensus() {
    #[async_trait]
    impl ProviderAdapter for CueAdapter {
        async fn stream(&self, _request: ProviderRequest) -> conclave::Result<BoxStream<'static, StreamEvent>> {
            Ok(Box::pin(stream::iter(vec![
                StreamEvent::TextDelta("I agree, we have reached consensus.".into()),
                StreamEvent::Done { stop_reason: "stop".into() },
            ])))
        }
    }
    struct CueAdapter;

    let mut providers = ProviderTable::new();
    providers.insert("house".into(), Arc::new(CueAdapter) as Arc<dyn ProviderAdapter>);
    let registry = Arc::new(ToolRegistry::builder().build());
    let executor = Arc::new(ToolExecutor::new(registry.clone(), ToolDeadlines::default(), Arc::new(EventBus::new())));
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(providers), registry, executor, &engine_config()));
    let events = Arc::new(EventBus::new());
    let engine = CouncilEngine::new(orchestrator, events.clone(), 0.8);

    let mut agents = HashMap::new();
    let mut participant_ids = Vec::new();
    for _ in 0..4 {
        let agent = agent_with_tools(vec![]);
        participant_ids.push(agent.id);
        agents.insert(agent.id, agent);
    }

    let session = conclave::model::CouncilSession::new(UserId::new(), "should we ship it?", participant_ids, 10);
    let convergence = ConvergenceRule::CueMatch { cues: vec!["consensus".into()] };
    let params = SessionTurnParams {
        provider_id: "house".into(),
        tier: Tier::Trial,
        decoding: Default::default(),
        tools_enabled: true,
    };

    let finished = engine.run_session(session, &agents, convergence, params).await;

    assert_eq!(finished.state, conclave::model::SessionState::Completed);
    assert_eq!(finished.termination_reason, Some(conclave::model::TerminationReason::Consensus));
    assert!(finished.current_round <= 10);
}

// Round-trip law — fork-then-append produces the same prefix-plus-M'
// sequence that a fresh load-and-append would.
#[tokio::test]
async fn fork_then_append_matches_a_fresh_append() {
    let repo = InMemoryRepository::new();
    let conversation = conclave::model::Conversation::new(UserId::new());
    let conversation_id = conversation.id;
    repo.seed(conversation).await;

    let anchor = Message::user(conversation_id, "anchor");
    let anchor_id = anchor.id;
    repo.append_message(conversation_id, anchor).await.unwrap();

    let fork_id = repo.fork(conversation_id, anchor_id, "branch".into()).await.unwrap();
    let appended = Message::user(fork_id, "branch message");
    repo.append_message(fork_id, appended.clone()).await.unwrap();

    let fork_tail = repo.load_conversation_tail(fork_id, 32_000).await.unwrap();
    assert_eq!(fork_tail.len(), 2);
    assert_eq!(fork_tail[0].id, anchor_id);
    assert_eq!(fork_tail[1].id, appended.id);
}
