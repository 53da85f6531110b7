//! Council Deliberation Engine (§4.4): round-based multi-agent
//! discussion built on top of the same Agent Orchestrator that drives a
//! single chat turn. Each agent's turn in a round *is* a turn — the
//! council only adds the round loop, the pause/resume/stop control
//! surface, the human "butt-in" mailbox, and convergence scoring.
//!
//! Grounded on the orchestrator's own bounded-loop shape, generalized
//! from one participant to an ordered list of them sharing one
//! transcript, and on the event bus's topic fan-out for broadcasting
//! per-agent streaming tokens to `council/{session_id}` observers.

use crate::events::{EventBus, ObserverEvent, SseEvent, SseSink};
use crate::model::{
    Agent, AgentId, ContentBlock, ConversationId, CouncilSession, Message, MessageRole, SessionMessage,
    SessionMessageRole, SessionState, TerminationReason, Tier,
};
use crate::orchestrator::{Orchestrator, TurnRequest};
use crate::provider::DecodingParams;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

/// A deterministic, stateless rule for scoring how converged a round's
/// agent messages are (§4.4): either a cue-phrase match over the round's
/// own text, or a score supplied by an embedding function the storage
/// layer owns.
#[derive(Clone)]
pub enum ConvergenceRule {
    /// Fraction of this round's agent messages containing at least one
    /// of `cues` (case-insensitive substring match).
    CueMatch { cues: Vec<String> },
    /// A similarity score computed externally (e.g. pairwise embedding
    /// similarity) and handed to the engine as a plain function.
    ExternalScore(Arc<dyn Fn(&[String]) -> f64 + Send + Sync>),
}

impl ConvergenceRule {
    fn score(&self, round_messages: &[String]) -> f64 {
        match self {
            ConvergenceRule::CueMatch { cues } => {
                if round_messages.is_empty() {
                    return 0.0;
                }
                let hits = round_messages
                    .iter()
                    .filter(|text| {
                        let lower = text.to_lowercase();
                        cues.iter().any(|cue| lower.contains(&cue.to_lowercase()))
                    })
                    .count();
                hits as f64 / round_messages.len() as f64
            }
            ConvergenceRule::ExternalScore(score_fn) => score_fn(round_messages),
        }
    }
}

/// Per-request parameters shared by every agent turn in a session — the
/// things a single chat turn would otherwise take from the HTTP request.
#[derive(Clone)]
pub struct SessionTurnParams {
    pub provider_id: String,
    pub tier: Tier,
    pub decoding: DecodingParams,
    /// Whether participating agents are offered tools during deliberation
    /// (§6 council `tools` flag).
    pub tools_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused,
    Stopped,
}

struct SessionHandle {
    control: watch::Sender<ControlState>,
    mailbox: AsyncMutex<VecDeque<String>>,
    cancellation: CancellationToken,
}

/// Drives council sessions' round loop on top of the orchestrator
/// (§4.4). One engine instance is shared across all sessions; per-session
/// state lives only for the lifetime of [`CouncilEngine::run_session`].
pub struct CouncilEngine {
    orchestrator: Arc<Orchestrator>,
    events: Arc<EventBus>,
    convergence_threshold: f64,
    handles: parking_lot::Mutex<HashMap<crate::model::SessionId, Arc<SessionHandle>>>,
}

impl CouncilEngine {
    pub fn new(orchestrator: Arc<Orchestrator>, events: Arc<EventBus>, convergence_threshold: f64) -> Self {
        Self {
            orchestrator,
            events,
            convergence_threshold,
            handles: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// `pause` (§6): the in-flight agent turn, if any, is left to finish;
    /// the session blocks before the *next* agent's turn. Returns `false`
    /// if the session isn't running.
    pub fn pause(&self, session_id: crate::model::SessionId) -> bool {
        self.send_control(session_id, ControlState::Paused)
    }

    pub fn resume(&self, session_id: crate::model::SessionId) -> bool {
        self.send_control(session_id, ControlState::Running)
    }

    /// `stop` (§6): ends the session at the next opportunity and cancels
    /// the in-flight agent turn, if any.
    pub fn stop(&self, session_id: crate::model::SessionId) -> bool {
        let found = self.send_control(session_id, ControlState::Stopped);
        if let Some(handle) = self.handles.lock().get(&session_id).cloned() {
            handle.cancellation.cancel();
        }
        found
    }

    fn send_control(&self, session_id: crate::model::SessionId, state: ControlState) -> bool {
        match self.handles.lock().get(&session_id) {
            Some(handle) => {
                let _ = handle.control.send(state);
                true
            }
            None => false,
        }
    }

    /// `butt_in` (§6): queues a human message to be spliced into the
    /// transcript before the next agent's turn. Returns `false` if the
    /// session isn't running.
    pub async fn butt_in(&self, session_id: crate::model::SessionId, text: String) -> bool {
        let Some(handle) = self.handles.lock().get(&session_id).cloned() else {
            return false;
        };
        handle.mailbox.lock().await.push_back(text);
        true
    }

    /// Runs a session to completion: `pending → running → (paused ⇄
    /// running) → (stopped | completed)` (§4.4). Registers a control
    /// handle for the duration of the run so that `pause`/`resume`/
    /// `stop`/`butt_in` can reach it, and broadcasts every agent's tokens
    /// and tool activity, plus round-level consensus/end events, on
    /// `council/{session_id}`.
    pub async fn run_session(
        &self,
        mut session: CouncilSession,
        agents: &HashMap<AgentId, Arc<Agent>>,
        convergence: ConvergenceRule,
        params: SessionTurnParams,
    ) -> CouncilSession {
        let handle = Arc::new(SessionHandle {
            control: watch::channel(ControlState::Running).0,
            mailbox: AsyncMutex::new(VecDeque::new()),
            cancellation: CancellationToken::new(),
        });
        self.handles.lock().insert(session.id, handle.clone());

        session.state = SessionState::Running;
        let topic = EventBus::council_topic(session.id);
        let conversation_id = ConversationId::new();

        'rounds: while session.current_round < session.max_rounds {
            session.current_round += 1;
            let mut round_texts = Vec::new();

            for agent_id in session.participants.clone() {
                self.drain_mailbox(&handle, &mut session, &topic).await;

                if handle.cancellation.is_cancelled() {
                    session.state = SessionState::Stopped;
                    session.termination_reason = Some(TerminationReason::Cancelled);
                    break 'rounds;
                }

                loop {
                    match *handle.control.borrow() {
                        ControlState::Stopped => {
                            session.state = SessionState::Stopped;
                            session.termination_reason = Some(TerminationReason::Stopped);
                            break 'rounds;
                        }
                        ControlState::Running => break,
                        ControlState::Paused => {}
                    }
                    session.state = SessionState::Paused;
                    let mut control = handle.control.subscribe();
                    if control.changed().await.is_err() {
                        session.state = SessionState::Stopped;
                        session.termination_reason = Some(TerminationReason::Stopped);
                        break 'rounds;
                    }
                }
                session.state = SessionState::Running;

                let Some(agent) = agents.get(&agent_id) else {
                    continue;
                };

                let history = transcript_to_messages(&session.transcript, conversation_id);
                let new_message = Message::new(
                    conversation_id,
                    MessageRole::System,
                    vec![ContentBlock::text("It is your turn to contribute to the discussion.")],
                );
                let model_id = session.model_override.clone().unwrap_or_else(|| agent.default_model.clone());

                let (sink, mut rx) = SseSink::channel(64);
                let forward_events = self.events.clone();
                let forward_topic = topic.clone();
                let forward_agent_id = agent_id;
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        match event {
                            SseEvent::Token { text } => forward_events.publish(
                                &forward_topic,
                                ObserverEvent::AgentToken {
                                    agent_id: forward_agent_id.to_string(),
                                    text,
                                },
                            ),
                            SseEvent::ToolStart { call_id, .. } => forward_events.publish(
                                &forward_topic,
                                ObserverEvent::AgentToolStart {
                                    agent_id: forward_agent_id.to_string(),
                                    call_id,
                                },
                            ),
                            SseEvent::ToolComplete { call_id, .. } => forward_events.publish(
                                &forward_topic,
                                ObserverEvent::AgentToolComplete {
                                    agent_id: forward_agent_id.to_string(),
                                    call_id,
                                },
                            ),
                            _ => {}
                        }
                    }
                });

                let turn_request = TurnRequest {
                    user_id: session.owner,
                    conversation_id,
                    agent: agent.clone(),
                    tier: params.tier,
                    provider_id: params.provider_id.clone(),
                    model_id,
                    system_prompt: agent.system_prompt_template.clone(),
                    decoding: params.decoding.clone(),
                    history,
                    new_message,
                    sink,
                    cancellation: handle.cancellation.child_token(),
                    tools_enabled: params.tools_enabled,
                };

                let outcome = self.orchestrator.run_turn(turn_request).await;
                let _ = forwarder.await;

                let Some(assistant_message) = outcome.assistant_message else {
                    session.state = SessionState::Stopped;
                    session.termination_reason = Some(TerminationReason::Cancelled);
                    break 'rounds;
                };

                let text = extract_text(&assistant_message.content);
                session.transcript.push(SessionMessage {
                    role: SessionMessageRole::Agent,
                    agent_id: Some(agent_id),
                    text: text.clone(),
                    created_at: Utc::now(),
                });
                round_texts.push(text);

                self.events.publish(
                    &topic,
                    ObserverEvent::AgentComplete {
                        agent_id: agent_id.to_string(),
                        input_tokens: outcome.usage.input_tokens,
                        output_tokens: outcome.usage.output_tokens,
                    },
                );
            }

            let score = convergence.score(&round_texts);
            if score >= self.convergence_threshold {
                session.state = SessionState::Completed;
                session.termination_reason = Some(TerminationReason::Consensus);
                self.events.publish(&topic, ObserverEvent::Consensus { score });
                self.events.publish(&topic, ObserverEvent::End { reason: "consensus".into() });
                break;
            }
        }

        if session.state == SessionState::Running {
            session.state = SessionState::Completed;
            session.termination_reason = Some(TerminationReason::RoundCapReached);
            self.events.publish(&topic, ObserverEvent::End { reason: "round_cap_reached".into() });
        } else if session.state == SessionState::Stopped {
            self.events.publish(&topic, ObserverEvent::End { reason: "stopped".into() });
        }

        self.handles.lock().remove(&session.id);
        session
    }

    async fn drain_mailbox(&self, handle: &SessionHandle, session: &mut CouncilSession, topic: &str) {
        let mut mailbox = handle.mailbox.lock().await;
        while let Some(text) = mailbox.pop_front() {
            session.transcript.push(SessionMessage {
                role: SessionMessageRole::HumanInterject,
                agent_id: None,
                text: text.clone(),
                created_at: Utc::now(),
            });
            self.events.publish(topic, ObserverEvent::HumanInterject { text });
        }
    }
}

fn transcript_to_messages(transcript: &[SessionMessage], conversation_id: ConversationId) -> Vec<Message> {
    transcript
        .iter()
        .map(|entry| {
            let role = match entry.role {
                SessionMessageRole::Agent => MessageRole::Assistant,
                SessionMessageRole::HumanInterject => MessageRole::User,
            };
            let mut message = Message::new(conversation_id, role, vec![ContentBlock::text(entry.text.clone())]);
            message.agent_id = entry.agent_id;
            message.created_at = entry.created_at;
            message
        })
        .collect()
}

fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text_block) => Some(text_block.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapabilityBundle, EngineConfig, PolicyTable, ProviderEntry, ProviderFamily};
    use crate::model::{AgentMode, UserId};
    use crate::orchestrator::ProviderTable;
    use crate::provider::{ProviderAdapter, ProviderRequest, StreamEvent};
    use crate::tools::{ToolExecutor, ToolRegistry};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::time::Duration;

    struct EchoAdapter {
        reply: String,
    }

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        async fn stream(&self, _request: ProviderRequest) -> crate::Result<BoxStream<'static, StreamEvent>> {
            let reply = self.reply.clone();
            let events = vec![
                StreamEvent::TextDelta(reply),
                StreamEvent::Done {
                    stop_reason: "stop".to_string(),
                },
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    fn test_agent(name: &str) -> Arc<Agent> {
        Arc::new(Agent {
            id: AgentId::new(),
            name: name.to_string(),
            system_prompt_template: format!("You are {name}."),
            allowed_tools: Vec::new(),
            default_model: "model-x".into(),
            mode: AgentMode::Standard,
        })
    }

    fn test_engine(reply: &str) -> (CouncilEngine, Arc<EventBus>) {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(EchoAdapter { reply: reply.to_string() });
        let mut providers: ProviderTable = HashMap::new();
        providers.insert("test-provider".into(), adapter);

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::builder().build());
        let executor = Arc::new(ToolExecutor::new(registry.clone(), Default::default(), events.clone()));

        let mut bundles = HashMap::new();
        bundles.insert(
            Tier::Trial,
            CapabilityBundle {
                max_messages_per_period: 1_000,
                max_model_family_messages: HashMap::new(),
                allowed_models: vec!["model-x".into()],
                tools_enabled: true,
                max_context_window_tokens: 8_000,
                council_enabled: true,
                music_enabled: false,
                jam_enabled: false,
                training_enabled: false,
                developer_mode_enabled: false,
            },
        );
        let config = EngineConfig::builder()
            .policy_table(PolicyTable::new(bundles))
            .provider(ProviderEntry {
                provider_id: "test-provider".into(),
                family: ProviderFamily::NativeBlock,
                base_url: "https://example.invalid".into(),
            })
            .build()
            .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(providers), registry, executor, &config));
        (CouncilEngine::new(orchestrator, events.clone(), 0.8), events)
    }

    fn turn_params() -> SessionTurnParams {
        SessionTurnParams {
            provider_id: "test-provider".into(),
            tier: Tier::Trial,
            decoding: DecodingParams::default(),
            tools_enabled: true,
        }
    }

    #[tokio::test]
    async fn consensus_ends_the_session_before_the_round_cap() {
        let (engine, _events) = test_engine("I agree, we have reached consensus.");
        let alice = test_agent("alice");
        let bob = test_agent("bob");
        let mut agents = HashMap::new();
        agents.insert(alice.id, alice.clone());
        agents.insert(bob.id, bob.clone());

        let session = CouncilSession::new(UserId::new(), "topic", vec![alice.id, bob.id], 5);
        let convergence = ConvergenceRule::CueMatch {
            cues: vec!["consensus".into()],
        };

        let finished = engine.run_session(session, &agents, convergence, turn_params()).await;
        assert_eq!(finished.state, SessionState::Completed);
        assert_eq!(finished.termination_reason, Some(TerminationReason::Consensus));
        assert_eq!(finished.current_round, 1);
    }

    #[tokio::test]
    async fn round_cap_terminates_without_consensus() {
        let (engine, _events) = test_engine("still thinking");
        let alice = test_agent("alice");
        let mut agents = HashMap::new();
        agents.insert(alice.id, alice.clone());

        let session = CouncilSession::new(UserId::new(), "topic", vec![alice.id], 2);
        let convergence = ConvergenceRule::CueMatch {
            cues: vec!["consensus".into()],
        };

        let finished = engine.run_session(session, &agents, convergence, turn_params()).await;
        assert_eq!(finished.state, SessionState::Completed);
        assert_eq!(finished.termination_reason, Some(TerminationReason::RoundCapReached));
        assert_eq!(finished.current_round, 2);
    }

    #[tokio::test]
    async fn butt_in_splices_a_human_message_into_the_transcript() {
        let (engine, events) = test_engine("still thinking");
        let alice = test_agent("alice");
        let mut agents = HashMap::new();
        agents.insert(alice.id, alice.clone());

        let session = CouncilSession::new(UserId::new(), "topic", vec![alice.id], 1);
        let session_id = session.id;
        let mut observer = events.subscribe(&EventBus::council_topic(session_id));

        let engine = Arc::new(engine);
        let run_engine = engine.clone();
        let convergence = ConvergenceRule::CueMatch { cues: vec!["never-matches".into()] };
        let handle = tokio::spawn(async move {
            run_engine.run_session(session, &agents, convergence, turn_params()).await
        });

        // Give the session a moment to register its control handle before butting in.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.butt_in(session_id, "consider the edge cases".to_string()).await);

        let finished = handle.await.unwrap();
        assert!(finished
            .transcript
            .iter()
            .any(|m| m.role == SessionMessageRole::HumanInterject && m.text == "consider the edge cases"));
        assert!(matches!(
            EventBus::next_for_subscriber(&mut observer).await,
            Some(ObserverEvent::HumanInterject { .. })
        ));
    }

    #[tokio::test]
    async fn pause_blocks_progress_until_resumed() {
        let (engine, _events) = test_engine("still thinking");
        let alice = test_agent("alice");
        let bob = test_agent("bob");
        let mut agents = HashMap::new();
        agents.insert(alice.id, alice.clone());
        agents.insert(bob.id, bob.clone());

        let session = CouncilSession::new(UserId::new(), "topic", vec![alice.id, bob.id], 1);
        let session_id = session.id;

        let engine = Arc::new(engine);
        let run_engine = engine.clone();
        let convergence = ConvergenceRule::CueMatch { cues: vec!["never-matches".into()] };
        let handle = tokio::spawn(async move {
            run_engine.run_session(session, &agents, convergence, turn_params()).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(engine.pause(session_id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.resume(session_id));

        let finished = handle.await.unwrap();
        assert_eq!(finished.state, SessionState::Completed);
        assert_eq!(finished.termination_reason, Some(TerminationReason::RoundCapReached));
    }

    #[tokio::test]
    async fn stop_ends_the_session_without_consensus() {
        let (engine, _events) = test_engine("still thinking");
        let alice = test_agent("alice");
        let mut agents = HashMap::new();
        agents.insert(alice.id, alice.clone());

        let session = CouncilSession::new(UserId::new(), "topic", vec![alice.id], 5);
        let session_id = session.id;

        let engine = Arc::new(engine);
        let run_engine = engine.clone();
        let convergence = ConvergenceRule::CueMatch { cues: vec!["never-matches".into()] };
        let handle = tokio::spawn(async move {
            run_engine.run_session(session, &agents, convergence, turn_params()).await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(engine.stop(session_id));
        let finished = handle.await.unwrap();
        assert_eq!(finished.state, SessionState::Stopped);
        assert!(matches!(
            finished.termination_reason,
            Some(TerminationReason::Stopped) | Some(TerminationReason::Cancelled)
        ));
    }
}
