//! Thin axum adapter layer (§6): translates HTTP/WebSocket traffic into
//! calls against the engine core. No business logic lives here — every
//! handler authenticates, builds the matching engine request, and
//! streams the result back.
//!
//! Grounded on the pack's `swedishembedded-sven` WebSocket bridges
//! (`crates/sven-gateway/src/http/ws.rs`, `crates/sven-node/src/http/
//! ws.rs`): a `tokio::select!` loop between `socket.recv()` and a
//! broadcast subscription, forwarding JSON text frames each way.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::council::{ConvergenceRule, CouncilEngine, SessionTurnParams};
use crate::events::{frame_sse_event, EventBus, ObserverEvent, SseSink};
use crate::model::{Agent, AgentId, ConversationId, CounterKind, CouncilSession, Message, SessionId, Tier, UserId};
use crate::orchestrator::{Orchestrator, TurnRequest};
use crate::provider::DecodingParams;
use crate::quota::{Feature, QuotaGate};
use crate::repository::SharedRepository;
use crate::Error;

/// Resolves a bearer credential to the caller's identity and tier. Left
/// abstract so the engine never depends on a concrete auth store.
pub type AuthLookup = Arc<dyn Fn(&str) -> Option<(UserId, Tier)> + Send + Sync>;

/// Everything a handler needs, threaded through axum as shared state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub repository: SharedRepository,
    pub quota: Arc<QuotaGate>,
    pub events: Arc<EventBus>,
    pub council: Arc<CouncilEngine>,
    pub agents: Arc<HashMap<AgentId, Arc<Agent>>>,
    pub convergence: ConvergenceRule,
    pub default_provider_id: String,
    pub auth: AuthLookup,
}

/// `GET /chat`, `GET /council/ws`, `GET /observer/ws` (§6).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/council/ws", get(council_ws_handler))
        .route("/observer/ws", get(observer_ws_handler))
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// ── Chat streaming endpoint ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: ConversationId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub agent_id: AgentId,
    pub model_id: String,
    #[serde(default = "default_tools_enabled")]
    pub tools_enabled: bool,
    pub provider_override: Option<String>,
}

fn default_tools_enabled() -> bool {
    true
}

/// `POST /chat` (§6): starts one bounded agentic turn and streams its
/// `text/event-stream` body back immediately; the turn itself runs in a
/// spawned task so a client disconnect doesn't block the handler.
pub async fn chat_handler(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<ChatRequest>) -> Response {
    let Some(token) = extract_bearer(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some((user_id, tier)) = (state.auth)(token) else {
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    };

    if !state.quota.allowed_model(tier, &body.model_id) {
        return (StatusCode::FORBIDDEN, "model not available on this tier").into_response();
    }
    if body.tools_enabled && !state.quota.allowed_tools(tier) {
        return (StatusCode::FORBIDDEN, "tools not available on this tier").into_response();
    }

    let reservation = match state.quota.reserve(user_id, tier, CounterKind::MessagesTotal, 1).await {
        Ok(reservation) => reservation,
        Err(Error::OverQuota { .. }) => return (StatusCode::PAYMENT_REQUIRED, "message quota exhausted").into_response(),
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    };

    let Some(agent) = state.agents.get(&body.agent_id).cloned() else {
        state.quota.release(reservation).await;
        return (StatusCode::BAD_REQUEST, "unknown agent").into_response();
    };

    let history = match state
        .repository
        .load_conversation_tail(body.conversation_id, agent_context_budget(tier, &state))
        .await
    {
        Ok(history) => history,
        Err(err) => {
            state.quota.release(reservation).await;
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let new_message = Message::user(body.conversation_id, body.text.clone());
    if let Err(err) = state.repository.append_message(body.conversation_id, new_message.clone()).await {
        state.quota.release(reservation).await;
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }

    let (sink, rx) = SseSink::channel(64);
    let cancellation = CancellationToken::new();

    let disconnect_sink = sink.clone();
    let disconnect_token = cancellation.clone();
    tokio::spawn(async move {
        disconnect_sink.closed().await;
        disconnect_token.cancel();
    });

    let turn_request = TurnRequest {
        user_id,
        conversation_id: body.conversation_id,
        agent,
        tier,
        provider_id: body.provider_override.unwrap_or_else(|| state.default_provider_id.clone()),
        model_id: body.model_id,
        system_prompt: String::new(),
        decoding: DecodingParams::default(),
        history,
        new_message,
        sink,
        cancellation,
        tools_enabled: body.tools_enabled,
    };

    let orchestrator = state.orchestrator.clone();
    let repository = state.repository.clone();
    let quota = state.quota.clone();
    let conversation_id = body.conversation_id;
    tokio::spawn(async move {
        let outcome = orchestrator.run_turn(turn_request).await;
        if let Some(message) = outcome.assistant_message {
            let _ = repository.append_message(conversation_id, message).await;
        }
        for invocation in outcome.invocations {
            let _ = repository.record_tool_invocation(invocation).await;
        }
        let actual_cost = outcome.usage.input_tokens + outcome.usage.output_tokens;
        quota.commit(reservation, Some(actual_cost)).await;
    });

    let body_stream = ReceiverStream::new(rx).map(|event| Ok::<_, std::io::Error>(frame_sse_event(&event).unwrap_or_default()));

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(axum::body::Body::from_stream(body_stream))
        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build stream").into_response())
}

fn agent_context_budget(tier: Tier, state: &AppState) -> usize {
    state.quota.context_window_for(tier).unwrap_or(8_000)
}

// ── Council command WebSocket ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CouncilCommand {
    Start {
        topic: String,
        agents: Vec<AgentId>,
        max_rounds: u32,
        model: Option<String>,
        #[serde(default)]
        tools: bool,
    },
    Pause,
    Resume,
    Stop,
    ButtIn { text: String },
    Ping,
}

/// `GET /council/ws` (§6): the bearer credential travels as a query
/// param since browsers cannot set a header on the WebSocket handshake;
/// an invalid credential closes with `1008 policy-violation` rather than
/// refusing the upgrade.
pub async fn council_ws_handler(ws: WebSocketUpgrade, Query(query): Query<TokenQuery>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_council_socket(socket, state, query.token))
}

async fn handle_council_socket(mut socket: WebSocket, state: AppState, token: String) {
    let Some((user_id, tier)) = (state.auth)(&token) else {
        close_with_policy_violation(&mut socket, "invalid credential").await;
        return;
    };
    if !state.quota.allowed_feature(tier, Feature::Council) {
        close_with_policy_violation(&mut socket, "council not enabled for this tier").await;
        return;
    }

    let mut current_session: Option<SessionId> = None;
    let mut observer: Option<broadcast::Receiver<ObserverEvent>> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_council_command(&text, &mut socket, &state, user_id, tier, &mut current_session, &mut observer).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("council socket recv error: {err}");
                        break;
                    }
                }
            }
            event = next_observer_event(&mut observer) => {
                let Some(event) = event else { continue };
                if let Ok(json) = serde_json::to_string(&event) {
                    if socket.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn next_observer_event(observer: &mut Option<broadcast::Receiver<ObserverEvent>>) -> Option<ObserverEvent> {
    match observer {
        Some(rx) => EventBus::next_for_subscriber(rx).await,
        None => std::future::pending().await,
    }
}

async fn handle_council_command(
    text: &str,
    socket: &mut WebSocket,
    state: &AppState,
    user_id: UserId,
    tier: Tier,
    current_session: &mut Option<SessionId>,
    observer: &mut Option<broadcast::Receiver<ObserverEvent>>,
) {
    let command = match serde_json::from_str::<CouncilCommand>(text) {
        Ok(command) => command,
        Err(err) => {
            log::warn!("invalid council command: {err}");
            return;
        }
    };

    match command {
        CouncilCommand::Start { topic, agents, max_rounds, model, tools } => {
            if current_session.is_some() {
                return;
            }
            let mut session = CouncilSession::new(user_id, topic, agents, max_rounds);
            session.model_override = model;
            let session_id = session.id;
            *current_session = Some(session_id);
            *observer = Some(state.events.subscribe(&EventBus::council_topic(session_id)));

            let engine = state.council.clone();
            let agents_table = state.agents.clone();
            let convergence = state.convergence.clone();
            let params = SessionTurnParams {
                provider_id: state.default_provider_id.clone(),
                tier,
                decoding: DecodingParams::default(),
                tools_enabled: tools,
            };
            tokio::spawn(async move {
                engine.run_session(session, &agents_table, convergence, params).await;
            });
        }
        CouncilCommand::Pause => {
            if let Some(id) = current_session {
                state.council.pause(*id);
            }
        }
        CouncilCommand::Resume => {
            if let Some(id) = current_session {
                state.council.resume(*id);
            }
        }
        CouncilCommand::Stop => {
            if let Some(id) = current_session {
                state.council.stop(*id);
            }
        }
        CouncilCommand::ButtIn { text } => {
            if let Some(id) = current_session {
                state.council.butt_in(*id, text).await;
            }
        }
        CouncilCommand::Ping => {
            let _ = socket.send(WsMessage::Text(r#"{"type":"pong"}"#.to_string())).await;
        }
    }
}

async fn close_with_policy_violation(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame { code: 1008, reason: reason.into() })))
        .await;
}

// ── Observer WebSocket (read-only) ─────────────────────────────────────

/// `GET /observer/ws` (§6): a read-only feed of one user's
/// `village/{user_id}` topic — tool lifecycle and approval events from
/// every chat turn that user has in flight.
pub async fn observer_ws_handler(ws: WebSocketUpgrade, Query(query): Query<TokenQuery>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state, query.token))
}

async fn handle_observer_socket(mut socket: WebSocket, state: AppState, token: String) {
    let Some((user_id, _tier)) = (state.auth)(&token) else {
        close_with_policy_violation(&mut socket, "invalid credential").await;
        return;
    };

    let topic = EventBus::village_topic(user_id);
    let mut observer = state.events.subscribe(&topic);
    state.events.publish(&topic, ObserverEvent::Connection);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("observer socket recv error: {err}");
                        break;
                    }
                }
            }
            event = EventBus::next_for_subscriber(&mut observer) => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(WsMessage::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }
}
