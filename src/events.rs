//! Streaming Transport & Event Bus (§4.6): point-to-point SSE framing to
//! the request owner, plus topic-scoped fan-out pub/sub to observers.
//!
//! Grounded on the pack's broadcast-channel-plus-observer-list event bus
//! shape, adapted from one global bus into per-topic channels
//! (`village/{user_id}`, `council/{session_id}`) with bounded
//! per-subscriber queues; `tokio::sync::broadcast`'s own lag counter
//! stands in for a hand-rolled slow-consumer detector.

use crate::model::{SessionId, UserId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};

const OBSERVER_TOPIC_CAPACITY: usize = 256;

/// Event delivered point-to-point to the request that opened the chat
/// stream (§4.6 SSE framing: `data: <json>\n\n`, `done` always last).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SseEvent {
    Token { text: String },
    ToolStart { call_id: String, tool_name: String },
    ToolComplete { call_id: String, elapsed_ms: u64, summary: serde_json::Value },
    ToolError { call_id: String, kind: String, message: String },
    Restart,
    Done { stop_reason: Option<String> },
    Error { kind: String, message: String },
}

/// Event delivered best-effort, at-most-once, to topic observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObserverEvent {
    ToolStart { call_id: String, tool_name: String },
    ToolComplete { call_id: String, elapsed_ms: u64 },
    ToolError { call_id: String, kind: String },
    ApprovalNeeded { call_id: String },
    InputNeeded { prompt: String },
    Connection,
    /// A human "butt-in" message was appended to a council transcript.
    HumanInterject { text: String },
    AgentToken { agent_id: String, text: String },
    AgentToolStart { agent_id: String, call_id: String },
    AgentToolComplete { agent_id: String, call_id: String },
    AgentComplete { agent_id: String, input_tokens: u64, output_tokens: u64 },
    Consensus { score: f64 },
    End { reason: String },
    /// Terminal event synthesized locally when a subscriber's queue
    /// overflowed the broadcast channel's lag window (§4.6).
    SubscriberLagged { skipped: u64 },
}

fn village_topic(user_id: UserId) -> String {
    format!("village/{user_id}")
}

fn council_topic(session_id: SessionId) -> String {
    format!("council/{session_id}")
}

/// Topic-scoped broadcast hub for observer WebSockets.
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<ObserverEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn village_topic(user_id: UserId) -> String {
        village_topic(user_id)
    }

    pub fn council_topic(session_id: SessionId) -> String {
        council_topic(session_id)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<ObserverEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(OBSERVER_TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish to a topic. A no-op if nobody is subscribed.
    pub fn publish(&self, topic: &str, event: ObserverEvent) {
        let sender = self.sender_for(topic);
        let _ = sender.send(event);
    }

    /// Subscribe to a topic's raw broadcast receiver.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ObserverEvent> {
        self.sender_for(topic).subscribe()
    }

    /// Drain events for one subscriber, turning a `Lagged` gap into a
    /// single terminal `SubscriberLagged` event and then ending the stream
    /// (§4.6 "slow subscribers are dropped").
    pub async fn next_for_subscriber(receiver: &mut broadcast::Receiver<ObserverEvent>) -> Option<ObserverEvent> {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(ObserverEvent::SubscriberLagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-to-point sink for one chat request's SSE stream. Sending never
/// silently drops an event: if the receiver has gone away the caller
/// learns about it via the channel send error and should treat it as a
/// cancellation signal.
#[derive(Clone)]
pub struct SseSink {
    tx: mpsc::Sender<SseEvent>,
}

impl SseSink {
    /// Creates a bound channel pair. The bounded buffer is the backpressure
    /// mechanism described in §4.6: once full, `send` awaits until the
    /// consumer drains it rather than dropping events.
    pub fn channel(buffer: usize) -> (SseSink, mpsc::Receiver<SseEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (SseSink { tx }, rx)
    }

    /// Resolves once the receiving half has been dropped — the HTTP layer's
    /// signal that the client disconnected mid-stream (§8 Scenario D).
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    async fn send(&self, event: SseEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| crate::Error::Cancelled)
    }

    pub async fn token(&self, text: impl Into<String>) -> crate::Result<()> {
        self.send(SseEvent::Token { text: text.into() }).await
    }

    pub async fn tool_start(&self, call_id: impl Into<String>, tool_name: impl Into<String>) -> crate::Result<()> {
        self.send(SseEvent::ToolStart {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
        })
        .await
    }

    pub async fn tool_complete(
        &self,
        call_id: impl Into<String>,
        elapsed_ms: u64,
        summary: serde_json::Value,
    ) -> crate::Result<()> {
        self.send(SseEvent::ToolComplete {
            call_id: call_id.into(),
            elapsed_ms,
            summary,
        })
        .await
    }

    pub async fn tool_error(&self, call_id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> crate::Result<()> {
        self.send(SseEvent::ToolError {
            call_id: call_id.into(),
            kind: kind.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn restart(&self) -> crate::Result<()> {
        self.send(SseEvent::Restart).await
    }

    pub async fn error(&self, kind: impl Into<String>, message: impl Into<String>) -> crate::Result<()> {
        self.send(SseEvent::Error {
            kind: kind.into(),
            message: message.into(),
        })
        .await
    }

    /// Always the last event sent on a stream (§4.6 ordering guarantee).
    pub async fn done(&self, stop_reason: Option<String>) -> crate::Result<()> {
        self.send(SseEvent::Done { stop_reason }).await
    }
}

/// Renders one SSE event as the wire line `data: <json>\n\n`.
pub fn frame_sse_event(event: &SseEvent) -> crate::Result<String> {
    let json = serde_json::to_string(event)?;
    Ok(format!("data: {json}\n\n"))
}
