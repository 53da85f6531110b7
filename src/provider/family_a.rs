//! Family A: "native" back-ends that understand multi-block content and
//! tool-use directly, streaming structured block-delta events rather than
//! a flat OpenAI-style tool-call delta. No teacher module speaks this wire
//! shape; the adapter is new, built in the same request/response/event
//! normalization shape as [`super::family_b`].

use super::{ProviderAdapter, ProviderErrorKind, ProviderRequest, StreamEvent};
use crate::model::{ContentBlock, MessageRole};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

pub struct NativeBlockAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl NativeBlockAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct RequestBody {
    model: String,
    system: String,
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<RequestTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Serialize)]
struct RequestMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: serde_json::Value },
}

#[derive(Serialize)]
struct RequestTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User | MessageRole::ToolResult => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "user",
    }
}

fn to_request_blocks(content: &[ContentBlock]) -> Vec<RequestBlock> {
    content
        .iter()
        .map(|block| match block {
            ContentBlock::Text(t) => RequestBlock::Text { text: t.text.clone() },
            ContentBlock::Image(i) => RequestBlock::Text {
                text: format!("[image:{}]", i.media_type),
            },
            ContentBlock::ToolUse(u) => RequestBlock::ToolUse {
                id: u.call_id.0.clone(),
                name: u.tool_name.clone(),
                input: u.arguments.clone(),
            },
            ContentBlock::ToolResult(r) => RequestBlock::ToolResult {
                tool_use_id: r.call_id.0.clone(),
                content: r.payload.clone(),
            },
        })
        .collect()
}

fn build_request_body(request: &ProviderRequest) -> RequestBody {
    let messages = request
        .messages
        .iter()
        .map(|m| RequestMessage {
            role: role_str(m.role),
            content: to_request_blocks(&m.content),
        })
        .collect();

    let tools = request
        .tools
        .iter()
        .map(|t| RequestTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
        })
        .collect();

    RequestBody {
        model: request.model_id.clone(),
        system: request.system_prompt.clone(),
        messages,
        tools,
        stream: true,
        max_tokens: request.decoding.max_output_tokens,
        temperature: request.decoding.temperature,
        stop_sequences: request.decoding.stop_sequences.clone(),
    }
}

/// One wire-level streaming event from a family-A back-end.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeEvent {
    ContentBlockStart {
        index: u32,
        content_block: NativeContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: NativeDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<NativeUsage>,
    },
    MessageStop,
    Error {
        error: NativeError,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeContentBlock {
    Text { #[allow(dead_code)] text: String },
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct NativeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct NativeError {
    message: String,
    #[serde(default)]
    retryable: bool,
}

fn parse_native_sse(body: reqwest::Response) -> impl futures::Stream<Item = crate::Result<NativeEvent>> {
    body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => return Some(Err(crate::Error::provider_transient(e.to_string()))),
        };
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data.is_empty() {
                    continue;
                }
                return match serde_json::from_str::<NativeEvent>(data) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => Some(Err(crate::Error::provider_transient(format!(
                        "failed to parse stream event: {e}"
                    )))),
                };
            }
        }
        None
    })
}

/// Tracks which content-block index is a tool-use block and its call id,
/// so a `ContentBlockDelta`/`ContentBlockStop` can be routed correctly.
#[derive(Default)]
struct ToolUseTracker {
    call_id_by_index: std::collections::HashMap<u32, String>,
}

fn translate_event(event: NativeEvent, tracker: &mut ToolUseTracker) -> Vec<StreamEvent> {
    match event {
        NativeEvent::ContentBlockStart {
            index,
            content_block: NativeContentBlock::ToolUse { id, name },
        } => {
            tracker.call_id_by_index.insert(index, id.clone());
            vec![StreamEvent::ToolUseStart {
                call_id: id,
                tool_name: name,
            }]
        }
        NativeEvent::ContentBlockStart { .. } => vec![],
        NativeEvent::ContentBlockDelta {
            index,
            delta: NativeDelta::TextDelta { text },
        } => {
            if tracker.call_id_by_index.contains_key(&index) {
                vec![]
            } else {
                vec![StreamEvent::TextDelta(text)]
            }
        }
        NativeEvent::ContentBlockDelta {
            index,
            delta: NativeDelta::InputJsonDelta { partial_json },
        } => {
            if let Some(call_id) = tracker.call_id_by_index.get(&index) {
                vec![StreamEvent::ToolUseArgumentsDelta {
                    call_id: call_id.clone(),
                    fragment: partial_json,
                }]
            } else {
                vec![]
            }
        }
        NativeEvent::ContentBlockStop { .. } => vec![],
        NativeEvent::MessageDelta { usage: Some(usage) } => vec![StreamEvent::UsageReport {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cache_read_input_tokens,
        }],
        NativeEvent::MessageDelta { usage: None } => vec![],
        NativeEvent::MessageStop => vec![StreamEvent::Done {
            stop_reason: "stop".to_string(),
        }],
        NativeEvent::Error { error } => vec![StreamEvent::ProviderError {
            kind: if error.retryable {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::Permanent
            },
            retryable: error.retryable,
            detail: error.message,
        }],
    }
}

#[async_trait]
impl ProviderAdapter for NativeBlockAdapter {
    async fn stream(&self, request: ProviderRequest) -> crate::Result<BoxStream<'static, StreamEvent>> {
        let body = build_request_body(&request);
        let cancellation = request.cancellation.clone();

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| crate::Error::provider_transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let retryable = status.is_server_error();
            let detail = response.text().await.unwrap_or_default();
            let event = StreamEvent::ProviderError {
                kind: if retryable {
                    ProviderErrorKind::Transient
                } else {
                    ProviderErrorKind::Permanent
                },
                retryable,
                detail: format!("provider returned {status}: {detail}"),
            };
            return Ok(Box::pin(stream::iter(vec![event])));
        }

        let raw_events = Box::pin(parse_native_sse(response));
        let mut tracker = ToolUseTracker::default();

        let events = raw_events
            .take_until(async move { cancellation.cancelled().await })
            .flat_map(move |result| match result {
                Ok(event) => stream::iter(translate_event(event, &mut tracker)),
                Err(e) => stream::iter(vec![StreamEvent::ProviderError {
                    kind: ProviderErrorKind::Transient,
                    retryable: true,
                    detail: e.to_string(),
                }]),
            });

        Ok(Box::pin(events))
    }
}
