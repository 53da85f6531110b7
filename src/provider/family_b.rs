//! Family B: "OpenAI-style" back-ends — a flat messages array, a separate
//! `tools` field, and streamed tool calls delivered as structured deltas
//! that must be reassembled across SSE frames before they can be trusted.

use super::sse::{parse_sse_stream, OpenAiChunk};
use super::{ProviderAdapter, ProviderErrorKind, ProviderRequest, StreamEvent};
use crate::model::{ContentBlock, MessageRole};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;

/// A provider reachable via the flat-messages, streaming-tool-call-delta
/// wire format (the shape most local-inference servers and many hosted
/// APIs share).
pub struct OpenAiStyleAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiStyleAdapter {
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
    messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<RequestTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct RequestTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestFunction,
}

#[derive(Serialize)]
struct RequestFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::ToolResult => "tool",
    }
}

/// Flattens a message's content blocks into the single text payload the
/// flat-message wire format expects. Tool-use/tool-result blocks are
/// rendered as their JSON so they remain visible to the model as
/// plain-text transcript context on a resend.
fn flatten_content(content: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in content {
        match block {
            ContentBlock::Text(t) => out.push_str(&t.text),
            ContentBlock::Image(_) => out.push_str("[image omitted]"),
            ContentBlock::ToolUse(u) => {
                out.push_str(&format!("[tool_use {} {}]", u.tool_name, u.arguments));
            }
            ContentBlock::ToolResult(r) => {
                out.push_str(&format!("[tool_result {} {}]", r.call_id, r.payload));
            }
        }
    }
    out
}

fn build_request_body(request: &ProviderRequest) -> RequestBody {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.is_empty() {
        messages.push(RequestMessage {
            role: "system",
            content: request.system_prompt.clone(),
        });
    }
    for message in &request.messages {
        messages.push(RequestMessage {
            role: role_str(message.role),
            content: flatten_content(&message.content),
        });
    }

    let tools = request
        .tools
        .iter()
        .map(|t| RequestTool {
            kind: "function",
            function: RequestFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect();

    RequestBody {
        model: request.model_id.clone(),
        messages,
        tools,
        stream: true,
        max_tokens: request.decoding.max_output_tokens,
        temperature: request.decoding.temperature,
        stop: request.decoding.stop_sequences.clone(),
    }
}

#[derive(Default)]
struct PartialToolCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
    started: bool,
}

/// Translates one wire chunk into zero or more normalized events,
/// reassembling tool-call argument fragments by index (§4.1). Unlike a
/// buffer-then-flush aggregator, text and argument deltas are surfaced
/// immediately; only `ToolUseEnd` waits for the index's `finish_reason`.
fn translate_chunk(chunk: OpenAiChunk, pending: &mut HashMap<u32, PartialToolCall>) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::TextDelta(content));
            }
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for delta in tool_calls {
                let entry = pending.entry(delta.index).or_default();

                if let Some(id) = delta.id {
                    entry.call_id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        entry.name = Some(name);
                    }
                    if let Some(args) = function.arguments {
                        if !entry.started && entry.call_id.is_some() && entry.name.is_some() {
                            events.push(StreamEvent::ToolUseStart {
                                call_id: entry.call_id.clone().unwrap(),
                                tool_name: entry.name.clone().unwrap(),
                            });
                            entry.started = true;
                        }
                        if entry.started && !args.is_empty() {
                            events.push(StreamEvent::ToolUseArgumentsDelta {
                                call_id: entry.call_id.clone().unwrap(),
                                fragment: args.clone(),
                            });
                        }
                        entry.arguments.push_str(&args);
                    }
                }

                if !entry.started {
                    if let (Some(id), Some(name)) = (&entry.call_id, &entry.name) {
                        events.push(StreamEvent::ToolUseStart {
                            call_id: id.clone(),
                            tool_name: name.clone(),
                        });
                        entry.started = true;
                    }
                }
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            for (_, partial) in pending.drain() {
                let (Some(call_id), Some(_name)) = (partial.call_id.clone(), partial.name.clone()) else {
                    continue;
                };
                let parsed: Result<serde_json::Value, _> = if partial.arguments.is_empty() {
                    Ok(serde_json::json!({}))
                } else {
                    serde_json::from_str(&partial.arguments)
                };
                match parsed {
                    Ok(parsed_arguments) => events.push(StreamEvent::ToolUseEnd {
                        call_id,
                        parsed_arguments,
                    }),
                    Err(_) => events.push(StreamEvent::ProviderError {
                        kind: ProviderErrorKind::MalformedToolCall,
                        retryable: false,
                        detail: format!("call {call_id} arguments did not parse as JSON by stream end"),
                    }),
                }
            }
            events.push(StreamEvent::Done {
                stop_reason: finish_reason,
            });
        }
    }

    events
}

#[async_trait]
impl ProviderAdapter for OpenAiStyleAdapter {
    async fn stream(&self, request: ProviderRequest) -> crate::Result<BoxStream<'static, StreamEvent>> {
        let body = build_request_body(&request);
        let cancellation = request.cancellation.clone();

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
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

        let chunks = parse_sse_stream(response);
        let mut pending: HashMap<u32, PartialToolCall> = HashMap::new();

        let events = chunks
            .take_until(async move { cancellation.cancelled().await })
            .flat_map(move |result| match result {
                Ok(chunk) => stream::iter(translate_chunk(chunk, &mut pending)),
                Err(e) => stream::iter(vec![StreamEvent::ProviderError {
                    kind: ProviderErrorKind::Transient,
                    retryable: true,
                    detail: e.to_string(),
                }]),
            });

        Ok(Box::pin(events))
    }
}
