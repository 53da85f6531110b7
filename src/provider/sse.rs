//! SSE line parsing for family-B (OpenAI-style) streaming responses.
//!
//! Format: `data: <json>\n\n`, terminated by the `data: [DONE]` sentinel.
//! Lines that don't start with `data: ` (heartbeats, comments) are skipped
//! rather than treated as errors.

use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

#[derive(Debug, Deserialize)]
pub struct OpenAiChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: OpenAiDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAiDelta {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Splits a raw HTTP streaming response body into parsed SSE chunks.
/// Chunk boundaries from the transport rarely line up with event
/// boundaries, so each `bytes_stream()` item is line-scanned independently.
pub fn parse_sse_stream(
    body: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<OpenAiChunk>> + Send>> {
    let stream = body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result.map_err(Error::Http) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };

        let text = String::from_utf8_lossy(&bytes);

        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }

                let chunk: OpenAiChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        return Some(Err(Error::provider_transient(format!(
                            "failed to parse stream chunk: {e}"
                        ))));
                    }
                };

                return Some(Ok(chunk));
            }
        }

        None
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_with_tool_call_delta_deserializes() {
        let raw = r#"{
            "id": "msg_1",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_1",
                        "function": {"name": "search", "arguments": "{\"q\":"}
                    }]
                },
                "finish_reason": null
            }]
        }"#;
        let chunk: OpenAiChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        let tool_calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0].id.as_deref(), Some("call_1"));
    }

    #[test]
    fn chunk_with_only_text_delta_deserializes() {
        let raw = r#"{"id":"x","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":"stop"}]}"#;
        let chunk: OpenAiChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
