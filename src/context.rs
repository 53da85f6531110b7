//! Token estimation and conversation-tail truncation feeding
//! `Repository::load_conversation_tail` (§4.7).
//!
//! These are plain helpers, not automatic behavior: the orchestrator calls
//! `truncate_to_budget` explicitly before seeding its working list.

use crate::model::{ContentBlock, Message, MessageRole};

/// Characters per token for natural-language text.
const TEXT_CHARS_PER_TOKEN: f64 = 4.0;

/// Characters per token for JSON-ish structured payloads (tool arguments,
/// tool results) — punctuation and quoting make these denser than prose.
const STRUCTURED_CHARS_PER_TOKEN: f64 = 3.0;

/// Flat token cost for an image block, independent of its encoded byte
/// size — vision models quantize an image into a fixed number of tiles
/// rather than tokenizing its bytes.
const IMAGE_FLAT_TOKENS: usize = 85;

/// Per-message framing overhead, in tokens directly (not chars): how many
/// tokens a role marker and turn boundary cost in the wire format. Tool
/// results carry more structure (a call id tag plus an outcome marker) so
/// they cost more than a plain turn.
fn role_overhead_tokens(role: MessageRole) -> usize {
    match role {
        MessageRole::System => 4,
        MessageRole::User | MessageRole::Assistant => 3,
        MessageRole::ToolResult => 5,
    }
}

fn chars_to_tokens(chars: usize, chars_per_token: f64) -> usize {
    ((chars as f64) / chars_per_token).ceil() as usize
}

fn block_tokens(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text(text) => chars_to_tokens(text.text.len(), TEXT_CHARS_PER_TOKEN),
        ContentBlock::Image(_) => IMAGE_FLAT_TOKENS,
        ContentBlock::ToolUse(tool) => {
            chars_to_tokens(tool.tool_name.len(), TEXT_CHARS_PER_TOKEN)
                + chars_to_tokens(tool.call_id.0.len(), STRUCTURED_CHARS_PER_TOKEN)
                + chars_to_tokens(tool.arguments.to_string().len(), STRUCTURED_CHARS_PER_TOKEN)
        }
        ContentBlock::ToolResult(result) => {
            chars_to_tokens(result.call_id.0.len(), STRUCTURED_CHARS_PER_TOKEN)
                + chars_to_tokens(result.payload.to_string().len(), STRUCTURED_CHARS_PER_TOKEN)
        }
    }
}

/// Estimate token count for a message list. Conservative across model
/// families; callers should keep a 10-20% safety margin against real
/// limits. Unlike a single whole-conversation character count, overhead is
/// charged per message (a tool result costs more framing than a plain
/// turn) and structured content (tool arguments, tool payloads) is charged
/// a denser rate than prose.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total = 0usize;

    for message in messages {
        total += role_overhead_tokens(message.role);
        for block in &message.content {
            total += block_tokens(block);
        }
    }

    // Each turn boundary costs a token in the wire format; this scales
    // with the conversation rather than charging one flat amount.
    total += messages.len() * 2;

    total
}

/// Truncate message history to the most recent `keep` messages, always
/// preserving a leading system message when `preserve_system` is set.
/// Unlike a plain tail-keep, the cut point is pulled backward when it
/// would otherwise split a tool-use/tool-result pair, since a dangling
/// `ToolResult` with no matching `ToolUse` ahead of it violates this
/// conversation's own pairing invariant.
pub fn truncate_messages(messages: &[Message], keep: usize, preserve_system: bool) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    if messages.len() <= keep {
        return messages.to_vec();
    }

    let has_system = preserve_system && matches!(messages[0].role, MessageRole::System);

    if has_system {
        let mut result = vec![messages[0].clone()];
        if keep > 0 && messages.len() > 1 {
            let base_start = messages.len().saturating_sub(keep);
            let start = pull_back_from_split_tool_pair(messages, base_start).max(1);
            result.extend_from_slice(&messages[start..]);
        }
        result
    } else if keep > 0 {
        let base_start = messages.len().saturating_sub(keep);
        let start = pull_back_from_split_tool_pair(messages, base_start);
        messages[start..].to_vec()
    } else {
        Vec::new()
    }
}

/// If the message at `start` is a tool result, its paired tool-use call
/// may live in an earlier message that `start` would otherwise drop —
/// walk the cut point back over any leading run of tool-result messages
/// so the kept window begins at the assistant turn that issued them.
fn pull_back_from_split_tool_pair(messages: &[Message], start: usize) -> usize {
    if start == 0 || start >= messages.len() {
        return start;
    }
    let mut cursor = start;
    while cursor > 0 && messages[cursor].role == MessageRole::ToolResult {
        cursor -= 1;
    }
    cursor
}

/// Truncate a message list until its estimated token count fits within
/// `max_tokens`, dropping oldest non-system messages first. Used by
/// `Repository::load_conversation_tail` implementations.
pub fn truncate_to_budget(messages: &[Message], max_tokens: usize) -> Vec<Message> {
    if estimate_tokens(messages) <= max_tokens {
        return messages.to_vec();
    }

    let mut keep = messages.len();
    while keep > 0 {
        keep -= 1;
        let candidate = truncate_messages(messages, keep, true);
        if estimate_tokens(&candidate) <= max_tokens {
            return candidate;
        }
    }

    truncate_messages(messages, 0, true)
}

/// Whether estimated usage exceeds `limit * margin`.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationId, MessageRole};

    fn conv() -> ConversationId {
        ConversationId::new()
    }

    #[test]
    fn estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn estimate_tokens_simple() {
        let messages = vec![Message::user(conv(), "Hello world")];
        let tokens = estimate_tokens(&messages);
        assert!(tokens >= 3 && tokens <= 10);
    }

    #[test]
    fn truncate_messages_preserves_system() {
        let c = conv();
        let messages = vec![
            Message::new(c, MessageRole::System, vec![ContentBlock::text("system prompt")]),
            Message::user(c, "one"),
            Message::user(c, "two"),
            Message::user(c, "three"),
            Message::user(c, "four"),
        ];

        let truncated = truncate_messages(&messages, 2, true);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].role, MessageRole::System);
    }

    #[test]
    fn truncate_messages_without_preserve() {
        let c = conv();
        let messages = vec![
            Message::new(c, MessageRole::System, vec![ContentBlock::text("system prompt")]),
            Message::user(c, "one"),
            Message::user(c, "two"),
        ];

        let truncated = truncate_messages(&messages, 1, false);
        assert_eq!(truncated.len(), 1);
        assert_eq!(truncated[0].role, MessageRole::User);
    }

    #[test]
    fn truncate_to_budget_shrinks_until_within_limit() {
        let c = conv();
        let messages: Vec<Message> = (0..50).map(|i| Message::user(c, format!("message {i}"))).collect();
        let truncated = truncate_to_budget(&messages, 50);
        assert!(estimate_tokens(&truncated) <= 50);
        assert!(truncated.len() < messages.len());
    }

    #[test]
    fn is_approaching_limit_detects_threshold() {
        let c = conv();
        let messages = vec![Message::user(c, "x".repeat(1000))];
        assert!(!is_approaching_limit(&messages, 1000, 0.9));
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
