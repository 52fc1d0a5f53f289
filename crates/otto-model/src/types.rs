// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One ordered content item in a model message or response.
///
/// Tool results may nest further content items (text produced by the tool);
/// tool uses carry the parsed JSON input as the model emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content: Vec<ContentItem>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// A tool result wrapping a single text item.
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![ContentItem::text(text)],
            is_error,
        }
    }
}

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ContentItem>,
}

impl ModelMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentItem::text(text)],
        }
    }

    /// A user message with one text item per entry, preserving order.
    pub fn user_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: Role::User,
            content: texts.into_iter().map(ContentItem::text).collect(),
        }
    }

    pub fn user_items(content: Vec<ContentItem>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant_items(content: Vec<ContentItem>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Concatenation of all text items, in order.
    pub fn text(&self) -> String {
        collect_text(&self.content)
    }
}

pub(crate) fn collect_text(items: &[ContentItem]) -> String {
    let parts: Vec<&str> = items
        .iter()
        .filter_map(|c| match c {
            ContentItem::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    parts.join("\n")
}

// ─── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

/// Token and cost usage from one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache (write/creation).
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    /// Total tokens occupying the input context for this request.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input() + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// One complete (non-streamed) response from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentItem>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ModelResponse {
    /// Concatenation of all text items, in order.
    pub fn text(&self) -> String {
        collect_text(&self.content)
    }

    /// The tool-use items of this response, in the order the model emitted them.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentItem::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
    pub system_prompt: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_message_has_single_text_item() {
        let m = ModelMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert_eq!(m.content.len(), 1);
    }

    #[test]
    fn user_texts_preserves_order() {
        let m = ModelMessage::user_texts(["a", "b", "c"]);
        assert_eq!(m.content.len(), 3);
        assert_eq!(m.text(), "a\nb\nc");
    }

    #[test]
    fn response_text_skips_tool_items() {
        let resp = ModelResponse {
            content: vec![
                ContentItem::text("before"),
                ContentItem::tool_use("t1", "shell", json!({"command": "ls"})),
                ContentItem::text("after"),
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        assert_eq!(resp.text(), "before\nafter");
    }

    #[test]
    fn tool_uses_returns_items_in_order() {
        let resp = ModelResponse {
            content: vec![
                ContentItem::tool_use("t1", "a", json!({})),
                ContentItem::tool_use("t2", "b", json!({})),
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        let uses = resp.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[1].0, "t2");
    }

    #[test]
    fn usage_totals_include_cache_tokens() {
        let u = Usage {
            input_tokens: 100,
            output_tokens: 10,
            cache_read_tokens: 50,
            cache_write_tokens: 25,
            cost_usd: 0.01,
        };
        assert_eq!(u.total_input(), 175);
        assert_eq!(u.total_tokens(), 185);
    }

    #[test]
    fn usage_add_accumulates_all_fields() {
        let mut a = Usage {
            input_tokens: 1,
            output_tokens: 2,
            cache_read_tokens: 3,
            cache_write_tokens: 4,
            cost_usd: 0.5,
        };
        a.add(&a.clone());
        assert_eq!(a.input_tokens, 2);
        assert_eq!(a.output_tokens, 4);
        assert_eq!(a.cache_read_tokens, 6);
        assert_eq!(a.cache_write_tokens, 8);
        assert_eq!(a.cost_usd, 1.0);
    }

    #[test]
    fn content_item_serialises_with_type_tag() {
        let item = ContentItem::tool_use("t1", "shell", json!({"command": "ls"}));
        let text = serde_json::to_string(&item).unwrap();
        assert!(text.contains("\"type\":\"tool_use\""));
        let back: ContentItem = serde_json::from_str(&text).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn tool_result_omits_error_flag_when_false() {
        let ok = ContentItem::tool_result("t1", "fine", false);
        let text = serde_json::to_string(&ok).unwrap();
        assert!(!text.contains("is_error"), "unexpected flag in: {text}");

        let err = ContentItem::tool_result("t1", "boom", true);
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"is_error\":true"));
    }

    #[test]
    fn stop_reason_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&StopReason::EndTurn).unwrap(),
            "\"end_turn\""
        );
        assert_eq!(
            serde_json::to_string(&StopReason::ToolUse).unwrap(),
            "\"tool_use\""
        );
    }
}
