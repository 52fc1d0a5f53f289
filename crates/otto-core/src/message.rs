// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otto_model::Usage;

use crate::gitobs::GitCommit;

/// Closed set of history message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Agent,
    Error,
    Budget,
    Tool,
    Commit,
    Auto,
    Compact,
    Port,
}

/// A tool invocation requested on an agent message.  Fulfilled once a tool
/// message with the same `tool_call_id` has been appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub name: String,
    /// Serialized JSON input as the model emitted it
    pub input: String,
    pub tool_call_id: String,
}

/// The unit of history.
///
/// `idx` equals the message's position in history at the moment it is
/// appended and is never reassigned; the store is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub idx: usize,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    // Tool fields, set on tool-type messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tool_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls requested by an agent message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    /// Commits surfaced by a commit message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<GitCommit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,

    pub end_of_turn: bool,
    /// Set on the last agent message of a turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_duration: Option<Duration>,

    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<String>,
    /// Subconversation outputs are hidden from the primary transcript
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hide_output: bool,
}

impl AgentMessage {
    /// A blank message of the given kind.  The index and timestamp are
    /// assigned by the store on append.
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            idx: 0,
            kind,
            content: content.into(),
            timestamp: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            tool_error: false,
            tool_call_id: None,
            tool_calls: Vec::new(),
            commits: Vec::new(),
            usage: None,
            start_time: None,
            end_time: None,
            elapsed: None,
            end_of_turn: false,
            turn_duration: None,
            conversation_id: String::new(),
            parent_conversation_id: None,
            hide_output: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_blank() {
        let m = AgentMessage::new(MessageType::User, "hi");
        assert_eq!(m.idx, 0);
        assert_eq!(m.kind, MessageType::User);
        assert_eq!(m.content, "hi");
        assert!(!m.end_of_turn);
        assert!(m.timestamp.is_none());
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn serialises_kind_as_type_tag() {
        let m = AgentMessage::new(MessageType::Budget, "over");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"type\":\"budget\""), "got: {json}");
    }

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let m = AgentMessage::new(MessageType::Agent, "hi");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("tool_name"));
        assert!(!json.contains("turn_duration"));
        assert!(!json.contains("hide_output"));
    }

    #[test]
    fn message_round_trips_through_json() {
        let mut m = AgentMessage::new(MessageType::Tool, "output");
        m.tool_name = Some("shell".into());
        m.tool_call_id = Some("t1".into());
        m.tool_error = true;
        m.elapsed = Some(Duration::from_millis(250));
        let json = serde_json::to_string(&m).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageType::Tool);
        assert_eq!(back.tool_name.as_deref(), Some("shell"));
        assert!(back.tool_error);
        assert_eq!(back.elapsed, Some(Duration::from_millis(250)));
    }
}
