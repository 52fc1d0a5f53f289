// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    CompletionRequest, ContentItem, ModelProvider, ModelResponse, Role, StopReason, Usage,
};

/// Deterministic mock provider for tests and the headless driver.  Echoes the
/// last user text back as the assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "echo-model"
    }
    fn context_window(&self) -> u64 {
        200_000
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".to_string());

        Ok(ModelResponse {
            content: vec![ContentItem::text(format!("ECHO: {reply}"))],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
                ..Usage::default()
            },
        })
    }
}

/// One pre-scripted step: a full response or an error message.
pub type ScriptedStep = Result<ModelResponse, String>;

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// response from the front of the queue.  This lets tests specify exact
/// response sequences — including tool calls and failures — without network
/// access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<ScriptedStep>>,
    context_window: u64,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of steps.
    pub fn new(scripts: Vec<ScriptedStep>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            context_window: 200_000,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = window;
        self
    }

    /// Convenience: a text-only end-of-turn response.
    pub fn text_response(text: impl Into<String>) -> ModelResponse {
        ModelResponse {
            content: vec![ContentItem::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 5,
                output_tokens: 5,
                ..Usage::default()
            },
        }
    }

    /// Convenience: a single tool-use response.
    pub fn tool_use_response(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> ModelResponse {
        ModelResponse {
            content: vec![ContentItem::tool_use(id, name, input)],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 5,
                output_tokens: 5,
                ..Usage::default()
            },
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }
    fn context_window(&self) -> u64 {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse> {
        *self.last_request.lock().unwrap() = Some(req);
        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Ok(Self::text_response("[no more scripts]"))
            } else {
                scripts.remove(0)
            }
        };
        step.map_err(|msg| anyhow::anyhow!(msg))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ModelMessage;

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![ModelMessage::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_returns_last_user_text() {
        let p = EchoProvider;
        let resp = p.complete(req("hi")).await.unwrap();
        assert_eq!(resp.text(), "ECHO: hi");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn scripted_pops_steps_in_order() {
        let p = ScriptedProvider::new(vec![
            Ok(ScriptedProvider::text_response("one")),
            Ok(ScriptedProvider::text_response("two")),
        ]);
        assert_eq!(p.complete(req("a")).await.unwrap().text(), "one");
        assert_eq!(p.complete(req("b")).await.unwrap().text(), "two");
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let resp = p.complete(req("a")).await.unwrap();
        assert!(resp.text().contains("no more scripts"));
    }

    #[tokio::test]
    async fn scripted_error_step_surfaces_as_error() {
        let p = ScriptedProvider::new(vec![Err("upstream 500".into())]);
        let err = p.complete(req("a")).await.unwrap_err();
        assert!(err.to_string().contains("upstream 500"));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::new(vec![Ok(ScriptedProvider::tool_use_response(
            "t1",
            "shell",
            json!({"command": "ls"}),
        ))]);
        let _ = p.complete(req("inspect me")).await.unwrap();
        let last = p.last_request.lock().unwrap();
        let messages = &last.as_ref().unwrap().messages;
        assert_eq!(messages[0].text(), "inspect me");
    }
}
