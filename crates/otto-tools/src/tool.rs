// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON input
    pub input: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Per-call execution context handed to every tool.
///
/// `cancel` is a child of the turn's cancellation scope; blocking tools must
/// select on it and return best-effort partial results when it fires.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub working_dir: PathBuf,
}

/// Trait that every tool available to the model must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn schema(&self) -> Value;
    /// When true, a successful call terminates the turn without another
    /// model round trip.
    fn ends_turn(&self) -> bool {
        false
    }
    /// Inspect the input before execution.  A rejection becomes an error
    /// tool result; the tool is never run.
    fn check_permission(&self, _input: &Value) -> Result<(), String> {
        Ok(())
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
