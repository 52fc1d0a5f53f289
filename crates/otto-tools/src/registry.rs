// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Tool, ToolCall, ToolContext, ToolOutput};

/// A tool schema – mirrors otto_model::ToolSchema but keeps the tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Built once at agent init; immutable afterwards, so parallel lookups and
/// executions need no further synchronization.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Whether a call of `name` terminates the turn.
    /// Unknown names never end the turn.
    pub fn ends_turn(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.ends_turn()).unwrap_or(false)
    }

    /// Execute one call: permission check first, then the tool itself.
    /// Unknown tools and rejected permissions become error outputs.
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => {
                if let Err(reason) = tool.check_permission(&call.input) {
                    return ToolOutput::err(&call.id, format!("permission denied: {reason}"));
                }
                tool.execute(ctx, call).await
            }
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Minimal no-op tool for registry tests.
    struct EchoTool {
        name: &'static str,
        ends_turn: bool,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn ends_turn(&self) -> bool {
            self.ends_turn
        }
        async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.input))
        }
    }

    /// Tool that rejects any input containing a "forbidden" key.
    struct GuardedTool;

    #[async_trait]
    impl Tool for GuardedTool {
        fn name(&self) -> &str {
            "guarded"
        }
        fn description(&self) -> &str {
            "rejects forbidden input"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn check_permission(&self, input: &Value) -> Result<(), String> {
            if input.get("forbidden").is_some() {
                Err("forbidden key present".to_string())
            } else {
                Ok(())
            }
        }
        async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "ran")
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            cancel: CancellationToken::new(),
            working_dir: std::env::temp_dir(),
        }
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn execute_dispatches_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "echo",
            ends_turn: false,
        });
        let out = reg.execute(&ctx(), &call("echo", json!({"x": 1}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("echo:"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_output() {
        let reg = ToolRegistry::new();
        let out = reg.execute(&ctx(), &call("missing", json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn permission_rejection_prevents_execution() {
        let mut reg = ToolRegistry::new();
        reg.register(GuardedTool);
        let out = reg
            .execute(&ctx(), &call("guarded", json!({"forbidden": true})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("permission denied"));

        let out = reg.execute(&ctx(), &call("guarded", json!({}))).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "ran");
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "zeta",
            ends_turn: false,
        });
        reg.register(EchoTool {
            name: "alpha",
            ends_turn: false,
        });
        let names: Vec<String> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn ends_turn_looked_up_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool {
            name: "done",
            ends_turn: true,
        });
        reg.register(EchoTool {
            name: "shell",
            ends_turn: false,
        });
        assert!(reg.ends_turn("done"));
        assert!(!reg.ends_turn("shell"));
        assert!(!reg.ends_turn("missing"));
    }
}
