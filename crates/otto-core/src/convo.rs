// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use otto_model::{
    CompletionRequest, ContentItem, ModelMessage, ModelProvider, ModelResponse, Role, ToolSchema,
    Usage,
};
use otto_tools::{ToolCall, ToolContext, ToolOutput, ToolRegistry};

/// Content of a synthesized cancel result, and of results returned by tools
/// that observe a mid-flight cancellation.
pub const CANCELLED_TOOL_USE: &str = "user canceled this tool_use";

/// Spending limit for one conversation.  Zero in either dimension means
/// unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Budget {
    pub max_dollars: f64,
    pub max_tokens: u64,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BudgetError {
    #[error("budget exceeded: ${spent:.2} of ${max:.2} spent")]
    Dollars { spent: f64, max: f64 },
    #[error("budget exceeded: {spent} of {max} tokens used")]
    Tokens { spent: u64, max: u64 },
}

/// Identity of a conversation, handed to listener callbacks.
#[derive(Debug, Clone)]
pub struct ConvoMeta {
    pub id: String,
    pub parent_id: Option<String>,
}

impl ConvoMeta {
    pub fn is_subconversation(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Everything the listener needs to record one finished (or cancelled) tool
/// call.
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub tool_call_id: String,
    pub name: String,
    /// Serialized JSON input
    pub input: String,
    pub content: String,
    pub is_error: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Callbacks the agent registers on its conversations.
///
/// The facade holds the listener only as a capability — the agent owns the
/// facade, never the other way around.  Implementations must be thread-safe;
/// calls may arrive from the facade's tool-execution path.
pub trait ConvoListener: Send + Sync {
    /// A model request is in flight; `request_id` tracks it for the UI.
    fn on_request_start(&self, meta: &ConvoMeta, request_id: &str);
    /// The model responded; the listener appends the agent message.
    fn on_response(&self, meta: &ConvoMeta, request_id: &str, resp: &ModelResponse);
    /// The request failed; the caller surfaces the error itself.
    fn on_request_error(&self, meta: &ConvoMeta, request_id: &str, error: &str);
    /// A tool is about to run.
    fn on_tool_call_start(&self, meta: &ConvoMeta, tool_call_id: &str, name: &str);
    /// A tool finished (or was synthesized as cancelled); the listener
    /// appends the tool message.
    fn on_tool_result(&self, meta: &ConvoMeta, record: &ToolResultRecord);
}

struct ConvoState {
    messages: Vec<ModelMessage>,
    budget: Budget,
    original_budget: Budget,
    cumulative: Usage,
    last: Option<Usage>,
    /// Free-form annotations attached by embedders (session labels, UI hints).
    extra: HashMap<String, String>,
}

/// Wraps one model conversation: message history, usage counters, budget,
/// tool execution, and targeted tool cancellation.
///
/// Single-writer by convention: only the turn task calls [`send_message`],
/// [`push_user_message`] and the tool-result operations.  The state mutex is
/// never held across an await point.
pub struct Conversation {
    meta: ConvoMeta,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    working_dir: PathBuf,
    listener: Arc<dyn ConvoListener>,
    state: Mutex<ConvoState>,
    running_tools: Mutex<HashMap<String, CancellationToken>>,
}

impl Conversation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
        working_dir: PathBuf,
        budget: Budget,
        listener: Arc<dyn ConvoListener>,
    ) -> Self {
        Self {
            meta: ConvoMeta {
                id: Uuid::new_v4().to_string(),
                parent_id: None,
            },
            provider,
            tools,
            system_prompt: system_prompt.into(),
            working_dir,
            listener,
            state: Mutex::new(ConvoState {
                messages: Vec::new(),
                budget,
                original_budget: budget,
                cumulative: Usage::default(),
                last: None,
                extra: HashMap::new(),
            }),
            running_tools: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the cumulative usage counters, e.g. with the totals of a
    /// conversation this one replaces.
    pub fn with_cumulative_usage(self, usage: Usage) -> Self {
        self.state.lock().unwrap().cumulative = usage;
        self
    }

    pub fn meta(&self) -> &ConvoMeta {
        &self.meta
    }

    pub fn context_window(&self) -> u64 {
        self.provider.context_window()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    /// One blocking model round trip: record the outgoing user-role message,
    /// call the provider, record the assistant reply and usage.
    pub async fn send_message(&self, msg: ModelMessage) -> anyhow::Result<ModelResponse> {
        let request_id = Uuid::new_v4().to_string();
        let req = {
            let mut state = self.state.lock().unwrap();
            state.messages.push(msg);
            CompletionRequest {
                messages: state.messages.clone(),
                tools: self
                    .tools
                    .schemas()
                    .into_iter()
                    .map(|s| ToolSchema {
                        name: s.name,
                        description: s.description,
                        input_schema: s.input_schema,
                    })
                    .collect(),
                system_prompt: Some(self.system_prompt.clone()),
            }
        };
        self.listener.on_request_start(&self.meta, &request_id);
        match self.provider.complete(req).await {
            Ok(resp) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.messages.push(ModelMessage {
                        role: Role::Assistant,
                        content: resp.content.clone(),
                    });
                    state.cumulative.add(&resp.usage);
                    state.last = Some(resp.usage);
                }
                self.listener.on_response(&self.meta, &request_id, &resp);
                Ok(resp)
            }
            Err(e) => {
                self.listener
                    .on_request_error(&self.meta, &request_id, &format!("{e:#}"));
                Err(e)
            }
        }
    }

    /// Record a user-role message without a model round trip.  Used when a
    /// tool ends the turn: the results must still enter the conversation so
    /// the next request keeps the shape the model expects.
    pub fn push_user_message(&self, msg: ModelMessage) {
        self.state.lock().unwrap().messages.push(msg);
    }

    /// Run every tool-use in `resp`, in the order the model emitted them,
    /// and return the matching tool-result items in that same order plus
    /// whether any executed tool ends the turn.
    ///
    /// Honors `turn`: tool-uses that have not started when it fires are
    /// synthesized as cancelled; the running tool observes its child token
    /// and returns best-effort output which is still included.
    pub async fn tool_result_contents(
        &self,
        turn: &CancellationToken,
        resp: &ModelResponse,
    ) -> (Vec<ContentItem>, bool) {
        let mut contents = Vec::new();
        let mut ends_turn = false;
        for (id, name, input) in resp.tool_uses() {
            if turn.is_cancelled() {
                contents.push(self.synthesize_cancel(id, name, input));
                continue;
            }
            let record = self.run_one_tool(turn, id, name, input).await;
            // ends_turn is advisory and applies even when the tool errored;
            // the error result still reaches the model on the next request.
            if self.tools.ends_turn(name) {
                ends_turn = true;
            }
            contents.push(ContentItem::ToolResult {
                tool_use_id: record.tool_call_id.clone(),
                content: vec![ContentItem::text(record.content.clone())],
                is_error: record.is_error,
            });
        }
        (contents, ends_turn)
    }

    /// Synthesize a cancelled result for every tool-use in `resp` without
    /// running anything.
    pub fn tool_result_cancel_contents(&self, resp: &ModelResponse) -> Vec<ContentItem> {
        resp.tool_uses()
            .into_iter()
            .map(|(id, name, input)| self.synthesize_cancel(id, name, input))
            .collect()
    }

    fn synthesize_cancel(&self, id: &str, name: &str, input: &serde_json::Value) -> ContentItem {
        let now = Utc::now();
        let record = ToolResultRecord {
            tool_call_id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
            content: CANCELLED_TOOL_USE.to_string(),
            is_error: true,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
        };
        self.listener.on_tool_result(&self.meta, &record);
        ContentItem::tool_result(id, CANCELLED_TOOL_USE, true)
    }

    async fn run_one_tool(
        &self,
        turn: &CancellationToken,
        id: &str,
        name: &str,
        input: &serde_json::Value,
    ) -> ToolResultRecord {
        self.listener.on_tool_call_start(&self.meta, id, name);
        let started_at = Utc::now();
        let start = Instant::now();

        let child = turn.child_token();
        self.running_tools
            .lock()
            .unwrap()
            .insert(id.to_string(), child.clone());
        let ctx = ToolContext {
            cancel: child,
            working_dir: self.working_dir.clone(),
        };
        let call = ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        };
        let output: ToolOutput = self.tools.execute(&ctx, &call).await;
        self.running_tools.lock().unwrap().remove(id);

        if output.is_error {
            debug!(tool = name, tool_call_id = id, "tool returned error");
        }
        let record = ToolResultRecord {
            tool_call_id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
            content: output.content,
            is_error: output.is_error,
            started_at,
            finished_at: Utc::now(),
            elapsed: start.elapsed(),
        };
        self.listener.on_tool_result(&self.meta, &record);
        record
    }

    /// Cancel exactly one running tool; the rest of the turn continues.
    /// Returns false when no tool with that id is running.
    pub fn cancel_tool_use(&self, tool_call_id: &str, cause: &str) -> bool {
        match self.running_tools.lock().unwrap().get(tool_call_id) {
            Some(token) => {
                info!(tool_call_id, cause, "cancelling tool use");
                token.cancel();
                true
            }
            None => {
                warn!(tool_call_id, "cancel requested for unknown tool use");
                false
            }
        }
    }

    /// Peek: has the cumulative usage crossed the budget?
    pub fn over_budget(&self) -> Option<BudgetError> {
        let state = self.state.lock().unwrap();
        let spent = state.cumulative;
        if state.budget.max_dollars > 0.0 && spent.cost_usd > state.budget.max_dollars {
            return Some(BudgetError::Dollars {
                spent: spent.cost_usd,
                max: state.budget.max_dollars,
            });
        }
        if state.budget.max_tokens > 0 && spent.total_tokens() > state.budget.max_tokens {
            return Some(BudgetError::Tokens {
                spent: spent.total_tokens(),
                max: state.budget.max_tokens,
            });
        }
        None
    }

    /// Restore the budget to its original value.  The cumulative counters
    /// keep running; the budget is measured against spending since reset.
    pub fn reset_budget(&self) {
        let mut state = self.state.lock().unwrap();
        // Re-anchor: pretend the original budget starts from current spend.
        let spent = state.cumulative;
        let original = state.original_budget;
        state.budget = Budget {
            max_dollars: if original.max_dollars > 0.0 {
                spent.cost_usd + original.max_dollars
            } else {
                0.0
            },
            max_tokens: if original.max_tokens > 0 {
                spent.total_tokens() + original.max_tokens
            } else {
                0
            },
        };
    }

    pub fn original_budget(&self) -> Budget {
        self.state.lock().unwrap().original_budget
    }

    pub fn set_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .extra
            .insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().extra.get(key).cloned()
    }

    pub fn cumulative_usage(&self) -> Usage {
        self.state.lock().unwrap().cumulative
    }

    pub fn last_usage(&self) -> Option<Usage> {
        self.state.lock().unwrap().last
    }

    /// A child conversation that inherits the full message history but has
    /// its own id, a replacement system prompt, and fresh usage counters.
    /// Its messages are attributed to the parent through `parent_id` so the
    /// store can hide them.
    pub fn sub_convo_with_history(&self, system_prompt: impl Into<String>) -> Conversation {
        let state = self.state.lock().unwrap();
        Conversation {
            meta: ConvoMeta {
                id: Uuid::new_v4().to_string(),
                parent_id: Some(self.meta.id.clone()),
            },
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            system_prompt: system_prompt.into(),
            working_dir: self.working_dir.clone(),
            listener: self.listener.clone(),
            state: Mutex::new(ConvoState {
                messages: state.messages.clone(),
                budget: state.budget,
                original_budget: state.original_budget,
                cumulative: Usage::default(),
                last: None,
                extra: state.extra.clone(),
            }),
            running_tools: Mutex::new(HashMap::new()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
