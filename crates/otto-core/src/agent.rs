// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use otto_config::Config;
use otto_model::{
    ContentItem, ModelMessage, ModelProvider, ModelResponse, StopReason, Usage,
};
use otto_tools::ToolRegistry;

use crate::compact::{compaction_threshold, SUMMARY_REQUEST, SUMMARY_SYSTEM_PROMPT};
use crate::convo::{Budget, Conversation, ConvoListener, ConvoMeta, ToolResultRecord};
use crate::gitobs::{DiffStats, GitObserver, GitObserverParams};
use crate::message::{AgentMessage, MessageType, ToolCallRef};
use crate::ports::PortMonitor;
use crate::state::{AgentState, StateMachine};
use crate::store::{MessageIterator, MessageStore};

/// Appended to the outgoing payload of a cancelled turn so the model stops
/// pursuing its plan and waits for the next instruction.
pub const CANCEL_INSTRUCTION: &str =
    "The user canceled the current operation. Stop working on it: do not request \
     more tool calls, acknowledge briefly, and wait for the next instruction.";

/// Mechanical post-commit checks (formatters, lint fixers) run when exactly
/// one new commit lands during a turn.  The core only consumes the textual
/// output; non-empty output is surfaced to the model and to history.
#[async_trait]
pub trait Autoformatter: Send + Sync {
    async fn run(&self, cancel: &CancellationToken, repo_dir: &Path) -> anyhow::Result<String>;
}

/// Everything needed to build an [`Agent`].
pub struct AgentParams {
    pub config: Config,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub system_prompt: String,
    pub formatter: Option<Arc<dyn Autoformatter>>,
}

/// Cancellation scope of one turn, published so external callers can cancel
/// the turn without tearing down the loop.
#[derive(Clone)]
struct TurnHandle {
    token: CancellationToken,
    cause: Arc<Mutex<Option<String>>>,
}

impl TurnHandle {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Idempotent; only the first cause is retained.
    fn cancel(&self, cause: impl Into<String>) {
        let mut guard = self.cause.lock().unwrap();
        if guard.is_none() {
            *guard = Some(cause.into());
        }
        drop(guard);
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cause(&self) -> String {
        self.cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "turn cancelled".to_string())
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Calls currently in flight, tracked for the UI.
#[derive(Default)]
struct Outstanding {
    llm_calls: HashSet<String>,
    /// tool-call id → tool name
    tool_calls: HashMap<String, String>,
}

/// The listener capability handed to every conversation.  Owns references
/// to the store and the outstanding-calls map — never the agent itself —
/// which keeps ownership one-way (agent → conversation → listener refs).
struct AgentListener {
    store: Arc<MessageStore>,
    tools: Arc<ToolRegistry>,
    outstanding: Mutex<Outstanding>,
}

impl AgentListener {
    fn base_message(&self, kind: MessageType, content: String, meta: &ConvoMeta) -> AgentMessage {
        let mut msg = AgentMessage::new(kind, content);
        msg.conversation_id = meta.id.clone();
        msg.parent_conversation_id = meta.parent_id.clone();
        msg.hide_output = meta.is_subconversation();
        msg
    }
}

impl ConvoListener for AgentListener {
    fn on_request_start(&self, _meta: &ConvoMeta, request_id: &str) {
        self.outstanding
            .lock()
            .unwrap()
            .llm_calls
            .insert(request_id.to_string());
    }

    fn on_response(&self, meta: &ConvoMeta, request_id: &str, resp: &ModelResponse) {
        self.outstanding.lock().unwrap().llm_calls.remove(request_id);
        let mut msg = self.base_message(MessageType::Agent, resp.text(), meta);
        msg.tool_calls = resp
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| ToolCallRef {
                name: name.to_string(),
                input: input.to_string(),
                tool_call_id: id.to_string(),
            })
            .collect();
        msg.usage = Some(resp.usage);
        // Subconversations never end the primary turn.  A response without
        // tool use ends the turn; with tool use it ends only when a
        // requested tool declares ends-turn semantics.
        msg.end_of_turn = if meta.is_subconversation() {
            false
        } else if msg.tool_calls.is_empty() {
            true
        } else {
            msg.tool_calls.iter().any(|tc| self.tools.ends_turn(&tc.name))
        };
        self.store.append(msg);
    }

    fn on_request_error(&self, _meta: &ConvoMeta, request_id: &str, error: &str) {
        self.outstanding.lock().unwrap().llm_calls.remove(request_id);
        warn!(request_id, "model request failed: {error}");
    }

    fn on_tool_call_start(&self, _meta: &ConvoMeta, tool_call_id: &str, name: &str) {
        self.outstanding
            .lock()
            .unwrap()
            .tool_calls
            .insert(tool_call_id.to_string(), name.to_string());
    }

    fn on_tool_result(&self, meta: &ConvoMeta, record: &ToolResultRecord) {
        self.outstanding
            .lock()
            .unwrap()
            .tool_calls
            .remove(&record.tool_call_id);
        let mut msg = self.base_message(MessageType::Tool, String::new(), meta);
        msg.tool_name = Some(record.name.clone());
        msg.tool_input = Some(record.input.clone());
        msg.tool_result = Some(record.content.clone());
        msg.tool_error = record.is_error;
        msg.tool_call_id = Some(record.tool_call_id.clone());
        msg.start_time = Some(record.started_at);
        msg.end_time = Some(record.finished_at);
        msg.elapsed = Some(record.elapsed);
        self.store.append(msg);
    }
}

/// The agent: a long-lived loop that turns user messages into model round
/// trips and tool executions, observing git and network side effects.
///
/// External actors influence a turn only through the inbox, the published
/// turn cancellation scope, and the subscribe API.
pub struct Agent {
    config: Config,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    working_dir: PathBuf,
    store: Arc<MessageStore>,
    state: StateMachine,
    listener: Arc<AgentListener>,
    /// Replaced atomically on compaction.
    convo: RwLock<Arc<Conversation>>,
    inbox_tx: mpsc::Sender<String>,
    inbox_rx: AsyncMutex<mpsc::Receiver<String>>,
    /// The active turn's cancellation handle, when a turn is running.
    turn: Mutex<Option<TurnHandle>>,
    git: Option<GitObserver>,
    ports: Arc<PortMonitor>,
    formatter: Option<Arc<dyn Autoformatter>>,
}

impl Agent {
    pub async fn new(params: AgentParams) -> anyhow::Result<Arc<Self>> {
        let config = params.config;
        let working_dir = match &config.agent.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving working directory")?,
        };

        let store = MessageStore::new();
        let listener = Arc::new(AgentListener {
            store: store.clone(),
            tools: params.tools.clone(),
            outstanding: Mutex::new(Outstanding::default()),
        });
        let budget = Budget {
            max_dollars: config.budget.max_dollars,
            max_tokens: config.budget.max_tokens,
        };
        let convo = Conversation::new(
            params.provider.clone(),
            params.tools.clone(),
            params.system_prompt.clone(),
            working_dir.clone(),
            budget,
            listener.clone(),
        );

        let git = match &config.git.repo_dir {
            Some(repo_dir) => {
                let base_ref = config
                    .git
                    .base_tag
                    .clone()
                    .or_else(|| config.git.upstream.clone())
                    .unwrap_or_else(|| "HEAD".to_string());
                Some(
                    GitObserver::new(GitObserverParams {
                        repo_dir: repo_dir.clone(),
                        base_ref,
                        working_ref: "HEAD".to_string(),
                        branch_prefix: config.git.branch_prefix.clone(),
                        slug: config.git.slug.clone(),
                        remote_url: config.git.remote_url.clone(),
                    })
                    .await?,
                )
            }
            None => None,
        };

        let (inbox_tx, inbox_rx) = mpsc::channel(config.agent.inbox_capacity.max(100));
        let ports = PortMonitor::new(
            Duration::from_secs(config.ports.poll_interval_secs.max(1)),
            config.ports.event_buffer,
        );
        let state = StateMachine::new(config.agent.transition_history);

        Ok(Arc::new(Self {
            provider: params.provider,
            tools: params.tools,
            system_prompt: params.system_prompt,
            working_dir,
            store,
            state,
            listener,
            convo: RwLock::new(Arc::new(convo)),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
            turn: Mutex::new(None),
            git,
            ports,
            formatter: params.formatter,
            config,
        }))
    }

    // ── Public operations ─────────────────────────────────────────────────────

    /// Record a user message in history and hand it to the loop.  Never
    /// blocks; when the loop is gone (or the inbox is full) the message is
    /// still recorded.
    pub fn enqueue_user_message(&self, text: impl Into<String>) {
        let text = text.into();
        let mut msg = AgentMessage::new(MessageType::User, text.clone());
        msg.conversation_id = self.conversation_id();
        self.store.append(msg);
        if let Err(e) = self.inbox_tx.try_send(text) {
            debug!("inbox unavailable, message recorded only: {e}");
        }
    }

    /// Cancel the current turn with a cause.  Idempotent within a turn; a
    /// no-op when no turn is active.
    pub fn cancel_turn(&self, cause: impl Into<String>) {
        let cause = cause.into();
        let handle = self.turn.lock().unwrap().clone();
        match handle {
            Some(turn) => {
                info!(cause = %cause, "cancelling turn");
                turn.cancel(cause.clone());
                self.state
                    .force_transition(AgentState::Cancelled, format!("cancel_turn: {cause}"));
            }
            None => debug!("cancel_turn with no active turn"),
        }
    }

    /// Cancel exactly one running tool; the rest of the turn continues.
    pub fn cancel_tool_use(&self, tool_call_id: &str, cause: &str) -> bool {
        self.current_convo().cancel_tool_use(tool_call_id, cause)
    }

    /// Iterate history in strict index order starting at `from`; replays
    /// existing messages, then follows live appends.
    pub fn subscribe(&self, from: usize, cancel: CancellationToken) -> MessageIterator {
        self.store.subscribe(from, cancel)
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    pub fn ports(&self) -> &Arc<PortMonitor> {
        &self.ports
    }

    pub async fn diff_stats(&self) -> Option<DiffStats> {
        match &self.git {
            Some(observer) => observer.diff_stats().await,
            None => None,
        }
    }

    pub fn cumulative_usage(&self) -> Usage {
        self.current_convo().cumulative_usage()
    }

    pub fn last_usage(&self) -> Option<Usage> {
        self.current_convo().last_usage()
    }

    /// Id of the active conversation (changes on compaction).
    pub fn conversation_id(&self) -> String {
        self.current_convo().meta().id.clone()
    }

    /// Tool calls currently running, as (tool-call id, tool name) pairs.
    pub fn outstanding_tool_calls(&self) -> Vec<(String, String)> {
        self.listener
            .outstanding
            .lock()
            .unwrap()
            .tool_calls
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect()
    }

    /// Number of model requests currently in flight (0 or 1 per turn).
    pub fn outstanding_llm_calls(&self) -> usize {
        self.listener.outstanding.lock().unwrap().llm_calls.len()
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    /// Run turns forever.  Cancelling `cancel` ends the loop after the
    /// current turn's scope unwinds; each turn runs on a child scope.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.ports.enabled {
            let store = self.config.ports.emit_messages.then(|| self.store.clone());
            tokio::spawn(self.ports.clone().run(
                cancel.child_token(),
                store,
                self.conversation_id(),
            ));
        }
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let turn = TurnHandle::new(&cancel);
            *self.turn.lock().unwrap() = Some(turn.clone());
            self.process_turn(&cancel, &turn).await;
            *self.turn.lock().unwrap() = None;
        }
    }

    /// Attempt a validated transition; a concurrent forced cancellation can
    /// legitimately invalidate one, which is logged and ignored.
    fn step(&self, to: AgentState, description: &str) {
        if let Err(e) = self.state.transition(to, description) {
            warn!("{e}");
        }
    }

    fn current_convo(&self) -> Arc<Conversation> {
        self.convo.read().unwrap().clone()
    }

    fn append_error(&self, convo: &Conversation, text: impl Into<String>) {
        let mut msg = AgentMessage::new(MessageType::Error, text);
        msg.conversation_id = convo.meta().id.clone();
        self.store.append(msg);
    }

    /// Drive one turn through its lifecycle: block for input, round-trip
    /// with the model, execute requested tools, observe side effects, and
    /// terminate in one of the terminal states.
    async fn process_turn(&self, loop_cancel: &CancellationToken, turn: &TurnHandle) {
        self.step(AgentState::WaitingForUserInput, "turn start");

        let first = {
            let mut rx = self.inbox_rx.lock().await;
            tokio::select! {
                biased;
                _ = loop_cancel.cancelled() => return,
                _ = turn.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            }
        };
        let mut texts = vec![first];
        {
            let mut rx = self.inbox_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                texts.push(msg);
            }
        }

        self.store.begin_turn();
        self.step(
            AgentState::SendingToLlm,
            &format!("submitting {} user message(s)", texts.len()),
        );
        let mut payload = ModelMessage::user_texts(texts);

        loop {
            let convo = self.current_convo();
            let send = tokio::select! {
                biased;
                _ = turn.cancelled() => None,
                r = convo.send_message(payload) => Some(r),
            };
            let resp = match send {
                None => {
                    // Cancelled while the request was in flight; no response
                    // exists, so the turn exits cleanly.
                    self.append_error(&convo, turn.cause());
                    self.state
                        .force_transition(AgentState::Cancelled, "cancelled during model call");
                    return;
                }
                Some(Err(e)) => {
                    self.append_error(&convo, format!("model request failed: {e:#}"));
                    self.state
                        .force_transition(AgentState::Error, "model request failed");
                    return;
                }
                Some(Ok(resp)) => resp,
            };
            self.step(AgentState::ProcessingLlmResponse, "model response received");

            if resp.stop_reason != StopReason::ToolUse {
                self.step(AgentState::EndOfTurn, "no tool use");
                self.observe_git().await;
                return;
            }

            self.step(AgentState::ToolUseRequested, "model requested tools");
            self.step(AgentState::CheckingForCancellation, "pre-execution check");

            let mut cancelled = turn.is_cancelled();
            let mut ends_turn = false;
            let mut items = if cancelled {
                self.step(AgentState::Cancelled, "cancelled before tool execution");
                self.append_error(&convo, turn.cause());
                convo.tool_result_cancel_contents(&resp)
            } else {
                self.step(AgentState::RunningTool, "executing tool calls");
                let (contents, et) = convo.tool_result_contents(turn.token(), &resp).await;
                ends_turn = et;
                if turn.is_cancelled() {
                    cancelled = true;
                    self.state.force_transition(
                        AgentState::Cancelled,
                        "cancelled during tool execution",
                    );
                    self.append_error(&convo, turn.cause());
                }
                contents
            };

            if !cancelled {
                self.step(AgentState::CheckingGitCommits, "scanning for new commits");
                let new_commits = self.observe_git().await;
                if new_commits == 1 {
                    self.step(AgentState::RunningAutoformatters, "one new commit");
                    if let Some(output) = self.run_autoformatter(turn).await {
                        items.push(ContentItem::text(output));
                    }
                }

                self.step(AgentState::CheckingBudget, "checking budget");
                if let Some(err) = convo.over_budget() {
                    let mut msg = AgentMessage::new(MessageType::Budget, err.to_string());
                    msg.conversation_id = convo.meta().id.clone();
                    self.store.append(msg);
                    convo.reset_budget();
                    // Record the tool results so the next request keeps the
                    // message shape the model expects.
                    convo.push_user_message(ModelMessage::user_items(items));
                    self.step(AgentState::BudgetExceeded, "budget exceeded");
                    return;
                }

                if self.compaction_needed(&convo) {
                    self.step(AgentState::Compacting, "context near limit");
                    match self.compact().await {
                        Ok(()) => self.step(AgentState::EndOfTurn, "compaction finished"),
                        Err(e) => {
                            self.append_error(&convo, format!("compaction failed: {e:#}"));
                            self.state
                                .force_transition(AgentState::Error, "compaction failed");
                        }
                    }
                    return;
                }

                self.step(AgentState::GatheringAdditionalMessages, "draining inbox");
                let mut rx = self.inbox_rx.lock().await;
                while let Ok(msg) = rx.try_recv() {
                    items.push(ContentItem::text(msg));
                }
            }

            if cancelled {
                items.push(ContentItem::text(CANCEL_INSTRUCTION));
            }
            self.step(AgentState::SendingToolResults, "returning tool results");
            payload = ModelMessage::user_items(items);

            if ends_turn && !cancelled {
                // The turn terminates without another round trip, but the
                // results still enter the conversation.
                convo.push_user_message(payload);
                self.step(AgentState::EndOfTurn, "tool ended the turn");
                self.observe_git().await;
                return;
            }

            if cancelled {
                // Deliver the cancel payload so the model acknowledges; the
                // acknowledgment reaches history through the listener.
                let send = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => None,
                    r = convo.send_message(payload) => Some(r),
                };
                if let Some(Err(e)) = send {
                    warn!("cancel acknowledgment failed: {e:#}");
                }
                self.step(AgentState::Cancelled, "turn cancelled");
                return;
            }
            // Otherwise: next round trip with the assembled payload.
        }
    }

    // ── Observations ──────────────────────────────────────────────────────────

    /// Run the git observer, surfacing notes as auto messages and new
    /// commits as one commit message.  Returns the new-commit count.
    async fn observe_git(&self) -> usize {
        let Some(observer) = &self.git else { return 0 };
        let convo_id = self.conversation_id();
        match observer.observe().await {
            Ok(observation) => {
                for note in &observation.notes {
                    let mut msg = AgentMessage::new(MessageType::Auto, note.clone());
                    msg.conversation_id = convo_id.clone();
                    self.store.append(msg);
                }
                if !observation.commits.is_empty() {
                    let mut lines = vec!["New commits:".to_string()];
                    for commit in &observation.commits {
                        let short = &commit.hash[..commit.hash.len().min(8)];
                        match &commit.pushed_branch {
                            Some(branch) => lines.push(format!(
                                "{short} {} (pushed to {branch})",
                                commit.subject
                            )),
                            None => lines.push(format!("{short} {}", commit.subject)),
                        }
                    }
                    let mut msg = AgentMessage::new(MessageType::Commit, lines.join("\n"));
                    msg.commits = observation.commits.clone();
                    msg.conversation_id = convo_id;
                    self.store.append(msg);
                }
                observation.commits.len()
            }
            Err(e) => {
                warn!("git observation failed: {e:#}");
                0
            }
        }
    }

    /// Run the external formatter capability; non-empty output becomes an
    /// auto message and is returned for inclusion in the next payload.
    async fn run_autoformatter(&self, turn: &TurnHandle) -> Option<String> {
        let formatter = self.formatter.as_ref()?;
        let repo_dir = self.config.git.repo_dir.clone()?;
        match formatter.run(turn.token(), &repo_dir).await {
            Ok(output) if !output.trim().is_empty() => {
                let mut msg = AgentMessage::new(MessageType::Auto, output.clone());
                msg.conversation_id = self.conversation_id();
                self.store.append(msg);
                Some(output)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("autoformatter failed: {e:#}");
                None
            }
        }
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn compaction_needed(&self, convo: &Conversation) -> bool {
        let Some(last) = convo.last_usage() else {
            return false;
        };
        let window = convo.context_window();
        if window == 0 {
            return false;
        }
        last.total_input() >= compaction_threshold(window, self.config.agent.compaction_ratio)
    }

    /// Summarize the conversation through a child conversation, then replace
    /// the facade with a fresh one seeded with the summary.  Cumulative
    /// usage counters survive the replacement.
    async fn compact(&self) -> anyhow::Result<()> {
        let convo = self.current_convo();
        let snapshot = convo.cumulative_usage();
        let last = convo.last_usage().unwrap_or_default();
        let window = convo.context_window();

        let sub = convo.sub_convo_with_history(SUMMARY_SYSTEM_PROMPT);
        let resp = sub
            .send_message(ModelMessage::user(SUMMARY_REQUEST))
            .await
            .context("generating compaction summary")?;
        let summary = resp.text();

        // The replacement carries the pre-compaction snapshot verbatim; the
        // summary subconversation's own spend does not enter the counters.
        let fresh = Conversation::new(
            self.provider.clone(),
            self.tools.clone(),
            self.system_prompt.clone(),
            self.working_dir.clone(),
            convo.original_budget(),
            self.listener.clone(),
        )
        .with_cumulative_usage(snapshot);
        *self.convo.write().unwrap() = Arc::new(fresh);
        self.store.set_first_message_index(self.store.len());

        let mut msg = AgentMessage::new(
            MessageType::Compact,
            format!(
                "Context compacted: {} of {} input tokens were in use; \
                 the conversation was replaced with a summary.",
                last.total_input(),
                window
            ),
        );
        msg.usage = Some(last);
        msg.conversation_id = self.conversation_id();
        self.store.append(msg);

        // One call records the user-visible summary message and seeds the
        // inbox so the next turn starts from it.
        self.enqueue_user_message(format!("Here is a summary of our previous work: {summary}"));
        info!(
            tokens_before = last.total_input(),
            "conversation compacted"
        );
        Ok(())
    }
}
