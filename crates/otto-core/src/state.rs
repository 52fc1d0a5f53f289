// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Closed set of turn-orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Ready,
    WaitingForUserInput,
    SendingToLlm,
    ProcessingLlmResponse,
    ToolUseRequested,
    CheckingForCancellation,
    RunningTool,
    CheckingGitCommits,
    RunningAutoformatters,
    CheckingBudget,
    Compacting,
    GatheringAdditionalMessages,
    SendingToolResults,
    EndOfTurn,
    Cancelled,
    BudgetExceeded,
    Error,
}

impl AgentState {
    /// Terminal states end a turn; the next turn starts from
    /// [`AgentState::WaitingForUserInput`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::EndOfTurn
                | AgentState::Cancelled
                | AgentState::BudgetExceeded
                | AgentState::Error
        )
    }
}

/// Exactly the transitions induced by the turn lifecycle.  Everything else
/// is rejected by [`StateMachine::transition`].
fn allowed(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    if from.is_terminal() && to == WaitingForUserInput {
        return true;
    }
    matches!(
        (from, to),
        (Ready, WaitingForUserInput)
            | (WaitingForUserInput, SendingToLlm)
            | (WaitingForUserInput, Cancelled)
            | (SendingToLlm, ProcessingLlmResponse)
            | (SendingToLlm, Error)
            | (ProcessingLlmResponse, EndOfTurn)
            | (ProcessingLlmResponse, ToolUseRequested)
            | (ProcessingLlmResponse, Error)
            | (ToolUseRequested, CheckingForCancellation)
            | (CheckingForCancellation, RunningTool)
            | (CheckingForCancellation, Cancelled)
            | (RunningTool, CheckingGitCommits)
            | (RunningTool, Cancelled)
            | (RunningTool, Error)
            | (CheckingGitCommits, RunningAutoformatters)
            | (CheckingGitCommits, CheckingBudget)
            | (RunningAutoformatters, CheckingBudget)
            | (CheckingBudget, BudgetExceeded)
            | (CheckingBudget, Compacting)
            | (CheckingBudget, GatheringAdditionalMessages)
            | (Compacting, EndOfTurn)
            | (Compacting, Error)
            | (GatheringAdditionalMessages, SendingToolResults)
            | (Cancelled, SendingToolResults)
            | (SendingToolResults, ProcessingLlmResponse)
            | (SendingToolResults, EndOfTurn)
            | (SendingToolResults, Cancelled)
            | (SendingToolResults, Error)
    )
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// True when the transition bypassed validation
    pub forced: bool,
}

struct MachineInner {
    current: AgentState,
    previous: Option<AgentState>,
    entered_at: DateTime<Utc>,
    history: VecDeque<Transition>,
    listeners: HashMap<u64, mpsc::Sender<Transition>>,
    next_listener_id: u64,
}

/// Serialized state holder with validated transitions, a bounded transition
/// log, and listener fanout.
///
/// Listener delivery happens outside the mutex so a slow listener can never
/// block a state change; a full listener buffer loses that event.
pub struct StateMachine {
    inner: Mutex<MachineInner>,
    history_cap: usize,
}

impl StateMachine {
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                current: AgentState::Ready,
                previous: None,
                entered_at: Utc::now(),
                history: VecDeque::new(),
                listeners: HashMap::new(),
                next_listener_id: 0,
            }),
            history_cap: history_cap.max(1),
        }
    }

    pub fn current(&self) -> AgentState {
        self.inner.lock().unwrap().current
    }

    pub fn previous(&self) -> Option<AgentState> {
        self.inner.lock().unwrap().previous
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().entered_at
    }

    /// Validated transition.  Rejected transitions leave the state unchanged
    /// and return [`StateError::InvalidTransition`].
    pub fn transition(
        &self,
        to: AgentState,
        description: impl Into<String>,
    ) -> Result<(), StateError> {
        self.apply(to, description.into(), false)
    }

    /// Transition without validation.  Used for cancellation and error
    /// recovery; the record is marked as forced.
    pub fn force_transition(&self, to: AgentState, description: impl Into<String>) {
        // Ignore the result: unforced validation never runs on this path.
        let _ = self.apply(to, description.into(), true);
    }

    fn apply(&self, to: AgentState, description: String, forced: bool) -> Result<(), StateError> {
        let (record, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            let from = inner.current;
            if !forced && !allowed(from, to) {
                return Err(StateError::InvalidTransition { from, to });
            }
            let record = Transition {
                from,
                to,
                description,
                timestamp: Utc::now(),
                forced,
            };
            inner.previous = Some(from);
            inner.current = to;
            inner.entered_at = record.timestamp;
            if inner.history.len() == self.history_cap {
                inner.history.pop_front();
            }
            inner.history.push_back(record.clone());
            let listeners: Vec<(u64, mpsc::Sender<Transition>)> = inner
                .listeners
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            (record, listeners)
        };

        debug!(from = ?record.from, to = ?record.to, forced, "state transition");

        let mut gone = Vec::new();
        for (id, tx) in listeners {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(listener = id, "state listener lagging; dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            for id in gone {
                inner.listeners.remove(&id);
            }
        }
        Ok(())
    }

    /// Copy of the retained transition log, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.inner.lock().unwrap().history.iter().cloned().collect()
    }

    /// Receive a copy of every future transition.  Dropping the receiver
    /// removes the listener.
    pub fn subscribe(&self) -> mpsc::Receiver<Transition> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, tx);
        rx
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_ready() {
        let sm = StateMachine::new(16);
        assert_eq!(sm.current(), AgentState::Ready);
        assert!(sm.previous().is_none());
    }

    #[test]
    fn valid_transition_updates_state() {
        let sm = StateMachine::new(16);
        sm.transition(AgentState::WaitingForUserInput, "start")
            .unwrap();
        assert_eq!(sm.current(), AgentState::WaitingForUserInput);
        assert_eq!(sm.previous(), Some(AgentState::Ready));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let sm = StateMachine::new(16);
        let err = sm.transition(AgentState::RunningTool, "nope").unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(sm.current(), AgentState::Ready);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn force_transition_bypasses_validation_and_is_marked() {
        let sm = StateMachine::new(16);
        sm.force_transition(AgentState::Cancelled, "user hit cancel");
        assert_eq!(sm.current(), AgentState::Cancelled);
        let history = sm.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].forced);
    }

    #[test]
    fn terminal_states_return_to_waiting() {
        for terminal in [
            AgentState::EndOfTurn,
            AgentState::Cancelled,
            AgentState::BudgetExceeded,
            AgentState::Error,
        ] {
            let sm = StateMachine::new(16);
            sm.force_transition(terminal, "end");
            sm.transition(AgentState::WaitingForUserInput, "next turn")
                .unwrap();
            assert_eq!(sm.current(), AgentState::WaitingForUserInput);
        }
    }

    #[test]
    fn full_no_tool_turn_path_is_valid() {
        let sm = StateMachine::new(32);
        for (to, desc) in [
            (AgentState::WaitingForUserInput, "start"),
            (AgentState::SendingToLlm, "input"),
            (AgentState::ProcessingLlmResponse, "response"),
            (AgentState::EndOfTurn, "no tools"),
        ] {
            sm.transition(to, desc).unwrap();
        }
        assert_eq!(sm.current(), AgentState::EndOfTurn);
    }

    #[test]
    fn full_tool_turn_path_is_valid() {
        let sm = StateMachine::new(64);
        for to in [
            AgentState::WaitingForUserInput,
            AgentState::SendingToLlm,
            AgentState::ProcessingLlmResponse,
            AgentState::ToolUseRequested,
            AgentState::CheckingForCancellation,
            AgentState::RunningTool,
            AgentState::CheckingGitCommits,
            AgentState::RunningAutoformatters,
            AgentState::CheckingBudget,
            AgentState::GatheringAdditionalMessages,
            AgentState::SendingToolResults,
            AgentState::ProcessingLlmResponse,
            AgentState::EndOfTurn,
        ] {
            sm.transition(to, "step").unwrap();
        }
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest() {
        let sm = StateMachine::new(2);
        sm.force_transition(AgentState::Error, "one");
        sm.transition(AgentState::WaitingForUserInput, "two")
            .unwrap();
        sm.transition(AgentState::SendingToLlm, "three").unwrap();
        let history = sm.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].description, "two");
        assert_eq!(history[1].description, "three");
    }

    #[test]
    fn history_contains_no_unforced_invalid_transitions() {
        let sm = StateMachine::new(32);
        sm.transition(AgentState::WaitingForUserInput, "ok").unwrap();
        let _ = sm.transition(AgentState::Compacting, "bad");
        sm.force_transition(AgentState::Error, "forced");
        for t in sm.history() {
            assert!(t.forced || allowed(t.from, t.to));
        }
    }

    #[tokio::test]
    async fn listeners_receive_transitions() {
        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();
        sm.transition(AgentState::WaitingForUserInput, "start")
            .unwrap();
        let t = rx.recv().await.unwrap();
        assert_eq!(t.to, AgentState::WaitingForUserInput);
    }

    #[tokio::test]
    async fn closed_listener_is_removed() {
        let sm = StateMachine::new(16);
        let rx = sm.subscribe();
        drop(rx);
        sm.transition(AgentState::WaitingForUserInput, "start")
            .unwrap();
        assert!(sm.inner.lock().unwrap().listeners.is_empty());
    }
}
