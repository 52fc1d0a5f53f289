// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod convo;
mod gitobs;
mod message;
mod ports;
mod state;
mod store;

pub use agent::{Agent, AgentParams, Autoformatter, CANCEL_INSTRUCTION};
pub use compact::compaction_threshold;
pub use convo::{
    Budget, BudgetError, Conversation, ConvoListener, ConvoMeta, ToolResultRecord,
    CANCELLED_TOOL_USE,
};
pub use gitobs::{
    format_git_log, parse_git_log, DiffStats, GitCommit, GitObservation, GitObserver,
    GitObserverParams,
};
pub use message::{AgentMessage, MessageType, ToolCallRef};
pub use ports::{PortEvent, PortEventKind, PortListener, PortMonitor};
pub use state::{AgentState, StateError, StateMachine, Transition};
pub use store::{MessageIterator, MessageStore};
