// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user opts out
/// need a named function.
fn default_true() -> bool {
    true
}

fn default_inbox_capacity() -> usize {
    128
}

fn default_compaction_ratio() -> f64 {
    0.94
}

fn default_transition_history() -> usize {
    256
}

fn default_branch_prefix() -> String {
    "otto/".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_event_buffer() -> usize {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Working directory handed to tools.  Defaults to the process cwd.
    pub working_dir: Option<PathBuf>,
    /// Capacity of the user-message inbox.  Enqueues beyond this are dropped
    /// from the loop's perspective but still recorded in history.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Fraction of the model's context window at which the conversation is
    /// compacted.  Overridable via the OTTO_COMPACTION_RATIO env var.
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f64,
    /// Number of state-machine transitions retained for observability.
    #[serde(default = "default_transition_history")]
    pub transition_history: usize,
    /// System prompt override.  When unset the caller-provided prompt is used.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            inbox_capacity: default_inbox_capacity(),
            compaction_ratio: default_compaction_ratio(),
            transition_history: default_transition_history(),
            system_prompt: None,
        }
    }
}

/// Spending limits for one conversation.  Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_dollars: f64,
    #[serde(default)]
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Repository to observe for new commits.  Unset disables git observation.
    pub repo_dir: Option<PathBuf>,
    /// Short user-visible identifier; forms the remote branch name.
    /// An empty slug disables pushing entirely.
    #[serde(default)]
    pub slug: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Plain git URL to force-push the working branch to.
    pub remote_url: Option<String>,
    /// Tag anchoring "new work since".  Created against HEAD when missing.
    pub base_tag: Option<String>,
    /// Fallback base ref used when no base tag is configured.
    pub upstream: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_dir: None,
            slug: String::new(),
            branch_prefix: default_branch_prefix(),
            remote_url: None,
            base_tag: None,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Number of port events retained in the ring buffer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Fan port events out into history as hidden port-type messages.
    #[serde(default = "default_true")]
    pub emit_messages: bool,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            event_buffer: default_event_buffer(),
            emit_messages: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let c = Config::default();
        assert_eq!(c.agent.inbox_capacity, 128);
        assert_eq!(c.agent.compaction_ratio, 0.94);
        assert_eq!(c.git.branch_prefix, "otto/");
        assert!(c.git.slug.is_empty());
        assert_eq!(c.ports.poll_interval_secs, 5);
        assert_eq!(c.ports.event_buffer, 100);
        assert!(c.ports.enabled);
    }

    #[test]
    fn budget_defaults_to_unlimited() {
        let b = BudgetConfig::default();
        assert_eq!(b.max_dollars, 0.0);
        assert_eq!(b.max_tokens, 0);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let c: Config = serde_yaml::from_str("git:\n  slug: demo\n").unwrap();
        assert_eq!(c.git.slug, "demo");
        assert_eq!(c.git.branch_prefix, "otto/");
        assert_eq!(c.agent.inbox_capacity, 128);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let mut c = Config::default();
        c.git.slug = "fix-everything".into();
        c.budget.max_dollars = 12.5;
        let text = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.git.slug, "fix-everything");
        assert_eq!(back.budget.max_dollars, 12.5);
    }
}
