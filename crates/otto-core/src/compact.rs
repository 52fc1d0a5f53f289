// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

/// Replacement system prompt for the summary subconversation.  Scoped to
/// summary production so the model does not continue the task.
pub(crate) const SUMMARY_SYSTEM_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
You will be shown a conversation between a user and the agent, including \
tool calls and their results. Produce a comprehensive summary that lets the \
agent continue the work in a fresh conversation. Preserve all technical \
details, decisions, file names, error messages, and unfinished items. Do \
not call tools and do not continue the task; reply with the summary only.";

/// The user-role request sent to the summary subconversation.
pub(crate) const SUMMARY_REQUEST: &str = "\
Summarize our conversation so far so that work can continue from the \
summary alone. Include: the task and its constraints, what has been done, \
key decisions and why, files touched, and what remains.";

/// Input-token count at which compaction triggers for a given context
/// window: `ceil(window × ratio)`.
pub fn compaction_threshold(context_window: u64, ratio: f64) -> u64 {
    (context_window as f64 * ratio).ceil() as u64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_ceiling_of_fraction() {
        assert_eq!(compaction_threshold(1000, 0.94), 940);
        assert_eq!(compaction_threshold(1001, 0.94), 941); // 940.94 rounds up
        assert_eq!(compaction_threshold(200_000, 0.94), 188_000);
    }

    #[test]
    fn threshold_at_full_ratio_equals_window() {
        assert_eq!(compaction_threshold(1234, 1.0), 1234);
    }
}
