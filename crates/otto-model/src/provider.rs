// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::{CompletionRequest, ModelResponse};

/// Contract every model backend must implement.
///
/// The agent assumes nothing about transport: a provider may speak HTTP,
/// a local socket, or return canned responses (the mock providers).  One
/// `complete` call is one full request/response round trip; cancellation is
/// handled by the caller dropping the future.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_name(&self) -> &str;
    /// Total input-context window of the model, in tokens.  Drives the
    /// compaction threshold.
    fn context_window(&self) -> u64;
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ModelResponse>;
}
