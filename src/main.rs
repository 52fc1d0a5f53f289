// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Headless driver for the otto agent loop.
//!
//! Reads user messages from stdin (one per line), enqueues them, and prints
//! history to stdout as it streams from a subscriber.  The model backend is
//! the built-in echo mock unless a real provider is wired in by an embedding
//! application; the binary exists to exercise the loop end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use otto_core::{Agent, AgentParams, MessageType};
use otto_model::EchoProvider;
use otto_tools::ToolRegistry;

#[derive(Parser, Debug)]
#[command(name = "otto", version, about = "A headless LLM coding-agent loop")]
struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Git repository to observe for new commits
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Slug forming the remote branch name; empty disables pushing
    #[arg(long)]
    slug: Option<String>,

    /// Remote URL to force-push the working branch to
    #[arg(long)]
    remote: Option<String>,

    /// Maximum spend in USD before the turn is interrupted (0 = unlimited)
    #[arg(long)]
    max_dollars: Option<f64>,

    /// Log to stderr (also honours the OTTO_LOG env filter)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    // Quiet by default so stdout stays pipeable; OTTO_LOG or --verbose
    // enables stderr logging.
    let filter = match std::env::var("OTTO_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) if verbose => EnvFilter::new("info"),
        Err(_) => EnvFilter::new("off"),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = otto_config::load(cli.config.as_deref())?;
    if let Some(repo) = cli.repo {
        config.git.repo_dir = Some(repo);
    }
    if let Some(slug) = cli.slug {
        config.git.slug = slug;
    }
    if let Some(remote) = cli.remote {
        config.git.remote_url = Some(remote);
    }
    if let Some(max_dollars) = cli.max_dollars {
        config.budget.max_dollars = max_dollars;
    }

    let agent = Agent::new(AgentParams {
        config,
        provider: Arc::new(EchoProvider),
        tools: Arc::new(ToolRegistry::new()),
        system_prompt: "You are otto, a coding agent working in the user's repository."
            .to_string(),
        formatter: None,
    })
    .await
    .context("building agent")?;
    tracing::info!(conversation = %agent.conversation_id(), "agent ready");

    let cancel = CancellationToken::new();
    tokio::spawn(agent.clone().run(cancel.clone()));

    // Printer: follow history from the beginning.
    let printer = {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut it = agent.subscribe(0, cancel);
            while let Some(msg) = it.next().await {
                if msg.hide_output {
                    continue;
                }
                let tag = match msg.kind {
                    MessageType::User => "you",
                    MessageType::Agent => "otto",
                    MessageType::Tool => "tool",
                    MessageType::Error => "error",
                    MessageType::Budget => "budget",
                    MessageType::Commit => "commit",
                    MessageType::Auto => "auto",
                    MessageType::Compact => "compact",
                    MessageType::Port => "port",
                };
                println!("[{tag}] {}", msg.content);
                if let Some(duration) = msg.turn_duration {
                    println!("[turn took {}]", humantime::format_duration(duration));
                }
            }
        })
    };

    // Ctrl-C cancels the current turn; a second one exits.
    {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interrupted = false;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if interrupted {
                    cancel.cancel();
                    return;
                }
                interrupted = true;
                agent.cancel_turn("user pressed ctrl-c");
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        agent.enqueue_user_message(text);
    }

    cancel.cancel();
    let _ = printer.await;
    Ok(())
}
