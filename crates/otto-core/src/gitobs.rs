// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Log format: hash, subject and body separated (and terminated) by NUL so
/// arbitrary commit message content survives parsing.
pub const GIT_LOG_FORMAT: &str = "%H%x00%s%x00%b%x00";

/// Maximum commits read per observation.
const LOG_LIMIT: &str = "100";

/// Maximum branch-rename attempts when the remote refuses a push.
const MAX_PUSH_RETRIES: u32 = 10;

/// One commit surfaced to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub subject: String,
    pub body: String,
    /// Remote branch this commit's head was pushed to, when pushing is
    /// configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushed_branch: Option<String>,
}

/// Added/removed line counts from the base ref to the working head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub lines_added: u64,
    pub lines_removed: u64,
}

/// Result of one observation: commits never emitted before (plus the current
/// head whenever it changed) and auxiliary notes for history.
#[derive(Debug, Default)]
pub struct GitObservation {
    pub commits: Vec<GitCommit>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GitObserverParams {
    pub repo_dir: PathBuf,
    /// Ref anchoring "new work since"; resolved to a hash at construction.
    /// When it does not resolve it is created as a tag against HEAD.
    pub base_ref: String,
    /// Ref observed for new commits; normally HEAD.
    pub working_ref: String,
    pub branch_prefix: String,
    /// Empty slug disables pushing entirely.
    pub slug: String,
    pub remote_url: Option<String>,
}

struct GitState {
    base_hash: String,
    last_head: Option<String>,
    retry_num: u32,
    seen: HashSet<String>,
    diff: Option<DiffStats>,
}

/// Detects new commits since a fixed base and force-pushes the working
/// branch, renaming on remote conflicts.
///
/// The state mutex is held across a full observation so the seen set and
/// the rename counter stay consistent.
pub struct GitObserver {
    params: GitObserverParams,
    state: Mutex<GitState>,
}

impl GitObserver {
    /// Resolve (or create) the base ref and build the observer.
    pub async fn new(params: GitObserverParams) -> anyhow::Result<Self> {
        let base_hash = match run_git(
            &params.repo_dir,
            &["rev-parse", "--verify", &format!("{}^{{commit}}", params.base_ref)],
        )
        .await
        {
            Ok(out) => out.trim().to_string(),
            Err(_) => {
                run_git(&params.repo_dir, &["tag", "-f", &params.base_ref, "HEAD"])
                    .await
                    .with_context(|| format!("creating base tag {}", params.base_ref))?;
                run_git(&params.repo_dir, &["rev-parse", "HEAD"])
                    .await?
                    .trim()
                    .to_string()
            }
        };
        debug!(base = %base_hash, repo = %params.repo_dir.display(), "git observer anchored");
        Ok(Self {
            params,
            state: Mutex::new(GitState {
                base_hash,
                last_head: None,
                retry_num: 0,
                seen: HashSet::new(),
                diff: None,
            }),
        })
    }

    /// Cached diff stats from the last observation.
    pub async fn diff_stats(&self) -> Option<DiffStats> {
        self.state.lock().await.diff
    }

    /// The branch name pushes target for a given rename count.
    /// Empty when the slug is empty (pushing disabled).
    fn branch_name(&self, retry: u32) -> String {
        if self.params.slug.is_empty() {
            return String::new();
        }
        if retry == 0 {
            format!("{}{}", self.params.branch_prefix, self.params.slug)
        } else {
            format!("{}{}{}", self.params.branch_prefix, self.params.slug, retry)
        }
    }

    /// One observation: detect a head change, refresh diff stats, collect
    /// unseen commits, push when configured.
    pub async fn observe(&self) -> anyhow::Result<GitObservation> {
        let mut state = self.state.lock().await;
        let dir = &self.params.repo_dir;

        let head = run_git(dir, &["rev-parse", &self.params.working_ref])
            .await
            .context("resolving working ref")?
            .trim()
            .to_string();
        if state.last_head.as_deref() == Some(head.as_str()) {
            return Ok(GitObservation::default());
        }

        let range = format!("{}..{}", state.base_hash, head);
        match run_git(dir, &["diff", "--numstat", &range]).await {
            Ok(raw) => state.diff = Some(parse_numstat(&raw)),
            Err(e) => warn!("git diff failed: {e:#}"),
        }

        let format_arg = format!("--format={GIT_LOG_FORMAT}");
        let exclude = format!("^{}", state.base_hash);
        let raw = run_git(dir, &["log", "-n", LOG_LIMIT, &format_arg, &exclude, &head])
            .await
            .context("reading git log")?;

        let mut commits = Vec::new();
        for commit in parse_git_log(&raw) {
            // Re-emit only the moving head; everything else exactly once.
            if state.seen.contains(&commit.hash) && commit.hash != head {
                continue;
            }
            state.seen.insert(commit.hash.clone());
            commits.push(commit);
        }

        let mut notes = Vec::new();
        if let Some(remote) = self.params.remote_url.clone() {
            if !self.params.slug.is_empty() && !commits.is_empty() {
                self.push_head(&mut state, &remote, &head, &mut commits, &mut notes)
                    .await;
            }
        }

        state.last_head = Some(head);
        Ok(GitObservation { commits, notes })
    }

    /// Force-push `head` to the slug branch, renaming with a numeric suffix
    /// when the remote refuses to update a checked out branch.
    async fn push_head(
        &self,
        state: &mut GitState,
        remote: &str,
        head: &str,
        commits: &mut [GitCommit],
        notes: &mut Vec<String>,
    ) {
        let dir = &self.params.repo_dir;
        let start_retry = state.retry_num;
        let mut pushed: Option<String> = None;

        for _ in 0..MAX_PUSH_RETRIES {
            let branch = self.branch_name(state.retry_num);
            let refspec = format!("+{head}:refs/heads/{branch}");
            match run_git(dir, &["push", "--force", remote, &refspec]).await {
                Ok(_) => {
                    pushed = Some(branch);
                    break;
                }
                Err(e) if is_checked_out_refusal(&e) => {
                    debug!(branch = %branch, "remote refused push; renaming");
                    state.retry_num += 1;
                }
                Err(e) => {
                    warn!("git push failed: {e:#}");
                    notes.push(format!("Push to {branch} failed: {e:#}"));
                    return;
                }
            }
        }

        match pushed {
            Some(branch) => {
                if state.retry_num != start_retry {
                    notes.push(format!(
                        "Branch renamed from {} to {} because the remote refused to \
                         update a checked out branch.",
                        self.branch_name(start_retry),
                        branch
                    ));
                }
                for c in commits.iter_mut() {
                    if c.hash == head {
                        c.pushed_branch = Some(branch.clone());
                    }
                }
            }
            None => {
                notes.push(format!(
                    "Push abandoned after {MAX_PUSH_RETRIES} branch renames; the remote \
                     keeps refusing to update a checked out branch."
                ));
            }
        }
    }
}

fn is_checked_out_refusal(err: &anyhow::Error) -> bool {
    let text = err.to_string();
    text.contains("refusing to update checked out branch")
        || text.contains("branch is currently checked out")
}

/// Run one git subcommand in `dir`, returning stdout.  Inherits the caller's
/// cancellation scope: dropping the future kills the child process.
async fn run_git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse NUL-delimited `git log` output produced with [`GIT_LOG_FORMAT`].
pub fn parse_git_log(raw: &str) -> Vec<GitCommit> {
    let mut commits = Vec::new();
    let mut fields = raw.split('\0');
    loop {
        // Records are NUL-terminated; git inserts a newline between entries.
        let Some(hash) = fields.next() else { break };
        let hash = hash.trim_matches('\n').trim();
        if hash.is_empty() {
            break;
        }
        let subject = fields.next().unwrap_or("").to_string();
        let body = fields
            .next()
            .unwrap_or("")
            .trim_end_matches('\n')
            .to_string();
        commits.push(GitCommit {
            hash: hash.to_string(),
            subject,
            body,
            pushed_branch: None,
        });
    }
    commits
}

/// Inverse of [`parse_git_log`] for the canonical (trimmed) form.
pub fn format_git_log(commits: &[GitCommit]) -> String {
    commits
        .iter()
        .map(|c| format!("{}\0{}\0{}\0", c.hash, c.subject, c.body))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sum a `git diff --numstat` listing.  Binary files report "-" and count
/// as zero lines.
fn parse_numstat(raw: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let added = fields.next().and_then(|f| f.parse::<u64>().ok());
        let removed = fields.next().and_then(|f| f.parse::<u64>().ok());
        stats.lines_added += added.unwrap_or(0);
        stats.lines_removed += removed.unwrap_or(0);
    }
    stats
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str, subject: &str, body: &str) -> GitCommit {
        GitCommit {
            hash: hash.into(),
            subject: subject.into(),
            body: body.into(),
            pushed_branch: None,
        }
    }

    #[test]
    fn parse_then_format_round_trips() {
        let commits = vec![
            commit("aaa111", "first commit", "a body\nwith two lines"),
            commit("bbb222", "second: with \"quotes\" and\nnewlines in subject? no", ""),
        ];
        let formatted = format_git_log(&commits);
        assert_eq!(parse_git_log(&formatted), commits);
    }

    #[test]
    fn parse_handles_real_git_layout() {
        // git terminates each record with NUL and separates entries with \n.
        let raw = "aaa111\0subject one\0body one\n\0\nbbb222\0subject two\0\0";
        let commits = parse_git_log(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa111");
        assert_eq!(commits[0].body, "body one");
        assert_eq!(commits[1].hash, "bbb222");
        assert_eq!(commits[1].body, "");
    }

    #[test]
    fn parse_empty_log_is_empty() {
        assert!(parse_git_log("").is_empty());
        assert!(parse_git_log("\n").is_empty());
    }

    #[test]
    fn numstat_sums_and_skips_binary() {
        let raw = "10\t2\tsrc/a.rs\n3\t0\tsrc/b.rs\n-\t-\tassets/logo.png\n";
        let stats = parse_numstat(raw);
        assert_eq!(stats.lines_added, 13);
        assert_eq!(stats.lines_removed, 2);
    }

    #[test]
    fn refusal_detection_matches_git_wordings() {
        assert!(is_checked_out_refusal(&anyhow::anyhow!(
            "git push failed: refusing to update checked out branch: refs/heads/sketch/demo"
        )));
        assert!(is_checked_out_refusal(&anyhow::anyhow!(
            "remote: error: branch is currently checked out"
        )));
        assert!(!is_checked_out_refusal(&anyhow::anyhow!(
            "could not read from remote repository"
        )));
    }
}
