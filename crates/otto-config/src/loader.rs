// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/otto/config.yaml"));
    paths.push(PathBuf::from("/etc/otto/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/otto/config.yaml"));
        paths.push(home.join(".config/otto/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("otto/config.yaml"));
        paths.push(cfg.join("otto/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".otto/config.yaml"));
    paths.push(PathBuf::from(".otto/config.yml"));
    paths.push(PathBuf::from(".otto.yaml"));
    paths.push(PathBuf::from(".otto.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Env overrides consulted once at load time; no shared mutable state.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(raw) = std::env::var("OTTO_COMPACTION_RATIO") {
        match raw.parse::<f64>() {
            Ok(r) if r > 0.0 && r <= 1.0 => config.agent.compaction_ratio = r,
            _ => warn!(value = %raw, "ignoring invalid OTTO_COMPACTION_RATIO"),
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_without_files_returns_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.agent.inbox_capacity, 128);
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "otto.yaml",
            "git:\n  slug: demo\nbudget:\n  max_dollars: 5.0\n",
        );
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.git.slug, "demo");
        assert_eq!(config.budget.max_dollars, 5.0);
        // Untouched sections keep their defaults.
        assert_eq!(config.ports.poll_interval_secs, 5);
    }

    #[test]
    fn merge_yaml_is_deep() {
        let mut dst: serde_yaml::Value =
            serde_yaml::from_str("agent:\n  inbox_capacity: 64\n").unwrap();
        let src: serde_yaml::Value =
            serde_yaml::from_str("agent:\n  compaction_ratio: 0.8\n").unwrap();
        merge_yaml(&mut dst, src);
        let config: Config = serde_yaml::from_value(dst).unwrap();
        assert_eq!(config.agent.inbox_capacity, 64);
        assert_eq!(config.agent.compaction_ratio, 0.8);
    }
}
