// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{AgentMessage, MessageType};
use crate::store::MessageStore;

/// Listening sockets below this port are infrastructure noise and ignored.
const RESERVED_PORT_CEILING: u16 = 1024;

/// Processes whose environment carries this marker are excluded from
/// observation (the supervisor sets it on itself and helpers).
const IGNORE_ENV_MARKER: &str = "OTTO_IGNORE_PORTS=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortEventKind {
    Opened,
    Closed,
}

/// One listening socket, keyed by `proto:addr:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortListener {
    pub proto: String,
    pub addr: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl PortListener {
    pub fn new(proto: impl Into<String>, addr: impl Into<String>, port: u16) -> Self {
        Self {
            proto: proto.into(),
            addr: addr.into(),
            port,
            pid: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.proto, self.addr, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEvent {
    pub kind: PortEventKind,
    pub listener: PortListener,
    pub timestamp: DateTime<Utc>,
}

struct MonitorState {
    last: HashMap<String, PortListener>,
    events: VecDeque<PortEvent>,
    /// The first poll only establishes the baseline; pre-existing listeners
    /// never produce events.
    primed: bool,
}

/// Background poller diffing the listening-socket set at a fixed interval.
///
/// Events are retained in a bounded ring and optionally fanned out into the
/// message store as hidden port-type messages.
pub struct PortMonitor {
    interval: Duration,
    buffer_cap: usize,
    inner: Mutex<MonitorState>,
}

impl PortMonitor {
    pub fn new(interval: Duration, buffer_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            interval,
            buffer_cap: buffer_cap.max(1),
            inner: Mutex::new(MonitorState {
                last: HashMap::new(),
                events: VecDeque::new(),
                primed: false,
            }),
        })
    }

    /// Apply one observed listener set: diff against the previous set, stamp
    /// and retain the resulting events, and return them.
    pub fn record(&self, listeners: Vec<PortListener>) -> Vec<PortEvent> {
        let now = Utc::now();
        let current: HashMap<String, PortListener> =
            listeners.into_iter().map(|l| (l.key(), l)).collect();

        let mut state = self.inner.lock().unwrap();
        let mut events = Vec::new();
        if state.primed {
            for (key, listener) in &current {
                if !state.last.contains_key(key) {
                    events.push(PortEvent {
                        kind: PortEventKind::Opened,
                        listener: listener.clone(),
                        timestamp: now,
                    });
                }
            }
            for (key, listener) in &state.last {
                if !current.contains_key(key) {
                    events.push(PortEvent {
                        kind: PortEventKind::Closed,
                        listener: listener.clone(),
                        timestamp: now,
                    });
                }
            }
        }
        state.primed = true;
        state.last = current;
        for event in &events {
            if state.events.len() == self.buffer_cap {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
        }
        events
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<PortEvent> {
        self.inner.lock().unwrap().events.iter().cloned().collect()
    }

    /// Retained events strictly newer than `since`.
    pub fn events_since(&self, since: DateTime<Utc>) -> Vec<PortEvent> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect()
    }

    /// Enumerate the system's listeners once and record the set.
    pub async fn poll_once(&self) -> Vec<PortEvent> {
        match enumerate_listeners().await {
            Ok(listeners) => self.record(listeners),
            Err(e) => {
                debug!("port enumeration failed: {e:#}");
                Vec::new()
            }
        }
    }

    /// Poll forever at the configured interval, with a per-tick deadline
    /// equal to that interval.  Events optionally become hidden port-type
    /// messages in `store`.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        store: Option<Arc<MessageStore>>,
        conversation_id: String,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let events = match tokio::time::timeout(self.interval, self.poll_once()).await {
                Ok(events) => events,
                Err(_) => {
                    warn!("port poll exceeded tick deadline");
                    continue;
                }
            };
            if let Some(store) = &store {
                for event in &events {
                    let verb = match event.kind {
                        PortEventKind::Opened => "opened",
                        PortEventKind::Closed => "closed",
                    };
                    let mut msg = AgentMessage::new(
                        MessageType::Port,
                        format!("Port {verb}: {}", event.listener.key()),
                    );
                    msg.hide_output = true;
                    msg.conversation_id = conversation_id.clone();
                    store.append(msg);
                }
            }
        }
    }
}

/// Enumerate listening sockets: `ss` first, `/proc/net` as fallback.
async fn enumerate_listeners() -> anyhow::Result<Vec<PortListener>> {
    let listeners = match ss_listeners().await {
        Ok(listeners) => listeners,
        Err(e) => {
            debug!("ss unavailable ({e:#}); falling back to /proc/net");
            proc_net_listeners()?
        }
    };
    Ok(filter_listeners(listeners))
}

/// Drop reserved ports, the supervising process itself, and processes that
/// opted out via the environment marker.
fn filter_listeners(listeners: Vec<PortListener>) -> Vec<PortListener> {
    let own_pid = std::process::id();
    let ignored = ignored_pids();
    listeners
        .into_iter()
        .filter(|l| l.port >= RESERVED_PORT_CEILING)
        .filter(|l| match l.pid {
            Some(pid) => pid != own_pid && !ignored.contains(&pid),
            None => true,
        })
        .collect()
}

/// Pids whose environment contains the ignore marker.
fn ignored_pids() -> HashSet<u32> {
    let mut pids = HashSet::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        if environ
            .split(|b| *b == 0)
            .any(|var| var.starts_with(IGNORE_ENV_MARKER.as_bytes()))
        {
            pids.insert(pid);
        }
    }
    pids
}

async fn ss_listeners() -> anyhow::Result<Vec<PortListener>> {
    let output = tokio::process::Command::new("ss")
        .args(["-tulpnH"])
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "ss failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_ss_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ss -tulpnH` output.  Lines that do not look like listener rows are
/// skipped rather than treated as errors.
fn parse_ss_output(raw: &str) -> Vec<PortListener> {
    let pid_re = Regex::new(r"pid=(\d+)").expect("static regex");
    let mut listeners = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let proto = fields[0];
        let local = fields[4];
        let Some((addr, port)) = split_addr_port(local) else {
            continue;
        };
        let pid = fields
            .get(6)
            .and_then(|f| pid_re.captures(f))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        listeners.push(PortListener {
            proto: proto.to_string(),
            addr,
            port,
            pid,
        });
    }
    listeners
}

/// Split "0.0.0.0:8080", "[::]:8080" or "*:8080" into address and port.
fn split_addr_port(local: &str) -> Option<(String, u16)> {
    let (addr, port) = local.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let addr = addr.trim_matches(|c| c == '[' || c == ']');
    let addr = if addr.is_empty() || addr == "0.0.0.0" || addr == "::" {
        "*".to_string()
    } else {
        addr.to_string()
    };
    Some((addr, port))
}

/// Read listeners from `/proc/net/{tcp,tcp6,udp,udp6}`.
fn proc_net_listeners() -> anyhow::Result<Vec<PortListener>> {
    let mut listeners = Vec::new();
    for (path, proto, listen_state) in [
        ("/proc/net/tcp", "tcp", "0A"),
        ("/proc/net/tcp6", "tcp", "0A"),
        ("/proc/net/udp", "udp", "07"),
        ("/proc/net/udp6", "udp", "07"),
    ] {
        let Ok(raw) = std::fs::read_to_string(path) else {
            continue;
        };
        listeners.extend(parse_proc_net(&raw, proto, listen_state));
    }
    if listeners.is_empty() {
        anyhow::bail!("no /proc/net tables readable");
    }
    Ok(listeners)
}

/// Parse one `/proc/net` table; rows whose state does not match
/// `listen_state` (LISTEN for tcp, UNCONN for udp) are skipped.
fn parse_proc_net(raw: &str, proto: &str, listen_state: &str) -> Vec<PortListener> {
    let mut listeners = Vec::new();
    for line in raw.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if !fields[3].eq_ignore_ascii_case(listen_state) {
            continue;
        }
        let Some((hex_addr, hex_port)) = fields[1].rsplit_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(hex_port, 16) else {
            continue;
        };
        listeners.push(PortListener {
            proto: proto.to_string(),
            addr: decode_proc_addr(hex_addr),
            port,
            pid: None,
        });
    }
    listeners
}

/// Decode a /proc/net hex address.  IPv4 is little-endian; an all-zero
/// address of either family renders as "*" (wildcard bind).
fn decode_proc_addr(hex: &str) -> String {
    if hex.chars().all(|c| c == '0') {
        return "*".to_string();
    }
    if hex.len() == 8 {
        if let Ok(bits) = u32::from_str_radix(hex, 16) {
            let octets = bits.to_le_bytes();
            return format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        }
    }
    // IPv6 (or unparseable): key on the raw hex; stable and unique.
    hex.to_ascii_lowercase()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
