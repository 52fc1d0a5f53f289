// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::{AgentMessage, MessageType};

/// Append-only message history with multi-subscriber fanout.
///
/// One mutex guards both the history and the subscriber list so that a
/// subscriber can replay existing messages and register for live delivery
/// atomically — the canonical fix for the lost-update race between replay
/// and append.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    messages: Vec<Arc<AgentMessage>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Arc<AgentMessage>>>,
    next_subscriber_id: u64,
    /// Set at the top of each turn; used to stamp turn durations.
    turn_started_at: Option<Instant>,
    /// Index of the first message of the active conversation.  Advanced on
    /// compaction so UIs can elide pre-compaction content.
    first_message_index: usize,
}

impl MessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                messages: Vec::new(),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                turn_started_at: None,
                first_message_index: 0,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Arc<AgentMessage>> {
        self.inner.lock().unwrap().messages.get(idx).cloned()
    }

    /// Copy of the current history.
    pub fn snapshot(&self) -> Vec<Arc<AgentMessage>> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Mark the beginning of a turn for turn-duration stamping.
    pub fn begin_turn(&self) {
        self.inner.lock().unwrap().turn_started_at = Some(Instant::now());
    }

    pub fn first_message_index(&self) -> usize {
        self.inner.lock().unwrap().first_message_index
    }

    pub fn set_first_message_index(&self, idx: usize) {
        self.inner.lock().unwrap().first_message_index = idx;
    }

    /// Append one message: assign the next index, stamp the timestamp, fill
    /// derived fields, and hand it to every live subscriber.
    ///
    /// Every message created anywhere in the agent flows through here; there
    /// is no other path into history.
    pub fn append(&self, mut msg: AgentMessage) -> Arc<AgentMessage> {
        let mut inner = self.inner.lock().unwrap();
        msg.idx = inner.messages.len();
        if msg.timestamp.is_none() {
            msg.timestamp = Some(Utc::now());
        }
        // Tool messages without explicit content show their result text.
        if msg.kind == MessageType::Tool && msg.content.is_empty() {
            if let Some(result) = &msg.tool_result {
                msg.content = result.clone();
            }
        }
        if msg.end_of_turn && msg.kind == MessageType::Agent && msg.turn_duration.is_none() {
            if let Some(start) = inner.turn_started_at {
                msg.turn_duration = Some(start.elapsed());
            }
        }
        let msg = Arc::new(msg);
        inner.messages.push(msg.clone());
        // Unbounded senders never block; a closed receiver drops out here.
        inner.subscribers.retain(|id, tx| {
            let ok = tx.send(msg.clone()).is_ok();
            if !ok {
                debug!(subscriber = id, "dropping closed subscriber");
            }
            ok
        });
        msg
    }

    /// Subscribe starting at `from`.  The iterator replays existing history
    /// first and registers for live delivery only once it has caught up.
    pub fn subscribe(self: &Arc<Self>, from: usize, cancel: CancellationToken) -> MessageIterator {
        MessageIterator {
            store: self.clone(),
            next_idx: from,
            cancel,
            live: None,
            closed: false,
        }
    }

    fn register(&self, from: usize) -> Registration {
        let mut inner = self.inner.lock().unwrap();
        if from < inner.messages.len() {
            return Registration::Replay(inner.messages[from].clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id, tx);
        Registration::Live(id, rx)
    }

    fn deregister(&self, id: u64) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }
}

enum Registration {
    Replay(Arc<AgentMessage>),
    Live(u64, mpsc::UnboundedReceiver<Arc<AgentMessage>>),
}

/// Iterator over history in strict index order.
///
/// Must be closed (or dropped) to release its subscription; cancelling the
/// token passed to [`MessageStore::subscribe`] makes `next` return `None`
/// and deregisters.
pub struct MessageIterator {
    store: Arc<MessageStore>,
    next_idx: usize,
    cancel: CancellationToken,
    live: Option<(u64, mpsc::UnboundedReceiver<Arc<AgentMessage>>)>,
    closed: bool,
}

impl MessageIterator {
    /// Deliver the next message, blocking until one is available.  Returns
    /// `None` after close or cancellation.
    pub async fn next(&mut self) -> Option<Arc<AgentMessage>> {
        loop {
            if self.closed {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.close();
                return None;
            }
            if self.live.is_some() {
                let cancel = self.cancel.clone();
                let msg = {
                    let (_, rx) = self.live.as_mut().expect("live subscription checked");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        m = rx.recv() => m,
                    }
                };
                let Some(msg) = msg else {
                    self.close();
                    return None;
                };
                // A subscription from a future index skips messages below it.
                if msg.idx < self.next_idx {
                    continue;
                }
                // Any gap here is a fatal store invariant violation.
                assert_eq!(
                    msg.idx, self.next_idx,
                    "message store delivered out of order"
                );
                self.next_idx += 1;
                return Some(msg);
            }
            match self.store.register(self.next_idx) {
                Registration::Replay(msg) => {
                    self.next_idx += 1;
                    return Some(msg);
                }
                Registration::Live(id, rx) => {
                    self.live = Some((id, rx));
                }
            }
        }
    }

    /// Deregister and stop delivering.  Idempotent.
    pub fn close(&mut self) {
        if let Some((id, _)) = self.live.take() {
            self.store.deregister(id);
        }
        self.closed = true;
    }
}

impl Drop for MessageIterator {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AgentMessage, MessageType};

    fn user(text: &str) -> AgentMessage {
        AgentMessage::new(MessageType::User, text)
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let store = MessageStore::new();
        let a = store.append(user("a"));
        let b = store.append(user("b"));
        let c = store.append(user("c"));
        assert_eq!(a.idx, 0);
        assert_eq!(b.idx, 1);
        assert_eq!(c.idx, 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn append_stamps_timestamp_when_absent() {
        let store = MessageStore::new();
        let m = store.append(user("a"));
        assert!(m.timestamp.is_some());
    }

    #[test]
    fn tool_message_content_copied_from_result() {
        let store = MessageStore::new();
        let mut m = AgentMessage::new(MessageType::Tool, "");
        m.tool_result = Some("result text".into());
        let appended = store.append(m);
        assert_eq!(appended.content, "result text");
    }

    #[test]
    fn end_of_turn_agent_message_gets_turn_duration() {
        let store = MessageStore::new();
        store.begin_turn();
        let mut m = AgentMessage::new(MessageType::Agent, "done");
        m.end_of_turn = true;
        let appended = store.append(m);
        assert!(appended.turn_duration.is_some());
    }

    #[test]
    fn non_terminal_agent_message_has_no_turn_duration() {
        let store = MessageStore::new();
        store.begin_turn();
        let appended = store.append(AgentMessage::new(MessageType::Agent, "working"));
        assert!(appended.turn_duration.is_none());
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gaps_or_duplicates() {
        let store = MessageStore::new();
        store.append(user("m0"));
        store.append(user("m1"));

        let mut it = store.subscribe(0, CancellationToken::new());
        assert_eq!(it.next().await.unwrap().idx, 0);
        assert_eq!(it.next().await.unwrap().idx, 1);

        // Appends racing the switch to live mode must still arrive in order.
        let store2 = store.clone();
        let appender = tokio::spawn(async move {
            for i in 2..20 {
                store2.append(user(&format!("m{i}")));
            }
        });
        for i in 2..20 {
            assert_eq!(it.next().await.unwrap().idx, i);
        }
        appender.await.unwrap();
    }

    #[tokio::test]
    async fn two_full_drains_yield_identical_sequences() {
        let store = MessageStore::new();
        for i in 0..5 {
            store.append(user(&format!("m{i}")));
        }
        let drain = |store: Arc<MessageStore>| async move {
            let mut it = store.subscribe(0, CancellationToken::new());
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(it.next().await.unwrap().content.clone());
            }
            out
        };
        let first = drain(store.clone()).await;
        let second = drain(store.clone()).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cancellation_returns_none_and_deregisters() {
        let store = MessageStore::new();
        let cancel = CancellationToken::new();
        let mut it = store.subscribe(0, cancel.clone());

        let waiter = tokio::spawn(async move { it.next().await });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
        // The subscriber must be gone: appends find no receivers.
        store.append(user("after"));
        assert!(store.inner.lock().unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn close_removes_subscriber() {
        let store = MessageStore::new();
        let mut it = store.subscribe(0, CancellationToken::new());

        // Force registration by consuming past the end of history.
        let handle = tokio::spawn(async move {
            let _ = it.next().await;
            it
        });
        tokio::task::yield_now().await;
        store.append(user("wake"));
        let mut it = handle.await.unwrap();
        it.close();
        assert!(store.inner.lock().unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn subscribe_from_future_index_skips_earlier_messages() {
        let store = MessageStore::new();
        let mut it = store.subscribe(2, CancellationToken::new());
        let handle = tokio::spawn(async move { it.next().await });
        tokio::task::yield_now().await;
        store.append(user("m0"));
        store.append(user("m1"));
        store.append(user("m2"));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.idx, 2);
        assert_eq!(got.content, "m2");
    }

    #[test]
    fn first_message_index_tracks_compaction_marker() {
        let store = MessageStore::new();
        assert_eq!(store.first_message_index(), 0);
        store.append(user("a"));
        store.set_first_message_index(store.len());
        assert_eq!(store.first_message_index(), 1);
    }
}
