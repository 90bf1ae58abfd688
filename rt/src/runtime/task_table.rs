// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-actor RPC bookkeeping: who is running what for whom, and where
//! replies go.
//!
//! Two maps, both keyed by `(peer-uid, call-id)`:
//! - [`RpcTasks`] is the callee-side record of inbound invocations - the
//!   cancel handle, the target's name (for diagnostics and the
//!   cancel-of-cancel guard), and the done-latch a canceller awaits.
//! - [`ReplyQueues`] is the caller-side reply inbox - a bounded queue the
//!   message loop routes into with a blocking send, so a slow consumer
//!   throttles the socket read and, through it, the remote producer.
//!
//! Every mutation is a suspension-free critical section: the std mutexes are
//! never held across an `.await`.

use std::{collections::HashMap, sync::Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{CallId, Packet, Uid, runtime::scope::Latch};

/// Routing key: globally unique per invocation.
pub type TaskKey = (Uid, CallId);

/// Bounded capacity of each reply inbox. When full, the message loop blocks,
/// which stops reading the socket, which stops the producer at the OS
/// buffer - no drops.
pub const REPLY_QUEUE_CAPACITY: usize = 64;

/// Callee-side record of one inbound invocation.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    /// Cancel handle that terminates the invocation.
    pub cancel: CancellationToken,
    /// `ns.func` of the invoked target.
    pub func: String,
    /// Set by the invocation runner on exit; a canceller awaits this to know
    /// teardown finished.
    pub done: Latch,
}

/// The callee-side invocation table.
#[derive(Debug)]
pub struct RpcTasks {
    inner: StdMutex<HashMap<TaskKey, TaskEntry>>,
    /// Set whenever the table is empty.
    quiescent: Latch,
}

impl Default for RpcTasks {
    fn default() -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
            quiescent: Latch::new_set(),
        }
    }
}

impl RpcTasks {
    pub fn insert(&self, key: TaskKey, entry: TaskEntry) {
        let mut table = self.inner.lock().unwrap();
        table.insert(key, entry);
        self.quiescent.clear();
    }

    /// Remove an entry. Does **not** set its done-latch - that is the
    /// invocation runner's job.
    pub fn remove(&self, key: &TaskKey) -> Option<TaskEntry> {
        let mut table = self.inner.lock().unwrap();
        let entry = table.remove(key);
        if table.is_empty() {
            self.quiescent.set();
        }
        entry
    }

    #[must_use]
    pub fn entry(&self, key: &TaskKey) -> Option<TaskEntry> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<TaskKey> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Keys of invocations routed through the given peer.
    #[must_use]
    pub fn keys_for_peer(&self, peer: &Uid) -> Vec<TaskKey> {
        self.inner
            .lock()
            .unwrap()
            .keys()
            .filter(|(uid, _)| uid == peer)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.inner.lock().unwrap().is_empty() }

    /// Wait until no invocation is in flight.
    pub async fn wait_quiescent(&self) { self.quiescent.wait().await; }
}

struct QueueSlot {
    tx: mpsc::Sender<Packet>,
    /// Present until the caller claims its receive end.
    rx: Option<mpsc::Receiver<Packet>>,
}

/// Caller-side reply inboxes.
///
/// A slot is created lazily on first reference - either when a reply arrives
/// or when the caller pre-creates it before sending `cmd`. Pre-creation
/// avoids the race where a fast reply beats the caller recording its queue.
/// The message loop never removes slots while routing; they go away when the
/// caller is done with them or the owning peer's channels are released.
#[derive(Default)]
pub struct ReplyQueues {
    inner: StdMutex<HashMap<TaskKey, QueueSlot>>,
}

impl std::fmt::Debug for ReplyQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().unwrap().len();
        f.debug_struct("ReplyQueues").field("len", &len).finish()
    }
}

impl ReplyQueues {
    fn get_or_create<'a>(
        table: &'a mut HashMap<TaskKey, QueueSlot>,
        key: &TaskKey,
    ) -> &'a mut QueueSlot {
        table.entry(key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
            QueueSlot { tx, rx: Some(rx) }
        })
    }

    /// The producer end for the message loop. Cloned out so the map lock is
    /// released before the (potentially blocking) send.
    #[must_use]
    pub fn sender(&self, key: &TaskKey) -> mpsc::Sender<Packet> {
        let mut table = self.inner.lock().unwrap();
        Self::get_or_create(&mut table, key).tx.clone()
    }

    /// Claim the receive end (pre-creating the slot if needed). Returns
    /// `None` if some caller already claimed it.
    #[must_use]
    pub fn take_receiver(&self, key: &TaskKey) -> Option<mpsc::Receiver<Packet>> {
        let mut table = self.inner.lock().unwrap();
        Self::get_or_create(&mut table, key).rx.take()
    }

    /// Drop a single slot (caller-side cleanup once a call concludes).
    pub fn remove(&self, key: &TaskKey) {
        self.inner.lock().unwrap().remove(key);
    }

    /// Drop every slot owned by `peer`. Dropping the producer ends
    /// terminates the receivers, which callers surface as
    /// `transport-closed`. Returns how many slots went away.
    pub fn remove_peer(&self, peer: &Uid) -> usize {
        let mut table = self.inner.lock().unwrap();
        let before = table.len();
        table.retain(|(uid, _), _| uid != peer);
        before - table.len()
    }
}

#[cfg(test)]
mod tests_task_table {
    use pretty_assertions::assert_eq;

    use super::*;

    fn key_for(name: &str) -> TaskKey { (Uid::generate(name), CallId::fresh()) }

    #[tokio::test]
    async fn test_quiescent_latch_tracks_table() {
        let tasks = RpcTasks::default();
        assert!(tasks.is_empty());
        tasks.wait_quiescent().await; // empty table: returns immediately

        let key = key_for("peer");
        tasks.insert(key.clone(), TaskEntry {
            cancel: CancellationToken::new(),
            func: "mod.frob".into(),
            done: Latch::new(),
        });
        assert!(!tasks.is_empty());

        let entry = tasks.remove(&key).unwrap();
        assert_eq!(entry.func, "mod.frob");
        tasks.wait_quiescent().await;
    }

    #[tokio::test]
    async fn test_queue_pre_creation_beats_fast_reply() {
        let queues = ReplyQueues::default();
        let key = key_for("peer");

        // Caller pre-creates and claims the receive end.
        let mut rx = queues.take_receiver(&key).unwrap();
        // A second claim yields nothing.
        assert!(queues.take_receiver(&key).is_none());

        // The loop's sender goes to the same slot.
        let tx = queues.sender(&key);
        tx.send(Packet::Stop { cid: key.1.clone() }).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Packet::Stop { .. })));
    }

    #[tokio::test]
    async fn test_remove_peer_terminates_receivers() {
        let queues = ReplyQueues::default();
        let peer = Uid::generate("peer");
        let key = (peer.clone(), CallId::fresh());

        let mut rx = queues.take_receiver(&key).unwrap();
        assert_eq!(queues.remove_peer(&peer), 1);
        // Producer end gone: the receiver terminates.
        assert!(rx.recv().await.is_none());
    }
}
