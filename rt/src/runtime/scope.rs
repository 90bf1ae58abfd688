// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task-tree plumbing: [`Latch`] events and [`TaskGroup`] scopes.
//!
//! Cancellation here is strictly cooperative. A task observes its group's
//! token only at suspension points where it explicitly `select!`s on it;
//! shutdown-critical regions simply never do (that is the whole "shield"
//! mechanism - there is no preemption to defend against).

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// A level-triggered event: `set()` wakes every current and future `wait()`.
/// Can be cleared and re-set (the peer-table and rpc-quiescence latches
/// toggle over an actor's lifetime).
#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Latch {
    fn default() -> Self { Self::new() }
}

impl Latch {
    /// A latch that starts unset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// A latch that starts set.
    #[must_use]
    pub fn new_set() -> Self {
        Self {
            tx: Arc::new(watch::channel(true).0),
        }
    }

    pub fn set(&self) { self.tx.send_replace(true); }

    pub fn clear(&self) { self.tx.send_replace(false); }

    #[must_use]
    pub fn is_set(&self) -> bool { *self.tx.borrow() }

    /// Suspend until the latch is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A named scope owning a set of tasks: spawn into it, cancel it as a unit,
/// wait for it to drain. The trio-nursery shape expressed with tokio's
/// [`TaskTracker`] + [`CancellationToken`] pair.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    name: &'static str,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskGroup {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str { self.name }

    /// The group's cancel token. Spawned work that wants to die with the
    /// group selects on this (or a [`CancellationToken::child_token`] of it).
    #[must_use]
    pub fn token(&self) -> &CancellationToken { &self.token }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Cancel every task in the group (cooperatively - each task unwinds at
    /// its next token-observing suspension point).
    pub fn cancel(&self) {
        tracing::debug!(group = self.name, "cancelling task group");
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Wait for every task in the group to finish. (Spawning remains
    /// possible while waiting; the group is drained when the count hits
    /// zero.)
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests_scope {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_latch_wakes_waiters() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!latch.is_set());
        latch.set();
        waiter.await.unwrap();
        assert!(latch.is_set());
    }

    #[tokio::test]
    async fn test_latch_set_before_wait() {
        let latch = Latch::new_set();
        // Must not suspend at all.
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_group_cancel_unwinds_tasks() {
        let group = TaskGroup::new("test");
        let token = group.token().clone();
        group.spawn(async move {
            token.cancelled().await;
        });
        group.spawn(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        });
        group.cancel();
        // Both tasks drain: one observed the token, one ran to completion.
        tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .unwrap();
    }
}
