// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The cooperative-scheduler bridge: run tasks on a *second* event loop
//! while keeping the actor core's cancellation and error semantics.
//!
//! An actor launched in "bridged" mode hosts application code that belongs
//! to another tokio runtime (its own reactor, its own scheduler - the
//! [`HostLoop`]). A bridged invocation links a core-side task with a
//! host-side task through a pair of in-memory channels
//! ([`LinkedTaskChannel`]): `send`, `receive`, `aclose`, `wait_complete`.
//!
//! Contract:
//! - a cancellation on the core side is translated into a cancellation of
//!   the host task (and vice versa: a host task observing its token stops
//!   the core side with `bridge-cancelled`);
//! - a host task failure surfaces on the core side with its original error
//!   kind preserved;
//! - closure of either side closes the other;
//! - on completion the host task is always awaited, so the host loop never
//!   reports orphans.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::runtime::{errors::{UserError, kind}, scope::Latch};

/// Capacity of each direction of the bridge.
const BRIDGE_QUEUE_CAPACITY: usize = 64;

/// Failures crossing the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The bridged task was cancelled (on either side).
    #[error("bridge task was cancelled")]
    Cancelled,

    /// The host task failed; the original kind is preserved.
    #[error("bridge task failed: [{kind}] {message}")]
    Host { kind: String, message: String },

    /// The linked channel is closed and no failure was recorded.
    #[error("bridge channel closed")]
    Closed,
}

impl BridgeError {
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Cancelled => kind::BRIDGE_CANCELLED,
            Self::Host { kind, .. } => kind,
            Self::Closed => kind::BRIDGE_CANCELLED,
        }
    }

    fn from_user(err: UserError) -> Self {
        Self::Host {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// A dedicated second event loop on its own OS thread. This is what "a
/// bridged actor" runs its host-native tasks on.
#[derive(Debug)]
pub struct HostLoop {
    handle: Handle,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HostLoop {
    /// Spin up the loop thread.
    ///
    /// # Errors
    ///
    /// Thread or runtime construction failures.
    pub fn spawn() -> std::io::Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("bridge-host-loop".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(%err, "could not build host loop runtime");
                        return;
                    }
                };
                handle_tx.send(runtime.handle().clone()).ok();
                runtime.block_on(async {
                    shutdown_rx.await.ok();
                });
            })?;

        let handle = handle_rx.recv().map_err(|_| {
            std::io::Error::other("host loop thread died during startup")
        })?;
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn handle(&self) -> &Handle { &self.handle }
}

impl Drop for HostLoop {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

/// The host task's end of the bridge.
#[derive(Debug)]
pub struct HostChannel<In, Out> {
    from_core: mpsc::Receiver<In>,
    to_core: mpsc::Sender<Out>,
    token: CancellationToken,
}

impl<In, Out> HostChannel<In, Out> {
    /// Next value from the core side; `None` when the core closed its send
    /// side.
    pub async fn recv(&mut self) -> Option<In> { self.from_core.recv().await }

    /// Push one value to the core side.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Closed`] when the core side is gone.
    pub async fn send(&self, value: Out) -> Result<(), BridgeError> {
        self.to_core
            .send(value)
            .await
            .map_err(|_| BridgeError::Closed)
    }

    /// The token tripped when the core side cancels; host tasks observe it
    /// at their suspension points.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken { &self.token }
}

/// The core-side handle of a linked task: two-way synchronized message
/// passing with a task living on the host loop.
#[derive(Debug)]
pub struct LinkedTaskChannel<In, Out> {
    to_host: Option<mpsc::Sender<In>>,
    from_host: mpsc::Receiver<Out>,
    token: CancellationToken,
    complete: Latch,
    failure: Arc<StdMutex<Option<BridgeError>>>,
    join: Option<JoinHandle<()>>,
}

impl<In, Out> LinkedTaskChannel<In, Out> {
    /// Send a value to the host task.
    ///
    /// # Errors
    ///
    /// The recorded host failure, [`BridgeError::Cancelled`], or
    /// [`BridgeError::Closed`] when the host side is gone.
    pub async fn send(&self, value: In) -> Result<(), BridgeError> {
        let Some(sender) = &self.to_host else {
            return Err(BridgeError::Closed);
        };
        match sender.send(value).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.stored_failure()),
        }
    }

    /// Receive the next value from the host task.
    ///
    /// # Errors
    ///
    /// The recorded host failure (original kind preserved) or
    /// [`BridgeError::Cancelled`] when the link died cancelled.
    pub async fn receive(&mut self) -> Result<Out, BridgeError> {
        match self.from_host.recv().await {
            Some(value) => Ok(value),
            None => Err(self.stored_failure()),
        }
    }

    /// Close the core side. The host's `recv()` sees end-of-channel, the
    /// host task is cancelled if it keeps running, and it is awaited before
    /// this returns - the host loop never ends up with orphans.
    pub async fn aclose(&mut self) {
        self.to_host = None;
        self.token.cancel();
        self.wait_complete().await;
    }

    /// Await full completion of the host-side task.
    pub async fn wait_complete(&mut self) {
        self.complete.wait().await;
        if let Some(join) = self.join.take() {
            join.await.ok();
        }
    }

    /// Translate a core-side cancellation to the host loop.
    pub fn cancel(&self) { self.token.cancel(); }

    fn stored_failure(&self) -> BridgeError {
        self.failure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(if self.token.is_cancelled() {
                BridgeError::Cancelled
            } else {
                BridgeError::Closed
            })
    }
}

impl<In, Out> Drop for LinkedTaskChannel<In, Out> {
    fn drop(&mut self) {
        // Dropping the core side closes the other side too.
        self.token.cancel();
    }
}

/// Run one future on the host loop and await its single result from the
/// core side. Dropping the returned future cancels the host task.
///
/// # Errors
///
/// The host failure with its original kind, or [`BridgeError::Cancelled`].
pub async fn run_task<T, Fut>(host: &Handle, fut: Fut) -> Result<T, BridgeError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, UserError>> + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();
    let join = host.spawn(async move {
        tokio::select! {
            biased;
            () = task_token.cancelled() => Err(BridgeError::Cancelled),
            result = fut => result.map_err(BridgeError::from_user),
        }
    });

    // If we are dropped (core-side cancel), the guard trips the host task.
    let _guard = token.clone().drop_guard();

    match join.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(BridgeError::Host {
            kind: kind::PANIC.to_string(),
            message: "bridged task panicked".to_string(),
        }),
        Err(_) => Err(BridgeError::Cancelled),
    }
}

/// Open a linked channel to a task spawned on the host loop. Resolves once
/// the host task publishes its first value (its `started` handshake),
/// returning that value and the channel.
///
/// # Errors
///
/// The host failure (original kind) if it dies before publishing, or
/// [`BridgeError::Cancelled`].
pub async fn open_channel_from<In, Out, F, Fut>(
    host: &Handle,
    target: F,
) -> Result<(Out, LinkedTaskChannel<In, Out>), BridgeError>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: FnOnce(HostChannel<In, Out>) -> Fut,
    Fut: Future<Output = Result<(), UserError>> + Send + 'static,
{
    let (to_host, from_core) = mpsc::channel::<In>(BRIDGE_QUEUE_CAPACITY);
    let (to_core, from_host) = mpsc::channel::<Out>(BRIDGE_QUEUE_CAPACITY);
    let token = CancellationToken::new();
    let complete = Latch::new();
    let failure: Arc<StdMutex<Option<BridgeError>>> = Arc::new(StdMutex::new(None));

    let body = target(HostChannel {
        from_core,
        to_core,
        token: token.clone(),
    });

    let task_token = token.clone();
    let task_complete = complete.clone();
    let task_failure = failure.clone();
    let join = host.spawn(async move {
        let outcome = tokio::select! {
            biased;
            () = task_token.cancelled() => Err(BridgeError::Cancelled),
            result = body => result.map_err(BridgeError::from_user),
        };
        if let Err(err) = outcome {
            tracing::debug!(kind = %err.kind(), "bridged task ended abnormally");
            *task_failure.lock().unwrap() = Some(err);
        }
        // Channel ends drop here: the core side observes closure.
        task_complete.set();
    });

    let mut chan = LinkedTaskChannel {
        to_host: Some(to_host),
        from_host,
        token,
        complete,
        failure,
        join: Some(join),
    };

    // Sync to a "started()"-like first delivered value from the host task.
    match chan.receive().await {
        Ok(first) => Ok((first, chan)),
        Err(err) => {
            chan.wait_complete().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests_bridge {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_run_task_round_trip() {
        let host = HostLoop::spawn().unwrap();
        let out = run_task(host.handle(), async { Ok::<_, UserError>(7u32) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_host_error_kind_is_preserved() {
        let host = HostLoop::spawn().unwrap();
        let err = run_task::<u32, _>(host.handle(), async {
            Err(UserError::new("value-error", "nope"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "value-error");
    }

    #[tokio::test]
    async fn test_linked_channel_echo_and_close() {
        let host = HostLoop::spawn().unwrap();
        let (first, mut chan) = open_channel_from::<u32, u32, _, _>(
            host.handle(),
            |mut hc| async move {
                hc.send(0).await.ok();
                while let Some(value) = hc.recv().await {
                    if hc.send(value).await.is_err() {
                        break;
                    }
                }
                Ok(())
            },
        )
        .await
        .unwrap();
        assert_eq!(first, 0);

        for value in 1..=10u32 {
            chan.send(value).await.unwrap();
            assert_eq!(chan.receive().await.unwrap(), value);
        }
        chan.aclose().await;
    }

    #[tokio::test]
    async fn test_core_cancel_reaches_host() {
        let host = HostLoop::spawn().unwrap();
        let (first, mut chan) = open_channel_from::<u32, u32, _, _>(
            host.handle(),
            |hc| async move {
                hc.send(1).await.ok();
                // Parks forever; only the bridged cancellation ends it.
                hc.cancel_token().cancelled().await;
                Err(UserError::new("should-not-surface", "cancel wins"))
            },
        )
        .await
        .unwrap();
        assert_eq!(first, 1);

        chan.cancel();
        chan.wait_complete().await;
        let err = chan.receive().await.unwrap_err();
        assert_eq!(err.kind(), crate::runtime::errors::kind::BRIDGE_CANCELLED);
        // Host loop shut down cleanly with no orphaned task.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
