// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The caller-side handle to a remote actor: a thin wrapper over a
//! [`Channel`] plus call-id allocation.
//!
//! Four call shapes:
//! - [`Portal::run`] - one-shot function, single value back;
//! - [`Portal::open_stream_from`] - async-generator stream
//!   ([`RecvStream`]);
//! - [`Portal::open_context_from`] - bidirectional context
//!   ([`CallerContext`]);
//! - dropping a live stream/context fires a `self._cancel_task` without
//!   waiting on the reply (the fire-and-forget cancel shape).
//!
//! The caller names the shape it expects at the dispatch site; a callee
//! whose registered shape differs produces a protocol error, not a guess.

use std::{marker::PhantomData,
          pin::Pin,
          sync::Arc,
          task::{Context, Poll}};

use serde::{Serialize, de::DeserializeOwned};
use serde_bytes::ByteBuf;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{CallId, Channel, FuncType, NetAddr, Packet, Uid, msgpack_serde,
            runtime::{actor::Actor,
                      errors::{RpcError, unpack_error},
                      msg_loop::{CancelTaskArgs, process_messages},
                      task_table::TaskKey}};

const CANCEL_ACTOR_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
const ONE_SHOT_LINGER: std::time::Duration = std::time::Duration::from_secs(2);

/// A portal onto a remote actor over an established channel.
#[derive(Clone)]
pub struct Portal {
    actor: Arc<Actor>,
    chan: Arc<Channel>,
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("peer", &self.chan.peer_uid())
            .finish_non_exhaustive()
    }
}

impl Portal {
    #[must_use]
    pub fn new(actor: Arc<Actor>, chan: Arc<Channel>) -> Self { Self { actor, chan } }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> { &self.chan }

    /// The remote actor's uid.
    #[must_use]
    pub fn peer_uid(&self) -> Option<Uid> { self.chan.peer_uid() }

    /// Invoke a one-shot remote function and await its single value.
    ///
    /// # Errors
    ///
    /// [`RpcError::Remote`] with the original kind for callee failures,
    /// [`RpcError::TransportClosed`] if the channel dies mid-exchange.
    pub async fn run<A: Serialize, R: DeserializeOwned>(
        &self,
        ns: &str,
        func: &str,
        args: &A,
    ) -> Result<R, RpcError> {
        let bytes = call_single(&self.actor, &self.chan, ns, func, args).await?;
        Ok(msgpack_serde::try_deserialize(&bytes)?)
    }

    /// Open an async-generator stream from a remote function.
    ///
    /// # Errors
    ///
    /// Same surface as [`Portal::run`]; additionally a protocol error if the
    /// callee's registered shape is not a stream.
    pub async fn open_stream_from<A: Serialize, R: DeserializeOwned>(
        &self,
        ns: &str,
        func: &str,
        args: &A,
    ) -> Result<RecvStream<R>, RpcError> {
        let kwargs = msgpack_serde::try_serialize(args)?;
        let (cid, mut rx) = self.actor.send_cmd(&self.chan, ns, func, kwargs).await?;
        let key = call_key(&self.chan, cid)?;

        if let Err(err) = expect_functype(&mut rx, FuncType::AsyncGen).await {
            self.actor.reply_queues().remove(&key);
            return Err(err);
        }
        Ok(RecvStream {
            actor: self.actor.clone(),
            chan: self.chan.clone(),
            key,
            rx,
            finished: false,
            _marker: PhantomData,
        })
    }

    /// Open a bidirectional context. Resolves once the callee publishes its
    /// first delivery via `started(value)`; returns that value and the
    /// exchange handle.
    ///
    /// # Errors
    ///
    /// Same surface as [`Portal::run`].
    pub async fn open_context_from<A: Serialize, F: DeserializeOwned>(
        &self,
        ns: &str,
        func: &str,
        args: &A,
    ) -> Result<(F, CallerContext), RpcError> {
        let kwargs = msgpack_serde::try_serialize(args)?;
        let (cid, mut rx) = self.actor.send_cmd(&self.chan, ns, func, kwargs).await?;
        let key = call_key(&self.chan, cid)?;

        let first = async {
            expect_functype(&mut rx, FuncType::Context).await?;
            match rx.recv().await {
                Some(Packet::Yield { value, .. }) => {
                    Ok(msgpack_serde::try_deserialize::<F>(&value)?)
                }
                Some(Packet::Error { error, .. }) => {
                    Err(RpcError::Remote(unpack_error(error)))
                }
                None => Err(RpcError::TransportClosed),
                Some(other) => Err(RpcError::Protocol(format!(
                    "expected the context's first delivery, got {other:?}"
                ))),
            }
        }
        .await;

        match first {
            Err(err) => {
                self.actor.reply_queues().remove(&key);
                Err(err)
            }
            Ok(first) => Ok((first, CallerContext {
                actor: self.actor.clone(),
                chan: self.chan.clone(),
                key,
                rx,
                finished: false,
                final_value: None,
            })),
        }
    }

    /// Cancel the remote actor entirely (`self.cancel`). Returns true on an
    /// acknowledged cancel; false when the actor was already gone or never
    /// answered in time - neither is an error, cancellation is idempotent.
    pub async fn cancel_actor(&self) -> bool {
        tracing::debug!(peer = ?self.chan.peer_uid(), "requesting actor cancel");
        let attempt = self.run::<_, bool>("self", "cancel", &crate::NoArgs);
        match timeout(CANCEL_ACTOR_TIMEOUT, attempt).await {
            Ok(Ok(acked)) => acked,
            Ok(Err(RpcError::TransportClosed)) => {
                tracing::debug!("peer already disconnected; cancel moot");
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, "cancel_actor failed");
                false
            }
            Err(_elapsed) => {
                tracing::warn!("cancel_actor timed out");
                false
            }
        }
    }
}

fn call_key(chan: &Channel, cid: CallId) -> Result<TaskKey, RpcError> {
    let peer = chan
        .peer_uid()
        .ok_or_else(|| RpcError::Protocol("channel has no peer uid yet".into()))?;
    Ok((peer, cid))
}

/// Consume the `functype` ack and check the announced shape.
async fn expect_functype(
    rx: &mut mpsc::Receiver<Packet>,
    want: FuncType,
) -> Result<(), RpcError> {
    match rx.recv().await {
        Some(Packet::Functype { kind, .. }) if kind == want => Ok(()),
        Some(Packet::Functype { kind, .. }) => Err(RpcError::Protocol(format!(
            "callee answered as {kind}, caller expected {want}"
        ))),
        Some(Packet::Error { error, .. }) => Err(RpcError::Remote(unpack_error(error))),
        None => Err(RpcError::TransportClosed),
        Some(other) => Err(RpcError::Protocol(format!(
            "expected functype ack, got {other:?}"
        ))),
    }
}

/// Drain a single-value reply: `functype` ack then `return`/`error`.
pub(crate) async fn drain_single(
    rx: &mut mpsc::Receiver<Packet>,
) -> Result<Vec<u8>, RpcError> {
    expect_functype(rx, FuncType::AsyncFunc).await?;
    match rx.recv().await {
        Some(Packet::Return { value, .. }) => Ok(value.into_vec()),
        Some(Packet::Error { error, .. }) => Err(RpcError::Remote(unpack_error(error))),
        None => Err(RpcError::TransportClosed),
        Some(other) => Err(RpcError::Protocol(format!(
            "expected return, got {other:?}"
        ))),
    }
}

/// One one-shot call over an adopted channel; cleans up the reply queue.
pub(crate) async fn call_single<A: Serialize>(
    actor: &Arc<Actor>,
    chan: &Arc<Channel>,
    ns: &str,
    func: &str,
    args: &A,
) -> Result<Vec<u8>, RpcError> {
    let kwargs = msgpack_serde::try_serialize(args)?;
    let (cid, mut rx) = actor.send_cmd(chan, ns, func, kwargs).await?;
    let key = call_key(chan, cid)?;
    let out = drain_single(&mut rx).await;
    actor.reply_queues().remove(&key);
    out
}

/// Call `self.<func>` on an actor at `addr` over a private throwaway
/// channel (registry enroll/unenroll, discovery queries).
pub(crate) async fn one_shot<A: Serialize, R: DeserializeOwned>(
    actor: &Arc<Actor>,
    addr: &NetAddr,
    func: &str,
    args: &A,
) -> Result<R, RpcError> {
    let chan = Arc::new(Channel::connect(addr).await?);
    chan.try_handshake(actor.uid()).await?;

    // A private loop routes the replies; it is not part of the service
    // scope so it works during shielded teardown too.
    let mut loop_task = tokio::spawn(process_messages(
        actor.clone(),
        chan.clone(),
        CancellationToken::new(),
    ));

    let out = async {
        let bytes = call_single(actor, &chan, "self", func, args).await?;
        Ok(msgpack_serde::try_deserialize::<R>(&bytes)?)
    }
    .await;

    chan.aclose().await;
    // The far end answers our sentinel with its own; give it a moment.
    if timeout(ONE_SHOT_LINGER, &mut loop_task).await.is_err() {
        loop_task.abort();
    }
    out
}

/// Fire a `self._cancel_task` for `target` and await the acknowledgement.
pub(crate) async fn cancel_call(
    actor: &Arc<Actor>,
    chan: &Arc<Channel>,
    target: &CallId,
) -> Result<(), RpcError> {
    let args = CancelTaskArgs {
        cid: target.clone(),
    };
    let bytes = call_single(actor, chan, "self", "_cancel_task", &args).await?;
    let _acked: bool = msgpack_serde::try_deserialize(&bytes)?;
    Ok(())
}

/// Fire-and-forget flavor of [`cancel_call`] for drop paths.
pub(crate) fn spawn_cancel_call(actor: Arc<Actor>, chan: Arc<Channel>, target: CallId) {
    if tokio::runtime::Handle::try_current().is_err() {
        return;
    }
    tokio::spawn(async move {
        cancel_call(&actor, &chan, &target).await.ok();
    });
}

/// Caller-side view of a remote async-generator: yields values in the
/// callee's production order; the terminating `stop` is the last
/// observable. Dropping it mid-stream cancels the remote task.
pub struct RecvStream<R> {
    actor: Arc<Actor>,
    chan: Arc<Channel>,
    key: TaskKey,
    rx: mpsc::Receiver<Packet>,
    finished: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for RecvStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvStream")
            .field("cid", &self.key.1)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: DeserializeOwned> futures_core::Stream for RecvStream<R> {
    type Item = Result<R, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(RpcError::TransportClosed)))
            }
            Poll::Ready(Some(Packet::Yield { value, .. })) => Poll::Ready(Some(
                msgpack_serde::try_deserialize::<R>(&value).map_err(RpcError::from),
            )),
            Poll::Ready(Some(Packet::Stop { .. })) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Packet::Error { error, .. })) => {
                this.finished = true;
                Poll::Ready(Some(Err(RpcError::Remote(unpack_error(error)))))
            }
            Poll::Ready(Some(other)) => {
                this.finished = true;
                Poll::Ready(Some(Err(RpcError::Protocol(format!(
                    "unexpected packet in stream: {other:?}"
                )))))
            }
        }
    }
}

impl<R> RecvStream<R> {
    /// Cancel the remote generator and await its teardown acknowledgement.
    pub async fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        cancel_call(&self.actor, &self.chan, &self.key.1).await.ok();
    }
}

impl<R> Drop for RecvStream<R> {
    fn drop(&mut self) {
        if !self.finished {
            // Fire-and-forget: the remote side reaps the task; we are gone.
            spawn_cancel_call(
                self.actor.clone(),
                self.chan.clone(),
                self.key.1.clone(),
            );
        }
        self.actor.reply_queues().remove(&self.key);
    }
}

/// Caller-side half of a bidirectional context exchange.
pub struct CallerContext {
    actor: Arc<Actor>,
    chan: Arc<Channel>,
    key: TaskKey,
    rx: mpsc::Receiver<Packet>,
    finished: bool,
    final_value: Option<Vec<u8>>,
}

impl std::fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerContext")
            .field("cid", &self.key.1)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl CallerContext {
    /// Send one value into the context stream.
    ///
    /// # Errors
    ///
    /// `transport-closed` when the channel is gone.
    pub async fn send<T: Serialize>(&self, value: &T) -> Result<(), RpcError> {
        let encoded = msgpack_serde::try_serialize(value)?;
        self.chan
            .send(&Packet::Yield {
                value: ByteBuf::from(encoded),
                cid: self.key.1.clone(),
            })
            .await
            .map_err(RpcError::from)
    }

    /// Receive the next value. `Ok(None)` is the clean end of the exchange
    /// (the callee returned; its final value is available via
    /// [`CallerContext::take_result`]).
    ///
    /// # Errors
    ///
    /// [`RpcError::Remote`] carries callee failures - including
    /// `context-cancelled` with the originating side's reason.
    pub async fn recv<R: DeserializeOwned>(&mut self) -> Result<Option<R>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Packet::Yield { value, .. }) => {
                Ok(Some(msgpack_serde::try_deserialize(&value)?))
            }
            Some(Packet::Return { value, .. }) => {
                self.finished = true;
                self.final_value = Some(value.into_vec());
                Ok(None)
            }
            Some(Packet::Stop { .. }) => {
                self.finished = true;
                Ok(None)
            }
            Some(Packet::Error { error, .. }) => {
                self.finished = true;
                Err(RpcError::Remote(unpack_error(error)))
            }
            None => {
                self.finished = true;
                Err(RpcError::TransportClosed)
            }
            Some(other) => {
                self.finished = true;
                Err(RpcError::Protocol(format!(
                    "unexpected packet in context: {other:?}"
                )))
            }
        }
    }

    /// Close our send side: the callee's next `recv()` yields `None`.
    ///
    /// # Errors
    ///
    /// `transport-closed` when the channel is gone.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.chan
            .send(&Packet::Stop {
                cid: self.key.1.clone(),
            })
            .await
            .map_err(RpcError::from)
    }

    /// The callee's final return value, once the exchange ended cleanly.
    ///
    /// # Errors
    ///
    /// Codec errors if the value does not decode as `R`.
    pub fn take_result<R: DeserializeOwned>(&mut self) -> Result<Option<R>, RpcError> {
        match self.final_value.take() {
            None => Ok(None),
            Some(bytes) => Ok(Some(msgpack_serde::try_deserialize(&bytes)?)),
        }
    }

    /// Cancel the remote context task and await the acknowledgement. The
    /// callee observes `context-cancelled` naming us as the originator.
    pub async fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        cancel_call(&self.actor, &self.chan, &self.key.1).await.ok();
    }
}

impl Drop for CallerContext {
    fn drop(&mut self) {
        if !self.finished {
            spawn_cancel_call(
                self.actor.clone(),
                self.chan.clone(),
                self.key.1.clone(),
            );
        }
        self.actor.reply_queues().remove(&self.key);
    }
}
