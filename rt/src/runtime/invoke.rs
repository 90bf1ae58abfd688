// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The invocation runner: executes one inbound RPC and delivers its
//! result(s) over the originating channel.
//!
//! Per shape:
//! - `asyncfunc`: ack with `functype`, run the body, ship `return`. A
//!   cancelled body ships nothing - the canceller holds the done-latch.
//! - `asyncgen`: ack, forward every produced value as `yield`, then `stop`.
//!   The generator is dropped deterministically before the `stop` goes out,
//!   even when a cancellation is pending.
//! - `context`: ack, hand the body an [`RpcContext`], ship `return` when it
//!   finishes. A cancelled context ships `context-cancelled` carrying the
//!   originator (self vs caller).
//!
//! Any non-cancel failure is packed and shipped; if shipping itself fails
//! the error is logged locally and bookkeeping still completes. The
//! done-latch is always published on exit so a concurrent canceller can
//! await teardown.

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use serde_bytes::ByteBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{CallId, Channel, Packet, PackedError, Uid,
            runtime::{actor::Actor,
                      dispatch::{AsyncFnInner, AsyncGenInner, ContextFnInner,
                                 Dispatcher, RpcContext},
                      errors::{kind, pack_error, pack_user_error},
                      scope::Latch,
                      task_table::TaskKey}};

/// Everything the runner needs for one invocation.
pub(crate) struct InvokeRequest {
    pub actor: Arc<Actor>,
    pub chan: Arc<Channel>,
    pub peer: Uid,
    pub cid: CallId,
    /// `ns.func`, for diagnostics.
    pub func_label: String,
    pub dispatcher: Dispatcher,
    pub kwargs: Vec<u8>,
    pub cancel: CancellationToken,
    pub done: Latch,
    /// False for privileged `self.*` verbs.
    pub is_rpc: bool,
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("peer", &self.peer)
            .field("cid", &self.cid)
            .field("func", &self.func_label)
            .finish_non_exhaustive()
    }
}

/// Run one invocation to completion, including bookkeeping.
pub(crate) async fn invoke(req: InvokeRequest) {
    let key: TaskKey = (req.peer.clone(), req.cid.clone());

    // User code may panic; that is just another error kind to the caller.
    let outcome = std::panic::AssertUnwindSafe(drive(&req)).catch_unwind().await;
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        tracing::error!(func = %req.func_label, %message, "invocation panicked");
        ship_error(
            &req.chan,
            pack_error(kind::PANIC, message.clone(), message, req.actor.uid()),
            Some(req.cid.clone()),
        )
        .await;
    }

    // RPC task bookkeeping - runs no matter how the body ended.
    if req.actor.rpc_tasks().remove(&key).is_none() && req.is_rpc {
        // If we're cancelled before the entry is installed the msg loop
        // never recorded us.
        tracing::warn!(
            func = %req.func_label,
            "task likely errored or was cancelled before it started"
        );
    }
    req.done.set();
    if req.actor.rpc_tasks().is_empty() {
        tracing::trace!("all RPC tasks have completed");
    }
}

async fn drive(req: &InvokeRequest) {
    match &req.dispatcher {
        Dispatcher::AsyncFunc(bind) => drive_async_fn(req, bind).await,
        Dispatcher::AsyncGen(bind) => drive_async_gen(req, bind).await,
        Dispatcher::Context(bind) => drive_context(req, bind).await,
    }
}

async fn drive_async_fn(req: &InvokeRequest, bind: &Arc<AsyncFnInner>) {
    let src = req.actor.uid().clone();
    // kwargs bind first: a mismatch ships without running the body and
    // without a functype ack.
    let body = match bind(req.kwargs.clone()) {
        Err(user) => {
            ship_error(&req.chan, pack_user_error(&user, &src), Some(req.cid.clone()))
                .await;
            return;
        }
        Ok(body) => body,
    };

    if !send_functype(req, crate::FuncType::AsyncFunc).await {
        return;
    }

    tokio::select! {
        () = req.cancel.cancelled() => {
            // Nothing goes on the wire; the canceller awaits our done-latch.
            tracing::debug!(func = %req.func_label, "invocation cancelled");
        }
        result = body => match result {
            Ok(value) => {
                let reply = Packet::Return {
                    value: ByteBuf::from(value),
                    cid: req.cid.clone(),
                };
                if req.chan.send(&reply).await.is_err() {
                    tracing::error!(
                        peer = %req.peer,
                        "failed to ship return value to caller"
                    );
                }
            }
            Err(user) => {
                ship_error(
                    &req.chan,
                    pack_user_error(&user, &src),
                    Some(req.cid.clone()),
                )
                .await;
            }
        }
    }
}

async fn drive_async_gen(req: &InvokeRequest, bind: &Arc<AsyncGenInner>) {
    let src = req.actor.uid().clone();
    let mut body = match bind(req.kwargs.clone()) {
        Err(user) => {
            ship_error(&req.chan, pack_user_error(&user, &src), Some(req.cid.clone()))
                .await;
            return;
        }
        Ok(body) => body,
    };

    if !send_functype(req, crate::FuncType::AsyncGen).await {
        return;
    }

    let mut errored = false;
    loop {
        let item = tokio::select! {
            () = req.cancel.cancelled() => {
                tracing::debug!(func = %req.func_label, "stream cancelled");
                break;
            }
            item = body.next() => item,
        };
        match item {
            None => break,
            Some(Ok(value)) => {
                let yield_pkt = Packet::Yield {
                    value: ByteBuf::from(value),
                    cid: req.cid.clone(),
                };
                // The send itself is a cancellation point: a blocked
                // producer must still unwind when its scope dies.
                let sent = tokio::select! {
                    () = req.cancel.cancelled() => None,
                    res = req.chan.send(&yield_pkt) => Some(res),
                };
                match sent {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(_)) => {
                        tracing::debug!(peer = %req.peer, "peer gone mid-stream");
                        errored = true;
                        break;
                    }
                }
            }
            Some(Err(user)) => {
                ship_error(
                    &req.chan,
                    pack_user_error(&user, &src),
                    Some(req.cid.clone()),
                )
                .await;
                errored = true;
                break;
            }
        }
    }

    // Close the generator before the terminator goes out - a pending
    // cancellation must not bypass this, or upstream scopes never unwind.
    drop(body);

    if !errored {
        let stop = Packet::Stop {
            cid: req.cid.clone(),
        };
        if req.chan.send(&stop).await.is_err() {
            tracing::debug!(peer = %req.peer, "could not deliver stream terminator");
        }
    }
}

async fn drive_context(req: &InvokeRequest, bind: &Arc<ContextFnInner>) {
    let src = req.actor.uid().clone();
    let key: TaskKey = (req.peer.clone(), req.cid.clone());

    // Caller→callee values land in our reply-queue slot for this call-id.
    let inbound = req
        .actor
        .reply_queues()
        .take_receiver(&key)
        .unwrap_or_else(|| mpsc::channel(1).1);
    let ctx = RpcContext::new(
        req.chan.clone(),
        req.cid.clone(),
        req.peer.clone(),
        inbound,
        req.cancel.clone(),
    );

    let body = match bind(ctx.clone(), req.kwargs.clone()) {
        Err(user) => {
            req.actor.reply_queues().remove(&key);
            ship_error(&req.chan, pack_user_error(&user, &src), Some(req.cid.clone()))
                .await;
            return;
        }
        Ok(body) => body,
    };

    if !send_functype(req, crate::FuncType::Context).await {
        req.actor.reply_queues().remove(&key);
        return;
    }

    tokio::select! {
        () = req.cancel.cancelled() => {
            // Relay the cancellation to the caller with its origin; the
            // first reason published on the channel wins.
            let reason = if ctx.cancel_was_called() {
                format!("{} cancelled itself", req.func_label)
            } else {
                format!(
                    "{} was remotely cancelled by its caller {}",
                    req.func_label, req.peer
                )
            };
            ship_error(
                &req.chan,
                pack_error(kind::CONTEXT_CANCELLED, reason.clone(), reason, &src),
                Some(req.cid.clone()),
            )
            .await;
        }
        result = body => match result {
            Ok(value) => {
                let reply = Packet::Return {
                    value: ByteBuf::from(value),
                    cid: req.cid.clone(),
                };
                if req.chan.send(&reply).await.is_err() {
                    tracing::error!(peer = %req.peer, "failed to ship context result");
                }
            }
            Err(user) => {
                ship_error(
                    &req.chan,
                    pack_user_error(&user, &src),
                    Some(req.cid.clone()),
                )
                .await;
            }
        }
    }

    req.actor.reply_queues().remove(&key);
}

/// Ack that the invocation started and announce the reply shape. Returns
/// false (after logging) when the channel is already gone.
async fn send_functype(req: &InvokeRequest, shape: crate::FuncType) -> bool {
    let ack = Packet::Functype {
        kind: shape,
        cid: req.cid.clone(),
    };
    if req.chan.send(&ack).await.is_err() {
        tracing::debug!(
            func = %req.func_label,
            "channel closed before invocation could start"
        );
        return false;
    }
    true
}

async fn ship_error(chan: &Channel, packed: PackedError, cid: Option<CallId>) {
    let pkt = Packet::Error { error: packed, cid };
    if chan.send(&pkt).await.is_err() {
        // If we can't propagate the error that's a big problem - but never a
        // fatal one for the runtime.
        tracing::error!(peer = ?chan.peer_uid(), "failed to ship error to caller");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic payload of unknown type".to_string())
}
