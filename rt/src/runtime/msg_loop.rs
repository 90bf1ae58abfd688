// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-channel message loop: demultiplexes inbound packets into "reply
//! to one of my outgoing calls" (routed to the reply queue by call-id) or
//! "the peer wants me to run something" (spawned as an invocation task in
//! the service group).
//!
//! Privileged `self.*` verbs (`cancel`, `_cancel_task`) execute inline under
//! a shield - the loop's own cancellation cannot abort the shutdown
//! sequence. Other `self` verbs (the arbiter registry surface) dispatch like
//! regular RPCs.
//!
//! Exit conditions:
//! - the peer sends the `None` sentinel → cancel every invocation routed
//!   through this channel, then terminate;
//! - the transport closes or resets → clean termination (never an RPC
//!   error);
//! - the peer ships a cid-less `error` → the channel is marked errored and
//!   the failure propagates to the supervisor;
//! - the loop's token fires → terminate.

use std::sync::Arc;

use serde_bytes::ByteBuf;
use tokio_util::sync::CancellationToken;

use crate::{CallId, Channel, FuncType, Packet, Uid,
            runtime::{actor::Actor,
                      dispatch::encode_value,
                      errors::{ActorError, kind, pack_error, unpack_error},
                      invoke::{InvokeRequest, invoke},
                      scope::Latch,
                      task_table::{TaskEntry, TaskKey}}};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct CancelTaskArgs {
    pub cid: CallId,
}

/// Process messages for the channel async-RPC style until the peer goes
/// away, the sentinel arrives, or `loop_token` fires.
pub(crate) async fn process_messages(
    actor: Arc<Actor>,
    chan: Arc<Channel>,
    loop_token: CancellationToken,
) -> Result<(), ActorError> {
    let Some(peer) = chan.peer_uid() else {
        return Err(ActorError::Startup(
            "message loop started before handshake".into(),
        ));
    };
    tracing::debug!(%peer, "entering msg loop");

    loop {
        let received = tokio::select! {
            () = loop_token.cancelled() => {
                tracing::debug!(%peer, "msg loop cancelled");
                return Ok(());
            }
            received = chan.recv() => received,
        };

        let packet = match received {
            Ok(packet) => packet,
            Err(err) if err.is_peer_gone() => {
                // Channels "breaking" (EOF or connection-reset) is ok since
                // there is no teardown handshake for them; bail out and let
                // the teardown sequence clean up.
                tracing::debug!(%peer, %err, "channel closed abruptly");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(packet) = packet else {
            // Loop terminate sentinel: reap everything the peer started
            // here, then leave. Shielded - we do not observe `loop_token`
            // while reaping.
            tracing::debug!(%peer, "msg loop signalled to terminate");
            for key in actor.rpc_tasks().keys_for_peer(&peer) {
                actor.cancel_task(&key).await;
            }
            return Ok(());
        };

        match packet {
            Packet::Cmd {
                ns,
                func,
                kwargs,
                caller,
                cid,
            } => {
                if handle_cmd(&actor, &chan, &peer, &ns, &func, kwargs, caller, cid)
                    .await?
                {
                    return Ok(());
                }
            }
            Packet::Error { error, cid: None } => {
                // Channel-level failure from the peer: poison the channel
                // and surface to the supervisor.
                chan.set_errored();
                return Err(ActorError::PeerInternal(unpack_error(error)));
            }
            reply => {
                // Everything else carries a cid and is a reply to one of our
                // outgoing calls.
                let Some(cid) = reply.cid().cloned() else {
                    // Unreachable by construction; treat like a peer bug.
                    chan.set_errored();
                    return Err(ActorError::Startup(format!(
                        "peer sent an unroutable packet: {reply:?}"
                    )));
                };
                let key: TaskKey = (peer.clone(), cid);
                let sender = actor.reply_queues().sender(&key);
                // Blocking send on a bounded queue: backpressure all the way
                // down to the socket.
                tokio::select! {
                    () = loop_token.cancelled() => return Ok(()),
                    result = sender.send(reply) => {
                        if result.is_err() {
                            tracing::debug!(
                                cid = %key.1,
                                "reply consumer is already closed; dropping packet"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Handle one `cmd` packet. Returns `Ok(true)` when the loop must terminate
/// (actor-wide cancel).
#[allow(clippy::too_many_arguments)]
async fn handle_cmd(
    actor: &Arc<Actor>,
    chan: &Arc<Channel>,
    peer: &Uid,
    ns: &str,
    func: &str,
    kwargs: ByteBuf,
    caller: Uid,
    cid: CallId,
) -> Result<bool, ActorError> {
    tracing::debug!(%caller, func = %format!("{ns}.{func}"), %cid, "processing request");

    if ns == "self" {
        match func {
            "cancel" => {
                // Actor-wide shutdown, shielded: an in-flight cancel of this
                // loop cannot abort the sequence.
                let ack = Packet::Functype {
                    kind: FuncType::AsyncFunc,
                    cid: cid.clone(),
                };
                chan.send(&ack).await.ok();
                tracing::info!(%caller, "actor remotely cancelled; waiting on completion");
                actor.cancel().await;
                reply_bool(chan, &cid, true).await;
                return Ok(true);
            }
            "_cancel_task" => {
                let ack = Packet::Functype {
                    kind: FuncType::AsyncFunc,
                    cid: cid.clone(),
                };
                chan.send(&ack).await.ok();
                match crate::msgpack_serde::try_deserialize::<CancelTaskArgs>(&kwargs)
                {
                    Ok(args) => {
                        let key: TaskKey = (peer.clone(), args.cid);
                        actor.cancel_task(&key).await;
                        reply_bool(chan, &cid, true).await;
                    }
                    Err(err) => {
                        let packed = pack_error(
                            kind::ARGUMENT_ERROR,
                            err.to_string(),
                            String::new(),
                            actor.uid(),
                        );
                        chan.send(&Packet::Error {
                            error: packed,
                            cid: Some(cid),
                        })
                        .await
                        .ok();
                    }
                }
                return Ok(false);
            }
            _ => {
                // The rest of the `self` namespace (the arbiter registry
                // verbs) runs as ordinary invocations.
                if let Some(dispatcher) = actor.self_dispatcher(func) {
                    spawn_invocation(
                        actor, chan, peer, "self", func, kwargs, cid, dispatcher,
                        false,
                    );
                    return Ok(false);
                }
                ship_not_exposed(actor, chan, "self", func, cid).await;
                return Ok(false);
            }
        }
    }

    match actor.dispatch().lookup(ns, func) {
        None => {
            ship_not_exposed(actor, chan, ns, func, cid).await;
            Ok(false)
        }
        Some(dispatcher) => {
            spawn_invocation(actor, chan, peer, ns, func, kwargs, cid, dispatcher, true);
            Ok(false)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_invocation(
    actor: &Arc<Actor>,
    chan: &Arc<Channel>,
    peer: &Uid,
    ns: &str,
    func: &str,
    kwargs: ByteBuf,
    cid: CallId,
    dispatcher: crate::runtime::dispatch::Dispatcher,
    is_rpc: bool,
) {
    let service = actor.service_group();
    if service.is_cancelled() {
        // Benign race during actor teardown.
        tracing::warn!(
            func = %format!("{ns}.{func}"),
            "service group torn down before task start"
        );
        return;
    }

    let key: TaskKey = (peer.clone(), cid.clone());
    let cancel = service.token().child_token();
    let done = Latch::new();
    actor.rpc_tasks().insert(key, TaskEntry {
        cancel: cancel.clone(),
        func: format!("{ns}.{func}"),
        done: done.clone(),
    });

    tracing::debug!(func = %format!("{ns}.{func}"), %cid, "spawning task");
    service.spawn(invoke(InvokeRequest {
        actor: actor.clone(),
        chan: chan.clone(),
        peer: peer.clone(),
        cid,
        func_label: format!("{ns}.{func}"),
        dispatcher,
        kwargs: kwargs.into_vec(),
        cancel,
        done,
        is_rpc,
    }));
}

async fn ship_not_exposed(
    actor: &Arc<Actor>,
    chan: &Arc<Channel>,
    ns: &str,
    func: &str,
    cid: CallId,
) {
    tracing::warn!(func = %format!("{ns}.{func}"), "rpc target not exposed");
    let packed = pack_error(
        kind::MODULE_NOT_EXPOSED,
        format!(
            "{ns}.{func} is not in this actor's allow-list (enabled modules: {:?})",
            actor.dispatch().module_names()
        ),
        String::new(),
        actor.uid(),
    );
    chan.send(&Packet::Error {
        error: packed,
        cid: Some(cid),
    })
    .await
    .ok();
}

async fn reply_bool(chan: &Channel, cid: &CallId, value: bool) {
    if let Ok(encoded) = encode_value(&value) {
        chan.send(&Packet::Return {
            value: ByteBuf::from(encoded),
            cid: cid.clone(),
        })
        .await
        .ok();
    }
}
