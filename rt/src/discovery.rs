// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Actor discovery against the tree's arbiter.

use std::{collections::HashMap, sync::Arc};

use crate::{NetAddr, Uid,
            portal::{Portal, one_shot},
            runtime::{actor::Actor,
                      arbiter::NameArgs,
                      dispatch::NoArgs,
                      errors::RpcError}};

fn arbiter_addr_of(actor: &Arc<Actor>) -> Result<NetAddr, RpcError> {
    actor
        .arbiter_addr()
        .ok_or_else(|| RpcError::Protocol("actor has no arbiter address".into()))
}

/// Look up the listen address of an actor registered under `name`.
///
/// # Errors
///
/// Arbiter transport failures.
pub async fn find_actor(
    actor: &Arc<Actor>,
    name: &str,
) -> Result<Option<NetAddr>, RpcError> {
    let arbiter = arbiter_addr_of(actor)?;
    one_shot(actor, &arbiter, "find_actor", &NameArgs { name: name.into() }).await
}

/// Wait until at least one actor is registered under `name`; returns every
/// matching address.
///
/// # Errors
///
/// Arbiter transport failures.
pub async fn wait_for_actor(
    actor: &Arc<Actor>,
    name: &str,
) -> Result<Vec<NetAddr>, RpcError> {
    let arbiter = arbiter_addr_of(actor)?;
    one_shot(actor, &arbiter, "wait_for_actor", &NameArgs { name: name.into() }).await
}

/// Dump the arbiter's full `uid → address` registry.
///
/// # Errors
///
/// Arbiter transport failures.
pub async fn get_registry(
    actor: &Arc<Actor>,
) -> Result<HashMap<Uid, NetAddr>, RpcError> {
    let arbiter = arbiter_addr_of(actor)?;
    one_shot(actor, &arbiter, "get_registry", &NoArgs).await
}

/// Open a portal to the actor listening at `addr` (a fresh symmetric
/// channel, adopted into the peer table).
///
/// # Errors
///
/// Connect/handshake failures.
pub async fn connect_to(actor: &Arc<Actor>, addr: &NetAddr) -> Result<Portal, RpcError> {
    let chan = actor
        .open_channel_to(addr)
        .await
        .map_err(|err| RpcError::Protocol(err.to_string()))?;
    Ok(Portal::new(actor.clone(), chan))
}
