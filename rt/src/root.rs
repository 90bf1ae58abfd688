// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Root-actor entrypoint: bring up (or join) an actor tree and run a body
//! against the root actor.
//!
//! If no arbiter is reachable at the configured address one is spawned
//! in-process first; the root actor then registers with it like any other
//! actor. On exit the root actor is cancelled, and an arbiter we spawned is
//! torn down with it.

use std::{sync::Arc, time::Duration};

use tokio::{net::TcpStream, sync::oneshot, time::timeout};

use crate::{NetAddr,
            runtime::{actor::{Actor, ActorBuilder},
                      dispatch::ModuleDef,
                      errors::{ActorError, RpcError},
                      spawn::{ActorSpec, SpawnBackend, SpawnError, SpawnHandle,
                              ThreadSpawner, set_current_actor}}};

const ARBITER_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const ROOT_START_TIMEOUT: Duration = Duration::from_secs(10);
const ROOT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`run`].
#[derive(Debug, Clone)]
pub struct RootConfig {
    pub name: String,
    /// Known arbiter endpoint; `None` means "spawn one on an ephemeral
    /// port".
    pub arbiter_addr: Option<NetAddr>,
    pub modules: Vec<ModuleDef>,
    pub loglevel: Option<String>,
}

impl RootConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arbiter_addr: None,
            modules: vec![],
            loglevel: None,
        }
    }

    #[must_use]
    pub fn arbiter_addr(mut self, addr: NetAddr) -> Self {
        self.arbiter_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn expose(mut self, module: ModuleDef) -> Self {
        self.modules.push(module);
        self
    }

    #[must_use]
    pub fn loglevel(mut self, level: impl Into<String>) -> Self {
        self.loglevel = Some(level.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RootError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("root startup failed: {0}")]
    Startup(String),
}

/// Quick connect-then-drop probe for a live arbiter listener.
async fn arbiter_reachable(addr: &NetAddr) -> bool {
    matches!(
        timeout(
            ARBITER_PROBE_TIMEOUT,
            TcpStream::connect((addr.0.as_str(), addr.1)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Bring up the tree and run `body` with the root actor. Tears everything
/// down afterwards, including an arbiter spawned here.
///
/// # Errors
///
/// Startup failures, or whatever `body` raises.
pub async fn run<T, F, Fut>(config: RootConfig, body: F) -> Result<T, RootError>
where
    F: FnOnce(Arc<Actor>) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let backend = ThreadSpawner;

    // Find or found the registry.
    let mut spawned_arbiter: Option<SpawnHandle> = None;
    let reachable = match &config.arbiter_addr {
        Some(addr) => arbiter_reachable(addr).await.then(|| addr.clone()),
        None => None,
    };
    let arbiter_addr = match reachable {
        Some(addr) => addr,
        None => {
            let mut spec = ActorSpec::new("arbiter");
            spec.is_arbiter = true;
            if let Some(addr) = &config.arbiter_addr {
                spec.bind = addr.clone();
            }
            spec.loglevel = config.loglevel.clone();
            let mut handle = backend.spawn(spec)?;
            let addr = timeout(ROOT_START_TIMEOUT, handle.wait_started())
                .await
                .map_err(|_| RootError::Startup("arbiter startup timed out".into()))??;
            tracing::debug!(?addr, "spawned arbiter");
            spawned_arbiter = Some(handle);
            addr
        }
    };

    // The root actor runs on this runtime.
    let mut builder = ActorBuilder::new(config.name.clone())
        .arbiter_addr(arbiter_addr.clone());
    for module in config.modules.clone() {
        builder = builder.expose(module);
    }
    if let Some(level) = config.loglevel.clone() {
        builder = builder.loglevel(level);
    }
    let actor = builder.build();
    set_current_actor(&actor);

    let (started_tx, started_rx) = oneshot::channel();
    let main_task = tokio::spawn(actor.clone().async_main(
        ("127.0.0.1".to_string(), 0),
        None,
        started_tx,
    ));

    let startup = timeout(ROOT_START_TIMEOUT, started_rx).await;
    let result = match startup {
        Err(_) | Ok(Err(_)) => {
            Err(RootError::Startup("root actor never came up".into()))
        }
        Ok(Ok(_addr)) => body(actor.clone()).await.map_err(RootError::from),
    };

    // Teardown: root actor first, then the arbiter we may have spawned.
    actor.cancel().await;
    let mut main_task = main_task;
    if timeout(ROOT_STOP_TIMEOUT, &mut main_task).await.is_err() {
        tracing::warn!("root actor runtime did not stop in time");
        main_task.abort();
    }

    if let Some(handle) = spawned_arbiter {
        // Root-token cancel runs the arbiter's normal shutdown sequence.
        handle.hard_kill();
        if timeout(ROOT_STOP_TIMEOUT, handle.wait()).await.is_err() {
            tracing::warn!("arbiter did not stop in time");
        }
    }

    result
}
