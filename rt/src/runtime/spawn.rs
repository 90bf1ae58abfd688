// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Spawn backends: how new actors come into existence.
//!
//! Process-spawning mechanics are an external collaborator - the runtime
//! only defines the [`SpawnBackend`] interface and ships the in-process
//! [`ThreadSpawner`], which gives each actor its own OS thread running a
//! dedicated current-thread tokio runtime. Scheduling semantics are
//! identical to a separate process (one cooperative scheduler per actor, no
//! shared tasks); communication runs over the same TCP channels either way.

use std::{cell::RefCell, sync::Arc};

use tokio::sync::oneshot;

use crate::{NetAddr, Uid,
            runtime::{actor::{Actor, ActorBuilder},
                      dispatch::ModuleDef,
                      scope::Latch}};

thread_local! {
    static CURRENT_ACTOR: RefCell<Option<Arc<Actor>>> = const { RefCell::new(None) };
}

/// The actor hosted by the current thread's runtime, if any.
#[must_use]
pub fn current_actor() -> Option<Arc<Actor>> {
    CURRENT_ACTOR.with(|cell| cell.borrow().clone())
}

/// Bind an actor to the current thread (the spawn backend and the root
/// entrypoint both do this before running the actor's tree).
pub fn set_current_actor(actor: &Arc<Actor>) {
    CURRENT_ACTOR.with(|cell| *cell.borrow_mut() = Some(actor.clone()));
}

/// Everything needed to bring up one actor.
#[derive(Debug, Clone)]
pub struct ActorSpec {
    pub name: String,
    /// Minted by the parent so it can await the connect-back.
    pub uid: Uid,
    pub modules: Vec<ModuleDef>,
    /// Listener of the parent actor; `None` for root-most actors.
    pub parent_addr: Option<NetAddr>,
    pub arbiter_addr: Option<NetAddr>,
    /// Requested bind address (port 0 = ephemeral). A child's parent
    /// overrides this via the runtime-variables hello.
    pub bind: NetAddr,
    pub loglevel: Option<String>,
    pub is_arbiter: bool,
}

impl ActorSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uid: Uid::generate(name.clone()),
            name,
            modules: vec![],
            parent_addr: None,
            arbiter_addr: None,
            bind: ("127.0.0.1".to_string(), 0),
            loglevel: None,
            is_arbiter: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn actor host thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("actor exited before completing startup")]
    StartupFailed,

    #[error("spawn handle already consumed")]
    AlreadyStarted,
}

/// A handle on a spawned actor, owned by the spawner (normally a nursery).
pub struct SpawnHandle {
    uid: Uid,
    actor: Arc<Actor>,
    started: Option<oneshot::Receiver<NetAddr>>,
    done: Latch,
}

impl std::fmt::Debug for SpawnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnHandle")
            .field("uid", &self.uid)
            .field("done", &self.done.is_set())
            .finish_non_exhaustive()
    }
}

impl SpawnHandle {
    #[must_use]
    pub fn uid(&self) -> &Uid { &self.uid }

    /// The hosted actor (in-process backends only).
    #[must_use]
    pub fn actor(&self) -> &Arc<Actor> { &self.actor }

    /// Wait for the actor's startup sequence to complete; yields its actual
    /// listen address.
    ///
    /// # Errors
    ///
    /// [`SpawnError::StartupFailed`] when the actor dies before announcing
    /// itself, [`SpawnError::AlreadyStarted`] on a second call.
    pub async fn wait_started(&mut self) -> Result<NetAddr, SpawnError> {
        let receiver = self.started.take().ok_or(SpawnError::AlreadyStarted)?;
        receiver.await.map_err(|_| SpawnError::StartupFailed)
    }

    /// Wait for the actor's runtime to finish completely.
    pub async fn wait(&self) { self.done.wait().await; }

    pub(crate) fn done_latch(&self) -> Latch { self.done.clone() }

    #[must_use]
    pub fn is_done(&self) -> bool { self.done.is_set() }

    /// Local teardown: trip the actor's root scope. Runs the same
    /// deterministic cancel sequence as a remote `self.cancel`, without the
    /// round trip.
    pub fn hard_kill(&self) {
        tracing::debug!(uid = %self.uid, "cancelling actor via its root scope");
        self.actor.root_group().token().cancel();
    }
}

/// How new actors come into existence. Implementations must deliver a fully
/// isolated cooperative scheduler per actor.
pub trait SpawnBackend: Send + Sync {
    /// Launch an actor per `spec`.
    ///
    /// # Errors
    ///
    /// Backend-specific launch failures.
    fn spawn(&self, spec: ActorSpec) -> Result<SpawnHandle, SpawnError>;
}

/// The in-process backend: one OS thread + one current-thread tokio runtime
/// per actor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl SpawnBackend for ThreadSpawner {
    fn spawn(&self, spec: ActorSpec) -> Result<SpawnHandle, SpawnError> {
        let mut builder = ActorBuilder::new(spec.name.clone()).uid(spec.uid.clone());
        for module in spec.modules.clone() {
            builder = builder.expose(module);
        }
        if let Some(arbiter_addr) = spec.arbiter_addr.clone() {
            builder = builder.arbiter_addr(arbiter_addr);
        }
        if let Some(level) = spec.loglevel.clone() {
            builder = builder.loglevel(level);
        }
        if spec.is_arbiter {
            builder = builder.as_arbiter();
        }
        let actor = builder.build();

        let (started_tx, started_rx) = oneshot::channel();
        let done = Latch::new();

        let thread_actor = actor.clone();
        let thread_done = done.clone();
        let bind = spec.bind.clone();
        let parent_addr = spec.parent_addr.clone();
        std::thread::Builder::new()
            .name(format!("actor-{}", spec.name))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(%err, "could not build actor runtime");
                        thread_done.set();
                        return;
                    }
                };
                set_current_actor(&thread_actor);
                runtime.block_on(async move {
                    if let Err(err) = thread_actor
                        .clone()
                        .async_main(bind, parent_addr, started_tx)
                        .await
                    {
                        tracing::error!(%err, "actor runtime errored");
                    }
                });
                thread_done.set();
            })?;

        Ok(SpawnHandle {
            uid: spec.uid,
            actor,
            started: Some(started_rx),
            done,
        })
    }
}
