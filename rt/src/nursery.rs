// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Structured supervision of child actors.
//!
//! [`open_nursery`] runs a body with a [`Nursery`] handle that can spawn
//! long-lived daemon actors ([`Nursery::start_actor`]) and one-shot task
//! actors ([`Nursery::run_in_actor`]). The scope cannot exit until every
//! child has terminated. Any child failure cancels all siblings; the scope
//! then raises a [`CompositeError`] carrying every collected failure with
//! its original kind.

use std::{sync::{Arc, Mutex as StdMutex,
                 atomic::{AtomicBool, Ordering}},
          time::Duration};

use futures_util::{StreamExt, future::join_all, stream::FuturesUnordered};
use serde::Serialize;
use tokio::{sync::mpsc, time::timeout};

use crate::{Packet, ParentHello, RuntimeVars, Uid, msgpack_serde,
            portal::{Portal, drain_single},
            runtime::{actor::Actor,
                      dispatch::ModuleDef,
                      errors::{CompositeError, RpcError},
                      scope::Latch,
                      spawn::{ActorSpec, SpawnBackend, ThreadSpawner},
                      task_table::TaskKey}};

/// How long a child gets to connect back and finish its startup sequence.
const CHILD_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for a soft-cancelled child to exit before the hard kill.
const CHILD_REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// After the first task failure, how long concurrently-failing siblings get
/// to deliver their own results before the stragglers are cancelled. Keeps
/// the composite carrying every real failure instead of racing the cancel.
const SIBLING_RESULT_GRACE: Duration = Duration::from_secs(1);

/// One outstanding `run_in_actor` result.
struct Pending {
    key: TaskKey,
    rx: mpsc::Receiver<Packet>,
}

struct Child {
    name: String,
    uid: Uid,
    /// The hosted actor (in-process backend); used for last-resort
    /// teardown.
    actor_ref: Arc<Actor>,
    done: Latch,
    portal: Portal,
    /// True for `run_in_actor` children (one job, then reaped).
    ran_task: bool,
    pending: Option<Pending>,
}

struct NurseryInner {
    parent: Arc<Actor>,
    backend: Arc<dyn SpawnBackend>,
    children: StdMutex<Vec<Child>>,
    cancelled: AtomicBool,
}

/// Handle passed to the nursery body; clonable into spawned helpers.
#[derive(Clone)]
pub struct Nursery {
    inner: Arc<NurseryInner>,
}

impl std::fmt::Debug for Nursery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nursery")
            .field("children", &self.inner.children.lock().unwrap().len())
            .field("cancelled", &self.cancelled())
            .finish_non_exhaustive()
    }
}

impl Nursery {
    /// Whether this scope was cancelled (by a failure or explicitly).
    #[must_use]
    pub fn cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::Relaxed) }

    #[must_use]
    pub fn child_count(&self) -> usize { self.inner.children.lock().unwrap().len() }

    /// Spawn a long-lived daemon actor exposing `modules`, and wait for its
    /// startup to complete. The returned portal speaks over the child's
    /// connect-back channel.
    ///
    /// # Errors
    ///
    /// Spawn/startup failures and transport errors while greeting the
    /// child.
    pub async fn start_actor(
        &self,
        name: &str,
        modules: Vec<ModuleDef>,
    ) -> Result<Portal, RpcError> {
        self.start_child(name, modules).await.map(|(_, portal)| portal)
    }

    /// Spawn an actor whose sole job is one invocation of `func` from
    /// `module`; the result is collected when the nursery exits. The child
    /// is cancelled once its result is in.
    ///
    /// # Errors
    ///
    /// Spawn/startup failures and transport errors while issuing the call.
    pub async fn run_in_actor<A: Serialize>(
        &self,
        name: &str,
        module: ModuleDef,
        func: &str,
        args: &A,
    ) -> Result<Portal, RpcError> {
        let ns = module.name().to_string();
        let (index, portal) = self.start_child(name, vec![module]).await?;

        let kwargs = msgpack_serde::try_serialize(args)?;
        let (cid, rx) = self
            .inner
            .parent
            .send_cmd(portal.channel(), &ns, func, kwargs)
            .await?;
        let peer = portal
            .peer_uid()
            .ok_or_else(|| RpcError::Protocol("child channel lost its uid".into()))?;

        let mut children = self.inner.children.lock().unwrap();
        if let Some(child) = children.get_mut(index) {
            child.ran_task = true;
            child.pending = Some(Pending {
                key: (peer, cid),
                rx,
            });
        }
        Ok(portal)
    }

    /// Cancel every child (idempotent). The nursery reports
    /// `cancelled == true` afterwards.
    pub async fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        let portals: Vec<Portal> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|child| child.portal.clone())
            .collect();
        if portals.is_empty() {
            return;
        }
        tracing::debug!(count = portals.len(), "cancelling nursery children");
        join_all(portals.iter().map(Portal::cancel_actor)).await;
    }

    async fn start_child(
        &self,
        name: &str,
        modules: Vec<ModuleDef>,
    ) -> Result<(usize, Portal), RpcError> {
        let parent = &self.inner.parent;
        let Some(parent_addr) = parent.listen_addr() else {
            return Err(RpcError::Protocol(
                "parent actor is not serving yet".into(),
            ));
        };

        let mut spec = ActorSpec::new(name);
        spec.modules = modules;
        spec.parent_addr = Some(parent_addr);
        spec.arbiter_addr = parent.arbiter_addr();
        spec.loglevel = parent.loglevel();
        let uid = spec.uid.clone();

        tracing::debug!(child = name, %uid, "spawning child actor");
        let mut handle = self
            .inner
            .backend
            .spawn(spec)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;

        // The child connects back to us; that channel is the portal's.
        let chan = timeout(CHILD_START_TIMEOUT, parent.wait_for_peer(&uid))
            .await
            .map_err(|_| {
                RpcError::Protocol(format!("child {name} never connected back"))
            })?;

        // Greet it with runtime state; it applies this before binding its
        // listener.
        let parent_vars = parent.runtime_vars();
        let hello = ParentHello {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            arbiter_addr: parent.arbiter_addr(),
            runtime_vars: RuntimeVars {
                is_root: false,
                loglevel: parent.loglevel(),
                root_mailbox: parent_vars.root_mailbox,
            },
        };
        chan.send_value(&hello).await.map_err(RpcError::from)?;

        timeout(CHILD_START_TIMEOUT, handle.wait_started())
            .await
            .map_err(|_| RpcError::Protocol(format!("child {name} startup timed out")))?
            .map_err(|err| RpcError::Protocol(err.to_string()))?;

        let portal = Portal::new(parent.clone(), chan);
        let mut children = self.inner.children.lock().unwrap();
        let index = children.len();
        children.push(Child {
            name: name.to_string(),
            uid,
            actor_ref: handle.actor().clone(),
            done: handle.done_latch(),
            portal: portal.clone(),
            ran_task: false,
            pending: None,
        });
        Ok((index, portal))
    }

    fn take_pendings(&self) -> Vec<(String, Pending)> {
        let mut children = self.inner.children.lock().unwrap();
        children
            .iter_mut()
            .filter_map(|child| {
                child
                    .pending
                    .take()
                    .map(|pending| (child.name.clone(), pending))
            })
            .collect()
    }

    /// Wait for every child to terminate; escalate to a hard kill after the
    /// grace period.
    async fn reap_all(&self) {
        let snapshot: Vec<(String, Uid, Arc<Actor>, Latch)> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|child| {
                (
                    child.name.clone(),
                    child.uid.clone(),
                    child.actor_ref.clone(),
                    child.done.clone(),
                )
            })
            .collect();

        for (name, uid, actor_ref, done) in snapshot {
            if timeout(CHILD_REAP_TIMEOUT, done.wait()).await.is_err() {
                tracing::warn!(child = %name, %uid, "child did not exit; hard killing");
                actor_ref.root_group().token().cancel();
                done.wait().await;
            }
        }
        self.inner.children.lock().unwrap().clear();
    }
}

/// Open a nursery scope on `parent` with the default in-process spawn
/// backend.
///
/// # Errors
///
/// A [`CompositeError`] carrying every child failure (and the body's, if
/// any), each with its original kind.
pub async fn open_nursery<T, F, Fut>(
    parent: &Arc<Actor>,
    body: F,
) -> Result<T, CompositeError>
where
    F: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    open_nursery_with(Arc::new(ThreadSpawner), parent, body).await
}

/// Like [`open_nursery`] with an explicit spawn backend.
///
/// # Errors
///
/// See [`open_nursery`].
pub async fn open_nursery_with<T, F, Fut>(
    backend: Arc<dyn SpawnBackend>,
    parent: &Arc<Actor>,
    body: F,
) -> Result<T, CompositeError>
where
    F: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let nursery = Nursery {
        inner: Arc::new(NurseryInner {
            parent: parent.clone(),
            backend,
            children: StdMutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }),
    };

    let body_result = body(nursery.clone()).await;

    let mut errors: Vec<RpcError> = Vec::new();

    // Collect one-shot results. The first failure triggers the
    // cancel-everyone strategy (the only supervisory strategy there is):
    // daemons are cancelled at once, while sibling tasks get a short grace
    // so concurrently-failing ones deliver their own results - the
    // composite must carry every real failure, not a cancel race.
    let mut collectors = FuturesUnordered::new();
    for (name, mut pending) in nursery.take_pendings() {
        let parent = parent.clone();
        collectors.push(async move {
            let result = drain_single(&mut pending.rx).await;
            parent.reply_queues().remove(&pending.key);
            (name, result)
        });
    }
    let had_pendings = !collectors.is_empty();
    let mut failed = false;
    let mut grace_spent = false;
    loop {
        let next = if failed && !grace_spent {
            match timeout(SIBLING_RESULT_GRACE, collectors.next()).await {
                Ok(item) => item,
                Err(_elapsed) => {
                    // Stragglers are cancelled; their results resolve as
                    // transport-closed below.
                    grace_spent = true;
                    nursery.cancel().await;
                    collectors.next().await
                }
            }
        } else {
            collectors.next().await
        };
        let Some((name, result)) = next else { break };
        match result {
            Ok(_value) => {
                tracing::debug!(child = %name, "one-shot child completed");
            }
            Err(err) => {
                tracing::debug!(child = %name, kind = %err.kind(), "child task failed");
                errors.push(err);
                if !failed {
                    failed = true;
                    nursery.cancel_daemon_children().await;
                }
            }
        }
    }
    if failed {
        // Everyone goes, idempotently.
        nursery.cancel().await;
    } else if had_pendings {
        // One-shot children are done with their single job.
        nursery.cancel_task_children().await;
    }

    match body_result {
        Ok(value) => {
            if errors.is_empty() {
                // Clean exit still cannot outlive the children: daemons run
                // until somebody cancels them.
                nursery.reap_all().await;
                Ok(value)
            } else {
                nursery.reap_all().await;
                Err(CompositeError { errors })
            }
        }
        Err(body_err) => {
            if !nursery.cancelled() {
                nursery.cancel().await;
            }
            nursery.reap_all().await;
            // The body frequently re-raises a child's error; don't count it
            // twice.
            let duplicate = errors.iter().any(|err| {
                err.kind() == body_err.kind() && err.to_string() == body_err.to_string()
            });
            if !duplicate {
                errors.insert(0, body_err);
            }
            Err(CompositeError { errors })
        }
    }
}

impl Nursery {
    /// Cancel only the one-shot (task) children; daemons keep running.
    async fn cancel_task_children(&self) {
        let task_portals: Vec<Portal> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .filter(|child| child.ran_task)
            .map(|child| child.portal.clone())
            .collect();
        if task_portals.is_empty() {
            return;
        }
        join_all(task_portals.iter().map(Portal::cancel_actor)).await;
    }

    /// Cancel only the daemon children (the first step of the
    /// some-cancels-all strategy).
    async fn cancel_daemon_children(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
        let daemon_portals: Vec<Portal> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .filter(|child| !child.ran_task)
            .map(|child| child.portal.clone())
            .collect();
        if daemon_portals.is_empty() {
            return;
        }
        tracing::debug!(count = daemon_portals.len(), "cancelling daemon children");
        join_all(daemon_portals.iter().map(Portal::cancel_actor)).await;
    }
}
