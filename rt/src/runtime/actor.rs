// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The fundamental concurrency primitive.
//!
//! An *actor* is a process executing a cooperatively scheduled task tree,
//! communicating with other actors through channels. The [`Actor`]
//! supervisor owns that tree: the channel-server accept loop, one message
//! loop per peer connection, the upstream connection to the parent, and the
//! lifecycle (startup handshake, registry enrollment, shutdown,
//! unregister).
//!
//! Startup ordering is strict: parent handshake → listener up → publish the
//! actual `(host, port)` → register with the arbiter → parent message loop →
//! announce started. The cancel sequence is idempotent and shielded; see
//! [`Actor::cancel`].

use std::{collections::HashMap,
          sync::{Arc, Mutex as StdMutex, OnceLock,
                 atomic::{AtomicBool, Ordering}}};

use serde_bytes::ByteBuf;
use tokio::{net::{TcpListener, TcpStream},
            sync::{mpsc, oneshot},
            time::timeout};

use crate::{CallId, Channel, NetAddr, Packet, ParentHello, RuntimeVars, Uid,
            runtime::{arbiter::{Registry, UnregisterArgs, registry_module},
                      dispatch::{DispatchTable, Dispatcher, ModuleDef},
                      errors::{ActorError, RpcError, kind, pack_error},
                      msg_loop::process_messages,
                      scope::{Latch, TaskGroup},
                      task_table::{ReplyQueues, RpcTasks, TaskKey}}};

const UNREGISTER_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

/// Construction-time description of an actor.
#[derive(Debug)]
pub struct ActorBuilder {
    name: String,
    uid: Option<Uid>,
    modules: Vec<ModuleDef>,
    arbiter_addr: Option<NetAddr>,
    is_arbiter: bool,
    loglevel: Option<String>,
}

impl ActorBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            modules: vec![],
            arbiter_addr: None,
            is_arbiter: false,
            loglevel: None,
        }
    }

    /// Use a pre-minted uid (the parent mints its children's uids so it can
    /// await their connect-back).
    #[must_use]
    pub fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Expose a module to remote callers.
    #[must_use]
    pub fn expose(mut self, module: ModuleDef) -> Self {
        self.modules.push(module);
        self
    }

    #[must_use]
    pub fn arbiter_addr(mut self, addr: NetAddr) -> Self {
        self.arbiter_addr = Some(addr);
        self
    }

    /// Make this actor the name registry itself.
    #[must_use]
    pub fn as_arbiter(mut self) -> Self {
        self.is_arbiter = true;
        self
    }

    #[must_use]
    pub fn loglevel(mut self, level: impl Into<String>) -> Self {
        self.loglevel = Some(level.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Actor> {
        let uid = self
            .uid
            .unwrap_or_else(|| Uid::generate(self.name.clone()));
        let registry = self.is_arbiter.then(|| Arc::new(Registry::default()));
        let self_module = registry
            .as_ref()
            .map_or_else(|| ModuleDef::new("self"), registry_module);

        Arc::new(Actor {
            uid,
            is_arbiter: self.is_arbiter,
            registry,
            self_module,
            dispatch: DispatchTable::new(self.modules),
            arbiter_addr: StdMutex::new(self.arbiter_addr),
            loglevel: StdMutex::new(self.loglevel),
            rpc_tasks: RpcTasks::default(),
            reply_queues: ReplyQueues::default(),
            peers: StdMutex::new(HashMap::new()),
            peer_connected: StdMutex::new(HashMap::new()),
            no_more_peers: Latch::new_set(),
            cancel_called: AtomicBool::new(false),
            cancel_complete: Latch::new(),
            registered: AtomicBool::new(false),
            root: TaskGroup::new("root"),
            service: TaskGroup::new("service"),
            server: TaskGroup::new("server"),
            server_down: Latch::new_set(),
            listen_addr: StdMutex::new(None),
            parent_chan: OnceLock::new(),
            runtime_vars: StdMutex::new(RuntimeVars {
                is_root: true,
                ..RuntimeVars::default()
            }),
            lifetime_stack: StdMutex::new(Vec::new()),
        })
    }
}

type LifetimeHook = Box<dyn FnOnce() + Send>;

pub struct Actor {
    uid: Uid,
    is_arbiter: bool,
    /// Present only on the arbiter.
    registry: Option<Arc<Registry>>,
    /// The privileged `self` namespace (registry verbs on the arbiter,
    /// empty elsewhere; `cancel` / `_cancel_task` are handled by the message
    /// loop directly).
    self_module: ModuleDef,
    dispatch: DispatchTable,
    arbiter_addr: StdMutex<Option<NetAddr>>,
    loglevel: StdMutex<Option<String>>,

    rpc_tasks: RpcTasks,
    reply_queues: ReplyQueues,

    /// uid → channels, inbound and outbound alike.
    peers: StdMutex<HashMap<Uid, Vec<Arc<Channel>>>>,
    /// Latches for tasks awaiting a connect-back from a spawned actor.
    peer_connected: StdMutex<HashMap<Uid, Latch>>,
    /// Set whenever the peer table is empty.
    no_more_peers: Latch,

    cancel_called: AtomicBool,
    cancel_complete: Latch,
    registered: AtomicBool,

    /// Outer scope: keeps the parent channel path alive until the service
    /// scope has drained.
    root: TaskGroup,
    /// Message loops and invocation tasks.
    service: TaskGroup,
    /// The listener accept loop.
    server: TaskGroup,
    server_down: Latch,

    listen_addr: StdMutex<Option<NetAddr>>,
    parent_chan: OnceLock<Arc<Channel>>,
    runtime_vars: StdMutex<RuntimeVars>,
    /// Process-wide scoped resources, closed exactly once at runtime
    /// teardown.
    lifetime_stack: StdMutex<Vec<LifetimeHook>>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("uid", &self.uid)
            .field("is_arbiter", &self.is_arbiter)
            .field("listen_addr", &self.listen_addr.lock().unwrap())
            .field("cancel_called", &self.cancel_called.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Actor {
    #[must_use]
    pub fn uid(&self) -> &Uid { &self.uid }

    #[must_use]
    pub fn name(&self) -> &str { self.uid.name() }

    #[must_use]
    pub fn is_arbiter(&self) -> bool { self.is_arbiter }

    /// Address of the bound listener, available once serving.
    #[must_use]
    pub fn listen_addr(&self) -> Option<NetAddr> {
        self.listen_addr.lock().unwrap().clone()
    }

    #[must_use]
    pub fn arbiter_addr(&self) -> Option<NetAddr> {
        self.arbiter_addr.lock().unwrap().clone()
    }

    #[must_use]
    pub fn loglevel(&self) -> Option<String> { self.loglevel.lock().unwrap().clone() }

    #[must_use]
    pub fn runtime_vars(&self) -> RuntimeVars {
        self.runtime_vars.lock().unwrap().clone()
    }

    #[must_use]
    pub fn cancel_called(&self) -> bool { self.cancel_called.load(Ordering::Relaxed) }

    pub(crate) fn rpc_tasks(&self) -> &RpcTasks { &self.rpc_tasks }

    pub(crate) fn reply_queues(&self) -> &ReplyQueues { &self.reply_queues }

    pub(crate) fn dispatch(&self) -> &DispatchTable { &self.dispatch }

    pub(crate) fn service_group(&self) -> &TaskGroup { &self.service }

    pub(crate) fn root_group(&self) -> &TaskGroup { &self.root }

    pub(crate) fn self_dispatcher(&self, func: &str) -> Option<Dispatcher> {
        self.self_module.get(func).cloned()
    }

    /// The registry, when this actor is the arbiter.
    #[must_use]
    pub fn registry(&self) -> Option<&Arc<Registry>> { self.registry.as_ref() }

    /// Register a scoped resource closed at runtime teardown (LIFO).
    pub fn push_lifetime_hook<F: FnOnce() + Send + 'static>(&self, hook: F) {
        self.lifetime_stack.lock().unwrap().push(Box::new(hook));
    }

    /// All channels to the actor with the provided uid.
    #[must_use]
    pub fn get_chans(&self, uid: &Uid) -> Vec<Arc<Channel>> {
        self.peers.lock().unwrap().get(uid).cloned().unwrap_or_default()
    }

    /// Wait for a connection back from a spawned actor with the given uid.
    pub async fn wait_for_peer(&self, uid: &Uid) -> Arc<Channel> {
        loop {
            let mut chans = self.get_chans(uid);
            if let Some(chan) = chans.pop() {
                return chan;
            }
            tracing::debug!(%uid, "waiting for peer to connect");
            let latch = self
                .peer_connected
                .lock()
                .unwrap()
                .entry(uid.clone())
                .or_default()
                .clone();
            latch.wait().await;
            tracing::debug!(%uid, "peer connected back to us");
        }
    }

    // ------------------------------------------------------------------
    // Channel adoption
    // ------------------------------------------------------------------

    fn register_peer(&self, chan: &Arc<Channel>) {
        let Some(uid) = chan.peer_uid() else { return };
        self.no_more_peers.clear();
        self.peers
            .lock()
            .unwrap()
            .entry(uid.clone())
            .or_default()
            .push(chan.clone());
        tracing::debug!(peer = %uid, "registered channel");

        // Alert any task waiting on this connection to come up.
        let waiter = self.peer_connected.lock().unwrap().remove(&uid);
        if let Some(latch) = waiter {
            latch.set();
        }
    }

    /// Entry point for new inbound connections from the channel server.
    pub(crate) async fn handle_stream(self: Arc<Self>, stream: TcpStream) {
        let chan = match Channel::from_stream(stream) {
            Ok(chan) => Arc::new(chan),
            Err(err) => {
                tracing::warn!(%err, "could not adopt inbound stream");
                return;
            }
        };
        // A peer hanging up mid-handshake is a non-event.
        if let Err(err) = chan.try_handshake(&self.uid).await {
            tracing::warn!(%err, "channel failed to handshake");
            return;
        }
        self.register_peer(&chan);
        self.run_channel(chan).await;
    }

    /// Open an outbound channel to another actor and adopt it into the peer
    /// table (connections are symmetric after the handshake).
    ///
    /// # Errors
    ///
    /// Transport errors from connect/handshake.
    pub async fn open_channel_to(
        self: &Arc<Self>,
        addr: &NetAddr,
    ) -> Result<Arc<Channel>, ActorError> {
        let chan = Arc::new(Channel::connect(addr).await?);
        chan.try_handshake(&self.uid).await?;
        self.register_peer(&chan);
        let this = self.clone();
        let loop_chan = chan.clone();
        self.service.spawn(async move { this.run_channel(loop_chan).await });
        Ok(chan)
    }

    /// Drive a channel's message loop to completion, then release it.
    pub(crate) async fn run_channel(self: &Arc<Self>, chan: Arc<Channel>) {
        let loop_token = self.service.token().child_token();
        let result = process_messages(self.clone(), chan.clone(), loop_token).await;

        if let Err(err) = result {
            // Internal (non-RPC) machinery failure: ship to the parent
            // without a cid so it surfaces at every consuming portal, then
            // bring the whole actor down.
            tracing::error!(%err, "actor errored in message loop");
            if let Some(parent) = self.parent_chan.get() {
                let packed = pack_error(
                    kind::UNKNOWN,
                    err.to_string(),
                    format!("{err:?}"),
                    &self.uid,
                );
                parent
                    .send(&Packet::Error {
                        error: packed,
                        cid: None,
                    })
                    .await
                    .ok();
            }
            let this = self.clone();
            tokio::spawn(async move {
                this.cancel().await;
            });
        }

        self.release_channel(&chan).await;
    }

    /// Channel cleanup sequence: drop it from the peer table, fail in-flight
    /// callers when the peer has no channels left, signal `no_more_peers`,
    /// and politely terminate the far end's loop if the transport is still
    /// up.
    async fn release_channel(&self, chan: &Arc<Channel>) {
        let Some(uid) = chan.peer_uid() else { return };

        let mut last_channel_for_peer = false;
        {
            let mut peers = self.peers.lock().unwrap();
            if let Some(list) = peers.get_mut(&uid) {
                list.retain(|other| !Arc::ptr_eq(other, chan));
                if list.is_empty() {
                    peers.remove(&uid);
                    last_channel_for_peer = true;
                }
            }
            if peers.is_empty() {
                tracing::debug!("no more peer channels");
                self.no_more_peers.set();
            }
        }
        tracing::debug!(peer = %uid, "released channel");

        if last_channel_for_peer {
            let dropped = self.reply_queues.remove_peer(&uid);
            if dropped > 0 {
                tracing::debug!(
                    peer = %uid,
                    dropped,
                    "failed in-flight calls bound to departed peer"
                );
            }
        }

        if !chan.is_closed() {
            chan.aclose().await;
        }
    }

    // ------------------------------------------------------------------
    // Outbound calls
    // ------------------------------------------------------------------

    /// Send a `cmd` to a remote actor; returns the call-id and the reply
    /// queue the local message loop will fill.
    ///
    /// # Errors
    ///
    /// `transport-closed` if the channel is gone.
    pub(crate) async fn send_cmd(
        &self,
        chan: &Arc<Channel>,
        ns: &str,
        func: &str,
        kwargs: Vec<u8>,
    ) -> Result<(CallId, mpsc::Receiver<Packet>), RpcError> {
        let Some(peer) = chan.peer_uid() else {
            return Err(RpcError::Protocol("channel has no peer uid yet".into()));
        };
        let cid = CallId::fresh();
        let key: TaskKey = (peer, cid.clone());

        // Pre-create the reply queue so a fast reply cannot race us.
        let receiver = self
            .reply_queues
            .take_receiver(&key)
            .ok_or_else(|| RpcError::Protocol("duplicate call-id".into()))?;

        tracing::debug!(peer = %key.0, func = %format!("{ns}.{func}"), %cid, "sending cmd");
        let sent = chan
            .send(&Packet::Cmd {
                ns: ns.to_string(),
                func: func.to_string(),
                kwargs: ByteBuf::from(kwargs),
                caller: self.uid.clone(),
                cid: cid.clone(),
            })
            .await;
        match sent {
            Ok(()) => Ok((cid, receiver)),
            Err(err) => {
                self.reply_queues.remove(&key);
                if err.is_peer_gone() {
                    Err(RpcError::TransportClosed)
                } else {
                    Err(RpcError::Protocol(err.to_string()))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the channel server, maybe connect back to the parent, register,
    /// and serve until cancelled.
    ///
    /// `started` fires with the actual listen address once the startup
    /// sequence is complete (the spawner's equivalent of a nursery `start`).
    ///
    /// # Errors
    ///
    /// Fatal startup failures (parent unreachable, bind failure, arbiter
    /// unreachable); these are also shipped to the parent when one exists.
    pub async fn async_main(
        self: Arc<Self>,
        bind: NetAddr,
        parent_addr: Option<NetAddr>,
        started: oneshot::Sender<NetAddr>,
    ) -> Result<(), ActorError> {
        let result = self.main_inner(bind, parent_addr, started).await;

        if let Err(err) = &result {
            tracing::error!(uid = %self.uid, %err, "actor errored");
            // Ship the failure upstream (no cid: channel-level), shielded.
            if let Some(parent) = self.parent_chan.get() {
                let packed = pack_error(
                    kind::UNKNOWN,
                    err.to_string(),
                    format!("{err:?}"),
                    &self.uid,
                );
                if parent
                    .send(&Packet::Error {
                        error: packed,
                        cid: None,
                    })
                    .await
                    .is_err()
                {
                    tracing::error!("failed to ship error to parent; channel closed");
                }
            }
            // Unwind whatever partial tree exists.
            self.cancel().await;
            self.server.wait().await;
            self.service.wait().await;
            if let Some(parent) = self.parent_chan.get() {
                parent.aclose().await;
            }
            self.root.wait().await;
        }

        // Teardown that must happen exactly once, error or not.
        self.close_lifetime_stack();
        self.maybe_unregister().await;
        self.wait_remaining_peers().await;
        tracing::debug!(uid = %self.uid, "runtime completed");
        result
    }

    async fn main_inner(
        self: &Arc<Self>,
        bind: NetAddr,
        parent_addr: Option<NetAddr>,
        started: oneshot::Sender<NetAddr>,
    ) -> Result<(), ActorError> {
        let mut bind = bind;

        // 1. Establish the primary connection with the immediate parent.
        if let Some(parent_addr) = parent_addr {
            let (chan, accept_addr) = self.from_parent(&parent_addr).await?;
            self.parent_chan.set(chan).ok();
            if let Some(accept_addr) = accept_addr {
                bind = accept_addr;
            }
        }

        // 2. The module allow-list is static (built at construction); there
        // is nothing to load dynamically.

        // 3. Start the channel server; only then is the actual address
        // known and publishable.
        let listener = TcpListener::bind((bind.0.as_str(), bind.1))
            .await
            .map_err(|err| {
                ActorError::Startup(format!("failed to bind listener on {bind:?}: {err}"))
            })?;
        let actual = listener
            .local_addr()
            .map_err(|err| ActorError::Startup(err.to_string()))?;
        let listen_addr = (bind.0.clone(), actual.port());
        *self.listen_addr.lock().unwrap() = Some(listen_addr.clone());
        {
            let mut vars = self.runtime_vars.lock().unwrap();
            if vars.is_root {
                vars.root_mailbox = Some(listen_addr.clone());
            }
        }
        self.server_down.clear();
        let this = self.clone();
        self.server.spawn(this.serve(listener));

        // 4. Register with the arbiter. Only after acknowledgement are we
        // discoverable.
        self.register_with_arbiter(&listen_addr).await?;

        // 5. Begin handling the connection back to our parent. Done last so
        // we don't process parent requests until the server is fully up.
        // The loop lives in the root scope: a service-group cancellation
        // does not sever the parent path until the service group drains.
        if let Some(parent) = self.parent_chan.get().cloned() {
            let this = self.clone();
            let token = self.root.token().child_token();
            self.root.spawn(async move {
                let peer = parent.peer_uid();
                if let Err(err) =
                    process_messages(this.clone(), parent.clone(), token).await
                {
                    tracing::error!(%err, "parent channel message loop errored");
                }
                // Fail any calls we still had pending on the parent.
                if let Some(peer) = peer {
                    this.reply_queues().remove_peer(&peer);
                }
            });
        }

        // 6. Init steps complete.
        started.send(listen_addr.clone()).ok();
        tracing::info!(uid = %self.uid, addr = ?listen_addr, "actor serving");

        // Run: wait for the terminal trigger.
        tokio::select! {
            () = self.root.token().cancelled() => {
                self.cancel().await;
            }
            () = self.cancel_complete.wait() => {}
        }

        // Drain the scopes inside-out.
        self.server.wait().await;
        self.service.wait().await;
        if let Some(parent) = self.parent_chan.get() {
            parent.aclose().await;
        }
        self.root.wait().await;
        Ok(())
    }

    /// Connect back to the parent actor, handshake, and receive the
    /// runtime-variables record.
    async fn from_parent(
        self: &Arc<Self>,
        parent_addr: &NetAddr,
    ) -> Result<(Arc<Channel>, Option<NetAddr>), ActorError> {
        let chan = match Channel::connect(parent_addr).await {
            Ok(chan) => Arc::new(chan),
            Err(err) => {
                tracing::warn!(
                    %err,
                    "failed to connect to parent @ {parent_addr:?}, closing server"
                );
                self.cancel().await;
                return Err(ActorError::Startup(format!(
                    "failed to connect to parent @ {parent_addr:?}: {err}"
                )));
            }
        };

        chan.try_handshake(&self.uid).await?;

        // Receive runtime state from our parent and apply it before the
        // listener starts.
        let hello: ParentHello = chan.recv_value().await?;
        tracing::debug!(?hello, "received state from parent");
        {
            let mut vars = self.runtime_vars.lock().unwrap();
            *vars = hello.runtime_vars.clone();
            vars.is_root = false;
        }
        if hello.arbiter_addr.is_some() {
            *self.arbiter_addr.lock().unwrap() = hello.arbiter_addr.clone();
        }
        if let Some(level) = hello.runtime_vars.loglevel {
            *self.loglevel.lock().unwrap() = Some(level);
        }

        Ok((chan, Some((hello.bind_host, hello.bind_port))))
    }

    /// The channel server: accept inbound connections until the server scope
    /// is cancelled. New connections are handled in the service scope so
    /// they keep processing even after the listener goes down.
    async fn serve(self: Arc<Self>, listener: TcpListener) {
        let token = self.server.token().clone();
        tracing::debug!(laddr = ?listener.local_addr().ok(), "channel server up");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _remote)) => {
                        let this = self.clone();
                        self.service.spawn(this.handle_stream(stream));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                }
            }
        }
        self.server_down.set();
        tracing::debug!("channel server down");
    }

    async fn register_with_arbiter(
        self: &Arc<Self>,
        listen_addr: &NetAddr,
    ) -> Result<(), ActorError> {
        if let Some(registry) = &self.registry {
            // The arbiter enrolls itself directly.
            registry.register(self.uid.clone(), listen_addr.clone());
            self.registered.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let Some(arbiter_addr) = self.arbiter_addr() else {
            tracing::debug!("no arbiter address; running unregistered");
            return Ok(());
        };

        tracing::debug!(uid = %self.uid, "registering with arbiter");
        crate::portal::one_shot::<_, bool>(
            self,
            &arbiter_addr,
            "register_actor",
            &crate::runtime::arbiter::RegisterArgs {
                uid: self.uid.clone(),
                sockaddr: listen_addr.clone(),
            },
        )
        .await
        .map_err(|err| ActorError::Registry(err.to_string()))?;
        self.registered.store(true, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Cancel this actor's runtime. Idempotent.
    ///
    /// The deterministic teardown sequence, all shielded (nothing in here
    /// observes an outer token):
    /// 1. cancel all ongoing rpc tasks and await each teardown,
    /// 2. stop the channel server and wait for the listener-down latch,
    /// 3. cancel the service scope (message loops die here).
    pub async fn cancel(self: &Arc<Self>) -> bool {
        if self.cancel_called.swap(true, Ordering::SeqCst) {
            self.cancel_complete.wait().await;
            return true;
        }
        tracing::info!(uid = %self.uid, "actor cancelling");

        self.cancel_rpc_tasks(None).await;

        self.server.cancel();
        self.server_down.wait().await;

        self.service.cancel();

        self.cancel_complete.set();
        tracing::debug!(uid = %self.uid, "actor cancel complete");
        true
    }

    /// Cancel a local invocation by `(peer-uid, call-id)` and await its
    /// teardown. Missing entries mean the task already completed. The
    /// canceller verb itself is never cancelled (self-deadlock guard).
    pub(crate) async fn cancel_task(&self, key: &TaskKey) {
        let Some(entry) = self.rpc_tasks.entry(key) else {
            tracing::debug!(cid = %key.1, "task already completed/terminated");
            return;
        };
        if entry.func == "self._cancel_task" {
            return;
        }
        tracing::debug!(cid = %key.1, func = %entry.func, peer = %key.0, "cancelling task");
        entry.cancel.cancel();
        entry.done.wait().await;
        tracing::debug!(cid = %key.1, func = %entry.func, "task cancelled");
    }

    /// Cancel all existing RPC responder tasks (optionally only those bound
    /// to one peer) and wait for the table to quiesce.
    pub(crate) async fn cancel_rpc_tasks(&self, only_peer: Option<&Uid>) {
        let keys = match only_peer {
            Some(peer) => self.rpc_tasks.keys_for_peer(peer),
            None => self.rpc_tasks.keys(),
        };
        if keys.is_empty() {
            return;
        }
        tracing::debug!(count = keys.len(), "cancelling rpc tasks");
        for key in keys {
            self.cancel_task(&key).await;
        }
        if only_peer.is_none() {
            self.rpc_tasks.wait_quiescent().await;
        }
    }

    // ------------------------------------------------------------------
    // Teardown helpers
    // ------------------------------------------------------------------

    fn close_lifetime_stack(&self) {
        let hooks: Vec<LifetimeHook> =
            std::mem::take(&mut *self.lifetime_stack.lock().unwrap());
        if !hooks.is_empty() {
            tracing::debug!(count = hooks.len(), "closing actor lifetime stack");
        }
        for hook in hooks.into_iter().rev() {
            hook();
        }
    }

    /// Unregister from the arbiter with a bounded, shielded deadline.
    /// Failure is logged, never fatal.
    async fn maybe_unregister(self: &Arc<Self>) {
        if !self.registered.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(registry) = &self.registry {
            registry.unregister(&self.uid);
            return;
        }
        let Some(arbiter_addr) = self.arbiter_addr() else { return };

        let unregister_args = UnregisterArgs {
            uid: self.uid.clone(),
        };
        let attempt = crate::portal::one_shot::<_, bool>(
            self,
            &arbiter_addr,
            "unregister_actor",
            &unregister_args,
        );
        let failed = match timeout(UNREGISTER_TIMEOUT, attempt).await {
            Ok(Ok(_)) => false,
            Ok(Err(_)) | Err(_) => true,
        };
        if failed {
            tracing::warn!(uid = %self.uid, "failed to unregister from arbiter");
        }
    }

    /// Ensure all peers (actors connected to us as clients) are finished.
    async fn wait_remaining_peers(&self) {
        if self.no_more_peers.is_set() {
            return;
        }
        tracing::debug!("waiting for remaining peers to clear");
        self.no_more_peers.wait().await;
        tracing::debug!("all peer channels are complete");
    }
}
