// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The RPC allow-list: every function a remote peer may invoke is registered
//! here at actor construction, as one of three typed shapes.
//!
//! There is no reflection on the wire. The caller picks the shape at the
//! dispatch site (`run` vs `open_stream_from` vs `open_context_from`) and the
//! callee's registered dispatcher must match. Unknown module or function
//! names yield a `module-not-exposed` error frame; kwargs that fail to bind
//! yield `argument-error` *before* the body runs.

use std::{collections::HashMap,
          sync::{Arc,
                 atomic::{AtomicBool, Ordering}}};

use futures_util::{FutureExt, StreamExt,
                   future::BoxFuture,
                   stream::BoxStream};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{CallId, Channel, Packet, Uid, msgpack_serde,
            runtime::errors::{UserError, kind}};

/// Registered-function argument record for verbs that take none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NoArgs;

/// Decode a kwargs document into the handler's argument record. A mismatch
/// is an `argument-error`, shipped without running the body.
///
/// # Errors
///
/// Returns [`UserError`] with kind `argument-error` if the kwargs do not
/// bind.
pub fn decode_args<A: DeserializeOwned>(kwargs: &[u8]) -> Result<A, UserError> {
    msgpack_serde::try_deserialize(kwargs)
        .map_err(|err| UserError::new(kind::ARGUMENT_ERROR, err.to_string()))
}

/// Encode a handler's produced value for the wire.
///
/// # Errors
///
/// Returns [`UserError`] with kind `type-error` if the value cannot be
/// encoded.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, UserError> {
    msgpack_serde::try_serialize(value)
        .map_err(|err| UserError::new(kind::TYPE_ERROR, err.to_string()))
}

pub(crate) type AsyncFnInner = dyn Fn(Vec<u8>) -> Result<BoxFuture<'static, Result<Vec<u8>, UserError>>, UserError>
    + Send
    + Sync;
pub(crate) type AsyncGenInner = dyn Fn(Vec<u8>) -> Result<BoxStream<'static, Result<Vec<u8>, UserError>>, UserError>
    + Send
    + Sync;
pub(crate) type ContextFnInner = dyn Fn(
        RpcContext,
        Vec<u8>,
    ) -> Result<BoxFuture<'static, Result<Vec<u8>, UserError>>, UserError>
    + Send
    + Sync;

/// One registered target, tagged by invocation shape. The closure's
/// synchronous phase binds kwargs; the returned future/stream is the body.
#[derive(Clone)]
pub enum Dispatcher {
    /// Plain async function returning a single value.
    AsyncFunc(Arc<AsyncFnInner>),
    /// Async generator; every produced value is forwarded as a `yield`.
    AsyncGen(Arc<AsyncGenInner>),
    /// Bidirectional context function.
    Context(Arc<ContextFnInner>),
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AsyncFunc(_) => write!(f, "Dispatcher::AsyncFunc"),
            Self::AsyncGen(_) => write!(f, "Dispatcher::AsyncGen"),
            Self::Context(_) => write!(f, "Dispatcher::Context"),
        }
    }
}

impl Dispatcher {
    /// The functype tag announced to the caller.
    #[must_use]
    pub fn func_type(&self) -> crate::FuncType {
        match self {
            Self::AsyncFunc(_) => crate::FuncType::AsyncFunc,
            Self::AsyncGen(_) => crate::FuncType::AsyncGen,
            Self::Context(_) => crate::FuncType::Context,
        }
    }
}

/// A named bundle of exposed functions.
#[derive(Debug, Clone)]
pub struct ModuleDef {
    name: String,
    funcs: HashMap<String, Dispatcher>,
}

impl ModuleDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Expose a plain async function: `kwargs` record in, single value out.
    #[must_use]
    pub fn with_async_fn<A, T, F, Fut>(mut self, func_name: &str, f: F) -> Self
    where
        A: DeserializeOwned,
        T: Serialize,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UserError>> + Send + 'static,
    {
        let wrapped = move |kwargs: Vec<u8>| {
            let args: A = decode_args(&kwargs)?;
            let body = f(args);
            Ok(async move {
                let value = body.await?;
                encode_value(&value)
            }
            .boxed())
        };
        self.funcs
            .insert(func_name.into(), Dispatcher::AsyncFunc(Arc::new(wrapped)));
        self
    }

    /// Expose an async generator: every stream element is shipped as a
    /// `yield` packet, in production order.
    #[must_use]
    pub fn with_async_gen<A, T, F, S>(mut self, func_name: &str, f: F) -> Self
    where
        A: DeserializeOwned,
        T: Serialize,
        F: Fn(A) -> S + Send + Sync + 'static,
        S: futures_core::Stream<Item = Result<T, UserError>> + Send + 'static,
    {
        let wrapped = move |kwargs: Vec<u8>| {
            let args: A = decode_args(&kwargs)?;
            let body = f(args)
                .map(|item| item.and_then(|value| encode_value(&value)))
                .boxed();
            Ok(body)
        };
        self.funcs
            .insert(func_name.into(), Dispatcher::AsyncGen(Arc::new(wrapped)));
        self
    }

    /// Expose a bidirectional context function. The body receives an
    /// [`RpcContext`], publishes its first delivery via
    /// [`RpcContext::started`], then exchanges values until it returns.
    #[must_use]
    pub fn with_context<A, T, F, Fut>(mut self, func_name: &str, f: F) -> Self
    where
        A: DeserializeOwned,
        T: Serialize,
        F: Fn(RpcContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UserError>> + Send + 'static,
    {
        let wrapped = move |ctx: RpcContext, kwargs: Vec<u8>| {
            let args: A = decode_args(&kwargs)?;
            let body = f(ctx, args);
            Ok(async move {
                let value = body.await?;
                encode_value(&value)
            }
            .boxed())
        };
        self.funcs
            .insert(func_name.into(), Dispatcher::Context(Arc::new(wrapped)));
        self
    }

    #[must_use]
    pub fn get(&self, func_name: &str) -> Option<&Dispatcher> {
        self.funcs.get(func_name)
    }
}

/// The actor's static `module-name → functions` allow-list. The runtime's
/// own `debug` module is always present.
#[derive(Debug, Default)]
pub struct DispatchTable {
    modules: HashMap<String, ModuleDef>,
}

impl DispatchTable {
    #[must_use]
    pub fn new(module_defs: Vec<ModuleDef>) -> Self {
        let mut modules: HashMap<String, ModuleDef> = HashMap::new();
        for def in module_defs {
            modules.insert(def.name.clone(), def);
        }
        modules
            .entry("debug".to_string())
            .or_insert_with(builtin_debug_module);
        Self { modules }
    }

    /// Resolve `ns.func` against the allow-list.
    #[must_use]
    pub fn lookup(&self, ns: &str, func: &str) -> Option<Dispatcher> {
        self.modules.get(ns).and_then(|m| m.get(func)).cloned()
    }

    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

/// The runtime's internal debug module, always exposed.
fn builtin_debug_module() -> ModuleDef {
    ModuleDef::new("debug").with_async_fn("ping", |_args: NoArgs| async move {
        Ok::<_, UserError>("pong".to_string())
    })
}

/// Callee-side handle for a `context` invocation: publish the first
/// delivery, then exchange values with the caller until the body returns.
#[derive(Clone)]
pub struct RpcContext {
    chan: Arc<Channel>,
    cid: CallId,
    peer: Uid,
    /// Caller→callee values (the caller's `yield` packets), routed here by
    /// the message loop.
    inbound: Arc<AsyncMutex<mpsc::Receiver<Packet>>>,
    started_sent: Arc<AtomicBool>,
    cancel_called: Arc<AtomicBool>,
    /// The invocation's own cancel scope; `cancel()` trips it.
    scope: CancellationToken,
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("cid", &self.cid)
            .field("peer", &self.peer)
            .field("started_sent", &self.started_sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcContext {
    pub(crate) fn new(
        chan: Arc<Channel>,
        cid: CallId,
        peer: Uid,
        inbound: mpsc::Receiver<Packet>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            chan,
            cid,
            peer,
            inbound: Arc::new(AsyncMutex::new(inbound)),
            started_sent: Arc::new(AtomicBool::new(false)),
            cancel_called: Arc::new(AtomicBool::new(false)),
            scope,
        }
    }

    /// The uid of the calling actor.
    #[must_use]
    pub fn peer(&self) -> &Uid { &self.peer }

    pub(crate) fn cancel_was_called(&self) -> bool {
        self.cancel_called.load(Ordering::Relaxed)
    }

    /// Publish the first delivery. Must be called exactly once, before
    /// [`RpcContext::send`].
    ///
    /// # Errors
    ///
    /// Returns a `type-error` on double-start, `transport-closed` if the
    /// channel died.
    pub async fn started<T: Serialize>(&self, value: &T) -> Result<(), UserError> {
        if self.started_sent.swap(true, Ordering::Relaxed) {
            return Err(UserError::new(
                kind::TYPE_ERROR,
                "context started() called more than once",
            ));
        }
        self.ship(value).await
    }

    /// Send one value to the caller.
    ///
    /// # Errors
    ///
    /// Returns a `type-error` before [`RpcContext::started`], or
    /// `transport-closed` if the channel died.
    pub async fn send<T: Serialize>(&self, value: &T) -> Result<(), UserError> {
        if !self.started_sent.load(Ordering::Relaxed) {
            return Err(UserError::new(
                kind::TYPE_ERROR,
                "context send() before started()",
            ));
        }
        self.ship(value).await
    }

    async fn ship<T: Serialize>(&self, value: &T) -> Result<(), UserError> {
        let value = encode_value(value)?;
        self.chan
            .send(&Packet::Yield {
                value: serde_bytes::ByteBuf::from(value),
                cid: self.cid.clone(),
            })
            .await
            .map_err(|err| UserError::new(kind::TRANSPORT_CLOSED, err.to_string()))
    }

    /// Receive the next value from the caller. `Ok(None)` means the caller
    /// closed its side of the stream.
    ///
    /// # Errors
    ///
    /// `transport-closed` when the channel goes away mid-exchange.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>, UserError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Packet::Yield { value, .. }) => {
                let decoded = msgpack_serde::try_deserialize(&value)
                    .map_err(|err| UserError::new(kind::TYPE_ERROR, err.to_string()))?;
                Ok(Some(decoded))
            }
            Some(Packet::Stop { .. }) | None => Ok(None),
            Some(other) => Err(UserError::new(
                kind::TYPE_ERROR,
                format!("unexpected packet in context stream: {other:?}"),
            )),
        }
    }

    /// Cancel this context from inside the body ("self-cancelled"). The
    /// caller observes a `context-cancelled` error carrying that reason.
    pub fn cancel(&self) {
        self.cancel_called.store(true, Ordering::Relaxed);
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests_dispatch {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_lookup_and_shape() {
        let table = DispatchTable::new(vec![
            ModuleDef::new("math").with_async_fn("add", |args: AddArgs| async move {
                Ok::<_, UserError>(args.a + args.b)
            }),
        ]);

        assert!(matches!(
            table.lookup("math", "add"),
            Some(Dispatcher::AsyncFunc(_))
        ));
        assert!(table.lookup("math", "sub").is_none());
        assert!(table.lookup("nope", "add").is_none());
        // The internal debug module is always present.
        assert!(table.lookup("debug", "ping").is_some());
    }

    #[tokio::test]
    async fn test_argument_error_is_synchronous() {
        let table = DispatchTable::new(vec![
            ModuleDef::new("math").with_async_fn("add", |args: AddArgs| async move {
                Ok::<_, UserError>(args.a + args.b)
            }),
        ]);
        let Some(Dispatcher::AsyncFunc(f)) = table.lookup("math", "add") else {
            panic!("wrong shape")
        };

        // Bad kwargs never reach the body.
        let bad = msgpack_serde::try_serialize(&"not a record").unwrap();
        let err = f(bad).err().unwrap();
        assert_eq!(err.kind, kind::ARGUMENT_ERROR);

        // Good kwargs run and produce an encoded value.
        let good = msgpack_serde::try_serialize(&AddArgs { a: 2, b: 3 }).unwrap();
        let out = f(good).unwrap().await.unwrap();
        let sum: i64 = msgpack_serde::try_deserialize(&out).unwrap();
        assert_eq!(sum, 5);
    }
}
