// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The name registry (arbiter) role: a distinguished actor holding
//! `uid → listen-address` plus wakeups for `wait_for_actor`.
//!
//! All mutation happens inside one actor's task tree, in suspension-free
//! critical sections - no lock is ever held across an await.

use std::{collections::HashMap, sync::{Arc, Mutex as StdMutex}};

use serde::{Deserialize, Serialize};

use crate::{NetAddr, Uid,
            runtime::{dispatch::{ModuleDef, NoArgs},
                      errors::UserError,
                      scope::Latch}};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub uid: Uid,
    pub sockaddr: NetAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterArgs {
    pub uid: Uid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

/// Registry state. An entry exists for every live registered actor; removal
/// is idempotent; waiters are drained when any uid matching their name
/// appears.
#[derive(Debug, Default)]
pub struct Registry {
    entries: StdMutex<HashMap<Uid, NetAddr>>,
    waiters: StdMutex<HashMap<String, Vec<Latch>>>,
}

impl Registry {
    pub fn register(&self, uid: Uid, sockaddr: NetAddr) {
        tracing::debug!(%uid, ?sockaddr, "registering actor");
        let name = uid.name().to_string();
        self.entries.lock().unwrap().insert(uid, sockaddr);

        // Pop and fire all waiter events for this name.
        let woken = self.waiters.lock().unwrap().remove(&name);
        if let Some(latches) = woken {
            for latch in latches {
                latch.set();
            }
        }
    }

    pub fn unregister(&self, uid: &Uid) {
        tracing::debug!(%uid, "unregistering actor");
        self.entries.lock().unwrap().remove(uid);
    }

    /// Address of the first registered actor with this name, if any.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<NetAddr> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(uid, _)| uid.name() == name)
            .map(|(_, addr)| addr.clone())
    }

    /// All addresses currently registered under this name.
    #[must_use]
    pub fn addrs_for(&self, name: &str) -> Vec<NetAddr> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _)| uid.name() == name)
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    /// Wait for at least one actor with this name to be registered. Returns
    /// immediately if a match exists; otherwise parks on a latch fired by
    /// [`Registry::register`].
    pub async fn wait_for(&self, name: &str) -> Vec<NetAddr> {
        loop {
            let found = self.addrs_for(name);
            if !found.is_empty() {
                return found;
            }
            let latch = Latch::new();
            self.waiters
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(latch.clone());
            latch.wait().await;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<Uid, NetAddr> {
        self.entries.lock().unwrap().clone()
    }
}

/// The arbiter's `self` namespace: the registry verbs remote callers may
/// invoke.
pub(crate) fn registry_module(registry: &Arc<Registry>) -> ModuleDef {
    let reg = registry.clone();
    let module = ModuleDef::new("self").with_async_fn(
        "register_actor",
        move |args: RegisterArgs| {
            let reg = reg.clone();
            async move {
                reg.register(args.uid, args.sockaddr);
                Ok::<_, UserError>(true)
            }
        },
    );

    let reg = registry.clone();
    let module = module.with_async_fn("unregister_actor", move |args: UnregisterArgs| {
        let reg = reg.clone();
        async move {
            reg.unregister(&args.uid);
            Ok::<_, UserError>(true)
        }
    });

    let reg = registry.clone();
    let module = module.with_async_fn("find_actor", move |args: NameArgs| {
        let reg = reg.clone();
        async move { Ok::<_, UserError>(reg.find(&args.name)) }
    });

    let reg = registry.clone();
    let module = module.with_async_fn("wait_for_actor", move |args: NameArgs| {
        let reg = reg.clone();
        async move { Ok::<_, UserError>(reg.wait_for(&args.name).await) }
    });

    let reg = registry.clone();
    module.with_async_fn("get_registry", move |_args: NoArgs| {
        let reg = reg.clone();
        async move { Ok::<_, UserError>(reg.snapshot()) }
    })
}
