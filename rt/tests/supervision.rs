// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Supervision across actor boundaries: a failure in any child cancels all
//! siblings, original error kinds survive the wire, and the nursery
//! aggregates every collected failure.

mod common;

use std::sync::{Arc, Mutex};

use common::{CountArgs, DelayArgs, init_logging, spawner_module, test_module};
use pretty_assertions::assert_eq;
use serde::Serialize;
use trellis_rt::{NoArgs, Nursery, open_nursery,
                 root::{self, RootConfig}};

/// Stash the nursery handle so its flags can be inspected after the scope
/// exits.
fn nursery_probe() -> (Arc<Mutex<Option<Nursery>>>, impl Fn(&Nursery)) {
    let slot: Arc<Mutex<Option<Nursery>>> = Arc::new(Mutex::new(None));
    let writer = slot.clone();
    (slot, move |nursery: &Nursery| {
        *writer.lock().unwrap() = Some(nursery.clone());
    })
}

/// A single remote failure surfaces with its original kind and no child
/// survives the scope.
#[tokio::test]
async fn test_single_remote_failure() {
    init_logging();
    let (probe, stash) = nursery_probe();

    root::run(RootConfig::new("root"), |actor| async move {
        let result = open_nursery(&actor, |nursery| {
            stash(&nursery);
            async move {
                nursery
                    .run_in_actor(
                        "errorer",
                        test_module(),
                        "assert_err",
                        &DelayArgs { delay_ms: 0 },
                    )
                    .await?;
                Ok(())
            }
        })
        .await;

        let composite = result.expect_err("child failure must surface");
        assert_eq!(composite.errors.len(), 1);
        assert_eq!(composite.errors[0].kind(), "assertion-error");
        Ok(())
    })
    .await
    .unwrap();

    let nursery = probe.lock().unwrap().take().unwrap();
    assert!(nursery.cancelled());
    assert_eq!(nursery.child_count(), 0);
}

/// kwargs that do not bind are rejected before the body runs, with the
/// dedicated kind.
#[tokio::test]
async fn test_argument_mismatch_is_argument_error() {
    init_logging();

    #[derive(Debug, Serialize)]
    struct WrongArgs {
        unexpected: u64,
    }

    root::run(RootConfig::new("root"), |actor| async move {
        let result = open_nursery(&actor, |nursery| async move {
            nursery
                .run_in_actor(
                    "errorer",
                    test_module(),
                    "assert_err",
                    &WrongArgs { unexpected: 10 },
                )
                .await?;
            Ok(())
        })
        .await;

        let composite = result.expect_err("argument mismatch must surface");
        assert_eq!(composite.errors.len(), 1);
        assert_eq!(composite.errors[0].kind(), "argument-error");
        Ok(())
    })
    .await
    .unwrap();
}

/// Twenty-five siblings all failing after a delay produce a composite with
/// exactly twenty-five entries, every kind preserved.
#[tokio::test]
async fn test_concurrent_sibling_failures_aggregate() {
    init_logging();
    const NUM_SUBACTORS: usize = 25;

    root::run(RootConfig::new("root"), |actor| async move {
        let result = open_nursery(&actor, |nursery| async move {
            for i in 0..NUM_SUBACTORS {
                nursery
                    .run_in_actor(
                        &format!("errorer{i}"),
                        test_module(),
                        "assert_err",
                        &DelayArgs { delay_ms: 500 },
                    )
                    .await?;
            }
            Ok(())
        })
        .await;

        let composite = result.expect_err("all children failed");
        assert_eq!(composite.errors.len(), NUM_SUBACTORS);
        for err in &composite.errors {
            assert_eq!(err.kind(), "assertion-error");
        }
        Ok(())
    })
    .await
    .unwrap();
}

/// Daemon children sit idle; one task child raises immediately. All six
/// children terminate and the composite carries the failing task plus the
/// two siblings that were cancelled into `transport-closed`.
#[tokio::test]
async fn test_some_cancels_all() {
    init_logging();
    let (probe, stash) = nursery_probe();

    root::run(RootConfig::new("root"), |actor| async move {
        let result = open_nursery(&actor, |nursery| {
            stash(&nursery);
            async move {
                for i in 0..3 {
                    nursery
                        .start_actor(&format!("daemon_{i}"), vec![test_module()])
                        .await?;
                }
                nursery
                    .run_in_actor(
                        "failer",
                        test_module(),
                        "assert_err",
                        &DelayArgs { delay_ms: 0 },
                    )
                    .await?;
                for i in 0..2 {
                    nursery
                        .run_in_actor(
                            &format!("sleeper_{i}"),
                            test_module(),
                            "sleep_forever",
                            &NoArgs,
                        )
                        .await?;
                }
                Ok(())
            }
        })
        .await;

        let composite = result.expect_err("the failing task must surface");
        assert_eq!(composite.errors.len(), 3);
        assert_eq!(
            composite
                .errors
                .iter()
                .filter(|err| err.kind() == "assertion-error")
                .count(),
            1
        );
        assert_eq!(
            composite
                .errors
                .iter()
                .filter(|err| err.kind() == "transport-closed")
                .count(),
            2
        );
        Ok(())
    })
    .await
    .unwrap();

    let nursery = probe.lock().unwrap().take().unwrap();
    assert!(nursery.cancelled());
    assert_eq!(nursery.child_count(), 0);
}

/// Nested nurseries: children that each spawn erroring grandchildren
/// surface as `composite-cancel` entries in the parent's composite.
#[tokio::test]
async fn test_nested_nurseries() {
    init_logging();
    const NUM_SPAWNERS: usize = 4;

    root::run(RootConfig::new("root"), |actor| async move {
        let result = open_nursery(&actor, |nursery| async move {
            for i in 0..NUM_SPAWNERS {
                nursery
                    .run_in_actor(
                        &format!("spawner_{i}"),
                        spawner_module(),
                        "spawn_and_error",
                        &CountArgs { count: 4 },
                    )
                    .await?;
            }
            Ok(())
        })
        .await;

        let composite = result.expect_err("nested failures must surface");
        assert_eq!(composite.errors.len(), NUM_SPAWNERS);
        for err in &composite.errors {
            assert_eq!(err.kind(), "composite-cancel");
        }
        Ok(())
    })
    .await
    .unwrap();
}

/// `cancel_actor` is idempotent: a second cancel is a no-op, never an
/// error.
#[tokio::test]
async fn test_cancel_actor_twice() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery.start_actor("nothin", vec![test_module()]).await?;

            let ran: Option<bool> = portal.run("testmod", "do_nuthin", &NoArgs).await?;
            assert_eq!(ran, None);

            assert!(portal.cancel_actor().await);
            // Second cancel: the actor is already gone; still not an error.
            portal.cancel_actor().await;

            nursery.cancel().await;
            Ok(())
        })
        .await
        .expect("clean exit");
        Ok(())
    })
    .await
    .unwrap();
}

/// Unknown namespaces are refused with the dedicated kind and the actor
/// keeps serving.
#[tokio::test]
async fn test_module_not_exposed() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery.start_actor("locked", vec![test_module()]).await?;

            let denied = portal.run::<_, bool>("secrets", "steal", &NoArgs).await;
            assert_eq!(denied.unwrap_err().kind(), "module-not-exposed");

            // The same channel still serves allowed calls.
            let ran: Option<bool> = portal.run("testmod", "do_nuthin", &NoArgs).await?;
            assert_eq!(ran, None);

            // The runtime's internal debug module is always exposed.
            let pong: String = portal.run("debug", "ping", &NoArgs).await?;
            assert_eq!(pong, "pong");

            nursery.cancel().await;
            Ok(())
        })
        .await
        .expect("clean exit");
        Ok(())
    })
    .await
    .unwrap();
}
