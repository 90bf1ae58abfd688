// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The arbiter protocol: registration wakeups, discovery, idempotent
//! unregister, and transport-closed semantics for dying peers.

mod common;

use std::time::Duration;

use common::{init_logging, test_module};
use pretty_assertions::assert_eq;
use tokio::time::timeout;
use trellis_rt::{ActorSpec, NoArgs, SpawnBackend, ThreadSpawner, discovery,
                 open_nursery,
                 root::{self, RootConfig}};

/// `wait_for_actor` parked before the registration resolves right after
/// `register_actor` completes, with the new actor's address.
#[tokio::test]
async fn test_wait_for_actor_wakes_on_register() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        let waiter = {
            let actor = actor.clone();
            tokio::spawn(async move {
                discovery::wait_for_actor(&actor, "late-bloomer").await
            })
        };
        // Let the waiter park inside the arbiter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let outer = actor.clone();
        open_nursery(&actor, |nursery| async move {
            let _portal = nursery
                .start_actor("late-bloomer", vec![test_module()])
                .await?;

            let addrs = timeout(Duration::from_secs(2), waiter)
                .await
                .expect("waiter must wake promptly")
                .expect("waiter task must not die")?;
            assert_eq!(addrs.len(), 1);

            // Discovery agrees with the wakeup.
            let found = discovery::find_actor(&outer, "late-bloomer").await?;
            assert_eq!(found, Some(addrs[0].clone()));

            nursery.cancel().await;
            Ok(())
        })
        .await
        .expect("clean exit");

        // The child unregistered on its way out; removal is idempotent so
        // asking again changes nothing.
        let found = discovery::find_actor(&actor, "late-bloomer").await?;
        assert_eq!(found, None);
        Ok(())
    })
    .await
    .unwrap();
}

/// The registry dump contains every live actor, keyed by full uid.
#[tokio::test]
async fn test_get_registry_dump() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        let outer = actor.clone();
        open_nursery(&actor, |nursery| async move {
            let _portal = nursery.start_actor("lurker", vec![test_module()]).await?;

            let registry = discovery::get_registry(&outer).await?;
            let names: Vec<&str> =
                registry.keys().map(trellis_rt::Uid::name).collect();
            assert!(names.contains(&"root"));
            assert!(names.contains(&"lurker"));
            assert!(names.contains(&"arbiter"));

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

/// Killing a peer mid-call delivers `transport-closed` (not an opaque I/O
/// error) to every in-flight caller, and the peer entry disappears from
/// the peer table.
#[tokio::test]
async fn test_transport_closed_on_peer_death() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        let mut spec = ActorSpec::new("victim");
        spec.modules = vec![test_module()];
        spec.arbiter_addr = actor.arbiter_addr();
        let mut handle = ThreadSpawner
            .spawn(spec)
            .expect("victim must spawn");
        let addr = handle.wait_started().await.expect("victim must start");

        let portal = discovery::connect_to(&actor, &addr).await?;
        let victim_uid = portal.peer_uid().expect("handshake done");

        // Park a call inside the victim, then take the victim down.
        let in_flight = {
            let portal = portal.clone();
            tokio::spawn(async move {
                portal.run::<_, bool>("testmod", "sleep_forever", &NoArgs).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!in_flight.is_finished());

        handle.hard_kill();

        let err = timeout(Duration::from_secs(5), in_flight)
            .await
            .expect("caller must be failed promptly")
            .expect("caller task must not die")
            .unwrap_err();
        assert_eq!(err.kind(), "transport-closed");

        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(actor.get_chans(&victim_uid).is_empty());
        Ok(())
    })
    .await
    .unwrap();
}
