// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cancellation crossing process boundaries: scoped deadlines around remote
//! streams, explicit stream cancel, and clean single-subactor teardown.

mod common;

use std::{sync::{Arc, Mutex},
          time::Duration};

use common::{init_logging, stream_module, test_module};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use tokio::time::timeout;
use trellis_rt::{NoArgs, Nursery, RpcError, open_nursery,
                 root::{self, RootConfig}};

/// A scoped deadline around a remote infinite stream unwinds the remote
/// generator; the nursery reports cancelled and no child survives.
#[tokio::test]
async fn test_cancel_infinite_streamer() {
    init_logging();
    let probe: Arc<Mutex<Option<Nursery>>> = Arc::new(Mutex::new(None));
    let stash = probe.clone();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| {
            *stash.lock().unwrap() = Some(nursery.clone());
            async move {
                let portal = nursery
                    .start_actor("donny", vec![stream_module()])
                    .await?;

                let consume = async {
                    let mut stream = portal
                        .open_stream_from::<_, String>("strm", "stream_forever", &NoArgs)
                        .await?;
                    let mut seen = 0usize;
                    while let Some(item) = stream.next().await {
                        item?;
                        seen += 1;
                    }
                    Ok::<_, RpcError>(seen)
                };

                // Stream for at most one second.
                let cancelled_caught =
                    timeout(Duration::from_secs(1), consume).await.is_err();
                assert!(cancelled_caught);

                nursery.cancel().await;
                Ok(())
            }
        })
        .await
        .expect("cancellation is not an error");
        Ok(())
    })
    .await
    .unwrap();

    let nursery = probe.lock().unwrap().take().unwrap();
    assert!(nursery.cancelled());
    assert_eq!(nursery.child_count(), 0);
}

/// Explicitly cancelling a stream reaps the remote task (acknowledged, not
/// fire-and-forget) and the stream yields nothing afterwards.
#[tokio::test]
async fn test_explicit_stream_cancel() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery
                .start_actor("streamer", vec![stream_module()])
                .await?;

            let mut stream = portal
                .open_stream_from::<_, String>("strm", "stream_forever", &NoArgs)
                .await?;
            for _ in 0..3 {
                stream.next().await.expect("stream is live")?;
            }

            stream.cancel().await;
            assert!(stream.next().await.is_none());

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

/// A nursery-spawned subactor is reaped when the nursery is cancelled; the
/// scope would otherwise wait for it forever.
#[tokio::test]
async fn test_cancel_single_subactor() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery.start_actor("nothin", vec![test_module()]).await?;
            let ran: Option<bool> = portal.run("testmod", "do_nuthin", &NoArgs).await?;
            assert_eq!(ran, None);

            // Would hang otherwise.
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

/// A handler panic is just another error kind on the caller side; the
/// callee actor survives it.
#[tokio::test]
async fn test_handler_panic_is_packed() {
    init_logging();

    let panicky = trellis_rt::ModuleDef::new("panics").with_async_fn(
        "boom",
        |_args: NoArgs| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok::<bool, trellis_rt::UserError>(true)
        },
    );

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery.start_actor("panicker", vec![panicky]).await?;

            let err = portal.run::<_, bool>("panics", "boom", &NoArgs).await;
            let err = err.unwrap_err();
            assert_eq!(err.kind(), "panic");

            // Still serving after the panic.
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
