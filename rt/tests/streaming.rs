// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Stream ordering, end-to-end backpressure, and the bidirectional context
//! shape over the scheduler bridge.

mod common;

use std::time::Duration;

use common::{CountArgs, init_logging, stream_module};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use trellis_rt::{ModuleDef, NoArgs, RpcContext, UserError,
                 bridge::{HostLoop, open_channel_from},
                 open_nursery,
                 root::{self, RootConfig}};

/// Values arrive in production order, without duplicates, and the
/// terminating `stop` is the last observable.
#[tokio::test]
async fn test_stream_ordering() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery
                .start_actor("counter", vec![stream_module()])
                .await?;

            let mut stream = portal
                .open_stream_from::<_, u64>("strm", "count_to", &CountArgs { count: 200 })
                .await?;

            let mut received = Vec::new();
            while let Some(item) = stream.next().await {
                received.push(item?);
            }
            assert_eq!(received, (0..200).collect::<Vec<u64>>());
            // Past the terminator the stream stays exhausted.
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

/// A consumer slower than the producer throttles it through the bounded
/// reply queue; every value still arrives, in order.
#[tokio::test]
async fn test_backpressure_no_drops() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery
                .start_actor("firehose", vec![stream_module()])
                .await?;

            let mut stream = portal
                .open_stream_from::<_, u64>("strm", "count_to", &CountArgs { count: 300 })
                .await?;

            let mut received = Vec::new();
            while let Some(item) = stream.next().await {
                received.push(item?);
                // Far slower than the producer's emit rate.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(received, (0..300).collect::<Vec<u64>>());

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

fn map_bridge_err(err: trellis_rt::bridge::BridgeError) -> UserError {
    UserError::new(err.kind(), err.to_string())
}

/// A context handler whose echo logic lives on a second event loop behind
/// a linked task channel.
fn bridged_echo_module() -> ModuleDef {
    ModuleDef::new("bridged")
        .with_context("echo", |ctx: RpcContext, _args: NoArgs| async move {
            let host = HostLoop::spawn()
                .map_err(|err| UserError::new("runtime-error", err.to_string()))?;

            let (ready, mut link) = open_channel_from::<Option<i64>, Option<i64>, _, _>(
                host.handle(),
                |mut host_chan| async move {
                    // First delivery syncs the link, then pure echo.
                    host_chan.send(Some(-1)).await.ok();
                    while let Some(value) = host_chan.recv().await {
                        let was_terminator = value.is_none();
                        if host_chan.send(value).await.is_err() {
                            break;
                        }
                        if was_terminator {
                            break;
                        }
                    }
                    Ok(())
                },
            )
            .await
            .map_err(map_bridge_err)?;
            assert_eq!(ready, Some(-1));

            ctx.started(&()).await?;
            loop {
                match ctx.recv::<Option<i64>>().await? {
                    None => break,
                    Some(value) => {
                        let was_terminator = value.is_none();
                        link.send(value).await.map_err(map_bridge_err)?;
                        let echoed = link.receive().await.map_err(map_bridge_err)?;
                        ctx.send(&echoed).await?;
                        if was_terminator {
                            break;
                        }
                    }
                }
            }
            link.aclose().await;
            Ok(0i64)
        })
        .with_context("self_cancel", |ctx: RpcContext, _args: NoArgs| async move {
            ctx.started(&()).await?;
            ctx.cancel();
            // Parked; the cancellation tears this down at the suspension
            // point.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0i64)
        })
}

/// Bidirectional echo through a bridged actor: integers come back in
/// order, the `null` terminator is echoed exactly once, then the channel
/// ends cleanly with the handler's return value.
#[tokio::test]
async fn test_bidirectional_echo_context() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery
                .start_actor("echoer", vec![bridged_echo_module()])
                .await?;

            let ((), mut ctx) = portal
                .open_context_from::<_, ()>("bridged", "echo", &NoArgs)
                .await?;

            for i in 0..100i64 {
                ctx.send(&Some(i)).await?;
                let echoed = ctx.recv::<Option<i64>>().await?;
                assert_eq!(echoed, Some(Some(i)));
            }

            // Terminator: exactly one reply null, then a clean end.
            ctx.send(&Option::<i64>::None).await?;
            assert_eq!(ctx.recv::<Option<i64>>().await?, Some(None));
            assert_eq!(ctx.recv::<Option<i64>>().await?, None);
            assert_eq!(ctx.take_result::<i64>()?, Some(0));

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

/// A context that cancels itself surfaces `context-cancelled` on the
/// caller side, carrying the self-cancel reason.
#[tokio::test]
async fn test_context_self_cancel_reason() {
    init_logging();

    root::run(RootConfig::new("root"), |actor| async move {
        open_nursery(&actor, |nursery| async move {
            let portal = nursery
                .start_actor("quitter", vec![bridged_echo_module()])
                .await?;

            let ((), mut ctx) = portal
                .open_context_from::<_, ()>("bridged", "self_cancel", &NoArgs)
                .await?;

            let err = ctx.recv::<Option<i64>>().await.unwrap_err();
            assert_eq!(err.kind(), "context-cancelled");
            assert!(err.to_string().contains("cancelled itself"));

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
