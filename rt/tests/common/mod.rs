// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Shared fixtures for the end-to-end actor tests: the modules the child
//! actors expose.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_rt::{ModuleDef, NoArgs, UserError, current_actor, open_nursery};

pub fn init_logging() {
    trellis_rt::logging::try_initialize_logging(Some("warn")).ok();
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayArgs {
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountArgs {
    pub count: u64,
}

/// `testmod`: the error/sleep helpers the cancellation scenarios use.
pub fn test_module() -> ModuleDef {
    ModuleDef::new("testmod")
        .with_async_fn("assert_err", |args: DelayArgs| async move {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
            Err::<bool, _>(UserError::new("assertion-error", "assertion failed"))
        })
        .with_async_fn("sleep_forever", |_args: NoArgs| async move {
            // Practically forever; only cancellation ends this.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<bool, UserError>(true)
        })
        .with_async_fn("do_nuthin", |_args: NoArgs| async move {
            Ok::<Option<bool>, UserError>(None)
        })
}

/// `strm`: streaming helpers.
pub fn stream_module() -> ModuleDef {
    ModuleDef::new("strm")
        .with_async_gen("stream_forever", |_args: NoArgs| {
            async_stream::stream! {
                loop {
                    yield Ok("I can see these little future bubble things".to_string());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .with_async_gen("count_to", |args: CountArgs| {
            async_stream::stream! {
                for i in 0..args.count {
                    yield Ok::<_, UserError>(i);
                }
            }
        })
}

/// `spawner`: a module whose handler opens a nested nursery of erroring
/// grandchildren.
pub fn spawner_module() -> ModuleDef {
    ModuleDef::new("spawner").with_async_fn("spawn_and_error", |args: CountArgs| {
        async move {
            let actor = current_actor()
                .ok_or_else(|| UserError::new("runtime-error", "no current actor"))?;
            let name = actor.name().to_string();
            let outcome = open_nursery(&actor, |nursery| async move {
                for i in 0..args.count {
                    nursery
                        .run_in_actor(
                            &format!("{name}_errorer_{i}"),
                            test_module(),
                            "assert_err",
                            &DelayArgs { delay_ms: 0 },
                        )
                        .await?;
                }
                Ok(())
            })
            .await;
            match outcome {
                Ok(()) => Ok(false),
                // Kind `composite-cancel` crosses the wire to the caller.
                Err(composite) => Err(UserError::from(composite)),
            }
        }
    })
}
