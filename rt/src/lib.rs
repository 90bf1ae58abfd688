// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! # trellis_rt
//!
//! A multi-process structured-concurrency actor runtime.
//!
//! Each *actor* is a process (or an isolated in-process host, see
//! [`runtime::spawn`]) running a cooperatively scheduled task tree on its
//! own current-thread scheduler. Actors exchange typed messages over
//! length-prefixed msgpack TCP channels. Three guarantees distinguish this
//! from a plain worker pool:
//!
//! 1. **Structured supervision across process boundaries** - a
//!    [`nursery::open_nursery`] scope cannot exit until every child actor
//!    (and every remotely spawned task) has terminated, and any unhandled
//!    child failure cancels all siblings.
//! 2. **Transparent remote invocation** in four call shapes - one-shot
//!    function, async-generator stream, bidirectional context, and
//!    fire-and-forget cancel - multiplexed over a single per-peer
//!    connection by call-id ([`portal::Portal`]).
//! 3. **First-class cancellation that crosses the wire** - a cancel issued
//!    in a parent reliably unwinds the child's task tree, and an error in a
//!    remote task surfaces locally with the original error kind preserved
//!    ([`runtime::errors::RemoteActorError`]).
//!
//! ## Architecture
//!
//! | Layer | Module | Role |
//! | :---- | :----- | :--- |
//! | Frame codec | [`network_io::length_prefix_protocol`] | `u32 LE length ‖ msgpack payload` frames |
//! | Channel | [`network_io::channel`] | one TCP stream per peer link, FIFO send lock, handshake, reconnect |
//! | Task table | [`runtime::task_table`] | `(peer-uid, call-id)` → cancel scopes and bounded reply queues |
//! | Invocation runner | [`runtime::invoke`] | drives one RPC body, emits `yield`/`return`/`stop`/`error` |
//! | Message loop | [`runtime::msg_loop`] | per-channel demux: replies → queues, commands → invocations |
//! | Supervisor | [`runtime::actor`] | listener, peer table, lifecycle, idempotent cancel sequence |
//! | Arbiter | [`runtime::arbiter`] | the `uid → address` name registry role |
//! | Bridge | [`bridge`] | run tasks on a second event loop with translated cancellation |
//!
//! Scheduling is single-threaded-cooperative per actor: the only suspension
//! points are I/O (socket read/write, queue send/receive, latch wait), and
//! cancellation is observed exclusively at such points. Backpressure is
//! end-to-end: bounded reply queues stall the message loop, which stalls
//! the socket read, which stalls the remote producer.

// Attach.
pub mod bridge;
pub mod discovery;
pub mod logging;
pub mod network_io;
pub mod nursery;
pub mod portal;
pub mod root;
pub mod runtime;
pub mod test_fixtures;

// Re-export.
pub use network_io::*;
pub use nursery::{Nursery, open_nursery, open_nursery_with};
pub use portal::{CallerContext, Portal, RecvStream};
pub use runtime::*;
