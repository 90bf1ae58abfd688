// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tracing initialization for actor processes.
//!
//! Library code only ever emits `tracing` events; a process entrypoint (the
//! daemon, a test binary) calls [`try_initialize_logging`] once. The
//! `RUST_LOG` env var overrides the configured level.

use miette::IntoDiagnostic;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: an [`EnvFilter`] (env var first, then the
/// given level, then `info`) and a compact fmt layer on stderr. Calling it
/// again is a no-op.
///
/// # Errors
///
/// Returns an error when the level filter cannot be parsed.
pub fn try_initialize_logging(level: Option<&str>) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .into_diagnostic()?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (tests share a process) is fine.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    Ok(())
}
