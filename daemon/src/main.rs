// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! `trellisd` - actor host daemon.
//!
//! The process entrypoint an external spawner executes. Three modes:
//! - `--registry`: run the name registry (arbiter) itself;
//! - default: run a service actor that registers with the arbiter and
//!   serves until interrupted;
//! - `--dump-registry`: query the arbiter and print its registry as JSON.
//!
//! Everything else (bind address, runtime variables) flows to children via
//! the runtime-variables handshake, not the CLI.

use std::sync::Arc;

use clap::Parser;
use miette::{IntoDiagnostic, miette};
use tokio::sync::oneshot;
use trellis_rt::{ActorBuilder, NetAddr, discovery, logging::try_initialize_logging,
                 set_current_actor};

#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(
    name = "trellisd",
    about = "Actor host daemon for the trellis runtime"
)]
struct CliArgs {
    /// Address of the tree's name registry, as host:port.
    #[arg(long, value_parser = parse_net_addr)]
    arbiter: NetAddr,

    /// Run as the name registry itself (binds the arbiter address).
    #[arg(long)]
    registry: bool,

    /// Query the registry and print it as JSON, then exit.
    #[arg(long)]
    dump_registry: bool,

    /// Actor name (the uid pairs this with a fresh instance-id).
    #[arg(long, default_value = "trellisd")]
    name: String,

    /// Listener bind address for service actors, as host:port (port 0 =
    /// ephemeral).
    #[arg(long, value_parser = parse_net_addr, default_value = "127.0.0.1:0")]
    bind: NetAddr,

    /// Listener address of the parent actor (child mode).
    #[arg(long, value_parser = parse_net_addr)]
    parent: Option<NetAddr>,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    loglevel: String,
}

fn parse_net_addr(value: &str) -> Result<NetAddr, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {value:?}"))?;
    let port: u16 = port
        .parse()
        .map_err(|err| format!("bad port in {value:?}: {err}"))?;
    if host.is_empty() {
        return Err(format!("empty host in {value:?}"));
    }
    Ok((host.to_string(), port))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let args = CliArgs::parse();
    try_initialize_logging(Some(&args.loglevel))?;

    if args.dump_registry {
        return dump_registry(&args).await;
    }

    let mut builder = ActorBuilder::new(args.name.clone())
        .loglevel(args.loglevel.clone());
    let bind = if args.registry {
        builder = builder.as_arbiter();
        args.arbiter.clone()
    } else {
        builder = builder.arbiter_addr(args.arbiter.clone());
        args.bind.clone()
    };
    let actor = builder.build();
    set_current_actor(&actor);

    let (started_tx, started_rx) = oneshot::channel();
    let main_task = tokio::spawn(actor.clone().async_main(
        bind,
        args.parent.clone(),
        started_tx,
    ));

    let listen_addr = started_rx
        .await
        .map_err(|_| miette!("actor exited during startup"))?;
    tracing::info!(
        name = %args.name,
        addr = ?listen_addr,
        registry = args.registry,
        "trellisd up"
    );

    // Serve until interrupted.
    tokio::signal::ctrl_c().await.into_diagnostic()?;
    tracing::info!("interrupt received; cancelling actor tree");
    actor.cancel().await;
    main_task
        .await
        .into_diagnostic()?
        .map_err(|err| miette!("actor runtime failed: {err}"))?;

    Ok(())
}

/// One-shot registry query over a throwaway identity.
async fn dump_registry(args: &CliArgs) -> miette::Result<()> {
    let actor = ActorBuilder::new(format!("{}-query", args.name))
        .arbiter_addr(args.arbiter.clone())
        .build();
    set_current_actor(&actor);

    let registry = discovery::get_registry(&actor)
        .await
        .map_err(|err| miette!("registry query failed: {err}"))?;

    let entries: Vec<serde_json::Value> = registry
        .into_iter()
        .map(|(uid, (host, port))| {
            serde_json::json!({
                "name": uid.name(),
                "instance": uid.instance(),
                "host": host,
                "port": port,
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&entries).into_diagnostic()?
    );
    Ok(())
}

#[cfg(test)]
mod tests_cli {
    use super::*;

    #[test]
    fn test_parse_net_addr() {
        assert_eq!(
            parse_net_addr("127.0.0.1:1616").unwrap(),
            ("127.0.0.1".to_string(), 1616)
        );
        assert!(parse_net_addr("no-port").is_err());
        assert!(parse_net_addr(":1616").is_err());
        assert!(parse_net_addr("host:notaport").is_err());
    }
}
