// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use warren::common::version::BuildInfo;
use warren::proxy::ProxyConfig;
use warren_cli::{init_tracing, print_version, shutdown_token};

#[derive(Parser, Debug)]
#[command(
  name = "warren-proxy",
  version,
  about = "Serves a network segment by dialing tunneled targets for the warren server"
)]
struct Args {
  /// Config file (yaml/json)
  #[arg(short = 'c', long, value_name = "PATH")]
  config: Option<PathBuf>,

  /// Server address (overrides config)
  #[arg(long, value_name = "HOST:PORT")]
  server: Option<String>,

  /// Proxy id (overrides config)
  #[arg(long, value_name = "STR")]
  id: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print version information
  Version {
    #[arg(long)]
    json: bool,
  },
}

#[tokio::main]
async fn main() {
  let args = Args::parse();
  if let Some(Command::Version { json }) = args.command {
    print_version(&BuildInfo::new("warren-proxy"), json);
    return;
  }

  init_tracing();
  if let Err(error) = run(args).await {
    tracing::error!(?error, "proxy failed");
    std::process::exit(1);
  }
  tracing::info!("proxy shutdown complete");
}

async fn run(args: Args) -> Result<()> {
  let mut config = ProxyConfig::load(args.config.as_deref()).context("loading configuration")?;
  if let Some(server) = args.server {
    config.server_addr = server;
  }
  if let Some(id) = args.id {
    config.proxy_id = id;
  }

  let shutdown = shutdown_token();
  warren::proxy::run(config, shutdown).await
}
