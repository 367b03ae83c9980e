// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use warren::client::ClientConfig;
use warren::common::version::BuildInfo;
use warren_cli::{init_tracing, print_version, shutdown_token};

#[derive(Parser, Debug)]
#[command(
  name = "warren-client",
  version,
  about = "Intercepts local TCP traffic and tunnels it through the warren server"
)]
struct Args {
  /// Config file (yaml/json)
  #[arg(short = 'c', long, value_name = "PATH")]
  config: Option<PathBuf>,

  /// Server address (overrides config)
  #[arg(long, value_name = "HOST:PORT")]
  server: Option<String>,

  /// Target CIDR to intercept (overrides config)
  #[arg(long, value_name = "CIDR")]
  cidr: Option<String>,

  /// Local listen port (overrides config)
  #[arg(long, value_name = "N")]
  port: Option<u16>,

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
    print_version(&BuildInfo::new("warren-client"), json);
    return;
  }

  init_tracing();
  if let Err(error) = run(args).await {
    tracing::error!(?error, "client failed");
    std::process::exit(1);
  }
  tracing::info!("client shutdown complete");
}

async fn run(args: Args) -> Result<()> {
  let mut config = ClientConfig::load(args.config.as_deref())?;
  if let Some(server) = args.server {
    config.server_addr = server;
  }
  if let Some(cidr) = args.cidr {
    config.target_cidr = cidr;
  }
  if let Some(port) = args.port {
    config.listen_port = port;
  }

  let shutdown = shutdown_token();
  warren::client::run(config, shutdown).await
}
