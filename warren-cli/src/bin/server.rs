// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use warren::common::certgen;
use warren::common::version::BuildInfo;
use warren::server::ServerConfig;
use warren_cli::{init_tracing, print_version, shutdown_token};

#[derive(Parser, Debug)]
#[command(
  name = "warren-server",
  version,
  about = "Brokers tunneled flows between warren clients and proxies"
)]
struct Args {
  /// Config file (yaml/json)
  #[arg(short = 'c', long, value_name = "PATH")]
  config: Option<PathBuf>,

  /// TLS certificate path (overrides config)
  #[arg(long, value_name = "PATH")]
  cert: Option<String>,

  /// TLS private key path (overrides config)
  #[arg(long, value_name = "PATH")]
  key: Option<String>,

  /// CA certificate path (overrides config)
  #[arg(long, value_name = "PATH")]
  ca: Option<String>,

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
  /// Generate a CA and per-role certificates for the relay
  Certgen {
    /// Directory to write the material into
    #[arg(long, value_name = "DIR")]
    out: PathBuf,
    /// Subject alternative name for the server certificate
    #[arg(long, default_value = "localhost")]
    san: String,
  },
}

#[tokio::main]
async fn main() {
  let args = Args::parse();
  match args.command {
    Some(Command::Version { json }) => {
      print_version(&BuildInfo::new("warren-server"), json);
      return;
    }
    Some(Command::Certgen { out, san }) => {
      if let Err(error) = certgen::write_material(&out, &san) {
        eprintln!("certificate generation failed: {}", error);
        std::process::exit(1);
      }
      println!("wrote certificate material to {}", out.display());
      return;
    }
    None => {}
  }

  init_tracing();
  if let Err(error) = run(args).await {
    tracing::error!(?error, "server failed");
    std::process::exit(1);
  }
  tracing::info!("server shutdown complete");
}

async fn run(args: Args) -> Result<()> {
  let mut config = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
  if let Some(cert) = args.cert {
    config.tls.cert_path = cert;
  }
  if let Some(key) = args.key {
    config.tls.key_path = key;
  }
  if let Some(ca) = args.ca {
    config.tls.ca_path = ca;
  }

  let shutdown = shutdown_token();
  warren::server::run(config, shutdown).await
}
