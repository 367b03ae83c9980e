// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Shared plumbing for the warren binaries.

use tokio_util::sync::CancellationToken;
use warren::common::version::BuildInfo;

/// Installs the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Prints version info for the `version [--json]` subcommand.
pub fn print_version(info: &BuildInfo, json: bool) {
  if json {
    println!(
      "{}",
      serde_json::to_string_pretty(info).expect("version info must serialize")
    );
  } else {
    println!("{}", info.short());
  }
}

/// Root cancellation token, cancelled on the first interrupt signal.
pub fn shutdown_token() -> CancellationToken {
  let token = CancellationToken::new();
  let signal_token = token.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("interrupt received, shutting down");
      signal_token.cancel();
    }
  });
  token
}
