// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The in-segment proxy: one link to the server, lazily-dialed target
//! connections, and the idle sweep over them.

pub mod config;
pub mod forwarder;
pub mod link;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::ProxyConfig;
use forwarder::TargetForwarder;
use link::ServerLink;

use crate::common::{IDLE_TIMEOUT, OUTBOUND_QUEUE_DEPTH, SWEEP_INTERVAL};

/// Runs the proxy until the shutdown token fires or the server link dies.
pub async fn run(config: ProxyConfig, shutdown: CancellationToken) -> Result<()> {
  config.validate().context("invalid configuration")?;
  let (response_tx, response_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
  let forwarder = Arc::new(TargetForwarder::new(response_tx, shutdown.clone()));

  let link = ServerLink::connect(&config, forwarder.clone(), response_rx, shutdown.clone())
    .await
    .context("connecting to server")?;

  let sweep = tokio::spawn(sweep_targets(forwarder.clone(), shutdown.clone()));

  tokio::select! {
    _ = shutdown.cancelled() => {
      tracing::info!("proxy shutting down");
    }
    _ = link.closed() => {
      tracing::error!("server link closed, shutting down");
      shutdown.cancel();
    }
  }

  let _ = sweep.await;
  forwarder.clear();
  link.close().await;
  Ok(())
}

async fn sweep_targets(forwarder: Arc<TargetForwarder>, shutdown: CancellationToken) {
  let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {
        forwarder.cleanup(IDLE_TIMEOUT);
      }
    }
  }
  tracing::debug!("target sweep stopped");
}
