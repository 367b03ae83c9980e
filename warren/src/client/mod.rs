// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The interception client: redirect rule, local listener, flow tracking,
//! and the single multiplexed link to the server.

pub mod config;
pub mod handler;
pub mod link;
pub mod redirect;
pub mod tracker;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::ClientConfig;
use link::ServerLink;
use redirect::{RedirectRule, Redirector};
use tracker::FlowTracker;

use crate::common::cidr::Ipv4Cidr;
use crate::common::wire::Packet;
use crate::common::{IDLE_TIMEOUT, OUTBOUND_QUEUE_DEPTH, SWEEP_INTERVAL};

/// Runs the client until the shutdown token fires or the server link dies.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<()> {
  config.validate().context("invalid configuration")?;
  if !redirect::platform_supported() {
    bail!("traffic interception requires SO_ORIGINAL_DST, which this platform lacks");
  }
  let target_cidr: Ipv4Cidr = config
    .target_cidr
    .parse()
    .with_context(|| format!("parsing target CIDR {:?}", config.target_cidr))?;

  let tracker = Arc::new(FlowTracker::new());
  let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
  let link = ServerLink::connect(&config, tracker.clone(), outbound_rx, shutdown.clone())
    .await
    .context("connecting to server")?;
  let client_id = link.client_id.clone();

  // From here on the redirector's Drop removes the rule if anything fails.
  let mut redirector = Redirector::new(RedirectRule::tcp_redirect(
    target_cidr,
    config.listen_port,
  ));
  redirector
    .setup()
    .context("installing netfilter redirect rule")?;

  let listen_addr = format!("0.0.0.0:{}", config.listen_port);
  let listener = TcpListener::bind(&listen_addr)
    .await
    .with_context(|| format!("binding local listener on {}", listen_addr))?;
  tracing::info!(
    listen_addr = %listen_addr,
    target_cidr = %target_cidr,
    client_id = %client_id,
    "listening for redirected connections"
  );

  let accept = tokio::spawn(accept_loop(
    listener,
    client_id,
    tracker.clone(),
    outbound_tx,
    shutdown.clone(),
  ));
  let sweep = tokio::spawn(sweep_flows(tracker.clone(), shutdown.clone()));

  tokio::select! {
    _ = shutdown.cancelled() => {
      tracing::info!("client shutting down");
    }
    _ = link.closed() => {
      tracing::error!("server link closed, shutting down");
      shutdown.cancel();
    }
  }

  let _ = futures::future::join(accept, sweep).await;
  tracker.clear();
  link.close().await;
  redirector
    .cleanup()
    .context("removing netfilter redirect rule")?;
  Ok(())
}

async fn accept_loop(
  listener: TcpListener,
  client_id: String,
  tracker: Arc<FlowTracker>,
  outbound: mpsc::Sender<Packet>,
  shutdown: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          // A socket we cannot resolve never produced a packet; closing
          // it is the whole failure handling.
          match redirect::original_dest(&stream) {
            Ok(original_dest) => {
              tokio::spawn(handler::handle_flow(
                stream,
                peer,
                original_dest,
                client_id.clone(),
                tracker.clone(),
                outbound.clone(),
                shutdown.clone(),
              ));
            }
            Err(error) => {
              tracing::error!(%peer, %error, "failed to resolve original destination");
            }
          }
        }
        Err(error) => tracing::error!(%error, "accept failed"),
      },
    }
  }
  tracing::debug!("accept loop stopped");
}

async fn sweep_flows(tracker: Arc<FlowTracker>, shutdown: CancellationToken) {
  let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {
        tracker.cleanup(IDLE_TIMEOUT);
      }
    }
  }
  tracing::debug!("flow sweep stopped");
}
