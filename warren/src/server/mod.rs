// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The relay broker: two mTLS listeners, the registry, and the route sweep.

pub mod config;
pub mod registry;
pub mod session;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub use config::ServerConfig;
use registry::Registry;

use crate::common::{tls, IDLE_TIMEOUT, SWEEP_INTERVAL};

/// Runs the server until the shutdown token fires.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
  config.validate().context("invalid configuration")?;
  let tls_config = tls::server_config(&config.tls).context("loading server TLS material")?;
  let acceptor = TlsAcceptor::from(tls_config);

  let client_listener = TcpListener::bind(&config.client_listen_addr)
    .await
    .with_context(|| format!("binding client listener on {}", config.client_listen_addr))?;
  let proxy_listener = TcpListener::bind(&config.proxy_listen_addr)
    .await
    .with_context(|| format!("binding proxy listener on {}", config.proxy_listen_addr))?;
  tracing::info!(
    client_addr = %config.client_listen_addr,
    proxy_addr = %config.proxy_listen_addr,
    "server listening"
  );

  let registry = Arc::new(Registry::new());

  let clients = tokio::spawn(accept_clients(
    client_listener,
    acceptor.clone(),
    registry.clone(),
    shutdown.clone(),
  ));
  let proxies = tokio::spawn(accept_proxies(
    proxy_listener,
    acceptor,
    registry.clone(),
    shutdown.clone(),
  ));
  let sweeper = tokio::spawn(sweep_routes(registry.clone(), shutdown.clone()));

  shutdown.cancelled().await;
  tracing::info!("server shutting down");

  let _ = futures::future::join3(clients, proxies, sweeper).await;
  registry.clear();
  Ok(())
}

async fn accept_clients(
  listener: TcpListener,
  acceptor: TlsAcceptor,
  registry: Arc<Registry>,
  shutdown: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((tcp, peer)) => {
          let acceptor = acceptor.clone();
          let registry = registry.clone();
          let shutdown = shutdown.clone();
          tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            match acceptor.accept(tcp).await {
              Ok(stream) => session::serve_client(stream, registry, shutdown).await,
              Err(error) => tracing::warn!(%peer, %error, "client tls handshake failed"),
            }
          });
        }
        Err(error) => tracing::error!(%error, "client accept failed"),
      },
    }
  }
  tracing::debug!("client accept loop stopped");
}

async fn accept_proxies(
  listener: TcpListener,
  acceptor: TlsAcceptor,
  registry: Arc<Registry>,
  shutdown: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((tcp, peer)) => {
          let acceptor = acceptor.clone();
          let registry = registry.clone();
          let shutdown = shutdown.clone();
          tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            match acceptor.accept(tcp).await {
              Ok(stream) => session::serve_proxy(stream, registry, shutdown).await,
              Err(error) => tracing::warn!(%peer, %error, "proxy tls handshake failed"),
            }
          });
        }
        Err(error) => tracing::error!(%error, "proxy accept failed"),
      },
    }
  }
  tracing::debug!("proxy accept loop stopped");
}

async fn sweep_routes(registry: Arc<Registry>, shutdown: CancellationToken) {
  let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {
        registry.cleanup_stale_routes(IDLE_TIMEOUT);
      }
    }
  }
  tracing::debug!("route sweep stopped");
}
