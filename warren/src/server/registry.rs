// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The server's connection registry and routing engine.
//!
//! One lock guards the three tables: client sessions, proxy sessions, and
//! per-flow routes. Lookups resolve a destination queue under the lock and
//! enqueue after dropping it, so no I/O ever happens while holding it.
//! Sends go through each session's bounded outbound queue; the dedicated
//! writer task on the other end keeps frames from interleaving.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::common::cidr::Ipv4Cidr;
use crate::common::wire::{ClientMessage, Packet, ProxyMessage};
use crate::common::ROUTER_SEND_TIMEOUT;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
  #[error("{kind} {id:?} is already registered")]
  AlreadyRegistered { kind: &'static str, id: String },
}

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
  #[error("packet for flow {flow_id} carries no destination address")]
  MissingDestination { flow_id: String },
  #[error("no proxy manages a network containing {dst}")]
  NoRoute { dst: IpAddr },
  #[error("no route for flow {flow_id}")]
  FlowNotFound { flow_id: String },
  #[error("{kind} {id} is no longer connected")]
  PeerGone { kind: &'static str, id: String },
  #[error("outbound queue for {kind} {id} stayed full")]
  QueueFull { kind: &'static str, id: String },
}

#[derive(Debug, Clone)]
pub struct ClientSession {
  pub id: String,
  pub connected_at: Instant,
  pub last_seen: Instant,
  outbound: mpsc::Sender<ClientMessage>,
}

#[derive(Debug, Clone)]
pub struct ProxySession {
  pub id: String,
  pub managed_cidr: String,
  pub connected_at: Instant,
  pub last_seen: Instant,
  outbound: mpsc::Sender<ProxyMessage>,
}

#[derive(Debug)]
struct FlowRoute {
  client_id: String,
  proxy_id: String,
  created_at: Instant,
  last_activity: Instant,
  packets_to_proxy: u64,
  packets_to_client: u64,
  bytes_to_proxy: u64,
  bytes_to_client: u64,
}

/// Point-in-time view of one route, for logs and operators.
#[derive(Debug, Clone)]
pub struct RouteMetrics {
  pub flow_id: String,
  pub client_id: String,
  pub proxy_id: String,
  pub age: Duration,
  pub idle: Duration,
  pub packets_to_proxy: u64,
  pub packets_to_client: u64,
  pub bytes_to_proxy: u64,
  pub bytes_to_client: u64,
}

#[derive(Default)]
struct Inner {
  clients: HashMap<String, ClientSession>,
  proxies: HashMap<String, ProxySession>,
  routes: HashMap<String, FlowRoute>,
}

#[derive(Default)]
pub struct Registry {
  inner: Mutex<Inner>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().expect("registry lock poisoned")
  }

  pub fn register_client(
    &self,
    id: &str,
    outbound: mpsc::Sender<ClientMessage>,
  ) -> Result<(), RegistryError> {
    let mut inner = self.lock();
    if inner.clients.contains_key(id) {
      return Err(RegistryError::AlreadyRegistered {
        kind: "client",
        id: id.to_string(),
      });
    }
    let now = Instant::now();
    inner.clients.insert(
      id.to_string(),
      ClientSession {
        id: id.to_string(),
        connected_at: now,
        last_seen: now,
        outbound,
      },
    );
    tracing::info!(client_id = id, "client registered");
    Ok(())
  }

  pub fn unregister_client(&self, id: &str) {
    if self.lock().clients.remove(id).is_some() {
      tracing::info!(client_id = id, "client unregistered");
    }
  }

  pub fn register_proxy(
    &self,
    id: &str,
    managed_cidr: &str,
    outbound: mpsc::Sender<ProxyMessage>,
  ) -> Result<(), RegistryError> {
    let mut inner = self.lock();
    if inner.proxies.contains_key(id) {
      return Err(RegistryError::AlreadyRegistered {
        kind: "proxy",
        id: id.to_string(),
      });
    }
    let now = Instant::now();
    inner.proxies.insert(
      id.to_string(),
      ProxySession {
        id: id.to_string(),
        managed_cidr: managed_cidr.to_string(),
        connected_at: now,
        last_seen: now,
        outbound,
      },
    );
    tracing::info!(proxy_id = id, managed_cidr, "proxy registered");
    Ok(())
  }

  pub fn unregister_proxy(&self, id: &str) {
    if self.lock().proxies.remove(id).is_some() {
      tracing::info!(proxy_id = id, "proxy unregistered");
    }
  }

  /// Heartbeats advance the session's liveness timestamp. Nothing is
  /// evicted for missing them; the timestamp is informational.
  pub fn client_heartbeat(&self, id: &str) {
    if let Some(session) = self.lock().clients.get_mut(id) {
      session.last_seen = Instant::now();
    }
  }

  pub fn proxy_heartbeat(&self, id: &str) {
    if let Some(session) = self.lock().proxies.get_mut(id) {
      session.last_seen = Instant::now();
    }
  }

  /// Forwards a client-sourced packet toward the proxy whose managed CIDR
  /// contains the destination, creating the route on first sight.
  pub async fn route_from_client(&self, client_id: &str, pkt: Packet) -> Result<(), RouteError> {
    let (proxy_id, outbound) = {
      let mut inner = self.lock();
      let route = Self::ensure_route(&mut inner, client_id, &pkt)?;
      route.last_activity = Instant::now();
      route.packets_to_proxy += 1;
      route.bytes_to_proxy += pkt.data.len() as u64;
      let proxy_id = route.proxy_id.clone();
      let outbound = inner
        .proxies
        .get(&proxy_id)
        .map(|p| p.outbound.clone())
        .ok_or(RouteError::PeerGone {
          kind: "proxy",
          id: proxy_id.clone(),
        })?;
      (proxy_id, outbound)
    };

    tracing::debug!(
      flow_id = %pkt.flow_id,
      proxy_id = %proxy_id,
      bytes = pkt.data.len(),
      "routing packet from client to proxy"
    );

    match outbound
      .send_timeout(ProxyMessage::Packet(pkt), ROUTER_SEND_TIMEOUT)
      .await
    {
      Ok(()) => Ok(()),
      Err(SendTimeoutError::Timeout(_)) => Err(RouteError::QueueFull {
        kind: "proxy",
        id: proxy_id,
      }),
      Err(SendTimeoutError::Closed(_)) => Err(RouteError::PeerGone {
        kind: "proxy",
        id: proxy_id,
      }),
    }
  }

  /// Forwards a proxy-sourced packet back to the client that owns the flow.
  /// Reverse packets never create routes; an unknown flow is the caller's
  /// cue to drop with a warning.
  pub async fn route_from_proxy(&self, proxy_id: &str, pkt: Packet) -> Result<(), RouteError> {
    let (client_id, outbound) = {
      let mut inner = self.lock();
      let route = inner
        .routes
        .get_mut(&pkt.flow_id)
        .ok_or_else(|| RouteError::FlowNotFound {
          flow_id: pkt.flow_id.clone(),
        })?;
      route.last_activity = Instant::now();
      route.packets_to_client += 1;
      route.bytes_to_client += pkt.data.len() as u64;
      let client_id = route.client_id.clone();
      let outbound = inner
        .clients
        .get(&client_id)
        .map(|c| c.outbound.clone())
        .ok_or(RouteError::PeerGone {
          kind: "client",
          id: client_id.clone(),
        })?;
      (client_id, outbound)
    };

    tracing::debug!(
      flow_id = %pkt.flow_id,
      client_id = %client_id,
      proxy_id,
      bytes = pkt.data.len(),
      "routing packet from proxy to client"
    );

    match outbound
      .send_timeout(ClientMessage::Packet(pkt), ROUTER_SEND_TIMEOUT)
      .await
    {
      Ok(()) => Ok(()),
      Err(SendTimeoutError::Timeout(_)) => Err(RouteError::QueueFull {
        kind: "client",
        id: client_id,
      }),
      Err(SendTimeoutError::Closed(_)) => Err(RouteError::PeerGone {
        kind: "client",
        id: client_id,
      }),
    }
  }

  fn ensure_route<'a>(
    inner: &'a mut Inner,
    client_id: &str,
    pkt: &Packet,
  ) -> Result<&'a mut FlowRoute, RouteError> {
    if !inner.routes.contains_key(&pkt.flow_id) {
      let dst = pkt
        .tuple
        .map(|t| t.dst_ip)
        .ok_or_else(|| RouteError::MissingDestination {
          flow_id: pkt.flow_id.clone(),
        })?;
      let proxy_id =
        Self::resolve_proxy(&inner.proxies, dst).ok_or(RouteError::NoRoute { dst })?;
      let now = Instant::now();
      inner.routes.insert(
        pkt.flow_id.clone(),
        FlowRoute {
          client_id: client_id.to_string(),
          proxy_id: proxy_id.clone(),
          created_at: now,
          last_activity: now,
          packets_to_proxy: 0,
          packets_to_client: 0,
          bytes_to_proxy: 0,
          bytes_to_client: 0,
        },
      );
      tracing::info!(
        flow_id = %pkt.flow_id,
        client_id,
        proxy_id = %proxy_id,
        dst = %dst,
        "flow route created"
      );
    }
    Ok(
      inner
        .routes
        .get_mut(&pkt.flow_id)
        .expect("route exists after ensure"),
    )
  }

  /// Longest-prefix match over the declared CIDRs. Ties break on the
  /// lexicographically smallest proxy id so resolution is deterministic.
  /// Sessions whose CIDR fails to parse are skipped with a warning.
  fn resolve_proxy(proxies: &HashMap<String, ProxySession>, dst: IpAddr) -> Option<String> {
    let mut best: Option<(u8, &ProxySession)> = None;
    for session in proxies.values() {
      let cidr = match session.managed_cidr.parse::<Ipv4Cidr>() {
        Ok(cidr) => cidr,
        Err(error) => {
          tracing::warn!(
            proxy_id = %session.id,
            managed_cidr = %session.managed_cidr,
            %error,
            "skipping proxy with unparseable CIDR"
          );
          continue;
        }
      };
      if !cidr.contains_ip(dst) {
        continue;
      }
      let better = match best {
        None => true,
        Some((best_len, best_session)) => {
          cidr.prefix_len() > best_len
            || (cidr.prefix_len() == best_len && session.id < best_session.id)
        }
      };
      if better {
        best = Some((cidr.prefix_len(), session));
      }
    }
    best.map(|(_, session)| session.id.clone())
  }

  /// Removes routes idle for longer than `max_idle`. Peers are not
  /// notified; each side notices the silence through its own idle timers.
  pub fn cleanup_stale_routes(&self, max_idle: Duration) -> usize {
    let mut inner = self.lock();
    let before = inner.routes.len();
    inner.routes.retain(|flow_id, route| {
      let keep = route.last_activity.elapsed() <= max_idle;
      if !keep {
        tracing::info!(flow_id = %flow_id, "reaped stale flow route");
      }
      keep
    });
    let removed = before - inner.routes.len();
    if removed > 0 {
      tracing::info!(removed, active = inner.routes.len(), "route sweep completed");
    }
    removed
  }

  pub fn route_metrics(&self, flow_id: &str) -> Option<RouteMetrics> {
    let inner = self.lock();
    inner
      .routes
      .get(flow_id)
      .map(|route| Self::metrics_of(flow_id, route))
  }

  pub fn all_route_metrics(&self) -> Vec<RouteMetrics> {
    let inner = self.lock();
    inner
      .routes
      .iter()
      .map(|(flow_id, route)| Self::metrics_of(flow_id, route))
      .collect()
  }

  fn metrics_of(flow_id: &str, route: &FlowRoute) -> RouteMetrics {
    RouteMetrics {
      flow_id: flow_id.to_string(),
      client_id: route.client_id.clone(),
      proxy_id: route.proxy_id.clone(),
      age: route.created_at.elapsed(),
      idle: route.last_activity.elapsed(),
      packets_to_proxy: route.packets_to_proxy,
      packets_to_client: route.packets_to_client,
      bytes_to_proxy: route.bytes_to_proxy,
      bytes_to_client: route.bytes_to_client,
    }
  }

  pub fn client_count(&self) -> usize {
    self.lock().clients.len()
  }

  pub fn proxy_count(&self) -> usize {
    self.lock().proxies.len()
  }

  pub fn route_count(&self) -> usize {
    self.lock().routes.len()
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    tracing::info!(
      clients = inner.clients.len(),
      proxies = inner.proxies.len(),
      routes = inner.routes.len(),
      "clearing registry"
    );
    inner.clients.clear();
    inner.proxies.clear();
    inner.routes.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::flow::ConnectionTuple;
  use crate::common::wire::Direction;

  fn forward_packet(flow_id: &str, dst: &str) -> Packet {
    let tuple = ConnectionTuple::new(
      "10.9.9.9".parse().unwrap(),
      40000,
      dst.parse().unwrap(),
      22,
    );
    Packet::forward(flow_id.to_string(), b"data".to_vec(), tuple)
  }

  fn client_channel() -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ClientMessage>) {
    mpsc::channel(8)
  }

  fn proxy_channel() -> (mpsc::Sender<ProxyMessage>, mpsc::Receiver<ProxyMessage>) {
    mpsc::channel(8)
  }

  #[test]
  fn duplicate_registration_fails_without_mutating() {
    let registry = Registry::new();
    let (tx1, _rx1) = proxy_channel();
    let (tx2, _rx2) = proxy_channel();
    registry.register_proxy("p1", "10.0.0.0/8", tx1).unwrap();
    let err = registry.register_proxy("p1", "192.168.0.0/16", tx2);
    assert!(matches!(
      err,
      Err(RegistryError::AlreadyRegistered { kind: "proxy", .. })
    ));
    assert_eq!(registry.proxy_count(), 1);
  }

  #[test]
  fn reregistration_after_unregister_succeeds() {
    let registry = Registry::new();
    let (tx, _rx) = client_channel();
    registry.register_client("c1", tx).unwrap();
    registry.unregister_client("c1");
    let (tx, _rx) = client_channel();
    registry.register_client("c1", tx).unwrap();
    assert_eq!(registry.client_count(), 1);
  }

  #[tokio::test]
  async fn first_packet_creates_a_route_and_reaches_the_proxy() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (ptx, mut prx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("p1", "192.168.1.0/24", ptx).unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await
      .unwrap();

    assert_eq!(registry.route_count(), 1);
    match prx.recv().await {
      Some(ProxyMessage::Packet(pkt)) => {
        assert_eq!(pkt.flow_id, "f1");
        assert_eq!(pkt.direction, Direction::Forward);
      }
      other => panic!("expected packet, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn destinations_route_to_the_containing_cidr() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (atx, mut arx) = proxy_channel();
    let (btx, mut brx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("a", "10.0.0.0/8", atx).unwrap();
    registry.register_proxy("b", "192.168.0.0/16", btx).unwrap();

    registry
      .route_from_client("c1", forward_packet("f-a", "10.1.2.3"))
      .await
      .unwrap();
    registry
      .route_from_client("c1", forward_packet("f-b", "192.168.4.5"))
      .await
      .unwrap();

    assert!(matches!(arx.recv().await, Some(ProxyMessage::Packet(p)) if p.flow_id == "f-a"));
    assert!(matches!(brx.recv().await, Some(ProxyMessage::Packet(p)) if p.flow_id == "f-b"));

    let err = registry
      .route_from_client("c1", forward_packet("f-c", "172.16.0.1"))
      .await;
    assert!(matches!(err, Err(RouteError::NoRoute { .. })));
    assert_eq!(registry.route_count(), 2);
  }

  #[tokio::test]
  async fn longest_prefix_wins_among_overlapping_proxies() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (wide_tx, mut wide_rx) = proxy_channel();
    let (narrow_tx, mut narrow_rx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("wide", "10.0.0.0/8", wide_tx).unwrap();
    registry
      .register_proxy("narrow", "10.1.0.0/16", narrow_tx)
      .unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "10.1.2.3"))
      .await
      .unwrap();
    assert!(matches!(
      narrow_rx.recv().await,
      Some(ProxyMessage::Packet(_))
    ));

    registry
      .route_from_client("c1", forward_packet("f2", "10.200.0.1"))
      .await
      .unwrap();
    assert!(matches!(wide_rx.recv().await, Some(ProxyMessage::Packet(_))));
  }

  #[tokio::test]
  async fn equal_prefixes_break_ties_on_proxy_id() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (z_tx, _z_rx) = proxy_channel();
    let (a_tx, mut a_rx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("zeta", "10.0.0.0/8", z_tx).unwrap();
    registry.register_proxy("alpha", "10.0.0.0/8", a_tx).unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "10.3.3.3"))
      .await
      .unwrap();
    assert!(matches!(a_rx.recv().await, Some(ProxyMessage::Packet(_))));
  }

  #[tokio::test]
  async fn malformed_cidrs_are_skipped_at_resolve_time() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (bad_tx, _bad_rx) = proxy_channel();
    let (good_tx, mut good_rx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry
      .register_proxy("bad", "not-a-network", bad_tx)
      .unwrap();
    registry
      .register_proxy("good", "10.0.0.0/8", good_tx)
      .unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "10.1.1.1"))
      .await
      .unwrap();
    assert!(matches!(good_rx.recv().await, Some(ProxyMessage::Packet(_))));
  }

  #[tokio::test]
  async fn reverse_packets_never_create_routes() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    registry.register_client("c1", ctx).unwrap();

    let err = registry
      .route_from_proxy("p1", Packet::reverse("unknown".into(), b"x".to_vec()))
      .await;
    assert!(matches!(err, Err(RouteError::FlowNotFound { .. })));
    assert_eq!(registry.route_count(), 0);
  }

  #[tokio::test]
  async fn counters_advance_in_both_directions() {
    let registry = Registry::new();
    let (ctx, mut crx) = client_channel();
    let (ptx, mut prx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("p1", "192.168.1.0/24", ptx).unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await
      .unwrap();
    registry
      .route_from_proxy("p1", Packet::reverse("f1".into(), b"12345678".to_vec()))
      .await
      .unwrap();

    let metrics = registry.route_metrics("f1").unwrap();
    assert_eq!(metrics.packets_to_proxy, 1);
    assert_eq!(metrics.packets_to_client, 1);
    assert_eq!(metrics.bytes_to_proxy, 4);
    assert_eq!(metrics.bytes_to_client, 8);
    assert!(prx.recv().await.is_some());
    assert!(crx.recv().await.is_some());
  }

  #[tokio::test]
  async fn disconnect_leaves_routes_for_the_sweep() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (ptx, mut prx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("p1", "192.168.1.0/24", ptx).unwrap();
    registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await
      .unwrap();
    assert!(prx.recv().await.is_some());

    registry.unregister_proxy("p1");
    let err = registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await;
    assert!(matches!(
      err,
      Err(RouteError::PeerGone { kind: "proxy", .. })
    ));
    assert_eq!(registry.route_count(), 1);
  }

  #[tokio::test]
  async fn sweep_reaps_idle_routes_and_is_idempotent() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (ptx, mut prx) = proxy_channel();
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("p1", "192.168.1.0/24", ptx).unwrap();
    registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await
      .unwrap();
    assert!(prx.recv().await.is_some());

    // A generous threshold must not touch a fresh route.
    assert_eq!(registry.cleanup_stale_routes(Duration::from_secs(300)), 0);
    assert_eq!(registry.route_count(), 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(registry.cleanup_stale_routes(Duration::from_millis(1)), 1);
    assert_eq!(registry.route_count(), 0);
    assert_eq!(registry.cleanup_stale_routes(Duration::from_millis(1)), 0);
  }

  #[tokio::test]
  async fn full_queue_times_out_as_queue_full() {
    let registry = Registry::new();
    let (ctx, _crx) = client_channel();
    let (ptx, prx) = mpsc::channel::<ProxyMessage>(1);
    registry.register_client("c1", ctx).unwrap();
    registry.register_proxy("p1", "192.168.1.0/24", ptx).unwrap();

    registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await
      .unwrap();
    // The queue now holds one undrained message; the next send must time out.
    let err = registry
      .route_from_client("c1", forward_packet("f1", "192.168.1.5"))
      .await;
    assert!(matches!(
      err,
      Err(RouteError::QueueFull { kind: "proxy", .. })
    ));
    drop(prx);
  }
}
