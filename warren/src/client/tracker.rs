// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Tracking of intercepted local connections, keyed by flow id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
  #[error("no tracked flow {flow_id}")]
  FlowNotFound { flow_id: String },
  #[error("failed writing to the local socket: {0}")]
  Write(#[from] std::io::Error),
}

struct ClientFlow {
  original_dest: SocketAddr,
  /// Write half of the intercepted socket. The read half lives in the
  /// flow's pump task; cancelling the token tells that task to exit.
  writer: Arc<AsyncMutex<OwnedWriteHalf>>,
  cancel: CancellationToken,
  last_activity: Instant,
}

/// Concurrent map of live flows on this client.
///
/// Entry mutations are serialized by the map; responses are written after
/// releasing the map reference so no I/O happens under it.
#[derive(Default)]
pub struct FlowTracker {
  flows: DashMap<String, ClientFlow>,
}

impl FlowTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn track(
    &self,
    flow_id: &str,
    original_dest: SocketAddr,
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
  ) {
    let flow = ClientFlow {
      original_dest,
      writer: Arc::new(AsyncMutex::new(writer)),
      cancel,
      last_activity: Instant::now(),
    };
    if let Some(previous) = self.flows.insert(flow_id.to_string(), flow) {
      previous.cancel.cancel();
    }
    tracing::debug!(flow_id, dest = %original_dest, "flow tracked");
  }

  pub fn original_dest(&self, flow_id: &str) -> Option<SocketAddr> {
    self.flows.get(flow_id).map(|flow| flow.original_dest)
  }

  pub fn update_activity(&self, flow_id: &str) {
    if let Some(mut flow) = self.flows.get_mut(flow_id) {
      flow.last_activity = Instant::now();
    }
  }

  /// Writes reverse-direction bytes to the flow's local socket.
  pub async fn deliver_response(&self, flow_id: &str, data: &[u8]) -> Result<(), TrackerError> {
    let writer = {
      let mut flow = self
        .flows
        .get_mut(flow_id)
        .ok_or_else(|| TrackerError::FlowNotFound {
          flow_id: flow_id.to_string(),
        })?;
      flow.last_activity = Instant::now();
      flow.writer.clone()
    };
    writer.lock().await.write_all(data).await?;
    tracing::trace!(flow_id, bytes = data.len(), "response delivered");
    Ok(())
  }

  /// Drops the flow, cancelling its pump and closing the local socket.
  pub fn remove(&self, flow_id: &str) {
    if let Some((_, flow)) = self.flows.remove(flow_id) {
      flow.cancel.cancel();
      tracing::debug!(flow_id, "flow removed");
    }
  }

  /// Removes flows idle for longer than `max_idle`; returns how many.
  pub fn cleanup(&self, max_idle: Duration) -> usize {
    let mut removed = 0;
    self.flows.retain(|flow_id, flow| {
      let keep = flow.last_activity.elapsed() <= max_idle;
      if !keep {
        flow.cancel.cancel();
        removed += 1;
        tracing::debug!(%flow_id, "idle flow cleaned up");
      }
      keep
    });
    if removed > 0 {
      tracing::info!(removed, active = self.flows.len(), "flow cleanup completed");
    }
    removed
  }

  /// Drops every flow, regardless of activity. Used at shutdown.
  pub fn clear(&self) {
    self.flows.retain(|_, flow| {
      flow.cancel.cancel();
      false
    });
  }

  pub fn count(&self) -> usize {
    self.flows.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::{TcpListener, TcpStream};

  async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    (accepted.unwrap().0, connected.unwrap())
  }

  fn dest() -> SocketAddr {
    "192.168.1.5:80".parse().unwrap()
  }

  #[tokio::test]
  async fn deliver_writes_to_the_local_socket() {
    let tracker = FlowTracker::new();
    let (tracked, mut app_side) = socket_pair().await;
    let (_read, write) = tracked.into_split();
    tracker.track("f1", dest(), write, CancellationToken::new());

    tracker.deliver_response("f1", b"PONG").await.unwrap();
    let mut buf = [0u8; 4];
    app_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");
  }

  #[tokio::test]
  async fn deliver_to_unknown_flow_fails() {
    let tracker = FlowTracker::new();
    let err = tracker.deliver_response("missing", b"x").await;
    assert!(matches!(err, Err(TrackerError::FlowNotFound { .. })));
  }

  #[tokio::test]
  async fn remove_cancels_the_pump_and_closes_the_socket() {
    let tracker = FlowTracker::new();
    let (tracked, mut app_side) = socket_pair().await;
    let (_read, write) = tracked.into_split();
    let cancel = CancellationToken::new();
    tracker.track("f1", dest(), write, cancel.clone());

    tracker.remove("f1");
    assert!(cancel.is_cancelled());
    assert_eq!(tracker.count(), 0);

    // The write half was dropped, so the app side reads EOF.
    let mut buf = [0u8; 1];
    assert_eq!(app_side.read(&mut buf).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn cleanup_respects_recent_activity() {
    let tracker = FlowTracker::new();
    let (a, _a_peer) = socket_pair().await;
    let (b, _b_peer) = socket_pair().await;
    tracker.track("stale", dest(), a.into_split().1, CancellationToken::new());
    tracker.track("fresh", dest(), b.into_split().1, CancellationToken::new());

    tokio::time::sleep(Duration::from_millis(60)).await;
    tracker.update_activity("fresh");

    assert_eq!(tracker.cleanup(Duration::from_millis(50)), 1);
    assert_eq!(tracker.count(), 1);
    assert!(tracker.original_dest("fresh").is_some());
    assert!(tracker.original_dest("stale").is_none());
  }

  #[tokio::test]
  async fn cleanup_is_idempotent_without_activity() {
    let tracker = FlowTracker::new();
    let (a, _a_peer) = socket_pair().await;
    tracker.track("f1", dest(), a.into_split().1, CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(tracker.cleanup(Duration::from_millis(1)), 1);
    assert_eq!(tracker.cleanup(Duration::from_millis(1)), 0);
  }

  #[tokio::test]
  async fn tracking_the_same_flow_twice_supersedes_the_first() {
    let tracker = FlowTracker::new();
    let (a, _a_peer) = socket_pair().await;
    let (b, mut b_peer) = socket_pair().await;
    let first_cancel = CancellationToken::new();
    tracker.track("f1", dest(), a.into_split().1, first_cancel.clone());
    tracker.track("f1", dest(), b.into_split().1, CancellationToken::new());

    assert!(first_cancel.is_cancelled());
    assert_eq!(tracker.count(), 1);

    tracker.deliver_response("f1", b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    b_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
  }
}
