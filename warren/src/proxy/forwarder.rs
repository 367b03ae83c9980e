// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Fan-out to tunneled targets: one lazily-dialed connection per flow,
//! each with its own read pump feeding the link's outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::common::wire::Packet;
use crate::common::{DIAL_TIMEOUT, IDLE_TIMEOUT, READ_BUFFER_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
  #[error("first packet for flow {flow_id} carries no destination tuple")]
  MissingTuple { flow_id: String },
  #[error("dial to {addr} timed out")]
  DialTimeout { addr: SocketAddr },
  #[error("failed to dial target {addr}: {source}")]
  DialFailed {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("failed writing to target: {0}")]
  Write(#[from] std::io::Error),
}

struct TargetConn {
  target_addr: SocketAddr,
  writer: Arc<AsyncMutex<OwnedWriteHalf>>,
  cancel: CancellationToken,
  last_activity: Instant,
}

/// Map of live target connections, keyed by flow id.
pub struct TargetForwarder {
  conns: DashMap<String, TargetConn>,
  outbound: mpsc::Sender<Packet>,
  shutdown: CancellationToken,
}

impl TargetForwarder {
  pub fn new(outbound: mpsc::Sender<Packet>, shutdown: CancellationToken) -> Self {
    Self {
      conns: DashMap::new(),
      outbound,
      shutdown,
    }
  }

  /// Handles one forward-direction packet: writes to the flow's target
  /// connection, dialing it first if this flow is new.
  pub async fn forward(self: &Arc<Self>, pkt: Packet) -> Result<(), ForwardError> {
    let existing = self.conns.get_mut(&pkt.flow_id).map(|mut conn| {
      conn.last_activity = Instant::now();
      conn.writer.clone()
    });
    let writer = match existing {
      Some(writer) => writer,
      None => self.open_target(&pkt).await?,
    };

    if let Err(error) = writer.lock().await.write_all(&pkt.data).await {
      self.remove(&pkt.flow_id);
      return Err(ForwardError::Write(error));
    }
    tracing::trace!(flow_id = %pkt.flow_id, bytes = pkt.data.len(), "forwarded to target");
    Ok(())
  }

  async fn open_target(
    self: &Arc<Self>,
    pkt: &Packet,
  ) -> Result<Arc<AsyncMutex<OwnedWriteHalf>>, ForwardError> {
    let tuple = pkt.tuple.ok_or_else(|| ForwardError::MissingTuple {
      flow_id: pkt.flow_id.clone(),
    })?;
    let target_addr = SocketAddr::new(tuple.dst_ip, tuple.dst_port);

    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target_addr))
      .await
      .map_err(|_| ForwardError::DialTimeout { addr: target_addr })?
      .map_err(|source| ForwardError::DialFailed {
        addr: target_addr,
        source,
      })?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(write_half));

    let cancel = self.shutdown.child_token();
    self.conns.insert(
      pkt.flow_id.clone(),
      TargetConn {
        target_addr,
        writer: writer.clone(),
        cancel: cancel.clone(),
        last_activity: Instant::now(),
      },
    );
    tracing::info!(flow_id = %pkt.flow_id, target = %target_addr, "target connection established");

    tokio::spawn(pump_target(
      self.clone(),
      read_half,
      pkt.flow_id.clone(),
      cancel,
    ));
    Ok(writer)
  }

  pub fn update_activity(&self, flow_id: &str) {
    if let Some(mut conn) = self.conns.get_mut(flow_id) {
      conn.last_activity = Instant::now();
    }
  }

  pub fn target_addr(&self, flow_id: &str) -> Option<SocketAddr> {
    self.conns.get(flow_id).map(|conn| conn.target_addr)
  }

  /// Drops the flow, cancelling its pump and closing the target socket.
  pub fn remove(&self, flow_id: &str) {
    if let Some((_, conn)) = self.conns.remove(flow_id) {
      conn.cancel.cancel();
      tracing::debug!(flow_id, "target connection removed");
    }
  }

  /// Removes connections idle for longer than `max_idle`; returns how many.
  pub fn cleanup(&self, max_idle: Duration) -> usize {
    let mut removed = 0;
    self.conns.retain(|flow_id, conn| {
      let keep = conn.last_activity.elapsed() <= max_idle;
      if !keep {
        conn.cancel.cancel();
        removed += 1;
        tracing::debug!(%flow_id, "idle target connection cleaned up");
      }
      keep
    });
    if removed > 0 {
      tracing::info!(removed, active = self.conns.len(), "target cleanup completed");
    }
    removed
  }

  pub fn clear(&self) {
    self.conns.retain(|_, conn| {
      conn.cancel.cancel();
      false
    });
  }

  pub fn count(&self) -> usize {
    self.conns.len()
  }
}

/// Reads from one target and reports each chunk as a reverse packet.
///
/// The enqueue blocks until the queue has room or shutdown fires. Reverse
/// bytes were already produced by the target, so dropping them would
/// corrupt the flow; backpressure is the correct behavior here.
async fn pump_target(
  forwarder: Arc<TargetForwarder>,
  mut read_half: OwnedReadHalf,
  flow_id: String,
  cancel: CancellationToken,
) {
  let mut buf = vec![0u8; READ_BUFFER_SIZE];
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      read = tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut buf)) => match read {
        Err(_) => {
          tracing::debug!(flow_id = %flow_id, "target read idle timeout");
          break;
        }
        Ok(Err(error)) => {
          tracing::warn!(flow_id = %flow_id, %error, "target read failed");
          break;
        }
        Ok(Ok(0)) => {
          tracing::debug!(flow_id = %flow_id, "target connection closed");
          break;
        }
        Ok(Ok(n)) => {
          forwarder.update_activity(&flow_id);
          let pkt = Packet::reverse(flow_id.clone(), buf[..n].to_vec());
          tokio::select! {
            _ = cancel.cancelled() => break,
            sent = forwarder.outbound.send(pkt) => {
              if sent.is_err() {
                tracing::warn!(flow_id = %flow_id, "outbound queue closed, ending flow");
                break;
              }
            }
          }
        }
      },
    }
  }
  forwarder.remove(&flow_id);
}
