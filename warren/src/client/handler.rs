// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-flow read pump for intercepted local connections.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::tracker::FlowTracker;
use crate::common::flow::{scoped_flow_id, ConnectionTuple};
use crate::common::wire::Packet;
use crate::common::{IDLE_TIMEOUT, READ_BUFFER_SIZE};

/// Pumps one intercepted connection: registers it with the tracker, then
/// forwards each local read as a packet on the server link's queue.
///
/// The enqueue is non-blocking: when the queue is full the chunk is dropped
/// with a warning, so a congested link never stalls the accept path.
pub async fn handle_flow(
  stream: TcpStream,
  peer: SocketAddr,
  original_dest: SocketAddrV4,
  client_id: String,
  tracker: Arc<FlowTracker>,
  outbound: mpsc::Sender<Packet>,
  shutdown: CancellationToken,
) {
  let tuple = ConnectionTuple::new(
    peer.ip(),
    peer.port(),
    IpAddr::V4(*original_dest.ip()),
    original_dest.port(),
  );
  let flow_id = scoped_flow_id(&client_id, &tuple);

  let (mut read_half, write_half) = stream.into_split();
  let cancel = shutdown.child_token();
  tracker.track(&flow_id, SocketAddr::V4(original_dest), write_half, cancel.clone());
  tracing::info!(
    flow_id = %flow_id,
    source = %peer,
    original_dest = %original_dest,
    "intercepted connection"
  );

  let mut buf = vec![0u8; READ_BUFFER_SIZE];
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      read = tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut buf)) => match read {
        Err(_) => {
          tracing::debug!(flow_id = %flow_id, "local read idle timeout");
          break;
        }
        Ok(Err(error)) => {
          tracing::warn!(flow_id = %flow_id, %error, "local read failed");
          break;
        }
        Ok(Ok(0)) => {
          tracing::debug!(flow_id = %flow_id, "local connection closed");
          break;
        }
        Ok(Ok(n)) => {
          tracker.update_activity(&flow_id);
          let pkt = Packet::forward(flow_id.clone(), buf[..n].to_vec(), tuple);
          match outbound.try_send(pkt) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
              tracing::warn!(flow_id = %flow_id, "outbound queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
              tracing::warn!(flow_id = %flow_id, "server link closed, ending flow");
              break;
            }
          }
        }
      },
    }
  }

  tracker.remove(&flow_id);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::wire::Direction;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  async fn intercepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (stream, peer) = accepted.unwrap();
    (stream, connected.unwrap(), peer)
  }

  #[tokio::test]
  async fn local_reads_become_forward_packets() {
    let (stream, mut app, peer) = intercepted_pair().await;
    let original: SocketAddrV4 = "192.168.1.5:80".parse().unwrap();
    let tracker = Arc::new(FlowTracker::new());
    let (tx, mut rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();

    let pump = tokio::spawn(handle_flow(
      stream,
      peer,
      original,
      "client-test".into(),
      tracker.clone(),
      tx,
      shutdown.clone(),
    ));

    app.write_all(b"PING").await.unwrap();
    let pkt = rx.recv().await.unwrap();
    assert_eq!(pkt.data, b"PING");
    assert_eq!(pkt.direction, Direction::Forward);
    let tuple = pkt.tuple.unwrap();
    assert_eq!(tuple.dst_ip, "192.168.1.5".parse::<IpAddr>().unwrap());
    assert_eq!(tuple.dst_port, 80);
    assert_eq!(
      pkt.flow_id,
      scoped_flow_id("client-test", &tuple)
    );
    assert_eq!(tracker.count(), 1);

    // Closing the app socket ends the pump and removes the flow.
    drop(app);
    pump.await.unwrap();
    assert_eq!(tracker.count(), 0);
  }

  #[tokio::test]
  async fn full_queue_drops_chunks_without_ending_the_flow() {
    let (stream, mut app, peer) = intercepted_pair().await;
    let original: SocketAddrV4 = "192.168.1.5:80".parse().unwrap();
    let tracker = Arc::new(FlowTracker::new());
    let (tx, mut rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();

    let pump = tokio::spawn(handle_flow(
      stream,
      peer,
      original,
      "client-test".into(),
      tracker.clone(),
      tx,
      shutdown.clone(),
    ));

    app.write_all(b"first").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    app.write_all(b"second").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The queue held one message; the second chunk was dropped but the
    // flow stayed tracked.
    assert_eq!(tracker.count(), 1);
    assert_eq!(rx.recv().await.unwrap().data, b"first");

    app.write_all(b"third").await.unwrap();
    assert_eq!(rx.recv().await.unwrap().data, b"third");

    drop(app);
    pump.await.unwrap();
  }

  #[tokio::test]
  async fn cancellation_ends_the_pump() {
    let (stream, _app, peer) = intercepted_pair().await;
    let original: SocketAddrV4 = "192.168.1.5:80".parse().unwrap();
    let tracker = Arc::new(FlowTracker::new());
    let (tx, _rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();

    let pump = tokio::spawn(handle_flow(
      stream,
      peer,
      original,
      "client-test".into(),
      tracker.clone(),
      tx,
      shutdown.clone(),
    ));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    shutdown.cancel();
    pump.await.unwrap();
    assert_eq!(tracker.count(), 0);
  }
}
