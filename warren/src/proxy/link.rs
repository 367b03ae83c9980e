// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The proxy's single multiplexed stream to the server.
//!
//! Mirrors the client link: one writer task drains the reverse-packet
//! queue, one reader task feeds inbound packets to the target forwarder.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::common::tls::{self, TlsError};
use crate::common::wire::{unix_timestamp, Packet, ProxyMessage};
use crate::common::HEARTBEAT_INTERVAL;
use crate::proxy::config::ProxyConfig;
use crate::proxy::forwarder::TargetForwarder;
use crate::util::framed::{recv_message, send_message, FrameError};

#[derive(thiserror::Error, Debug)]
pub enum LinkError {
  #[error("failed dialing server {addr}: {source}")]
  Dial {
    addr: String,
    #[source]
    source: std::io::Error,
  },
  #[error("tls handshake with {addr} failed: {source}")]
  Handshake {
    addr: String,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Tls(#[from] TlsError),
  #[error("stream failed during registration: {0}")]
  Frame(#[from] FrameError),
  #[error("server closed the stream during registration")]
  ClosedDuringRegistration,
  #[error("registration rejected: {0}")]
  Rejected(String),
  #[error("expected a registration ack, received {0}")]
  UnexpectedMessage(String),
}

pub struct ServerLink {
  pub proxy_id: String,
  cancel: CancellationToken,
  closed: CancellationToken,
  writer_task: JoinHandle<()>,
  reader_task: JoinHandle<()>,
}

impl ServerLink {
  /// Dials the server, registers this proxy and its managed CIDR, and
  /// starts the writer and reader tasks. `outbound_rx` carries reverse
  /// packets from the forwarder's pumps.
  pub async fn connect(
    config: &ProxyConfig,
    forwarder: Arc<TargetForwarder>,
    outbound_rx: mpsc::Receiver<Packet>,
    parent: CancellationToken,
  ) -> Result<Self, LinkError> {
    let tls_config = tls::client_config(&config.tls)?;
    let name = tls::server_name(&config.tls, &config.server_addr)?;

    tracing::info!(
      server_addr = %config.server_addr,
      proxy_id = %config.proxy_id,
      managed_cidr = %config.managed_cidr,
      "connecting to server"
    );
    let tcp = TcpStream::connect(&config.server_addr)
      .await
      .map_err(|source| LinkError::Dial {
        addr: config.server_addr.clone(),
        source,
      })?;
    let _ = tcp.set_nodelay(true);
    let stream = TlsConnector::from(tls_config)
      .connect(name, tcp)
      .await
      .map_err(|source| LinkError::Handshake {
        addr: config.server_addr.clone(),
        source,
      })?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    send_message(
      &mut writer,
      &ProxyMessage::Register {
        proxy_id: config.proxy_id.clone(),
        managed_cidr: config.managed_cidr.clone(),
      },
    )
    .await?;
    match recv_message::<_, ProxyMessage>(&mut reader).await? {
      Some(ProxyMessage::Ack { success: true, .. }) => {
        tracing::info!(proxy_id = %config.proxy_id, "registered with server");
      }
      Some(ProxyMessage::Ack {
        success: false,
        message,
      }) => return Err(LinkError::Rejected(message)),
      Some(other) => return Err(LinkError::UnexpectedMessage(format!("{:?}", other))),
      None => return Err(LinkError::ClosedDuringRegistration),
    }

    let cancel = parent.child_token();
    let closed = CancellationToken::new();

    let writer_task = {
      let cancel = cancel.clone();
      let closed = closed.clone();
      let sender_id = config.proxy_id.clone();
      let mut outbound_rx = outbound_rx;
      tokio::spawn(async move {
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            queued = outbound_rx.recv() => match queued {
              Some(pkt) => {
                if let Err(error) = send_message(&mut writer, &ProxyMessage::Packet(pkt)).await {
                  tracing::error!(%error, "failed sending packet to server");
                  break;
                }
              }
              None => break,
            },
            _ = heartbeat.tick() => {
              let beat = ProxyMessage::Heartbeat {
                sender_id: sender_id.clone(),
                timestamp: unix_timestamp(),
              };
              if let Err(error) = send_message(&mut writer, &beat).await {
                tracing::error!(%error, "failed sending heartbeat");
                break;
              }
            }
          }
        }
        use tokio::io::AsyncWriteExt;
        let _ = writer.shutdown().await;
        closed.cancel();
        tracing::debug!("proxy writer stopped");
      })
    };

    let reader_task = {
      let cancel = cancel.clone();
      let closed = closed.clone();
      tokio::spawn(async move {
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            received = recv_message::<_, ProxyMessage>(&mut reader) => match received {
              Ok(Some(ProxyMessage::Packet(pkt))) => {
                let flow_id = pkt.flow_id.clone();
                if let Err(error) = forwarder.forward(pkt).await {
                  // One flow's failure never tears down the stream.
                  tracing::warn!(flow_id = %flow_id, %error, "failed forwarding to target");
                }
              }
              Ok(Some(ProxyMessage::Heartbeat { .. })) => {
                tracing::debug!("heartbeat from server");
              }
              Ok(Some(other)) => {
                tracing::warn!(?other, "unexpected message from server");
              }
              Ok(None) => {
                tracing::info!("server closed the stream");
                break;
              }
              Err(error) => {
                tracing::error!(%error, "server stream failed");
                break;
              }
            },
          }
        }
        closed.cancel();
        tracing::debug!("proxy reader stopped");
      })
    };

    Ok(Self {
      proxy_id: config.proxy_id.clone(),
      cancel,
      closed,
      writer_task,
      reader_task,
    })
  }

  /// Resolves when either link task has stopped, whatever the cause.
  pub async fn closed(&self) {
    self.closed.cancelled().await;
  }

  /// Stops both tasks and waits for them to finish.
  pub async fn close(self) {
    self.cancel.cancel();
    let _ = self.writer_task.await;
    let _ = self.reader_task.await;
  }
}
