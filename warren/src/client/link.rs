// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The client's single multiplexed stream to the server.
//!
//! One writer task owns the send side and drains the bounded outbound
//! queue; one reader task dispatches inbound messages. Nothing else ever
//! touches the stream, which keeps frames from interleaving.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::client::config::ClientConfig;
use crate::client::tracker::{FlowTracker, TrackerError};
use crate::common::tls::{self, TlsError};
use crate::common::wire::{unix_timestamp, ClientMessage, Packet};
use crate::common::HEARTBEAT_INTERVAL;
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

/// Generated client identity: `client-` plus 22 random alphanumerics.
pub fn generate_client_id() -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(22)
    .map(char::from)
    .collect();
  format!("client-{}", suffix)
}

pub struct ServerLink {
  pub client_id: String,
  cancel: CancellationToken,
  closed: CancellationToken,
  writer_task: JoinHandle<()>,
  reader_task: JoinHandle<()>,
}

impl ServerLink {
  /// Dials the server, registers, and starts the writer and reader tasks.
  /// `outbound_rx` feeds the writer; flow pumps hold the matching sender.
  pub async fn connect(
    config: &ClientConfig,
    tracker: Arc<FlowTracker>,
    outbound_rx: mpsc::Receiver<Packet>,
    parent: CancellationToken,
  ) -> Result<Self, LinkError> {
    let client_id = if config.client_id.is_empty() {
      generate_client_id()
    } else {
      config.client_id.clone()
    };

    let tls_config = tls::client_config(&config.tls)?;
    let name = tls::server_name(&config.tls, &config.server_addr)?;

    tracing::info!(server_addr = %config.server_addr, client_id = %client_id, "connecting to server");
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
      &ClientMessage::Register {
        client_id: client_id.clone(),
      },
    )
    .await?;
    match recv_message::<_, ClientMessage>(&mut reader).await? {
      Some(ClientMessage::Ack { success: true, .. }) => {
        tracing::info!(client_id = %client_id, "registered with server");
      }
      Some(ClientMessage::Ack {
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
      let sender_id = client_id.clone();
      let mut outbound_rx = outbound_rx;
      tokio::spawn(async move {
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            queued = outbound_rx.recv() => match queued {
              Some(pkt) => {
                if let Err(error) = send_message(&mut writer, &ClientMessage::Packet(pkt)).await {
                  tracing::error!(%error, "failed sending packet to server");
                  break;
                }
              }
              None => break,
            },
            _ = heartbeat.tick() => {
              let beat = ClientMessage::Heartbeat {
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
        tracing::debug!("client writer stopped");
      })
    };

    let reader_task = {
      let cancel = cancel.clone();
      let closed = closed.clone();
      tokio::spawn(async move {
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            received = recv_message::<_, ClientMessage>(&mut reader) => match received {
              Ok(Some(ClientMessage::Packet(pkt))) => {
                match tracker.deliver_response(&pkt.flow_id, &pkt.data).await {
                  Ok(()) => {}
                  Err(TrackerError::FlowNotFound { flow_id }) => {
                    // Routine near teardown; the flow closed while a
                    // response was in flight.
                    tracing::debug!(%flow_id, "response for unknown flow dropped");
                  }
                  Err(error) => {
                    tracing::warn!(flow_id = %pkt.flow_id, %error, "failed delivering response");
                  }
                }
              }
              Ok(Some(ClientMessage::Heartbeat { .. })) => {
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
        tracing::debug!("client reader stopped");
      })
    };

    Ok(Self {
      client_id,
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
