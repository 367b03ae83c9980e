// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-peer stream service.
//!
//! Each accepted stream gets one reader (this task) and one writer task fed
//! by the session's bounded queue. The first message must be `Register`;
//! everything after the ack is packet and heartbeat dispatch. A routing
//! failure drops that packet, never the stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::cidr::Ipv4Cidr;
use crate::common::wire::{ClientMessage, ProxyMessage};
use crate::common::OUTBOUND_QUEUE_DEPTH;
use crate::server::registry::{Registry, RouteError};
use crate::util::framed::{recv_message, send_message};

fn log_route_error(error: &RouteError, peer_id: &str) {
  match error {
    RouteError::QueueFull { .. } => {
      tracing::error!(peer_id, %error, "dropping packet");
    }
    _ => {
      tracing::warn!(peer_id, %error, "dropping packet");
    }
  }
}

/// Serves one client stream from registration to disconnect.
pub async fn serve_client<S>(stream: S, registry: Arc<Registry>, shutdown: CancellationToken)
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  let (mut reader, mut writer) = tokio::io::split(stream);

  let first = match recv_message::<_, ClientMessage>(&mut reader).await {
    Ok(Some(message)) => message,
    Ok(None) => {
      tracing::debug!("client stream closed before registration");
      return;
    }
    Err(error) => {
      tracing::warn!(%error, "client stream failed before registration");
      return;
    }
  };
  let client_id = match first {
    ClientMessage::Register { client_id } => client_id,
    other => {
      tracing::warn!(?other, "first client message was not a registration");
      let _ = send_message(
        &mut writer,
        &ClientMessage::Ack {
          success: false,
          message: "expected register".into(),
        },
      )
      .await;
      return;
    }
  };

  let (outbound, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
  if let Err(error) = registry.register_client(&client_id, outbound) {
    tracing::info!(%client_id, %error, "rejecting client registration");
    let _ = send_message(
      &mut writer,
      &ClientMessage::Ack {
        success: false,
        message: error.to_string(),
      },
    )
    .await;
    return;
  }
  if let Err(error) = send_message(
    &mut writer,
    &ClientMessage::Ack {
      success: true,
      message: "registered successfully".into(),
    },
  )
  .await
  {
    tracing::warn!(%client_id, %error, "failed sending registration ack");
    registry.unregister_client(&client_id);
    return;
  }

  let writer_cancel = shutdown.child_token();
  let writer_task = {
    let cancel = writer_cancel.clone();
    let client_id = client_id.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          queued = outbound_rx.recv() => match queued {
            Some(message) => {
              if let Err(error) = send_message(&mut writer, &message).await {
                tracing::warn!(%client_id, %error, "client writer failed");
                break;
              }
            }
            None => break,
          },
        }
      }
      use tokio::io::AsyncWriteExt;
      let _ = writer.shutdown().await;
    })
  };

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      received = recv_message::<_, ClientMessage>(&mut reader) => match received {
        Ok(Some(ClientMessage::Packet(pkt))) => {
          if let Err(error) = registry.route_from_client(&client_id, pkt).await {
            log_route_error(&error, &client_id);
          }
        }
        Ok(Some(ClientMessage::Heartbeat { .. })) => {
          tracing::debug!(%client_id, "heartbeat from client");
          registry.client_heartbeat(&client_id);
        }
        Ok(Some(other)) => {
          tracing::warn!(%client_id, ?other, "unexpected message from client");
        }
        Ok(None) => {
          tracing::info!(%client_id, "client disconnected");
          break;
        }
        Err(error) => {
          tracing::warn!(%client_id, %error, "client stream failed");
          break;
        }
      },
    }
  }

  registry.unregister_client(&client_id);
  writer_cancel.cancel();
  let _ = writer_task.await;
}

/// Serves one proxy stream from registration to disconnect.
pub async fn serve_proxy<S>(stream: S, registry: Arc<Registry>, shutdown: CancellationToken)
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  let (mut reader, mut writer) = tokio::io::split(stream);

  let first = match recv_message::<_, ProxyMessage>(&mut reader).await {
    Ok(Some(message)) => message,
    Ok(None) => {
      tracing::debug!("proxy stream closed before registration");
      return;
    }
    Err(error) => {
      tracing::warn!(%error, "proxy stream failed before registration");
      return;
    }
  };
  let (proxy_id, managed_cidr) = match first {
    ProxyMessage::Register {
      proxy_id,
      managed_cidr,
    } => (proxy_id, managed_cidr),
    other => {
      tracing::warn!(?other, "first proxy message was not a registration");
      let _ = send_message(
        &mut writer,
        &ProxyMessage::Ack {
          success: false,
          message: "expected register".into(),
        },
      )
      .await;
      return;
    }
  };

  if let Err(error) = managed_cidr.parse::<Ipv4Cidr>() {
    tracing::info!(%proxy_id, %managed_cidr, %error, "rejecting proxy registration");
    let _ = send_message(
      &mut writer,
      &ProxyMessage::Ack {
        success: false,
        message: format!("invalid managed_cidr: {}", error),
      },
    )
    .await;
    return;
  }

  let (outbound, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
  if let Err(error) = registry.register_proxy(&proxy_id, &managed_cidr, outbound) {
    tracing::info!(%proxy_id, %error, "rejecting proxy registration");
    let _ = send_message(
      &mut writer,
      &ProxyMessage::Ack {
        success: false,
        message: error.to_string(),
      },
    )
    .await;
    return;
  }
  if let Err(error) = send_message(
    &mut writer,
    &ProxyMessage::Ack {
      success: true,
      message: "registered successfully".into(),
    },
  )
  .await
  {
    tracing::warn!(%proxy_id, %error, "failed sending registration ack");
    registry.unregister_proxy(&proxy_id);
    return;
  }

  let writer_cancel = shutdown.child_token();
  let writer_task = {
    let cancel = writer_cancel.clone();
    let proxy_id = proxy_id.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          queued = outbound_rx.recv() => match queued {
            Some(message) => {
              if let Err(error) = send_message(&mut writer, &message).await {
                tracing::warn!(%proxy_id, %error, "proxy writer failed");
                break;
              }
            }
            None => break,
          },
        }
      }
      use tokio::io::AsyncWriteExt;
      let _ = writer.shutdown().await;
    })
  };

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      received = recv_message::<_, ProxyMessage>(&mut reader) => match received {
        Ok(Some(ProxyMessage::Packet(pkt))) => {
          if let Err(error) = registry.route_from_proxy(&proxy_id, pkt).await {
            log_route_error(&error, &proxy_id);
          }
        }
        Ok(Some(ProxyMessage::Heartbeat { .. })) => {
          tracing::debug!(%proxy_id, "heartbeat from proxy");
          registry.proxy_heartbeat(&proxy_id);
        }
        Ok(Some(other)) => {
          tracing::warn!(%proxy_id, ?other, "unexpected message from proxy");
        }
        Ok(None) => {
          tracing::info!(%proxy_id, "proxy disconnected");
          break;
        }
        Err(error) => {
          tracing::warn!(%proxy_id, %error, "proxy stream failed");
          break;
        }
      },
    }
  }

  registry.unregister_proxy(&proxy_id);
  writer_cancel.cancel();
  let _ = writer_task.await;
}
