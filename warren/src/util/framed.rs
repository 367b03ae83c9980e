// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Length-delimited message framing over any async byte stream.
//!
//! Every message is a u32 big-endian length prefix followed by a
//! JSON-serialized body. Both sides of the relay speak this framing over
//! their TLS streams; a frame is always one complete message.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body. Payload chunks are capped at 64 KiB
/// before serialization, so a megabyte of headroom covers the JSON encoding
/// with room to spare.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
  #[error("frame length {received} exceeds the limit of {limit} bytes")]
  TooLong { limit: usize, received: usize },
  #[error("stream failed mid-frame: {0}")]
  Io(#[from] std::io::Error),
  #[error("frame body failed to decode: {0}")]
  Decode(#[source] serde_json::Error),
  #[error("message failed to encode: {0}")]
  Encode(#[source] serde_json::Error),
}

/// Reads one frame body, or `None` if the stream closed cleanly before a
/// length prefix arrived.
pub async fn read_frame<S: AsyncRead + Unpin>(
  stream: &mut S,
  max_length: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
  let length = match stream.read_u32().await {
    Ok(length) => length as usize,
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(FrameError::Io(e)),
  };
  if length > max_length {
    return Err(FrameError::TooLong {
      limit: max_length,
      received: length,
    });
  }
  let mut body = vec![0u8; length];
  stream.read_exact(&mut body).await?;
  Ok(Some(body))
}

/// Writes one frame. The length prefix and body are flushed together so a
/// frame is never left half-buffered inside the TLS layer.
pub async fn write_frame<S: AsyncWrite + Unpin>(
  stream: &mut S,
  body: &[u8],
) -> Result<(), FrameError> {
  stream.write_u32(body.len() as u32).await?;
  stream.write_all(body).await?;
  stream.flush().await?;
  Ok(())
}

/// Receives and decodes one message, or `None` on clean end of stream.
pub async fn recv_message<S, T>(stream: &mut S) -> Result<Option<T>, FrameError>
where
  S: AsyncRead + Unpin,
  T: DeserializeOwned,
{
  match read_frame(stream, MAX_FRAME_LENGTH).await? {
    Some(body) => Ok(Some(
      serde_json::from_slice(&body).map_err(FrameError::Decode)?,
    )),
    None => Ok(None),
  }
}

/// Encodes and sends one message.
///
/// Serialization happens before any write, so an oversized or unencodable
/// message leaves the stream untouched rather than corrupting the framing.
pub async fn send_message<S, T>(stream: &mut S, message: &T) -> Result<(), FrameError>
where
  S: AsyncWrite + Unpin,
  T: Serialize,
{
  let body = serde_json::to_vec(message).map_err(FrameError::Encode)?;
  if body.len() > MAX_FRAME_LENGTH {
    return Err(FrameError::TooLong {
      limit: MAX_FRAME_LENGTH,
      received: body.len(),
    });
  }
  write_frame(stream, &body).await
}
