// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The message unions spoken between peers and the server.
//!
//! Each peer holds exactly one framed stream to the server and both
//! directions carry the same role-specific union. The first message on any
//! stream must be `Register`; the server answers with exactly one `Ack`.

use serde::{Deserialize, Serialize};

use super::flow::ConnectionTuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
  Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
  Forward,
  Reverse,
}

/// One chunk of tunneled bytes, tagged with the flow it belongs to.
///
/// The tuple is mandatory on the forward path (the server routes on its
/// destination ip, the proxy dials it) and omitted on the reverse path,
/// where the flow id alone identifies the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
  pub flow_id: String,
  pub data: Vec<u8>,
  pub tuple: Option<ConnectionTuple>,
  pub protocol: Protocol,
  pub direction: Direction,
  pub timestamp: i64,
}

impl Packet {
  pub fn forward(flow_id: String, data: Vec<u8>, tuple: ConnectionTuple) -> Self {
    Self {
      flow_id,
      data,
      tuple: Some(tuple),
      protocol: Protocol::Tcp,
      direction: Direction::Forward,
      timestamp: unix_timestamp(),
    }
  }

  pub fn reverse(flow_id: String, data: Vec<u8>) -> Self {
    Self {
      flow_id,
      data,
      tuple: None,
      protocol: Protocol::Tcp,
      direction: Direction::Reverse,
      timestamp: unix_timestamp(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
  Register { client_id: String },
  Ack { success: bool, message: String },
  Packet(Packet),
  Heartbeat { sender_id: String, timestamp: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyMessage {
  Register {
    proxy_id: String,
    managed_cidr: String,
  },
  Ack {
    success: bool,
    message: String,
  },
  Packet(Packet),
  Heartbeat {
    sender_id: String,
    timestamp: i64,
  },
}

pub fn unix_timestamp() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}
