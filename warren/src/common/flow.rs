// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Flow identity: the stable id shared by all three hops of a tunnel.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The classic 4-tuple of one TCP connection as observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTuple {
  pub src_ip: IpAddr,
  pub src_port: u16,
  pub dst_ip: IpAddr,
  pub dst_port: u16,
}

impl ConnectionTuple {
  pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
    Self {
      src_ip,
      src_port,
      dst_ip,
      dst_port,
    }
  }

  pub fn reverse(&self) -> Self {
    Self {
      src_ip: self.dst_ip,
      src_port: self.dst_port,
      dst_ip: self.src_ip,
      dst_port: self.src_port,
    }
  }
}

impl fmt::Display for ConnectionTuple {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{} -> {}:{}",
      self.src_ip, self.src_port, self.dst_ip, self.dst_port
    )
  }
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
  match ip {
    IpAddr::V4(v4) => v4.octets().to_vec(),
    IpAddr::V6(v6) => v6.octets().to_vec(),
  }
}

/// Orders endpoints by address bytes (shorter family first), then port.
fn sorted_endpoints(tuple: &ConnectionTuple) -> ((Vec<u8>, u16), (Vec<u8>, u16)) {
  let a = (ip_bytes(&tuple.src_ip), tuple.src_port);
  let b = (ip_bytes(&tuple.dst_ip), tuple.dst_port);
  if a <= b {
    (a, b)
  } else {
    (b, a)
  }
}

fn digest_endpoints(hasher: &mut Sha256, tuple: &ConnectionTuple) {
  let ((ip1, port1), (ip2, port2)) = sorted_endpoints(tuple);
  hasher.update(&ip1);
  hasher.update(port1.to_be_bytes());
  hasher.update(&ip2);
  hasher.update(port2.to_be_bytes());
}

fn hex_prefix(digest: &[u8]) -> String {
  digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Direction-independent id for a 4-tuple: the first 16 bytes of a SHA-256
/// over the sorted endpoints, rendered as 32 lowercase hex chars.
pub fn flow_id(tuple: &ConnectionTuple) -> String {
  let mut hasher = Sha256::new();
  digest_endpoints(&mut hasher, tuple);
  hex_prefix(&hasher.finalize())
}

/// Like [flow_id], but namespaced by the originating client so identical
/// 4-tuples behind different NATs cannot collide on the server.
pub fn scoped_flow_id(client_id: &str, tuple: &ConnectionTuple) -> String {
  let mut hasher = Sha256::new();
  hasher.update(client_id.as_bytes());
  digest_endpoints(&mut hasher, tuple);
  hex_prefix(&hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tuple(src: &str, sport: u16, dst: &str, dport: u16) -> ConnectionTuple {
    ConnectionTuple::new(src.parse().unwrap(), sport, dst.parse().unwrap(), dport)
  }

  #[test]
  fn id_is_32_lowercase_hex() {
    let id = flow_id(&tuple("10.0.0.1", 43210, "192.168.1.5", 80));
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
  }

  #[test]
  fn id_is_direction_independent() {
    let forward = tuple("10.0.0.1", 43210, "192.168.1.5", 80);
    assert_eq!(flow_id(&forward), flow_id(&forward.reverse()));
  }

  #[test]
  fn scoped_id_is_direction_independent() {
    let forward = tuple("10.0.0.1", 43210, "192.168.1.5", 80);
    assert_eq!(
      scoped_flow_id("client-a", &forward),
      scoped_flow_id("client-a", &forward.reverse())
    );
  }

  #[test]
  fn distinct_tuples_get_distinct_ids() {
    let a = flow_id(&tuple("10.0.0.1", 43210, "192.168.1.5", 80));
    let b = flow_id(&tuple("10.0.0.1", 43211, "192.168.1.5", 80));
    let c = flow_id(&tuple("10.0.0.2", 43210, "192.168.1.5", 80));
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_ne!(b, c);
  }

  #[test]
  fn clients_namespace_their_ids() {
    let t = tuple("10.0.0.1", 43210, "192.168.1.5", 80);
    assert_ne!(scoped_flow_id("client-a", &t), scoped_flow_id("client-b", &t));
    assert_ne!(scoped_flow_id("client-a", &t), flow_id(&t));
  }

  #[test]
  fn ipv6_tuples_hash_without_panic() {
    let t = tuple("::1", 1000, "2001:db8::5", 443);
    assert_eq!(flow_id(&t).len(), 32);
    assert_eq!(flow_id(&t), flow_id(&t.reverse()));
  }

  #[test]
  fn many_random_tuples_keep_the_shape_and_symmetry() {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for _ in 0..256 {
      let t = ConnectionTuple::new(
        IpAddr::from(rng.gen::<[u8; 4]>()),
        rng.gen(),
        IpAddr::from(rng.gen::<[u8; 4]>()),
        rng.gen(),
      );
      let id = flow_id(&t);
      assert_eq!(id.len(), 32);
      assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
      assert_eq!(id, flow_id(&t.reverse()));
    }
  }
}
