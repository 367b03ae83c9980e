// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! IPv4 CIDR parsing and containment for the routing table.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CidrError {
  #[error("invalid network address in {input:?}")]
  Address { input: String },
  #[error("invalid prefix length in {input:?}")]
  Prefix { input: String },
}

/// An IPv4 network in CIDR notation. A bare address parses as a /32 host.
///
/// The stored network address is normalized: host bits below the prefix are
/// cleared, so `10.1.2.3/8` and `10.0.0.0/8` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
  network: Ipv4Addr,
  prefix_len: u8,
}

impl Ipv4Cidr {
  pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, CidrError> {
    if prefix_len > 32 {
      return Err(CidrError::Prefix {
        input: format!("{}/{}", addr, prefix_len),
      });
    }
    let masked = u32::from(addr) & Self::mask(prefix_len);
    Ok(Self {
      network: Ipv4Addr::from(masked),
      prefix_len,
    })
  }

  fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
      0
    } else {
      u32::MAX << (32 - prefix_len)
    }
  }

  pub fn network(&self) -> Ipv4Addr {
    self.network
  }

  pub fn prefix_len(&self) -> u8 {
    self.prefix_len
  }

  pub fn contains(&self, addr: Ipv4Addr) -> bool {
    u32::from(addr) & Self::mask(self.prefix_len) == u32::from(self.network)
  }

  /// Containment check against any address family; IPv6 never matches.
  pub fn contains_ip(&self, addr: IpAddr) -> bool {
    match addr {
      IpAddr::V4(v4) => self.contains(v4),
      IpAddr::V6(_) => false,
    }
  }
}

impl FromStr for Ipv4Cidr {
  type Err = CidrError;

  fn from_str(input: &str) -> Result<Self, Self::Err> {
    let (addr_part, prefix_part) = match input.split_once('/') {
      Some((addr, prefix)) => (addr, Some(prefix)),
      None => (input, None),
    };
    let addr: Ipv4Addr = addr_part.parse().map_err(|_| CidrError::Address {
      input: input.to_string(),
    })?;
    let prefix_len = match prefix_part {
      Some(p) => p.parse::<u8>().map_err(|_| CidrError::Prefix {
        input: input.to_string(),
      })?,
      None => 32,
    };
    Self::new(addr, prefix_len)
  }
}

impl fmt::Display for Ipv4Cidr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.network, self.prefix_len)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_network_notation() {
    let cidr: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
    assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 1, 0));
    assert_eq!(cidr.prefix_len(), 24);
  }

  #[test]
  fn bare_address_is_a_host_route() {
    let cidr: Ipv4Cidr = "10.0.0.5".parse().unwrap();
    assert_eq!(cidr.prefix_len(), 32);
    assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 5)));
    assert!(!cidr.contains(Ipv4Addr::new(10, 0, 0, 6)));
  }

  #[test]
  fn host_bits_are_normalized_away() {
    let a: Ipv4Cidr = "10.1.2.3/8".parse().unwrap();
    let b: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn containment_honors_the_mask() {
    let cidr: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
    assert!(cidr.contains(Ipv4Addr::new(10, 255, 0, 1)));
    assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));

    let all: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
    assert!(all.contains(Ipv4Addr::new(203, 0, 113, 9)));
  }

  #[test]
  fn ipv6_addresses_never_match() {
    let cidr: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
    assert!(!cidr.contains_ip("2001:db8::1".parse().unwrap()));
  }

  #[test]
  fn malformed_inputs_are_rejected() {
    assert!(matches!(
      "300.0.0.1/8".parse::<Ipv4Cidr>(),
      Err(CidrError::Address { .. })
    ));
    assert!(matches!(
      "10.0.0.0/33".parse::<Ipv4Cidr>(),
      Err(CidrError::Prefix { .. })
    ));
    assert!(matches!(
      "10.0.0.0/abc".parse::<Ipv4Cidr>(),
      Err(CidrError::Prefix { .. })
    ));
    assert!("".parse::<Ipv4Cidr>().is_err());
  }

  #[test]
  fn displays_in_canonical_form() {
    let cidr: Ipv4Cidr = "192.168.77.4/16".parse().unwrap();
    assert_eq!(cidr.to_string(), "192.168.0.0/16");
  }
}
