// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::net::SocketAddr;

use anyhow::{Error as AnyErr, Result};

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  use std::net::{Ipv4Addr, Ipv6Addr};
  match v.parse::<Ipv4Addr>() {
    Ok(addr) => Ok(addr.into()),
    Err(_) => match v.parse::<Ipv6Addr>() {
      Ok(addr) => Ok(addr.into()),
      Err(_) => Err(AnyErr::msg(
        "Could not parse input as ipv4 or ipv6 address",
      )),
    },
  }
}
