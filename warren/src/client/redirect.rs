// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Packet-filter interception: the nat-table REDIRECT rule that steers
//! matching TCP connections into the local listener, and the socket query
//! that recovers each connection's pre-redirect destination.

use std::net::SocketAddrV4;

use tokio::net::TcpStream;

use crate::common::cidr::Ipv4Cidr;

#[derive(thiserror::Error, Debug)]
pub enum RedirectError {
  #[error("traffic interception is not supported on this platform")]
  Unsupported,
  #[error("failed invoking {binary}: {source}")]
  Spawn {
    binary: &'static str,
    #[source]
    source: std::io::Error,
  },
  #[error("{binary} exited with status {status}: {stderr}")]
  CommandFailed {
    binary: &'static str,
    status: i32,
    stderr: String,
  },
}

const IPTABLES: &str = "iptables";

/// The nat OUTPUT rule redirecting intercepted traffic to a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
  pub destination: Ipv4Cidr,
  pub to_port: u16,
  pub comment: String,
}

impl RedirectRule {
  pub fn tcp_redirect(destination: Ipv4Cidr, to_port: u16) -> Self {
    Self {
      destination,
      to_port,
      comment: "warren tcp redirect".into(),
    }
  }

  fn spec_args(&self) -> Vec<String> {
    vec![
      "-p".into(),
      "tcp".into(),
      "-d".into(),
      self.destination.to_string(),
      "-j".into(),
      "REDIRECT".into(),
      "--to-ports".into(),
      self.to_port.to_string(),
      "-m".into(),
      "comment".into(),
      "--comment".into(),
      self.comment.clone(),
    ]
  }

  pub fn add_args(&self) -> Vec<String> {
    let mut args = vec!["-t".into(), "nat".into(), "-A".into(), "OUTPUT".into()];
    args.extend(self.spec_args());
    args
  }

  pub fn delete_args(&self) -> Vec<String> {
    let mut args = vec!["-t".into(), "nat".into(), "-D".into(), "OUTPUT".into()];
    args.extend(self.spec_args());
    args
  }
}

/// Installs the redirect rule on setup and removes it on cleanup.
///
/// Cleanup must run on every exit path; [Drop] backstops the explicit call
/// so a panic or early error cannot leave the rule behind.
#[derive(Debug)]
pub struct Redirector {
  rule: RedirectRule,
  active: bool,
}

impl Redirector {
  pub fn new(rule: RedirectRule) -> Self {
    Self { rule, active: false }
  }

  pub fn setup(&mut self) -> Result<(), RedirectError> {
    if self.active {
      tracing::warn!("redirect rule already active");
      return Ok(());
    }
    tracing::info!(
      destination = %self.rule.destination,
      to_port = self.rule.to_port,
      "installing redirect rule"
    );
    run_iptables(&self.rule.add_args())?;
    self.active = true;
    Ok(())
  }

  pub fn cleanup(&mut self) -> Result<(), RedirectError> {
    if !self.active {
      tracing::debug!("redirect rule not active, nothing to clean up");
      return Ok(());
    }
    tracing::info!("removing redirect rule");
    run_iptables(&self.rule.delete_args())?;
    self.active = false;
    Ok(())
  }

  pub fn is_active(&self) -> bool {
    self.active
  }
}

impl Drop for Redirector {
  fn drop(&mut self) {
    if self.active {
      if let Err(error) = self.cleanup() {
        tracing::error!(%error, "failed removing redirect rule on drop");
      }
    }
  }
}

#[cfg(target_os = "linux")]
fn run_iptables(args: &[String]) -> Result<(), RedirectError> {
  let output = std::process::Command::new(IPTABLES)
    .args(args)
    .output()
    .map_err(|source| RedirectError::Spawn {
      binary: IPTABLES,
      source,
    })?;
  if !output.status.success() {
    return Err(RedirectError::CommandFailed {
      binary: IPTABLES,
      status: output.status.code().unwrap_or(-1),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_iptables(_args: &[String]) -> Result<(), RedirectError> {
  Err(RedirectError::Unsupported)
}

/// Whether this platform can recover pre-redirect destinations at all.
pub fn platform_supported() -> bool {
  cfg!(target_os = "linux")
}

/// Recovers the destination a redirected connection was originally headed
/// for, via the kernel's `SO_ORIGINAL_DST` socket option.
#[cfg(target_os = "linux")]
pub fn original_dest(stream: &TcpStream) -> std::io::Result<SocketAddrV4> {
  use std::net::Ipv4Addr;
  use std::os::unix::io::AsRawFd;

  const SO_ORIGINAL_DST: libc::c_int = 80;

  let fd = stream.as_raw_fd();
  let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
  let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
  let ret = unsafe {
    libc::getsockopt(
      fd,
      libc::SOL_IP,
      SO_ORIGINAL_DST,
      &mut addr as *mut _ as *mut libc::c_void,
      &mut len,
    )
  };
  if ret != 0 {
    return Err(std::io::Error::last_os_error());
  }
  let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
  let port = u16::from_be(addr.sin_port);
  Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dest(_stream: &TcpStream) -> std::io::Result<SocketAddrV4> {
  Err(std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "SO_ORIGINAL_DST is only available on linux",
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rule() -> RedirectRule {
    RedirectRule::tcp_redirect("192.168.1.0/24".parse().unwrap(), 8888)
  }

  #[test]
  fn add_args_build_the_exact_invocation() {
    assert_eq!(
      rule().add_args(),
      vec![
        "-t",
        "nat",
        "-A",
        "OUTPUT",
        "-p",
        "tcp",
        "-d",
        "192.168.1.0/24",
        "-j",
        "REDIRECT",
        "--to-ports",
        "8888",
        "-m",
        "comment",
        "--comment",
        "warren tcp redirect",
      ]
    );
  }

  #[test]
  fn delete_args_mirror_add_args() {
    let add = rule().add_args();
    let delete = rule().delete_args();
    assert_eq!(delete[2], "-D");
    assert_eq!(add[3..], delete[3..]);
  }

  #[test]
  fn cleanup_before_setup_is_a_no_op() {
    let mut redirector = Redirector::new(rule());
    assert!(!redirector.is_active());
    // Never touches iptables, so this passes on any platform and without
    // privileges.
    redirector.cleanup().unwrap();
  }
}
