// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::cidr::Ipv4Cidr;
use crate::common::config::{self, ConfigError};
use crate::common::tls::TlsOptions;
use crate::util::validators::parse_socketaddr;

const ENV_PREFIX: &str = "PROXY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub server_addr: String,
  /// Operator-assigned identity; registration fails on duplicates.
  pub proxy_id: String,
  /// The network segment this proxy claims to reach.
  pub managed_cidr: String,
  pub tls: TlsOptions,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      server_addr: "127.0.0.1:8081".into(),
      proxy_id: String::new(),
      managed_cidr: String::new(),
      tls: TlsOptions::default(),
    }
  }
}

impl ProxyConfig {
  /// Loads defaults, then the file, then environment overrides. CLI flags
  /// land afterwards, so validation is left to the caller.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let mut cfg: Self = match path {
      Some(path) => config::load_file(path)?,
      None => Self::default(),
    };
    cfg.apply_env();
    Ok(cfg)
  }

  fn apply_env(&mut self) {
    if let Some(v) = config::env_override(ENV_PREFIX, "SERVER_ADDR") {
      self.server_addr = v;
    }
    if let Some(v) = config::env_override(ENV_PREFIX, "PROXY_ID") {
      self.proxy_id = v;
    }
    if let Some(v) = config::env_override(ENV_PREFIX, "MANAGED_CIDR") {
      self.managed_cidr = v;
    }
    config::apply_tls_env(ENV_PREFIX, &mut self.tls);
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.server_addr.is_empty() {
      return Err(ConfigError::Invalid("server address is required".into()));
    }
    parse_socketaddr(&self.server_addr)
      .map_err(|e| ConfigError::Invalid(format!("server_addr: {}", e)))?;
    if self.proxy_id.is_empty() {
      return Err(ConfigError::Invalid("proxy id is required".into()));
    }
    if self.managed_cidr.is_empty() {
      return Err(ConfigError::Invalid("managed CIDR is required".into()));
    }
    self
      .managed_cidr
      .parse::<Ipv4Cidr>()
      .map_err(|e| ConfigError::Invalid(format!("managed_cidr: {}", e)))?;
    Ok(())
  }
}
