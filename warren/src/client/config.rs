// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::cidr::Ipv4Cidr;
use crate::common::config::{self, ConfigError};
use crate::common::tls::TlsOptions;
use crate::util::validators::parse_socketaddr;

const ENV_PREFIX: &str = "CLIENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub server_addr: String,
  pub listen_port: u16,
  /// Destinations inside this network are intercepted and tunneled.
  pub target_cidr: String,
  /// Registration identity; generated when empty.
  pub client_id: String,
  pub tls: TlsOptions,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      server_addr: "127.0.0.1:8080".into(),
      listen_port: 8888,
      target_cidr: String::new(),
      client_id: String::new(),
      tls: TlsOptions::default(),
    }
  }
}

impl ClientConfig {
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
    if let Some(v) = config::env_override(ENV_PREFIX, "LISTEN_PORT") {
      if let Ok(port) = v.parse() {
        self.listen_port = port;
      }
    }
    if let Some(v) = config::env_override(ENV_PREFIX, "TARGET_CIDR") {
      self.target_cidr = v;
    }
    if let Some(v) = config::env_override(ENV_PREFIX, "CLIENT_ID") {
      self.client_id = v;
    }
    config::apply_tls_env(ENV_PREFIX, &mut self.tls);
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.server_addr.is_empty() {
      return Err(ConfigError::Invalid("server address is required".into()));
    }
    parse_socketaddr(&self.server_addr)
      .map_err(|e| ConfigError::Invalid(format!("server_addr: {}", e)))?;
    if self.listen_port == 0 {
      return Err(ConfigError::Invalid("listen port is required".into()));
    }
    if self.target_cidr.is_empty() {
      return Err(ConfigError::Invalid("target CIDR is required".into()));
    }
    self
      .target_cidr
      .parse::<Ipv4Cidr>()
      .map_err(|e| ConfigError::Invalid(format!("target_cidr: {}", e)))?;
    Ok(())
  }
}
