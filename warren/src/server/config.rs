// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::config::{self, ConfigError};
use crate::common::tls::TlsOptions;
use crate::util::validators::parse_socketaddr;

const ENV_PREFIX: &str = "SERVER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub client_listen_addr: String,
  pub proxy_listen_addr: String,
  pub tls: TlsOptions,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      client_listen_addr: "0.0.0.0:8080".into(),
      proxy_listen_addr: "0.0.0.0:8081".into(),
      tls: TlsOptions::default(),
    }
  }
}

impl ServerConfig {
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
    if let Some(v) = config::env_override(ENV_PREFIX, "CLIENT_LISTEN_ADDR") {
      self.client_listen_addr = v;
    }
    if let Some(v) = config::env_override(ENV_PREFIX, "PROXY_LISTEN_ADDR") {
      self.proxy_listen_addr = v;
    }
    config::apply_tls_env(ENV_PREFIX, &mut self.tls);
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.client_listen_addr.is_empty() {
      return Err(ConfigError::Invalid("client listen address is required".into()));
    }
    if self.proxy_listen_addr.is_empty() {
      return Err(ConfigError::Invalid("proxy listen address is required".into()));
    }
    if self.client_listen_addr == self.proxy_listen_addr {
      return Err(ConfigError::Invalid(
        "client and proxy listen addresses must be different".into(),
      ));
    }
    parse_socketaddr(&self.client_listen_addr)
      .map_err(|e| ConfigError::Invalid(format!("client_listen_addr: {}", e)))?;
    parse_socketaddr(&self.proxy_listen_addr)
      .map_err(|e| ConfigError::Invalid(format!("proxy_listen_addr: {}", e)))?;
    Ok(())
  }
}
