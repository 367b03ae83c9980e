// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Configuration loading shared by the three roles.
//!
//! Precedence is defaults, then file, then environment, then CLI flags
//! (applied by the binaries). Files are YAML or JSON by extension.
//! Environment variables are prefixed with the app name and nested by
//! underscores, e.g. `CLIENT_SERVER_ADDR` or `SERVER_TLS_CERT_PATH`.

use std::path::Path;

use serde::de::DeserializeOwned;

use super::tls::TlsOptions;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("failed reading config {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("failed parsing config {path}: {message}")]
  Parse { path: String, message: String },
  #[error("unsupported config format for {path}; expected .yaml, .yml, or .json")]
  UnsupportedFormat { path: String },
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Parses a YAML or JSON config file into any deserializable config type.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
  let display = path.display().to_string();
  let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: display.clone(),
    source,
  })?;
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase());
  match extension.as_deref() {
    Some("yaml") | Some("yml") => {
      serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: display,
        message: e.to_string(),
      })
    }
    Some("json") => serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
      path: display,
      message: e.to_string(),
    }),
    _ => Err(ConfigError::UnsupportedFormat { path: display }),
  }
}

/// Reads `{PREFIX}_{KEY}` from the environment, treating empty as unset.
pub fn env_override(prefix: &str, key: &str) -> Option<String> {
  let name = format!("{}_{}", prefix, key).to_ascii_uppercase();
  match std::env::var(name) {
    Ok(value) if !value.is_empty() => Some(value),
    _ => None,
  }
}

/// Applies the `{PREFIX}_TLS_*` family of overrides shared by every role.
pub fn apply_tls_env(prefix: &str, tls: &mut TlsOptions) {
  if let Some(v) = env_override(prefix, "TLS_CERT_PATH") {
    tls.cert_path = v;
  }
  if let Some(v) = env_override(prefix, "TLS_KEY_PATH") {
    tls.key_path = v;
  }
  if let Some(v) = env_override(prefix, "TLS_CA_PATH") {
    tls.ca_path = v;
  }
  if let Some(v) = env_override(prefix, "TLS_SERVER_NAME") {
    tls.server_name = v;
  }
  if let Some(v) = env_override(prefix, "TLS_INSECURE_SKIP_VERIFY") {
    tls.insecure_skip_verify = matches!(v.as_str(), "1" | "true" | "yes");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Default, PartialEq, Deserialize)]
  #[serde(default)]
  struct Sample {
    name: String,
    port: u16,
  }

  fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("warren-config-{}-{}", std::process::id(), name))
  }

  #[test]
  fn loads_yaml_by_extension() {
    let path = temp_path("a.yaml");
    std::fs::write(&path, "name: relay\nport: 9000\n").unwrap();
    let sample: Sample = load_file(&path).unwrap();
    assert_eq!(
      sample,
      Sample {
        name: "relay".into(),
        port: 9000
      }
    );
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn loads_json_by_extension() {
    let path = temp_path("b.json");
    std::fs::write(&path, r#"{"name":"relay","port":9001}"#).unwrap();
    let sample: Sample = load_file(&path).unwrap();
    assert_eq!(sample.port, 9001);
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn unknown_extension_is_rejected() {
    let path = temp_path("c.toml");
    std::fs::write(&path, "name = \"relay\"").unwrap();
    let result: Result<Sample, _> = load_file(&path);
    assert!(matches!(result, Err(ConfigError::UnsupportedFormat { .. })));
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn env_override_reads_prefixed_upper_names() {
    std::env::set_var("WARRENTEST_SERVER_ADDR", "10.0.0.1:9999");
    assert_eq!(
      env_override("warrentest", "server_addr").as_deref(),
      Some("10.0.0.1:9999")
    );
    std::env::remove_var("WARRENTEST_SERVER_ADDR");
    assert_eq!(env_override("warrentest", "server_addr"), None);
  }

  #[test]
  fn tls_env_overrides_apply() {
    std::env::set_var("WARRENTLS_TLS_CERT_PATH", "/tmp/cert.pem");
    std::env::set_var("WARRENTLS_TLS_INSECURE_SKIP_VERIFY", "true");
    let mut tls = TlsOptions::default();
    apply_tls_env("WARRENTLS", &mut tls);
    assert_eq!(tls.cert_path, "/tmp/cert.pem");
    assert!(tls.insecure_skip_verify);
    std::env::remove_var("WARRENTLS_TLS_CERT_PATH");
    std::env::remove_var("WARRENTLS_TLS_INSECURE_SKIP_VERIFY");
  }
}
