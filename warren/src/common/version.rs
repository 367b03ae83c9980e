// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identity printed by every binary's `version` subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
  pub name: &'static str,
  pub version: &'static str,
}

impl BuildInfo {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      version: VERSION,
    }
  }

  pub fn short(&self) -> String {
    format!("{} {}", self.name, self.version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn short_form_includes_name_and_version() {
    let info = BuildInfo::new("warren-server");
    assert!(info.short().starts_with("warren-server "));
    assert!(info.short().contains(VERSION));
  }

  #[test]
  fn serializes_to_json() {
    let info = BuildInfo::new("warren-client");
    let json = serde_json::to_string(&info).unwrap();
    assert!(json.contains("warren-client"));
  }
}
