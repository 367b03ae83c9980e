// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Self-contained certificate authority for the relay's mutual TLS.
//!
//! Generates a CA plus per-role leaf certificates. The `warren-server
//! certgen` subcommand writes a ready-to-use material directory; the
//! integration tests generate theirs the same way.

use std::path::Path;

use rcgen::{
  BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
  KeyPair, KeyUsagePurpose,
};

#[derive(thiserror::Error, Debug)]
pub enum CertgenError {
  #[error("certificate generation failed: {0}")]
  Rcgen(#[from] rcgen::Error),
  #[error("failed writing {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// A generated leaf certificate and its private key, both PEM-encoded.
pub struct Leaf {
  pub cert_pem: String,
  pub key_pem: String,
}

/// An in-memory certificate authority that can issue role leaves.
pub struct Authority {
  cert: Certificate,
  key: KeyPair,
}

impl Authority {
  pub fn generate(common_name: &str) -> Result<Self, CertgenError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let cert = params.self_signed(&key)?;
    Ok(Self { cert, key })
  }

  pub fn ca_pem(&self) -> String {
    self.cert.pem()
  }

  /// Issues a serving leaf carrying the given subject alternative names.
  pub fn issue_server(&self, common_name: &str, sans: &[&str]) -> Result<Leaf, CertgenError> {
    self.issue(common_name, sans, ExtendedKeyUsagePurpose::ServerAuth)
  }

  /// Issues a dialing leaf for a client or proxy identity.
  pub fn issue_peer(&self, common_name: &str) -> Result<Leaf, CertgenError> {
    self.issue(common_name, &[], ExtendedKeyUsagePurpose::ClientAuth)
  }

  fn issue(
    &self,
    common_name: &str,
    sans: &[&str],
    purpose: ExtendedKeyUsagePurpose,
  ) -> Result<Leaf, CertgenError> {
    let key = KeyPair::generate()?;
    let sans: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
    let mut params = CertificateParams::new(sans)?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![purpose];
    let cert = params.signed_by(&key, &self.cert, &self.key)?;
    Ok(Leaf {
      cert_pem: cert.pem(),
      key_pem: key.serialize_pem(),
    })
  }
}

fn write(dir: &Path, name: &str, contents: &str) -> Result<(), CertgenError> {
  let path = dir.join(name);
  std::fs::write(&path, contents).map_err(|source| CertgenError::Io {
    path: path.display().to_string(),
    source,
  })
}

/// Writes a complete material directory: `ca.pem`, `ca.key`, plus
/// `{server,client,proxy}.{pem,key}`. The server leaf carries `san`,
/// `localhost`, and `127.0.0.1` as subject alternative names.
pub fn write_material(dir: &Path, san: &str) -> Result<(), CertgenError> {
  std::fs::create_dir_all(dir).map_err(|source| CertgenError::Io {
    path: dir.display().to_string(),
    source,
  })?;

  let authority = Authority::generate("warren ca")?;

  let mut sans = vec![san, "localhost", "127.0.0.1"];
  sans.dedup();
  let server = authority.issue_server("warren server", &sans)?;
  let client = authority.issue_peer("warren client")?;
  let proxy = authority.issue_peer("warren proxy")?;

  write(dir, "ca.pem", &authority.ca_pem())?;
  write(dir, "ca.key", &authority.key.serialize_pem())?;
  write(dir, "server.pem", &server.cert_pem)?;
  write(dir, "server.key", &server.key_pem)?;
  write(dir, "client.pem", &client.cert_pem)?;
  write(dir, "client.key", &client.key_pem)?;
  write(dir, "proxy.pem", &proxy.cert_pem)?;
  write(dir, "proxy.key", &proxy.key_pem)?;
  Ok(())
}
