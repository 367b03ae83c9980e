// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Mutual-TLS transport material.
//!
//! Every stream in the relay is TLS 1.3 against a shared certificate
//! authority. The server requires and verifies client certificates; peers
//! verify the server against the same CA.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::{
  self,
  pki_types::{CertificateDer, PrivateKeyDer, ServerName},
  server::WebPkiClientVerifier,
  ClientConfig, RootCertStore, ServerConfig,
};

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
  #[error("tls option {field} is required but unset")]
  MissingMaterial { field: &'static str },
  #[error("failed reading {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("no certificates found in {path}")]
  EmptyCertFile { path: String },
  #[error("no private key found in {path}")]
  NoPrivateKey { path: String },
  #[error("no usable CA certificates in {path}")]
  EmptyCaStore { path: String },
  #[error("invalid server name {name:?}")]
  ServerName { name: String },
  #[error(transparent)]
  Rustls(#[from] rustls::Error),
  #[error("client certificate verifier: {0}")]
  Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// TLS settings shared by all three role configs under the `tls` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
  pub cert_path: String,
  pub key_path: String,
  pub ca_path: String,
  /// Name expected on the server certificate; defaults to the host portion
  /// of the server address.
  pub server_name: String,
  /// Skips server certificate verification. Lab use only.
  pub insecure_skip_verify: bool,
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
  let file = std::fs::File::open(Path::new(path)).map_err(|source| TlsError::Io {
    path: path.to_string(),
    source,
  })?;
  let mut reader = std::io::BufReader::new(file);
  let certs = rustls_pemfile::certs(&mut reader)
    .collect::<Result<Vec<_>, _>>()
    .map_err(|source| TlsError::Io {
      path: path.to_string(),
      source,
    })?;
  if certs.is_empty() {
    return Err(TlsError::EmptyCertFile {
      path: path.to_string(),
    });
  }
  Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
  let file = std::fs::File::open(Path::new(path)).map_err(|source| TlsError::Io {
    path: path.to_string(),
    source,
  })?;
  let mut reader = std::io::BufReader::new(file);
  rustls_pemfile::private_key(&mut reader)
    .map_err(|source| TlsError::Io {
      path: path.to_string(),
      source,
    })?
    .ok_or_else(|| TlsError::NoPrivateKey {
      path: path.to_string(),
    })
}

fn read_ca_store(path: &str) -> Result<RootCertStore, TlsError> {
  let mut roots = RootCertStore::empty();
  for cert in read_certs(path)? {
    roots.add(cert).map_err(TlsError::Rustls)?;
  }
  if roots.is_empty() {
    return Err(TlsError::EmptyCaStore {
      path: path.to_string(),
    });
  }
  Ok(roots)
}

fn require(field: &'static str, value: &str) -> Result<(), TlsError> {
  if value.is_empty() {
    Err(TlsError::MissingMaterial { field })
  } else {
    Ok(())
  }
}

/// Builds the listening-side config: TLS 1.3 only, client certificates
/// required and verified against the shared CA.
pub fn server_config(options: &TlsOptions) -> Result<Arc<ServerConfig>, TlsError> {
  require("tls.cert_path", &options.cert_path)?;
  require("tls.key_path", &options.key_path)?;
  require("tls.ca_path", &options.ca_path)?;

  let certs = read_certs(&options.cert_path)?;
  let key = read_key(&options.key_path)?;
  let roots = read_ca_store(&options.ca_path)?;
  let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

  let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
    .with_client_cert_verifier(verifier)
    .with_single_cert(certs, key)?;
  Ok(Arc::new(config))
}

/// Builds the dialing-side config: TLS 1.3 only, presenting the peer's
/// certificate for mutual verification.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, TlsError> {
  require("tls.cert_path", &options.cert_path)?;
  require("tls.key_path", &options.key_path)?;

  let certs = read_certs(&options.cert_path)?;
  let key = read_key(&options.key_path)?;

  let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
  let config = if options.insecure_skip_verify {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(danger::InsecureServerVerifier::new()))
      .with_client_auth_cert(certs, key)?
  } else {
    require("tls.ca_path", &options.ca_path)?;
    let roots = read_ca_store(&options.ca_path)?;
    builder
      .with_root_certificates(roots)
      .with_client_auth_cert(certs, key)?
  };
  Ok(Arc::new(config))
}

/// The name to verify on the server certificate: the configured override,
/// or the host portion of `server_addr`.
pub fn server_name(
  options: &TlsOptions,
  server_addr: &str,
) -> Result<ServerName<'static>, TlsError> {
  let name = if options.server_name.is_empty() {
    server_addr
      .rsplit_once(':')
      .map(|(host, _)| host)
      .unwrap_or(server_addr)
      .to_string()
  } else {
    options.server_name.clone()
  };
  ServerName::try_from(name.clone()).map_err(|_| TlsError::ServerName { name })
}

mod danger {
  use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::ring,
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
  };

  /// Accepts any server certificate. Only reachable through the explicit
  /// `insecure_skip_verify` option.
  #[derive(Debug)]
  pub(super) struct InsecureServerVerifier {
    schemes: Vec<SignatureScheme>,
  }

  impl InsecureServerVerifier {
    pub(super) fn new() -> Self {
      Self {
        schemes: ring::default_provider()
          .signature_verification_algorithms
          .supported_schemes(),
      }
    }
  }

  impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
      &self,
      _end_entity: &CertificateDer<'_>,
      _intermediates: &[CertificateDer<'_>],
      _server_name: &ServerName<'_>,
      _ocsp_response: &[u8],
      _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
      Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
      &self,
      _message: &[u8],
      _cert: &CertificateDer<'_>,
      _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
      Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
      &self,
      _message: &[u8],
      _cert: &CertificateDer<'_>,
      _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
      Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
      self.schemes.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_material_is_reported_by_field() {
    let options = TlsOptions::default();
    assert!(matches!(
      server_config(&options),
      Err(TlsError::MissingMaterial {
        field: "tls.cert_path"
      })
    ));
  }

  #[test]
  fn server_name_falls_back_to_the_host() {
    let options = TlsOptions::default();
    let name = server_name(&options, "relay.example.net:8443").unwrap();
    assert!(matches!(name, ServerName::DnsName(_)));
  }

  #[test]
  fn server_name_override_wins() {
    let options = TlsOptions {
      server_name: "tunnel.internal".into(),
      ..TlsOptions::default()
    };
    let name = server_name(&options, "10.0.0.1:8443").unwrap();
    assert_eq!(name, ServerName::try_from("tunnel.internal").unwrap());
  }

  #[test]
  fn material_from_generated_certs_builds_both_sides() {
    let dir = std::env::temp_dir().join(format!("warren-tls-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    crate::common::certgen::write_material(&dir, "localhost").unwrap();

    let options = TlsOptions {
      cert_path: dir.join("server.pem").display().to_string(),
      key_path: dir.join("server.key").display().to_string(),
      ca_path: dir.join("ca.pem").display().to_string(),
      ..TlsOptions::default()
    };
    server_config(&options).unwrap();

    let options = TlsOptions {
      cert_path: dir.join("client.pem").display().to_string(),
      key_path: dir.join("client.key").display().to_string(),
      ca_path: dir.join("ca.pem").display().to_string(),
      ..TlsOptions::default()
    };
    client_config(&options).unwrap();

    let _ = std::fs::remove_dir_all(&dir);
  }
}
