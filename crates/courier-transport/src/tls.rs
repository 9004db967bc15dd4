// Client-side TLS settings and rustls config assembly.
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{Result, TransportError};

/// How the client authenticates the broker, and optionally itself.
///
/// A prebuilt `config` wins over the file-based settings.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub config: Option<Arc<ClientConfig>>,
    /// Overrides the SNI / verification name derived from the server host.
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = &self.config {
            return Ok(config.clone());
        }

        let mut roots = RootCertStore::empty();
        match &self.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|err| tls_error(format!("bad CA in {}: {err}", path.display())))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|err| tls_error(err.to_string()))?
        .with_root_certificates(roots);

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|err| tls_error(format!("client certificate rejected: {err}")))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(tls_error(
                    "client_cert and client_key must be set together".to_string(),
                ));
            }
        };
        Ok(Arc::new(config))
    }

    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|err| tls_error(format!("invalid server name {name:?}: {err}")))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| tls_error(format!("no private key in {}", path.display())))
}

fn tls_error(message: String) -> TransportError {
    TransportError::Tls(message)
}
