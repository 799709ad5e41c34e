//! Optional TLS wrapping for server and client sockets.

use crate::config::TlsConfig;
use crate::error::{BlobError, Result};
use crate::net::BoxedStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Turns accepted sockets into protocol streams.
#[derive(Clone)]
pub enum ServerTransport {
    Plain,
    Tls(TlsAcceptor),
}

impl ServerTransport {
    pub async fn from_config(config: &TlsConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(ServerTransport::Plain);
        }

        let cert_path = required(config.cert_path.as_deref(), "tls.cert_path")?;
        let key_path = required(config.key_path.as_deref(), "tls.key_path")?;

        let chain = load_certs(cert_path).await?;
        let key_file = read_pem(key_path).await?;
        let key: PrivateKeyDer<'static> = private_key(&mut key_file.as_slice())?
            .ok_or_else(|| {
                BlobError::Tls(format!("no private key found in {}", key_path.display()))
            })?;

        let server_config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(chain, key)?;

        Ok(ServerTransport::Tls(TlsAcceptor::from(Arc::new(
            server_config,
        ))))
    }

    pub async fn wrap(&self, stream: TcpStream) -> std::io::Result<BoxedStream> {
        match self {
            ServerTransport::Plain => Ok(Box::new(stream)),
            ServerTransport::Tls(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ServerTransport::Tls(_))
    }
}

/// Turns connected sockets into protocol streams.
#[derive(Clone)]
pub enum ClientTransport {
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: Option<String>,
    },
}

impl ClientTransport {
    pub async fn from_config(config: &TlsConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(ClientTransport::Plain);
        }

        let ca_path = required(config.ca_path.as_deref(), "tls.ca_path")?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path).await? {
            roots.add(cert)?;
        }

        let client_config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_root_certificates(roots)
                .with_no_client_auth();

        Ok(ClientTransport::Tls {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        })
    }

    pub async fn wrap(&self, stream: TcpStream, host: &str) -> Result<BoxedStream> {
        match self {
            ClientTransport::Plain => Ok(Box::new(stream)),
            ClientTransport::Tls {
                connector,
                server_name,
            } => {
                let name = server_name.clone().unwrap_or_else(|| host.to_string());
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|_| BlobError::Tls(format!("invalid TLS server name '{}'", name)))?;
                let stream = connector.connect(server_name, stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn required<'a>(path: Option<&'a Path>, field: &str) -> Result<&'a Path> {
    path.ok_or_else(|| BlobError::Config(format!("{} is required when TLS is enabled", field)))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|error| BlobError::Tls(format!("failed to read {}: {}", path.display(), error)))
}

async fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path).await?;
    let chain = certs(&mut pem.as_slice()).collect::<std::result::Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(BlobError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}
