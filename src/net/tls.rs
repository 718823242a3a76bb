//! TLS provider abstraction and certificate loading.
//!
//! The harness never implements handshakes itself; it delegates to rustls
//! through this provider, which exposes server- and client-side stream
//! creation over any transport.

use std::io::{self, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config::schema::TlsConfig;
use crate::error::{HarnessError, Result};

/// TLS facts about an established server-side stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsInfo {
    /// The handshake completed and the stream is encrypted.
    pub authenticated: bool,
    /// The client presented a certificate as well.
    pub mutually_authenticated: bool,
}

/// Server/client stream factory backed by rustls.
#[derive(Clone)]
pub struct TlsProvider {
    acceptor: TlsAcceptor,
}

impl TlsProvider {
    /// Build a provider from PEM files on disk.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let cert_pem = std::fs::read(Path::new(&config.cert_path))?;
        let key_pem = std::fs::read(Path::new(&config.key_path))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build a provider from in-memory PEM data.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        install_crypto_provider();

        let certs = read_certs(cert_pem)?;
        let key = read_private_key(key_pem)?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HarnessError::Tls(format!("server config: {}", e)))?;

        Ok(TlsProvider {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the server-side handshake over an accepted transport.
    pub async fn create_server_stream<S>(
        &self,
        stream: S,
    ) -> Result<(server::TlsStream<S>, TlsInfo)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| HarnessError::Tls(format!("handshake failed: {}", e)))?;

        let mutually_authenticated = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| !certs.is_empty())
            .unwrap_or(false);

        Ok((
            tls,
            TlsInfo {
                authenticated: true,
                mutually_authenticated,
            },
        ))
    }

    /// Build a client connector that trusts the given CA certificate; used
    /// by the harness's own client side in TLS scenarios.
    pub fn client_connector(ca_pem: &[u8]) -> Result<TlsConnector> {
        install_crypto_provider();

        let mut roots = RootCertStore::empty();
        for cert in read_certs(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| HarnessError::Tls(format!("bad CA certificate: {}", e)))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Run the client-side handshake against `server_name`.
    pub async fn create_client_stream<S>(
        connector: &TlsConnector,
        stream: S,
        server_name: &str,
    ) -> Result<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| HarnessError::Tls(format!("invalid server name '{}'", server_name)))?;
        connector
            .connect(name, stream)
            .await
            .map_err(|e| HarnessError::Tls(format!("client handshake failed: {}", e)))
    }
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| HarnessError::Tls(format!("bad certificate pem: {}", e)))?;
    if certs.is_empty() {
        return Err(HarnessError::Tls("no certificates in pem".into()));
    }
    Ok(certs)
}

fn read_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| HarnessError::Tls(format!("bad key pem: {}", e)))?
        .ok_or_else(|| HarnessError::Tls("no private key in pem".into()))
}

fn install_crypto_provider() {
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
}
