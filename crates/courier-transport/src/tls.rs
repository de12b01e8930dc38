//! TLS support for collector connections.
//!
//! The client context is built once from [`TransportConfig`] and shared by every
//! worker. Any problem loading certificate material is a fatal misconfiguration
//! and reported as [`TransportError::Config`]; only handshake failures are
//! [`TransportError::TlsError`]. The acceptor side exists for collectors and
//! test peers speaking the same protocol.

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use tokio_rustls::TlsAcceptor as TlsAcceptorInner;
pub use tokio_rustls::TlsConnector as TlsConnectorInner;

/// Client-side TLS connector holding the shared security context.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TlsConnectorInner,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Builds the client context from the configured certificate files.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let ca_pem = match config.ssl_ca.as_deref() {
            Some(ca_path) => {
                tracing::info!(path = %ca_path.display(), "setting trusted CA");
                Some(read_pem_file(ca_path, "CA certificate")?)
            }
            None => {
                tracing::info!("no ssl_ca configured, trusting the bundled web PKI roots");
                None
            }
        };

        let client_auth = match (&config.ssl_certificate, &config.ssl_key) {
            (Some(cert), Some(key)) => {
                tracing::info!(
                    certificate = %cert.display(),
                    key = %key.display(),
                    "loading client certificate"
                );
                Some((
                    read_pem_file(cert, "client certificate")?,
                    read_pem_file(key, "client key")?,
                ))
            }
            (None, None) => None,
            _ => {
                return Err(TransportError::Config {
                    reason: "ssl_certificate and ssl_key must be set together".to_string(),
                })
            }
        };

        Self::from_pem(
            ca_pem.as_deref(),
            client_auth
                .as_ref()
                .map(|(cert, key)| (cert.as_slice(), key.as_slice())),
        )
    }

    /// Builds the client context from in-memory PEM data.
    ///
    /// `ca_pem`, when given, must start with a single `CERTIFICATE` block and becomes
    /// the only trust anchor; without it the bundled web PKI roots are trusted.
    /// `client_auth` is an optional (certificate chain, private key) pair.
    pub fn from_pem(ca_pem: Option<&[u8]>, client_auth: Option<(&[u8], &[u8])>) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        match ca_pem {
            Some(ca_pem) => root_store
                .add(load_ca_certificate(ca_pem)?)
                .map_err(|e| TransportError::Config {
                    reason: format!("failed to parse CA certificate: {}", e),
                })?,
            None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
        let client_config = match client_auth {
            Some((cert_pem, key_pem)) => {
                let certs = load_certs_from_pem(cert_pem)?;
                let key = load_private_key_from_pem(key_pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TransportError::Config {
                        reason: format!("failed loading client certificate: {}", e),
                    })?
            }
            None => builder.with_no_client_auth(),
        };

        let inner = TlsConnectorInner::from(Arc::new(client_config));
        Ok(Self { inner })
    }

    /// Runs the client handshake over an established stream.
    pub async fn connect<IO>(&self, addr: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let domain = server_name(addr)?;
        let stream = self
            .inner
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS handshake with {} failed: {}", addr, e),
            })?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side TLS acceptor.
pub struct TlsAcceptor {
    inner: TlsAcceptorInner,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor presenting `cert_chain_pem`. When `client_ca_pem` is
    /// given, clients must present a certificate signed by it.
    pub fn new(
        cert_chain_pem: &[u8],
        private_key_pem: &[u8],
        client_ca_pem: Option<&[u8]>,
    ) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(cert_chain_pem)?;
        let key = load_private_key_from_pem(private_key_pem)?;

        let builder = rustls::ServerConfig::builder();
        let builder = match client_ca_pem {
            Some(ca_pem) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in load_certs_from_pem(ca_pem)? {
                    roots.add(cert).map_err(|e| TransportError::Config {
                        reason: format!("failed to add client CA cert: {}", e),
                    })?;
                }
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| TransportError::Config {
                        reason: format!("failed to build client verifier: {}", e),
                    })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let server_config =
            builder
                .with_single_cert(certs, key)
                .map_err(|e| TransportError::Config {
                    reason: format!("failed to set server cert: {}", e),
                })?;

        let inner = TlsAcceptorInner::from(Arc::new(server_config));
        Ok(Self { inner })
    }

    /// Accepts a TLS connection over an existing stream.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS accept failed: {}", e),
            })?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream that can be either client or server side.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> tokio::io::AsyncRead for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> tokio::io::AsyncWrite for TlsStream<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::result::Result<usize, std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            TlsStream::Client(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| TransportError::Config {
        reason: format!("failure reading {} {}: {}", what, path.display(), e),
    })
}

/// Derives the TLS server name from a `host:port` address.
fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| TransportError::TlsError {
        reason: format!("invalid server name {}: {}", host, e),
    })
}

/// Decodes the first PEM block of a CA file, which must be a certificate.
pub fn load_ca_certificate(pem: &[u8]) -> Result<CertificateDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::read_one(&mut cursor) {
        Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) => Ok(cert),
        Ok(Some(_)) => Err(TransportError::Config {
            reason: "CA file is not a certificate".to_string(),
        }),
        Ok(None) => Err(TransportError::Config {
            reason: "failed to decode PEM data in CA file".to_string(),
        }),
        Err(e) => Err(TransportError::Config {
            reason: format!("malformed PEM in CA file: {:?}", e),
        }),
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(rustls_pemfile::Item::X509Certificate(cert))) =
        rustls_pemfile::read_one(&mut cursor)
    {
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(TransportError::Config {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        _ => Err(TransportError::Config {
            reason: "no private key found in PEM".to_string(),
        }),
    }
}

/// Generates a self-signed CA certificate and key pair using rcgen.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::TlsError {
            reason: format!("failed to create CA certificate: {}", e),
        })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a certificate for `name` signed by the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    name: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_pem = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_err("failed to parse CA key", &e))?;

    let ca_cert_pem =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate key", &e))?;
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .map_err(|e| tls_err("failed to create certificate params", &e))?
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign certificate", &e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}
