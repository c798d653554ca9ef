//! Connections and TLS helpers
//!
//! Provides the transport abstraction both endpoints sit on, the
//! client/server TLS machinery, and the [`Upstream`] dialer seam the
//! pool uses to open upstream connections (and tests use to swap in an
//! in-process server).

use crate::config::AddrSpec;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Anything an endpoint can sit on: TCP, TLS, or an in-memory duplex
/// in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// How a connection is (or will be) secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Cleartext, no upgrade expected.
    Plain,
    /// Cleartext until a STARTTLS handshake.
    StartTls,
    /// Implicit TLS from the first byte.
    Tls,
}

/// A single transport with its security mode. Owned by whichever stage
/// currently holds the session.
pub struct Connection {
    pub stream: BoxTransport,
    pub security: Security,
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("security", &self.security)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(stream: impl Transport + 'static, security: Security, peer: Option<SocketAddr>) -> Self {
        Self {
            stream: Box::new(stream),
            security,
            peer,
        }
    }

    /// Server-side STARTTLS: wrap the current stream in an accepted TLS
    /// session.
    pub async fn accept_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        let tls = acceptor
            .accept(plain)
            .await
            .map_err(|e| Error::Tls(format!("TLS accept failed: {e}")))?;
        self.stream = Box::new(tls);
        self.security = Security::Tls;
        Ok(())
    }

    /// Client-side STARTTLS: wrap the current stream in a connected TLS
    /// session against `host`.
    pub async fn connect_tls(&mut self, connector: &TlsConnector, host: &str) -> Result<()> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        let tls = connector
            .connect(server_name, plain)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        self.stream = Box::new(tls);
        self.security = Security::Tls;
        Ok(())
    }
}

/// Build a TLS acceptor from PEM key and certificate files.
pub fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert).map_err(|e| Error::Config(format!("cert {cert:?}: {e}")))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()
    .map_err(|e| Error::Config(format!("cert {cert:?}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key).map_err(|e| Error::Config(format!("key {key:?}: {e}")))?,
    ))
    .map_err(|e| Error::Config(format!("key {key:?}: {e}")))?
    .ok_or_else(|| Error::Config("no private key found".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector for the upstream side.
///
/// With `trust_all`, certificate verification is skipped entirely --
/// the upstream is often a host on localhost or a private network with
/// a self-signed certificate.
#[must_use]
pub fn tls_connector(trust_all: bool) -> TlsConnector {
    let config = if trust_all {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

pub type DialFuture = BoxFuture<'static, Result<Connection>>;

/// Dialer for upstream connections. The pool holds one and asks it for
/// a fresh [`Connection`] per accepted downstream.
pub trait Upstream: Send + Sync {
    fn dial(&self) -> DialFuture;
}

/// TCP (plus optional implicit TLS) dialer for a remote address spec.
pub struct TcpUpstream {
    remote: AddrSpec,
    connector: TlsConnector,
}

impl TcpUpstream {
    #[must_use]
    pub const fn new(remote: AddrSpec, connector: TlsConnector) -> Self {
        Self { remote, connector }
    }
}

impl Upstream for TcpUpstream {
    fn dial(&self) -> DialFuture {
        let remote = self.remote.clone();
        let connector = self.connector.clone();
        Box::pin(async move {
            let addr = format!("{}:{}", remote.host, remote.port);
            debug!("dialing upstream at {}", addr);
            let tcp = TcpStream::connect(&addr).await?;
            let peer = tcp.peer_addr().ok();
            let mut conn = Connection::new(tcp, remote.security, peer);
            if remote.security == Security::Tls {
                conn.connect_tls(&connector, &remote.host).await?;
            }
            Ok(conn)
        })
    }
}

/// Certificate verifier that accepts all certificates
/// (for self-signed upstream servers).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
