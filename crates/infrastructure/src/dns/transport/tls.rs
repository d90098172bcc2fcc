//! TLS Transport for DNS queries: DNS-over-TLS (RFC 7858)
//!
//! Same pooling and pipelining as TCP; each pooled connection carries its
//! own TLS session. The verifying `ClientConfig` is built once and shared.

use super::dialer::{Dialer, RawConnection};
use super::pool::{ConnectionPool, PoolSettings, PoolStats};
use super::socks5::Socks5Proxy;
use super::tcp::connect_tcp;
use super::DnsTransport;
use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, UpstreamAddr};
use hickory_proto::op::Message;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use std::sync::{Arc, LazyLock};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Shared TLS config validated against the webpki roots.
static SHARED_TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    install_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
});

/// Both ring and aws-lc-rs are linked, so rustls cannot pick one on its own.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    if !insecure_skip_verify {
        return Arc::clone(&SHARED_TLS_CONFIG);
    }

    install_crypto_provider();
    warn!("TLS certificate verification disabled for upstream");
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
        .with_no_client_auth();
    Arc::new(config)
}

/// Accepts any certificate. Only reachable through `insecure_skip_verify`.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// TCP connect (optionally via SOCKS5) followed by a TLS handshake.
pub struct TlsDialer {
    addr: UpstreamAddr,
    server_name: ServerName<'static>,
    hostname: String,
    connector: TlsConnector,
    proxy: Option<Socks5Proxy>,
    label: String,
}

impl TlsDialer {
    pub fn new(
        addr: UpstreamAddr,
        hostname: String,
        insecure_skip_verify: bool,
        proxy: Option<Socks5Proxy>,
    ) -> Result<Self, DomainError> {
        let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
            DomainError::TlsConfig(format!("Invalid TLS hostname '{}': {}", hostname, e))
        })?;
        let connector = TlsConnector::from(client_config(insecure_skip_verify));
        let label = addr.to_string();

        Ok(Self {
            addr,
            server_name,
            hostname,
            connector,
            proxy,
            label,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self) -> Result<RawConnection, DomainError> {
        let tcp_stream = connect_tcp(&self.addr, self.proxy.as_ref()).await?;

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .map_err(|e| DomainError::TransportDialFailed {
                server: self.label.clone(),
                reason: format!("TLS handshake failed: {}", e),
            })?;

        debug!(server = %self.label, hostname = %self.hostname, "TLS connection established");
        Ok(RawConnection::stream(tls_stream))
    }

    fn server(&self) -> &str {
        &self.label
    }
}

/// DNS-over-TLS transport (RFC 7858)
pub struct TlsTransport {
    pool: ConnectionPool,
}

impl TlsTransport {
    pub fn new(dialer: TlsDialer, settings: PoolSettings) -> Self {
        Self::with_dialer(Arc::new(dialer), settings)
    }

    pub fn with_dialer(dialer: Arc<dyn Dialer>, settings: PoolSettings) -> Self {
        Self {
            pool: ConnectionPool::new("TLS", dialer, settings),
        }
    }
}

#[async_trait]
impl DnsTransport for TlsTransport {
    async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        self.pool.exchange(query).await
    }

    fn protocol_name(&self) -> &'static str {
        "TLS"
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn close(&self) {
        self.pool.close();
    }
}
