//! Upstream facade
//!
//! `FastUpstream` owns the transport for one configured resolver plus, for
//! UDP, a TCP transport used when a response comes back truncated.

use super::transport::socks5::Socks5Proxy;
use super::transport::tcp::TcpTransport;
use super::transport::udp::UdpTransport;
use super::transport::{Dialer, PoolSettings, PoolStats, Transport};
use ferrous_upstream_domain::{DomainError, UpstreamConfig, UpstreamProtocol};
use hickory_proto::op::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pool counters for the main transport and the truncation fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    pub primary: PoolStats,
    pub fallback: Option<PoolStats>,
}

pub struct FastUpstreamBuilder {
    config: UpstreamConfig,
    udp_dialer: Option<Arc<dyn Dialer>>,
    stream_dialer: Option<Arc<dyn Dialer>>,
}

impl FastUpstreamBuilder {
    /// Replaces the dialer of the UDP transport.
    pub fn with_udp_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.udp_dialer = Some(dialer);
        self
    }

    /// Replaces the dialer of the TCP or TLS transport, including the
    /// truncation fallback. A TLS replacement must return the established
    /// TLS stream.
    pub fn with_stream_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.stream_dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Result<FastUpstream, DomainError> {
        let config = self.config;
        config.validate()?;

        let settings = PoolSettings::from_config(&config);
        let proxy = config
            .socks5
            .as_ref()
            .map(Socks5Proxy::from_config)
            .transpose()?;

        if proxy.is_some() && config.protocol == UpstreamProtocol::Udp {
            warn!(
                addr = %config.addr,
                "SOCKS5 cannot carry UDP queries; UDP goes direct, truncation fallback uses the proxy"
            );
        }

        let stream_transport = |proxy: Option<Socks5Proxy>| -> Result<TcpTransport, DomainError> {
            Ok(match &self.stream_dialer {
                Some(dialer) => TcpTransport::with_dialer(Arc::clone(dialer), settings),
                None => TcpTransport::new(config.upstream_addr()?, proxy, settings),
            })
        };

        let (primary, fallback) = match config.protocol {
            UpstreamProtocol::Udp => {
                let udp = match &self.udp_dialer {
                    Some(dialer) => UdpTransport::with_dialer(Arc::clone(dialer), settings),
                    None => UdpTransport::new(config.upstream_addr()?, settings),
                };
                let tcp = stream_transport(proxy)?;
                (Transport::Udp(udp), Some(Transport::Tcp(tcp)))
            }
            UpstreamProtocol::Tcp => (Transport::Tcp(stream_transport(proxy)?), None),
            UpstreamProtocol::Tls => {
                let tls = Self::tls_transport(&config, self.stream_dialer.clone(), proxy, settings)?;
                (tls, None)
            }
            UpstreamProtocol::Https => (Self::https_transport(&config)?, None),
        };

        info!(
            upstream = %config.addr,
            protocol = primary.protocol_name(),
            max_conns = config.max_conns,
            idle_timeout_ms = config.idle_timeout_ms,
            "Upstream created"
        );

        Ok(FastUpstream {
            config,
            primary,
            fallback,
        })
    }

    #[cfg(feature = "dns-over-rustls")]
    fn tls_transport(
        config: &UpstreamConfig,
        stream_dialer: Option<Arc<dyn Dialer>>,
        proxy: Option<Socks5Proxy>,
        settings: PoolSettings,
    ) -> Result<Transport, DomainError> {
        use super::transport::tls::{TlsDialer, TlsTransport};

        let transport = match stream_dialer {
            Some(dialer) => TlsTransport::with_dialer(dialer, settings),
            None => {
                let hostname = config.tls_server_name().ok_or_else(|| {
                    DomainError::TlsConfig("TLS upstream requires a server name".into())
                })?;
                let dialer = TlsDialer::new(
                    config.upstream_addr()?,
                    hostname,
                    config.insecure_skip_verify,
                    proxy,
                )?;
                TlsTransport::new(dialer, settings)
            }
        };
        Ok(Transport::Tls(transport))
    }

    #[cfg(not(feature = "dns-over-rustls"))]
    fn tls_transport(
        config: &UpstreamConfig,
        _stream_dialer: Option<Arc<dyn Dialer>>,
        _proxy: Option<Socks5Proxy>,
        _settings: PoolSettings,
    ) -> Result<Transport, DomainError> {
        Err(DomainError::ConfigError(format!(
            "TLS feature not enabled. Enable 'dns-over-rustls' feature to use: {}",
            config.addr
        )))
    }

    #[cfg(feature = "dns-over-https")]
    fn https_transport(config: &UpstreamConfig) -> Result<Transport, DomainError> {
        let transport = super::transport::https::HttpsTransport::new(config)?;
        Ok(Transport::Https(transport))
    }

    #[cfg(not(feature = "dns-over-https"))]
    fn https_transport(config: &UpstreamConfig) -> Result<Transport, DomainError> {
        Err(DomainError::ConfigError(format!(
            "HTTPS feature not enabled. Enable 'dns-over-https' feature to use: {}",
            config.url.as_deref().unwrap_or_default()
        )))
    }
}

/// Client for one upstream DNS resolver.
///
/// Safe to share between tasks; concurrent exchanges are pipelined over
/// pooled connections. Responses always carry the ID of the query they
/// answer.
pub struct FastUpstream {
    config: UpstreamConfig,
    primary: Transport,
    fallback: Option<Transport>,
}

impl FastUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, DomainError> {
        Self::builder(config).build()
    }

    pub fn builder(config: UpstreamConfig) -> FastUpstreamBuilder {
        FastUpstreamBuilder {
            config,
            udp_dialer: None,
            stream_dialer: None,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn protocol(&self) -> UpstreamProtocol {
        self.config.protocol
    }

    /// Exchanges `query` over the configured transport and returns the answer
    /// unchanged, TC bit included.
    pub async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        self.primary.exchange(query).await
    }

    /// Exchanges `query`, repeating it over TCP when a UDP answer has TC set.
    /// Stream transports answer in full already.
    pub async fn exchange_no_truncated(&self, query: &Message) -> Result<Message, DomainError> {
        let response = self.primary.exchange(query).await?;

        match &self.fallback {
            Some(fallback) if response.truncated() => {
                debug!(
                    server = %self.config.addr,
                    id = query.id(),
                    "Response truncated (TC bit), retrying via {}",
                    fallback.protocol_name()
                );
                fallback.exchange(query).await
            }
            _ => Ok(response),
        }
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            primary: self.primary.stats(),
            fallback: self.fallback.as_ref().map(Transport::stats),
        }
    }

    /// Closes every connection. Later exchanges fail with a closed-connection error.
    pub fn close(&self) {
        info!(upstream = %self.config.addr, "Closing upstream");
        self.primary.close();
        if let Some(fallback) = &self.fallback {
            fallback.close();
        }
    }
}
