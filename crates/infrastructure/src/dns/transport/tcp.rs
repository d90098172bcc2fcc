use super::dialer::{resolve, Dialer, RawConnection};
use super::pool::{ConnectionPool, PoolSettings, PoolStats};
use super::socks5::Socks5Proxy;
use super::DnsTransport;
use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, UpstreamAddr};
use hickory_proto::op::Message;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Opens a TCP connection to `addr`, directly or through a SOCKS5 proxy.
pub(crate) async fn connect_tcp(
    addr: &UpstreamAddr,
    proxy: Option<&Socks5Proxy>,
) -> Result<TcpStream, DomainError> {
    let stream = match proxy {
        Some(proxy) => proxy.connect(addr).await?,
        None => {
            let server = resolve(addr).await?;
            TcpStream::connect(server)
                .await
                .map_err(|e| DomainError::TransportDialFailed {
                    server: addr.to_string(),
                    reason: e.to_string(),
                })?
        }
    };

    stream
        .set_nodelay(true)
        .map_err(|e| DomainError::TransportDialFailed {
            server: addr.to_string(),
            reason: format!("set_nodelay: {}", e),
        })?;

    Ok(stream)
}

pub struct TcpDialer {
    addr: UpstreamAddr,
    proxy: Option<Socks5Proxy>,
    label: String,
}

impl TcpDialer {
    pub fn new(addr: UpstreamAddr, proxy: Option<Socks5Proxy>) -> Self {
        let label = addr.to_string();
        Self { addr, proxy, label }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<RawConnection, DomainError> {
        let stream = connect_tcp(&self.addr, self.proxy.as_ref()).await?;
        Ok(RawConnection::stream(stream))
    }

    fn server(&self) -> &str {
        &self.label
    }
}

/// DNS-over-TCP transport (RFC 7766) with pipelined, reused connections.
pub struct TcpTransport {
    pool: ConnectionPool,
}

impl TcpTransport {
    pub fn new(addr: UpstreamAddr, proxy: Option<Socks5Proxy>, settings: PoolSettings) -> Self {
        Self::with_dialer(Arc::new(TcpDialer::new(addr, proxy)), settings)
    }

    pub fn with_dialer(dialer: Arc<dyn Dialer>, settings: PoolSettings) -> Self {
        Self {
            pool: ConnectionPool::new("TCP", dialer, settings),
        }
    }
}

#[async_trait]
impl DnsTransport for TcpTransport {
    async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        self.pool.exchange(query).await
    }

    fn protocol_name(&self) -> &'static str {
        "TCP"
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn close(&self) {
        self.pool.close();
    }
}
