pub mod connection;
pub mod dialer;
pub mod framing;
#[cfg(feature = "dns-over-https")]
pub mod https;
pub mod pool;
pub mod socks5;
pub mod tcp;
#[cfg(feature = "dns-over-rustls")]
pub mod tls;
pub mod udp;

use async_trait::async_trait;
use ferrous_upstream_domain::DomainError;
use hickory_proto::op::Message;

pub use connection::{PendingResponse, PooledConnection};
pub use dialer::{AsyncStream, BoxedStream, Dialer, RawConnection};
pub use pool::{ConnectionLease, ConnectionPool, PoolSettings, PoolStats};
pub use socks5::Socks5Proxy;

#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Sends `query` and returns the response carrying the query's ID.
    async fn exchange(&self, query: &Message) -> Result<Message, DomainError>;

    fn protocol_name(&self) -> &'static str;

    fn stats(&self) -> PoolStats;

    /// Closes open connections and fails later exchanges.
    fn close(&self);
}

pub enum Transport {
    Udp(udp::UdpTransport),
    Tcp(tcp::TcpTransport),
    #[cfg(feature = "dns-over-rustls")]
    Tls(tls::TlsTransport),
    #[cfg(feature = "dns-over-https")]
    Https(https::HttpsTransport),
}

impl Transport {
    pub async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        match self {
            Self::Udp(t) => DnsTransport::exchange(t, query).await,
            Self::Tcp(t) => DnsTransport::exchange(t, query).await,
            #[cfg(feature = "dns-over-rustls")]
            Self::Tls(t) => DnsTransport::exchange(t, query).await,
            #[cfg(feature = "dns-over-https")]
            Self::Https(t) => DnsTransport::exchange(t, query).await,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            Self::Udp(_) => "UDP",
            Self::Tcp(_) => "TCP",
            #[cfg(feature = "dns-over-rustls")]
            Self::Tls(_) => "TLS",
            #[cfg(feature = "dns-over-https")]
            Self::Https(_) => "HTTPS",
        }
    }

    pub fn stats(&self) -> PoolStats {
        match self {
            Self::Udp(t) => t.stats(),
            Self::Tcp(t) => t.stats(),
            #[cfg(feature = "dns-over-rustls")]
            Self::Tls(t) => t.stats(),
            #[cfg(feature = "dns-over-https")]
            Self::Https(t) => t.stats(),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Udp(t) => t.close(),
            Self::Tcp(t) => t.close(),
            #[cfg(feature = "dns-over-rustls")]
            Self::Tls(t) => t.close(),
            #[cfg(feature = "dns-over-https")]
            Self::Https(t) => t.close(),
        }
    }
}
