use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, UpstreamAddr};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

/// Any full-duplex byte stream a pooled connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// One freshly opened connection, before pooling bookkeeping is attached.
pub enum RawConnection {
    /// Connected UDP socket: one datagram carries one message.
    Datagram(UdpSocket),
    /// TCP, TLS or proxied stream: messages carry a 2-byte length prefix.
    Stream(BoxedStream),
}

impl RawConnection {
    pub fn stream<S>(stream: S) -> Self
    where
        S: AsyncStream + 'static,
    {
        RawConnection::Stream(Box::new(stream))
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, RawConnection::Datagram(_))
    }
}

/// Opens new connections to one upstream. Replaceable so callers can
/// instrument or redirect dialing.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<RawConnection, DomainError>;

    /// Label used in logs and errors.
    fn server(&self) -> &str;
}

/// Resolve an upstream address, using the system resolver for hostnames.
pub(crate) async fn resolve(addr: &UpstreamAddr) -> Result<SocketAddr, DomainError> {
    match addr {
        UpstreamAddr::Resolved(socket_addr) => Ok(*socket_addr),
        UpstreamAddr::Unresolved { hostname, port } => {
            let mut addrs = tokio::net::lookup_host((hostname.as_ref(), *port))
                .await
                .map_err(|e| DomainError::TransportDialFailed {
                    server: addr.to_string(),
                    reason: format!("failed to resolve {}: {}", hostname, e),
                })?;
            addrs.next().ok_or_else(|| DomainError::TransportDialFailed {
                server: addr.to_string(),
                reason: format!("{} resolved to no addresses", hostname),
            })
        }
    }
}
