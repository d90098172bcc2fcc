//! UDP Transport for DNS queries (RFC 1035 §4.2.1)
//!
//! Each pooled connection is a connected UDP socket. Several queries share
//! one socket and responses are matched by ID, so a burst of queries does
//! not pay one bind/close per query.

use super::dialer::{resolve, Dialer, RawConnection};
use super::pool::{ConnectionPool, PoolSettings, PoolStats};
use super::DnsTransport;
use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, UpstreamAddr};
use hickory_proto::op::Message;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

const RECV_BUFFER_SIZE: usize = 256 * 1024;
const SEND_BUFFER_SIZE: usize = 128 * 1024;

/// Dials connected UDP sockets with enlarged kernel buffers.
pub struct UdpDialer {
    addr: UpstreamAddr,
    label: String,
}

impl UdpDialer {
    pub fn new(addr: UpstreamAddr) -> Self {
        let label = addr.to_string();
        Self { addr, label }
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self) -> Result<RawConnection, DomainError> {
        let server = resolve(&self.addr).await?;

        let dial_failed = |e: std::io::Error| DomainError::TransportDialFailed {
            server: self.label.clone(),
            reason: e.to_string(),
        };

        let socket = create_socket(server).map_err(dial_failed)?;
        socket.connect(server).await.map_err(dial_failed)?;

        Ok(RawConnection::Datagram(socket))
    }

    fn server(&self) -> &str {
        &self.label
    }
}

fn create_socket(server: SocketAddr) -> Result<UdpSocket, std::io::Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    let (domain, bind_addr) = if server.is_ipv4() {
        (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    } else {
        (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Kernels may clamp or refuse larger buffers; the defaults still work.
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        debug!(error = %e, "Could not enlarge UDP receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        debug!(error = %e, "Could not enlarge UDP send buffer");
    }

    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// DNS-over-UDP transport backed by a pool of connected sockets.
pub struct UdpTransport {
    pool: ConnectionPool,
}

impl UdpTransport {
    pub fn new(addr: UpstreamAddr, settings: PoolSettings) -> Self {
        Self::with_dialer(Arc::new(UdpDialer::new(addr)), settings)
    }

    pub fn with_dialer(dialer: Arc<dyn Dialer>, settings: PoolSettings) -> Self {
        Self {
            pool: ConnectionPool::new("UDP", dialer, settings),
        }
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        self.pool.exchange(query).await
    }

    fn protocol_name(&self) -> &'static str {
        "UDP"
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn close(&self) {
        self.pool.close();
    }
}
