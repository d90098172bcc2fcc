#![allow(dead_code)]
use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, UpstreamConfig, UpstreamProtocol};
use ferrous_upstream_infrastructure::dns::codec;
use ferrous_upstream_infrastructure::dns::transport::{Dialer, RawConnection};
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::dns_server_mock::TLS_SERVER_NAME;

pub struct ConfigBuilder {
    config: UpstreamConfig,
}

impl ConfigBuilder {
    pub fn new(protocol: UpstreamProtocol, addr: SocketAddr) -> Self {
        let mut config = UpstreamConfig {
            protocol,
            addr: addr.to_string(),
            timeout_ms: 2_000,
            ..Default::default()
        };
        if protocol == UpstreamProtocol::Tls {
            config.server_name = Some(TLS_SERVER_NAME.to_string());
            config.insecure_skip_verify = true;
        }
        Self { config }
    }

    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.config.max_conns = max_conns;
        self
    }

    pub fn idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.config.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.timeout_ms = timeout_ms;
        self
    }

    pub fn max_pipelined(mut self, max_pipelined_queries: usize) -> Self {
        self.config.max_pipelined_queries = max_pipelined_queries;
        self
    }

    pub fn build(self) -> UpstreamConfig {
        self.config
    }
}

pub fn query(name: &str) -> Message {
    codec::build_query(name, RecordType::A).unwrap()
}

pub fn queries(count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| query(&format!("host{}.example.com", i)))
        .collect()
}

/// Wraps a dialer, counting dials and the stream connections still open.
pub struct CountingDialer {
    inner: Arc<dyn Dialer>,
    dials: AtomicUsize,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
}

impl CountingDialer {
    pub fn new(inner: Arc<dyn Dialer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            dials: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self) -> Result<RawConnection, DomainError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.inner.dial().await? {
            RawConnection::Stream(stream) => {
                let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_open.fetch_max(now_open, Ordering::SeqCst);
                Ok(RawConnection::stream(TrackedStream {
                    inner: stream,
                    open: Arc::clone(&self.open),
                }))
            }
            datagram => Ok(datagram),
        }
    }

    fn server(&self) -> &str {
        self.inner.server()
    }
}

struct TrackedStream<S> {
    inner: S,
    open: Arc<AtomicUsize>,
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
