#![allow(dead_code)]
use ferrous_upstream_infrastructure::dns::codec;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub const ANSWER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
pub const UDP_PAYLOAD_LIMIT: usize = 512;
pub const TLS_SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone, Copy, Default)]
pub struct MockOptions {
    /// Delay before every answer. Answers to pipelined queries are sent
    /// independently, so they may leave in any order.
    pub latency: Duration,
    /// Random extra delay of up to this much per answer.
    pub jitter: Duration,
    /// Pad every answer with TXT records past the UDP payload limit.
    pub big_answers: bool,
}

#[derive(Debug, Default)]
pub struct MockCounters {
    pub udp_queries: AtomicUsize,
    pub tcp_queries: AtomicUsize,
    pub tcp_connections: AtomicUsize,
    pub tls_connections: AtomicUsize,
}

/// Local resolver answering A queries with [`ANSWER_IP`] over UDP, TCP and
/// optionally TLS.
///
/// UDP answers larger than 512 bytes are replaced by an empty answer with
/// TC set, like a real server without EDNS(0).
pub struct MockDnsServer {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    tls_addr: Option<SocketAddr>,
    counters: Arc<MockCounters>,
    shutdown: CancellationToken,
}

impl MockDnsServer {
    pub async fn start(options: MockOptions) -> Result<Self, std::io::Error> {
        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        let udp_addr = udp.local_addr()?;
        // Same port for TCP, so one address serves both transports.
        let tcp = TcpListener::bind(udp_addr).await?;
        let tcp_addr = tcp.local_addr()?;

        let counters = Arc::new(MockCounters::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(serve_udp(udp, options, Arc::clone(&counters), shutdown.clone()));
        tokio::spawn(serve_tcp(tcp, options, Arc::clone(&counters), shutdown.clone(), None));

        Ok(Self {
            udp_addr,
            tcp_addr,
            tls_addr: None,
            counters,
            shutdown,
        })
    }

    /// Like [`start`](Self::start) with an additional DoT listener using a
    /// self-signed certificate for [`TLS_SERVER_NAME`].
    pub async fn start_with_tls(options: MockOptions) -> Result<Self, std::io::Error> {
        let mut server = Self::start(options).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        server.tls_addr = Some(listener.local_addr()?);
        tokio::spawn(serve_tcp(
            listener,
            options,
            Arc::clone(&server.counters),
            server.shutdown.clone(),
            Some(self_signed_acceptor()),
        ));

        Ok(server)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }

    pub fn counters(&self) -> &MockCounters {
        &self.counters
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn self_signed_acceptor() -> TlsAcceptor {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certified = rcgen::generate_simple_self_signed(vec![TLS_SERVER_NAME.to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();

    TlsAcceptor::from(Arc::new(config))
}

/// Builds the answer for `query`, or `None` when it cannot be parsed.
pub fn build_answer(query: &[u8], big_answers: bool) -> Option<Message> {
    let request = codec::decode(query).ok()?;

    let mut response = Message::new(request.id(), MessageType::Response, OpCode::Query);
    for question in request.queries() {
        response.add_query(question.clone());
    }

    if let Some(question) = request.queries().first() {
        let name = question.name().clone();
        if question.query_type() == RecordType::A {
            response.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(ANSWER_IP))));
        }
        if big_answers {
            for i in 0..8 {
                let padding = format!("{}-{}", i, "x".repeat(120));
                response.add_answer(Record::from_rdata(
                    name.clone(),
                    60,
                    RData::TXT(TXT::new(vec![padding])),
                ));
            }
        }
    }

    Some(response)
}

fn truncated_answer(answer: &Message) -> Message {
    let mut truncated = Message::new(answer.id(), MessageType::Response, OpCode::Query);
    truncated.set_truncated(true);
    for question in answer.queries() {
        truncated.add_query(question.clone());
    }
    truncated
}

async fn answer_delay(options: MockOptions) {
    let jitter_ms = options.jitter.as_millis() as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(fastrand::u64(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    let delay = options.latency + jitter;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

async fn serve_udp(
    socket: UdpSocket,
    options: MockOptions,
    counters: Arc<MockCounters>,
    shutdown: CancellationToken,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(_) => continue,
            },
        };
        counters.udp_queries.fetch_add(1, Ordering::SeqCst);

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            answer_delay(options).await;
            let Some(answer) = build_answer(&query, options.big_answers) else {
                return;
            };
            let mut bytes = codec::encode(&answer).unwrap();
            if bytes.len() > UDP_PAYLOAD_LIMIT {
                bytes = codec::encode(&truncated_answer(&answer)).unwrap();
            }
            let _ = socket.send_to(&bytes, peer).await;
        });
    }
}

async fn serve_tcp(
    listener: TcpListener,
    options: MockOptions,
    counters: Arc<MockCounters>,
    shutdown: CancellationToken,
    tls: Option<TlsAcceptor>,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, _)) => stream,
                Err(_) => continue,
            },
        };

        let counters = Arc::clone(&counters);
        let shutdown = shutdown.clone();
        match &tls {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                        counters.tls_connections.fetch_add(1, Ordering::SeqCst);
                        serve_stream(tls_stream, options, counters, shutdown).await;
                    }
                });
            }
            None => {
                counters.tcp_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_stream(stream, options, counters, shutdown));
            }
        }
    }
}

/// Answers every length-prefixed query on `stream` concurrently.
async fn serve_stream<S>(
    stream: S,
    options: MockOptions,
    counters: Arc<MockCounters>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_exact(&mut len_buf) => read,
        };
        if read.is_err() {
            break;
        }
        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        if reader.read_exact(&mut query).await.is_err() {
            break;
        }
        counters.tcp_queries.fetch_add(1, Ordering::SeqCst);

        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            answer_delay(options).await;
            let Some(answer) = build_answer(&query, options.big_answers) else {
                return;
            };
            let bytes = codec::encode(&answer).unwrap();
            let mut frame = (bytes.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(&bytes);
            let mut writer = writer.lock().await;
            let _ = writer.write_all(&frame).await;
        });
    }

    let _ = writer.lock().await.shutdown().await;
}
