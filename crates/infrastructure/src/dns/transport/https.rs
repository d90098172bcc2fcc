//! HTTPS Transport for DNS queries: DNS-over-HTTPS (RFC 8484)
//!
//! Sends DNS queries as HTTP POST requests with `application/dns-message` content type.
//! The request body is the raw DNS wire format message, and the response body
//! contains the raw DNS wire format response.
//!
//! Connection pooling and HTTP/2 multiplexing are left to `reqwest`; this
//! transport bounds the number of concurrent requests to `max_conns`.
//!
//! Wire format (HTTP):
//! ```text
//! POST /dns-query HTTP/2
//! Content-Type: application/dns-message
//! Accept: application/dns-message
//!
//! <raw DNS message bytes, ID 0>
//! ```

use super::pool::PoolStats;
use super::DnsTransport;
use crate::dns::codec;
use async_trait::async_trait;
use ferrous_upstream_domain::{DomainError, Socks5Config, UpstreamConfig};
use hickory_proto::op::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

/// Expected content type for DNS-over-HTTPS messages (RFC 8484 §4.2.1)
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// DNS-over-HTTPS transport (RFC 8484)
pub struct HttpsTransport {
    url: String,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    max_conns: usize,
    timeout: Duration,
}

impl HttpsTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self, DomainError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| DomainError::InvalidEndpoint("HTTPS upstream requires a url".into()))?;

        let max_idle = if config.reuse_enabled() {
            config.max_conns
        } else {
            0
        };

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .pool_max_idle_per_host(max_idle)
            .danger_accept_invalid_certs(config.insecure_skip_verify);

        if config.reuse_enabled() {
            builder = builder.pool_idle_timeout(config.idle_timeout());
        }

        if let Some(socks5) = &config.socks5 {
            builder = builder.proxy(socks5_proxy(socks5)?);
        }

        let client = builder
            .build()
            .map_err(|e| DomainError::TlsConfig(format!("Failed to build DoH client: {}", e)))?;

        Ok(Self {
            url,
            client,
            permits: Arc::new(Semaphore::new(config.max_conns.max(1))),
            max_conns: config.max_conns.max(1),
            timeout: config.timeout(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn timeout_error(&self) -> DomainError {
        DomainError::TransportTimeout {
            server: self.url.clone(),
        }
    }

    fn request_error(&self, e: reqwest::Error) -> DomainError {
        if e.is_timeout() {
            self.timeout_error()
        } else if e.is_connect() {
            DomainError::TransportDialFailed {
                server: self.url.clone(),
                reason: e.to_string(),
            }
        } else {
            DomainError::TransportReadFailed {
                server: self.url.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl DnsTransport for HttpsTransport {
    async fn exchange(&self, query: &Message) -> Result<Message, DomainError> {
        let deadline = Instant::now() + self.timeout;

        let _permit = tokio::time::timeout_at(deadline, self.permits.acquire())
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|_| DomainError::TransportConnectionClosed {
                server: self.url.clone(),
            })?;

        // RFC 8484 §4.1: use ID 0 for cache friendliness.
        let body = codec::encode_with_id(query, 0)?;

        debug!(
            url = %self.url,
            message_len = body.len(),
            "Sending DoH query"
        );

        let response = tokio::time::timeout_at(
            deadline,
            self.client
                .post(&self.url)
                .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
                .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
                .body(body)
                .send(),
        )
        .await
        .map_err(|_| self.timeout_error())?
        .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let response_bytes = tokio::time::timeout_at(deadline, response.bytes())
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|e| self.request_error(e))?;

        debug!(
            url = %self.url,
            response_len = response_bytes.len(),
            "DoH response received"
        );

        let mut message = codec::decode(&response_bytes)?;
        if message.id() != 0 {
            return Err(DomainError::IdMismatch {
                expected: 0,
                received: message.id(),
            });
        }
        codec::set_id(&mut message, query.id());

        Ok(message)
    }

    fn protocol_name(&self) -> &'static str {
        "HTTPS"
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            pending: self.max_conns - self.permits.available_permits(),
            ..PoolStats::default()
        }
    }

    fn close(&self) {
        self.permits.close();
    }
}

/// Credentials are passed outside the URL so reserved characters in them
/// need no escaping.
fn socks5_proxy(socks5: &Socks5Config) -> Result<reqwest::Proxy, DomainError> {
    let proxy = reqwest::Proxy::all(format!("socks5h://{}", socks5.addr))
        .map_err(|e| DomainError::ConfigError(format!("socks5 proxy: {}", e)))?;

    Ok(match (&socks5.username, &socks5.password) {
        (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
        _ => proxy,
    })
}
