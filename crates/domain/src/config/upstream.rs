use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::ConfigError;
use crate::dns_protocol::{UpstreamAddr, UpstreamEndpoint, UpstreamProtocol};

/// Settings for one upstream resolver. Immutable once handed to the transport layer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// `host:port` of the resolver. For HTTPS the URL host is used instead.
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default)]
    pub protocol: UpstreamProtocol,

    /// TLS SNI and certificate name. Defaults to the host part of `addr`.
    #[serde(default)]
    pub server_name: Option<String>,

    /// DNS-over-HTTPS endpoint.
    #[serde(default)]
    pub url: Option<String>,

    /// 0 disables connection reuse.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Deadline of a single exchange, dial included.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// In-flight queries one connection accepts before another is dialed.
    #[serde(default = "default_max_pipelined_queries")]
    pub max_pipelined_queries: usize,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default)]
    pub socks5: Option<Socks5Config>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Socks5Config {
    pub addr: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            protocol: UpstreamProtocol::default(),
            server_name: None,
            url: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            max_conns: default_max_conns(),
            timeout_ms: default_timeout_ms(),
            max_pipelined_queries: default_max_pipelined_queries(),
            insecure_skip_verify: false,
            socks5: None,
        }
    }
}

impl UpstreamConfig {
    /// Builds a config from `udp://`, `tcp://`, `tls://`, `https://` or bare `IP:PORT`.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_endpoint(endpoint)?;
        Ok(config)
    }

    /// Overwrites address, protocol, server name and URL, keeping pool settings.
    pub fn apply_endpoint(&mut self, endpoint: &str) -> Result<(), ConfigError> {
        let parsed: UpstreamEndpoint = endpoint.parse().map_err(ConfigError::Validation)?;
        self.addr = parsed.addr.to_string();
        self.protocol = parsed.protocol;
        self.server_name = parsed.server_name.map(|s| s.to_string());
        self.url = parsed.url.map(|s| s.to_string());
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reuse_enabled(&self) -> bool {
        self.idle_timeout_ms > 0
    }

    pub fn upstream_addr(&self) -> Result<UpstreamAddr, ConfigError> {
        self.addr.parse().map_err(ConfigError::Validation)
    }

    /// Name presented in the TLS handshake.
    pub fn tls_server_name(&self) -> Option<String> {
        match &self.server_name {
            Some(name) if !name.is_empty() => Some(name.clone()),
            _ => self.upstream_addr().ok().map(|addr| addr.host()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conns == 0 {
            return Err(ConfigError::Validation(
                "max_conns must be greater than 0".to_string(),
            ));
        }
        if self.max_pipelined_queries == 0 {
            return Err(ConfigError::Validation(
                "max_pipelined_queries must be greater than 0".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.protocol {
            UpstreamProtocol::Https => {
                let url = self.url.as_deref().unwrap_or_default();
                if !url.starts_with("https://") {
                    return Err(ConfigError::Validation(format!(
                        "HTTPS upstream requires an https:// url, got '{}'",
                        url
                    )));
                }
            }
            _ => {
                self.upstream_addr()?;
            }
        }

        if self.protocol == UpstreamProtocol::Tls && self.tls_server_name().is_none() {
            return Err(ConfigError::Validation(
                "TLS upstream requires a server_name".to_string(),
            ));
        }

        if let Some(socks5) = &self.socks5 {
            socks5
                .addr
                .parse::<UpstreamAddr>()
                .map_err(|e| ConfigError::Validation(format!("socks5: {}", e)))?;
            if socks5.username.is_some() != socks5.password.is_some() {
                return Err(ConfigError::Validation(
                    "socks5 username and password must be set together".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn default_addr() -> String {
    "127.0.0.1:53".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_max_conns() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_pipelined_queries() -> usize {
    64
}
