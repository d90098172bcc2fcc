//! Ferrous Upstream Domain Layer
pub mod config;
pub mod dns_protocol;
pub mod errors;

pub use config::{CliOverrides, Config, ConfigError, Socks5Config, UpstreamConfig};
pub use dns_protocol::{UpstreamAddr, UpstreamEndpoint, UpstreamProtocol};
pub use errors::DomainError;
