use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid DNS message: {0}")]
    InvalidDnsMessage(String),

    #[error("Failed to connect to {server}: {reason}")]
    TransportDialFailed { server: String, reason: String },

    #[error("Transport timeout waiting on {server}")]
    TransportTimeout { server: String },

    #[error("Failed to write query to {server}: {reason}")]
    TransportWriteFailed { server: String, reason: String },

    #[error("Failed to read response from {server}: {reason}")]
    TransportReadFailed { server: String, reason: String },

    #[error("Malformed frame from {server}: {reason}")]
    MalformedFrame { server: String, reason: String },

    #[error("Transport connection to {server} closed")]
    TransportConnectionClosed { server: String },

    #[error("Response ID {received} does not match query ID {expected}")]
    IdMismatch { expected: u16, received: u16 },

    #[error("No free query ID left on connection to {server}")]
    IdSpaceExhausted { server: String },

    #[error("DoH server {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl DomainError {
    /// Failures of an established connection. These evict the connection and
    /// are eligible for one retry on a freshly dialed one.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DomainError::TransportWriteFailed { .. }
                | DomainError::TransportReadFailed { .. }
                | DomainError::MalformedFrame { .. }
                | DomainError::TransportConnectionClosed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DomainError::TransportTimeout { .. })
    }

    /// Any error raised by the network path rather than by bad input.
    pub fn is_transport_error(&self) -> bool {
        self.is_connection_error()
            || self.is_timeout()
            || matches!(
                self,
                DomainError::TransportDialFailed { .. }
                    | DomainError::IdSpaceExhausted { .. }
                    | DomainError::HttpStatus { .. }
            )
    }
}

impl From<crate::config::ConfigError> for DomainError {
    fn from(err: crate::config::ConfigError) -> Self {
        DomainError::ConfigError(err.to_string())
    }
}
