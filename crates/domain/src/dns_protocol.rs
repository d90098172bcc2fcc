use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

/// Wire transport used to reach an upstream resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    #[default]
    Udp,
    Tcp,
    #[serde(alias = "dot")]
    Tls,
    #[serde(alias = "doh")]
    Https,
}

impl UpstreamProtocol {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            UpstreamProtocol::Udp => "UDP",
            UpstreamProtocol::Tcp => "TCP",
            UpstreamProtocol::Tls => "TLS",
            UpstreamProtocol::Https => "HTTPS",
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            UpstreamProtocol::Udp => "udp",
            UpstreamProtocol::Tcp => "tcp",
            UpstreamProtocol::Tls => "tls",
            UpstreamProtocol::Https => "https",
        }
    }

    /// Length-prefixed stream framing (RFC 1035 §4.2.2) or HTTP bodies.
    pub fn is_stream(&self) -> bool {
        !matches!(self, UpstreamProtocol::Udp)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, UpstreamProtocol::Tls | UpstreamProtocol::Https)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            UpstreamProtocol::Udp | UpstreamProtocol::Tcp => 53,
            UpstreamProtocol::Tls => 853,
            UpstreamProtocol::Https => 443,
        }
    }
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_name())
    }
}

impl FromStr for UpstreamProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(UpstreamProtocol::Udp),
            "tcp" => Ok(UpstreamProtocol::Tcp),
            "tls" | "dot" => Ok(UpstreamProtocol::Tls),
            "https" | "doh" => Ok(UpstreamProtocol::Https),
            other => Err(format!(
                "Unknown protocol '{}'. Expected one of: udp, tcp, tls (dot), https (doh)",
                other
            )),
        }
    }
}

/// Represents an upstream server address that may or may not be resolved to an IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddr {
    Resolved(SocketAddr),
    Unresolved { hostname: Arc<str>, port: u16 },
}

impl UpstreamAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            UpstreamAddr::Resolved(addr) => Some(*addr),
            UpstreamAddr::Unresolved { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            UpstreamAddr::Resolved(addr) => addr.port(),
            UpstreamAddr::Unresolved { port, .. } => *port,
        }
    }

    pub fn hostname_str(&self) -> Option<&str> {
        match self {
            UpstreamAddr::Resolved(_) => None,
            UpstreamAddr::Unresolved { hostname, .. } => Some(hostname),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, UpstreamAddr::Unresolved { .. })
    }

    /// Host part without the port, IPv6 literals unbracketed.
    pub fn host(&self) -> String {
        match self {
            UpstreamAddr::Resolved(addr) => addr.ip().to_string(),
            UpstreamAddr::Unresolved { hostname, .. } => hostname.to_string(),
        }
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAddr::Resolved(addr) => write!(f, "{}", addr),
            UpstreamAddr::Unresolved { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

impl FromStr for UpstreamAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(UpstreamAddr::Resolved(addr));
        }
        match parse_host_port(s) {
            Some((host, port)) if !host.is_empty() => Ok(UpstreamAddr::Unresolved {
                hostname: host.into(),
                port,
            }),
            _ => Err(format!("Invalid address '{}'. Expected HOST:PORT", s)),
        }
    }
}

fn parse_host_port(s: &str) -> Option<(&str, u16)> {
    if s.starts_with('[') {
        let end = s.find(']')?;
        let host = &s[1..end];
        let rest = &s[end + 1..];
        let port_str = rest.strip_prefix(':')?;
        let port = port_str.parse::<u16>().ok()?;
        Some((host, port))
    } else {
        let (host, port_str) = s.rsplit_once(':')?;
        let port = port_str.parse::<u16>().ok()?;
        Some((host, port))
    }
}

/// Appends the protocol's default port when `authority` carries none.
fn with_default_port(authority: &str, protocol: UpstreamProtocol) -> String {
    if let Ok(ip) = authority.parse::<IpAddr>() {
        return SocketAddr::new(ip, protocol.default_port()).to_string();
    }
    if parse_host_port(authority).is_some() {
        return authority.to_string();
    }
    format!("{}:{}", authority, protocol.default_port())
}

/// A parsed `scheme://host:port` or `https://host/path` upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub protocol: UpstreamProtocol,
    pub addr: UpstreamAddr,
    pub server_name: Option<Arc<str>>,
    pub url: Option<Arc<str>>,
}

impl FromStr for UpstreamEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("https://") || s.starts_with("doh://") {
            let url: Arc<str> = if let Some(rest) = s.strip_prefix("doh://") {
                format!("https://{}", rest).into()
            } else {
                s.into()
            };
            let authority = url
                .strip_prefix("https://")
                .and_then(|rest| rest.split('/').next())
                .filter(|a| !a.is_empty())
                .ok_or_else(|| format!("Invalid HTTPS URL: {}", s))?;
            let addr: UpstreamAddr =
                with_default_port(authority, UpstreamProtocol::Https).parse()?;
            return Ok(UpstreamEndpoint {
                protocol: UpstreamProtocol::Https,
                server_name: Some(addr.host().into()),
                addr,
                url: Some(url),
            });
        }

        let (protocol, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<UpstreamProtocol>()?, rest),
            None => (UpstreamProtocol::Udp, s),
        };

        let addr: UpstreamAddr = with_default_port(rest, protocol).parse().map_err(|_| {
            format!(
                "Invalid {} address '{}'. Expected '{}://HOST:PORT'",
                protocol,
                rest,
                protocol.scheme()
            )
        })?;

        let server_name = match protocol {
            UpstreamProtocol::Tls => Some(addr.host().into()),
            _ => None,
        };

        Ok(UpstreamEndpoint {
            protocol,
            addr,
            server_name,
            url: None,
        })
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.protocol, &self.url) {
            (UpstreamProtocol::Https, Some(url)) => write!(f, "{}", url),
            (UpstreamProtocol::Tls, _) => match &self.server_name {
                Some(name) => write!(f, "tls://{}:{}", name, self.addr.port()),
                None => write!(f, "tls://{}", self.addr),
            },
            (protocol, _) => write!(f, "{}://{}", protocol.scheme(), self.addr),
        }
    }
}
