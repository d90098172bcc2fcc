//! SOCKS5 CONNECT client (RFC 1928, RFC 1929)
//!
//! Only used to tunnel stream transports. Hostnames are sent to the proxy
//! unresolved so resolution happens on the proxy side.

use super::dialer::resolve;
use ferrous_upstream_domain::{DomainError, Socks5Config, UpstreamAddr};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_PASSWORD: u8 = 0x02;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

const fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    addr: UpstreamAddr,
    credentials: Option<(String, String)>,
}

impl Socks5Proxy {
    pub fn from_config(config: &Socks5Config) -> Result<Self, DomainError> {
        let addr = config
            .addr
            .parse()
            .map_err(|e: String| DomainError::ConfigError(format!("socks5: {}", e)))?;
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self { addr, credentials })
    }

    pub fn addr(&self) -> &UpstreamAddr {
        &self.addr
    }

    /// Opens a TCP connection to the proxy and asks it to connect to `target`.
    pub async fn connect(&self, target: &UpstreamAddr) -> Result<TcpStream, DomainError> {
        let proxy_addr = resolve(&self.addr).await?;
        let mut stream = TcpStream::connect(proxy_addr)
            .await
            .map_err(|e| DomainError::TransportDialFailed {
                server: target.to_string(),
                reason: format!("socks5 proxy {}: {}", self.addr, e),
            })?;

        handshake(&mut stream, target, self.credentials.as_ref())
            .await
            .map_err(|reason| DomainError::TransportDialFailed {
                server: target.to_string(),
                reason: format!("socks5 proxy {}: {}", self.addr, reason),
            })?;

        debug!(proxy = %self.addr, target = %target, "SOCKS5 tunnel established");
        Ok(stream)
    }
}

/// Runs method negotiation, optional password auth and CONNECT on `stream`.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    target: &UpstreamAddr,
    credentials: Option<&(String, String)>,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = if credentials.is_some() {
        AUTH_METHOD_PASSWORD
    } else {
        AUTH_METHOD_NONE
    };
    stream
        .write_all(&[SOCKS5_VERSION, 1, method])
        .await
        .map_err(|e| format!("greeting: {}", e))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| format!("greeting reply: {}", e))?;
    if choice[0] != SOCKS5_VERSION {
        return Err(format!("unexpected version {:#04x}", choice[0]));
    }
    match (choice[1], credentials) {
        (AUTH_METHOD_NONE, _) => {}
        (AUTH_METHOD_PASSWORD, Some((user, pass))) => authenticate(stream, user, pass).await?,
        (AUTH_METHOD_NO_ACCEPTABLE, _) => return Err("no acceptable auth method".to_string()),
        (other, _) => return Err(format!("unsupported auth method {:#04x}", other)),
    }

    let request = connect_request(target)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| format!("connect request: {}", e))?;

    read_connect_reply(stream).await
}

async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_len = u8::try_from(user.len()).map_err(|_| "username too long".to_string())?;
    let pass_len = u8::try_from(pass.len()).map_err(|_| "password too long".to_string())?;

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(user_len);
    request.extend_from_slice(user.as_bytes());
    request.push(pass_len);
    request.extend_from_slice(pass.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| format!("auth request: {}", e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| format!("auth reply: {}", e))?;
    if reply[1] != 0x00 {
        return Err("authentication rejected".to_string());
    }
    Ok(())
}

fn connect_request(target: &UpstreamAddr) -> Result<Vec<u8>, String> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        UpstreamAddr::Resolved(addr) => match addr.ip() {
            IpAddr::V4(ip) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
        },
        UpstreamAddr::Unresolved { hostname, .. } => {
            let len = u8::try_from(hostname.len())
                .map_err(|_| format!("hostname too long: {}", hostname))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(hostname.as_bytes());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    Ok(request)
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<(), String>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| format!("connect reply: {}", e))?;
    if header[1] != REPLY_SUCCEEDED {
        return Err(format!("connect failed: {}", reply_message(header[1])));
    }

    // Bound address is not needed; drain it.
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| format!("connect reply: {}", e))?;
            len[0] as usize
        }
        other => return Err(format!("unknown address type {:#04x}", other)),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut rest)
        .await
        .map_err(|e| format!("connect reply: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    async fn mock_proxy(mut socket: DuplexStream, require_auth: bool) -> Vec<u8> {
        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();

        if require_auth {
            socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD]).await.unwrap();
            let mut head = [0u8; 2];
            socket.read_exact(&mut head).await.unwrap();
            let mut user = vec![0u8; head[1] as usize];
            socket.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            socket.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            socket.read_exact(&mut pass).await.unwrap();
            let ok = user == b"alice" && pass == b"secret";
            socket
                .write_all(&[AUTH_PASSWORD_VERSION, if ok { 0x00 } else { 0x01 }])
                .await
                .unwrap();
            if !ok {
                return Vec::new();
            }
        } else {
            socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await.unwrap();
        }

        let mut request = vec![0u8; 4];
        socket.read_exact(&mut request).await.unwrap();
        let addr_len = match request[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            _ => {
                let mut len = [0u8; 1];
                socket.read_exact(&mut len).await.unwrap();
                request.push(len[0]);
                len[0] as usize
            }
        };
        let mut rest = vec![0u8; addr_len + 2];
        socket.read_exact(&mut rest).await.unwrap();
        request.extend_from_slice(&rest);

        socket
            .write_all(&[SOCKS5_VERSION, REPLY_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn test_connect_ipv4_without_auth() {
        let (mut client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(mock_proxy(server, false));
        let target: UpstreamAddr = "8.8.8.8:53".parse().unwrap();

        handshake(&mut client, &target, None).await.unwrap();

        let request = proxy.await.unwrap();
        assert_eq!(request, vec![5, 1, 0, ATYP_IPV4, 8, 8, 8, 8, 0, 53]);
    }

    #[tokio::test]
    async fn test_connect_hostname_with_auth() {
        let (mut client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(mock_proxy(server, true));
        let target: UpstreamAddr = "dns.google:853".parse().unwrap();
        let creds = ("alice".to_string(), "secret".to_string());

        handshake(&mut client, &target, Some(&creds)).await.unwrap();

        let request = proxy.await.unwrap();
        assert_eq!(request[3], ATYP_DOMAIN);
        assert_eq!(request[4] as usize, "dns.google".len());
        assert_eq!(&request[5..15], b"dns.google");
        assert_eq!(&request[15..], &853u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(mock_proxy(server, true));
        let target: UpstreamAddr = "1.1.1.1:53".parse().unwrap();
        let creds = ("alice".to_string(), "wrong".to_string());

        let err = handshake(&mut client, &target, Some(&creds)).await.unwrap_err();
        assert!(err.contains("rejected"), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_connect_failure_reply() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[SOCKS5_VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let target: UpstreamAddr = "9.9.9.9:53".parse().unwrap();

        let err = handshake(&mut client, &target, None).await.unwrap_err();
        assert!(err.contains("connection refused"), "unexpected error: {}", err);
    }

    #[test]
    fn test_from_config_reads_credentials() {
        let config = Socks5Config {
            addr: "127.0.0.1:1080".into(),
            username: Some("u".into()),
            password: Some("p".into()),
        };
        let proxy = Socks5Proxy::from_config(&config).unwrap();
        assert_eq!(proxy.addr().port(), 1080);
        assert!(proxy.credentials.is_some());
    }
}
