//! Minimal SOCKS5 negotiation (RFC 1928 subset)
//!
//! Supports the NO_AUTH method and the CONNECT command with IPv4, domain and
//! IPv6 address types. Used on the server for forward-dynamic listeners and
//! on the agent for reverse-dynamic listeners.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddrType(u8),

    #[error("malformed domain name")]
    MalformedDomain,

    #[error("truncated or malformed request")]
    Malformed,
}

/// Target address parsed from a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl SocksAddr {
    /// Host form suitable for dialing (`host:port`).
    pub fn host(&self) -> String {
        match self {
            SocksAddr::V4(ip) => ip.to_string(),
            SocksAddr::Domain(name) => name.clone(),
            SocksAddr::V6(ip) => ip.to_string(),
        }
    }

    /// Append the ATYP + ADDR encoding of this address.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            SocksAddr::V4(ip) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            SocksAddr::Domain(name) => {
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            SocksAddr::V6(ip) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
        }
    }
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: SocksAddr,
    pub port: u16,
}

/// The ten-byte reply for the given code (BND fields zeroed, ATYP IPv4).
pub fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Encode a full CONNECT request (used by tests and round-trip checks).
pub fn encode_connect_request(addr: &SocksAddr, port: u16) -> Vec<u8> {
    let mut out = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    addr.encode_to(&mut out);
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// Run the server side of the SOCKS5 exchange on a freshly accepted socket.
///
/// Answers the greeting, parses the CONNECT request and returns the target.
/// Unsupported commands and address types get the matching reply before the
/// error is returned; version mismatches get nothing — the caller destroys
/// the connection either way.
pub async fn negotiate<S>(stream: &mut S) -> Result<ConnectRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Version(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(SocksError::Version(req[0]));
    }
    if req[1] != CMD_CONNECT {
        stream.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
        return Err(SocksError::UnsupportedCommand(req[1]));
    }

    let addr = match req[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            SocksAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| SocksError::MalformedDomain)?;
            SocksAddr::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            SocksAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            stream.write_all(&reply(REPLY_ATYP_NOT_SUPPORTED)).await?;
            return Err(SocksError::UnsupportedAddrType(other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(ConnectRequest {
        addr,
        port: u16::from_be_bytes(port),
    })
}

/// Decode the ATYP + ADDR + PORT tail of a request (round-trip counterpart
/// of [`encode_connect_request`]).
pub fn decode_addr_port(bytes: &[u8]) -> Result<(SocksAddr, u16), SocksError> {
    if bytes.is_empty() {
        return Err(SocksError::Malformed);
    }
    let (addr, rest) = match bytes[0] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = bytes
                .get(1..5)
                .and_then(|s| s.try_into().ok())
                .ok_or(SocksError::Malformed)?;
            (SocksAddr::V4(Ipv4Addr::from(octets)), &bytes[5..])
        }
        ATYP_DOMAIN => {
            let len = *bytes.get(1).ok_or(SocksError::Malformed)? as usize;
            let name = bytes.get(2..2 + len).ok_or(SocksError::Malformed)?;
            let name =
                String::from_utf8(name.to_vec()).map_err(|_| SocksError::MalformedDomain)?;
            (SocksAddr::Domain(name), &bytes[2 + len..])
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = bytes
                .get(1..17)
                .and_then(|s| s.try_into().ok())
                .ok_or(SocksError::Malformed)?;
            (SocksAddr::V6(Ipv6Addr::from(octets)), &bytes[17..])
        }
        other => return Err(SocksError::UnsupportedAddrType(other)),
    };
    let port: [u8; 2] = rest
        .get(..2)
        .and_then(|s| s.try_into().ok())
        .ok_or(SocksError::Malformed)?;
    Ok((addr, u16::from_be_bytes(port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn run_negotiation(client_bytes: &[u8]) -> (Result<ConnectRequest, SocksError>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(client_bytes).await.unwrap();

        let result = negotiate(&mut server).await;

        // Drain whatever the server wrote back.
        drop(server);
        let mut replies = Vec::new();
        let _ = client.read_to_end(&mut replies).await;
        (result, replies)
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut wire = vec![0x05, 0x01, 0x00]; // greeting, one method: NO_AUTH
        wire.extend_from_slice(&encode_connect_request(
            &SocksAddr::Domain("example.com".to_string()),
            80,
        ));

        let (result, replies) = run_negotiation(&wire).await;
        let req = result.unwrap();
        assert_eq!(req.addr, SocksAddr::Domain("example.com".to_string()));
        assert_eq!(req.port, 80);
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_connect_ipv4_and_ipv6() {
        for addr in [
            SocksAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            SocksAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let mut wire = vec![0x05, 0x01, 0x00];
            wire.extend_from_slice(&encode_connect_request(&addr, 443));
            let (result, _) = run_negotiation(&wire).await;
            let req = result.unwrap();
            assert_eq!(req.addr, addr);
            assert_eq!(req.port, 443);
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_gets_no_reply() {
        let (result, replies) = run_negotiation(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(SocksError::Version(0x04))));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (result, replies) = run_negotiation(&[0x05, 0x01, 0x02]).await;
        assert!(matches!(result, Err(SocksError::NoAcceptableMethod)));
        assert_eq!(replies, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        // Greeting, then BIND (0x02) request.
        let wire = [
            0x05, 0x01, 0x00, // greeting
            0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50,
        ];
        let (result, replies) = run_negotiation(&wire).await;
        assert!(matches!(result, Err(SocksError::UnsupportedCommand(0x02))));
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(&replies[2..], &reply(REPLY_COMMAND_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let wire = [
            0x05, 0x01, 0x00, // greeting
            0x05, 0x01, 0x00, 0x02, 0x00, 0x00,
        ];
        let (result, replies) = run_negotiation(&wire).await;
        assert!(matches!(result, Err(SocksError::UnsupportedAddrType(0x02))));
        assert_eq!(&replies[2..], &reply(REPLY_ATYP_NOT_SUPPORTED));
    }

    #[test]
    fn test_reply_shapes() {
        assert_eq!(
            reply(REPLY_SUCCESS),
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            reply(REPLY_GENERAL_FAILURE),
            [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_addr_port_round_trip_all_atyps() {
        for addr in [
            SocksAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
            SocksAddr::Domain("internal.service".to_string()),
            SocksAddr::V6(Ipv6Addr::new(0x20, 0x01, 0, 0, 0, 0, 0, 0x11)),
        ] {
            let mut encoded = Vec::new();
            addr.encode_to(&mut encoded);
            encoded.extend_from_slice(&8080u16.to_be_bytes());

            let (decoded, port) = decode_addr_port(&encoded).unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(port, 8080);
        }
    }
}
