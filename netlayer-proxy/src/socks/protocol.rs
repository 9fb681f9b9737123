//! SOCKS4/4a/5 wire format: request parsing and reply encoding

use crate::error::SocksError;
use crate::layer::TargetAddr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

pub const CMD_CONNECT: u8 = 0x01;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
pub const SOCKS4_GRANTED: u8 = 0x5A;
pub const SOCKS4_REJECTED: u8 = 0x5B;

/// Longest user id or SOCKS4a host name accepted, terminator excluded
const MAX_CSTRING: usize = 255;

fn read_error(err: io::Error) -> SocksError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => SocksError::Truncated,
        _ => SocksError::ClientIo(err),
    }
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, SocksError> {
    reader.read_u8().await.map_err(read_error)
}

async fn read_u16<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16, SocksError> {
    reader.read_u16().await.map_err(read_error)
}

async fn read_array<R: AsyncRead + Unpin, const N: usize>(
    reader: &mut R,
) -> Result<[u8; N], SocksError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await.map_err(read_error)?;
    Ok(buf)
}

/// Read a NUL-terminated string of at most [`MAX_CSTRING`] bytes
async fn read_cstring<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, SocksError> {
    let mut bytes = Vec::new();
    loop {
        match read_u8(reader).await? {
            0 => return Ok(bytes),
            _ if bytes.len() == MAX_CSTRING => return Err(SocksError::Truncated),
            b => bytes.push(b),
        }
    }
}

fn domain_from_bytes(bytes: Vec<u8>) -> Result<String, SocksError> {
    if bytes.is_empty() {
        return Err(SocksError::InvalidDomain);
    }
    String::from_utf8(bytes).map_err(|_| SocksError::InvalidDomain)
}

/// SOCKS4a marks "resolve the name that follows" with 0.0.0.x, x != 0
pub fn is_socks4a_sentinel(ip: Ipv4Addr) -> bool {
    let [a, b, c, d] = ip.octets();
    a == 0 && b == 0 && c == 0 && d != 0
}

/// First byte of a session; it selects the protocol version
pub async fn read_version<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, SocksError> {
    read_u8(reader).await
}

/// Methods offered in a SOCKS5 greeting (version byte already consumed)
pub async fn read_socks5_methods<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, SocksError> {
    let count = read_u8(reader).await?;
    let mut methods = vec![0u8; count as usize];
    reader.read_exact(&mut methods).await.map_err(read_error)?;
    Ok(methods)
}

/// Header of a SOCKS5 request, read before the address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks5Header {
    pub command: u8,
    pub address_type: u8,
}

pub async fn read_socks5_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Socks5Header, SocksError> {
    let [version, command, _reserved, address_type] = read_array::<R, 4>(reader).await?;
    if version != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    Ok(Socks5Header {
        command,
        address_type,
    })
}

/// Destination following a SOCKS5 header of a known address type
pub async fn read_socks5_target<R: AsyncRead + Unpin>(
    reader: &mut R,
    address_type: u8,
) -> Result<TargetAddr, SocksError> {
    let target = match address_type {
        ATYP_IPV4 => {
            let ip = Ipv4Addr::from(read_array::<R, 4>(reader).await?);
            let port = read_u16(reader).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        ATYP_IPV6 => {
            let ip = Ipv6Addr::from(read_array::<R, 16>(reader).await?);
            let port = read_u16(reader).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
        }
        ATYP_DOMAIN => {
            let len = read_u8(reader).await?;
            let mut name = vec![0u8; len as usize];
            reader.read_exact(&mut name).await.map_err(read_error)?;
            let port = read_u16(reader).await?;
            TargetAddr::Domain(domain_from_bytes(name)?, port)
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    Ok(target)
}

/// A SOCKS4 or SOCKS4a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub command: u8,
    pub port: u16,
    /// Address exactly as sent, the SOCKS4a sentinel included
    pub ip: Ipv4Addr,
    pub target: TargetAddr,
}

/// Parse a SOCKS4 request (version byte already consumed)
pub async fn read_socks4_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Socks4Request, SocksError> {
    let command = read_u8(reader).await?;
    let port = read_u16(reader).await?;
    let ip = Ipv4Addr::from(read_array::<R, 4>(reader).await?);
    let _user_id = read_cstring(reader).await?;

    let target = if is_socks4a_sentinel(ip) {
        let name = read_cstring(reader).await?;
        TargetAddr::Domain(domain_from_bytes(name)?, port)
    } else {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    };

    Ok(Socks4Request {
        command,
        port,
        ip,
        target,
    })
}

/// SOCKS5 reply bound to `target`, or to 0.0.0.0:0 when nothing was parsed
pub fn socks5_reply(code: u8, target: Option<&TargetAddr>) -> Vec<u8> {
    let mut reply = vec![SOCKS5_VERSION, code, 0x00];
    let Some(target) = target else {
        reply.extend_from_slice(&[ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        return reply;
    };

    match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
        }
        TargetAddr::Domain(domain, _) => {
            reply.push(ATYP_DOMAIN);
            reply.push(domain.len() as u8);
            reply.extend_from_slice(domain.as_bytes());
        }
    }
    reply.extend_from_slice(&target.port().to_be_bytes());
    reply
}

/// Eight-byte SOCKS4 reply echoing the request's port and address
pub fn socks4_reply(status: u8, port: u16, ip: Ipv4Addr) -> [u8; 8] {
    let [p0, p1] = port.to_be_bytes();
    let [a, b, c, d] = ip.octets();
    [SOCKS4_REPLY_VERSION, status, p0, p1, a, b, c, d]
}

/// SOCKS5 reply code for a failed downstream connect
pub fn socks5_failure_code(kind: io::ErrorKind) -> u8 {
    match kind {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::NotFound
        | io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks4a_sentinel() {
        assert!(is_socks4a_sentinel(Ipv4Addr::new(0, 0, 0, 1)));
        assert!(is_socks4a_sentinel(Ipv4Addr::new(0, 0, 0, 255)));
        assert!(!is_socks4a_sentinel(Ipv4Addr::new(0, 0, 0, 0)));
        assert!(!is_socks4a_sentinel(Ipv4Addr::new(0, 0, 1, 1)));
        assert!(!is_socks4a_sentinel(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_socks5_reply_layouts() {
        let domain = TargetAddr::new_domain("a.io", 80);
        assert_eq!(
            socks5_reply(REP_SUCCEEDED, Some(&domain)),
            vec![5, 0, 0, 3, 4, b'a', b'.', b'i', b'o', 0, 80]
        );

        let v4 = TargetAddr::Ip("10.1.2.3:8080".parse().unwrap());
        assert_eq!(
            socks5_reply(REP_CONNECTION_REFUSED, Some(&v4)),
            vec![5, 5, 0, 1, 10, 1, 2, 3, 0x1f, 0x90]
        );

        let v6 = TargetAddr::Ip("[::1]:443".parse().unwrap());
        let reply = socks5_reply(REP_SUCCEEDED, Some(&v6));
        assert_eq!(reply.len(), 4 + 16 + 2);
        assert_eq!(reply[3], ATYP_IPV6);
        assert_eq!(&reply[20..], &[0x01, 0xbb]);

        assert_eq!(
            socks5_reply(REP_COMMAND_NOT_SUPPORTED, None),
            vec![5, 7, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_socks4_reply_layout() {
        assert_eq!(
            socks4_reply(SOCKS4_GRANTED, 0x0050, Ipv4Addr::new(0, 0, 0, 1)),
            [0x00, 0x5A, 0x00, 0x50, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(socks5_failure_code(io::ErrorKind::ConnectionRefused), 0x05);
        assert_eq!(socks5_failure_code(io::ErrorKind::TimedOut), 0x04);
        assert_eq!(socks5_failure_code(io::ErrorKind::HostUnreachable), 0x04);
        assert_eq!(socks5_failure_code(io::ErrorKind::PermissionDenied), 0x01);
    }

    #[tokio::test]
    async fn test_read_socks5_domain_target() {
        let mut input: &[u8] = b"\x0bexample.org\x01\xbb";
        let target = read_socks5_target(&mut input, ATYP_DOMAIN).await.unwrap();
        assert_eq!(target, TargetAddr::new_domain("example.org", 443));
    }

    #[tokio::test]
    async fn test_read_socks5_rejects_empty_and_unknown() {
        let mut empty: &[u8] = &[0, 0, 80];
        assert!(matches!(
            read_socks5_target(&mut empty, ATYP_DOMAIN).await,
            Err(SocksError::InvalidDomain)
        ));

        let mut anything: &[u8] = &[1, 2, 3];
        assert!(matches!(
            read_socks5_target(&mut anything, 0x09).await,
            Err(SocksError::UnsupportedAddressType(0x09))
        ));
    }

    #[tokio::test]
    async fn test_read_socks4a_request() {
        let mut input: &[u8] = b"\x01\x00\x50\x00\x00\x00\x07alice\0example.com\0";
        let request = read_socks4_request(&mut input).await.unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.ip, Ipv4Addr::new(0, 0, 0, 7));
        assert_eq!(request.target, TargetAddr::new_domain("example.com", 80));
    }

    #[tokio::test]
    async fn test_truncated_request() {
        let mut input: &[u8] = b"\x01\x00\x50\x0a\x00";
        assert!(matches!(
            read_socks4_request(&mut input).await,
            Err(SocksError::Truncated)
        ));

        let mut unterminated: &[u8] = b"\x01\x00\x50\x0a\x00\x00\x01user";
        assert!(matches!(
            read_socks4_request(&mut unterminated).await,
            Err(SocksError::Truncated)
        ));
    }
}
