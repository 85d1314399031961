//! SOCKS5-style address codec
//!
//! The same wire form (RFC 1928 request-address) is used by the SOCKS5
//! request body, the Shadowsocks target header and the Trojan command
//! line, so it lives here rather than in any single protocol module.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Target address: IPv4, IPv6 or a domain name, plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddress {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl NetAddress {
    /// Build from a host string, parsing IP literals.
    pub fn host_port(host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(NetAddress::Ipv4(ip, port));
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Ok(NetAddress::Ipv6(ip, port));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(Error::address(format!(
                "domain length {} out of range 1..=255",
                host.len()
            )));
        }
        Ok(NetAddress::Domain(host.to_string(), port))
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => NetAddress::Ipv4(v4, port),
            IpAddr::V6(v6) => NetAddress::Ipv6(v6, port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetAddress::Ipv4(_, p) | NetAddress::Ipv6(_, p) | NetAddress::Domain(_, p) => *p,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            NetAddress::Ipv4(ip, _) => ip.to_string(),
            NetAddress::Ipv6(ip, _) => ip.to_string(),
            NetAddress::Domain(d, _) => d.clone(),
        }
    }

    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            NetAddress::Ipv4(ip, _) => Some(IpAddr::V4(*ip)),
            NetAddress::Ipv6(ip, _) => Some(IpAddr::V6(*ip)),
            NetAddress::Domain(..) => None,
        }
    }

    /// Wire length: atyp + address (+ length prefix) + port
    pub fn encoded_len(&self) -> usize {
        match self {
            NetAddress::Ipv4(..) => 1 + 4 + 2,
            NetAddress::Ipv6(..) => 1 + 16 + 2,
            NetAddress::Domain(d, _) => 1 + 1 + d.len() + 2,
        }
    }

    /// Append the SOCKS5 encoding to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            NetAddress::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            NetAddress::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            NetAddress::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.to_vec()
    }

    /// Decode from the front of `data` without consuming it.
    ///
    /// Returns the address and the number of bytes it occupied, or
    /// `Ok(None)` when the buffer is too short to decide.
    pub fn decode(data: &[u8]) -> Result<Option<(NetAddress, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }
        match data[0] {
            ATYP_IPV4 => {
                if data.len() < 1 + 4 + 2 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok(Some((NetAddress::Ipv4(ip, port), 7)))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Ok(None);
                }
                let len = data[1] as usize;
                if len == 0 {
                    return Err(Error::address("empty domain name"));
                }
                if data.len() < 2 + len + 2 {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| Error::address("domain is not valid UTF-8"))?
                    .to_string();
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok(Some((NetAddress::Domain(domain, port), 2 + len + 2)))
            }
            ATYP_IPV6 => {
                if data.len() < 1 + 16 + 2 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok(Some((NetAddress::Ipv6(Ipv6Addr::from(octets), port), 19)))
            }
            t => Err(Error::UnsupportedAddressType(t)),
        }
    }

    /// Read one address from an async stream (handshake paths).
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(NetAddress::Ipv4(ip, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                if len == 0 {
                    return Err(Error::address("empty domain name"));
                }
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                buf.truncate(len);
                let domain = String::from_utf8(buf)
                    .map_err(|_| Error::address("domain is not valid UTF-8"))?;
                Ok(NetAddress::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(NetAddress::Ipv6(Ipv6Addr::from(octets), port))
            }
            t => Err(Error::UnsupportedAddressType(t)),
        }
    }

    /// Write the SOCKS5 encoding to an async stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            NetAddress::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            NetAddress::Domain(d, port) => write!(f, "{}:{}", d, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_domain() {
        let addr = NetAddress::host_port("localhost", 80).unwrap();
        assert_eq!(
            addr.to_bytes(),
            [
                &[0x03u8, 0x09][..],
                b"localhost",
                &[0x00, 0x50][..]
            ]
            .concat()
        );
    }

    #[test]
    fn test_encode_ipv4() {
        let addr = NetAddress::host_port("127.0.0.1", 80).unwrap();
        assert_eq!(addr.to_bytes(), vec![0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50]);
    }

    #[test]
    fn test_encode_ipv6() {
        let addr = NetAddress::host_port("::1", 80).unwrap();
        let mut expected = vec![0x04];
        expected.extend_from_slice(&[0u8; 15]);
        expected.push(0x01);
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(addr.to_bytes(), expected);
    }

    #[test]
    fn test_round_trip() {
        for addr in [
            NetAddress::host_port("example.com", 443).unwrap(),
            NetAddress::host_port("10.0.0.1", 8080).unwrap(),
            NetAddress::host_port("2001:db8::1", 53).unwrap(),
        ] {
            let bytes = addr.to_bytes();
            let (decoded, consumed) = NetAddress::decode(&bytes).unwrap().unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn test_decode_rejects_unknown_atyp() {
        let err = NetAddress::decode(&[0x02, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressType(0x02)));
    }

    #[test]
    fn test_decode_truncated_returns_none() {
        // Too short to tell the full IPv4 form
        assert!(NetAddress::decode(&[0x01, 0x7f, 0x00]).unwrap().is_none());
        // Domain with missing tail
        assert!(NetAddress::decode(&[0x03, 0x09, b'l']).unwrap().is_none());
        assert!(NetAddress::decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_utf8_domain() {
        let data = [0x03, 0x02, 0xff, 0xfe, 0x00, 0x50];
        assert!(NetAddress::decode(&data).is_err());
    }
}
