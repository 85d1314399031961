//! SOCKS5 protocol (RFC 1928) message types and constants

pub mod handshake;

use crate::common::NetAddress;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Reply codes (RFC 1928 §6)
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

/// Client greeting: version + offered methods
#[derive(Debug)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::framing(format!(
                "unsupported SOCKS version {:#04x}",
                head[0]
            )));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;
        Ok(Greeting { methods })
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Server method selection
pub async fn write_method_selection<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: u8,
) -> Result<()> {
    writer.write_all(&[SOCKS5_VERSION, method]).await?;
    Ok(())
}

/// CONNECT/BIND/UDP request with its target address
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub target: NetAddress,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 3];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::framing(format!(
                "unsupported SOCKS version {:#04x}",
                head[0]
            )));
        }
        let command = Command::try_from(head[1])?;
        // head[2] is the reserved byte
        let target = NetAddress::read_from(reader).await?;

        Ok(Request { command, target })
    }
}

/// Server reply carrying a reply code and the bound address
pub struct Reply {
    pub code: u8,
    pub bound: NetAddress,
}

impl Reply {
    pub fn success(bound: NetAddress) -> Self {
        Reply {
            code: REP_SUCCEEDED,
            bound,
        }
    }

    pub fn failure(code: u8) -> Self {
        Reply {
            code,
            bound: NetAddress::Ipv4(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.bound.encoded_len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.code, 0x00]);
        buf.extend_from_slice(&self.bound.to_bytes());
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// RFC 1929 username/password subnegotiation
pub struct UserPassAuth {
    pub username: String,
    pub password: String,
}

impl UserPassAuth {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).await?;
        if version[0] != 0x01 {
            return Err(Error::framing("unsupported auth subnegotiation version"));
        }

        let mut ulen = [0u8; 1];
        reader.read_exact(&mut ulen).await?;
        let mut username = vec![0u8; ulen[0] as usize];
        reader.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        reader.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        reader.read_exact(&mut password).await?;

        Ok(UserPassAuth {
            username: String::from_utf8_lossy(&username).to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
        })
    }

    pub async fn write_result<W: AsyncWrite + Unpin>(writer: &mut W, ok: bool) -> Result<()> {
        writer.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(u8::from(Command::UdpAssociate), 0x03);
        assert!(matches!(
            Command::try_from(0x04),
            Err(Error::UnsupportedCommand(0x04))
        ));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let target = NetAddress::host_port("127.0.0.1", 80).unwrap();
        let mut bytes = vec![SOCKS5_VERSION, 0x01, 0x00];
        bytes.extend_from_slice(&target.to_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes)
            .await
            .unwrap();

        let req = Request::read_from(&mut server).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.target, target);
    }

    #[tokio::test]
    async fn test_reply_encoding() {
        let (mut a, mut b) = tokio::io::duplex(64);
        Reply::success(NetAddress::host_port("127.0.0.1", 1080).unwrap())
            .write_to(&mut a)
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), 1080);
    }
}
