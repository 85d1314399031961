//! Network utilities

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_reuse_address(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Copy data between two streams bidirectionally until either side closes.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (up, down) = tokio::io::copy_bidirectional(a, b).await?;
    Ok((up, down))
}

/// Read a single byte
pub async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

/// Read 2 bytes as u16 big-endian
pub async fn read_u16_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

/// Write u16 as 2 bytes big-endian
pub async fn write_u16_be<W: AsyncWrite + Unpin>(writer: &mut W, val: u16) -> Result<()> {
    writer.write_all(&val.to_be_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_u16_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(16);
        write_u16_be(&mut a, 0x1234).await.unwrap();
        assert_eq!(read_u16_be(&mut b).await.unwrap(), 0x1234);
    }
}
