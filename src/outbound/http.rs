//! HTTP CONNECT outbound
//!
//! Drives the sans-io CONNECT handler over the upstream socket until the
//! tunnel is confirmed, then hands the raw stream over for relaying. Any
//! payload the proxy sent past its response headers is preserved and
//! replayed before socket reads.

use super::{connect_server, DialResult, OutboundProxy, ProxyType, HANDSHAKE_TIMEOUT};
use crate::common::NetAddress;
use crate::config::PolicyConfig;
use crate::pipeline::http_connect::HttpConnectHandler;
use crate::pipeline::Pipeline;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub struct HttpProxy {
    name: String,
    server: String,
    port: u16,
}

impl HttpProxy {
    pub fn new(name: String, server: String, port: u16) -> Self {
        HttpProxy { name, server, port }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Result<Self> {
        Ok(HttpProxy::new(
            policy.name.clone(),
            policy.address.clone(),
            policy.port,
        ))
    }

    async fn establish(&self, stream: &mut TcpStream, target: &NetAddress) -> Result<Vec<u8>> {
        let mut pipeline = Pipeline::new();
        pipeline.push(Box::new(HttpConnectHandler::new(
            target.host(),
            target.port(),
        )));

        let request = pipeline.activate()?;
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut buf = [0u8; 2048];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::connection("proxy closed during CONNECT"));
            }
            let (early, wire) = pipeline.read(&buf[..n])?;
            if !wire.is_empty() {
                stream.write_all(&wire).await?;
            }
            if pipeline.is_empty() {
                // Handshake handler removed itself: tunnel is up
                return Ok(early);
            }
        }
    }
}

#[async_trait]
impl OutboundProxy for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http
    }

    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult> {
        debug!(
            "[{}] HTTP CONNECT to {} via {}:{}",
            self.name, target, self.server, self.port
        );
        let mut stream = connect_server(&self.server, self.port).await?;
        let local = stream.local_addr().ok();
        let early = timeout(HANDSHAKE_TIMEOUT, self.establish(&mut stream, target))
            .await
            .map_err(|_| Error::timeout("CONNECT handshake timed out"))??;

        debug!("[{}] tunnel to {} established", self.name, target);
        if early.is_empty() {
            Ok(DialResult::new(Box::new(stream), local))
        } else {
            Ok(DialResult::new(
                Box::new(EarlyDataStream::new(stream, early)),
                local,
            ))
        }
    }
}

/// Stream wrapper replaying bytes received during the handshake.
pub struct EarlyDataStream<S> {
    inner: S,
    early: BytesMut,
}

impl<S> EarlyDataStream<S> {
    pub fn new(inner: S, early: Vec<u8>) -> Self {
        EarlyDataStream {
            inner,
            early: BytesMut::from(&early[..]),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for EarlyDataStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.early.is_empty() {
            let n = std::cmp::min(buf.remaining(), self.early.len());
            buf.put_slice(&self.early.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EarlyDataStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_early_data_replayed_first() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b" world").await.unwrap();
        });

        let mut stream = EarlyDataStream::new(client, b"hello".to_vec());
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }
}
