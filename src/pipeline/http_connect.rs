//! HTTP CONNECT client handler
//!
//! Emits the CONNECT request when the pipeline goes active, parses the
//! proxy's response up to the first blank line, and buffers all
//! application writes until the tunnel is confirmed. On a 2xx status the
//! FIFO is flushed verbatim and the handler removes itself from the
//! chain; any bytes past the header end are surfaced as early inbound
//! payload.

use super::{DuplexHandler, HandlerAction, HandlerOutput};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;

const MAX_RESPONSE_HEADER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Setup,
    Preparing,
    Ready,
}

pub struct HttpConnectHandler {
    host: String,
    port: u16,
    state: State,
    response: BytesMut,
    queued: VecDeque<Vec<u8>>,
}

impl HttpConnectHandler {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HttpConnectHandler {
            host: host.into(),
            port,
            state: State::Setup,
            response: BytesMut::new(),
            queued: VecDeque::new(),
        }
    }

    fn request(&self) -> String {
        format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n",
            host = self.host,
            port = self.port,
        )
    }

    fn parse_status(header: &[u8]) -> Result<u16> {
        let text = std::str::from_utf8(header)
            .map_err(|_| Error::framing("CONNECT response is not valid UTF-8"))?;
        let status_line = text.lines().next().unwrap_or("");
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/") {
            return Err(Error::framing("CONNECT response missing HTTP status line"));
        }
        parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::framing("CONNECT response missing status code"))
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

impl DuplexHandler for HttpConnectHandler {
    fn on_active(&mut self, out: &mut HandlerOutput) -> Result<HandlerAction> {
        out.outbound.put_slice(self.request().as_bytes());
        self.state = State::Preparing;
        Ok(HandlerAction::Continue)
    }

    fn on_read(&mut self, data: &[u8], out: &mut HandlerOutput) -> Result<HandlerAction> {
        if self.state == State::Ready {
            out.inbound.put_slice(data);
            return Ok(HandlerAction::Continue);
        }

        self.response.put_slice(data);
        if self.response.len() > MAX_RESPONSE_HEADER {
            return Err(Error::framing("CONNECT response headers too large"));
        }

        let Some(end) = find_header_end(&self.response) else {
            return Ok(HandlerAction::Continue);
        };

        let code = Self::parse_status(&self.response[..end])?;
        if !(200..300).contains(&code) {
            return Err(Error::UpstreamRejected(code));
        }

        self.state = State::Ready;

        // Early payload past the blank line belongs to the tunnel
        let trailing = self.response.split_off(end);
        if !trailing.is_empty() {
            out.inbound.put_slice(&trailing);
        }

        // Flush queued writes in submission order, then leave the chain
        for chunk in self.queued.drain(..) {
            out.outbound.put_slice(&chunk);
        }
        Ok(HandlerAction::Remove)
    }

    fn on_write(&mut self, data: &[u8], out: &mut HandlerOutput) -> Result<HandlerAction> {
        match self.state {
            State::Ready => {
                out.outbound.put_slice(data);
            }
            _ => {
                self.queued.push_back(data.to_vec());
            }
        }
        Ok(HandlerAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn pipeline() -> Pipeline {
        let mut p = Pipeline::new();
        p.push(Box::new(HttpConnectHandler::new("example.com", 443)));
        p
    }

    #[test]
    fn test_connect_request_shape() {
        let mut p = pipeline();
        let wire = p.activate().unwrap();
        assert_eq!(
            wire,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Connection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn test_writes_buffered_until_200_then_fifo() {
        let mut p = pipeline();
        let _ = p.activate().unwrap();

        assert!(p.write(b"GET / HTT").unwrap().is_empty());
        assert!(p.write(b"P/1.1\r\n").unwrap().is_empty());
        assert!(p.write(b"\r\n").unwrap().is_empty());

        let (payload, wire) = p.read(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap();
        assert!(payload.is_empty());
        assert_eq!(wire, b"GET / HTTP/1.1\r\n\r\n");
        assert!(p.is_empty());

        // After removal the next write goes straight to the wire
        assert_eq!(p.write(b"more").unwrap(), b"more");
    }

    #[test]
    fn test_split_response_and_early_payload() {
        let mut p = pipeline();
        let _ = p.activate().unwrap();
        p.write(b"queued").unwrap();

        let (payload, wire) = p.read(b"HTTP/1.1 200 OK\r\nSer").unwrap();
        assert!(payload.is_empty() && wire.is_empty());

        let (payload, wire) = p.read(b"ver: x\r\n\r\nearly-bytes").unwrap();
        assert_eq!(payload, b"early-bytes");
        assert_eq!(wire, b"queued");
    }

    #[test]
    fn test_non_2xx_rejected() {
        let mut p = pipeline();
        let _ = p.activate().unwrap();
        let err = p
            .read(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamRejected(403)));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            HttpConnectHandler::parse_status(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(),
            200
        );
        assert_eq!(
            HttpConnectHandler::parse_status(b"HTTP/1.0 502 Bad Gateway\r\n\r\n").unwrap(),
            502
        );
        assert!(HttpConnectHandler::parse_status(b"garbage\r\n\r\n").is_err());
    }
}
