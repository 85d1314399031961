//! WebSocket client transport
//!
//! Carries an outbound protocol over WS framing: every application write
//! becomes one masked binary frame, inbound text/binary frames yield
//! their payload, continuation frames are dropped, a Close frame is
//! echoed and ends the stream, Ping is answered with Pong, and a
//! fragmented control frame closes the connection.

use crate::{Error, Result};
use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_FRAME_PAYLOAD: u64 = 1 << 24;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::framing(format!("unknown opcode {:#x}", other))),
        }
    }
}

impl OpCode {
    fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Parsed frame header
#[derive(Debug)]
struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    payload_len: u64,
    masking_key: Option<[u8; 4]>,
}

/// Try to parse a frame header from the front of `data`.
/// Returns the header and its encoded size, or `None` for a short buffer.
fn parse_header(data: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
    if data.len() < 2 {
        return Ok(None);
    }
    let fin = data[0] & 0x80 != 0;
    let opcode = OpCode::try_from(data[0] & 0x0F)?;
    let masked = data[1] & 0x80 != 0;
    let short_len = (data[1] & 0x7F) as u64;

    let mut pos = 2;
    let payload_len = match short_len {
        126 => {
            if data.len() < pos + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as u64;
            pos += 2;
            len
        }
        127 => {
            if data.len() < pos + 8 {
                return Ok(None);
            }
            let len = u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap());
            pos += 8;
            len
        }
        n => n,
    };

    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(Error::exhausted(format!("frame payload {}", payload_len)));
    }

    let masking_key = if masked {
        if data.len() < pos + 4 {
            return Ok(None);
        }
        let key: [u8; 4] = data[pos..pos + 4].try_into().unwrap();
        pos += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some((
        FrameHeader {
            fin,
            opcode,
            payload_len,
            masking_key,
        },
        pos,
    )))
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode one frame. Client frames carry a random mask.
fn encode_frame(opcode: OpCode, payload: &[u8], mask: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + 14);
    buf.put_u8(0x80 | opcode as u8);

    let mask_bit = if mask { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        buf.put_u8(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload.len() as u64);
    }

    if mask {
        let key: [u8; 4] = rand::random();
        buf.put_slice(&key);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key);
        buf.put_slice(&masked);
    } else {
        buf.put_slice(payload);
    }
    buf.to_vec()
}

/// WebSocket stream wrapper (client role)
pub struct WebSocketStream<S> {
    inner: S,
    read_buf: BytesMut,
    pending: BytesMut,
    /// Control frames queued for sending (pong, close echo).
    control_out: BytesMut,
    write_buf: BytesMut,
    write_consumed: usize,
    peer_closed: bool,
}

impl<S> WebSocketStream<S> {
    pub fn client(inner: S) -> Self {
        WebSocketStream {
            inner,
            read_buf: BytesMut::with_capacity(4096),
            pending: BytesMut::new(),
            control_out: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_consumed: 0,
            peer_closed: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> WebSocketStream<S> {
    /// Opportunistically flush queued control frames; pending control
    /// data is retried on the next poll.
    fn flush_control(&mut self, cx: &mut Context<'_>) {
        while !self.control_out.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.control_out) {
                Poll::Ready(Ok(n)) => {
                    let _ = self.control_out.split_to(n);
                }
                Poll::Ready(Err(_)) | Poll::Pending => break,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WebSocketStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.flush_control(cx);

        loop {
            if !this.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.peer_closed {
                return Poll::Ready(Ok(()));
            }

            // Decode as many complete frames as the buffer holds
            match parse_header(&this.read_buf).map_err(io::Error::from)? {
                Some((header, header_len))
                    if this.read_buf.len() >= header_len + header.payload_len as usize =>
                {
                    let _ = this.read_buf.split_to(header_len);
                    let mut payload =
                        this.read_buf.split_to(header.payload_len as usize).to_vec();
                    if let Some(key) = header.masking_key {
                        apply_mask(&mut payload, key);
                    }

                    if header.opcode.is_control() && !header.fin {
                        // Fragmented control frame: protocol violation
                        this.control_out
                            .put_slice(&encode_frame(OpCode::Close, &[], true));
                        this.flush_control(cx);
                        this.peer_closed = true;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "fragmented control frame",
                        )));
                    }

                    match header.opcode {
                        OpCode::Text | OpCode::Binary => {
                            this.pending.put_slice(&payload);
                        }
                        OpCode::Continuation => {
                            // Dropped: this transport never fragments
                        }
                        OpCode::Ping => {
                            this.control_out
                                .put_slice(&encode_frame(OpCode::Pong, &payload, true));
                            this.flush_control(cx);
                        }
                        OpCode::Pong => {}
                        OpCode::Close => {
                            this.control_out
                                .put_slice(&encode_frame(OpCode::Close, &payload, true));
                            this.flush_control(cx);
                            this.peer_closed = true;
                        }
                    }
                    continue;
                }
                _ => {}
            }

            // Need more wire bytes
            let mut raw = [0u8; 4096];
            let mut raw_buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut this.inner).poll_read(cx, &mut raw_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = raw_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    this.read_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WebSocketStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if this.write_buf.is_empty() {
            this.write_buf
                .put_slice(&encode_frame(OpCode::Binary, buf, true));
            this.write_consumed = buf.len();
        }

        while !this.write_buf.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write frame",
                    )));
                }
                Poll::Ready(Ok(n)) => {
                    let _ = this.write_buf.split_to(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(this.write_consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.peer_closed && this.control_out.is_empty() {
            this.control_out
                .put_slice(&encode_frame(OpCode::Close, &[], true));
        }
        this.flush_control(cx);
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Perform the WebSocket client upgrade handshake.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    path: &str,
) -> Result<()> {
    let ws_key: [u8; 16] = rand::random();
    let ws_key_b64 = base64::engine::general_purpose::STANDARD.encode(ws_key);

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, ws_key_b64
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    let mut buf = [0u8; 1];
    loop {
        stream.read_exact(&mut buf).await?;
        response.push(buf[0] as char);
        if response.ends_with("\r\n\r\n") {
            break;
        }
        if response.len() > 4096 {
            return Err(Error::framing("upgrade response too long"));
        }
    }

    if !response.starts_with("HTTP/1.1 101") {
        let status = response.lines().next().unwrap_or("").to_string();
        let code = status
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
            .unwrap_or(0);
        return Err(Error::UpstreamRejected(code));
    }

    let expected_accept = {
        let mut hasher = Sha1::new();
        hasher.update(ws_key_b64.as_bytes());
        hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    };

    let accept = response
        .lines()
        .find(|line| line.to_lowercase().starts_with("sec-websocket-accept:"))
        .and_then(|line| line.split(':').nth(1))
        .map(|v| v.trim());

    if accept != Some(&expected_accept) {
        return Err(Error::auth("Sec-WebSocket-Accept mismatch"));
    }
    Ok(())
}
