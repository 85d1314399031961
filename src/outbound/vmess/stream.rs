//! VMESS body framing
//!
//! Each direction frames payload as a SHAKE128-masked big-endian length
//! word followed by the AEAD ciphertext. The AEAD nonce is the chunk
//! counter (big-endian u16) followed by bytes 2..12 of the direction IV;
//! the counter fails fast instead of wrapping. A masked length of zero
//! ends the stream. The client-to-server mask stream is seeded with the
//! request IV, the reverse with the response IV.

use super::header::{
    self, SECURITY_AES_128_GCM, SECURITY_CHACHA20_POLY1305, SECURITY_NONE,
};
use crate::crypto::{aead_open, aead_seal, Algorithm, Shake128Stream};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Cap on the chunk length word (ciphertext plus padding).
pub const MAX_CHUNK: usize = 16384;

/// Upper bound on per-chunk padding drawn from the padding stream.
const MAX_PADDING: usize = 64;

/// Body security negotiated in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySecurity {
    Aes128Gcm,
    ChaCha20Poly1305,
    None,
}

impl BodySecurity {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "auto" | "aes-128-gcm" => Ok(BodySecurity::Aes128Gcm),
            "chacha20-poly1305" => Ok(BodySecurity::ChaCha20Poly1305),
            "none" => Ok(BodySecurity::None),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            BodySecurity::Aes128Gcm => SECURITY_AES_128_GCM,
            BodySecurity::ChaCha20Poly1305 => SECURITY_CHACHA20_POLY1305,
            BodySecurity::None => SECURITY_NONE,
        }
    }

    pub fn overhead(&self) -> usize {
        match self {
            BodySecurity::None => 0,
            _ => 16,
        }
    }

    fn algorithm(&self) -> Option<Algorithm> {
        match self {
            BodySecurity::Aes128Gcm => Some(Algorithm::Aes128Gcm),
            BodySecurity::ChaCha20Poly1305 => Some(Algorithm::ChaCha20Poly1305Ietf),
            BodySecurity::None => None,
        }
    }
}

/// ChaCha20-Poly1305 body key: MD5(k) || MD5(MD5(k)).
pub fn chacha_body_key(key: &[u8; 16]) -> [u8; 32] {
    let first: [u8; 16] = Md5::digest(key).into();
    let second: [u8; 16] = Md5::digest(first).into();
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&first);
    out[16..].copy_from_slice(&second);
    out
}

/// One direction of the body framing.
pub(crate) struct BodyCipher {
    security: BodySecurity,
    key: Vec<u8>,
    iv: [u8; 16],
    count: u32,
    mask: Shake128Stream,
    padding: Option<Shake128Stream>,
}

impl BodyCipher {
    fn new(security: BodySecurity, key: &[u8; 16], iv: &[u8; 16], global_padding: bool) -> Self {
        let key = match security {
            BodySecurity::ChaCha20Poly1305 => chacha_body_key(key).to_vec(),
            _ => key.to_vec(),
        };
        BodyCipher {
            security,
            key,
            iv: *iv,
            count: 0,
            mask: Shake128Stream::seeded(iv),
            padding: global_padding.then(|| Shake128Stream::seeded(iv)),
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        if self.count > u16::MAX as u32 {
            return Err(Error::exhausted("chunk counter would wrap"));
        }
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&(self.count as u16).to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv[2..12]);
        self.count += 1;
        Ok(nonce)
    }

    fn next_padding(&mut self) -> usize {
        match &mut self.padding {
            Some(stream) => (stream.next_u16() as usize) % MAX_PADDING,
            None => 0,
        }
    }

    fn max_payload(&self) -> usize {
        MAX_CHUNK - self.security.overhead() - MAX_PADDING
    }

    /// Frame one payload chunk. An empty payload is legal and still
    /// carries a tag; end-of-stream is signaled separately.
    fn seal_chunk(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.max_payload() {
            return Err(Error::exhausted(format!(
                "chunk payload {} exceeds {}",
                payload.len(),
                self.max_payload()
            )));
        }

        let pad_len = self.next_padding();
        let ciphertext = match self.security.algorithm() {
            Some(alg) => {
                let nonce = self.next_nonce()?;
                aead_seal(alg, &self.key, &nonce, &[], payload)?
            }
            None => payload.to_vec(),
        };

        let total = ciphertext.len() + pad_len;
        let masked = (total as u16) ^ self.mask.next_u16();

        let mut chunk = Vec::with_capacity(2 + total);
        chunk.extend_from_slice(&masked.to_be_bytes());
        chunk.extend_from_slice(&ciphertext);
        if pad_len > 0 {
            let mut pad = vec![0u8; pad_len];
            getrandom::getrandom(&mut pad).map_err(|e| Error::crypto(e.to_string()))?;
            chunk.extend_from_slice(&pad);
        }
        Ok(chunk)
    }

    /// The end-of-stream marker: a masked zero length and nothing else.
    fn seal_eof(&mut self) -> Vec<u8> {
        let masked = 0u16 ^ self.mask.next_u16();
        masked.to_be_bytes().to_vec()
    }

    /// Unmask a length word; `None` is end-of-stream. Also draws this
    /// chunk's padding length so both sides stay in step.
    fn open_length(&mut self, word: [u8; 2]) -> Result<Option<(usize, usize)>> {
        let total = (u16::from_be_bytes(word) ^ self.mask.next_u16()) as usize;
        if total == 0 {
            return Ok(None);
        }
        if total > MAX_CHUNK {
            return Err(Error::exhausted(format!(
                "peer announced {} byte chunk",
                total
            )));
        }
        let pad_len = self.next_padding();
        let data_len = total
            .checked_sub(pad_len)
            .ok_or_else(|| Error::framing("chunk shorter than its padding"))?;
        if data_len < self.security.overhead() {
            return Err(Error::framing("chunk shorter than the tag"));
        }
        Ok(Some((data_len, pad_len)))
    }

    fn open_chunk(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.security.algorithm() {
            Some(alg) => {
                let nonce = self.next_nonce()?;
                aead_open(alg, &self.key, &nonce, &[], ciphertext)
            }
            None => Ok(ciphertext.to_vec()),
        }
    }
}

enum ReadState {
    RespHeaderLength,
    RespHeader(usize),
    ChunkLength,
    ChunkPayload { data_len: usize, pad_len: usize },
    Eof,
}

enum WriteState {
    Building,
    Flushing { consumed: usize, written: usize },
}

/// Client-side VMESS stream over `S`. The request header must already be
/// on the wire before the first read.
pub struct VmessStream<S> {
    stream: S,
    write_cipher: BodyCipher,
    read_cipher: BodyCipher,
    resp_auth: u8,
    resp_key: [u8; 16],
    resp_iv: [u8; 16],

    read_state: ReadState,
    read_buf: BytesMut,
    pending: BytesMut,

    write_state: WriteState,
    write_buf: BytesMut,
    eof_sent: bool,
}

impl<S> VmessStream<S> {
    pub fn new(
        stream: S,
        security: BodySecurity,
        header: &header::RequestHeader,
        global_padding: bool,
    ) -> Self {
        let (resp_key, resp_iv) = header::response_keys(&header.body_key, &header.body_iv);
        VmessStream {
            stream,
            write_cipher: BodyCipher::new(security, &header.body_key, &header.body_iv, global_padding),
            read_cipher: BodyCipher::new(security, &resp_key, &resp_iv, global_padding),
            resp_auth: header.resp_auth,
            resp_key,
            resp_iv,
            read_state: ReadState::RespHeaderLength,
            read_buf: BytesMut::with_capacity(4096),
            pending: BytesMut::new(),
            write_state: WriteState::Building,
            write_buf: BytesMut::new(),
            eof_sent: false,
        }
    }
}

fn eof_mid_frame() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame")
}

impl<S: AsyncRead + Unpin> VmessStream<S> {
    /// Accumulate wire bytes until `need` are buffered.
    /// `Ok(false)` means the peer closed before that many arrived.
    fn poll_accumulate(&mut self, cx: &mut Context<'_>, need: usize) -> Poll<io::Result<bool>> {
        while self.read_buf.len() < need {
            let mut raw = [0u8; 4096];
            let mut raw_buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut self.stream).poll_read(cx, &mut raw_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = raw_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(false));
                    }
                    self.read_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(true))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VmessStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.read_state {
                ReadState::RespHeaderLength => {
                    match this.poll_accumulate(cx, 18) {
                        Poll::Ready(Ok(true)) => {}
                        Poll::Ready(Ok(false)) => return Poll::Ready(Err(eof_mid_frame())),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let sealed = this.read_buf.split_to(18);
                    let len =
                        header::open_response_length(&this.resp_key, &this.resp_iv, &sealed)
                            .map_err(io::Error::from)?;
                    this.read_state = ReadState::RespHeader(len);
                }
                ReadState::RespHeader(len) => {
                    match this.poll_accumulate(cx, len + 16) {
                        Poll::Ready(Ok(true)) => {}
                        Poll::Ready(Ok(false)) => return Poll::Ready(Err(eof_mid_frame())),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let sealed = this.read_buf.split_to(len + 16);
                    let plain =
                        header::open_response_header(&this.resp_key, &this.resp_iv, &sealed)
                            .map_err(io::Error::from)?;
                    if plain.is_empty()
                        || plain[0].ct_eq(&this.resp_auth).unwrap_u8() == 0
                    {
                        return Poll::Ready(Err(Error::auth(
                            "response auth byte mismatch",
                        )
                        .into()));
                    }
                    this.read_state = ReadState::ChunkLength;
                }
                ReadState::ChunkLength => {
                    match this.poll_accumulate(cx, 2) {
                        Poll::Ready(Ok(true)) => {}
                        Poll::Ready(Ok(false)) => {
                            // Peer closed at a chunk boundary: clean EOF
                            if this.read_buf.is_empty() {
                                this.read_state = ReadState::Eof;
                                continue;
                            }
                            return Poll::Ready(Err(eof_mid_frame()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let word = [this.read_buf[0], this.read_buf[1]];
                    let _ = this.read_buf.split_to(2);
                    match this.read_cipher.open_length(word).map_err(io::Error::from)? {
                        Some((data_len, pad_len)) => {
                            this.read_state = ReadState::ChunkPayload { data_len, pad_len };
                        }
                        None => {
                            this.read_state = ReadState::Eof;
                        }
                    }
                }
                ReadState::ChunkPayload { data_len, pad_len } => {
                    match this.poll_accumulate(cx, data_len + pad_len) {
                        Poll::Ready(Ok(true)) => {}
                        Poll::Ready(Ok(false)) => return Poll::Ready(Err(eof_mid_frame())),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let ciphertext = this.read_buf.split_to(data_len);
                    let _ = this.read_buf.split_to(pad_len);
                    let payload = this
                        .read_cipher
                        .open_chunk(&ciphertext)
                        .map_err(io::Error::from)?;
                    this.pending.put_slice(&payload);
                    this.read_state = ReadState::ChunkLength;
                }
                ReadState::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VmessStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        loop {
            match this.write_state {
                WriteState::Building => {
                    let consumed = std::cmp::min(buf.len(), this.write_cipher.max_payload());
                    let chunk = this
                        .write_cipher
                        .seal_chunk(&buf[..consumed])
                        .map_err(io::Error::from)?;
                    this.write_buf.put_slice(&chunk);
                    this.write_state = WriteState::Flushing {
                        consumed,
                        written: 0,
                    };
                }
                WriteState::Flushing { consumed, written } => {
                    let remaining = &this.write_buf[written..];
                    match Pin::new(&mut this.stream).poll_write(cx, remaining) {
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "failed to write chunk",
                            )));
                        }
                        Poll::Ready(Ok(n)) => {
                            if written + n >= this.write_buf.len() {
                                this.write_buf.clear();
                                this.write_state = WriteState::Building;
                                return Poll::Ready(Ok(consumed));
                            }
                            this.write_state = WriteState::Flushing {
                                consumed,
                                written: written + n,
                            };
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.eof_sent {
            let eof = this.write_cipher.seal_eof();
            match Pin::new(&mut this.stream).poll_write(cx, &eof) {
                Poll::Ready(Ok(_)) => this.eof_sent = true,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

/// Helpers for sibling-module tests that need a server-side cipher.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn body_cipher(
        security: BodySecurity,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> BodyCipher {
        BodyCipher::new(security, key, iv, false)
    }

    pub(crate) fn seal(cipher: &mut BodyCipher, payload: &[u8]) -> Result<Vec<u8>> {
        cipher.seal_chunk(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chacha_body_key_vector() {
        let input: [u8; 16] = hex::decode("96b727f438a60a07ca1f554ec689862e")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(chacha_body_key(&input)),
            "80c2c504eca628a44855d24e6a9478841d87e34a09027344ebf659d22fb2b88b"
        );
    }

    #[test]
    fn test_security_parsing() {
        assert_eq!(
            BodySecurity::from_name("auto").unwrap(),
            BodySecurity::Aes128Gcm
        );
        assert_eq!(BodySecurity::from_name("none").unwrap(), BodySecurity::None);
        assert!(BodySecurity::from_name("zero").is_err());
    }

    fn cipher_pair(security: BodySecurity, padding: bool) -> (BodyCipher, BodyCipher) {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        (
            BodyCipher::new(security, &key, &iv, padding),
            BodyCipher::new(security, &key, &iv, padding),
        )
    }

    fn open_one(cipher: &mut BodyCipher, wire: &[u8]) -> Option<Vec<u8>> {
        let word = [wire[0], wire[1]];
        match cipher.open_length(word).unwrap() {
            Some((data_len, pad_len)) => {
                let payload = cipher.open_chunk(&wire[2..2 + data_len]).unwrap();
                assert_eq!(wire.len(), 2 + data_len + pad_len);
                Some(payload)
            }
            None => None,
        }
    }

    #[test]
    fn test_chunk_round_trip_all_securities() {
        for security in [
            BodySecurity::Aes128Gcm,
            BodySecurity::ChaCha20Poly1305,
            BodySecurity::None,
        ] {
            let (mut tx, mut rx) = cipher_pair(security, false);
            for payload in [&b"hello"[..], &[0u8; 8192][..], &b""[..]] {
                let wire = tx.seal_chunk(payload).unwrap();
                let got = open_one(&mut rx, &wire).unwrap();
                assert_eq!(got, payload);
            }
        }
    }

    #[test]
    fn test_global_padding_round_trip() {
        let (mut tx, mut rx) = cipher_pair(BodySecurity::Aes128Gcm, true);
        for payload in [&b"padded"[..], &b"chunks"[..], &b"here"[..]] {
            let wire = tx.seal_chunk(payload).unwrap();
            let got = open_one(&mut rx, &wire).unwrap();
            assert_eq!(got, payload);
        }
    }

    #[test]
    fn test_eof_marker() {
        let (mut tx, mut rx) = cipher_pair(BodySecurity::Aes128Gcm, false);
        let wire = tx.seal_chunk(b"last data").unwrap();
        assert!(open_one(&mut rx, &wire).is_some());
        let eof = tx.seal_eof();
        assert_eq!(eof.len(), 2);
        assert!(open_one(&mut rx, &eof).is_none());
    }

    #[test]
    fn test_length_mask_hides_size() {
        // Two identical payloads get different wire length words
        let (mut tx, _) = cipher_pair(BodySecurity::Aes128Gcm, false);
        let a = tx.seal_chunk(b"x").unwrap();
        let b = tx.seal_chunk(b"x").unwrap();
        assert_ne!(&a[..2], &b[..2]);
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let (mut tx, mut rx) = cipher_pair(BodySecurity::Aes128Gcm, false);
        let mut wire = tx.seal_chunk(b"secret").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let word = [wire[0], wire[1]];
        let (data_len, _) = rx.open_length(word).unwrap().unwrap();
        let err = rx.open_chunk(&wire[2..2 + data_len]).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn test_counter_exhaustion() {
        let (mut tx, _) = cipher_pair(BodySecurity::Aes128Gcm, false);
        tx.count = u16::MAX as u32 + 1;
        assert!(matches!(
            tx.seal_chunk(b"x"),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_oversized_length_word_rejected() {
        let (_, mut rx) = cipher_pair(BodySecurity::Aes128Gcm, false);
        // Forge a length word announcing more than a chunk may carry
        let mask = Shake128Stream::seeded(&[0x22u8; 16]).next_u16();
        let forged = ((MAX_CHUNK as u16 + 1) ^ mask).to_be_bytes();
        let err = rx.open_length(forged).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }
}
