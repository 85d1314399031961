//! Shadowsocks outbound (AEAD ciphers)
//!
//! Wire format per direction: a fresh random salt, then AEAD chunks.
//! Each chunk is the sealed big-endian payload length (<= 0x3FFF)
//! followed by the sealed payload; every seal/open advances the
//! direction's nonce counter by one, so a chunk costs two. The first
//! outbound chunk carries the SOCKS-style target address prepended to
//! the first payload bytes.

use super::{connect_server, DialResult, OutboundProxy, ProxyType};
use crate::common::NetAddress;
use crate::config::PolicyConfig;
use crate::crypto::{aead_open, aead_seal, kdf, Algorithm, SymmetricKey};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Payload bytes per chunk; the length word keeps its top two bits clear.
pub const MAX_CHUNK_PAYLOAD: usize = 0x3FFF;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Per-AEAD-call nonce: a little-endian counter occupying the low bytes,
/// never reused, failing fast instead of wrapping.
struct NonceSequence {
    counter: u64,
    size: usize,
}

impl NonceSequence {
    fn new(size: usize) -> Self {
        NonceSequence { counter: 0, size }
    }

    fn next(&mut self) -> Result<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(Error::exhausted("nonce counter would wrap"));
        }
        let mut nonce = vec![0u8; self.size];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    #[cfg(test)]
    fn count(&self) -> u64 {
        self.counter
    }
}

/// One direction of an AEAD session: salt-derived subkey plus its nonce.
struct AeadSession {
    algorithm: Algorithm,
    subkey: Vec<u8>,
    nonce: NonceSequence,
}

impl AeadSession {
    fn new(algorithm: Algorithm, master_key: &[u8], salt: &[u8]) -> Result<Self> {
        let subkey = kdf::hkdf_sha1_expand(master_key, salt, SUBKEY_INFO, algorithm.key_size())?;
        Ok(AeadSession {
            algorithm,
            subkey,
            nonce: NonceSequence::new(algorithm.nonce_size()),
        })
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce.next()?;
        aead_seal(self.algorithm, &self.subkey, &nonce, &[], plaintext)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce.next()?;
        aead_open(self.algorithm, &self.subkey, &nonce, &[], ciphertext)
    }

    /// Seal one `length || payload` chunk.
    fn seal_chunk(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_CHUNK_PAYLOAD {
            return Err(Error::exhausted(format!(
                "chunk payload {} exceeds {}",
                payload.len(),
                MAX_CHUNK_PAYLOAD
            )));
        }
        let sealed_len = self.seal(&(payload.len() as u16).to_be_bytes())?;
        let sealed_payload = self.seal(payload)?;
        let mut chunk = Vec::with_capacity(sealed_len.len() + sealed_payload.len());
        chunk.extend_from_slice(&sealed_len);
        chunk.extend_from_slice(&sealed_payload);
        Ok(chunk)
    }
}

enum ReadState {
    Salt,
    Length,
    Payload(usize),
}

/// Decoder half: buffers ciphertext and yields plaintext payloads.
/// A failed open is fatal since the stream cannot resync.
struct AeadDecoder {
    algorithm: Algorithm,
    master_key: Vec<u8>,
    session: Option<AeadSession>,
    state: ReadState,
    buf: BytesMut,
}

impl AeadDecoder {
    fn new(algorithm: Algorithm, master_key: Vec<u8>) -> Self {
        AeadDecoder {
            algorithm,
            master_key,
            session: None,
            state: ReadState::Salt,
            buf: BytesMut::with_capacity(4096),
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next payload, or `None` when more ciphertext is needed.
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::Salt => {
                    let salt_size = self.algorithm.salt_size();
                    if self.buf.len() < salt_size {
                        return Ok(None);
                    }
                    let salt = self.buf.split_to(salt_size);
                    self.session =
                        Some(AeadSession::new(self.algorithm, &self.master_key, &salt)?);
                    self.state = ReadState::Length;
                }
                ReadState::Length => {
                    let sealed_len = 2 + self.algorithm.tag_size();
                    if self.buf.len() < sealed_len {
                        return Ok(None);
                    }
                    let sealed = self.buf.split_to(sealed_len);
                    let session = self.session.as_mut().expect("salt consumed first");
                    let length_bytes = session.open(&sealed)?;
                    let length =
                        u16::from_be_bytes([length_bytes[0], length_bytes[1]]) as usize;
                    if length > MAX_CHUNK_PAYLOAD {
                        return Err(Error::exhausted(format!(
                            "peer announced {} byte chunk",
                            length
                        )));
                    }
                    self.state = ReadState::Payload(length);
                }
                ReadState::Payload(length) => {
                    let sealed_len = length + self.algorithm.tag_size();
                    if self.buf.len() < sealed_len {
                        return Ok(None);
                    }
                    let sealed = self.buf.split_to(sealed_len);
                    let session = self.session.as_mut().expect("salt consumed first");
                    let payload = session.open(&sealed)?;
                    self.state = ReadState::Length;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

/// Shadowsocks outbound policy
#[derive(Debug)]
pub struct Shadowsocks {
    name: String,
    server: String,
    port: u16,
    algorithm: Algorithm,
    key: SymmetricKey,
}

impl Shadowsocks {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        algorithm: &str,
        password: &str,
    ) -> Result<Self> {
        let algorithm = Algorithm::try_from(algorithm)?;
        if !algorithm.is_aead() {
            return Err(Error::UnsupportedAlgorithm(format!(
                "{} is not an AEAD algorithm",
                algorithm
            )));
        }
        let key = SymmetricKey::new(kdf::evp_bytes_to_key(password, algorithm.key_size()));
        Ok(Shadowsocks {
            name,
            server,
            port,
            algorithm,
            key,
        })
    }

    pub fn from_policy(policy: &PolicyConfig) -> Result<Self> {
        Shadowsocks::new(
            policy.name.clone(),
            policy.address.clone(),
            policy.port,
            policy.algorithm.as_deref().unwrap_or_default(),
            policy.password.as_deref().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl OutboundProxy for Shadowsocks {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Shadowsocks
    }

    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult> {
        debug!(
            "[{}] Shadowsocks connecting to {} via {}:{}",
            self.name, target, self.server, self.port
        );
        let stream = connect_server(&self.server, self.port).await?;
        let local = stream.local_addr().ok();
        let conn = ShadowsocksStream::client(
            stream,
            self.algorithm,
            self.key.as_bytes().to_vec(),
            target,
        )?;
        Ok(DialResult::new(Box::new(conn), local))
    }
}

/// Encrypted stream over `S`
pub struct ShadowsocksStream<S> {
    inner: S,
    sealer: AeadSession,
    decoder: AeadDecoder,
    /// Salt plus the target address header, flushed with the first write.
    head: Option<Vec<u8>>,
    pending: BytesMut,
    write_buf: BytesMut,
    write_consumed: usize,
}

impl<S> ShadowsocksStream<S> {
    /// Build the client side: picks a fresh salt and queues the target
    /// address header for the first outbound chunk.
    pub fn client(
        inner: S,
        algorithm: Algorithm,
        master_key: Vec<u8>,
        target: &NetAddress,
    ) -> Result<Self> {
        let mut salt = vec![0u8; algorithm.salt_size()];
        getrandom::getrandom(&mut salt).map_err(|e| Error::crypto(e.to_string()))?;

        let sealer = AeadSession::new(algorithm, &master_key, &salt)?;
        let decoder = AeadDecoder::new(algorithm, master_key);

        let mut head = Vec::with_capacity(salt.len() + target.encoded_len());
        head.extend_from_slice(&salt);
        head.extend_from_slice(&target.to_bytes());

        Ok(ShadowsocksStream {
            inner,
            sealer,
            decoder,
            head: Some(head),
            pending: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_consumed: 0,
        })
    }

    /// Frame one application write: salt (once), then chunks whose first
    /// payload is prefixed with the target address header.
    fn frame(&mut self, buf: &[u8]) -> Result<(Vec<u8>, usize)> {
        let mut wire = Vec::new();
        let mut consumed = 0;

        if let Some(head) = self.head.take() {
            let salt_size = self.sealer.algorithm.salt_size();
            let (salt, addr) = head.split_at(salt_size);
            wire.extend_from_slice(salt);

            // Address header and the leading payload share the first chunk
            let room = MAX_CHUNK_PAYLOAD - addr.len();
            consumed = buf.len().min(room);
            let mut first = Vec::with_capacity(addr.len() + consumed);
            first.extend_from_slice(addr);
            first.extend_from_slice(&buf[..consumed]);
            wire.extend_from_slice(&self.sealer.seal_chunk(&first)?);
        }

        for payload in buf[consumed..].chunks(MAX_CHUNK_PAYLOAD) {
            wire.extend_from_slice(&self.sealer.seal_chunk(payload)?);
            consumed += payload.len();
        }
        Ok((wire, consumed))
    }
}

impl<S: AsyncRead + Unpin + Send> AsyncRead for ShadowsocksStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), self.pending.len());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // Drain whatever the decoder already holds
            match self.decoder.next_payload() {
                Ok(Some(payload)) => {
                    self.pending.put_slice(&payload);
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }

            let mut raw = [0u8; 4096];
            let mut raw_buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut self.inner).poll_read(cx, &mut raw_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = raw_buf.filled();
                    if filled.is_empty() {
                        // EOF
                        return Poll::Ready(Ok(()));
                    }
                    self.decoder.feed(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin + Send> AsyncWrite for ShadowsocksStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_buf.is_empty() {
            let (wire, consumed) = match this.frame(buf) {
                Ok(v) => v,
                Err(e) => return Poll::Ready(Err(e.into())),
            };
            this.write_buf.put_slice(&wire);
            this.write_consumed = consumed;
        }

        while !this.write_buf.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_buf) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write chunk",
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
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair(algorithm: Algorithm) -> (AeadSession, AeadSession) {
        let key = kdf::evp_bytes_to_key("test", algorithm.key_size());
        let salt = vec![0x5au8; algorithm.salt_size()];
        (
            AeadSession::new(algorithm, &key, &salt).unwrap(),
            AeadSession::new(algorithm, &key, &salt).unwrap(),
        )
    }

    #[test]
    fn test_chunk_round_trip_advances_nonce_by_two() {
        let (mut sealer, _) = session_pair(Algorithm::Aes128Gcm);
        let key = kdf::evp_bytes_to_key("test", 16);
        let mut decoder = AeadDecoder::new(Algorithm::Aes128Gcm, key);
        decoder.feed(&vec![0x5au8; 16]); // the salt the sealer used

        for (i, payload) in [&b"hello"[..], &b"world"[..], &[0u8; 0x3FFF][..]]
            .iter()
            .enumerate()
        {
            let chunk = sealer.seal_chunk(payload).unwrap();
            decoder.feed(&chunk);
            let got = decoder.next_payload().unwrap().unwrap();
            assert_eq!(&got, payload);
            assert_eq!(sealer.nonce.count(), 2 * (i as u64 + 1));
        }
    }

    #[test]
    fn test_oversized_chunk_refused() {
        let (mut sealer, _) = session_pair(Algorithm::Aes128Gcm);
        let err = sealer.seal_chunk(&vec![0u8; MAX_CHUNK_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_tampered_chunk_fails_auth() {
        let (mut sealer, _) = session_pair(Algorithm::Aes256Gcm);
        let key = kdf::evp_bytes_to_key("test", 32);

        let chunk = sealer.seal_chunk(b"sensitive").unwrap();
        for bit in 0..chunk.len() * 8 {
            let mut tampered = chunk.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);

            let mut decoder = AeadDecoder::new(Algorithm::Aes256Gcm, key.clone());
            decoder.feed(&vec![0x5au8; 32]);
            decoder.feed(&tampered);
            let err = decoder.next_payload().unwrap_err();
            assert!(
                matches!(err, Error::AuthenticationFailed(_) | Error::ResourceExhausted(_)),
                "flipped bit {} went unnoticed",
                bit
            );
        }
    }

    #[test]
    fn test_nonce_sequence_layout() {
        let mut seq = NonceSequence::new(12);
        assert_eq!(seq.next().unwrap(), vec![0u8; 12]);
        let second = seq.next().unwrap();
        assert_eq!(second[0], 1);
        assert!(second[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_nonce_sequence_exhaustion() {
        let mut seq = NonceSequence::new(12);
        seq.counter = u64::MAX;
        assert!(matches!(seq.next(), Err(Error::ResourceExhausted(_))));
    }

    /// The S3 scenario: password "test", aes-128-gcm, payload "hello" to
    /// 127.0.0.1:80 decodes back to address header + payload.
    #[tokio::test]
    async fn test_upload_stream_decodes_to_header_and_payload() {
        let algorithm = Algorithm::Aes128Gcm;
        let key = kdf::evp_bytes_to_key("test", algorithm.key_size());
        let target = NetAddress::host_port("127.0.0.1", 80).unwrap();

        let (client_side, mut server_side) = tokio::io::duplex(8192);
        let mut stream =
            ShadowsocksStream::client(client_side, algorithm, key.clone(), &target).unwrap();

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let mut wire = Vec::new();
        server_side.read_to_end(&mut wire).await.unwrap();

        let mut decoder = AeadDecoder::new(algorithm, key);
        decoder.feed(&wire);
        let first = decoder.next_payload().unwrap().unwrap();

        let mut expected = target.to_bytes();
        expected.extend_from_slice(b"hello");
        assert_eq!(first, expected);
        assert!(decoder.next_payload().unwrap().is_none());
    }

    #[test]
    fn test_rejects_non_aead_algorithm() {
        let err = Shadowsocks::new(
            "x".into(),
            "server".into(),
            8388,
            "chacha20",
            "pw",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }
}
