//! Pluggable symmetric cipher abstraction
//!
//! One `Algorithm` value carries every size constant a protocol adapter
//! needs (key, salt, nonce, tag), so framing code never hard-codes them.

use crate::{Error, Result};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use std::fmt;

/// Supported symmetric algorithms.
///
/// The AEAD variants are the Shadowsocks stream ciphers; the raw stream
/// variants exist for legacy helpers and are keystream-XOR only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305Ietf,
    XChaCha20Poly1305Ietf,
    // Raw stream ciphers (no authentication)
    Salsa20,
    ChaCha20,
    ChaCha20Ietf,
    XChaCha20,
}

impl Algorithm {
    pub fn key_size(&self) -> usize {
        match self {
            Algorithm::Aes128Gcm => 16,
            _ => 32,
        }
    }

    /// Shadowsocks session salt size: 16 bytes for 128-bit keys, 32 for
    /// 256-bit keys.
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            Algorithm::Aes128Gcm
            | Algorithm::Aes256Gcm
            | Algorithm::ChaCha20Poly1305Ietf
            | Algorithm::ChaCha20Ietf => 12,
            Algorithm::XChaCha20Poly1305Ietf | Algorithm::XChaCha20 => 24,
            Algorithm::Salsa20 | Algorithm::ChaCha20 => 8,
        }
    }

    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Algorithm::Aes128Gcm
                | Algorithm::Aes256Gcm
                | Algorithm::ChaCha20Poly1305Ietf
                | Algorithm::XChaCha20Poly1305Ietf
        )
    }
}

impl TryFrom<&str> for Algorithm {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(Algorithm::Aes128Gcm),
            "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305-ietf" | "chacha20-ietf-poly1305" | "chacha20-poly1305" => {
                Ok(Algorithm::ChaCha20Poly1305Ietf)
            }
            "xchacha20-poly1305-ietf" | "xchacha20-ietf-poly1305" => {
                Ok(Algorithm::XChaCha20Poly1305Ietf)
            }
            "salsa20" => Ok(Algorithm::Salsa20),
            "chacha20" => Ok(Algorithm::ChaCha20),
            "chacha20-ietf" => Ok(Algorithm::ChaCha20Ietf),
            "xchacha20" => Ok(Algorithm::XChaCha20),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Aes128Gcm => "aes-128-gcm",
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305Ietf => "chacha20-poly1305-ietf",
            Algorithm::XChaCha20Poly1305Ietf => "xchacha20-poly1305-ietf",
            Algorithm::Salsa20 => "salsa20",
            Algorithm::ChaCha20 => "chacha20",
            Algorithm::ChaCha20Ietf => "chacha20-ietf",
            Algorithm::XChaCha20 => "xchacha20",
        };
        f.write_str(name)
    }
}

/// Owned key material, zeroed when dropped.
pub struct SymmetricKey {
    bytes: Vec<u8>,
}

impl SymmetricKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        SymmetricKey { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        SymmetricKey {
            bytes: bytes.to_vec(),
        }
    }

    pub fn bit_length(&self) -> usize {
        self.bytes.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        for byte in self.bytes.iter_mut() {
            // volatile store so the wipe is not optimized away
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({} bits)", self.bit_length())
    }
}

fn check_sizes(alg: Algorithm, key: &[u8], nonce: &[u8]) -> Result<()> {
    if key.len() != alg.key_size() {
        return Err(Error::crypto(format!(
            "{} expects a {}-byte key, got {}",
            alg,
            alg.key_size(),
            key.len()
        )));
    }
    if nonce.len() != alg.nonce_size() {
        return Err(Error::crypto(format!(
            "{} expects a {}-byte nonce, got {}",
            alg,
            alg.nonce_size(),
            nonce.len()
        )));
    }
    Ok(())
}

/// AEAD encrypt: returns ciphertext with the tag appended.
pub fn aead_seal(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    check_sizes(alg, key, nonce)?;
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let sealed = match alg {
        Algorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .encrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .encrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::ChaCha20Poly1305Ietf => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .encrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::XChaCha20Poly1305Ietf => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .encrypt(GenericArray::from_slice(nonce), payload),
        other => return Err(Error::UnsupportedAlgorithm(format!("{} is not an AEAD", other))),
    };
    sealed.map_err(|e| Error::crypto(e.to_string()))
}

/// AEAD decrypt: expects ciphertext with the tag appended.
///
/// Fails with `AuthenticationFailed` on any tag mismatch.
pub fn aead_open(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    check_sizes(alg, key, nonce)?;
    if ciphertext.len() < alg.tag_size() {
        return Err(Error::framing("ciphertext shorter than the tag"));
    }
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let opened = match alg {
        Algorithm::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .decrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .decrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::ChaCha20Poly1305Ietf => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .decrypt(GenericArray::from_slice(nonce), payload),
        Algorithm::XChaCha20Poly1305Ietf => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::crypto(e.to_string()))?
            .decrypt(GenericArray::from_slice(nonce), payload),
        other => return Err(Error::UnsupportedAlgorithm(format!("{} is not an AEAD", other))),
    };
    opened.map_err(|_| Error::auth("AEAD tag mismatch"))
}

/// Keystream XOR for the raw stream variants. Applying it twice with the
/// same parameters restores the input.
pub fn stream_xor(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8],
    initial_counter: u32,
    data: &mut [u8],
) -> Result<()> {
    check_sizes(alg, key, nonce)?;
    // All four keystreams use 64-byte blocks.
    let seek_pos = initial_counter as u64 * 64;
    match alg {
        Algorithm::Salsa20 => {
            let mut cipher = salsa20::Salsa20::new_from_slices(key, nonce)
                .map_err(|e| Error::crypto(e.to_string()))?;
            cipher.seek(seek_pos);
            cipher.apply_keystream(data);
        }
        Algorithm::ChaCha20 => {
            let mut cipher = chacha20::ChaCha20Legacy::new_from_slices(key, nonce)
                .map_err(|e| Error::crypto(e.to_string()))?;
            cipher.seek(seek_pos);
            cipher.apply_keystream(data);
        }
        Algorithm::ChaCha20Ietf => {
            let mut cipher = chacha20::ChaCha20::new_from_slices(key, nonce)
                .map_err(|e| Error::crypto(e.to_string()))?;
            cipher.seek(seek_pos);
            cipher.apply_keystream(data);
        }
        Algorithm::XChaCha20 => {
            let mut cipher = chacha20::XChaCha20::new_from_slices(key, nonce)
                .map_err(|e| Error::crypto(e.to_string()))?;
            cipher.seek(seek_pos);
            cipher.apply_keystream(data);
        }
        other => {
            return Err(Error::UnsupportedAlgorithm(format!(
                "{} is not a raw stream cipher",
                other
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(Algorithm::try_from("aes-128-gcm").unwrap(), Algorithm::Aes128Gcm);
        assert_eq!(
            Algorithm::try_from("chacha20-ietf-poly1305").unwrap(),
            Algorithm::ChaCha20Poly1305Ietf
        );
        assert!(matches!(
            Algorithm::try_from("rc4-md5"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_algorithm_constants() {
        assert_eq!(Algorithm::Aes128Gcm.key_size(), 16);
        assert_eq!(Algorithm::Aes128Gcm.salt_size(), 16);
        assert_eq!(Algorithm::Aes256Gcm.salt_size(), 32);
        assert_eq!(Algorithm::XChaCha20Poly1305Ietf.nonce_size(), 24);
        assert_eq!(Algorithm::Salsa20.tag_size(), 0);
        assert!(!Algorithm::ChaCha20.is_aead());
    }

    #[test]
    fn test_aead_round_trip() {
        for alg in [
            Algorithm::Aes128Gcm,
            Algorithm::Aes256Gcm,
            Algorithm::ChaCha20Poly1305Ietf,
            Algorithm::XChaCha20Poly1305Ietf,
        ] {
            let key = vec![0x42u8; alg.key_size()];
            let nonce = vec![0x07u8; alg.nonce_size()];
            let sealed = aead_seal(alg, &key, &nonce, b"aad", b"hello world").unwrap();
            assert_eq!(sealed.len(), 11 + alg.tag_size());
            let opened = aead_open(alg, &key, &nonce, b"aad", &sealed).unwrap();
            assert_eq!(opened, b"hello world");
        }
    }

    #[test]
    fn test_aead_tamper_fails() {
        let alg = Algorithm::Aes128Gcm;
        let key = vec![1u8; 16];
        let nonce = vec![2u8; 12];
        let mut sealed = aead_seal(alg, &key, &nonce, &[], b"payload").unwrap();
        for i in 0..sealed.len() {
            sealed[i] ^= 0x01;
            let err = aead_open(alg, &key, &nonce, &[], &sealed).unwrap_err();
            assert!(matches!(err, Error::AuthenticationFailed(_)), "bit {} survived", i);
            sealed[i] ^= 0x01;
        }
    }

    #[test]
    fn test_stream_xor_reversible() {
        for alg in [
            Algorithm::Salsa20,
            Algorithm::ChaCha20,
            Algorithm::ChaCha20Ietf,
            Algorithm::XChaCha20,
        ] {
            let key = vec![9u8; alg.key_size()];
            let nonce = vec![3u8; alg.nonce_size()];
            let mut data = b"the quick brown fox".to_vec();
            stream_xor(alg, &key, &nonce, 0, &mut data).unwrap();
            assert_ne!(&data, b"the quick brown fox");
            stream_xor(alg, &key, &nonce, 0, &mut data).unwrap();
            assert_eq!(&data, b"the quick brown fox");
        }
    }

    #[test]
    fn test_symmetric_key() {
        let key = SymmetricKey::from_slice(&[1u8; 16]);
        assert_eq!(key.bit_length(), 128);
        assert_eq!(key.as_bytes().len(), 16);
    }
}
