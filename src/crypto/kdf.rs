//! Key derivation helpers

use crate::{Error, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

/// HKDF-SHA1 extract-and-expand (per the Shadowsocks AEAD spec).
pub fn hkdf_sha1_expand(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::crypto("HKDF output length out of range"))?;
    Ok(okm)
}

/// HMAC-SHA1 one-shot.
pub fn hmac_sha1(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

/// Derive a master key from a password using the OpenSSL EVP_BytesToKey
/// MD5 chain (compatible with original Shadowsocks).
pub fn evp_bytes_to_key(password: &str, key_size: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_size);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_size {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        prev = digest.to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_size);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evp_bytes_to_key_lengths() {
        assert_eq!(evp_bytes_to_key("test", 16).len(), 16);
        assert_eq!(evp_bytes_to_key("test", 32).len(), 32);
        // First 16 bytes are MD5(password)
        let key = evp_bytes_to_key("test", 32);
        let md5: Vec<u8> = {
            let mut h = Md5::new();
            h.update(b"test");
            h.finalize().to_vec()
        };
        assert_eq!(&key[..16], &md5[..]);
    }

    #[test]
    fn test_hkdf_sha1_deterministic() {
        let a = hkdf_sha1_expand(b"master", b"salt", b"ss-subkey", 16).unwrap();
        let b = hkdf_sha1_expand(b"master", b"salt", b"ss-subkey", 16).unwrap();
        assert_eq!(a, b);
        let c = hkdf_sha1_expand(b"master", b"other", b"ss-subkey", 16).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_hmac_sha1_rfc2202() {
        // RFC 2202 test case 2
        let out = hmac_sha1(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(out),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }
}
