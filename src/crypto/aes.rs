//! AES-128 block helpers (ECB and CFB modes)
//!
//! ECB single-block drives the VMESS auth id; the PKCS7 multi-block
//! variants and CFB exist for the legacy header paths.

use crate::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;

fn aes128(key: &[u8]) -> Result<Aes128> {
    Aes128::new_from_slice(key).map_err(|_| Error::crypto("AES-128 expects a 16-byte key"))
}

/// Encrypt exactly one 16-byte block (no padding).
pub fn aes128_ecb_encrypt_block(key: &[u8], block: &[u8; BLOCK_SIZE]) -> Result<[u8; BLOCK_SIZE]> {
    let cipher = aes128(key)?;
    let mut out = GenericArray::from(*block);
    cipher.encrypt_block(&mut out);
    Ok(out.into())
}

/// Decrypt exactly one 16-byte block (no padding).
pub fn aes128_ecb_decrypt_block(key: &[u8], block: &[u8; BLOCK_SIZE]) -> Result<[u8; BLOCK_SIZE]> {
    let cipher = aes128(key)?;
    let mut out = GenericArray::from(*block);
    cipher.decrypt_block(&mut out);
    Ok(out.into())
}

/// ECB encrypt with PKCS7 padding (always appends at least one pad byte).
pub fn aes128_ecb_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = aes128(key)?;
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut buf = data.to_vec();
    buf.resize(data.len() + pad, pad as u8);
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(buf)
}

/// ECB decrypt and strip PKCS7 padding.
pub fn aes128_ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(Error::framing("ECB ciphertext is not block-aligned"));
    }
    let cipher = aes128(key)?;
    let mut buf = data.to_vec();
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    let pad = *buf.last().unwrap() as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > buf.len() {
        return Err(Error::framing("invalid PKCS7 padding"));
    }
    if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(Error::framing("invalid PKCS7 padding"));
    }
    buf.truncate(buf.len() - pad);
    Ok(buf)
}

/// CFB encrypt in place semantics: returns the transformed buffer.
/// 16-byte IV, no padding.
pub fn aes128_cfb_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != BLOCK_SIZE {
        return Err(Error::crypto("AES-CFB expects a 16-byte IV"));
    }
    let enc = Aes128CfbEnc::new_from_slices(key, iv)
        .map_err(|_| Error::crypto("AES-128-CFB expects a 16-byte key"))?;
    let mut buf = data.to_vec();
    enc.encrypt(&mut buf);
    Ok(buf)
}

/// CFB decrypt. 16-byte IV, no padding.
pub fn aes128_cfb_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != BLOCK_SIZE {
        return Err(Error::crypto("AES-CFB expects a 16-byte IV"));
    }
    let dec = Aes128CfbDec::new_from_slices(key, iv)
        .map_err(|_| Error::crypto("AES-128-CFB expects a 16-byte key"))?;
    let mut buf = data.to_vec();
    dec.decrypt(&mut buf);
    Ok(buf)
}
