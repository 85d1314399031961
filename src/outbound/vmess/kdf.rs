//! VMESS recursive key derivation
//!
//! The header AEAD keys come from a chain of HMAC-SHA256 functions: the
//! innermost is keyed with the fixed KDF label, and every path component
//! wraps the chain in another HMAC keyed with that component. The final
//! function digests the command key.

use sha2::{Digest, Sha256};

const KDF_LABEL: &[u8] = b"VMess AEAD KDF";

pub const LABEL_HEADER_LEN_KEY: &[u8] = b"VMess Header AEAD Key_Length";
pub const LABEL_HEADER_LEN_NONCE: &[u8] = b"VMess Header AEAD Nonce_Length";
pub const LABEL_HEADER_KEY: &[u8] = b"VMess Header AEAD Key";
pub const LABEL_HEADER_NONCE: &[u8] = b"VMess Header AEAD Nonce";
pub const LABEL_RESP_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub const LABEL_RESP_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
pub const LABEL_RESP_KEY: &[u8] = b"AEAD Resp Header Key";
pub const LABEL_RESP_IV: &[u8] = b"AEAD Resp Header IV";

const BLOCK_SIZE: usize = 64;

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash `data` with the chain described by `labels`.
///
/// `labels[0]` keys the innermost HMAC; the last label keys the
/// outermost. An empty chain is plain SHA-256.
fn chain_hash(labels: &[&[u8]], data: &[u8]) -> [u8; 32] {
    let Some((key, inner)) = labels.split_last() else {
        return sha256(data);
    };

    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        let digest = chain_hash(inner, key);
        block[..32].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= block[i];
        opad[i] ^= block[i];
    }

    let mut inner_input = Vec::with_capacity(BLOCK_SIZE + data.len());
    inner_input.extend_from_slice(&ipad);
    inner_input.extend_from_slice(data);
    let inner_digest = chain_hash(inner, &inner_input);

    let mut outer_input = Vec::with_capacity(BLOCK_SIZE + 32);
    outer_input.extend_from_slice(&opad);
    outer_input.extend_from_slice(&inner_digest);
    chain_hash(inner, &outer_input)
}

/// Full 32-byte derivation over `key` with the given path.
pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
    let mut labels: Vec<&[u8]> = Vec::with_capacity(path.len() + 1);
    labels.push(KDF_LABEL);
    labels.extend_from_slice(path);
    chain_hash(&labels, key)
}

/// First 16 bytes of the derivation (AES-128 keys).
pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let full = kdf(key, path);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

/// First 12 bytes of the derivation (GCM nonces).
pub fn kdf12(key: &[u8], path: &[&[u8]]) -> [u8; 12] {
    let full = kdf(key, path);
    let mut out = [0u8; 12];
    out.copy_from_slice(&full[..12]);
    out
}
