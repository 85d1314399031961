//! VMESS request/response headers (AEAD flavor)
//!
//! The request rides in two layers: a 16-byte auth id the server can
//! check statelessly, then an AEAD-sealed header length and header whose
//! keys are derived from the command key, the auth id and an 8-byte
//! connection nonce. The inner header carries the per-session body keys
//! and ends with an FNV-1a checksum.

use super::kdf;
use crate::common::NetAddress;
use crate::crypto::aes::{aes128_ecb_decrypt_block, aes128_ecb_encrypt_block};
use crate::crypto::{aead_open, aead_seal, Algorithm};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use uuid::Uuid;

pub const VERSION: u8 = 1;

pub const OPT_CHUNK_STREAM: u8 = 0x01;
pub const OPT_CHUNK_MASKING: u8 = 0x04;
pub const OPT_GLOBAL_PADDING: u8 = 0x08;

pub const SECURITY_AES_128_GCM: u8 = 0x03;
pub const SECURITY_CHACHA20_POLY1305: u8 = 0x04;
pub const SECURITY_NONE: u8 = 0x05;

pub const COMMAND_TCP: u8 = 0x01;
pub const COMMAND_UDP: u8 = 0x02;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x02;
const ADDR_IPV6: u8 = 0x03;

const CMD_KEY_MAGIC: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";

/// Accepted clock skew for the request timestamp.
pub const TIMESTAMP_TOLERANCE_SECS: u64 = 30;

/// Derive the long-lived command key from the user id.
pub fn cmd_key(uuid: &Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.as_bytes());
    hasher.update(CMD_KEY_MAGIC);
    hasher.finalize().into()
}

/// 32-bit FNV-1a, the inner header checksum.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Plaintext request header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub body_iv: [u8; 16],
    pub body_key: [u8; 16],
    pub resp_auth: u8,
    pub options: u8,
    pub security: u8,
    pub command: u8,
    pub target: NetAddress,
    pub padding: Vec<u8>,
}

impl RequestHeader {
    /// Fresh header with random body keys, response auth byte and up to
    /// 15 bytes of random padding.
    pub fn new(security: u8, command: u8, target: NetAddress) -> Result<Self> {
        let mut random = [0u8; 34];
        getrandom::getrandom(&mut random).map_err(|e| Error::crypto(e.to_string()))?;

        let mut body_iv = [0u8; 16];
        let mut body_key = [0u8; 16];
        body_iv.copy_from_slice(&random[0..16]);
        body_key.copy_from_slice(&random[16..32]);
        let resp_auth = random[32];

        let padding_len = (random[33] & 0x0F) as usize;
        let mut padding = vec![0u8; padding_len];
        getrandom::getrandom(&mut padding).map_err(|e| Error::crypto(e.to_string()))?;

        Ok(RequestHeader {
            body_iv,
            body_key,
            resp_auth,
            options: OPT_CHUNK_STREAM | OPT_CHUNK_MASKING,
            security,
            command,
            target,
            padding,
        })
    }

    fn put_address(&self, buf: &mut BytesMut) {
        buf.put_u16(self.target.port());
        match &self.target {
            NetAddress::Ipv4(ip, _) => {
                buf.put_u8(ADDR_IPV4);
                buf.put_slice(&ip.octets());
            }
            NetAddress::Ipv6(ip, _) => {
                buf.put_u8(ADDR_IPV6);
                buf.put_slice(&ip.octets());
            }
            NetAddress::Domain(domain, _) => {
                buf.put_u8(ADDR_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
    }

    /// Serialize the inner header including the FNV-1a trailer.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.padding.len() <= 0x0F);
        let mut buf = BytesMut::with_capacity(45 + self.target.encoded_len() + self.padding.len());
        buf.put_u8(VERSION);
        buf.put_slice(&self.body_iv);
        buf.put_slice(&self.body_key);
        buf.put_u8(self.resp_auth);
        buf.put_u8(self.options);
        buf.put_u8(((self.padding.len() as u8) << 4) | self.security);
        buf.put_u8(0x00);
        buf.put_u8(self.command);
        self.put_address(&mut buf);
        buf.put_slice(&self.padding);
        let checksum = fnv1a(&buf);
        buf.put_u32(checksum);
        buf.to_vec()
    }

    /// Parse an inner header, verifying the checksum.
    pub fn decode(plain: &[u8]) -> Result<Self> {
        if plain.len() < 45 {
            return Err(Error::NeedMore);
        }
        let (body, trailer) = plain.split_at(plain.len() - 4);
        let expected = u32::from_be_bytes(trailer.try_into().unwrap());
        if fnv1a(body) != expected {
            return Err(Error::framing("request header checksum mismatch"));
        }

        if body[0] != VERSION {
            return Err(Error::framing(format!("unsupported version {}", body[0])));
        }
        let mut body_iv = [0u8; 16];
        let mut body_key = [0u8; 16];
        body_iv.copy_from_slice(&body[1..17]);
        body_key.copy_from_slice(&body[17..33]);
        let resp_auth = body[33];
        let options = body[34];
        let padding_len = (body[35] >> 4) as usize;
        let security = body[35] & 0x0F;
        // body[36] is reserved
        let command = body[37];
        let port = u16::from_be_bytes([body[38], body[39]]);

        let mut pos = 40;
        let target = match body.get(pos).copied() {
            Some(ADDR_IPV4) => {
                let octets: [u8; 4] = body
                    .get(pos + 1..pos + 5)
                    .ok_or(Error::NeedMore)?
                    .try_into()
                    .unwrap();
                pos += 5;
                NetAddress::Ipv4(octets.into(), port)
            }
            Some(ADDR_DOMAIN) => {
                let len = *body.get(pos + 1).ok_or(Error::NeedMore)? as usize;
                let raw = body.get(pos + 2..pos + 2 + len).ok_or(Error::NeedMore)?;
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| Error::address("domain is not valid UTF-8"))?;
                pos += 2 + len;
                NetAddress::Domain(domain.to_string(), port)
            }
            Some(ADDR_IPV6) => {
                let octets: [u8; 16] = body
                    .get(pos + 1..pos + 17)
                    .ok_or(Error::NeedMore)?
                    .try_into()
                    .unwrap();
                pos += 17;
                NetAddress::Ipv6(octets.into(), port)
            }
            Some(t) => return Err(Error::UnsupportedAddressType(t)),
            None => return Err(Error::NeedMore),
        };

        let padding = body
            .get(pos..pos + padding_len)
            .ok_or(Error::NeedMore)?
            .to_vec();
        if pos + padding_len != body.len() {
            return Err(Error::framing("trailing bytes after request header"));
        }

        Ok(RequestHeader {
            body_iv,
            body_key,
            resp_auth,
            options,
            security,
            command,
            target,
            padding,
        })
    }
}

fn auth_id_plain(timestamp: u64, random: [u8; 4]) -> [u8; 16] {
    let mut plain = [0u8; 16];
    plain[..8].copy_from_slice(&timestamp.to_be_bytes());
    plain[8..12].copy_from_slice(&random);
    let crc = crc32fast::hash(&plain[..12]);
    plain[12..].copy_from_slice(&crc.to_be_bytes());
    plain
}

/// Seal a request: auth id, connection nonce, AEAD length and header.
pub fn seal_request(cmd_key: &[u8; 16], inner: &[u8], timestamp: u64) -> Result<Vec<u8>> {
    let mut random = [0u8; 12];
    getrandom::getrandom(&mut random).map_err(|e| Error::crypto(e.to_string()))?;

    let auth_id = aes128_ecb_encrypt_block(
        cmd_key,
        &auth_id_plain(timestamp, random[..4].try_into().unwrap()),
    )?;
    let nonce: [u8; 8] = random[4..12].try_into().unwrap();

    let len_key = kdf::kdf16(cmd_key, &[kdf::LABEL_HEADER_LEN_KEY, &auth_id, &nonce]);
    let len_nonce = kdf::kdf12(cmd_key, &[kdf::LABEL_HEADER_LEN_NONCE, &auth_id, &nonce]);
    let sealed_len = aead_seal(
        Algorithm::Aes128Gcm,
        &len_key,
        &len_nonce,
        &auth_id,
        &(inner.len() as u16).to_be_bytes(),
    )?;

    let header_key = kdf::kdf16(cmd_key, &[kdf::LABEL_HEADER_KEY, &auth_id, &nonce]);
    let header_nonce = kdf::kdf12(cmd_key, &[kdf::LABEL_HEADER_NONCE, &auth_id, &nonce]);
    let sealed_header = aead_seal(
        Algorithm::Aes128Gcm,
        &header_key,
        &header_nonce,
        &auth_id,
        inner,
    )?;

    let mut out = Vec::with_capacity(16 + 8 + sealed_len.len() + sealed_header.len());
    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&sealed_header);
    Ok(out)
}

/// Open a sealed request (server role, used to validate our own framing).
///
/// Returns the inner header plaintext and the embedded timestamp.
pub fn open_request(cmd_key: &[u8; 16], data: &[u8], now: u64) -> Result<(Vec<u8>, u64)> {
    if data.len() < 16 + 8 + 2 + 16 {
        return Err(Error::NeedMore);
    }
    let auth_id: [u8; 16] = data[..16].try_into().unwrap();
    let plain = aes128_ecb_decrypt_block(cmd_key, &auth_id)?;

    let crc = u32::from_be_bytes(plain[12..16].try_into().unwrap());
    if crc32fast::hash(&plain[..12]) != crc {
        return Err(Error::auth("auth id checksum mismatch"));
    }
    let timestamp = u64::from_be_bytes(plain[..8].try_into().unwrap());
    if now.abs_diff(timestamp) > TIMESTAMP_TOLERANCE_SECS {
        return Err(Error::auth("request timestamp outside tolerance"));
    }

    let nonce: [u8; 8] = data[16..24].try_into().unwrap();

    let len_key = kdf::kdf16(cmd_key, &[kdf::LABEL_HEADER_LEN_KEY, &auth_id, &nonce]);
    let len_nonce = kdf::kdf12(cmd_key, &[kdf::LABEL_HEADER_LEN_NONCE, &auth_id, &nonce]);
    let length_plain = aead_open(
        Algorithm::Aes128Gcm,
        &len_key,
        &len_nonce,
        &auth_id,
        &data[24..42],
    )?;
    let header_len = u16::from_be_bytes([length_plain[0], length_plain[1]]) as usize;

    let sealed_header = data
        .get(42..42 + header_len + 16)
        .ok_or(Error::NeedMore)?;
    let header_key = kdf::kdf16(cmd_key, &[kdf::LABEL_HEADER_KEY, &auth_id, &nonce]);
    let header_nonce = kdf::kdf12(cmd_key, &[kdf::LABEL_HEADER_NONCE, &auth_id, &nonce]);
    let inner = aead_open(
        Algorithm::Aes128Gcm,
        &header_key,
        &header_nonce,
        &auth_id,
        sealed_header,
    )?;

    Ok((inner, timestamp))
}

/// Response body keys are derived from the request body keys.
pub fn response_keys(body_key: &[u8; 16], body_iv: &[u8; 16]) -> ([u8; 16], [u8; 16]) {
    use sha2::Sha256;
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&Sha256::digest(body_key)[..16]);
    iv.copy_from_slice(&Sha256::digest(body_iv)[..16]);
    (key, iv)
}

/// Seal a response header (server role, used by tests and validation).
pub fn seal_response(resp_key: &[u8; 16], resp_iv: &[u8; 16], inner: &[u8]) -> Result<Vec<u8>> {
    let len_key = kdf::kdf16(resp_key, &[kdf::LABEL_RESP_LEN_KEY]);
    let len_nonce = kdf::kdf12(resp_iv, &[kdf::LABEL_RESP_LEN_IV]);
    let sealed_len = aead_seal(
        Algorithm::Aes128Gcm,
        &len_key,
        &len_nonce,
        &[],
        &(inner.len() as u16).to_be_bytes(),
    )?;

    let key = kdf::kdf16(resp_key, &[kdf::LABEL_RESP_KEY]);
    let nonce = kdf::kdf12(resp_iv, &[kdf::LABEL_RESP_IV]);
    let sealed = aead_seal(Algorithm::Aes128Gcm, &key, &nonce, &[], inner)?;

    let mut out = Vec::with_capacity(sealed_len.len() + sealed.len());
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open the sealed response header length (first 18 bytes).
pub fn open_response_length(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    sealed: &[u8],
) -> Result<usize> {
    let len_key = kdf::kdf16(resp_key, &[kdf::LABEL_RESP_LEN_KEY]);
    let len_nonce = kdf::kdf12(resp_iv, &[kdf::LABEL_RESP_LEN_IV]);
    let plain = aead_open(Algorithm::Aes128Gcm, &len_key, &len_nonce, &[], sealed)?;
    if plain.len() < 2 {
        return Err(Error::framing("response length too short"));
    }
    Ok(u16::from_be_bytes([plain[0], plain[1]]) as usize)
}

/// Open the sealed response header payload.
pub fn open_response_header(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    let key = kdf::kdf16(resp_key, &[kdf::LABEL_RESP_KEY]);
    let nonce = kdf::kdf12(resp_iv, &[kdf::LABEL_RESP_IV]);
    aead_open(Algorithm::Aes128Gcm, &key, &nonce, &[], sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn test_cmd_key_vector() {
        let uuid = Uuid::parse_str("450bae28-b9da-67d0-16bc-4918dc8d79b5").unwrap();
        assert_eq!(
            hex::encode(cmd_key(&uuid)),
            "da8b7df4396329ebe7a74afc62a9e7c8"
        );
    }

    #[test]
    fn test_fnv1a_reference() {
        // FNV-1a of the empty input is the offset basis
        assert_eq!(fnv1a(&[]), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_inner_header_round_trip() {
        let target = NetAddress::host_port("example.com", 443).unwrap();
        let header = RequestHeader::new(SECURITY_AES_128_GCM, COMMAND_TCP, target).unwrap();
        let plain = header.encode();
        let decoded = RequestHeader::decode(&plain).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_inner_header_checksum_detects_flip() {
        let target = NetAddress::host_port("10.1.2.3", 80).unwrap();
        let header = RequestHeader::new(SECURITY_NONE, COMMAND_TCP, target).unwrap();
        let mut plain = header.encode();
        plain[3] ^= 0x40;
        assert!(RequestHeader::decode(&plain).is_err());
    }

    #[test]
    fn test_sealed_request_round_trip() {
        let uuid = Uuid::parse_str("450bae28-b9da-67d0-16bc-4918dc8d79b5").unwrap();
        let key = cmd_key(&uuid);
        let target = NetAddress::host_port("example.com", 443).unwrap();
        let header = RequestHeader::new(SECURITY_AES_128_GCM, COMMAND_TCP, target).unwrap();
        let inner = header.encode();

        let ts = now();
        let wire = seal_request(&key, &inner, ts).unwrap();
        // authID(16) + nonce(8) + sealed len(18) + sealed header
        assert_eq!(wire.len(), 16 + 8 + 18 + inner.len() + 16);

        let (opened, seen_ts) = open_request(&key, &wire, ts).unwrap();
        assert_eq!(opened, inner);
        assert_eq!(seen_ts, ts);
        assert_eq!(RequestHeader::decode(&opened).unwrap(), header);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let uuid = Uuid::new_v4();
        let key = cmd_key(&uuid);
        let target = NetAddress::host_port("example.com", 443).unwrap();
        let inner = RequestHeader::new(SECURITY_NONE, COMMAND_TCP, target)
            .unwrap()
            .encode();

        let ts = now();
        let wire = seal_request(&key, &inner, ts).unwrap();
        let err = open_request(&key, &wire, ts + TIMESTAMP_TOLERANCE_SECS + 1).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn test_wrong_cmd_key_fails() {
        let key = cmd_key(&Uuid::new_v4());
        let other = cmd_key(&Uuid::new_v4());
        let target = NetAddress::host_port("example.com", 443).unwrap();
        let inner = RequestHeader::new(SECURITY_NONE, COMMAND_TCP, target)
            .unwrap()
            .encode();
        let ts = now();
        let wire = seal_request(&key, &inner, ts).unwrap();
        assert!(open_request(&other, &wire, ts).is_err());
    }

    #[test]
    fn test_response_header_round_trip() {
        let (resp_key, resp_iv) = response_keys(&[1u8; 16], &[2u8; 16]);
        let inner = [0x42u8, 0x00, 0x00, 0x00];
        let wire = seal_response(&resp_key, &resp_iv, &inner).unwrap();

        let len = open_response_length(&resp_key, &resp_iv, &wire[..18]).unwrap();
        assert_eq!(len, 4);
        let opened = open_response_header(&resp_key, &resp_iv, &wire[18..]).unwrap();
        assert_eq!(opened, inner);
    }
}
