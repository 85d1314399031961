//! Trojan outbound protocol
//!
//! After TLS is up the client writes the hex SHA-224 of its password,
//! CRLF, the connect command with a SOCKS-style target, CRLF, then the
//! connection is a transparent byte pipe.

use super::{connect_server, DialResult, OutboundProxy, ProxyType, HANDSHAKE_TIMEOUT};
use crate::common::NetAddress;
use crate::config::PolicyConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use sha2::{Digest, Sha224};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

const CMD_CONNECT: u8 = 0x01;

pub struct Trojan {
    name: String,
    server: String,
    port: u16,
    password_hash: String,
    sni: Option<String>,
    skip_cert_verify: bool,
}

impl Trojan {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        password: &str,
        sni: Option<String>,
        skip_cert_verify: bool,
    ) -> Result<Self> {
        Ok(Trojan {
            name,
            server,
            port,
            password_hash: hash_password(password),
            sni,
            skip_cert_verify,
        })
    }

    pub fn from_policy(policy: &PolicyConfig) -> Result<Self> {
        Trojan::new(
            policy.name.clone(),
            policy.address.clone(),
            policy.port,
            policy.password.as_deref().unwrap_or_default(),
            policy.sni.clone(),
            policy.skip_cert_verify,
        )
    }

    fn build_header(&self, target: &NetAddress) -> Vec<u8> {
        let mut header = BytesMut::with_capacity(56 + 2 + 1 + target.encoded_len() + 2);
        header.put_slice(self.password_hash.as_bytes());
        header.put_slice(b"\r\n");
        header.put_u8(CMD_CONNECT);
        header.put_slice(&target.to_bytes());
        header.put_slice(b"\r\n");
        header.to_vec()
    }

    fn tls_config(&self) -> ClientConfig {
        if self.skip_cert_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    }
}

/// Lowercase hex SHA-224 (56 ASCII characters).
fn hash_password(password: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl OutboundProxy for Trojan {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Trojan
    }

    async fn dial_tcp(&self, target: &NetAddress) -> Result<DialResult> {
        debug!(
            "[{}] Trojan connecting to {} via {}:{}",
            self.name, target, self.server, self.port
        );
        let stream = connect_server(&self.server, self.port).await?;
        let local = stream.local_addr().ok();

        let sni = self.sni.as_deref().unwrap_or(&self.server);
        let server_name: ServerName<'static> = ServerName::try_from(sni.to_string())
            .map_err(|_| Error::tls(format!("invalid SNI {}", sni)))?;

        let connector = TlsConnector::from(Arc::new(self.tls_config()));
        let mut tls_stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| Error::timeout("TLS handshake timed out"))?
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

        tls_stream.write_all(&self.build_header(target)).await?;

        debug!("[{}] tunnel to {} established", self.name, target);
        Ok(DialResult::new(Box::new(tls_stream), local))
    }
}

#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_56_hex() {
        let hash = hash_password("secret");
        assert_eq!(hash.len(), 56);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
        // SHA-224("secret")
        assert_eq!(
            hash,
            "95c7fbca92ac5083afda62a564a3d014fc3b72c9140e3cb99ea6bf12"
        );
    }

    #[test]
    fn test_header_layout() {
        let trojan = Trojan::new(
            "t".into(),
            "server".into(),
            443,
            "secret",
            None,
            false,
        )
        .unwrap();
        let target = NetAddress::host_port("example.com", 80).unwrap();
        let header = trojan.build_header(&target);

        // hex password line
        assert_eq!(&header[..56], hash_password("secret").as_bytes());
        assert_eq!(&header[56..58], b"\r\n");
        // command + SOCKS-style address
        assert_eq!(header[58], CMD_CONNECT);
        assert_eq!(&header[59..59 + target.encoded_len()], &target.to_bytes()[..]);
        // trailing CRLF
        assert_eq!(&header[header.len() - 2..], b"\r\n");
    }
}
