//! Cryptographic primitives backing the protocol adapters
//!
//! The protocol modules only speak in terms of these contracts; the
//! concrete implementations come from the RustCrypto crates.

pub mod aes;
pub mod cipher;
pub mod kdf;
pub mod shake;

pub use cipher::{aead_open, aead_seal, stream_xor, Algorithm, SymmetricKey};
pub use shake::Shake128Stream;
