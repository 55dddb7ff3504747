//! ALFA Docs Vault - Cryptographic Core
//!
//! Key material, AEAD primitives and the secure key store boundary.

pub mod keys;
pub mod aead;
pub mod keystore;

pub use keys::*;
pub use aead::*;
pub use keystore::*;

/// Serde helper: byte vectors as standard base64 strings
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
