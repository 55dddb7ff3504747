//! ALFA Docs Vault - AEAD Primitives
//!
//! AES-256-GCM for document content, XChaCha20-Poly1305 for key wrapping
//! and as an alternative content suite.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::keys::KEY_LEN;
use crate::error::{VaultError, VaultResult};

/// Authentication tag length for both suites
pub const TAG_LEN: usize = 16;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// Nonce length for XChaCha20
pub const XCHACHA_NONCE_LEN: usize = 24;

/// AEAD suite recorded in every blob header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherSuite {
    /// Algorithm identifier stored on disk
    pub fn id(&self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::XChaCha20Poly1305 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Self::Aes256Gcm => NONCE_LEN,
            Self::XChaCha20Poly1305 => XCHACHA_NONCE_LEN,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::XChaCha20Poly1305 => "XChaCha20-Poly1305",
        }
    }
}

/// Encrypt `plaintext` and append the tag
pub fn seal(
    suite: CipherSuite,
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    if nonce.len() != suite.nonce_len() {
        return Err(VaultError::Crypto(format!(
            "{} nonce must be {} bytes, got {}",
            suite.name(),
            suite.nonce_len(),
            nonce.len()
        )));
    }

    let payload = Payload { msg: plaintext, aad };

    let result = match suite {
        CipherSuite::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(e.to_string()))?
            .encrypt(Nonce::from_slice(nonce), payload),
        CipherSuite::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(e.to_string()))?
            .encrypt(XNonce::from_slice(nonce), payload),
    };

    result.map_err(|_| VaultError::Crypto(format!("{} encryption failed", suite.name())))
}

/// Verify the tag and decrypt. Tag failure is reported as `AuthenticationFailed`.
pub fn open(
    suite: CipherSuite,
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> VaultResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != suite.nonce_len() {
        return Err(VaultError::MalformedBlob("nonce length does not match suite".into()));
    }
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::MalformedBlob("ciphertext shorter than tag".into()));
    }

    let payload = Payload { msg: ciphertext, aad };

    let result = match suite {
        CipherSuite::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(e.to_string()))?
            .decrypt(Nonce::from_slice(nonce), payload),
        CipherSuite::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(e.to_string()))?
            .decrypt(XNonce::from_slice(nonce), payload),
    };

    result
        .map(Zeroizing::new)
        .map_err(|_| VaultError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{fill_random, generate_key};

    fn nonce_for(suite: CipherSuite) -> Vec<u8> {
        let mut nonce = vec![0u8; suite.nonce_len()];
        fill_random(&mut nonce);
        nonce
    }

    #[test]
    fn test_both_suites_roundtrip() {
        for suite in [CipherSuite::Aes256Gcm, CipherSuite::XChaCha20Poly1305] {
            let key = generate_key();
            let nonce = nonce_for(suite);

            let sealed = seal(suite, &key, &nonce, b"tax return 2025", b"doc-1").unwrap();
            assert_eq!(sealed.len(), b"tax return 2025".len() + TAG_LEN);

            let opened = open(suite, &key, &nonce, &sealed, b"doc-1").unwrap();
            assert_eq!(opened.as_slice(), b"tax return 2025");
        }
    }

    #[test]
    fn test_wrong_aad_fails_closed() {
        let key = generate_key();
        let nonce = nonce_for(CipherSuite::Aes256Gcm);
        let sealed = seal(CipherSuite::Aes256Gcm, &key, &nonce, b"passport scan", b"doc-1").unwrap();

        let result = open(CipherSuite::Aes256Gcm, &key, &nonce, &sealed, b"doc-2");
        assert!(matches!(result, Err(VaultError::AuthenticationFailed)));
    }

    #[test]
    fn test_suite_ids_are_stable() {
        assert_eq!(CipherSuite::from_id(1), Some(CipherSuite::Aes256Gcm));
        assert_eq!(CipherSuite::from_id(2), Some(CipherSuite::XChaCha20Poly1305));
        assert_eq!(CipherSuite::from_id(9), None);
    }
}
