//! ALFA Docs Vault - Key Material
//!
//! Scoped document keys and HKDF derivation helpers.

use std::fmt;

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256 / XChaCha20
pub const KEY_LEN: usize = 32;

/// Salt length for per-blob subkeys
pub const SALT_LEN: usize = 32;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Wrapping key derived from a master key
    pub const WRAP: &[u8] = b"ALFA:DOCS:WRAP:v1";

    /// Per-blob subkey derived from a document key
    pub const BLOB: &[u8] = b"ALFA:DOCS:BLOB:v1";

    /// Authorization token signing
    pub const TOKEN: &[u8] = b"ALFA:DOCS:TOKEN:v1";
}

/// Unwrapped document key, valid for the lifetime of one borrow scope.
///
/// Not `Clone`. The key bytes are zeroized when the value is dropped or
/// released, whichever comes first.
pub struct ScopedKey {
    key_id: Uuid,
    inner: Secret<[u8; KEY_LEN]>,
}

impl ScopedKey {
    pub(crate) fn new(key_id: Uuid, bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key_id,
            inner: Secret::new(bytes),
        }
    }

    /// Identifier of the document key this scope exposes
    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// End the scope explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedKey")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh random 256-bit key
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut *key);
    key
}

/// Fill a buffer from the thread CSPRNG
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);

    hk.expand(info, &mut *okm)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(okm)
}
