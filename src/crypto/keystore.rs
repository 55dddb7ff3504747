//! ALFA Docs Vault - Secure Key Store Boundary
//!
//! Master keys never leave the store. Callers hand document keys in and get
//! wrapped bytes out (and the reverse), so wrapping happens inside the
//! store boundary. On devices with a hardware keystore the platform layer
//! implements [`SecureKeyStore`]; desktops use [`SealedFileKeyStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::aead::{open, seal, CipherSuite, TAG_LEN, XCHACHA_NONCE_LEN};
use super::keys::{contexts, derive_key, fill_random, generate_key, KEY_LEN};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::write_atomic;

/// Contract of a hardware-backed master key store
pub trait SecureKeyStore: Send + Sync {
    /// Whether the store can currently be reached
    fn is_available(&self) -> bool;

    /// Master key versions present in the store, ascending
    fn versions(&self) -> VaultResult<Vec<u32>>;

    /// Generate a new master key under `version`
    fn create_master_key(&self, version: u32) -> VaultResult<()>;

    /// Destroy the master key `version`
    fn destroy_master_key(&self, version: u32) -> VaultResult<()>;

    /// Wrap a document key under master key `version`
    fn wrap(&self, version: u32, key_id: &Uuid, dek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>>;

    /// Unwrap a document key previously wrapped under master key `version`
    fn unwrap(
        &self,
        version: u32,
        key_id: &Uuid,
        wrapped: &[u8],
    ) -> VaultResult<Zeroizing<[u8; KEY_LEN]>>;
}

/// Wrapped key layout: XChaCha20 nonce || ciphertext || tag
const WRAPPED_LEN: usize = XCHACHA_NONCE_LEN + KEY_LEN + TAG_LEN;

/// The key id and master version are bound into the AAD so wrapped bytes
/// cannot be replayed under another document or version.
fn wrap_aad(version: u32, key_id: &Uuid) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(key_id.as_bytes());
    aad[16..].copy_from_slice(&version.to_be_bytes());
    aad
}

// ═══════════════════════════════════════════════════════════════════════════
// In-process store
// ═══════════════════════════════════════════════════════════════════════════

/// Software key store holding master keys in process memory
pub struct SoftwareKeyStore {
    masters: RwLock<BTreeMap<u32, Secret<[u8; KEY_LEN]>>>,
    available: AtomicBool,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self {
            masters: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (e.g. keystore daemon down)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> VaultResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(VaultError::KeyStoreUnavailable("software key store offline".into()))
        }
    }

    fn wrapping_key(&self, version: u32) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
        let masters = self.masters.read();
        let master = masters.get(&version).ok_or_else(|| {
            VaultError::UnwrapFailed(format!("master key version {} is unavailable", version))
        })?;
        derive_key(master.expose_secret(), &version.to_be_bytes(), contexts::WRAP)
    }

    fn insert_master(&self, version: u32, key: [u8; KEY_LEN]) {
        self.masters.write().insert(version, Secret::new(key));
    }

    fn export_masters(&self) -> Vec<(u32, Zeroizing<[u8; KEY_LEN]>)> {
        self.masters
            .read()
            .iter()
            .map(|(v, k)| (*v, Zeroizing::new(*k.expose_secret())))
            .collect()
    }
}

impl Default for SoftwareKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureKeyStore for SoftwareKeyStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn versions(&self) -> VaultResult<Vec<u32>> {
        self.ensure_available()?;
        Ok(self.masters.read().keys().copied().collect())
    }

    fn create_master_key(&self, version: u32) -> VaultResult<()> {
        self.ensure_available()?;
        let mut masters = self.masters.write();
        if masters.contains_key(&version) {
            return Err(VaultError::InvalidState(format!(
                "master key version {} already exists",
                version
            )));
        }
        masters.insert(version, Secret::new(*generate_key()));
        Ok(())
    }

    fn destroy_master_key(&self, version: u32) -> VaultResult<()> {
        self.ensure_available()?;
        // Secret zeroizes on drop
        self.masters.write().remove(&version);
        Ok(())
    }

    fn wrap(&self, version: u32, key_id: &Uuid, dek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
        self.ensure_available()?;
        let kek = self.wrapping_key(version)?;

        let mut nonce = [0u8; XCHACHA_NONCE_LEN];
        fill_random(&mut nonce);

        let sealed = seal(
            CipherSuite::XChaCha20Poly1305,
            &kek,
            &nonce,
            dek,
            &wrap_aad(version, key_id),
        )?;

        let mut wrapped = Vec::with_capacity(WRAPPED_LEN);
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    fn unwrap(
        &self,
        version: u32,
        key_id: &Uuid,
        wrapped: &[u8],
    ) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
        self.ensure_available()?;

        if wrapped.len() != WRAPPED_LEN {
            return Err(VaultError::UnwrapFailed(format!(
                "wrapped key must be {} bytes, got {}",
                WRAPPED_LEN,
                wrapped.len()
            )));
        }

        let kek = self.wrapping_key(version)?;
        let (nonce, sealed) = wrapped.split_at(XCHACHA_NONCE_LEN);

        let plain = open(
            CipherSuite::XChaCha20Poly1305,
            &kek,
            nonce,
            sealed,
            &wrap_aad(version, key_id),
        )
        .map_err(|_| VaultError::UnwrapFailed("wrapped key failed authentication".into()))?;

        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        dek.copy_from_slice(&plain);
        Ok(dek)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Passphrase-sealed file store (desktop)
// ═══════════════════════════════════════════════════════════════════════════

/// Argon2id parameters for the key store passphrase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealParams {
    /// Iterations (time cost)
    pub time_cost: u32,
    /// Memory in KiB
    pub memory_cost_kib: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl Default for SealParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_cost_kib: 64 * 1024, // 64 MiB
            parallelism: 2,
        }
    }
}

impl SealParams {
    /// Parameters for weak devices and tests
    pub fn low_memory() -> Self {
        Self {
            time_cost: 2,
            memory_cost_kib: 8 * 1024,
            parallelism: 1,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SealedMaster {
    version: u32,
    #[serde(with = "crate::crypto::b64")]
    nonce: Vec<u8>,
    #[serde(with = "crate::crypto::b64")]
    sealed: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SealedFile {
    format: u8,
    params: SealParams,
    #[serde(with = "crate::crypto::b64")]
    salt: Vec<u8>,
    masters: Vec<SealedMaster>,
}

const SEALED_FORMAT: u8 = 1;

/// Master keys sealed at rest under an Argon2id-derived passphrase key
pub struct SealedFileKeyStore {
    path: PathBuf,
    params: SealParams,
    salt: Vec<u8>,
    kek: Secret<[u8; KEY_LEN]>,
    inner: SoftwareKeyStore,
}

impl SealedFileKeyStore {
    /// Open the sealed store at `path`, creating an empty one if absent
    pub fn open_or_create(
        path: &Path,
        passphrase: &SecretString,
        params: SealParams,
    ) -> VaultResult<Self> {
        if path.exists() {
            return Self::open(path, passphrase);
        }

        let mut salt = vec![0u8; 16];
        fill_random(&mut salt);
        let kek = derive_passphrase_key(passphrase, &salt, &params)?;

        let store = Self {
            path: path.to_path_buf(),
            params,
            salt,
            kek: Secret::new(*kek),
            inner: SoftwareKeyStore::new(),
        };
        store.persist()?;

        log::info!("Created sealed key store at {}", path.display());
        Ok(store)
    }

    /// Open an existing sealed store
    pub fn open(path: &Path, passphrase: &SecretString) -> VaultResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            VaultError::KeyStoreUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let file: SealedFile = serde_json::from_slice(&data)?;

        if file.format != SEALED_FORMAT {
            return Err(VaultError::KeyStoreUnavailable(format!(
                "unsupported key store format {}",
                file.format
            )));
        }

        let kek = derive_passphrase_key(passphrase, &file.salt, &file.params)?;
        let inner = SoftwareKeyStore::new();

        for entry in &file.masters {
            let plain = open(
                CipherSuite::XChaCha20Poly1305,
                &kek,
                &entry.nonce,
                &entry.sealed,
                &entry.version.to_be_bytes(),
            )
            .map_err(|_| VaultError::Unauthorized("key store passphrase rejected".into()))?;

            if plain.len() != KEY_LEN {
                return Err(VaultError::KeyStoreUnavailable("sealed master key has wrong length".into()));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&plain);
            inner.insert_master(entry.version, key);
        }

        Ok(Self {
            path: path.to_path_buf(),
            params: file.params,
            salt: file.salt,
            kek: Secret::new(*kek),
            inner,
        })
    }

    fn persist(&self) -> VaultResult<()> {
        let mut masters = Vec::new();

        for (version, key) in self.inner.export_masters() {
            let mut nonce = vec![0u8; XCHACHA_NONCE_LEN];
            fill_random(&mut nonce);
            let sealed = seal(
                CipherSuite::XChaCha20Poly1305,
                self.kek.expose_secret(),
                &nonce,
                &*key,
                &version.to_be_bytes(),
            )?;
            masters.push(SealedMaster { version, nonce, sealed });
        }

        let file = SealedFile {
            format: SEALED_FORMAT,
            params: self.params.clone(),
            salt: self.salt.clone(),
            masters,
        };

        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }
}

impl SecureKeyStore for SealedFileKeyStore {
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn versions(&self) -> VaultResult<Vec<u32>> {
        self.inner.versions()
    }

    fn create_master_key(&self, version: u32) -> VaultResult<()> {
        self.inner.create_master_key(version)?;
        if let Err(e) = self.persist() {
            // keep memory and disk in agreement
            let _ = self.inner.destroy_master_key(version);
            return Err(e);
        }
        Ok(())
    }

    fn destroy_master_key(&self, version: u32) -> VaultResult<()> {
        self.inner.destroy_master_key(version)?;
        self.persist()
    }

    fn wrap(&self, version: u32, key_id: &Uuid, dek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
        self.inner.wrap(version, key_id, dek)
    }

    fn unwrap(
        &self,
        version: u32,
        key_id: &Uuid,
        wrapped: &[u8],
    ) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
        self.inner.unwrap(version, key_id, wrapped)
    }
}

/// Derive the sealing key from the passphrase using Argon2id
fn derive_passphrase_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &SealParams,
) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivationFailed(format!("Invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut *output)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let store = SoftwareKeyStore::new();
        store.create_master_key(1).unwrap();

        let id = Uuid::new_v4();
        let dek = generate_key();
        let wrapped = store.wrap(1, &id, &dek).unwrap();

        assert_eq!(wrapped.len(), WRAPPED_LEN);
        assert_ne!(&wrapped[XCHACHA_NONCE_LEN..XCHACHA_NONCE_LEN + KEY_LEN], &dek[..]);

        let unwrapped = store.unwrap(1, &id, &wrapped).unwrap();
        assert_eq!(*unwrapped, *dek);
    }

    #[test]
    fn test_wrapped_key_bound_to_document() {
        let store = SoftwareKeyStore::new();
        store.create_master_key(1).unwrap();

        let wrapped = store.wrap(1, &Uuid::new_v4(), &generate_key()).unwrap();
        let result = store.unwrap(1, &Uuid::new_v4(), &wrapped);

        assert!(matches!(result, Err(VaultError::UnwrapFailed(_))));
    }

    #[test]
    fn test_destroyed_master_cannot_unwrap() {
        let store = SoftwareKeyStore::new();
        store.create_master_key(1).unwrap();

        let id = Uuid::new_v4();
        let wrapped = store.wrap(1, &id, &generate_key()).unwrap();
        store.destroy_master_key(1).unwrap();

        assert!(matches!(store.unwrap(1, &id, &wrapped), Err(VaultError::UnwrapFailed(_))));
    }

    #[test]
    fn test_offline_store_reports_unavailable() {
        let store = SoftwareKeyStore::new();
        store.set_available(false);

        assert!(matches!(
            store.create_master_key(1),
            Err(VaultError::KeyStoreUnavailable(_))
        ));
    }

    #[test]
    fn test_sealed_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let passphrase = SecretString::new("correct horse battery".to_string());

        let id = Uuid::new_v4();
        let dek = generate_key();
        let wrapped = {
            let store =
                SealedFileKeyStore::open_or_create(&path, &passphrase, SealParams::low_memory()).unwrap();
            store.create_master_key(1).unwrap();
            store.wrap(1, &id, &dek).unwrap()
        };

        let reopened = SealedFileKeyStore::open(&path, &passphrase).unwrap();
        assert_eq!(reopened.versions().unwrap(), vec![1]);
        assert_eq!(*reopened.unwrap(1, &id, &wrapped).unwrap(), *dek);

        // the master key itself is not on disk in the clear
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(&hex::encode(*dek)));
    }

    #[test]
    fn test_sealed_store_rejects_wrong_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let passphrase = SecretString::new("correct horse battery".to_string());

        let store =
            SealedFileKeyStore::open_or_create(&path, &passphrase, SealParams::low_memory()).unwrap();
        store.create_master_key(1).unwrap();

        let wrong = SecretString::new("hunter2".to_string());
        assert!(matches!(
            SealedFileKeyStore::open(&path, &wrong),
            Err(VaultError::Unauthorized(_))
        ));
    }
}
