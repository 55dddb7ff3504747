//! ALFA Docs Vault - Key Manager
//!
//! Envelope encryption: one random data-encryption key (DEK) per document,
//! wrapped under the hardware-rooted master key. The manager keeps an index
//! from key id to wrapped bytes and never hands out unwrapped material
//! except through a [`ScopedKey`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthorizationToken, TokenAuthority};
use crate::clock::Clock;
use crate::crypto::{generate_key, ScopedKey, SecureKeyStore};
use crate::error::{VaultError, VaultResult};
use crate::rotation::{RotationPolicy, RotationSchedule, RotationStatus};

/// Persistable reference to one wrapped document key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentKeyHandle {
    pub key_id: Uuid,
    #[serde(with = "crate::crypto::b64")]
    pub wrapped: Vec<u8>,
    pub master_version: u32,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a committed master key rotation
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub previous_version: u32,
    pub new_version: u32,
    pub epoch: u64,
    pub rewrapped: usize,
    /// Every handle, re-wrapped; the caller persists these
    pub handles: Vec<DocumentKeyHandle>,
}

struct KeyIndex {
    active_version: Option<u32>,
    /// Older master versions still held by the store, oldest first
    retired: Vec<u32>,
    keys: HashMap<Uuid, DocumentKeyHandle>,
    schedule: Option<RotationSchedule>,
}

/// Key Manager
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
    tokens: Arc<TokenAuthority>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
    index: RwLock<KeyIndex>,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn SecureKeyStore>,
        tokens: Arc<TokenAuthority>,
        clock: Arc<dyn Clock>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            store,
            tokens,
            clock,
            policy,
            index: RwLock::new(KeyIndex {
                active_version: None,
                retired: Vec::new(),
                keys: HashMap::new(),
                schedule: None,
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MASTER KEY
    // ═══════════════════════════════════════════════════════════════════════

    /// Make sure a master key exists. Idempotent; returns the active version.
    pub fn initialize_master_key(&self) -> VaultResult<u32> {
        let mut index = self.index.write();

        if !self.store.is_available() {
            return Err(VaultError::KeyStoreUnavailable("secure key store not reachable".into()));
        }

        if let Some(active) = index.active_version {
            return Ok(active);
        }

        let versions = self.store.versions()?;
        let active = match versions.last() {
            Some(&latest) => {
                index.retired = versions[..versions.len() - 1].to_vec();
                log::info!("Using existing master key version {}", latest);
                latest
            }
            None => {
                self.store.create_master_key(1)?;
                log::info!("Created master key version 1");
                1
            }
        };

        index.active_version = Some(active);
        if index.schedule.is_none() {
            index.schedule = Some(RotationSchedule::new(self.policy.clone(), active, self.clock.now()));
        }

        Ok(active)
    }

    pub fn active_master_version(&self) -> Option<u32> {
        self.index.read().active_version
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOCUMENT KEYS
    // ═══════════════════════════════════════════════════════════════════════

    /// Mint a fresh DEK, wrap it, and register it. Only the wrapped form leaves.
    pub fn create_document_key(&self) -> VaultResult<DocumentKeyHandle> {
        let mut index = self.index.write();
        let version = Self::active(&index)?;

        let key_id = Uuid::new_v4();
        let dek = generate_key();
        let wrapped = self.store.wrap(version, &key_id, &dek)?;

        let handle = DocumentKeyHandle {
            key_id,
            wrapped,
            master_version: version,
            created_at: self.clock.now(),
        };
        index.keys.insert(key_id, handle.clone());

        log::debug!("Created document key {}", key_id);
        Ok(handle)
    }

    /// Unwrap a document key for the duration of the returned scope.
    ///
    /// A handle from before a rotation is resolved against the index, so
    /// stale copies held by callers keep working.
    pub fn unwrap(
        &self,
        handle: &DocumentKeyHandle,
        token: &AuthorizationToken,
    ) -> VaultResult<ScopedKey> {
        self.tokens.verify(token)?;

        let index = self.index.read();
        let entry = index.keys.get(&handle.key_id).ok_or_else(|| {
            VaultError::UnwrapFailed(format!(
                "document key {} was destroyed or never registered",
                handle.key_id
            ))
        })?;

        let source = if handle.master_version == entry.master_version {
            handle
        } else {
            entry
        };

        let dek = self
            .store
            .unwrap(source.master_version, &source.key_id, &source.wrapped)?;

        Ok(ScopedKey::new(source.key_id, *dek))
    }

    /// Register handles loaded from storage
    pub fn load_handles<I>(&self, handles: I) -> VaultResult<usize>
    where
        I: IntoIterator<Item = DocumentKeyHandle>,
    {
        let known = self.store.versions()?;
        let mut index = self.index.write();
        let mut count = 0;

        for handle in handles {
            if !known.contains(&handle.master_version) {
                log::warn!(
                    "Document key {} references missing master version {}",
                    handle.key_id,
                    handle.master_version
                );
            }
            index.keys.insert(handle.key_id, handle);
            count += 1;
        }

        Ok(count)
    }

    /// Crypto-shred: forget the wrapped key so the ciphertext is unrecoverable
    pub fn delete_document_key(&self, key_id: &Uuid) -> VaultResult<DocumentKeyHandle> {
        let mut index = self.index.write();
        let removed = index
            .keys
            .remove(key_id)
            .ok_or(VaultError::KeyNotFound(*key_id))?;

        log::info!("Shredded document key {}", key_id);
        Ok(removed)
    }

    pub fn handle(&self, key_id: &Uuid) -> Option<DocumentKeyHandle> {
        self.index.read().keys.get(key_id).cloned()
    }

    /// All registered handles, ordered by key id
    pub fn handles(&self) -> Vec<DocumentKeyHandle> {
        let index = self.index.read();
        let sorted: BTreeMap<_, _> = index.keys.iter().collect();
        sorted.into_values().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.index.read().keys.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ROTATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Generate a new master key and re-wrap every DEK under it.
    ///
    /// All-or-nothing: the index stays write-locked for the whole operation
    /// and is swapped only after every key re-wrapped. On any failure the new
    /// master key is destroyed and the previous one remains authoritative.
    pub fn rotate_master_key(&self) -> VaultResult<RotationReport> {
        let mut index = self.index.write();
        let previous = Self::active(&index)?;

        let new_version = self
            .store
            .versions()?
            .last()
            .copied()
            .unwrap_or(previous)
            .max(previous)
            + 1;

        log::info!(
            "Rotating master key {} -> {} ({} document keys)",
            previous,
            new_version,
            index.keys.len()
        );

        self.store.create_master_key(new_version)?;

        let staged = match self.rewrap_all(&index.keys, new_version) {
            Ok(staged) => staged,
            Err(e) => {
                log::error!("Master key rotation failed, rolling back: {}", e);
                if let Err(cleanup) = self.store.destroy_master_key(new_version) {
                    log::error!("Could not destroy aborted master key {}: {}", new_version, cleanup);
                }
                return Err(e);
            }
        };

        let rewrapped = staged.len();
        index.keys = staged;
        index.active_version = Some(new_version);
        index.retired.push(previous);

        let now = self.clock.now();
        let schedule = index
            .schedule
            .get_or_insert_with(|| RotationSchedule::new(self.policy.clone(), previous, now));
        let epoch = schedule.advance(new_version, now);

        while index.retired.len() > self.policy.retain_previous as usize {
            let oldest = index.retired.remove(0);
            if let Err(e) = self.store.destroy_master_key(oldest) {
                log::warn!("Retired master key {} not destroyed: {}", oldest, e);
            }
        }

        log::info!("Master key rotation committed: version {} (epoch {})", new_version, epoch);

        let sorted: BTreeMap<_, _> = index.keys.iter().collect();
        Ok(RotationReport {
            previous_version: previous,
            new_version,
            epoch,
            rewrapped,
            handles: sorted.into_values().cloned().collect(),
        })
    }

    fn rewrap_all(
        &self,
        keys: &HashMap<Uuid, DocumentKeyHandle>,
        new_version: u32,
    ) -> VaultResult<HashMap<Uuid, DocumentKeyHandle>> {
        let mut staged = HashMap::with_capacity(keys.len());

        // deterministic order makes partial failures reproducible
        let ordered: BTreeMap<_, _> = keys.iter().collect();
        for (key_id, handle) in ordered {
            let dek = self
                .store
                .unwrap(handle.master_version, key_id, &handle.wrapped)?;
            let wrapped = self.store.wrap(new_version, key_id, &dek)?;

            staged.insert(
                *key_id,
                DocumentKeyHandle {
                    key_id: *key_id,
                    wrapped,
                    master_version: new_version,
                    created_at: handle.created_at,
                },
            );
        }

        Ok(staged)
    }

    /// Restore a persisted schedule
    pub fn restore_schedule(&self, schedule: RotationSchedule) {
        self.index.write().schedule = Some(schedule);
    }

    pub fn schedule(&self) -> Option<RotationSchedule> {
        self.index.read().schedule.clone()
    }

    pub fn rotation_status(&self) -> Option<RotationStatus> {
        let now = self.clock.now();
        self.index.read().schedule.as_ref().map(|s| s.status(now))
    }

    fn active(index: &KeyIndex) -> VaultResult<u32> {
        index
            .active_version
            .ok_or_else(|| VaultError::InvalidState("master key not initialized".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::clock::ManualClock;
    use crate::crypto::{SoftwareKeyStore, KEY_LEN};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zeroize::Zeroizing;

    /// Delegating store whose n-th wrap under a given version fails
    struct FlakyStore {
        inner: SoftwareKeyStore,
        fail_version: AtomicUsize,
        fail_on_wrap: usize,
        wraps: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_on_wrap: usize) -> Self {
            Self {
                inner: SoftwareKeyStore::new(),
                fail_version: AtomicUsize::new(usize::MAX),
                fail_on_wrap,
                wraps: AtomicUsize::new(0),
            }
        }

        fn arm(&self, version: u32) {
            self.fail_version.store(version as usize, Ordering::SeqCst);
        }
    }

    impl SecureKeyStore for FlakyStore {
        fn is_available(&self) -> bool {
            self.inner.is_available()
        }
        fn versions(&self) -> VaultResult<Vec<u32>> {
            self.inner.versions()
        }
        fn create_master_key(&self, version: u32) -> VaultResult<()> {
            self.inner.create_master_key(version)
        }
        fn destroy_master_key(&self, version: u32) -> VaultResult<()> {
            self.inner.destroy_master_key(version)
        }
        fn wrap(&self, version: u32, key_id: &Uuid, dek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
            if version as usize == self.fail_version.load(Ordering::SeqCst) {
                let n = self.wraps.fetch_add(1, Ordering::SeqCst) + 1;
                if n == self.fail_on_wrap {
                    return Err(VaultError::KeyStoreUnavailable("injected failure".into()));
                }
            }
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

    fn manager_with(store: Arc<dyn SecureKeyStore>) -> (KeyManager, Arc<TokenAuthority>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let tokens = Arc::new(TokenAuthority::new(300, clock.clone()));
        let km = KeyManager::new(store, tokens.clone(), clock, RotationPolicy::default());
        km.initialize_master_key().unwrap();
        (km, tokens)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = Arc::new(SoftwareKeyStore::new());
        let (km, _) = manager_with(store.clone());

        assert_eq!(km.initialize_master_key().unwrap(), 1);
        assert_eq!(store.versions().unwrap(), vec![1]);
    }

    #[test]
    fn test_initialize_fails_when_store_offline() {
        let store = Arc::new(SoftwareKeyStore::new());
        store.set_available(false);

        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let tokens = Arc::new(TokenAuthority::new(300, clock.clone()));
        let km = KeyManager::new(store, tokens, clock, RotationPolicy::default());

        assert!(matches!(
            km.initialize_master_key(),
            Err(VaultError::KeyStoreUnavailable(_))
        ));
    }

    #[test]
    fn test_document_keys_are_distinct_and_wrapped() {
        let (km, tokens) = manager_with(Arc::new(SoftwareKeyStore::new()));
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        let a = km.create_document_key().unwrap();
        let b = km.create_document_key().unwrap();
        assert_ne!(a.key_id, b.key_id);

        let ka = km.unwrap(&a, &token).unwrap();
        let kb = km.unwrap(&b, &token).unwrap();
        assert_ne!(ka.expose(), kb.expose());
        assert!(!a.wrapped.windows(KEY_LEN).any(|w| w == ka.expose()));
    }

    #[test]
    fn test_unwrap_requires_valid_token() {
        let (km, tokens) = manager_with(Arc::new(SoftwareKeyStore::new()));
        let handle = km.create_document_key().unwrap();
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        tokens.revoke_all();
        assert!(matches!(km.unwrap(&handle, &token), Err(VaultError::Unauthorized(_))));
    }

    #[test]
    fn test_corrupt_wrapped_bytes_fail_unwrap() {
        let (km, tokens) = manager_with(Arc::new(SoftwareKeyStore::new()));
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        let mut handle = km.create_document_key().unwrap();
        handle.wrapped[30] ^= 0x01;

        assert!(matches!(km.unwrap(&handle, &token), Err(VaultError::UnwrapFailed(_))));
    }

    #[test]
    fn test_rotation_rewraps_everything() {
        let store = Arc::new(SoftwareKeyStore::new());
        let (km, tokens) = manager_with(store.clone());
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        let handles: Vec<_> = (0..5).map(|_| km.create_document_key().unwrap()).collect();
        let before: Vec<[u8; KEY_LEN]> = handles
            .iter()
            .map(|h| *km.unwrap(h, &token).unwrap().expose())
            .collect();

        let report = km.rotate_master_key().unwrap();
        assert_eq!(report.previous_version, 1);
        assert_eq!(report.new_version, 2);
        assert_eq!(report.rewrapped, 5);
        assert!(report.handles.iter().all(|h| h.master_version == 2));

        // stale handles still resolve, DEKs unchanged
        for (h, dek) in handles.iter().zip(before.iter()) {
            assert_eq!(km.unwrap(h, &token).unwrap().expose(), dek);
        }
        assert_eq!(store.versions().unwrap(), vec![1, 2]);

        km.rotate_master_key().unwrap();
        assert_eq!(store.versions().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_rotation_rolls_back_on_third_failure() {
        let store = Arc::new(FlakyStore::new(3));
        let (km, tokens) = manager_with(store.clone());
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        for _ in 0..5 {
            km.create_document_key().unwrap();
        }
        let before = km.handles();

        store.arm(2);
        let result = km.rotate_master_key();
        assert!(matches!(result, Err(VaultError::KeyStoreUnavailable(_))));

        // every key still wrapped under version 1, byte for byte
        let after = km.handles();
        assert_eq!(before, after);
        assert!(after.iter().all(|h| h.master_version == 1));
        assert_eq!(km.active_master_version(), Some(1));
        assert_eq!(store.versions().unwrap(), vec![1]);

        for h in &after {
            assert!(km.unwrap(h, &token).is_ok());
        }
    }

    #[test]
    fn test_shredded_key_cannot_be_unwrapped() {
        let (km, tokens) = manager_with(Arc::new(SoftwareKeyStore::new()));
        let token = tokens.issue(AuthMethod::Pin).unwrap();

        let handle = km.create_document_key().unwrap();
        km.delete_document_key(&handle.key_id).unwrap();

        // even with the old handle in hand
        assert!(matches!(km.unwrap(&handle, &token), Err(VaultError::UnwrapFailed(_))));
        assert!(matches!(
            km.delete_document_key(&handle.key_id),
            Err(VaultError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_load_handles_after_restart() {
        let store = Arc::new(SoftwareKeyStore::new());
        let (km, _) = manager_with(store.clone());
        let handle = km.create_document_key().unwrap();
        drop(km);

        let (restarted, tokens) = manager_with(store);
        assert_eq!(restarted.load_handles(vec![handle.clone()]).unwrap(), 1);

        let token = tokens.issue(AuthMethod::Biometric).unwrap();
        assert!(restarted.unwrap(&handle, &token).is_ok());
    }

    #[test]
    fn test_unwrap_waits_for_rotation() {
        use std::thread;

        let (km, tokens) = manager_with(Arc::new(SoftwareKeyStore::new()));
        let km = Arc::new(km);
        let token = tokens.issue(AuthMethod::Pin).unwrap();
        let handles: Vec<_> = (0..20).map(|_| km.create_document_key().unwrap()).collect();

        let rotator = {
            let km = km.clone();
            thread::spawn(move || km.rotate_master_key().map(|r| r.new_version))
        };
        let readers: Vec<_> = handles
            .into_iter()
            .map(|h| {
                let km = km.clone();
                let token = token.clone();
                thread::spawn(move || km.unwrap(&h, &token).map(|k| k.key_id()))
            })
            .collect();

        assert_eq!(rotator.join().unwrap().unwrap(), 2);
        for r in readers {
            assert!(r.join().unwrap().is_ok());
        }
    }
}
