//! ALFA Docs Vault - Vault Core
//!
//! Facade wiring the authentication gate, key manager and cipher engine.
//! The core never persists documents itself: it returns handles and blobs
//! for the storage collaborator and accepts them back.

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::auth::{AuthGate, AuthorizationToken, GateStore, TokenAuthority};
use crate::cipher::{BlobSummary, CancelFlag, CipherEngine, EncryptedBlob};
use crate::clock::Clock;
use crate::config::VaultCoreConfig;
use crate::crypto::SecureKeyStore;
use crate::error::{VaultError, VaultResult};
use crate::key_manager::{DocumentKeyHandle, KeyManager, RotationReport};
use crate::secure_fs::EphemeralPlaintext;
use crate::sync::ConflictResolver;

/// Result of storing a new document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub handle: DocumentKeyHandle,
    pub summary: BlobSummary,
}

/// Secure vault core
pub struct VaultCore {
    config: VaultCoreConfig,
    tokens: Arc<TokenAuthority>,
    gate: AuthGate,
    keys: KeyManager,
    cipher: CipherEngine,
    resolver: ConflictResolver,
}

impl VaultCore {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn new(
        config: VaultCoreConfig,
        key_store: Arc<dyn SecureKeyStore>,
        gate_store: Arc<dyn GateStore>,
        clock: Arc<dyn Clock>,
    ) -> VaultResult<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenAuthority::new(config.token_ttl_secs, clock.clone()));
        let gate = AuthGate::new(
            gate_store,
            tokens.clone(),
            clock.clone(),
            config.lockout.clone(),
            config.pin.clone(),
        )?;

        let keys = KeyManager::new(key_store, tokens.clone(), clock.clone(), config.rotation.clone());
        let version = keys.initialize_master_key()?;
        log::info!("Vault core ready (master key v{})", version);

        let mut cipher = CipherEngine::new(config.cipher_suite, config.chunk_size)?;
        if let Some(dir) = &config.scratch_dir {
            cipher = cipher.with_scratch_dir(dir);
        }

        Ok(Self {
            config,
            tokens,
            gate,
            keys,
            cipher,
            resolver: ConflictResolver::new(clock),
        })
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn cipher(&self) -> &CipherEngine {
        &self.cipher
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn config(&self) -> &VaultCoreConfig {
        &self.config
    }

    /// Token of the current session, or `Unauthorized`
    pub fn session_token(&self) -> VaultResult<AuthorizationToken> {
        self.gate
            .current_token()
            .ok_or_else(|| VaultError::Unauthorized("vault is locked".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOCUMENTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Mint a document key and encrypt `reader` into `writer`.
    ///
    /// The key is discarded again if encryption fails, so no handle exists
    /// for a blob that was never completely written.
    pub fn create_document<R: Read, W: Write + Seek>(
        &self,
        token: &AuthorizationToken,
        reader: &mut R,
        writer: &mut W,
        cancel: Option<&CancelFlag>,
    ) -> VaultResult<NewDocument> {
        self.tokens.verify(token)?;

        let handle = self.keys.create_document_key()?;
        let result = self
            .keys
            .unwrap(&handle, token)
            .and_then(|key| self.cipher.encrypt_stream(reader, writer, &key, cancel));

        match result {
            Ok(summary) => {
                log::info!("Created document key {} ({} bytes)", handle.key_id, summary.plaintext_len);
                Ok(NewDocument { handle, summary })
            }
            Err(e) => {
                if let Err(cleanup) = self.keys.delete_document_key(&handle.key_id) {
                    log::error!("Could not discard key {} after failed encrypt: {}", handle.key_id, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Encrypt an in-memory document
    pub fn create_document_from_bytes(
        &self,
        token: &AuthorizationToken,
        plaintext: &[u8],
    ) -> VaultResult<(DocumentKeyHandle, EncryptedBlob)> {
        let mut out = std::io::Cursor::new(Vec::new());
        let created = self.create_document(token, &mut &plaintext[..], &mut out, None)?;
        Ok((created.handle, EncryptedBlob::from_bytes(out.into_inner())?))
    }

    /// Decrypt into a scoped ephemeral file
    pub fn open_document<R: Read>(
        &self,
        token: &AuthorizationToken,
        handle: &DocumentKeyHandle,
        reader: &mut R,
        cancel: Option<&CancelFlag>,
    ) -> VaultResult<EphemeralPlaintext> {
        let key = self.keys.unwrap(handle, token)?;
        self.cipher.decrypt(reader, &key, cancel)
    }

    /// Decrypt a small blob into zeroizing memory
    pub fn open_document_to_memory(
        &self,
        token: &AuthorizationToken,
        handle: &DocumentKeyHandle,
        blob: &EncryptedBlob,
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        let key = self.keys.unwrap(handle, token)?;
        self.cipher.decrypt_to_vec(blob, &key)
    }

    /// Crypto-shred: destroy the document key. The ciphertext becomes
    /// unrecoverable; deleting it is up to the storage collaborator.
    pub fn shred_document(&self, token: &AuthorizationToken, key_id: &Uuid) -> VaultResult<()> {
        self.tokens.verify(token)?;
        self.keys.delete_document_key(key_id)?;
        Ok(())
    }

    /// Rotate the master key; the caller persists `report.handles`
    pub fn rotate_master_key(&self, token: &AuthorizationToken) -> VaultResult<RotationReport> {
        self.tokens.verify(token)?;
        self.keys.rotate_master_key()
    }
}
