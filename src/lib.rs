//! # ALFA Docs Vault
//!
//! Secure vault core for a personal document vault: envelope encryption,
//! a biometric/PIN gate with progressive lockout, and conflict resolution
//! for encrypted records synchronized between devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ALFA DOCS VAULT                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  AUTH GATE  │  │ KEY MANAGER │  │ CONFLICT        │  │
//! │  │  PIN + BIO  │─▶│  DEK index  │  │ RESOLVER        │  │
//! │  │  lockout    │  │  rotation   │  │ merge / review  │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │ token          │ ScopedKey         │           │
//! │         │         ┌──────┴──────┐   ┌───────┴────────┐  │
//! │         │         │CIPHER ENGINE│   │ CONFLICT STORE │  │
//! │         │         │ chunked AEAD│   │ (SQLite)       │  │
//! │         │         └─────────────┘   └────────────────┘  │
//! │  ┌──────┴──────────────────────────────────────────────┐ │
//! │  │        SECURE KEY STORE (hardware / sealed file)    │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - One random 256-bit key per document, wrapped under the master key
//! - Master key never leaves the secure key store
//! - Every unwrap requires a live authorization token
//! - AES-256-GCM or XChaCha20-Poly1305, chunked, per-blob subkeys
//! - Decrypted content only in owner-only scratch files wiped on release
//! - Lockout counters persisted; a restart does not reset them

pub mod auth;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key_manager;
pub mod rotation;
pub mod secure_fs;
pub mod sync;
pub mod vault;

pub use auth::{AuthGate, AuthMethod, AuthorizationToken, GateState, LockoutPolicy, LockoutState};
pub use cipher::{CancelFlag, CipherEngine, EncryptedBlob};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VaultCoreConfig;
pub use crypto::{CipherSuite, ScopedKey, SecureKeyStore};
pub use error::{VaultError, VaultResult};
pub use key_manager::{DocumentKeyHandle, KeyManager, RotationReport};
pub use rotation::{RotationPolicy, RotationStatus};
pub use secure_fs::EphemeralPlaintext;
pub use sync::{ConflictRecord, ConflictResolver, Resolution, ResolutionStrategy};
pub use vault::VaultCore;

/// ALFA Docs Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ALFA Docs Vault signature
pub const SIGNATURE: &str = "ALFA_DOCS_VAULT_v1";
