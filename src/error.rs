//! ALFA Docs Vault - Error Types

use thiserror::Error;
use uuid::Uuid;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // KEY STORE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Secure key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("Key unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("Document key not found: {0}")]
    KeyNotFound(Uuid),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    // ═══════════════════════════════════════════════════════════════
    // INTEGRITY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Authentication tag mismatch - data tampered or wrong key")]
    AuthenticationFailed,

    #[error("Malformed encrypted blob: {0}")]
    MalformedBlob(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════
    // AUTHORIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Authentication failed ({remaining_attempts} attempts remaining before cool-down)")]
    AuthFailed { remaining_attempts: u32 },

    #[error("Too many failed attempts - try again in {retry_after_secs} seconds")]
    LockedOut { retry_after_secs: u64, tier: u8 },

    #[error("Biometric sensor unavailable - use PIN")]
    BiometricUnavailable,

    #[error("Authentication challenge cancelled")]
    ChallengeCancelled,

    #[error("No PIN enrolled")]
    PinNotEnrolled,

    #[error("PIN rejected: {0}")]
    InvalidPin(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ═══════════════════════════════════════════════════════════════
    // SYNC ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Conflict record not found: {0}")]
    ConflictNotFound(Uuid),

    #[error("Stale resolution for entity {0} - state changed since it was computed")]
    StaleResolution(String),

    #[error("Version pair mismatch: {0}")]
    VersionMismatch(String),

    // ═══════════════════════════════════════════════════════════════
    // STORAGE / SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl VaultError {
    /// Data integrity violations; never retried automatically
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            VaultError::UnwrapFailed(_)
                | VaultError::AuthenticationFailed
                | VaultError::MalformedBlob(_)
        )
    }

    /// Errors that may succeed if the same call is repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::KeyStoreUnavailable(_)
                | VaultError::LockedOut { .. }
                | VaultError::BiometricUnavailable
                | VaultError::ChallengeCancelled
                | VaultError::Cancelled
        )
    }

    /// Errors recoverable by authenticating again
    pub fn requires_reauth(&self) -> bool {
        matches!(self, VaultError::Unauthorized(_) | VaultError::AuthFailed { .. })
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_errors_are_not_retryable() {
        let errors = [
            VaultError::AuthenticationFailed,
            VaultError::MalformedBlob("short header".into()),
            VaultError::UnwrapFailed("bad tag".into()),
        ];

        for e in errors {
            assert!(e.is_integrity_violation());
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn test_lockout_message_carries_cooldown() {
        let e = VaultError::LockedOut { retry_after_secs: 30, tier: 1 };
        assert!(e.is_retryable());
        assert!(e.to_string().contains("30 seconds"));
    }
}
