//! ALFA Docs Vault - Configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::auth::{LockoutPolicy, PinPolicy, MAX_TOKEN_TTL_SECS};
use crate::cipher::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::crypto::CipherSuite;
use crate::error::{VaultError, VaultResult};
use crate::rotation::RotationPolicy;
use crate::secure_fs::write_atomic;

/// Vault core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultCoreConfig {
    /// Progressive lockout tiers
    pub lockout: LockoutPolicy,
    /// Authorization token lifetime (seconds)
    pub token_ttl_secs: u64,
    /// Suite for newly encrypted documents
    pub cipher_suite: CipherSuite,
    /// Plaintext bytes per chunk
    pub chunk_size: u32,
    /// Where ephemeral plaintext files go (OS temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    pub pin: PinPolicy,
    pub rotation: RotationPolicy,
}

impl Default for VaultCoreConfig {
    fn default() -> Self {
        Self {
            lockout: LockoutPolicy::default(),
            token_ttl_secs: 300, // 5 minutes
            cipher_suite: CipherSuite::Aes256Gcm,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: None,
            pin: PinPolicy::default(),
            rotation: RotationPolicy::default(),
        }
    }
}

impl VaultCoreConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> VaultResult<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load if present, defaults otherwise
    pub fn load_or_default(path: &Path) -> VaultResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        self.validate()?;
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> VaultResult<()> {
        self.lockout.validate()?;

        if self.token_ttl_secs == 0 || self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(VaultError::InvalidConfig(format!(
                "token_ttl_secs must be between 1 and {}",
                MAX_TOKEN_TTL_SECS
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(VaultError::InvalidConfig(format!(
                "chunk_size must be between {} and {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.pin.min_length == 0 || self.pin.min_length > self.pin.max_length {
            return Err(VaultError::InvalidConfig("invalid PIN length bounds".into()));
        }
        if self.rotation.interval_days == 0 {
            return Err(VaultError::InvalidConfig("rotation interval_days must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LockoutTier;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultCoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lockout.tiers.len(), 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{ "token_ttl_secs": 120, "cipher_suite": "xchacha20-poly1305" }"#).unwrap();

        let config = VaultCoreConfig::load(&path).unwrap();
        assert_eq!(config.token_ttl_secs, 120);
        assert_eq!(config.cipher_suite, CipherSuite::XChaCha20Poly1305);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = VaultCoreConfig {
            chunk_size: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.chunk_size = DEFAULT_CHUNK_SIZE;
        config.token_ttl_secs = 100_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(VaultError::InvalidConfig(_))));

        config.token_ttl_secs = 300;
        config.lockout.tiers = vec![
            LockoutTier { threshold: 3, cooldown_secs: 300 },
            LockoutTier { threshold: 5, cooldown_secs: 30 },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = VaultCoreConfig {
            token_ttl_secs: 60,
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(VaultCoreConfig::load_or_default(&path).unwrap().token_ttl_secs, 60);
        assert_eq!(
            VaultCoreConfig::load_or_default(&dir.path().join("missing.json"))
                .unwrap()
                .token_ttl_secs,
            300
        );
    }
}
