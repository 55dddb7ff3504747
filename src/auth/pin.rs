//! PIN enrollment and verification (Argon2id, PHC string format)

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::crypto::fill_random;
use crate::error::{VaultError, VaultResult};

const PIN_SALT_LEN: usize = 16;

/// PIN format and hashing cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub digits_only: bool,
    /// Argon2 time cost
    pub time_cost: u32,
    /// Argon2 memory in KiB
    pub memory_cost_kib: u32,
    pub parallelism: u32,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 16,
            digits_only: true,
            time_cost: 2,
            memory_cost_kib: 19 * 1024, // 19 MiB
            parallelism: 1,
        }
    }
}

impl PinPolicy {
    /// Cheap parameters for constrained devices and tests
    pub fn low_memory() -> Self {
        Self {
            time_cost: 1,
            memory_cost_kib: 8 * 1024,
            ..Default::default()
        }
    }

    /// Check PIN format
    pub fn validate(&self, pin: &SecretString) -> VaultResult<()> {
        let pin = pin.expose_secret();
        let len = pin.chars().count();

        if len < self.min_length {
            return Err(VaultError::InvalidPin(format!(
                "must be at least {} characters",
                self.min_length
            )));
        }
        if len > self.max_length {
            return Err(VaultError::InvalidPin(format!(
                "must be at most {} characters",
                self.max_length
            )));
        }
        if self.digits_only && !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(VaultError::InvalidPin("digits only".into()));
        }
        Ok(())
    }

    fn hasher(&self) -> VaultResult<Argon2<'static>> {
        let params = Params::new(self.memory_cost_kib, self.time_cost, self.parallelism, None)
            .map_err(|e| VaultError::KeyDerivationFailed(format!("Invalid Argon2 params: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Hash a PIN into a self-describing PHC string with a random salt
pub fn hash_pin(pin: &SecretString, policy: &PinPolicy) -> VaultResult<String> {
    policy.validate(pin)?;

    let mut salt_bytes = [0u8; PIN_SALT_LEN];
    fill_random(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| VaultError::KeyDerivationFailed(format!("Salt encoding failed: {}", e)))?;

    let hash = policy
        .hasher()?
        .hash_password(pin.expose_secret().as_bytes(), &salt)
        .map_err(|e| VaultError::KeyDerivationFailed(format!("PIN hashing failed: {}", e)))?;

    Ok(hash.to_string())
}

/// Verify a PIN against a stored PHC string.
///
/// Parameters come from the stored hash, so changing the policy does not
/// invalidate existing enrollments.
pub fn verify_pin(pin: &SecretString, stored: &str) -> VaultResult<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| VaultError::SerializationError(format!("Corrupt PIN hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(pin.expose_secret().as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn test_hash_and_verify() {
        let policy = PinPolicy::low_memory();
        let hash = hash_pin(&pin("482916"), &policy).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_pin(&pin("482916"), &hash).unwrap());
        assert!(!verify_pin(&pin("482917"), &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let policy = PinPolicy::low_memory();
        let a = hash_pin(&pin("1234"), &policy).unwrap();
        let b = hash_pin(&pin("1234"), &policy).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_policy_rejects_bad_format() {
        let policy = PinPolicy::low_memory();

        assert!(matches!(hash_pin(&pin("12"), &policy), Err(VaultError::InvalidPin(_))));
        assert!(matches!(hash_pin(&pin("12ab"), &policy), Err(VaultError::InvalidPin(_))));
        assert!(policy.validate(&pin("12345678901234567")).is_err());
    }

    #[test]
    fn test_corrupt_hash() {
        assert!(verify_pin(&pin("1234"), "not-a-phc-string").is_err());
    }
}
