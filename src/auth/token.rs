//! Short-lived authorization tokens
//!
//! Tokens are signed with a key generated when the process starts and never
//! written anywhere, so a restart invalidates every outstanding token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::{contexts, generate_key, KEY_LEN};
use crate::error::{VaultError, VaultResult};

type HmacSha256 = Hmac<Sha256>;

/// Longest token lifetime a configuration may ask for (24 hours)
pub const MAX_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Authentication method that produced a token
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthMethod {
    Pin,
    Biometric,
}

impl AuthMethod {
    fn tag(&self) -> u8 {
        match self {
            AuthMethod::Pin => 1,
            AuthMethod::Biometric => 2,
        }
    }
}

/// Proof that the holder passed the authentication gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationToken {
    pub token_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub method: AuthMethod,
    epoch: u64,
    signature: [u8; 32],
}

impl AuthorizationToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues and verifies tokens for one process lifetime
pub struct TokenAuthority {
    key: Secret<[u8; KEY_LEN]>,
    epoch: AtomicU64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenAuthority {
    /// `ttl_secs` is capped at [`MAX_TOKEN_TTL_SECS`]
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: Secret::new(*generate_key()),
            epoch: AtomicU64::new(0),
            ttl: Duration::seconds(ttl_secs.min(MAX_TOKEN_TTL_SECS) as i64),
            clock,
        }
    }

    pub fn issue(&self, method: AuthMethod) -> VaultResult<AuthorizationToken> {
        let issued_at = self.clock.now();
        let mut token = AuthorizationToken {
            token_id: Uuid::new_v4(),
            issued_at,
            expires_at: issued_at + self.ttl,
            method,
            epoch: self.epoch.load(Ordering::SeqCst),
            signature: [0u8; 32],
        };
        token.signature = self.mac(&token)?.finalize().into_bytes().into();

        log::debug!("Issued {:?} token {} (expires {})", method, token.token_id, token.expires_at);
        Ok(token)
    }

    /// Check signature, revocation epoch and expiry
    pub fn verify(&self, token: &AuthorizationToken) -> VaultResult<()> {
        self.mac(token)?
            .verify_slice(&token.signature)
            .map_err(|_| VaultError::Unauthorized("token was not issued by this session".into()))?;

        if token.epoch != self.epoch.load(Ordering::SeqCst) {
            return Err(VaultError::Unauthorized("token revoked".into()));
        }
        if token.is_expired_at(self.clock.now()) {
            return Err(VaultError::Unauthorized("token expired".into()));
        }
        Ok(())
    }

    pub fn is_valid(&self, token: &AuthorizationToken) -> bool {
        self.verify(token).is_ok()
    }

    /// Invalidate every token issued so far
    pub fn revoke_all(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Revoked outstanding tokens (epoch {})", epoch);
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self, token: &AuthorizationToken) -> VaultResult<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.expose_secret())
            .map_err(|e| VaultError::Crypto(format!("token MAC key rejected: {}", e)))?;
        mac.update(contexts::TOKEN);
        mac.update(token.token_id.as_bytes());
        mac.update(&token.issued_at.timestamp_micros().to_be_bytes());
        mac.update(&token.expires_at.timestamp_micros().to_be_bytes());
        mac.update(&[token.method.tag()]);
        mac.update(&token.epoch.to_be_bytes());
        Ok(mac)
    }
}
