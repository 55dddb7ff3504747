//! ALFA Docs Vault - Authentication Gate
//!
//! PIN and biometric verification, progressive lockout, and the short-lived
//! tokens the key manager demands for every unwrap.

pub mod biometrics;
pub mod gate;
pub mod lockout;
pub mod pin;
pub mod store;
pub mod token;

pub use biometrics::{BiometricOutcome, BiometricSensor, ChallengeCancel, FixedSensor};
pub use gate::{AccessDecision, AuthGate, GateState, GateStatus};
pub use lockout::{FailureOutcome, LockoutPolicy, LockoutState, LockoutTier};
pub use pin::{hash_pin, verify_pin, PinPolicy};
pub use store::{GateRecord, GateStore, JsonGateStore, MemoryGateStore};
pub use token::{AuthMethod, AuthorizationToken, TokenAuthority, MAX_TOKEN_TTL_SECS};
