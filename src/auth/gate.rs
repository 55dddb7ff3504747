//! Authentication gate state machine
//!
//! ```text
//!   Locked ──request──▶ AwaitingChallenge ──success──▶ Unlocked
//!     ▲                   │  ▲        │                   │
//!     │   cancel          │  └failure─┘                   │ expiry / lock
//!     └───────────────────┤                               │
//!     ▲                   └──threshold──▶ LockedOut       │
//!     │                                     │ cool-down   │
//!     │                   AwaitingChallenge ◀┘            │
//!     └───────────────────────────────────────────────────┘
//! ```
//!
//! All mutation of the lockout counters happens under one write lock, held
//! across PIN verification so concurrent guesses are counted one by one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::SecretString;
use serde::Serialize;

use super::biometrics::{BiometricOutcome, BiometricSensor, ChallengeCancel};
use super::lockout::{FailureOutcome, LockoutPolicy, LockoutState};
use super::pin::{hash_pin, verify_pin, PinPolicy};
use super::store::{GateRecord, GateStore};
use super::token::{AuthMethod, AuthorizationToken, TokenAuthority};
use crate::clock::Clock;
use crate::error::{VaultError, VaultResult};

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Locked,
    AwaitingChallenge,
    Unlocked,
    LockedOut { until: DateTime<Utc> },
}

/// Result of asking for access
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// A valid token already exists
    Granted(AuthorizationToken),
    /// Caller must complete a PIN or biometric challenge
    ChallengeRequired { remaining_attempts: u32 },
}

/// Snapshot for display
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub state: GateState,
    pub pin_enrolled: bool,
    pub consecutive_failures: u32,
    pub tier: u8,
    pub remaining_attempts: u32,
    pub retry_after_secs: u64,
}

struct GateInner {
    state: GateState,
    record: GateRecord,
    token: Option<AuthorizationToken>,
    challenge_pending: bool,
}

/// Authentication gate
pub struct AuthGate {
    inner: RwLock<GateInner>,
    store: Arc<dyn GateStore>,
    tokens: Arc<TokenAuthority>,
    clock: Arc<dyn Clock>,
    lockout_policy: LockoutPolicy,
    pin_policy: PinPolicy,
}

impl AuthGate {
    /// Restore the gate from its store; an unexpired lockout survives restarts
    pub fn new(
        store: Arc<dyn GateStore>,
        tokens: Arc<TokenAuthority>,
        clock: Arc<dyn Clock>,
        lockout_policy: LockoutPolicy,
        pin_policy: PinPolicy,
    ) -> VaultResult<Self> {
        lockout_policy.validate()?;

        let record = store.load()?.unwrap_or_default();
        let now = clock.now();
        let state = match record.lockout.lockout_expiry {
            Some(until) if record.lockout.is_locked_out(now) => {
                log::warn!("Restored active lockout (until {})", until);
                GateState::LockedOut { until }
            }
            _ => GateState::Locked,
        };

        Ok(Self {
            inner: RwLock::new(GateInner {
                state,
                record,
                token: None,
                challenge_pending: false,
            }),
            store,
            tokens,
            clock,
            lockout_policy,
            pin_policy,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════════════════════════════════

    /// Current state, with expired tokens and cool-downs taken into account
    pub fn state(&self) -> GateState {
        let inner = self.inner.read();
        self.effective_state(&inner, self.clock.now())
    }

    pub fn status(&self) -> GateStatus {
        let now = self.clock.now();
        let inner = self.inner.read();
        let lockout = &inner.record.lockout;

        GateStatus {
            state: self.effective_state(&inner, now),
            pin_enrolled: inner.record.pin_hash.is_some(),
            consecutive_failures: lockout.consecutive_failures,
            tier: lockout.tier,
            remaining_attempts: lockout.remaining_attempts(&self.lockout_policy),
            retry_after_secs: lockout.retry_after_secs(now),
        }
    }

    pub fn lockout_state(&self) -> LockoutState {
        self.inner.read().record.lockout.clone()
    }

    pub fn is_pin_enrolled(&self) -> bool {
        self.inner.read().record.pin_hash.is_some()
    }

    /// Token of the current unlocked session, if still valid
    pub fn current_token(&self) -> Option<AuthorizationToken> {
        let inner = self.inner.read();
        match (&inner.state, &inner.token) {
            (GateState::Unlocked, Some(token)) if self.tokens.is_valid(token) => Some(token.clone()),
            _ => None,
        }
    }

    fn effective_state(&self, inner: &GateInner, now: DateTime<Utc>) -> GateState {
        match inner.state {
            GateState::Unlocked => match &inner.token {
                Some(token) if self.tokens.is_valid(token) => GateState::Unlocked,
                _ => GateState::Locked,
            },
            GateState::LockedOut { until } if now >= until => GateState::AwaitingChallenge,
            state => state,
        }
    }

    /// Apply time-driven transitions in place
    fn refresh(&self, inner: &mut GateInner, now: DateTime<Utc>) {
        let effective = self.effective_state(inner, now);
        if effective != inner.state {
            log::debug!("Gate {:?} -> {:?}", inner.state, effective);
            if effective == GateState::Locked {
                inner.token = None;
            }
            inner.record.lockout.clear_expired(now);
            inner.state = effective;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSITIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Ask for access: either an existing token or a challenge to complete
    pub fn request_access(&self) -> VaultResult<AccessDecision> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        self.refresh(&mut inner, now);

        match inner.state {
            GateState::Unlocked => match &inner.token {
                Some(token) => Ok(AccessDecision::Granted(token.clone())),
                None => Err(VaultError::InvalidState("unlocked without a token".into())),
            },
            GateState::LockedOut { .. } => Err(inner.record.lockout.locked_error(now)),
            GateState::Locked | GateState::AwaitingChallenge => {
                inner.state = GateState::AwaitingChallenge;
                Ok(AccessDecision::ChallengeRequired {
                    remaining_attempts: inner.record.lockout.remaining_attempts(&self.lockout_policy),
                })
            }
        }
    }

    /// Explicit lock: drop the session and revoke every outstanding token
    pub fn lock(&self) {
        let mut inner = self.inner.write();
        inner.state = match inner.state {
            GateState::LockedOut { until } => GateState::LockedOut { until },
            _ => GateState::Locked,
        };
        inner.token = None;
        self.tokens.revoke_all();
        log::info!("Vault locked");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PIN
    // ═══════════════════════════════════════════════════════════════════════

    /// First-time PIN enrollment
    pub fn enroll_pin(&self, pin: &SecretString) -> VaultResult<()> {
        let mut inner = self.inner.write();
        if inner.record.pin_hash.is_some() {
            return Err(VaultError::InvalidState(
                "PIN already enrolled; change it with a valid token".into(),
            ));
        }

        inner.record.pin_hash = Some(hash_pin(pin, &self.pin_policy)?);
        self.persist(&mut inner)?;
        log::info!("PIN enrolled");
        Ok(())
    }

    /// Replace the PIN; requires a currently valid token
    pub fn change_pin(&self, token: &AuthorizationToken, new_pin: &SecretString) -> VaultResult<()> {
        self.tokens.verify(token)?;
        let hash = hash_pin(new_pin, &self.pin_policy)?;

        let mut inner = self.inner.write();
        inner.record.pin_hash = Some(hash);
        self.persist(&mut inner)?;
        log::info!("PIN changed");
        Ok(())
    }

    /// Verify a PIN and unlock on success
    pub fn submit_pin(&self, pin: &SecretString) -> VaultResult<AuthorizationToken> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        self.refresh(&mut inner, now);

        if inner.record.lockout.is_locked_out(now) {
            return Err(inner.record.lockout.locked_error(now));
        }

        let stored = inner.record.pin_hash.clone().ok_or(VaultError::PinNotEnrolled)?;

        // lock stays held: one guess at a time
        if verify_pin(pin, &stored)? {
            self.on_success(&mut inner, AuthMethod::Pin)
        } else {
            Err(self.on_failure(&mut inner, now, AuthMethod::Pin))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BIOMETRIC
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one biometric challenge.
    ///
    /// The lock is released while the sensor prompt is open. Cancelling (or
    /// dropping the returned future) returns the gate to `Locked` without
    /// touching the failure counter.
    pub async fn authenticate_biometric<S: BiometricSensor>(
        &self,
        sensor: &S,
        cancel: &ChallengeCancel,
    ) -> VaultResult<AuthorizationToken> {
        let mut pending = {
            let now = self.clock.now();
            let mut inner = self.inner.write();
            self.refresh(&mut inner, now);

            if inner.record.lockout.is_locked_out(now) {
                return Err(inner.record.lockout.locked_error(now));
            }
            if inner.challenge_pending {
                return Err(VaultError::InvalidState("biometric challenge already pending".into()));
            }

            inner.challenge_pending = true;
            inner.state = GateState::AwaitingChallenge;
            PendingChallenge { gate: self, armed: true }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = sensor.challenge() => Some(outcome),
        };

        let Some(outcome) = outcome else {
            log::info!("Biometric challenge cancelled");
            drop(pending);
            return Err(VaultError::ChallengeCancelled);
        };

        let now = self.clock.now();
        let mut inner = self.inner.write();
        pending.armed = false;
        inner.challenge_pending = false;
        self.refresh(&mut inner, now);

        // a concurrent PIN failure may have started a cool-down meanwhile
        if inner.record.lockout.is_locked_out(now) {
            return Err(inner.record.lockout.locked_error(now));
        }

        match outcome {
            BiometricOutcome::Success => self.on_success(&mut inner, AuthMethod::Biometric),
            BiometricOutcome::Failure => Err(self.on_failure(&mut inner, now, AuthMethod::Biometric)),
            BiometricOutcome::Unavailable => {
                log::info!("Biometric sensor unavailable, PIN fallback required");
                if inner.state == GateState::AwaitingChallenge {
                    inner.state = GateState::Locked;
                }
                Err(VaultError::BiometricUnavailable)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OUTCOMES
    // ═══════════════════════════════════════════════════════════════════════

    fn on_success(&self, inner: &mut GateInner, method: AuthMethod) -> VaultResult<AuthorizationToken> {
        inner.record.lockout.record_success();
        self.persist(inner)?;

        let token = self.tokens.issue(method)?;
        inner.token = Some(token.clone());
        inner.state = GateState::Unlocked;

        log::info!("Unlocked via {:?}", method);
        Ok(token)
    }

    fn on_failure(&self, inner: &mut GateInner, now: DateTime<Utc>, method: AuthMethod) -> VaultError {
        // a failed re-authentication ends the session it was attempted in
        if inner.token.take().is_some() {
            self.tokens.revoke_all();
        }
        let outcome = inner.record.lockout.record_failure(&self.lockout_policy, now);

        let error = match outcome {
            FailureOutcome::Continue { remaining } => {
                inner.state = GateState::AwaitingChallenge;
                log::warn!("{:?} authentication failed ({} attempts remaining)", method, remaining);
                VaultError::AuthFailed { remaining_attempts: remaining }
            }
            FailureOutcome::LockedOut { until, tier } => {
                inner.state = GateState::LockedOut { until };
                self.tokens.revoke_all();
                VaultError::LockedOut {
                    retry_after_secs: inner.record.lockout.retry_after_secs(now),
                    tier,
                }
            }
        };

        // an unpersisted failure must not be reported as a plain failure
        match self.persist(inner) {
            Ok(()) => error,
            Err(e) => {
                log::error!("Failed to persist lockout state: {}", e);
                e
            }
        }
    }

    fn persist(&self, inner: &mut GateInner) -> VaultResult<()> {
        inner.record.updated_at = Some(self.clock.now());
        self.store.save(&inner.record)
    }
}

/// Returns the gate to `Locked` if a biometric challenge ends without a result
struct PendingChallenge<'a> {
    gate: &'a AuthGate,
    armed: bool,
}

impl Drop for PendingChallenge<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.gate.inner.write();
        inner.challenge_pending = false;
        if inner.state == GateState::AwaitingChallenge {
            inner.state = GateState::Locked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::biometrics::FixedSensor;
    use crate::auth::store::MemoryGateStore;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::future::Future;

    struct Fixture {
        gate: Arc<AuthGate>,
        store: Arc<MemoryGateStore>,
        clock: Arc<ManualClock>,
        tokens: Arc<TokenAuthority>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryGateStore::new());
        let tokens = Arc::new(TokenAuthority::new(300, clock.clone()));
        let gate = AuthGate::new(
            store.clone(),
            tokens.clone(),
            clock.clone(),
            LockoutPolicy::default(),
            PinPolicy::low_memory(),
        )
        .unwrap();
        gate.enroll_pin(&pin("2580")).unwrap();

        Fixture {
            gate: Arc::new(gate),
            store,
            clock,
            tokens,
        }
    }

    fn pin(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    struct PendingSensor;

    impl BiometricSensor for PendingSensor {
        fn challenge(&self) -> impl Future<Output = BiometricOutcome> + Send {
            std::future::pending()
        }
    }

    #[test]
    fn test_request_then_pin_unlocks() {
        let f = fixture();
        assert_eq!(f.gate.state(), GateState::Locked);

        match f.gate.request_access().unwrap() {
            AccessDecision::ChallengeRequired { remaining_attempts } => assert_eq!(remaining_attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.gate.state(), GateState::AwaitingChallenge);

        let token = f.gate.submit_pin(&pin("2580")).unwrap();
        assert_eq!(token.method, AuthMethod::Pin);
        assert_eq!(f.gate.state(), GateState::Unlocked);
        assert!(matches!(f.gate.request_access().unwrap(), AccessDecision::Granted(_)));
    }

    #[test]
    fn test_token_expiry_relocks() {
        let f = fixture();
        f.gate.submit_pin(&pin("2580")).unwrap();

        f.clock.advance(Duration::seconds(301));
        assert_eq!(f.gate.state(), GateState::Locked);
        assert!(f.gate.current_token().is_none());
    }

    #[test]
    fn test_explicit_lock_revokes() {
        let f = fixture();
        let token = f.gate.submit_pin(&pin("2580")).unwrap();

        f.gate.lock();
        assert_eq!(f.gate.state(), GateState::Locked);
        assert!(!f.tokens.is_valid(&token));
    }

    #[test]
    fn test_failure_while_unlocked_revokes_session() {
        let f = fixture();
        let token = f.gate.submit_pin(&pin("2580")).unwrap();

        assert!(matches!(f.gate.submit_pin(&pin("0000")), Err(VaultError::AuthFailed { .. })));
        assert_eq!(f.gate.state(), GateState::AwaitingChallenge);
        assert!(f.gate.current_token().is_none());
        assert!(!f.tokens.is_valid(&token));
    }

    #[test]
    fn test_lockout_monotonicity() {
        let f = fixture();
        let wrong = pin("0000");

        assert!(matches!(f.gate.submit_pin(&wrong), Err(VaultError::AuthFailed { remaining_attempts: 2 })));
        assert!(matches!(f.gate.submit_pin(&wrong), Err(VaultError::AuthFailed { remaining_attempts: 1 })));
        match f.gate.submit_pin(&wrong) {
            Err(VaultError::LockedOut { retry_after_secs, tier }) => {
                assert_eq!(retry_after_secs, 30);
                assert_eq!(tier, 1);
            }
            other => panic!("expected lockout, got {:?}", other),
        }
        assert!(matches!(f.gate.state(), GateState::LockedOut { .. }));

        // attempt during cool-down: rejected, not counted, even if correct
        f.clock.advance(Duration::seconds(10));
        assert!(matches!(f.gate.submit_pin(&pin("2580")), Err(VaultError::LockedOut { .. })));
        assert_eq!(f.gate.lockout_state().consecutive_failures, 3);

        // cool-down elapsed: counter kept, next threshold is 5
        f.clock.advance(Duration::seconds(21));
        assert_eq!(f.gate.state(), GateState::AwaitingChallenge);
        assert!(matches!(f.gate.submit_pin(&wrong), Err(VaultError::AuthFailed { remaining_attempts: 1 })));
        assert_eq!(f.gate.lockout_state().consecutive_failures, 4);

        match f.gate.submit_pin(&wrong) {
            Err(VaultError::LockedOut { retry_after_secs, tier }) => {
                assert_eq!(retry_after_secs, 300);
                assert_eq!(tier, 2);
            }
            other => panic!("expected lockout, got {:?}", other),
        }
    }

    #[test]
    fn test_success_resets_counter() {
        let f = fixture();
        let _ = f.gate.submit_pin(&pin("1111"));
        let _ = f.gate.submit_pin(&pin("1111"));

        f.gate.submit_pin(&pin("2580")).unwrap();
        assert_eq!(f.gate.lockout_state(), LockoutState::default());
    }

    #[test]
    fn test_lockout_survives_restart() {
        let f = fixture();
        for _ in 0..3 {
            let _ = f.gate.submit_pin(&pin("9999"));
        }

        let restarted = AuthGate::new(
            f.store.clone(),
            Arc::new(TokenAuthority::new(300, f.clock.clone())),
            f.clock.clone(),
            LockoutPolicy::default(),
            PinPolicy::low_memory(),
        )
        .unwrap();

        assert!(matches!(restarted.state(), GateState::LockedOut { .. }));
        assert!(matches!(restarted.submit_pin(&pin("2580")), Err(VaultError::LockedOut { .. })));
        assert_eq!(restarted.lockout_state().consecutive_failures, 3);
    }

    #[test]
    fn test_concurrent_guesses_counted_exactly() {
        let f = fixture();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = f.gate.clone();
                std::thread::spawn(move || gate.submit_pin(&pin(&format!("000{}", i))))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let failures = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::AuthFailed { .. })))
            .count();
        let locked = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::LockedOut { .. })))
            .count();

        assert_eq!(failures, 2);
        assert_eq!(locked, 6);
        assert_eq!(f.gate.lockout_state().consecutive_failures, 3);
    }

    #[test]
    fn test_pin_not_enrolled() {
        let clock = Arc::new(ManualClock::default());
        let gate = AuthGate::new(
            Arc::new(MemoryGateStore::new()),
            Arc::new(TokenAuthority::new(300, clock.clone())),
            clock,
            LockoutPolicy::default(),
            PinPolicy::low_memory(),
        )
        .unwrap();

        assert!(matches!(gate.submit_pin(&pin("2580")), Err(VaultError::PinNotEnrolled)));
    }

    #[test]
    fn test_change_pin_requires_token() {
        let f = fixture();
        let token = f.gate.submit_pin(&pin("2580")).unwrap();

        f.gate.change_pin(&token, &pin("147258")).unwrap();
        assert!(f.gate.submit_pin(&pin("147258")).is_ok());

        f.gate.lock();
        assert!(matches!(
            f.gate.change_pin(&token, &pin("3690")),
            Err(VaultError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_biometric_success() {
        let f = fixture();
        let token = f
            .gate
            .authenticate_biometric(&FixedSensor(BiometricOutcome::Success), &ChallengeCancel::new())
            .await
            .unwrap();

        assert_eq!(token.method, AuthMethod::Biometric);
        assert_eq!(f.gate.state(), GateState::Unlocked);
    }

    #[tokio::test]
    async fn test_biometric_and_pin_share_counter() {
        let f = fixture();
        let cancel = ChallengeCancel::new();
        let reject = FixedSensor(BiometricOutcome::Failure);

        assert!(f.gate.authenticate_biometric(&reject, &cancel).await.is_err());
        let _ = f.gate.submit_pin(&pin("1111"));
        let result = f.gate.authenticate_biometric(&reject, &cancel).await;

        assert!(matches!(result, Err(VaultError::LockedOut { tier: 1, .. })));
    }

    #[tokio::test]
    async fn test_biometric_unavailable_does_not_count() {
        let f = fixture();
        let result = f
            .gate
            .authenticate_biometric(&FixedSensor(BiometricOutcome::Unavailable), &ChallengeCancel::new())
            .await;

        assert!(matches!(result, Err(VaultError::BiometricUnavailable)));
        assert_eq!(f.gate.lockout_state().consecutive_failures, 0);
        assert!(f.gate.submit_pin(&pin("2580")).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_returns_to_locked() {
        let f = fixture();
        let _ = f.gate.submit_pin(&pin("1111"));
        let before = f.gate.lockout_state();

        let cancel = ChallengeCancel::new();
        let (result, _) = tokio::join!(
            f.gate.authenticate_biometric(&PendingSensor, &cancel),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            }
        );

        assert!(matches!(result, Err(VaultError::ChallengeCancelled)));
        assert_eq!(f.gate.state(), GateState::Locked);
        assert_eq!(f.gate.lockout_state(), before);

        // a fresh challenge may start after cancellation
        assert!(f
            .gate
            .authenticate_biometric(&FixedSensor(BiometricOutcome::Success), &ChallengeCancel::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dropped_challenge_returns_to_locked() {
        let f = fixture();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            f.gate.authenticate_biometric(&PendingSensor, &ChallengeCancel::new()),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(f.gate.state(), GateState::Locked);
        assert_eq!(f.gate.lockout_state().consecutive_failures, 0);
    }
}
