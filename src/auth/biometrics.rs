//! Biometric sensor seam
//!
//! Platform code (Android BiometricPrompt, Touch ID, ...) implements
//! [`BiometricSensor`]; the gate only sees the outcome of one challenge.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Result of one biometric prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiometricOutcome {
    /// Enrolled biometric matched
    Success,
    /// Presented biometric did not match
    Failure,
    /// No sensor, nothing enrolled, or hardware error
    Unavailable,
}

/// Platform biometric prompt
pub trait BiometricSensor: Send + Sync {
    /// Present one challenge and wait for the user
    fn challenge(&self) -> impl Future<Output = BiometricOutcome> + Send;
}

/// Cancellation handle for a pending biometric challenge
#[derive(Debug, Clone)]
pub struct ChallengeCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl ChallengeCancel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ChallengeCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Sensor that always returns the same outcome
#[derive(Debug, Clone, Copy)]
pub struct FixedSensor(pub BiometricOutcome);

impl BiometricSensor for FixedSensor {
    fn challenge(&self) -> impl Future<Output = BiometricOutcome> + Send {
        let outcome = self.0;
        async move { outcome }
    }
}
