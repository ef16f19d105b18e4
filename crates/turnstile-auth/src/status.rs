//! Identity status gate
//!
//! Decides whether an identity may log in at all, before any module runs.
//! The raw directory value is normalized fail-closed, and an active lockout
//! overrides whatever the directory says.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use turnstile_common::IdentityStatus;

use crate::error::StoreError;
use crate::lockout::LockoutTracker;

/// Backing identity directory as seen by the engine
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Raw status value stored for the identity
    async fn raw_status(&self, identity: &str) -> Result<String, StoreError>;
}

/// Effective-status check run at chain start or when an identity is bound
pub struct StatusGate {
    store: Arc<dyn IdentityStore>,
    lockout: Arc<LockoutTracker>,
    retries: u32,
    backoff: Duration,
}

impl StatusGate {
    pub fn new(store: Arc<dyn IdentityStore>, lockout: Arc<LockoutTracker>) -> Self {
        Self {
            store,
            lockout,
            retries: 3,
            backoff: Duration::from_millis(50),
        }
    }

    /// Bounded retry for transient store errors
    #[must_use]
    pub const fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Effective login status of `identity`.
    ///
    /// Unknown identities are [`IdentityStatus::Inactive`]. An error is
    /// returned only when the store stays unavailable after every retry.
    pub async fn check_status(&self, identity: &str) -> Result<IdentityStatus, StoreError> {
        if self.lockout.is_locked(identity) {
            return Ok(IdentityStatus::Locked);
        }

        let mut attempt = 0;
        let raw = loop {
            match self.store.raw_status(identity).await {
                Ok(raw) => break raw,
                Err(StoreError::NotFound(_)) => return Ok(IdentityStatus::Inactive),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(identity, attempt, error = %e, "identity store unavailable, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    tracing::warn!(identity, error = %e, "identity status lookup failed");
                    return Err(e);
                }
            }
        };

        Ok(IdentityStatus::from_raw(&raw))
    }
}
