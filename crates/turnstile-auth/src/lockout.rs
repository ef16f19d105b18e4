//! Failure accounting and account lockout
//!
//! Counters are the only state shared between concurrent attempts. Each
//! identity has its own counter behind its own mutex, so failures for one
//! user never wait on another user's login. Within a counter, updates are
//! ordered by timestamp: a failure stamped before the latest reset is
//! discarded instead of re-arming the lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use turnstile_common::config::LockoutConfig;
use turnstile_common::now_millis;

/// Per-identity failure counter. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounter {
    /// Failures inside the current window
    pub count: u32,
    pub window_start: u64,
    pub locked_until: Option<u64>,
    /// Lockouts served since the last successful login
    pub lockouts: u32,
    pub updated_at: u64,
    /// Time of the last reset; older failures are ignored
    pub reset_at: u64,
}

impl FailureCounter {
    #[must_use]
    pub fn is_locked_at(&self, now: u64) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    enabled: bool,
    threshold: u32,
    window_ms: u64,
    duration_ms: u64,
    multiplier: u32,
    max_duration_ms: u64,
}

impl From<&LockoutConfig> for Policy {
    fn from(config: &LockoutConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold.max(1),
            window_ms: config.window_secs.saturating_mul(1000),
            duration_ms: config.duration_secs.saturating_mul(1000),
            multiplier: config.duration_multiplier.max(1),
            max_duration_ms: config.max_duration_secs.saturating_mul(1000),
        }
    }
}

impl Policy {
    fn lock_duration(&self, lockouts: u32) -> u64 {
        let factor = u64::from(self.multiplier).saturating_pow(lockouts);
        self.duration_ms
            .saturating_mul(factor)
            .min(self.max_duration_ms.max(self.duration_ms))
    }
}

/// Tracks failed logins and lockouts per identity
#[derive(Debug)]
pub struct LockoutTracker {
    policy: Policy,
    counters: DashMap<String, Arc<Mutex<FailureCounter>>>,
    lockouts_activated: AtomicU64,
}

impl LockoutTracker {
    pub fn new(config: &LockoutConfig) -> Self {
        Self {
            policy: Policy::from(config),
            counters: DashMap::new(),
            lockouts_activated: AtomicU64::new(0),
        }
    }

    /// Tracker that counts failures but never locks
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&LockoutConfig {
            enabled: false,
            ..LockoutConfig::default()
        })
    }

    pub const fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub const fn threshold(&self) -> u32 {
        self.policy.threshold
    }

    // The shard guard is released before the counter mutex is taken.
    fn cell(&self, identity: &str) -> Arc<Mutex<FailureCounter>> {
        Arc::clone(&self.counters.entry(identity.to_string()).or_default())
    }

    pub fn record_failure(&self, identity: &str) -> FailureCounter {
        self.record_failure_at(identity, now_millis())
    }

    /// Count one credential failure observed at `now`
    pub fn record_failure_at(&self, identity: &str, now: u64) -> FailureCounter {
        let cell = self.cell(identity);
        let mut counter = cell.lock();

        if now < counter.reset_at {
            tracing::debug!(identity, "discarding failure older than last reset");
            return counter.clone();
        }

        if counter.locked_until.is_some_and(|until| now >= until) {
            counter.locked_until = None;
            counter.count = 0;
        }

        let window_elapsed = now.saturating_sub(counter.window_start) >= self.policy.window_ms;
        if counter.locked_until.is_none() && (counter.count == 0 || window_elapsed) {
            counter.count = 0;
            counter.window_start = now;
        }

        counter.count = counter.count.saturating_add(1);
        counter.updated_at = counter.updated_at.max(now);

        if self.policy.enabled
            && counter.locked_until.is_none()
            && counter.count >= self.policy.threshold
        {
            let duration = self.policy.lock_duration(counter.lockouts);
            counter.locked_until = Some(now.saturating_add(duration));
            counter.lockouts = counter.lockouts.saturating_add(1);
            self.lockouts_activated.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                identity,
                failures = counter.count,
                lock_ms = duration,
                "identity locked out"
            );
        }

        counter.clone()
    }

    pub fn record_success(&self, identity: &str) {
        self.record_success_at(identity, now_millis());
    }

    /// Clear the counter after a successful login at `now`.
    ///
    /// Ignored while a lock is active or when a later failure has already
    /// been recorded.
    pub fn record_success_at(&self, identity: &str, now: u64) {
        let Some(cell) = self.counters.get(identity).map(|c| Arc::clone(&c)) else {
            return;
        };
        let mut counter = cell.lock();
        if counter.is_locked_at(now) || now < counter.updated_at {
            return;
        }
        *counter = FailureCounter {
            updated_at: now,
            reset_at: now,
            ..FailureCounter::default()
        };
    }

    pub fn is_locked(&self, identity: &str) -> bool {
        self.is_locked_at(identity, now_millis())
    }

    pub fn is_locked_at(&self, identity: &str, now: u64) -> bool {
        if !self.policy.enabled {
            return false;
        }
        self.counters
            .get(identity)
            .is_some_and(|cell| cell.lock().is_locked_at(now))
    }

    /// Failures left before the identity locks
    pub fn remaining_attempts(&self, identity: &str) -> u32 {
        let now = now_millis();
        let Some(counter) = self.counter(identity) else {
            return self.policy.threshold;
        };
        if counter.is_locked_at(now) {
            return 0;
        }
        if counter.locked_until.is_some()
            || now.saturating_sub(counter.window_start) >= self.policy.window_ms
        {
            return self.policy.threshold;
        }
        self.policy.threshold.saturating_sub(counter.count)
    }

    /// Operator unlock. Clears the lock and the escalation history.
    pub fn unlock(&self, identity: &str) -> bool {
        let Some(cell) = self.counters.get(identity).map(|c| Arc::clone(&c)) else {
            return false;
        };
        let now = now_millis();
        let mut counter = cell.lock();
        let was_locked = counter.is_locked_at(now);
        *counter = FailureCounter {
            updated_at: now,
            reset_at: now,
            ..FailureCounter::default()
        };
        tracing::info!(identity, was_locked, "identity unlocked");
        was_locked
    }

    /// Snapshot of an identity's counter
    pub fn counter(&self, identity: &str) -> Option<FailureCounter> {
        self.counters.get(identity).map(|cell| cell.lock().clone())
    }

    pub fn lockouts_activated(&self) -> u64 {
        self.lockouts_activated.load(Ordering::Relaxed)
    }
}
