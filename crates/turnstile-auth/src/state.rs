//! Per-attempt chain execution state
//!
//! One [`ChainExecutionState`] exists per login attempt. Its chain control
//! fields are private: only the engine moves the cursor, records outcomes
//! and sets the overall status. Modules see the shared state and nothing
//! else. Every mutation leaves the struct fully serializable, so it can be
//! parked as an opaque token between rounds.

use serde::{Deserialize, Serialize};
use turnstile_common::{AttemptId, Criterion};

use crate::callback::Callback;
use crate::shared::SharedState;

/// Verdict of one completed link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Failure,
    /// Link interrupted by an operator or timeout abort
    Aborted,
}

impl Verdict {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Overall status of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    InProgress,
    Success,
    Failure,
    Aborted,
}

impl OverallStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Why an attempt failed. Kept server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// A module rejected the presented credentials
    Credentials,
    /// The identity is inactive, deleted or locked
    AccountStatus,
    /// Identity store or module backend failed after retries
    Infrastructure,
    /// Protocol or consistency violation
    Protocol,
}

/// Append-only record of one completed link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub link_index: usize,
    pub criterion: Criterion,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Resumable state of one login attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecutionState {
    attempt_id: AttemptId,
    chain_name: String,
    /// Digest of the chain definition the attempt started on
    chain_digest: String,
    current_link_index: usize,
    /// Incremented on every suspension
    round: u32,
    link_results: Vec<ModuleOutcome>,
    shared_state: SharedState,
    pending_callbacks: Vec<Callback>,
    overall_status: OverallStatus,
    bound_identity: Option<String>,
    /// Status gate already ran for the bound identity
    identity_checked: bool,
    failure_cause: Option<FailureCause>,
    created_at: u64,
    expires_at: u64,
}

impl ChainExecutionState {
    /// Start a fresh attempt at the first link
    pub fn new(
        attempt_id: AttemptId,
        chain_name: impl Into<String>,
        chain_digest: impl Into<String>,
        created_at: u64,
        expires_at: u64,
    ) -> Self {
        Self {
            attempt_id,
            chain_name: chain_name.into(),
            chain_digest: chain_digest.into(),
            current_link_index: 0,
            round: 0,
            link_results: Vec::new(),
            shared_state: SharedState::new(),
            pending_callbacks: Vec::new(),
            overall_status: OverallStatus::InProgress,
            bound_identity: None,
            identity_checked: false,
            failure_cause: None,
            created_at,
            expires_at,
        }
    }

    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub fn chain_digest(&self) -> &str {
        &self.chain_digest
    }

    pub const fn current_link_index(&self) -> usize {
        self.current_link_index
    }

    pub const fn round(&self) -> u32 {
        self.round
    }

    pub fn link_results(&self) -> &[ModuleOutcome] {
        &self.link_results
    }

    pub const fn shared_state(&self) -> &SharedState {
        &self.shared_state
    }

    pub fn pending_callbacks(&self) -> &[Callback] {
        &self.pending_callbacks
    }

    pub const fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    pub fn bound_identity(&self) -> Option<&str> {
        self.bound_identity.as_deref()
    }

    pub const fn failure_cause(&self) -> Option<FailureCause> {
        self.failure_cause
    }

    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    pub const fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub const fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    /// Any link already ended in an explicit failure
    pub fn has_failed_link(&self) -> bool {
        self.link_results
            .iter()
            .any(|o| o.verdict == Verdict::Failure)
    }

    /// The current link started but has no recorded outcome yet
    pub fn current_link_open(&self) -> bool {
        !self
            .link_results
            .iter()
            .any(|o| o.link_index == self.current_link_index)
    }

    pub(crate) const fn identity_checked(&self) -> bool {
        self.identity_checked
    }

    pub(crate) fn mark_identity_checked(&mut self) {
        self.identity_checked = true;
    }

    pub(crate) fn bind_identity(&mut self, identity: impl Into<String>) {
        self.bound_identity = Some(identity.into());
    }

    pub(crate) fn record_outcome(&mut self, outcome: ModuleOutcome) {
        self.link_results.push(outcome);
    }

    pub(crate) fn replace_shared_state(&mut self, shared: SharedState) {
        self.shared_state = shared;
    }

    pub(crate) fn advance_to(&mut self, index: usize) {
        self.current_link_index = index;
    }

    /// Park the attempt awaiting answers to `callbacks`
    pub(crate) fn suspend(&mut self, callbacks: Vec<Callback>) {
        self.pending_callbacks = callbacks;
        self.round += 1;
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Callback> {
        std::mem::take(&mut self.pending_callbacks)
    }

    pub(crate) fn extend_deadline(&mut self, expires_at: u64) {
        self.expires_at = expires_at;
    }

    /// Move to a terminal status. A terminal state is never left again.
    pub(crate) fn terminate(&mut self, status: OverallStatus, cause: Option<FailureCause>) {
        if self.is_terminal() || !status.is_terminal() {
            return;
        }
        self.overall_status = status;
        self.failure_cause = cause;
        self.pending_callbacks.clear();
    }
}
