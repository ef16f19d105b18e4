//! Engine, module and identity-store error types

use thiserror::Error;

use crate::callback::CallbackMismatch;

/// Errors surfaced by the authentication engine to its caller.
///
/// Credential failures are not errors: they are module outcomes that drive
/// the chain criteria and end in a generic failure verdict.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authentication module not registered: {0}")]
    ModuleNotFound(String),

    #[error("authentication chain not found: {0}")]
    ChainNotFound(String),

    #[error("callback mismatch: {0}")]
    CallbackMismatch(#[from] CallbackMismatch),

    #[error("malformed node entry: {0}")]
    MalformedEntry(String),

    #[error("stale round: attempt expects round {expected}, request answered round {actual}")]
    StaleRound { expected: u32, actual: u32 },

    #[error("attempt {0} is already being resumed")]
    ConcurrentResumption(String),

    #[error("attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("invalid jump from link {from} to {target}")]
    InvalidJump { from: usize, target: String },

    #[error("identity conflict: attempt bound to {bound}, module resolved {resolved}")]
    IdentityConflict { bound: String, resolved: String },

    #[error("invalid attempt token: {0}")]
    InvalidToken(String),

    #[error("attempt belongs to node {node_id}")]
    WrongNode {
        node_id: String,
        redirect_url: Option<String>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the attempt cannot continue after this error
    #[must_use]
    pub fn is_fatal_for_attempt(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound(_)
                | Self::ChainNotFound(_)
                | Self::CallbackMismatch(_)
                | Self::InvalidJump { .. }
                | Self::IdentityConflict { .. }
                | Self::InvalidToken(_)
                | Self::Internal(_)
        )
    }

    /// Whether this reflects a deployment fault rather than a client problem
    #[must_use]
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound(_) | Self::ChainNotFound(_) | Self::Configuration(_)
        )
    }
}

impl From<turnstile_common::Error> for EngineError {
    fn from(err: turnstile_common::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Errors raised by an authentication module while it runs.
///
/// These are infrastructure faults, never credential verdicts.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("module misconfigured: {0}")]
    Configuration(String),

    #[error("internal module error: {0}")]
    Internal(String),
}

impl ModuleError {
    /// Transient faults are retried at the module boundary
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("shared state: {err}"))
    }
}

impl From<StoreError> for ModuleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Identity store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("identity already exists: {0}")]
    AlreadyExists(String),

    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    #[error("identity store error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
