//! Pluggable authentication module trait and types
//!
//! Every module the engine loads satisfies one contract: given the shared
//! attempt state and, on resumption, the answers to the callbacks it asked
//! for, it either suspends with new callbacks or returns a verdict for its
//! link. What it verifies internally (a password, a code, a ticket) is its
//! own business.

use async_trait::async_trait;
use std::collections::BTreeMap;
use turnstile_common::AttemptId;

use crate::callback::Callback;
use crate::error::ModuleError;
use crate::shared::SharedState;
use crate::state::Verdict;

/// Non-sequential continuation requested by a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextLink {
    /// Absolute link index within the chain
    Index(usize),
    /// Link carrying this label
    Label(String),
}

impl std::fmt::Display for NextLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{i}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Terminal result of a module for its link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleVerdict {
    verdict: Verdict,
    failure_reason: Option<String>,
    next_link: Option<NextLink>,
    principal: Option<String>,
}

impl ModuleVerdict {
    /// The module accepted the presented factor
    #[must_use]
    pub const fn success() -> Self {
        Self {
            verdict: Verdict::Success,
            failure_reason: None,
            next_link: None,
            principal: None,
        }
    }

    /// The module rejected the presented factor
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Failure,
            failure_reason: Some(reason.into()),
            next_link: None,
            principal: None,
        }
    }

    /// Identity the module resolved (or that the attempt claims, on failure)
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Request a jump instead of advancing to the next link
    #[must_use]
    pub fn with_next_link(mut self, next: NextLink) -> Self {
        self.next_link = Some(next);
        self
    }

    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        self.verdict
    }

    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    #[must_use]
    pub const fn next_link(&self) -> Option<&NextLink> {
        self.next_link.as_ref()
    }

    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// What a module invocation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleResponse {
    /// Suspend the attempt until the client answers these callbacks
    Suspend(Vec<Callback>),
    /// The link is complete
    Outcome(ModuleVerdict),
}

impl ModuleResponse {
    #[must_use]
    pub fn challenge(callbacks: Vec<Callback>) -> Self {
        Self::Suspend(callbacks)
    }
}

impl From<ModuleVerdict> for ModuleResponse {
    fn from(verdict: ModuleVerdict) -> Self {
        Self::Outcome(verdict)
    }
}

/// View of the attempt handed to a module for one invocation
pub struct ModuleContext<'a> {
    /// Attempt correlation id, for logging
    pub attempt_id: &'a AttemptId,
    /// Index of the link being evaluated
    pub link_index: usize,
    /// Per-link options from the chain definition
    pub options: &'a BTreeMap<String, String>,
    /// Identity bound by an earlier module or the request, if any
    pub bound_identity: Option<&'a str>,
    /// Shared attempt state; the only part of the attempt a module may change
    pub shared: &'a mut SharedState,
}

impl ModuleContext<'_> {
    /// Link option, if set
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Boolean link option (`true`, `yes`, `1`)
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.option(key).is_some_and(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
        })
    }
}

/// Trait for pluggable authentication modules
#[async_trait]
pub trait AuthModule: Send + Sync {
    /// Module kind for logging
    fn name(&self) -> &str;

    /// Run the module for its link.
    ///
    /// `answers` is `None` on first entry to the link and carries the
    /// answered callbacks, in the order the module issued them, on every
    /// resumption.
    async fn invoke(
        &self,
        ctx: &mut ModuleContext<'_>,
        answers: Option<&[Callback]>,
    ) -> Result<ModuleResponse, ModuleError>;
}
