//! Chain criteria semantics
//!
//! Pure functions over the outcomes recorded so far. [`apply`] decides,
//! after one link completes, whether the chain stops and with what status;
//! [`finalize`] computes the verdict once the chain runs out of links.
//!
//! | criterion  | on success                                   | on failure              |
//! |------------|----------------------------------------------|-------------------------|
//! | REQUISITE  | continue                                     | stop, FAILURE           |
//! | REQUIRED   | continue                                     | continue, cannot succeed|
//! | SUFFICIENT | stop, SUCCESS (unless a mandatory link failed)| continue                |
//! | OPTIONAL   | continue                                     | continue                |

use turnstile_common::Criterion;

use crate::state::{ModuleOutcome, OverallStatus, Verdict};

/// Whether the evaluator moves on after a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Result of applying a link's criterion to its verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub step: Step,
    pub status: OverallStatus,
}

impl Decision {
    const fn proceed() -> Self {
        Self {
            step: Step::Continue,
            status: OverallStatus::InProgress,
        }
    }

    const fn stop(status: OverallStatus) -> Self {
        Self {
            step: Step::Stop,
            status,
        }
    }
}

/// A REQUIRED or REQUISITE link has failed
#[must_use]
pub fn mandatory_failed(outcomes: &[ModuleOutcome]) -> bool {
    outcomes
        .iter()
        .any(|o| o.criterion.is_mandatory() && !o.verdict.is_success())
}

/// Apply `criterion` to the `verdict` of the link that just completed.
///
/// `prior` holds the outcomes of the links evaluated before it.
#[must_use]
pub fn apply(prior: &[ModuleOutcome], criterion: Criterion, verdict: Verdict) -> Decision {
    match (criterion, verdict.is_success()) {
        (Criterion::Requisite, false) => Decision::stop(OverallStatus::Failure),
        (Criterion::Sufficient, true) if !mandatory_failed(prior) => {
            Decision::stop(OverallStatus::Success)
        }
        _ => Decision::proceed(),
    }
}

/// Overall verdict once every reachable link has been evaluated.
///
/// Succeeds iff at least one evaluated link succeeded and no mandatory link
/// failed. A chain of only OPTIONAL links therefore needs one OPTIONAL
/// success.
#[must_use]
pub fn finalize(outcomes: &[ModuleOutcome]) -> OverallStatus {
    if mandatory_failed(outcomes) {
        return OverallStatus::Failure;
    }
    if outcomes.iter().any(|o| o.verdict.is_success()) {
        OverallStatus::Success
    } else {
        OverallStatus::Failure
    }
}
