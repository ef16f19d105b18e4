//! Core types shared across Turnstile components

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time as unix milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Pass/fail criterion attached to a chain link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Criterion {
    /// Must succeed; evaluation continues after a failure
    #[serde(alias = "required", alias = "Required")]
    Required,
    /// Must succeed; a failure ends the chain immediately
    #[serde(alias = "requisite", alias = "Requisite")]
    Requisite,
    /// Success ends the chain unless a mandatory link already failed
    #[serde(alias = "sufficient", alias = "Sufficient")]
    Sufficient,
    /// Never decisive on its own
    #[serde(alias = "optional", alias = "Optional")]
    Optional,
}

impl Criterion {
    /// Configuration spelling of the criterion
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::Requisite => "REQUISITE",
            Self::Sufficient => "SUFFICIENT",
            Self::Optional => "OPTIONAL",
        }
    }

    /// Whether a failure of this link rules out overall success
    #[must_use]
    pub const fn is_mandatory(self) -> bool {
        matches!(self, Self::Required | Self::Requisite)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criterion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REQUIRED" => Ok(Self::Required),
            "REQUISITE" => Ok(Self::Requisite),
            "SUFFICIENT" => Ok(Self::Sufficient),
            "OPTIONAL" => Ok(Self::Optional),
            other => Err(Error::invalid_argument(format!("unknown criterion: {other}"))),
        }
    }
}

/// Lifecycle status of an identity as seen by the login engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentityStatus {
    Active,
    Inactive,
    Deleted,
    Locked,
}

impl IdentityStatus {
    /// Normalize a raw identity-store status value.
    ///
    /// Only an `Active` raw value (case-insensitive) maps to [`IdentityStatus::Active`].
    /// `Deleted`, `Inactive` and anything unrecognised map to
    /// [`IdentityStatus::Inactive`]: a deleted identity is indistinguishable from
    /// a deactivated one for login purposes. `Locked` is never derived from the
    /// raw value; it comes from lockout accounting.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }

    /// Whether an identity in this status may log in
    #[must_use]
    pub const fn permits_login(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Deleted => "DELETED",
            Self::Locked => "LOCKED",
        };
        f.write_str(s)
    }
}

/// Opaque correlation token for one login attempt.
///
/// When the issuing process belongs to a cluster the owning node id is
/// appended after a `.` so follow-up rounds can be routed back to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    /// Generate a fresh attempt id, optionally tagged with the owning node
    #[must_use]
    pub fn generate(node_id: Option<&str>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        match node_id {
            Some(node) if !node.is_empty() => Self(format!("{id}.{node}")),
            _ => Self(id),
        }
    }

    /// Node id embedded in the attempt id, if any
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        self.0
            .split_once('.')
            .map(|(_, node)| node)
            .filter(|node| !node.is_empty())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AttemptId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AttemptId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
