//! Configuration types for Turnstile
//!
//! Configuration is loaded once at startup from a TOML file layered with
//! `TURNSTILE__*` environment overrides, and treated as immutable for the
//! lifetime of the process.

use crate::error::{Error, Result};
use crate::types::Criterion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides (e.g. `TURNSTILE__LOCKOUT__THRESHOLD`)
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Root configuration for Turnstile
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine behaviour
    pub engine: EngineConfig,
    /// Lockout and failure accounting
    pub lockout: LockoutConfig,
    /// Cluster node affinity
    pub cluster: ClusterConfig,
    /// Named module bindings
    pub modules: Vec<ModuleConfig>,
    /// Authentication chains by name
    pub chains: BTreeMap<String, ChainConfig>,
    /// Seed identities for the in-memory identity store
    pub users: Vec<UserSeedConfig>,
}

impl Config {
    /// Load configuration from a TOML file plus environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::deserialization(e.to_string()))?;
        config.validate()?;
        tracing::debug!(
            path = %path.as_ref().display(),
            chains = config.chains.len(),
            modules = config.modules.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::deserialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural consistency of the configuration
    pub fn validate(&self) -> Result<()> {
        self.lockout.validate()?;

        let mut names = HashSet::new();
        for module in &self.modules {
            if module.name.is_empty() {
                return Err(Error::configuration("module binding with empty name"));
            }
            if !names.insert(module.name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate module binding: {}",
                    module.name
                )));
            }
        }

        for (name, chain) in &self.chains {
            chain.validate(name)?;
        }

        if let Some(default) = &self.engine.default_chain {
            if !self.chains.contains_key(default) {
                return Err(Error::configuration(format!(
                    "default chain {default} is not defined"
                )));
            }
        }

        Ok(())
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds a suspended attempt may wait for its next round
    pub attempt_timeout_secs: u64,
    /// Retries for transient identity-store and module failures
    pub backend_retries: u32,
    /// Base backoff between retries (milliseconds, grows linearly)
    pub retry_backoff_ms: u64,
    /// HMAC secret for resumable attempt tokens
    pub token_key: Option<String>,
    /// Chain used when the caller names none
    pub default_chain: Option<String>,
}

impl EngineConfig {
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 300,
            backend_retries: 3,
            retry_backoff_ms: 50,
            token_key: None,
            default_chain: None,
        }
    }
}

/// Lockout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Enable failure accounting and lockout
    pub enabled: bool,
    /// Failures within the window that trigger a lockout
    pub threshold: u32,
    /// Rolling failure window (seconds)
    pub window_secs: u64,
    /// Lockout duration (seconds)
    pub duration_secs: u64,
    /// Factor applied to the duration for each consecutive lockout
    pub duration_multiplier: u32,
    /// Upper bound for escalated lockout durations (seconds)
    pub max_duration_secs: u64,
}

impl LockoutConfig {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.threshold == 0 {
            return Err(Error::configuration("lockout threshold must be at least 1"));
        }
        if self.window_secs == 0 {
            return Err(Error::configuration("lockout window must be non-zero"));
        }
        if self.duration_multiplier == 0 {
            return Err(Error::configuration(
                "lockout duration multiplier must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_secs: 300,
            duration_secs: 900,
            duration_multiplier: 1,
            max_duration_secs: 24 * 60 * 60,
        }
    }
}

/// Cluster configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Id of this node; attempts issued here are tagged with it
    pub local_node: Option<String>,
    /// Known nodes in compact `url|id` encoding
    pub nodes: Vec<String>,
}

/// A named module instance bound to a factory kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Fully-qualified instance name referenced by chain links
    pub name: String,
    /// Factory kind that builds the instance
    pub kind: String,
    /// Instance options passed to the factory
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// An authentication chain definition
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    pub links: Vec<LinkConfig>,
}

impl ChainConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.links.is_empty() {
            return Err(Error::configuration(format!("chain {name} has no links")));
        }
        let mut labels = HashSet::new();
        for link in &self.links {
            if link.module.is_empty() {
                return Err(Error::configuration(format!(
                    "chain {name} has a link without a module"
                )));
            }
            if let Some(label) = &link.label {
                if !labels.insert(label.as_str()) {
                    return Err(Error::configuration(format!(
                        "chain {name} repeats link label {label}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One link of a chain
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Module instance name
    pub module: String,
    /// Pass/fail criterion
    pub criterion: Criterion,
    /// Optional label that modules can jump to
    #[serde(default)]
    pub label: Option<String>,
    /// Per-link module options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Seed identity for the in-memory identity store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSeedConfig {
    pub id: String,
    /// Raw directory status value
    #[serde(default = "default_user_status")]
    pub status: String,
    /// Hex SHA-256 digest of the password
    #[serde(default)]
    pub password_sha256: Option<String>,
}

fn default_user_status() -> String {
    "Active".to_string()
}
