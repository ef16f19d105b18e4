//! Authentication chain definitions
//!
//! A chain is an ordered list of links, each naming a module instance and
//! the criterion that governs its verdict. Definitions come from
//! configuration and are immutable once loaded; attempts refer to them by
//! name plus a digest, so a token minted against one definition is never
//! resumed against another.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use turnstile_common::config::ChainConfig;
use turnstile_common::{Config, Criterion};

use crate::error::EngineError;
use crate::module::NextLink;
use crate::registry::ModuleRegistry;

/// One configured step of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub module_name: String,
    pub criterion: Criterion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub module_options: BTreeMap<String, String>,
}

impl ChainLink {
    pub fn new(module_name: impl Into<String>, criterion: Criterion) -> Self {
        Self {
            module_name: module_name.into(),
            criterion,
            label: None,
            module_options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.module_options.insert(key.into(), value.into());
        self
    }
}

/// Immutable, ordered chain of links
#[derive(Debug, Clone)]
pub struct AuthenticationChainDefinition {
    name: String,
    links: Vec<ChainLink>,
    digest: String,
}

impl AuthenticationChainDefinition {
    /// Build a chain, rejecting empty chains and repeated labels
    pub fn new(name: impl Into<String>, links: Vec<ChainLink>) -> Result<Self, EngineError> {
        let name = name.into();
        if links.is_empty() {
            return Err(EngineError::Configuration(format!(
                "chain {name} has no links"
            )));
        }

        let mut labels = HashSet::new();
        for link in &links {
            if let Some(label) = &link.label {
                if !labels.insert(label.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "chain {name} repeats link label {label}"
                    )));
                }
            }
        }

        let encoded = serde_json::to_vec(&links)
            .map_err(|e| EngineError::Internal(format!("chain digest: {e}")))?;
        let digest = hex::encode(Sha256::digest(&encoded));

        Ok(Self {
            name,
            links,
            digest,
        })
    }

    /// Build a chain from its configuration section
    pub fn from_config(name: &str, config: &ChainConfig) -> Result<Self, EngineError> {
        let links = config
            .links
            .iter()
            .map(|link| ChainLink {
                module_name: link.module.clone(),
                criterion: link.criterion,
                label: link.label.clone(),
                module_options: link.options.clone(),
            })
            .collect();
        Self::new(name, links)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn link(&self, index: usize) -> Option<&ChainLink> {
        self.links.get(index)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Content digest of the links
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Resolve a jump hint to an existing link index
    pub fn resolve_hint(&self, hint: &NextLink) -> Option<usize> {
        match hint {
            NextLink::Index(i) => (*i < self.links.len()).then_some(*i),
            NextLink::Label(label) => self
                .links
                .iter()
                .position(|l| l.label.as_deref() == Some(label.as_str())),
        }
    }
}

/// Named chains available to the engine
#[derive(Debug, Default)]
pub struct ChainCatalog {
    chains: HashMap<String, Arc<AuthenticationChainDefinition>>,
    default_chain: Option<String>,
}

impl ChainCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from configuration
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut catalog = Self::new();
        for (name, chain) in &config.chains {
            catalog.insert(AuthenticationChainDefinition::from_config(name, chain)?);
        }
        if let Some(default) = &config.engine.default_chain {
            catalog.set_default(default)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, chain: AuthenticationChainDefinition) -> &mut Self {
        self.chains.insert(chain.name.clone(), Arc::new(chain));
        self
    }

    /// Chain used when the caller names none
    pub fn set_default(&mut self, name: &str) -> Result<&mut Self, EngineError> {
        if !self.chains.contains_key(name) {
            return Err(EngineError::ChainNotFound(name.to_string()));
        }
        self.default_chain = Some(name.to_string());
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<Arc<AuthenticationChainDefinition>, EngineError> {
        self.chains
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ChainNotFound(name.to_string()))
    }

    /// Resolve a requested chain name, falling back to the default chain
    pub fn resolve(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<AuthenticationChainDefinition>, EngineError> {
        match name.or(self.default_chain.as_deref()) {
            Some(name) => self.get(name),
            None => Err(EngineError::ChainNotFound("<default>".to_string())),
        }
    }

    /// Verify every link names a registered module
    pub fn check_bindings(&self, registry: &ModuleRegistry) -> Result<(), EngineError> {
        for chain in self.chains.values() {
            for link in &chain.links {
                if !registry.contains(&link.module_name) {
                    return Err(EngineError::ModuleNotFound(format!(
                        "{} (chain {})",
                        link.module_name, chain.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
