//! Module registry
//!
//! Resolves a configured module name to a loaded module instance. The table
//! is assembled once at startup from factory kinds plus named bindings and
//! is immutable afterwards. Several instances of one kind can live side by
//! side under different fully-qualified names; lookup is always exact and
//! never falls back to a default.

use std::collections::HashMap;
use std::sync::Arc;
use turnstile_common::config::ModuleConfig;

use crate::error::EngineError;
use crate::module::AuthModule;

/// Builds a module instance from its binding
pub type ModuleFactory =
    Box<dyn Fn(&ModuleConfig) -> Result<Arc<dyn AuthModule>, EngineError> + Send + Sync>;

/// Immutable name → module table
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn AuthModule>>,
}

impl ModuleRegistry {
    /// Start assembling a registry
    #[must_use]
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::new()
    }

    /// Resolve a module by its configured name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AuthModule>, EngineError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ModuleNotFound(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Registration table used during startup
#[derive(Default)]
pub struct ModuleRegistryBuilder {
    factories: HashMap<String, ModuleFactory>,
    modules: HashMap<String, Arc<dyn AuthModule>>,
}

impl ModuleRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a module kind
    pub fn register_factory<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ModuleConfig) -> Result<Arc<dyn AuthModule>, EngineError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    /// Register an already constructed module under a name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        module: Arc<dyn AuthModule>,
    ) -> Result<&mut Self, EngineError> {
        let name = name.into();
        if self.modules.contains_key(&name) {
            return Err(EngineError::Configuration(format!(
                "module {name} registered twice"
            )));
        }
        self.modules.insert(name, module);
        Ok(self)
    }

    /// Instantiate a configured binding through its kind's factory
    pub fn bind(&mut self, binding: &ModuleConfig) -> Result<&mut Self, EngineError> {
        let factory = self.factories.get(&binding.kind).ok_or_else(|| {
            EngineError::Configuration(format!(
                "module {} uses unknown kind {}",
                binding.name, binding.kind
            ))
        })?;
        let module = factory(binding)?;
        tracing::debug!(name = %binding.name, kind = %binding.kind, "bound authentication module");
        self.register(binding.name.clone(), module)
    }

    /// Instantiate every configured binding
    pub fn bind_all(&mut self, bindings: &[ModuleConfig]) -> Result<&mut Self, EngineError> {
        for binding in bindings {
            self.bind(binding)?;
        }
        Ok(self)
    }

    /// Freeze the table
    #[must_use]
    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            modules: self.modules,
        }
    }
}
