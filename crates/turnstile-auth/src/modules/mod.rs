//! Built-in authentication modules
//!
//! - `password`: user name and password against a credential store
//! - `consent`: accept or decline a confirmation
//! - `select`: let the user pick which link runs next

pub mod consent;
pub mod password;
pub mod select;

use std::sync::Arc;
use turnstile_common::config::ModuleConfig;

use crate::error::EngineError;
use crate::module::AuthModule;
use crate::registry::ModuleRegistryBuilder;

pub use consent::ConsentModule;
pub use password::{PasswordModule, PasswordVerifier};
pub use select::SelectModule;

/// Register factories for every built-in module kind
pub fn register_builtin(
    builder: &mut ModuleRegistryBuilder,
    verifier: Arc<dyn PasswordVerifier>,
) -> &mut ModuleRegistryBuilder {
    builder
        .register_factory(password::KIND, move |binding: &ModuleConfig| {
            Ok(Arc::new(PasswordModule::from_config(binding, Arc::clone(&verifier)))
                as Arc<dyn AuthModule>)
        })
        .register_factory(consent::KIND, |binding: &ModuleConfig| {
            Ok(Arc::new(ConsentModule::from_config(binding)?) as Arc<dyn AuthModule>)
        })
        .register_factory(select::KIND, |binding: &ModuleConfig| {
            Ok(Arc::new(SelectModule::from_config(binding)?) as Arc<dyn AuthModule>)
        })
}

/// Comma separated option list, trimmed, empty items dropped
pub(crate) fn option_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn missing_option(binding: &ModuleConfig, option: &str) -> EngineError {
    EngineError::Configuration(format!(
        "module {} ({}) needs option {option}",
        binding.name, binding.kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use crate::registry::ModuleRegistry;

    #[test]
    fn test_register_builtin_kinds() {
        let mut builder = ModuleRegistry::builder();
        register_builtin(&mut builder, Arc::new(MemoryIdentityStore::new()));
        builder
            .bind_all(&[
                ModuleConfig::new("ldap", "password"),
                ModuleConfig::new("terms", "consent"),
                ModuleConfig::new("factor", "select").with_option("choices", "sms, email"),
            ])
            .unwrap();
        let registry = builder.build();
        assert_eq!(registry.names(), vec!["factor", "ldap", "terms"]);
        assert_eq!(registry.resolve("ldap").unwrap().name(), "password");
    }

    #[test]
    fn test_select_requires_choices() {
        let mut builder = ModuleRegistry::builder();
        register_builtin(&mut builder, Arc::new(MemoryIdentityStore::new()));
        assert!(matches!(
            builder.bind(&ModuleConfig::new("factor", "select")),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_option_list() {
        let raw = " a, ,b ,c".to_string();
        assert_eq!(option_list(Some(&raw)), vec!["a", "b", "c"]);
        assert!(option_list(None).is_empty());
    }
}
