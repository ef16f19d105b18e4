//! User name and password module

use async_trait::async_trait;
use std::sync::Arc;
use turnstile_common::config::ModuleConfig;

use crate::callback::Callback;
use crate::error::{ModuleError, StoreError};
use crate::identity::MemoryIdentityStore;
use crate::module::{AuthModule, ModuleContext, ModuleResponse, ModuleVerdict};
use crate::shared::USERNAME_KEY;

pub const KIND: &str = "password";

/// Credential check used by [`PasswordModule`]
#[async_trait]
pub trait PasswordVerifier: Send + Sync {
    async fn verify_password(&self, identity: &str, password: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl PasswordVerifier for MemoryIdentityStore {
    async fn verify_password(&self, identity: &str, password: &str) -> Result<bool, StoreError> {
        Self::verify_password(self, identity, password)
    }
}

/// Prompts for a user name and password and verifies them.
///
/// Link options:
/// - `use_shared_username`: reuse a user name collected by an earlier link
///   and only ask for the password
/// - `username_prompt`, `password_prompt`: prompt texts
pub struct PasswordModule {
    verifier: Arc<dyn PasswordVerifier>,
    username_prompt: String,
    password_prompt: String,
}

impl PasswordModule {
    pub fn new(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self {
            verifier,
            username_prompt: "User Name".to_string(),
            password_prompt: "Password".to_string(),
        }
    }

    pub fn from_config(binding: &ModuleConfig, verifier: Arc<dyn PasswordVerifier>) -> Self {
        let mut module = Self::new(verifier);
        if let Some(prompt) = binding.options.get("username_prompt") {
            module.username_prompt.clone_from(prompt);
        }
        if let Some(prompt) = binding.options.get("password_prompt") {
            module.password_prompt.clone_from(prompt);
        }
        module
    }

    fn username_prompt<'a>(&'a self, ctx: &'a ModuleContext<'_>) -> &'a str {
        ctx.option("username_prompt").unwrap_or(&self.username_prompt)
    }

    fn password_prompt<'a>(&'a self, ctx: &'a ModuleContext<'_>) -> &'a str {
        ctx.option("password_prompt").unwrap_or(&self.password_prompt)
    }

    fn shared_username(ctx: &ModuleContext<'_>) -> Option<String> {
        if !ctx.flag("use_shared_username") {
            return None;
        }
        ctx.shared
            .get_str(USERNAME_KEY)
            .or(ctx.bound_identity)
            .filter(|u| !u.is_empty())
            .map(String::from)
    }
}

#[async_trait]
impl AuthModule for PasswordModule {
    fn name(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        ctx: &mut ModuleContext<'_>,
        answers: Option<&[Callback]>,
    ) -> Result<ModuleResponse, ModuleError> {
        let shared_username = Self::shared_username(ctx);

        let Some(answers) = answers else {
            let mut callbacks = Vec::with_capacity(2);
            if shared_username.is_none() {
                callbacks.push(Callback::text(self.username_prompt(ctx)));
            }
            callbacks.push(Callback::secret(self.password_prompt(ctx)));
            return Ok(ModuleResponse::challenge(callbacks));
        };

        let (username, password) = match (shared_username, answers) {
            (Some(username), [password]) => (username, password.value()),
            (None, [username, password]) => (
                username.value().unwrap_or_default().trim().to_string(),
                password.value(),
            ),
            _ => {
                return Err(ModuleError::Internal(format!(
                    "unexpected answer count {}",
                    answers.len()
                )));
            }
        };
        let password = password.unwrap_or_default();

        if username.is_empty() {
            return Ok(ModuleVerdict::failure("missing user name").into());
        }

        if self.verifier.verify_password(&username, password).await? {
            ctx.shared.insert_str(USERNAME_KEY, username.as_str());
            tracing::debug!(attempt = %ctx.attempt_id, user = %username, "password accepted");
            Ok(ModuleVerdict::success().with_principal(username).into())
        } else {
            Ok(ModuleVerdict::failure("invalid credentials")
                .with_principal(username)
                .into())
        }
    }
}
