//! Confirmation module

use async_trait::async_trait;
use turnstile_common::config::ModuleConfig;

use super::{missing_option, option_list};
use crate::callback::Callback;
use crate::error::{EngineError, ModuleError};
use crate::module::{AuthModule, ModuleContext, ModuleResponse, ModuleVerdict};

pub const KIND: &str = "consent";

/// Asks the user to confirm; succeeds only on the accepting option.
///
/// Options: `prompt`, `options` (comma separated, default `Accept,Decline`)
/// and `accept` (default: the first option).
#[derive(Debug)]
pub struct ConsentModule {
    prompt: String,
    options: Vec<String>,
    accept: String,
}

impl ConsentModule {
    pub fn from_config(binding: &ModuleConfig) -> Result<Self, EngineError> {
        let mut options = option_list(binding.options.get("options"));
        if options.is_empty() {
            options = vec!["Accept".to_string(), "Decline".to_string()];
        }
        let accept = match binding.options.get("accept") {
            Some(accept) if options.contains(accept) => accept.clone(),
            Some(_) => return Err(missing_option(binding, "accept (one of options)")),
            None => options[0].clone(),
        };
        Ok(Self {
            prompt: binding
                .options
                .get("prompt")
                .cloned()
                .unwrap_or_else(|| "Do you accept the terms?".to_string()),
            options,
            accept,
        })
    }
}

#[async_trait]
impl AuthModule for ConsentModule {
    fn name(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        _ctx: &mut ModuleContext<'_>,
        answers: Option<&[Callback]>,
    ) -> Result<ModuleResponse, ModuleError> {
        let Some(answers) = answers else {
            return Ok(ModuleResponse::challenge(vec![Callback::confirmation(
                self.prompt.clone(),
                self.options.clone(),
            )]));
        };

        let accepted = answers
            .first()
            .and_then(Callback::selected_label)
            .is_some_and(|label| label == self.accept);
        if accepted {
            Ok(ModuleVerdict::success().into())
        } else {
            Ok(ModuleVerdict::failure("consent declined").into())
        }
    }
}
