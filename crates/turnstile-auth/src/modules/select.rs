//! Link selection module

use async_trait::async_trait;
use turnstile_common::config::ModuleConfig;

use super::{missing_option, option_list};
use crate::callback::Callback;
use crate::error::{EngineError, ModuleError};
use crate::module::{AuthModule, ModuleContext, ModuleResponse, ModuleVerdict, NextLink};

pub const KIND: &str = "select";

/// Shared state key holding the label the user picked
pub const SELECTED_KEY: &str = "turnstile.selected";

/// Offers a choice of link labels and jumps to the one picked.
///
/// Options: `choices` (comma separated link labels, required) and `prompt`.
#[derive(Debug)]
pub struct SelectModule {
    prompt: String,
    choices: Vec<String>,
}

impl SelectModule {
    pub fn from_config(binding: &ModuleConfig) -> Result<Self, EngineError> {
        let choices = option_list(binding.options.get("choices"));
        if choices.is_empty() {
            return Err(missing_option(binding, "choices"));
        }
        Ok(Self {
            prompt: binding
                .options
                .get("prompt")
                .cloned()
                .unwrap_or_else(|| "Choose how to continue".to_string()),
            choices,
        })
    }
}

#[async_trait]
impl AuthModule for SelectModule {
    fn name(&self) -> &str {
        KIND
    }

    async fn invoke(
        &self,
        ctx: &mut ModuleContext<'_>,
        answers: Option<&[Callback]>,
    ) -> Result<ModuleResponse, ModuleError> {
        let Some(answers) = answers else {
            return Ok(ModuleResponse::challenge(vec![Callback::choice(
                self.prompt.clone(),
                self.choices.clone(),
            )]));
        };

        let Some(label) = answers.first().and_then(Callback::selected_label) else {
            return Ok(ModuleVerdict::failure("nothing selected").into());
        };
        ctx.shared.insert_str(SELECTED_KEY, label);
        Ok(ModuleVerdict::success()
            .with_next_link(NextLink::Label(label.to_string()))
            .into())
    }
}
