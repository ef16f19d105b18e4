//! Callback exchange protocol
//!
//! A module that needs input from the client suspends with an ordered list
//! of [`Callback`]s. The transport presents them and sends back the same
//! list with the value slots filled in. The engine persists the pending
//! list verbatim and checks on resumption that the answers line up with it
//! one-to-one: same count, same variant, same challenge text. Any deviation
//! is a protocol violation, never coerced.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A typed challenge unit exchanged with the client
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Callback {
    /// Free-text input echoed back to the user
    TextPrompt {
        prompt: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Input that must not be echoed (passwords, codes)
    SecretPrompt {
        prompt: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Pick one of several choices
    Choice {
        prompt: String,
        choices: Vec<String>,
        #[serde(default)]
        default: Option<usize>,
        #[serde(default)]
        selected: Option<usize>,
    },
    /// Confirm with one of a fixed set of options
    Confirmation {
        prompt: String,
        options: Vec<String>,
        #[serde(default)]
        selected: Option<usize>,
    },
    /// Value carried through the client without being shown
    HiddenValue {
        id: String,
        #[serde(default)]
        value: Option<String>,
    },
}

/// Variant discriminant, used for shape checks and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    TextPrompt,
    SecretPrompt,
    Choice,
    Confirmation,
    HiddenValue,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TextPrompt => "text_prompt",
            Self::SecretPrompt => "secret_prompt",
            Self::Choice => "choice",
            Self::Confirmation => "confirmation",
            Self::HiddenValue => "hidden_value",
        };
        f.write_str(s)
    }
}

impl Callback {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::TextPrompt {
            prompt: prompt.into(),
            value: None,
        }
    }

    pub fn secret(prompt: impl Into<String>) -> Self {
        Self::SecretPrompt {
            prompt: prompt.into(),
            value: None,
        }
    }

    pub fn choice(prompt: impl Into<String>, choices: Vec<String>) -> Self {
        Self::Choice {
            prompt: prompt.into(),
            choices,
            default: None,
            selected: None,
        }
    }

    pub fn confirmation(prompt: impl Into<String>, options: Vec<String>) -> Self {
        Self::Confirmation {
            prompt: prompt.into(),
            options,
            selected: None,
        }
    }

    pub fn hidden(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HiddenValue {
            id: id.into(),
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CallbackKind {
        match self {
            Self::TextPrompt { .. } => CallbackKind::TextPrompt,
            Self::SecretPrompt { .. } => CallbackKind::SecretPrompt,
            Self::Choice { .. } => CallbackKind::Choice,
            Self::Confirmation { .. } => CallbackKind::Confirmation,
            Self::HiddenValue { .. } => CallbackKind::HiddenValue,
        }
    }

    /// Prompt text (or id for hidden values)
    #[must_use]
    pub fn prompt(&self) -> &str {
        match self {
            Self::TextPrompt { prompt, .. }
            | Self::SecretPrompt { prompt, .. }
            | Self::Choice { prompt, .. }
            | Self::Confirmation { prompt, .. } => prompt,
            Self::HiddenValue { id, .. } => id,
        }
    }

    /// Answered string value for text, secret and hidden callbacks
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::TextPrompt { value, .. }
            | Self::SecretPrompt { value, .. }
            | Self::HiddenValue { value, .. } => value.as_deref(),
            Self::Choice { .. } | Self::Confirmation { .. } => None,
        }
    }

    /// Selected index for choice and confirmation callbacks
    #[must_use]
    pub const fn selected(&self) -> Option<usize> {
        match self {
            Self::Choice { selected, .. } | Self::Confirmation { selected, .. } => *selected,
            _ => None,
        }
    }

    /// Label of the selected option, if any
    #[must_use]
    pub fn selected_label(&self) -> Option<&str> {
        match self {
            Self::Choice {
                choices, selected, ..
            } => selected.and_then(|i| choices.get(i)).map(String::as_str),
            Self::Confirmation {
                options, selected, ..
            } => selected.and_then(|i| options.get(i)).map(String::as_str),
            _ => None,
        }
    }

    /// Fill the value slot of a text, secret or hidden callback
    #[must_use]
    pub fn answer(mut self, answer: impl Into<String>) -> Self {
        match &mut self {
            Self::TextPrompt { value, .. }
            | Self::SecretPrompt { value, .. }
            | Self::HiddenValue { value, .. } => *value = Some(answer.into()),
            Self::Choice { .. } | Self::Confirmation { .. } => {}
        }
        self
    }

    /// Select an option of a choice or confirmation callback
    #[must_use]
    pub fn select(mut self, index: usize) -> Self {
        match &mut self {
            Self::Choice { selected, .. } | Self::Confirmation { selected, .. } => {
                *selected = Some(index);
            }
            _ => {}
        }
        self
    }

    /// Whether the value slot has been filled
    #[must_use]
    pub const fn is_answered(&self) -> bool {
        match self {
            Self::TextPrompt { value, .. }
            | Self::SecretPrompt { value, .. }
            | Self::HiddenValue { value, .. } => value.is_some(),
            Self::Choice { selected, .. } | Self::Confirmation { selected, .. } => {
                selected.is_some()
            }
        }
    }

    /// Same variant and same challenge, ignoring answers
    fn same_challenge(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::TextPrompt { prompt: a, .. }, Self::TextPrompt { prompt: b, .. })
            | (Self::SecretPrompt { prompt: a, .. }, Self::SecretPrompt { prompt: b, .. })
            | (Self::HiddenValue { id: a, .. }, Self::HiddenValue { id: b, .. }) => a == b,
            (
                Self::Choice {
                    prompt: a,
                    choices: ca,
                    ..
                },
                Self::Choice {
                    prompt: b,
                    choices: cb,
                    ..
                },
            )
            | (
                Self::Confirmation {
                    prompt: a,
                    options: ca,
                    ..
                },
                Self::Confirmation {
                    prompt: b,
                    options: cb,
                    ..
                },
            ) => a == b && ca == cb,
            _ => false,
        }
    }

    fn option_count(&self) -> Option<usize> {
        match self {
            Self::Choice { choices, .. } => Some(choices.len()),
            Self::Confirmation { options, .. } => Some(options.len()),
            _ => None,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SecretPrompt { prompt, value } => f
                .debug_struct("SecretPrompt")
                .field("prompt", prompt)
                .field("value", &value.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::TextPrompt { prompt, value } => f
                .debug_struct("TextPrompt")
                .field("prompt", prompt)
                .field("value", value)
                .finish(),
            Self::Choice {
                prompt,
                choices,
                default,
                selected,
            } => f
                .debug_struct("Choice")
                .field("prompt", prompt)
                .field("choices", choices)
                .field("default", default)
                .field("selected", selected)
                .finish(),
            Self::Confirmation {
                prompt,
                options,
                selected,
            } => f
                .debug_struct("Confirmation")
                .field("prompt", prompt)
                .field("options", options)
                .field("selected", selected)
                .finish(),
            Self::HiddenValue { id, value } => f
                .debug_struct("HiddenValue")
                .field("id", id)
                .field("value", value)
                .finish(),
        }
    }
}

/// Protocol violations detected when answers come back
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackMismatch {
    #[error("expected {expected} answers, received {actual}")]
    Count { expected: usize, actual: usize },

    #[error("answer {index} is a {actual}, expected a {expected}")]
    Kind {
        index: usize,
        expected: CallbackKind,
        actual: CallbackKind,
    },

    #[error("answer {index} does not match the challenge that was issued")]
    Challenge { index: usize },

    #[error("answer {index} carries no value")]
    Unanswered { index: usize },

    #[error("answer {index} selects option {selected} of {available}")]
    OutOfRange {
        index: usize,
        selected: usize,
        available: usize,
    },

    #[error("no callbacks are pending for this attempt")]
    NothingPending,
}

/// Check answered callbacks against the pending challenge, in order.
///
/// Returns the answers unchanged when every entry matches its challenge.
pub fn match_answers(
    pending: &[Callback],
    answers: Vec<Callback>,
) -> Result<Vec<Callback>, CallbackMismatch> {
    if pending.is_empty() {
        return Err(CallbackMismatch::NothingPending);
    }
    if pending.len() != answers.len() {
        return Err(CallbackMismatch::Count {
            expected: pending.len(),
            actual: answers.len(),
        });
    }

    for (index, (asked, answer)) in pending.iter().zip(&answers).enumerate() {
        if asked.kind() != answer.kind() {
            return Err(CallbackMismatch::Kind {
                index,
                expected: asked.kind(),
                actual: answer.kind(),
            });
        }
        if !asked.same_challenge(answer) {
            return Err(CallbackMismatch::Challenge { index });
        }
        if !answer.is_answered() {
            return Err(CallbackMismatch::Unanswered { index });
        }
        if let (Some(selected), Some(available)) = (answer.selected(), answer.option_count()) {
            if selected >= available {
                return Err(CallbackMismatch::OutOfRange {
                    index,
                    selected,
                    available,
                });
            }
        }
    }

    Ok(answers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_challenge() -> Vec<Callback> {
        vec![Callback::text("User Name"), Callback::secret("Password")]
    }

    #[test]
    fn test_matching_answers_accepted() {
        let answers = vec![
            Callback::text("User Name").answer("alice"),
            Callback::secret("Password").answer("s3cret"),
        ];
        let matched = match_answers(&login_challenge(), answers).unwrap();
        assert_eq!(matched[0].value(), Some("alice"));
        assert_eq!(matched[1].value(), Some("s3cret"));
    }

    #[test]
    fn test_count_mismatch() {
        let answers = vec![Callback::text("User Name").answer("alice")];
        assert_eq!(
            match_answers(&login_challenge(), answers),
            Err(CallbackMismatch::Count {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_kind_mismatch() {
        let answers = vec![
            Callback::text("User Name").answer("alice"),
            Callback::text("Password").answer("s3cret"),
        ];
        assert!(matches!(
            match_answers(&login_challenge(), answers),
            Err(CallbackMismatch::Kind { index: 1, .. })
        ));
    }

    #[test]
    fn test_altered_prompt_rejected() {
        let answers = vec![
            Callback::text("Login").answer("alice"),
            Callback::secret("Password").answer("s3cret"),
        ];
        assert_eq!(
            match_answers(&login_challenge(), answers),
            Err(CallbackMismatch::Challenge { index: 0 })
        );
    }

    #[test]
    fn test_unanswered_rejected() {
        let answers = vec![
            Callback::text("User Name").answer("alice"),
            Callback::secret("Password"),
        ];
        assert_eq!(
            match_answers(&login_challenge(), answers),
            Err(CallbackMismatch::Unanswered { index: 1 })
        );
    }

    #[test]
    fn test_selection_out_of_range() {
        let pending = vec![Callback::confirmation(
            "Accept terms?",
            vec!["Yes".into(), "No".into()],
        )];
        let answers = vec![pending[0].clone().select(2)];
        assert!(matches!(
            match_answers(&pending, answers),
            Err(CallbackMismatch::OutOfRange { selected: 2, .. })
        ));

        let answers = vec![pending[0].clone().select(0)];
        let matched = match_answers(&pending, answers).unwrap();
        assert_eq!(matched[0].selected_label(), Some("Yes"));
    }

    #[test]
    fn test_nothing_pending() {
        assert_eq!(
            match_answers(&[], vec![Callback::text("x").answer("y")]),
            Err(CallbackMismatch::NothingPending)
        );
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let cb = Callback::secret("Password").answer("hunter2");
        let debug = format!("{cb:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_serde_shape() {
        let cb = Callback::hidden("nonce", "abc");
        let json = serde_json::to_string(&cb).unwrap();
        assert!(json.contains("\"type\":\"hidden_value\""));
        let back: Callback = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cb);
    }
}
