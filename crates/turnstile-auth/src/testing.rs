//! Scripted modules for engine tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::callback::Callback;
use crate::error::ModuleError;
use crate::module::{AuthModule, ModuleContext, ModuleResponse, ModuleVerdict, NextLink};

enum Script {
    Succeed,
    Fail(String),
    /// Ask for a code, succeed if it matches
    Challenge { prompt: String, expected: String },
    Jump(NextLink),
    /// Backend unavailable for the first N invocations
    Flaky(AtomicU32),
    /// Scribbles on the shared state, then errors
    Broken,
}

pub struct ScriptedModule {
    script: Script,
    principal: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedModule {
    fn new(script: Script) -> Self {
        Self {
            script,
            principal: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeed() -> Self {
        Self::new(Script::Succeed)
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::new(Script::Fail(reason.into()))
    }

    pub fn challenge(prompt: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::new(Script::Challenge {
            prompt: prompt.into(),
            expected: expected.into(),
        })
    }

    pub fn jump(next: NextLink) -> Self {
        Self::new(Script::Jump(next))
    }

    pub fn flaky(failures: u32) -> Self {
        Self::new(Script::Flaky(AtomicU32::new(failures)))
    }

    pub fn broken() -> Self {
        Self::new(Script::Broken)
    }

    /// Attach a principal to every verdict
    pub fn as_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn finish(&self, verdict: ModuleVerdict) -> ModuleResponse {
        match &self.principal {
            Some(p) => verdict.with_principal(p.clone()).into(),
            None => verdict.into(),
        }
    }
}

#[async_trait]
impl AuthModule for ScriptedModule {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        ctx: &mut ModuleContext<'_>,
        answers: Option<&[Callback]>,
    ) -> Result<ModuleResponse, ModuleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => Ok(self.finish(ModuleVerdict::success())),
            Script::Fail(reason) => Ok(self.finish(ModuleVerdict::failure(reason.clone()))),
            Script::Challenge { prompt, expected } => match answers {
                None => {
                    ctx.shared
                        .insert_str(format!("challenge.{}", ctx.link_index), prompt.clone());
                    Ok(ModuleResponse::challenge(vec![Callback::text(prompt.clone())]))
                }
                Some(answers) if answers.first().and_then(Callback::value) == Some(expected.as_str()) => {
                    Ok(self.finish(ModuleVerdict::success()))
                }
                Some(_) => Ok(self.finish(ModuleVerdict::failure("wrong code"))),
            },
            Script::Jump(next) => Ok(self.finish(ModuleVerdict::success().with_next_link(next.clone()))),
            Script::Flaky(remaining) => {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(ModuleError::Unavailable("backend down".into()));
                }
                Ok(self.finish(ModuleVerdict::success()))
            }
            Script::Broken => {
                ctx.shared.insert_str("scratch", "partial");
                Err(ModuleError::Internal("module crashed".into()))
            }
        }
    }
}
