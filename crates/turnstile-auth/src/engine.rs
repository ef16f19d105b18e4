//! Chain evaluator
//!
//! [`AuthEngine`] runs login attempts through their chains. An attempt is
//! driven link by link until a module asks for input, at which point the
//! state is sealed into a token and parked in the attempt store. The next
//! request checks the attempt out exclusively, verifies the round and the
//! answers, and carries on from the same link.
//!
//! Credential failures never surface as errors. Callers see a generic
//! failure; the reason stays in the audit log (`turnstile::audit`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use turnstile_common::config::EngineConfig;
use turnstile_common::{AttemptId, Config, now_millis};

use crate::affinity::NodeAffinityRegistry;
use crate::attempts::{AttemptLease, AttemptStore};
use crate::callback::{Callback, match_answers};
use crate::chain::{AuthenticationChainDefinition, ChainCatalog, ChainLink};
use crate::criteria::{self, Step};
use crate::error::{EngineError, ModuleError};
use crate::lockout::LockoutTracker;
use crate::module::{AuthModule, ModuleContext, ModuleResponse};
use crate::registry::ModuleRegistry;
use crate::shared::SharedState;
use crate::state::{ChainExecutionState, FailureCause, ModuleOutcome, OverallStatus, Verdict};
use crate::status::{IdentityStore, StatusGate};
use crate::token::TokenCodec;

/// Tracing target for audit events
pub const AUDIT_TARGET: &str = "turnstile::audit";

/// Engine statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    pub attempts_started: AtomicU64,
    pub attempts_succeeded: AtomicU64,
    pub attempts_failed: AtomicU64,
    pub attempts_aborted: AtomicU64,
    pub attempts_expired: AtomicU64,
    pub rounds_suspended: AtomicU64,
    pub stale_rounds: AtomicU64,
}

impl EngineStats {
    /// Share of concluded attempts that succeeded (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn success_ratio(&self) -> f64 {
        let succeeded = self.attempts_succeeded.load(Ordering::Relaxed) as f64;
        let failed = self.attempts_failed.load(Ordering::Relaxed) as f64;
        let aborted = self.attempts_aborted.load(Ordering::Relaxed) as f64;
        let total = succeeded + failed + aborted;
        if total == 0.0 { 0.0 } else { succeeded / total }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.attempts_started.store(0, Ordering::Relaxed);
        self.attempts_succeeded.store(0, Ordering::Relaxed);
        self.attempts_failed.store(0, Ordering::Relaxed);
        self.attempts_aborted.store(0, Ordering::Relaxed);
        self.attempts_expired.store(0, Ordering::Relaxed);
        self.rounds_suspended.store(0, Ordering::Relaxed);
        self.stale_rounds.store(0, Ordering::Relaxed);
    }
}

/// Identity and state handed to the session layer on success
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedSession {
    pub identity: Option<String>,
    pub chain: String,
    pub shared_state: SharedState,
}

/// What the caller sees after a round
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptStatus {
    /// Present these callbacks and send the answers back with the same round
    Challenge(Vec<Callback>),
    Success(AuthenticatedSession),
    /// Generic failure; the cause is only audited
    Failure,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResponse {
    pub attempt_id: AttemptId,
    /// Round the answers must quote
    pub round: u32,
    pub status: AttemptStatus,
}

impl AttemptResponse {
    #[must_use]
    pub fn callbacks(&self) -> Option<&[Callback]> {
        match &self.status {
            AttemptStatus::Challenge(callbacks) => Some(callbacks),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.status, AttemptStatus::Challenge(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    attempt_timeout_ms: u64,
    retries: u32,
    backoff: Duration,
}

impl From<&EngineConfig> for Settings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            attempt_timeout_ms: config.attempt_timeout_secs.saturating_mul(1000),
            retries: config.backend_retries,
            backoff: config.retry_backoff(),
        }
    }
}

/// Authentication chain orchestration engine
pub struct AuthEngine {
    chains: ChainCatalog,
    modules: ModuleRegistry,
    gate: StatusGate,
    lockout: Arc<LockoutTracker>,
    nodes: NodeAffinityRegistry,
    attempts: AttemptStore,
    codec: TokenCodec,
    settings: Settings,
    stats: EngineStats,
}

impl AuthEngine {
    /// Build an engine with the chains defined in `config`
    pub fn new(
        config: &Config,
        modules: ModuleRegistry,
        identities: Arc<dyn IdentityStore>,
    ) -> Result<Self, EngineError> {
        let chains = ChainCatalog::from_config(config)?;
        Self::with_chains(config, chains, modules, identities)
    }

    /// Build an engine over an explicit chain catalog.
    ///
    /// Fails if any chain link names a module the registry does not hold.
    pub fn with_chains(
        config: &Config,
        chains: ChainCatalog,
        modules: ModuleRegistry,
        identities: Arc<dyn IdentityStore>,
    ) -> Result<Self, EngineError> {
        chains.check_bindings(&modules)?;

        let settings = Settings::from(&config.engine);
        let lockout = Arc::new(LockoutTracker::new(&config.lockout));
        let gate = StatusGate::new(identities, Arc::clone(&lockout))
            .with_retries(settings.retries, settings.backoff);
        let nodes = NodeAffinityRegistry::from_encoded(
            config.cluster.local_node.clone(),
            &config.cluster.nodes,
        )?;
        let codec = TokenCodec::from_key(config.engine.token_key.as_deref());

        tracing::info!(
            chains = chains.len(),
            modules = modules.len(),
            nodes = nodes.len(),
            signed_tokens = codec.is_signed(),
            "authentication engine ready"
        );

        Ok(Self {
            chains,
            modules,
            gate,
            lockout,
            nodes,
            attempts: AttemptStore::new(),
            codec,
            settings,
            stats: EngineStats::default(),
        })
    }

    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    pub const fn nodes(&self) -> &NodeAffinityRegistry {
        &self.nodes
    }

    pub const fn chains(&self) -> &ChainCatalog {
        &self.chains
    }

    /// Number of attempts waiting for their next round
    pub fn pending_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Begin a login attempt on `chain` (or the default chain).
    ///
    /// When the caller already knows who is logging in, the status gate runs
    /// before any module and a disqualified identity fails without a round
    /// trip.
    pub async fn start_attempt(
        &self,
        chain: Option<&str>,
        identifier: Option<&str>,
    ) -> Result<AttemptResponse, EngineError> {
        let chain = self.chains.resolve(chain)?;
        let now = now_millis();
        let id = AttemptId::generate(self.nodes.local_node());
        let mut state = ChainExecutionState::new(
            id,
            chain.name(),
            chain.digest(),
            now,
            now.saturating_add(self.settings.attempt_timeout_ms),
        );
        self.stats.attempts_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: AUDIT_TARGET,
            attempt = %state.attempt_id(),
            chain = chain.name(),
            "attempt started"
        );

        if let Some(identifier) = identifier.map(str::trim).filter(|i| !i.is_empty()) {
            state.bind_identity(identifier);
            self.admit(&mut state, identifier).await;
        }

        let result = self.drive(&chain, &mut state, None).await;
        self.settle(&chain, state, result, None)
    }

    /// Answer the callbacks of the attempt's current round
    pub async fn continue_attempt(
        &self,
        attempt_id: &AttemptId,
        round: u32,
        answers: Vec<Callback>,
    ) -> Result<AttemptResponse, EngineError> {
        self.nodes.ensure_local(attempt_id)?;
        let lease = self.attempts.checkout(attempt_id)?;
        let mut state = match self.open(&lease) {
            Ok(state) => state,
            Err(e) => {
                lease.finish();
                return Err(e);
            }
        };

        if round != state.round() {
            self.stats.stale_rounds.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(attempt = %attempt_id, expected = state.round(), actual = round, "stale round rejected");
            return Err(EngineError::StaleRound {
                expected: state.round(),
                actual: round,
            });
        }

        if now_millis() >= state.expires_at() {
            self.abort_state(None, &mut state, "attempt timed out");
            lease.finish();
            self.stats.attempts_expired.fetch_add(1, Ordering::Relaxed);
            return Ok(self.respond(&state));
        }

        let chain = match self.chain_for(&state) {
            Ok(chain) => chain,
            Err(e) => {
                self.abort_state(None, &mut state, &e.to_string());
                lease.finish();
                return Err(e);
            }
        };

        let pending = state.take_pending();
        let answers = match match_answers(&pending, answers) {
            Ok(answers) => answers,
            Err(mismatch) => {
                tracing::warn!(attempt = %attempt_id, error = %mismatch, "callback mismatch");
                self.abort_state(Some(&chain), &mut state, &mismatch.to_string());
                lease.finish();
                return Err(mismatch.into());
            }
        };

        let result = self.drive(&chain, &mut state, Some(answers)).await;
        self.settle(&chain, state, result, Some(lease))
    }

    /// Operator cancellation of a suspended attempt
    pub fn abort_attempt(
        &self,
        attempt_id: &AttemptId,
        reason: &str,
    ) -> Result<AttemptResponse, EngineError> {
        self.nodes.ensure_local(attempt_id)?;
        let lease = self.attempts.checkout(attempt_id)?;
        let result = self.open(&lease).map(|mut state| {
            self.abort_state(None, &mut state, reason);
            self.respond(&state)
        });
        lease.finish();
        result
    }

    /// Abort every parked attempt past its deadline. Returns how many.
    pub fn expire_attempts(&self) -> usize {
        let mut expired = 0;
        for id in self.attempts.expired(now_millis()) {
            let Ok(lease) = self.attempts.checkout(&id) else {
                continue;
            };
            if let Ok(mut state) = self.open(&lease) {
                self.abort_state(None, &mut state, "attempt timed out");
            }
            lease.finish();
            self.stats.attempts_expired.fetch_add(1, Ordering::Relaxed);
            expired += 1;
        }
        if expired > 0 {
            tracing::info!(expired, "expired suspended attempts");
        }
        expired
    }

    /// Decode a parked attempt without advancing it
    pub fn inspect(&self, attempt_id: &AttemptId) -> Result<ChainExecutionState, EngineError> {
        let lease = self.attempts.checkout(attempt_id)?;
        self.open(&lease)
    }

    fn open(&self, lease: &AttemptLease<'_>) -> Result<ChainExecutionState, EngineError> {
        let state = self.codec.decode(lease.token())?;
        if state.attempt_id() != lease.id() {
            return Err(EngineError::InvalidToken(format!(
                "token belongs to attempt {}",
                state.attempt_id()
            )));
        }
        Ok(state)
    }

    fn chain_for(
        &self,
        state: &ChainExecutionState,
    ) -> Result<Arc<AuthenticationChainDefinition>, EngineError> {
        let chain = self.chains.get(state.chain_name())?;
        if chain.digest() != state.chain_digest() {
            return Err(EngineError::InvalidToken(format!(
                "chain {} changed since the attempt started",
                chain.name()
            )));
        }
        Ok(chain)
    }

    /// Run links until the attempt suspends or terminates
    async fn drive(
        &self,
        chain: &AuthenticationChainDefinition,
        state: &mut ChainExecutionState,
        mut answers: Option<Vec<Callback>>,
    ) -> Result<(), EngineError> {
        while !state.is_terminal() {
            let index = state.current_link_index();
            let Some(link) = chain.link(index) else {
                let status = criteria::finalize(state.link_results());
                state.terminate(status, failure_cause(status));
                return Ok(());
            };

            let module = self.modules.resolve(&link.module_name)?;
            let verdict = match self.invoke(module.as_ref(), link, state, answers.take()).await {
                Ok(ModuleResponse::Suspend(callbacks)) if callbacks.is_empty() => {
                    return Err(EngineError::Internal(format!(
                        "module {} suspended without callbacks",
                        link.module_name
                    )));
                }
                Ok(ModuleResponse::Suspend(callbacks)) => {
                    state.suspend(callbacks);
                    return Ok(());
                }
                Ok(ModuleResponse::Outcome(verdict)) => verdict,
                Err(e) => {
                    tracing::warn!(
                        target: AUDIT_TARGET,
                        attempt = %state.attempt_id(),
                        module = %link.module_name,
                        error = %e,
                        "module failed"
                    );
                    state.terminate(OverallStatus::Failure, Some(FailureCause::Infrastructure));
                    return Ok(());
                }
            };

            let decision = criteria::apply(state.link_results(), link.criterion, verdict.verdict());
            tracing::info!(
                target: AUDIT_TARGET,
                attempt = %state.attempt_id(),
                link = index,
                module = %link.module_name,
                criterion = %link.criterion,
                verdict = ?verdict.verdict(),
                reason = verdict.failure_reason().unwrap_or_default(),
                "link completed"
            );
            state.record_outcome(ModuleOutcome {
                link_index: index,
                criterion: link.criterion,
                verdict: verdict.verdict(),
                failure_reason: verdict.failure_reason().map(String::from),
            });

            if let Some(principal) = verdict.principal() {
                self.bind_principal(state, principal).await?;
                if state.is_terminal() {
                    return Ok(());
                }
            }

            if decision.step == Step::Stop {
                state.terminate(decision.status, failure_cause(decision.status));
                return Ok(());
            }

            let next = match verdict.next_link() {
                None => index + 1,
                Some(hint) => match chain.resolve_hint(hint) {
                    Some(target) if target > index => target,
                    _ => {
                        return Err(EngineError::InvalidJump {
                            from: index,
                            target: hint.to_string(),
                        });
                    }
                },
            };
            state.advance_to(next);
        }
        Ok(())
    }

    /// Invoke a module, retrying transient backend errors.
    ///
    /// The module works on a copy of the shared state that is committed only
    /// when the invocation returns normally.
    async fn invoke(
        &self,
        module: &dyn AuthModule,
        link: &ChainLink,
        state: &mut ChainExecutionState,
        answers: Option<Vec<Callback>>,
    ) -> Result<ModuleResponse, ModuleError> {
        let mut attempt = 0;
        loop {
            let mut shared = state.shared_state().clone();
            let mut ctx = ModuleContext {
                attempt_id: state.attempt_id(),
                link_index: state.current_link_index(),
                options: &link.module_options,
                bound_identity: state.bound_identity(),
                shared: &mut shared,
            };
            let result = module.invoke(&mut ctx, answers.as_deref()).await;
            match result {
                Ok(response) => {
                    state.replace_shared_state(shared);
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < self.settings.retries => {
                    attempt += 1;
                    tracing::debug!(module = module.name(), attempt, error = %e, "retrying module");
                    tokio::time::sleep(self.settings.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bind_principal(
        &self,
        state: &mut ChainExecutionState,
        principal: &str,
    ) -> Result<(), EngineError> {
        match state.bound_identity() {
            Some(bound) if bound == principal => {}
            Some(bound) => {
                return Err(EngineError::IdentityConflict {
                    bound: bound.to_string(),
                    resolved: principal.to_string(),
                });
            }
            None => state.bind_identity(principal),
        }
        if !state.identity_checked() {
            self.admit(state, principal).await;
        }
        Ok(())
    }

    /// Run the status gate; a disqualified identity ends the attempt
    async fn admit(&self, state: &mut ChainExecutionState, identity: &str) {
        state.mark_identity_checked();
        match self.gate.check_status(identity).await {
            Ok(status) if status.permits_login() => {}
            Ok(status) => {
                tracing::info!(
                    target: AUDIT_TARGET,
                    attempt = %state.attempt_id(),
                    identity,
                    %status,
                    "identity not permitted to log in"
                );
                state.terminate(OverallStatus::Failure, Some(FailureCause::AccountStatus));
            }
            Err(e) => {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    attempt = %state.attempt_id(),
                    identity,
                    error = %e,
                    "identity status unavailable"
                );
                state.terminate(OverallStatus::Failure, Some(FailureCause::Infrastructure));
            }
        }
    }

    /// Persist or conclude the attempt after a drive
    fn settle(
        &self,
        chain: &AuthenticationChainDefinition,
        mut state: ChainExecutionState,
        result: Result<(), EngineError>,
        lease: Option<AttemptLease<'_>>,
    ) -> Result<AttemptResponse, EngineError> {
        if let Err(e) = result {
            tracing::warn!(attempt = %state.attempt_id(), error = %e, "attempt aborted");
            self.abort_state(Some(chain), &mut state, &e.to_string());
            if let Some(lease) = lease {
                lease.finish();
            }
            return Err(e);
        }

        if state.is_terminal() {
            self.account(&state);
            if let Some(lease) = lease {
                lease.finish();
            }
            return Ok(self.respond(&state));
        }

        let expires_at = now_millis().saturating_add(self.settings.attempt_timeout_ms);
        state.extend_deadline(expires_at);
        let token = self.codec.encode(&state)?;
        match lease {
            Some(lease) => lease.commit(token, expires_at),
            None => self
                .attempts
                .insert(state.attempt_id().clone(), token, expires_at),
        }
        self.stats.rounds_suspended.fetch_add(1, Ordering::Relaxed);
        Ok(self.respond(&state))
    }

    /// Move to ABORTED, closing the open link with an ABORTED outcome
    fn abort_state(
        &self,
        chain: Option<&AuthenticationChainDefinition>,
        state: &mut ChainExecutionState,
        reason: &str,
    ) {
        if state.is_terminal() {
            return;
        }
        let owned;
        let chain = match chain {
            Some(chain) => Some(chain),
            None => {
                owned = self.chains.get(state.chain_name()).ok();
                owned.as_deref()
            }
        };
        if state.current_link_open() {
            if let Some(link) = chain.and_then(|c| c.link(state.current_link_index())) {
                state.record_outcome(ModuleOutcome {
                    link_index: state.current_link_index(),
                    criterion: link.criterion,
                    verdict: Verdict::Aborted,
                    failure_reason: Some(reason.to_string()),
                });
            }
        }
        state.terminate(OverallStatus::Aborted, Some(FailureCause::Protocol));
        tracing::info!(target: AUDIT_TARGET, attempt = %state.attempt_id(), reason, "attempt aborted");
        self.account(state);
    }

    /// Lockout accounting and statistics for a concluded attempt
    fn account(&self, state: &ChainExecutionState) {
        let identity = state.bound_identity();
        match state.overall_status() {
            OverallStatus::InProgress => {}
            OverallStatus::Success => {
                self.stats.attempts_succeeded.fetch_add(1, Ordering::Relaxed);
                if let Some(identity) = identity {
                    self.lockout.record_success(identity);
                }
                tracing::info!(
                    target: AUDIT_TARGET,
                    attempt = %state.attempt_id(),
                    identity = identity.unwrap_or_default(),
                    "attempt succeeded"
                );
            }
            OverallStatus::Failure => {
                self.stats.attempts_failed.fetch_add(1, Ordering::Relaxed);
                let cause = state.failure_cause();
                if cause == Some(FailureCause::Credentials) {
                    self.charge(state);
                }
                tracing::info!(
                    target: AUDIT_TARGET,
                    attempt = %state.attempt_id(),
                    identity = identity.unwrap_or_default(),
                    cause = ?cause,
                    "attempt failed"
                );
            }
            OverallStatus::Aborted => {
                self.stats.attempts_aborted.fetch_add(1, Ordering::Relaxed);
                if state.has_failed_link() {
                    self.charge(state);
                }
            }
        }
    }

    fn charge(&self, state: &ChainExecutionState) {
        if let Some(identity) = state.bound_identity() {
            let counter = self.lockout.record_failure(identity);
            tracing::info!(
                target: AUDIT_TARGET,
                attempt = %state.attempt_id(),
                identity,
                failures = counter.count,
                locked = counter.locked_until.is_some(),
                "failure recorded"
            );
        }
    }

    fn respond(&self, state: &ChainExecutionState) -> AttemptResponse {
        let status = match state.overall_status() {
            OverallStatus::InProgress => AttemptStatus::Challenge(state.pending_callbacks().to_vec()),
            OverallStatus::Success => AttemptStatus::Success(AuthenticatedSession {
                identity: state.bound_identity().map(String::from),
                chain: state.chain_name().to_string(),
                shared_state: state.shared_state().clone(),
            }),
            OverallStatus::Failure => AttemptStatus::Failure,
            OverallStatus::Aborted => AttemptStatus::Aborted,
        };
        AttemptResponse {
            attempt_id: state.attempt_id().clone(),
            round: state.round(),
            status,
        }
    }
}

const fn failure_cause(status: OverallStatus) -> Option<FailureCause> {
    match status {
        OverallStatus::Failure => Some(FailureCause::Credentials),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use crate::module::NextLink;
    use crate::modules::PasswordModule;
    use crate::shared::USERNAME_KEY;
    use crate::testing::ScriptedModule;
    use turnstile_common::Criterion::{self, Optional, Required, Requisite, Sufficient};

    fn config() -> Config {
        let mut config = Config::default();
        config.lockout.threshold = 3;
        config.engine.retry_backoff_ms = 1;
        config
    }

    fn store() -> Arc<MemoryIdentityStore> {
        let store = MemoryIdentityStore::new();
        store.create_identity("alice", "s3cret").unwrap();
        store.create_identity("bob", "hunter2").unwrap();
        Arc::new(store)
    }

    fn engine_with(
        config: &Config,
        store: &Arc<MemoryIdentityStore>,
        links: Vec<ChainLink>,
        modules: Vec<(&str, Arc<dyn AuthModule>)>,
    ) -> AuthEngine {
        let mut builder = ModuleRegistry::builder();
        for (name, module) in modules {
            builder.register(name, module).unwrap();
        }
        let mut chains = ChainCatalog::new();
        chains.insert(AuthenticationChainDefinition::new("test", links).unwrap());
        chains.set_default("test").unwrap();
        AuthEngine::with_chains(config, chains, builder.build(), store.clone()).unwrap()
    }

    fn link(name: &str, criterion: Criterion) -> ChainLink {
        ChainLink::new(name, criterion)
    }

    fn scripted(module: ScriptedModule) -> Arc<ScriptedModule> {
        Arc::new(module)
    }

    fn boxed(module: ScriptedModule) -> Arc<dyn AuthModule> {
        Arc::new(module)
    }

    fn dyn_module(module: &Arc<ScriptedModule>) -> Arc<dyn AuthModule> {
        module.clone()
    }

    #[tokio::test]
    async fn test_optional_only_chain() {
        let store = store();
        let (a, b, c) = (
            scripted(ScriptedModule::fail("no")),
            scripted(ScriptedModule::succeed()),
            scripted(ScriptedModule::fail("no")),
        );
        let engine = engine_with(
            &config(),
            &store,
            vec![link("a", Optional), link("b", Optional), link("c", Optional)],
            vec![("a", dyn_module(&a)), ("b", dyn_module(&b)), ("c", dyn_module(&c))],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert!(matches!(response.status, AttemptStatus::Success(_)));
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));

        let engine = engine_with(
            &config(),
            &store,
            vec![link("a", Optional), link("c", Optional)],
            vec![("a", dyn_module(&a)), ("c", dyn_module(&c))],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
    }

    #[tokio::test]
    async fn test_requisite_failure_stops_chain() {
        let later = scripted(ScriptedModule::succeed());
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Requisite), link("later", Required)],
            vec![
                ("otp", boxed(ScriptedModule::fail("bad code"))),
                ("later", dyn_module(&later)),
            ],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_sufficient_success_stops_chain() {
        let later = scripted(ScriptedModule::fail("never"));
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("cert", Sufficient), link("later", Required)],
            vec![
                ("cert", boxed(ScriptedModule::succeed())),
                ("later", dyn_module(&later)),
            ],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert!(matches!(response.status, AttemptStatus::Success(_)));
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_and_future_rounds_rejected() {
        let otp = scripted(ScriptedModule::challenge("Code", "123456"));
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", dyn_module(&otp))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(started.round, 1);
        let before = engine.inspect(&started.attempt_id).unwrap();
        let answer = vec![Callback::text("Code").answer("123456")];

        for round in [0, 2] {
            let err = engine
                .continue_attempt(&started.attempt_id, round, answer.clone())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                EngineError::StaleRound { expected: 1, actual } if actual == round
            ));
        }
        assert_eq!(engine.inspect(&started.attempt_id).unwrap(), before);
        assert_eq!(otp.calls(), 1);

        let done = engine
            .continue_attempt(&started.attempt_id, 1, answer)
            .await
            .unwrap();
        assert!(matches!(done.status, AttemptStatus::Success(_)));
        assert_eq!(engine.pending_attempts(), 0);
    }

    #[tokio::test]
    async fn test_required_password_failure_counts_once() {
        let store = store();
        let engine = engine_with(
            &config(),
            &store,
            vec![link("password", Required), link("otp", Required)],
            vec![
                ("password", Arc::new(PasswordModule::new(store.clone())) as Arc<dyn AuthModule>),
                ("otp", boxed(ScriptedModule::challenge("Code", "123456"))),
            ],
        );

        let first = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(first.callbacks().unwrap().len(), 2);
        let answers = vec![
            Callback::text("User Name").answer("alice"),
            Callback::secret("Password").answer("wrong"),
        ];

        // REQUIRED failure: the chain continues to the otp link
        let second = engine
            .continue_attempt(&first.attempt_id, first.round, answers)
            .await
            .unwrap();
        assert_eq!(second.callbacks().unwrap(), &[Callback::text("Code")]);
        assert_eq!(engine.inspect(&first.attempt_id).unwrap().bound_identity(), Some("alice"));

        let last = engine
            .continue_attempt(
                &first.attempt_id,
                second.round,
                vec![Callback::text("Code").answer("123456")],
            )
            .await
            .unwrap();
        assert_eq!(last.status, AttemptStatus::Failure);
        assert_eq!(engine.lockout().counter("alice").unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_required_otp_failure_after_password_success() {
        let store = store();
        let engine = engine_with(
            &config(),
            &store,
            vec![link("password", Required), link("otp", Required)],
            vec![
                ("password", Arc::new(PasswordModule::new(store.clone())) as Arc<dyn AuthModule>),
                ("otp", boxed(ScriptedModule::challenge("Code", "123456"))),
            ],
        );

        let first = engine.start_attempt(None, None).await.unwrap();
        let answers = vec![
            Callback::text("User Name").answer("alice"),
            Callback::secret("Password").answer("s3cret"),
        ];
        let second = engine
            .continue_attempt(&first.attempt_id, first.round, answers)
            .await
            .unwrap();
        assert_eq!(second.callbacks().unwrap(), &[Callback::text("Code")]);
        let state = engine.inspect(&first.attempt_id).unwrap();
        assert_eq!(state.link_results().len(), 1);
        assert_eq!(state.link_results()[0].verdict, Verdict::Success);

        let last = engine
            .continue_attempt(
                &first.attempt_id,
                second.round,
                vec![Callback::text("Code").answer("000000")],
            )
            .await
            .unwrap();
        assert_eq!(last.status, AttemptStatus::Failure);
        assert_eq!(engine.lockout().counter("alice").unwrap().count, 1);
        assert_eq!(engine.stats().attempts_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_sufficient_cert_skips_password() {
        let password = scripted(ScriptedModule::fail("never"));
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("cert", Sufficient), link("password", Required)],
            vec![
                ("cert", boxed(ScriptedModule::succeed().as_principal("alice"))),
                ("password", dyn_module(&password)),
            ],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        let AttemptStatus::Success(session) = response.status else {
            panic!("expected success");
        };
        assert_eq!(session.identity.as_deref(), Some("alice"));
        assert_eq!(password.calls(), 0);
        assert!(engine.lockout().counter("alice").is_none());
    }

    #[tokio::test]
    async fn test_password_success_exposes_shared_state() {
        let store = store();
        let engine = engine_with(
            &config(),
            &store,
            vec![link("password", Required)],
            vec![("password", Arc::new(PasswordModule::new(store.clone())) as Arc<dyn AuthModule>)],
        );
        let first = engine.start_attempt(None, None).await.unwrap();
        let answers = vec![
            Callback::text("User Name").answer("bob"),
            Callback::secret("Password").answer("hunter2"),
        ];
        let done = engine
            .continue_attempt(&first.attempt_id, first.round, answers)
            .await
            .unwrap();
        let AttemptStatus::Success(session) = done.status else {
            panic!("expected success");
        };
        assert_eq!(session.identity.as_deref(), Some("bob"));
        assert_eq!(session.chain, "test");
        assert_eq!(session.shared_state.get_str(USERNAME_KEY), Some("bob"));
    }

    #[tokio::test]
    async fn test_concurrent_resumption_rejected() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::challenge("Code", "1")))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        let answer = vec![Callback::text("Code").answer("1")];

        let held = engine.attempts.checkout(&started.attempt_id).unwrap();
        assert!(matches!(
            engine
                .continue_attempt(&started.attempt_id, 1, answer.clone())
                .await,
            Err(EngineError::ConcurrentResumption(_))
        ));
        drop(held);

        let done = engine
            .continue_attempt(&started.attempt_id, 1, answer)
            .await
            .unwrap();
        assert!(matches!(done.status, AttemptStatus::Success(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resumptions_complete_once() {
        let otp = scripted(ScriptedModule::challenge("Code", "1"));
        let engine = Arc::new(engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", dyn_module(&otp))],
        ));
        let started = engine.start_attempt(None, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            let id = started.attempt_id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .continue_attempt(&id, 1, vec![Callback::text("Code").answer("1")])
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(response) => {
                    assert!(matches!(response.status, AttemptStatus::Success(_)));
                    succeeded += 1;
                }
                Err(e) => assert!(matches!(
                    e,
                    EngineError::ConcurrentResumption(_) | EngineError::AttemptNotFound(_)
                )),
            }
        }
        assert_eq!(succeeded, 1);
        // one call to challenge, one to verify
        assert_eq!(otp.calls(), 2);
        assert_eq!(engine.stats().attempts_succeeded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_callback_mismatch_aborts_attempt() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::challenge("Code", "1")))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        let answers = vec![
            Callback::text("Code").answer("1"),
            Callback::text("Code").answer("1"),
        ];
        assert!(matches!(
            engine.continue_attempt(&started.attempt_id, 1, answers).await,
            Err(EngineError::CallbackMismatch(_))
        ));
        assert!(matches!(
            engine
                .continue_attempt(&started.attempt_id, 1, vec![Callback::text("Code").answer("1")])
                .await,
            Err(EngineError::AttemptNotFound(_))
        ));
        assert_eq!(engine.stats().attempts_aborted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_jumps() {
        let sms = scripted(ScriptedModule::fail("never"));
        let engine = engine_with(
            &config(),
            &store(),
            vec![
                link("select", Required),
                link("sms", Sufficient).with_label("sms"),
                link("email", Sufficient).with_label("email"),
            ],
            vec![
                ("select", boxed(ScriptedModule::jump(NextLink::Label("email".into())))),
                ("sms", dyn_module(&sms)),
                ("email", boxed(ScriptedModule::succeed())),
            ],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert!(matches!(response.status, AttemptStatus::Success(_)));
        assert_eq!(sms.calls(), 0);

        let engine = engine_with(
            &config(),
            &store(),
            vec![link("first", Optional).with_label("first"), link("back", Required)],
            vec![
                ("first", boxed(ScriptedModule::succeed())),
                ("back", boxed(ScriptedModule::jump(NextLink::Label("first".into())))),
            ],
        );
        assert!(matches!(
            engine.start_attempt(None, None).await,
            Err(EngineError::InvalidJump { from: 1, .. })
        ));
        assert_eq!(engine.stats().attempts_aborted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_gate_short_circuits_disqualified_identity() {
        let store = store();
        store.delete("alice").unwrap();
        let module = scripted(ScriptedModule::succeed());
        let engine = engine_with(
            &config(),
            &store,
            vec![link("password", Required)],
            vec![("password", dyn_module(&module))],
        );

        let response = engine.start_attempt(None, Some("alice")).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert_eq!(response.round, 0);
        assert_eq!(module.calls(), 0);

        for _ in 0..3 {
            engine.lockout().record_failure("bob");
        }
        let response = engine.start_attempt(None, Some("bob")).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert_eq!(module.calls(), 0);
        // gate failures are not credential failures
        assert_eq!(engine.lockout().counter("bob").unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_gate_runs_when_identity_first_bound() {
        let store = store();
        store.set_status("alice", "Inactive").unwrap();
        let later = scripted(ScriptedModule::succeed());
        let engine = engine_with(
            &config(),
            &store,
            vec![link("cert", Optional), link("later", Required)],
            vec![
                ("cert", boxed(ScriptedModule::succeed().as_principal("alice"))),
                ("later", dyn_module(&later)),
            ],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_identity_conflict_is_fatal() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("a", Required), link("b", Required)],
            vec![
                ("a", boxed(ScriptedModule::succeed().as_principal("alice"))),
                ("b", boxed(ScriptedModule::succeed().as_principal("bob"))),
            ],
        );
        assert!(matches!(
            engine.start_attempt(None, None).await,
            Err(EngineError::IdentityConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_module_errors_retried() {
        let flaky = scripted(ScriptedModule::flaky(2));
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("ldap", Required)],
            vec![("ldap", dyn_module(&flaky))],
        );
        let response = engine.start_attempt(None, None).await.unwrap();
        assert!(matches!(response.status, AttemptStatus::Success(_)));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_not_counted() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("ldap", Required)],
            vec![("ldap", boxed(ScriptedModule::flaky(10)))],
        );
        let response = engine.start_attempt(None, Some("alice")).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert!(engine.lockout().counter("alice").is_none());

        let engine = engine_with(
            &config(),
            &store(),
            vec![link("broken", Required)],
            vec![("broken", boxed(ScriptedModule::broken()))],
        );
        let response = engine.start_attempt(None, Some("alice")).await.unwrap();
        assert_eq!(response.status, AttemptStatus::Failure);
        assert!(engine.lockout().counter("alice").is_none());
    }

    #[tokio::test]
    async fn test_abort_charges_only_recorded_failures() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("password", Required), link("otp", Required)],
            vec![
                ("password", boxed(ScriptedModule::fail("bad").as_principal("alice"))),
                ("otp", boxed(ScriptedModule::challenge("Code", "1"))),
            ],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        let aborted = engine.abort_attempt(&started.attempt_id, "operator").unwrap();
        assert_eq!(aborted.status, AttemptStatus::Aborted);
        assert_eq!(engine.lockout().counter("alice").unwrap().count, 1);

        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::challenge("Code", "1")))],
        );
        let started = engine.start_attempt(None, Some("bob")).await.unwrap();
        engine.abort_attempt(&started.attempt_id, "operator").unwrap();
        assert!(engine.lockout().counter("bob").is_none());
        assert_eq!(engine.pending_attempts(), 0);
    }

    #[tokio::test]
    async fn test_expired_attempts_are_aborted() {
        let mut config = config();
        config.engine.attempt_timeout_secs = 0;
        let engine = engine_with(
            &config,
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::challenge("Code", "1")))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(engine.expire_attempts(), 1);
        assert_eq!(engine.stats().attempts_expired.load(Ordering::Relaxed), 1);
        assert!(matches!(
            engine
                .continue_attempt(&started.attempt_id, 1, vec![Callback::text("Code").answer("1")])
                .await,
            Err(EngineError::AttemptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_late_resume_counts_as_expired() {
        let mut config = config();
        config.engine.attempt_timeout_secs = 0;
        let otp = scripted(ScriptedModule::challenge("Code", "1"));
        let engine = engine_with(
            &config,
            &store(),
            vec![link("otp", Required)],
            vec![("otp", dyn_module(&otp))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        let response = engine
            .continue_attempt(&started.attempt_id, 1, vec![Callback::text("Code").answer("1")])
            .await
            .unwrap();
        assert_eq!(response.status, AttemptStatus::Aborted);
        assert_eq!(otp.calls(), 1);
        assert_eq!(engine.stats().attempts_expired.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().attempts_aborted.load(Ordering::Relaxed), 1);
        assert_eq!(engine.pending_attempts(), 0);
    }

    #[tokio::test]
    async fn test_attempts_routed_to_owning_node() {
        let mut config = config();
        config.cluster.local_node = Some("01".into());
        config.cluster.nodes = vec![
            "https://am1.example.com/am|01".into(),
            "https://AM2.example.com/AM|02".into(),
        ];
        let engine = engine_with(
            &config,
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::challenge("Code", "1")))],
        );
        let started = engine.start_attempt(None, None).await.unwrap();
        assert_eq!(started.attempt_id.node_id(), Some("01"));

        let foreign = AttemptId::from("0123abcd.02");
        assert!(matches!(
            engine.continue_attempt(&foreign, 1, vec![]).await,
            Err(EngineError::WrongNode { node_id, redirect_url: Some(url) })
                if node_id == "02" && url == "https://AM2.example.com/AM"
        ));
    }

    #[tokio::test]
    async fn test_unknown_chain_and_unbound_module() {
        let engine = engine_with(
            &config(),
            &store(),
            vec![link("otp", Required)],
            vec![("otp", boxed(ScriptedModule::succeed()))],
        );
        assert!(matches!(
            engine.start_attempt(Some("missing"), None).await,
            Err(EngineError::ChainNotFound(_))
        ));

        let mut chains = ChainCatalog::new();
        chains.insert(
            AuthenticationChainDefinition::new("test", vec![link("otp", Required)]).unwrap(),
        );
        let result = AuthEngine::with_chains(
            &config(),
            chains,
            ModuleRegistry::builder().build(),
            store(),
        );
        assert!(matches!(result, Err(EngineError::ModuleNotFound(_))));
    }

    #[tokio::test]
    async fn test_signed_tokens_round_trip_through_store() {
        let mut config = config();
        config.engine.token_key = Some("secret".into());
        let engine = engine_with(
            &config,
            &store(),
            vec![link("otp", Required), link("otp2", Required)],
            vec![
                ("otp", boxed(ScriptedModule::challenge("Code", "1"))),
                ("otp2", boxed(ScriptedModule::challenge("Second code", "2"))),
            ],
        );
        let first = engine.start_attempt(None, None).await.unwrap();
        let second = engine
            .continue_attempt(&first.attempt_id, 1, vec![Callback::text("Code").answer("1")])
            .await
            .unwrap();
        assert_eq!(second.round, 2);
        let state = engine.inspect(&first.attempt_id).unwrap();
        assert_eq!(state.current_link_index(), 1);
        assert_eq!(state.shared_state().get_str("challenge.0"), Some("Code"));
        assert_eq!(state.link_results().len(), 1);
    }
}
