//! Turnstile Authentication Engine
//!
//! This crate provides:
//! - Pluggable authentication modules and the registry that binds them
//! - Authentication chains with REQUIRED/REQUISITE/SUFFICIENT/OPTIONAL criteria
//! - Resumable login attempts driven by a callback exchange
//! - Identity status gate and lockout accounting
//! - Node affinity for routing attempts inside a cluster
//!
//! # Example
//!
//! ```rust,ignore
//! use turnstile_auth::{AuthEngine, MemoryIdentityStore, ModuleRegistry, modules};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryIdentityStore::from_seed(&config.users));
//! let mut builder = ModuleRegistry::builder();
//! modules::register_builtin(&mut builder, store.clone());
//! builder.bind_all(&config.modules)?;
//!
//! let engine = AuthEngine::new(&config, builder.build(), store)?;
//! let response = engine.start_attempt(None, None).await?;
//! ```

// Attempt model
pub mod callback;
pub mod criteria;
pub mod shared;
pub mod state;
pub mod token;

// Modules and chains
pub mod chain;
pub mod module;
pub mod modules;
pub mod registry;

// Identities and accounting
pub mod identity;
pub mod lockout;
pub mod status;

// Engine
pub mod affinity;
pub mod attempts;
pub mod engine;
pub mod error;

#[cfg(test)]
mod testing;

pub use affinity::{NodeAffinityEntry, NodeAffinityRegistry, Route};
pub use callback::{Callback, CallbackKind, CallbackMismatch};
pub use chain::{AuthenticationChainDefinition, ChainCatalog, ChainLink};
pub use engine::{AttemptResponse, AttemptStatus, AuthEngine, AuthenticatedSession, EngineStats};
pub use error::{EngineError, ModuleError, StoreError};
pub use identity::MemoryIdentityStore;
pub use lockout::{FailureCounter, LockoutTracker};
pub use module::{AuthModule, ModuleContext, ModuleResponse, ModuleVerdict, NextLink};
pub use registry::{ModuleRegistry, ModuleRegistryBuilder};
pub use shared::SharedState;
pub use state::{ChainExecutionState, FailureCause, ModuleOutcome, OverallStatus, Verdict};
pub use status::{IdentityStore, StatusGate};
pub use token::TokenCodec;
