//! Turnstile Common - Shared types and utilities
//!
//! This crate provides the vocabulary shared by the authentication engine
//! and its binaries: chain criteria, identity status, attempt identifiers,
//! the common error type and the configuration model.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
