//! Shared primitives for the annuaire services
//!
//! Keeps the cross-cutting pieces (error classification, retry policy,
//! configuration loading) out of the service crates.

pub mod config;
pub mod error;
pub mod retry;

pub use config::{ConfigLoader, DatabaseConfig, PipelineConfig, RegistryApiConfig};
pub use error::CoreError;
pub use retry::{retry_with_backoff, RetryPolicy};
