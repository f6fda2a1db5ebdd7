#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nexo shared types
//!
//! Types and infrastructure used by both the API server and the worker.

pub mod config_store;
pub mod db;
pub mod rate_limit;
pub mod tier;

pub use config_store::{ConfigError, ConfigStore, TypedConfig, Versioned};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter};
pub use tier::{ParseTierError, Tier};
