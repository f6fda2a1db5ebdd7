// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Nexo API Library
//!
//! HTTP surface for activation codes, checkout reconciliation, coupons, the
//! plan quiz, admin tier management and Stripe webhooks.

pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod routes;
pub mod security;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
