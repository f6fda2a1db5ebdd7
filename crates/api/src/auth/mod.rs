//! Authentication module for Nexo

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
