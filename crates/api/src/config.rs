//! Server configuration from environment variables

use std::time::Duration;

use nexo_billing::{EmailConfig, StripeConfig};
use nexo_shared::RateLimitConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Per-action request limits
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub redeem: RateLimitConfig,
    pub validate: RateLimitConfig,
    pub checkout: RateLimitConfig,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            redeem: RateLimitConfig::per_minute(10),
            validate: RateLimitConfig::per_minute(30),
            checkout: RateLimitConfig::per_minute(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct connection used for migrations when the pooled URL goes
    /// through PgBouncer
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: Option<String>,
    pub stripe: StripeConfig,
    pub email: Option<EmailConfig>,
    /// Lowercased
    pub admin_emails: Vec<String>,
    pub http_timeout: Duration,
    pub rate_limits: RateLimits,
    /// Reverse proxies in front of the server that append to
    /// X-Forwarded-For. Zero ignores forwarding headers and limits by the
    /// socket peer address.
    pub trusted_proxy_hops: usize,
    /// Shared rate limit counters for multi-instance deployments
    pub redis_url: Option<String>,
    pub run_migrations: bool,
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn per_minute(key: &'static str, default: RateLimitConfig) -> Result<RateLimitConfig, ConfigError> {
    Ok(RateLimitConfig::per_minute(parse_or(key, default.max_requests)?))
}

/// Comma-separated, trimmed and lowercased
pub fn parse_admin_emails(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_timeout = Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 10u64)?);
        let defaults = RateLimits::default();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            supabase_url: required("SUPABASE_URL")?,
            supabase_anon_key: required("SUPABASE_ANON_KEY")?,
            supabase_service_role_key: optional("SUPABASE_SERVICE_ROLE_KEY"),
            stripe: StripeConfig {
                secret_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
                request_timeout: http_timeout,
            },
            email: EmailConfig::from_env(),
            admin_emails: parse_admin_emails(&optional("ADMIN_EMAILS").unwrap_or_default()),
            http_timeout,
            rate_limits: RateLimits {
                redeem: per_minute("RATE_LIMIT_REDEEM_PER_MINUTE", defaults.redeem)?,
                validate: per_minute("RATE_LIMIT_VALIDATE_PER_MINUTE", defaults.validate)?,
                checkout: per_minute("RATE_LIMIT_CHECKOUT_PER_MINUTE", defaults.checkout)?,
            },
            trusted_proxy_hops: parse_or("TRUSTED_PROXY_HOPS", 0usize)?,
            redis_url: optional("REDIS_URL"),
            run_migrations: parse_or("RUN_MIGRATIONS", true)?,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Configuration pointing Supabase at `supabase_url` (a mock server)
    pub(crate) fn for_tests(supabase_url: &str) -> Self {
        Self {
            database_url: "postgres://localhost/nexo_test".to_string(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            supabase_url: supabase_url.to_string(),
            supabase_anon_key: "anon-test-key".to_string(),
            supabase_service_role_key: None,
            stripe: StripeConfig {
                secret_key: "sk_test_nexo".to_string(),
                webhook_secret: "whsec_test_nexo".to_string(),
                request_timeout: Duration::from_secs(2),
            },
            email: None,
            admin_emails: vec!["admin@nexo.academy".to_string()],
            http_timeout: Duration::from_secs(2),
            rate_limits: RateLimits::default(),
            trusted_proxy_hops: 0,
            redis_url: None,
            run_migrations: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_emails_are_normalized() {
        assert_eq!(
            parse_admin_emails(" Ops@Nexo.Academy, ,team@nexo.academy "),
            vec!["ops@nexo.academy", "team@nexo.academy"]
        );
        assert!(parse_admin_emails("").is_empty());
    }
}
