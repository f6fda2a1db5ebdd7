//! Application state

use std::sync::Arc;

use nexo_billing::{
    BillingEmailService, BillingService, EntitlementStore, IdentitySync, PgStore, StripeClient,
    SupabaseAdminClient,
};
use nexo_shared::{ConfigStore, RateLimiter};
use reqwest::Client;
use sqlx::PgPool;

use crate::{auth::AuthState, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: BillingService,
    /// Versioned product configuration; `None` runs on built-in defaults
    pub config_store: Option<ConfigStore>,
    /// Process-wide limiter for public endpoints
    pub rate_limiter: RateLimiter,
    pub http_client: Client,
    auth: AuthState,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, http_client: Client, rate_limiter: RateLimiter) -> Self {
        let store: Arc<dyn EntitlementStore> = Arc::new(PgStore::new(pool.clone()));

        let identity = match &config.supabase_service_role_key {
            Some(key) => IdentitySync::new(Arc::new(SupabaseAdminClient::new(
                http_client.clone(),
                config.supabase_url.clone(),
                key.clone(),
            ))),
            None => {
                tracing::warn!("SUPABASE_SERVICE_ROLE_KEY not set, identity sync disabled");
                IdentitySync::disabled()
            }
        };
        let email = match &config.email {
            Some(email_config) => BillingEmailService::new(http_client.clone(), email_config.clone()),
            None => {
                tracing::warn!("RESEND_API_KEY not set, billing emails disabled");
                BillingEmailService::disabled()
            }
        };

        let billing = BillingService::from_parts(
            store.clone(),
            Arc::new(StripeClient::new(config.stripe.clone())),
            identity,
            email,
            config.stripe.webhook_secret.clone(),
        );

        Self::from_parts(
            config,
            billing,
            store,
            Some(ConfigStore::new(pool)),
            rate_limiter,
            http_client,
        )
    }

    pub fn from_parts(
        config: Config,
        billing: BillingService,
        store: Arc<dyn EntitlementStore>,
        config_store: Option<ConfigStore>,
        rate_limiter: RateLimiter,
        http_client: Client,
    ) -> Self {
        let auth = AuthState::new(
            config.supabase_url.clone(),
            config.supabase_anon_key.clone(),
            http_client.clone(),
            config.admin_emails.clone(),
            store,
        );
        Self {
            config,
            billing,
            config_store,
            rate_limiter,
            http_client,
            auth,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
