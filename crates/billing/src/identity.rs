//! External identity sync
//!
//! Mirrors a user's tier into Supabase Auth `user_metadata` so clients can
//! read it from the session token. The mirror is write-only: nothing in this
//! crate reads tiers back from it, the primary store stays authoritative.
//! Failures are logged and dropped; there is no retry queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nexo_shared::Tier;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::error::{BillingError, BillingResult};
use crate::models::normalize_email;

const DEFAULT_PAGE_SIZE: u32 = 1000;
/// Stop scanning after this many pages of the admin user list
const MAX_PAGES: u32 = 50;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Identity id of the account registered with `email`, if any
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<String>>;

    /// Write `tier`/`tierName` into the account's metadata
    async fn update_tier_metadata(&self, identity_id: &str, tier: Tier) -> BillingResult<()>;
}

/// Supabase Auth admin API client (service-role key)
#[derive(Clone)]
pub struct SupabaseAdminClient {
    http: Client,
    base_url: String,
    service_role_key: String,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct AdminUserPage {
    #[serde(default)]
    users: Vec<AdminUser>,
}

#[derive(Debug, Deserialize)]
struct AdminUser {
    id: String,
    email: Option<String>,
}

impl SupabaseAdminClient {
    pub fn new(http: Client, base_url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_role_key: service_role_key.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`. `None` when
    /// either is missing, which disables the mirror.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok().filter(|v| !v.is_empty())?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        let http = Client::builder().timeout(timeout).build().ok()?;
        Some(Self::new(http, url, key))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }
}

fn transport_error(e: reqwest::Error) -> BillingError {
    if e.is_timeout() {
        BillingError::ProviderTimeout("Supabase")
    } else {
        BillingError::IdentityProvider(e.to_string())
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAdminClient {
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let wanted = normalize_email(email);

        for page in 1..=MAX_PAGES {
            let response = self
                .request(reqwest::Method::GET, "/auth/v1/admin/users")
                .query(&[("page", page), ("per_page", self.page_size)])
                .send()
                .await
                .map_err(transport_error)?;

            if !response.status().is_success() {
                return Err(BillingError::IdentityProvider(format!(
                    "listing users failed with status {}",
                    response.status()
                )));
            }

            let body: AdminUserPage = response
                .json()
                .await
                .map_err(|e| BillingError::IdentityProvider(e.to_string()))?;

            if let Some(user) = body
                .users
                .iter()
                .find(|u| u.email.as_deref().map(normalize_email).as_deref() == Some(wanted.as_str()))
            {
                return Ok(Some(user.id.clone()));
            }

            if (body.users.len() as u32) < self.page_size {
                return Ok(None);
            }
        }

        tracing::warn!(email = %wanted, max_pages = MAX_PAGES, "Gave up scanning identity users");
        Ok(None)
    }

    async fn update_tier_metadata(&self, identity_id: &str, tier: Tier) -> BillingResult<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/auth/v1/admin/users/{}", identity_id),
            )
            .json(&json!({
                "user_metadata": {
                    "tier": tier.level(),
                    "tierName": tier.name(),
                }
            }))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::IdentityProvider(format!(
                "metadata update failed ({}): {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Best-effort tier mirror
#[derive(Clone, Default)]
pub struct IdentitySync {
    provider: Option<Arc<dyn IdentityProvider>>,
}

impl IdentitySync {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }

    /// Spawn a detached mirror of `tier`. The handle is returned so callers
    /// (mostly tests) can await completion; dropping it does not cancel the
    /// task.
    pub fn mirror_tier(
        &self,
        email: &str,
        known_identity_id: Option<&str>,
        tier: Tier,
    ) -> Option<JoinHandle<()>> {
        let provider = self.provider.clone()?;
        let email = email.to_string();
        let known = known_identity_id.map(str::to_string);

        Some(tokio::spawn(async move {
            match sync_tier(provider.as_ref(), &email, known.as_deref(), tier).await {
                Ok(true) => {
                    tracing::debug!(email = %email, tier = %tier, "Mirrored tier to identity provider");
                }
                Ok(false) => {
                    tracing::info!(email = %email, "No identity account for email, tier not mirrored");
                }
                Err(e) => {
                    tracing::warn!(email = %email, tier = %tier, error = %e, "Identity tier sync failed");
                }
            }
        }))
    }

    /// Synchronous variant, for callers that want the outcome.
    ///
    /// Returns `false` when the email has no identity account.
    pub async fn sync_now(
        &self,
        email: &str,
        known_identity_id: Option<&str>,
        tier: Tier,
    ) -> BillingResult<bool> {
        match &self.provider {
            Some(provider) => sync_tier(provider.as_ref(), email, known_identity_id, tier).await,
            None => Ok(false),
        }
    }
}

async fn sync_tier(
    provider: &dyn IdentityProvider,
    email: &str,
    known_identity_id: Option<&str>,
    tier: Tier,
) -> BillingResult<bool> {
    let identity_id = match known_identity_id {
        Some(id) => id.to_string(),
        None => match provider.find_user_id_by_email(email).await? {
            Some(id) => id,
            None => return Ok(false),
        },
    };
    provider.update_tier_metadata(&identity_id, tier).await?;
    Ok(true)
}
