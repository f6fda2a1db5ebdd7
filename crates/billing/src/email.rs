//! Transactional billing email via Resend

use nexo_shared::Tier;
use reqwest::Client;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
    /// Base URL used for links in emails
    pub app_url: String,
    pub api_url: String,
}

impl EmailConfig {
    /// `None` when `RESEND_API_KEY` is not set
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Nexo Academy <no-reply@nexo.academy>".to_string()),
            app_url: std::env::var("PUBLIC_APP_URL")
                .unwrap_or_else(|_| "https://nexo.academy".to_string()),
            api_url: RESEND_API_URL.to_string(),
        })
    }
}

#[derive(Clone, Default)]
pub struct BillingEmailService {
    http: Client,
    config: Option<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(http: Client, config: EmailConfig) -> Self {
        Self {
            http,
            config: Some(config),
        }
    }

    pub fn from_env(http: Client) -> Self {
        match EmailConfig::from_env() {
            Some(config) => Self::new(http, config),
            None => {
                tracing::warn!("RESEND_API_KEY not set, billing emails disabled");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> BillingResult<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };

        let response = self
            .http
            .post(format!("{}/emails", config.api_url))
            .bearer_auth(&config.api_key)
            .json(&json!({
                "from": config.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Email(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!("Resend returned {}: {}", status, body)));
        }
        Ok(())
    }

    pub async fn send_purchase_confirmation(
        &self,
        to: &str,
        tier: Tier,
        activation_code: Option<&str>,
    ) -> BillingResult<()> {
        let app_url = self
            .config
            .as_ref()
            .map(|c| c.app_url.as_str())
            .unwrap_or_default();
        let code_block = activation_code
            .map(|code| {
                format!(
                    "<p>Your activation code is <strong>{}</strong>. \
                     Redeem it at <a href=\"{}/activate\">{}/activate</a>.</p>",
                    code, app_url, app_url
                )
            })
            .unwrap_or_default();
        let html = format!(
            "<p>Thanks for your purchase! Your plan is now <strong>{}</strong>.</p>{}",
            tier.name(),
            code_block
        );
        self.send(to, &format!("Your Nexo {} access", tier.name()), html)
            .await
    }

    /// Fire-and-forget purchase confirmation. Failures are logged only.
    pub fn notify_purchase(
        &self,
        to: &str,
        tier: Tier,
        activation_code: Option<&str>,
    ) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let service = self.clone();
        let to = to.to_string();
        let code = activation_code.map(str::to_string);
        Some(tokio::spawn(async move {
            if let Err(e) = service
                .send_purchase_confirmation(&to, tier, code.as_deref())
                .await
            {
                tracing::warn!(to = %to, error = %e, "Failed to send purchase confirmation");
            }
        }))
    }
}
