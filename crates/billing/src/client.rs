//! Stripe client configuration

use std::future::Future;
use std::time::Duration;

use stripe::{Client, StripeError};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Upper bound for a single Stripe API call, retries excluded
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::NotConfigured("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
            BillingError::NotConfigured("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;
        let request_timeout = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Ok(Self {
            secret_key,
            webhook_secret,
            request_timeout,
        })
    }
}

/// Thin wrapper around `stripe::Client` carrying our configuration
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Run a Stripe call with the configured timeout, retrying transient
    /// failures (timeouts, 429, 5xx, transport errors) with backoff.
    pub(crate) async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        self.call_raw(op, f).await.map_err(BillingError::from)
    }

    /// Like [`call`](Self::call), mapping a 404 from Stripe to `None`
    pub(crate) async fn call_optional<T, F, Fut>(
        &self,
        op: &'static str,
        f: F,
    ) -> BillingResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        match self.call_raw(op, f).await {
            Ok(value) => Ok(Some(value)),
            Err(CallError::Stripe(e)) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn call_raw<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        let timeout = self.config.request_timeout;
        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(MAX_RETRIES);

        RetryIf::spawn(
            strategy,
            || {
                let fut = f();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(res) => res.map_err(CallError::Stripe),
                        Err(_) => Err(CallError::Timeout),
                    }
                }
            },
            |e: &CallError| {
                let transient = e.is_transient();
                if transient {
                    tracing::warn!(operation = op, error = ?e, "Transient Stripe failure, retrying");
                }
                transient
            },
        )
        .await
    }
}

#[derive(Debug)]
enum CallError {
    Timeout,
    Stripe(StripeError),
}

impl CallError {
    fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout => true,
            CallError::Stripe(StripeError::Stripe(req)) => {
                req.http_status == 429 || req.http_status >= 500
            }
            CallError::Stripe(StripeError::ClientError(_))
            | CallError::Stripe(StripeError::Timeout) => true,
            CallError::Stripe(_) => false,
        }
    }
}

impl From<CallError> for BillingError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout => BillingError::ProviderTimeout("Stripe"),
            CallError::Stripe(e) => BillingError::from(e),
        }
    }
}

/// `true` when Stripe answered 404 for the requested object
fn is_not_found(error: &StripeError) -> bool {
    matches!(error, StripeError::Stripe(req) if req.http_status == 404)
}
