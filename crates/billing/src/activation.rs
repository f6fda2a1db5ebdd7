//! Activation code ledger
//!
//! Codes look like `NEXO-XXXX-XXXX` and grant a tier. A code may be redeemed
//! any number of times; every redemption increments `use_count` in place and
//! raises (never lowers) the redeemer's tier.

use std::sync::Arc;

use nexo_shared::Tier;
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;

use crate::entitlement::EntitlementService;
use crate::error::{BillingError, BillingResult};
use crate::models::{ActivationCodeRecord, NewActivationCode, OrderRecord, UserRecord};
use crate::store::EntitlementStore;

const PREFIX: &str = "NEXO";
const GROUP_LEN: usize = 4;
/// No 0/O or 1/I, the codes get typed in by hand
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const MAX_ISSUE_ATTEMPTS: usize = 5;

/// Trim and uppercase `input`, then check it is `NEXO-XXXX-XXXX` with
/// alphanumeric groups.
pub fn normalize_code(input: &str) -> BillingResult<String> {
    let code = input.trim().to_ascii_uppercase();
    let mut parts = code.split('-');

    let valid = parts.next() == Some(PREFIX)
        && parts.next().is_some_and(is_group)
        && parts.next().is_some_and(is_group)
        && parts.next().is_none();

    if valid {
        Ok(code)
    } else {
        Err(BillingError::InvalidFormat)
    }
}

fn is_group(group: &str) -> bool {
    group.len() == GROUP_LEN && group.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Fresh random code from the unambiguous alphabet
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let mut group = || -> String {
        (0..GROUP_LEN)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    };
    let first = group();
    let second = group();
    format!("{}-{}-{}", PREFIX, first, second)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeValidation {
    pub code: String,
    pub tier: Tier,
    pub tier_name: &'static str,
    pub use_count: i32,
}

#[derive(Debug, Clone)]
pub struct Redemption {
    pub code: String,
    /// Tier the code grants
    pub granted: Tier,
    /// User's tier after the redemption
    pub tier: Tier,
    pub use_count: i32,
    pub user: UserRecord,
}

/// Who is redeeming a code
#[derive(Debug, Clone, Copy)]
pub struct Redeemer<'a> {
    pub email: &'a str,
    pub name: Option<&'a str>,
    pub auth_user_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    pub code: String,
    pub tier: Tier,
    pub tier_name: &'static str,
    pub email: String,
}

#[derive(Clone)]
pub struct ActivationLedger {
    store: Arc<dyn EntitlementStore>,
    entitlements: EntitlementService,
}

impl ActivationLedger {
    pub fn new(entitlements: EntitlementService) -> Self {
        Self {
            store: entitlements.store().clone(),
            entitlements,
        }
    }

    async fn lookup(&self, input: &str, now: OffsetDateTime) -> BillingResult<ActivationCodeRecord> {
        let code = normalize_code(input)?;
        let record = self
            .store
            .find_activation_code(&code)
            .await?
            .ok_or_else(|| BillingError::NotFound("Activation code".to_string()))?;
        if record.is_expired_at(now) {
            return Err(BillingError::Expired);
        }
        Ok(record)
    }

    /// Read-only check of a code
    pub async fn validate(&self, input: &str) -> BillingResult<CodeValidation> {
        let record = self.lookup(input, OffsetDateTime::now_utc()).await?;
        let tier = record.tier();
        Ok(CodeValidation {
            code: record.code,
            tier,
            tier_name: tier.name(),
            use_count: record.use_count,
        })
    }

    /// Redeem a code for `redeemer`, creating the user if needed.
    ///
    /// Identity sync happens in the background and never fails the
    /// redemption.
    pub async fn redeem(&self, input: &str, redeemer: Redeemer<'_>) -> BillingResult<Redemption> {
        let record = self.lookup(input, OffsetDateTime::now_utc()).await?;
        let granted = record.tier();

        let user = match redeemer.auth_user_id {
            Some(auth_id) => {
                self.entitlements
                    .register_login(redeemer.email, redeemer.name, auth_id)
                    .await?
            }
            None => {
                self.entitlements
                    .ensure_user(redeemer.email, redeemer.name)
                    .await?
            }
        };

        let change = self.entitlements.raise_tier(&user, granted).await?;

        let updated = self
            .store
            .record_code_redemption(&record.code, user.id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Activation code".to_string()))?;

        tracing::info!(
            code = %updated.code,
            user_id = %user.id,
            granted_tier = %granted,
            tier = %change.current,
            use_count = updated.use_count,
            "Redeemed activation code"
        );

        Ok(Redemption {
            code: updated.code,
            granted,
            tier: change.current,
            use_count: updated.use_count,
            user: change.user,
        })
    }

    /// Code for a fulfilled order, issuing one if the order has none yet.
    ///
    /// The flag is `true` only for the call that issued the code.
    pub async fn issue_for_order(
        &self,
        order: &OrderRecord,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<(ActivationCodeRecord, bool)> {
        if let Some(existing) = self.store.find_activation_code_by_order(order.id).await? {
            return Ok((existing, false));
        }

        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let candidate = NewActivationCode {
                code: generate_code(),
                tier: order.tier(),
                expires_at,
                order_id: Some(order.id),
            };

            if let Some(inserted) = self.store.insert_activation_code(&candidate).await? {
                tracing::info!(
                    order_id = %order.id,
                    code = %inserted.code,
                    tier = %order.tier(),
                    "Issued activation code"
                );
                return Ok((inserted, true));
            }

            // A concurrent fulfillment may have issued the order's code
            if let Some(existing) = self.store.find_activation_code_by_order(order.id).await? {
                return Ok((existing, false));
            }
            tracing::warn!(order_id = %order.id, attempt, "Activation code collision, retrying");
        }

        Err(BillingError::Internal(format!(
            "could not issue a unique activation code for order {}",
            order.id
        )))
    }

    /// Code issued for the order of a checkout session
    pub async fn fetch_by_session(&self, session_id: &str) -> BillingResult<IssuedCode> {
        let order = self
            .store
            .find_order_by_session(session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Order for session".to_string()))?;
        let code = self
            .store
            .find_activation_code_by_order(order.id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Activation code".to_string()))?;
        let user = self
            .store
            .find_user_by_id(order.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("User".to_string()))?;

        let tier = code.tier();
        Ok(IssuedCode {
            code: code.code,
            tier,
            tier_name: tier.name(),
            email: user.email,
        })
    }
}
