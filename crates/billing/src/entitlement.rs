//! User tiers and entitlement rows
//!
//! All tier writes go through [`EntitlementService`]. Raises are monotonic
//! (`GREATEST` in the store); [`set_tier`](EntitlementService::set_tier) is
//! the one deliberate overwrite, used by admin changes and cancellations.

use std::sync::Arc;

use nexo_shared::Tier;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::identity::IdentitySync;
use crate::models::{NewUser, UserRecord};
use crate::provider::PaymentProvider;
use crate::store::EntitlementStore;

/// Result of a tier write
#[derive(Debug, Clone)]
pub struct TierChange {
    pub user: UserRecord,
    pub previous: Tier,
    pub current: Tier,
}

impl TierChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCancellation {
    pub user: UserRecord,
    pub cancelled_subscriptions: Vec<String>,
}

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    identity: IdentitySync,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn EntitlementStore>, identity: IdentitySync) -> Self {
        Self { store, identity }
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub fn identity(&self) -> &IdentitySync {
        &self.identity
    }

    /// Fetch the user for `email`, creating a FREE user if there is none
    pub async fn ensure_user(&self, email: &str, name: Option<&str>) -> BillingResult<UserRecord> {
        if email.trim().is_empty() {
            return Err(BillingError::InvalidInput("email is required".to_string()));
        }
        let new_user = NewUser {
            name: name.map(str::to_string),
            ..NewUser::free(email)
        };
        let (user, created) = self.store.create_user_if_absent(&new_user).await?;
        if created {
            tracing::info!(user_id = %user.id, "Created user");
        }
        Ok(user)
    }

    /// Record the caller's identity id on first authenticated request
    pub async fn register_login(
        &self,
        email: &str,
        name: Option<&str>,
        auth_user_id: &str,
    ) -> BillingResult<UserRecord> {
        let user = self.ensure_user(email, name).await?;
        if user.auth_user_id.is_none() {
            self.store.link_auth_user(user.id, auth_user_id).await?;
            return Ok(UserRecord {
                auth_user_id: Some(auth_user_id.to_string()),
                ..user
            });
        }
        Ok(user)
    }

    /// `tier = max(tier, candidate)`; upserts the matching entitlement row
    /// and mirrors the tier when it changed.
    pub async fn raise_tier(&self, user: &UserRecord, candidate: Tier) -> BillingResult<TierChange> {
        let previous = user.tier();
        let updated = self.store.raise_user_tier(user.id, candidate).await?;
        let current = updated.tier();

        if current.is_paid() {
            self.store.upsert_entitlement(updated.id, current).await?;
        }

        let change = TierChange {
            user: updated,
            previous,
            current,
        };

        if change.changed() {
            tracing::info!(
                user_id = %change.user.id,
                previous_tier = %previous,
                tier = %current,
                "Raised user tier"
            );
            self.identity.mirror_tier(
                &change.user.email,
                change.user.auth_user_id.as_deref(),
                current,
            );
        }
        Ok(change)
    }

    /// Overwrite the tier. `FREE` deactivates every entitlement row; a paid
    /// tier upserts only that tier's row.
    pub async fn set_tier(&self, user_id: Uuid, tier: Tier) -> BillingResult<TierChange> {
        let existing = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        let previous = existing.tier();

        let user = self.store.set_user_tier(user_id, tier).await?;
        if tier == Tier::Free {
            let deactivated = self.store.deactivate_entitlements(user_id).await?;
            tracing::info!(user_id = %user_id, deactivated, "Deactivated entitlements");
        } else {
            self.store.upsert_entitlement(user_id, tier).await?;
        }

        tracing::info!(
            user_id = %user_id,
            previous_tier = %previous,
            tier = %tier,
            "Set user tier"
        );
        self.identity
            .mirror_tier(&user.email, user.auth_user_id.as_deref(), tier);

        Ok(TierChange {
            user,
            previous,
            current: tier,
        })
    }

    /// Cancel every active subscription of the user and demote to FREE.
    ///
    /// Nothing is written locally if the provider call fails.
    pub async fn cancel_subscriptions(
        &self,
        user_id: Uuid,
        payments: &dyn PaymentProvider,
    ) -> BillingResult<SubscriptionCancellation> {
        let user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;

        let mut cancelled = Vec::new();
        if let Some(customer_id) = user.stripe_customer_id.as_deref() {
            for subscription_id in payments.list_active_subscriptions(customer_id).await? {
                payments.cancel_subscription(&subscription_id).await?;
                cancelled.push(subscription_id);
            }
        }

        let change = self.set_tier(user_id, Tier::Free).await?;
        tracing::info!(
            user_id = %user_id,
            cancelled = cancelled.len(),
            "Cancelled subscriptions"
        );

        Ok(SubscriptionCancellation {
            user: change.user,
            cancelled_subscriptions: cancelled,
        })
    }

    /// Demote the owner of a Stripe customer whose subscription ended.
    /// `None` when no user is linked to the customer.
    pub async fn demote_customer(&self, customer_id: &str) -> BillingResult<Option<TierChange>> {
        match self.store.find_user_by_stripe_customer(customer_id).await? {
            Some(user) => Ok(Some(self.set_tier(user.id, Tier::Free).await?)),
            None => {
                tracing::warn!(customer_id = %customer_id, "No user for Stripe customer");
                Ok(None)
            }
        }
    }
}
