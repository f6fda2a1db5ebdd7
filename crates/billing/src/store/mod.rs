//! Primary store for users, orders, activation codes, entitlements and coupons.
//!
//! The primary store is the source of truth for tiers. Every write that can
//! race with a webhook delivery is expressed as a single conditional
//! statement (insert-if-absent, `GREATEST` merge, in-place increment) so the
//! implementations never read-modify-write in application code.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use nexo_shared::Tier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    ActivationCodeRecord, CouponRecord, EntitlementRecord, NewActivationCode, NewOrder, NewUser,
    OrderRecord, OrderStatus, UserRecord,
};

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    // Users

    async fn find_user_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>>;

    /// Lookup by normalized email
    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>>;

    async fn find_user_by_stripe_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>>;

    /// Insert the user unless one with the same email exists.
    ///
    /// Returns the stored row and whether this call created it.
    async fn create_user_if_absent(&self, user: &NewUser) -> BillingResult<(UserRecord, bool)>;

    /// `tier = max(tier, candidate)`, applied atomically
    async fn raise_user_tier(&self, user_id: Uuid, candidate: Tier) -> BillingResult<UserRecord>;

    /// Overwrite the tier. Only for deliberate demotion/admin changes.
    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> BillingResult<UserRecord>;

    /// Set the Stripe customer id if none is stored yet
    async fn link_stripe_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;

    /// Set the identity provider user id if none is stored yet
    async fn link_auth_user(&self, user_id: Uuid, auth_user_id: &str) -> BillingResult<()>;

    // Entitlements

    /// Insert or reactivate the `(user, tier)` row
    async fn upsert_entitlement(&self, user_id: Uuid, tier: Tier) -> BillingResult<()>;

    /// Deactivate every row of the user. Returns the number of rows changed.
    async fn deactivate_entitlements(&self, user_id: Uuid) -> BillingResult<u64>;

    async fn list_entitlements(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementRecord>>;

    // Orders

    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<OrderRecord>>;

    /// Insert unless an order for the same external session id exists.
    ///
    /// Returns the stored row and whether this call created it. A duplicate
    /// is not an error.
    async fn create_order_if_absent(&self, order: &NewOrder) -> BillingResult<(OrderRecord, bool)>;

    /// Move an open (`PENDING`/`IN_PROCESS`) order to `status`.
    ///
    /// Returns `None` when there is no open order for the session, so
    /// terminal states are never overwritten.
    async fn transition_order(
        &self,
        session_id: &str,
        status: OrderStatus,
    ) -> BillingResult<Option<OrderRecord>>;

    /// Open orders created before `created_before`, least recently
    /// checked first
    async fn list_stale_pending_orders(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<OrderRecord>>;

    /// Bump `updated_at` on an open order so the next sweep reaches others first
    async fn touch_order(&self, session_id: &str) -> BillingResult<()>;

    // Activation codes

    /// Lookup by normalized (uppercase) code
    async fn find_activation_code(&self, code: &str)
        -> BillingResult<Option<ActivationCodeRecord>>;

    async fn find_activation_code_by_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>>;

    /// Insert a code. Returns `None` if the code or the originating order
    /// already has a row.
    async fn insert_activation_code(
        &self,
        code: &NewActivationCode,
    ) -> BillingResult<Option<ActivationCodeRecord>>;

    /// Increment the use count in place and record the redeemer
    async fn record_code_redemption(
        &self,
        code: &str,
        user_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>>;

    // Coupons

    async fn find_coupon(&self, code: &str) -> BillingResult<Option<CouponRecord>>;

    /// Increment `redeemed_count` only while the coupon is still valid at
    /// `now`. Returns whether a redemption was recorded.
    async fn redeem_coupon(&self, code: &str, now: OffsetDateTime) -> BillingResult<bool>;

    // Webhook idempotency

    /// Claim exclusive processing of a provider event. `false` means another
    /// delivery already claimed or finished it.
    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}
