//! In-memory store for tests and local development.
//!
//! All tables sit behind one lock, so every trait method is atomic in the
//! same way the corresponding single SQL statement is.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nexo_shared::Tier;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::EntitlementStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    normalize_email, ActivationCodeRecord, CouponRecord, EntitlementRecord, NewActivationCode,
    NewOrder, NewUser, OrderRecord, OrderStatus, UserRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    orders: HashMap<String, OrderRecord>,
    codes: HashMap<String, ActivationCodeRecord>,
    entitlements: HashMap<(Uuid, i16), EntitlementRecord>,
    coupons: HashMap<String, CouponRecord>,
    webhook_events: HashMap<String, String>,
}

/// Wraps data in Arc for cheap cloning
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an activation code directly
    pub async fn seed_activation_code(
        &self,
        code: &str,
        tier: Tier,
        expires_at: Option<OffsetDateTime>,
    ) -> ActivationCodeRecord {
        let record = ActivationCodeRecord {
            id: Uuid::new_v4(),
            code: code.to_string(),
            tier: tier.as_i16(),
            expires_at,
            use_count: 0,
            last_used_by: None,
            last_used_at: None,
            order_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.tables
            .lock()
            .await
            .codes
            .insert(record.code.clone(), record.clone());
        record
    }

    pub async fn seed_coupon(&self, coupon: CouponRecord) {
        self.tables
            .lock()
            .await
            .coupons
            .insert(coupon.code.clone(), coupon);
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }
}

fn coupon_valid_at(coupon: &CouponRecord, now: OffsetDateTime) -> bool {
    coupon.active
        && coupon.expires_at.map_or(true, |expires| expires > now)
        && coupon
            .max_redemptions
            .map_or(true, |max| coupon.redeemed_count < max)
}

#[async_trait]
impl EntitlementStore for InMemoryStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        let email = normalize_email(email);
        let tables = self.tables.lock().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_stripe_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn create_user_if_absent(&self, user: &NewUser) -> BillingResult<(UserRecord, bool)> {
        let email = normalize_email(&user.email);
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.users.values().find(|u| u.email == email) {
            return Ok((existing.clone(), false));
        }

        let now = OffsetDateTime::now_utc();
        let record = UserRecord {
            id: Uuid::new_v4(),
            email,
            name: user.name.clone(),
            tier: user.tier.as_i16(),
            role: "user".to_string(),
            stripe_customer_id: user.stripe_customer_id.clone(),
            auth_user_id: None,
            selected_course: None,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn raise_user_tier(&self, user_id: Uuid, candidate: Tier) -> BillingResult<UserRecord> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        if user.tier < candidate.as_i16() {
            user.tier = candidate.as_i16();
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(user.clone())
    }

    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> BillingResult<UserRecord> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        user.tier = tier.as_i16();
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn link_stripe_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.users.get_mut(&user_id) {
            if user.stripe_customer_id.is_none() {
                user.stripe_customer_id = Some(customer_id.to_string());
            }
        }
        Ok(())
    }

    async fn link_auth_user(&self, user_id: Uuid, auth_user_id: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.users.get_mut(&user_id) {
            if user.auth_user_id.is_none() {
                user.auth_user_id = Some(auth_user_id.to_string());
            }
        }
        Ok(())
    }

    async fn upsert_entitlement(&self, user_id: Uuid, tier: Tier) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        tables
            .entitlements
            .entry((user_id, tier.as_i16()))
            .and_modify(|e| {
                e.active = true;
                e.updated_at = now;
            })
            .or_insert(EntitlementRecord {
                user_id,
                tier: tier.as_i16(),
                active: true,
                updated_at: now,
            });
        Ok(())
    }

    async fn deactivate_entitlements(&self, user_id: Uuid) -> BillingResult<u64> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let mut changed = 0;
        for entitlement in tables
            .entitlements
            .values_mut()
            .filter(|e| e.user_id == user_id && e.active)
        {
            entitlement.active = false;
            entitlement.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_entitlements(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementRecord>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<_> = tables
            .entitlements
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.tier);
        Ok(rows)
    }

    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<OrderRecord>> {
        Ok(self.tables.lock().await.orders.get(session_id).cloned())
    }

    async fn create_order_if_absent(&self, order: &NewOrder) -> BillingResult<(OrderRecord, bool)> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.orders.get(&order.external_session_id) {
            return Ok((existing.clone(), false));
        }

        let now = OffsetDateTime::now_utc();
        let record = OrderRecord {
            id: Uuid::new_v4(),
            external_session_id: order.external_session_id.clone(),
            user_id: order.user_id,
            tier: order.tier.as_i16(),
            amount_cents: order.amount_cents,
            currency: order.currency.clone(),
            status: order.status.as_str().to_string(),
            coupon_code: order.coupon_code.clone(),
            created_at: now,
            updated_at: now,
        };
        tables
            .orders
            .insert(record.external_session_id.clone(), record.clone());
        Ok((record, true))
    }

    async fn transition_order(
        &self,
        session_id: &str,
        status: OrderStatus,
    ) -> BillingResult<Option<OrderRecord>> {
        let mut tables = self.tables.lock().await;
        match tables.orders.get_mut(session_id) {
            Some(order) if order.status().can_transition_to(status) => {
                order.status = status.as_str().to_string();
                order.updated_at = OffsetDateTime::now_utc();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_stale_pending_orders(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<OrderRecord>> {
        let tables = self.tables.lock().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|o| !o.status().is_terminal() && o.created_at < created_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.updated_at, o.created_at));
        orders.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(orders)
    }

    async fn touch_order(&self, session_id: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(order) = tables
            .orders
            .get_mut(session_id)
            .filter(|o| !o.status().is_terminal())
        {
            order.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn find_activation_code(
        &self,
        code: &str,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        Ok(self.tables.lock().await.codes.get(code).cloned())
    }

    async fn find_activation_code_by_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .codes
            .values()
            .find(|c| c.order_id == Some(order_id))
            .cloned())
    }

    async fn insert_activation_code(
        &self,
        code: &NewActivationCode,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let mut tables = self.tables.lock().await;
        let order_taken = code
            .order_id
            .is_some_and(|id| tables.codes.values().any(|c| c.order_id == Some(id)));
        if order_taken || tables.codes.contains_key(&code.code) {
            return Ok(None);
        }

        let record = ActivationCodeRecord {
            id: Uuid::new_v4(),
            code: code.code.clone(),
            tier: code.tier.as_i16(),
            expires_at: code.expires_at,
            use_count: 0,
            last_used_by: None,
            last_used_at: None,
            order_id: code.order_id,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.codes.insert(record.code.clone(), record.clone());
        Ok(Some(record))
    }

    async fn record_code_redemption(
        &self,
        code: &str,
        user_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.codes.get_mut(code).map(|record| {
            record.use_count += 1;
            record.last_used_by = Some(user_id);
            record.last_used_at = Some(OffsetDateTime::now_utc());
            record.clone()
        }))
    }

    async fn find_coupon(&self, code: &str) -> BillingResult<Option<CouponRecord>> {
        Ok(self.tables.lock().await.coupons.get(code).cloned())
    }

    async fn redeem_coupon(&self, code: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.coupons.get_mut(code) {
            Some(coupon) if coupon_valid_at(coupon, now) => {
                coupon.redeemed_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_webhook_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.webhook_events.get(event_id).map(String::as_str) {
            Some("success") | Some("processing") => Ok(false),
            _ => {
                tables
                    .webhook_events
                    .insert(event_id.to_string(), "processing".to_string());
                Ok(true)
            }
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .webhook_events
            .insert(event_id.to_string(), result.to_string());
        Ok(())
    }
}
