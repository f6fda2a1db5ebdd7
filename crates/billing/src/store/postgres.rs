//! PostgreSQL store

use async_trait::async_trait;
use nexo_shared::Tier;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::EntitlementStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    normalize_email, ActivationCodeRecord, CouponRecord, EntitlementRecord, NewActivationCode,
    NewOrder, NewUser, OrderRecord, OrderStatus, UserRecord,
};

const USER_COLUMNS: &str = "id, email, name, tier, role, stripe_customer_id, auth_user_id, \
                            selected_course, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, external_session_id, user_id, tier, amount_cents, currency, \
                             status, coupon_code, created_at, updated_at";

const CODE_COLUMNS: &str = "id, code, tier, expires_at, use_count, last_used_by, last_used_at, \
                            order_id, created_at";

/// Webhook events stuck in `processing` longer than this may be re-claimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        let user = sqlx::query_as(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        let user = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_stripe_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let user = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE stripe_customer_id = $1 LIMIT 1",
            USER_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_user_if_absent(&self, user: &NewUser) -> BillingResult<(UserRecord, bool)> {
        let email = normalize_email(&user.email);

        let inserted: Option<UserRecord> = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (email, name, tier, stripe_customer_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(&email)
        .bind(&user.name)
        .bind(user.tier.as_i16())
        .bind(&user.stripe_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        // Lost the race (or the user already existed): read the winner's row
        let existing = self
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("user {} vanished after conflict", email)))?;
        Ok((existing, false))
    }

    async fn raise_user_tier(&self, user_id: Uuid, candidate: Tier) -> BillingResult<UserRecord> {
        sqlx::query_as(&format!(
            r#"
            UPDATE users
            SET tier = GREATEST(tier, $2),
                updated_at = CASE WHEN tier < $2 THEN NOW() ELSE updated_at END
            WHERE id = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(candidate.as_i16())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))
    }

    async fn set_user_tier(&self, user_id: Uuid, tier: Tier) -> BillingResult<UserRecord> {
        sqlx::query_as(&format!(
            "UPDATE users SET tier = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(tier.as_i16())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))
    }

    async fn link_stripe_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_auth_user(&self, user_id: Uuid, auth_user_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users SET auth_user_id = $2, updated_at = NOW()
            WHERE id = $1 AND auth_user_id IS NULL
            "#,
        )
        .bind(user_id)
        .bind(auth_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_entitlement(&self, user_id: Uuid, tier: Tier) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, tier, active, updated_at)
            VALUES ($1, $2, TRUE, NOW())
            ON CONFLICT (user_id, tier) DO UPDATE SET active = TRUE, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(tier.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_entitlements(&self, user_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE entitlements SET active = FALSE, updated_at = NOW() WHERE user_id = $1 AND active",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_entitlements(&self, user_id: Uuid) -> BillingResult<Vec<EntitlementRecord>> {
        let rows = sqlx::query_as(
            "SELECT user_id, tier, active, updated_at FROM entitlements WHERE user_id = $1 ORDER BY tier",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_order_by_session(&self, session_id: &str) -> BillingResult<Option<OrderRecord>> {
        let order = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE external_session_id = $1",
            ORDER_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn create_order_if_absent(&self, order: &NewOrder) -> BillingResult<(OrderRecord, bool)> {
        let inserted: Option<OrderRecord> = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders
                (external_session_id, user_id, tier, amount_cents, currency, status, coupon_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_session_id) DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(&order.external_session_id)
        .bind(order.user_id)
        .bind(order.tier.as_i16())
        .bind(order.amount_cents)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(&order.coupon_code)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        let existing = self
            .find_order_by_session(&order.external_session_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "order for session {} vanished after conflict",
                    order.external_session_id
                ))
            })?;
        Ok((existing, false))
    }

    async fn transition_order(
        &self,
        session_id: &str,
        status: OrderStatus,
    ) -> BillingResult<Option<OrderRecord>> {
        let order = sqlx::query_as(&format!(
            r#"
            UPDATE orders SET status = $2, updated_at = NOW()
            WHERE external_session_id = $1
              AND status IN ('PENDING', 'IN_PROCESS')
              AND status <> $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(session_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn list_stale_pending_orders(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<OrderRecord>> {
        let orders = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM orders
            WHERE status IN ('PENDING', 'IN_PROCESS') AND created_at < $1
            ORDER BY updated_at, created_at
            LIMIT $2
            "#,
            ORDER_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn touch_order(&self, session_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE orders SET updated_at = NOW()
            WHERE external_session_id = $1 AND status IN ('PENDING', 'IN_PROCESS')
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_activation_code(
        &self,
        code: &str,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let row = sqlx::query_as(&format!(
            "SELECT {} FROM activation_codes WHERE code = $1",
            CODE_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_activation_code_by_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let row = sqlx::query_as(&format!(
            "SELECT {} FROM activation_codes WHERE order_id = $1",
            CODE_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_activation_code(
        &self,
        code: &NewActivationCode,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let row = sqlx::query_as(&format!(
            r#"
            INSERT INTO activation_codes (code, tier, expires_at, order_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            CODE_COLUMNS
        ))
        .bind(&code.code)
        .bind(code.tier.as_i16())
        .bind(code.expires_at)
        .bind(code.order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record_code_redemption(
        &self,
        code: &str,
        user_id: Uuid,
    ) -> BillingResult<Option<ActivationCodeRecord>> {
        let row = sqlx::query_as(&format!(
            r#"
            UPDATE activation_codes
            SET use_count = use_count + 1, last_used_by = $2, last_used_at = NOW()
            WHERE code = $1
            RETURNING {}
            "#,
            CODE_COLUMNS
        ))
        .bind(code)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_coupon(&self, code: &str) -> BillingResult<Option<CouponRecord>> {
        let row = sqlx::query_as(
            r#"
            SELECT code, discount_type, amount, max_redemptions, redeemed_count,
                   expires_at, active, created_at
            FROM coupons WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn redeem_coupon(&self, code: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupons SET redeemed_count = redeemed_count + 1
            WHERE code = $1
              AND active
              AND (expires_at IS NULL OR expires_at > $2)
              AND (max_redemptions IS NULL OR redeemed_count < max_redemptions)
            "#,
        )
        .bind(code)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($3 || ' minutes')::INTERVAL)
               OR stripe_webhook_events.processing_result = 'error'
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
