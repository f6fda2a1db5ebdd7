//! Entitlement invariants
//!
//! Read-only consistency checks between users, entitlement rows, orders,
//! activation codes and webhook bookkeeping. Each check is one SQL query.
//! The worker runs them daily; they can also be run after a manual fix or a
//! webhook replay.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// A user is missing access they paid for
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Fold violations from `checks_run` checks into a summary
pub fn summarize(
    violations: Vec<InvariantViolation>,
    checks_run: usize,
    checked_at: OffsetDateTime,
) -> InvariantCheckSummary {
    let checks_failed = violations
        .iter()
        .map(|v| v.invariant.as_str())
        .collect::<HashSet<_>>()
        .len();
    InvariantCheckSummary {
        checked_at,
        checks_run,
        checks_passed: checks_run.saturating_sub(checks_failed),
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

impl InvariantCheckSummary {
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations
            .iter()
            .map(|v| v.severity)
            .min_by_key(|s| match s {
                ViolationSeverity::Critical => 0,
                ViolationSeverity::High => 1,
                ViolationSeverity::Medium => 2,
                ViolationSeverity::Low => 3,
            })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserTierRow {
    user_id: Uuid,
    email: String,
    tier: i16,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderTierRow {
    user_id: Uuid,
    external_session_id: String,
    order_tier: i16,
    user_tier: i16,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    user_id: Uuid,
    external_session_id: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(summarize(violations, Self::available_checks().len(), now))
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_tier_has_entitlement" => self.check_paid_tier_has_entitlement().await,
            "free_user_has_no_entitlement" => self.check_free_user_has_no_entitlement().await,
            "approved_order_tier_granted" => self.check_approved_order_tier_granted().await,
            "approved_order_has_code" => self.check_approved_order_has_code().await,
            "no_stale_pending_orders" => self.check_no_stale_pending_orders().await,
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_tier_has_entitlement",
            "free_user_has_no_entitlement",
            "approved_order_tier_granted",
            "approved_order_has_code",
            "no_stale_pending_orders",
            "no_stuck_webhook_events",
        ]
    }

    /// A paid user has an active entitlement row for their tier
    async fn check_paid_tier_has_entitlement(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UserTierRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.email, u.tier
            FROM users u
            WHERE u.tier > 0
              AND NOT EXISTS (
                  SELECT 1 FROM entitlements e
                  WHERE e.user_id = u.id AND e.tier = u.tier AND e.active
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_tier_has_entitlement".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User {} has tier {} but no active entitlement row for it",
                    row.email, row.tier
                ),
                context: serde_json::json!({ "email": row.email, "tier": row.tier }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_free_user_has_no_entitlement(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UserTierRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT u.id AS user_id, u.email, u.tier
            FROM users u
            JOIN entitlements e ON e.user_id = u.id AND e.active
            WHERE u.tier = 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_user_has_no_entitlement".to_string(),
                user_ids: vec![row.user_id],
                description: format!("FREE user {} still has active entitlement rows", row.email),
                context: serde_json::json!({ "email": row.email }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Approved orders never exceed the owner's tier. Expected after a
    /// deliberate demotion, so only reported for users that were never
    /// demoted to FREE.
    async fn check_approved_order_tier_granted(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderTierRow> = sqlx::query_as(
            r#"
            SELECT o.user_id, o.external_session_id, o.tier AS order_tier, u.tier AS user_tier
            FROM orders o
            JOIN users u ON u.id = o.user_id
            WHERE o.status = 'APPROVED'
              AND o.tier > u.tier
              AND u.tier > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_order_tier_granted".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Order {} grants tier {} but the user has tier {}",
                    row.external_session_id, row.order_tier, row.user_tier
                ),
                context: serde_json::json!({
                    "session_id": row.external_session_id,
                    "order_tier": row.order_tier,
                    "user_tier": row.user_tier,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_approved_order_has_code(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT o.user_id, o.external_session_id, o.created_at
            FROM orders o
            WHERE o.status = 'APPROVED'
              AND o.created_at < NOW() - INTERVAL '1 hour'
              AND NOT EXISTS (SELECT 1 FROM activation_codes c WHERE c.order_id = o.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_order_has_code".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Approved order {} has no activation code",
                    row.external_session_id
                ),
                context: serde_json::json!({
                    "session_id": row.external_session_id,
                    "created_at": row.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_no_stale_pending_orders(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            r#"
            SELECT user_id, external_session_id, created_at
            FROM orders
            WHERE status IN ('PENDING', 'IN_PROCESS')
              AND created_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_orders".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Order {} has been open for over a day",
                    row.external_session_id
                ),
                context: serde_json::json!({
                    "session_id": row.external_session_id,
                    "created_at": row.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) is stuck in processing",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "event_id": row.stripe_event_id,
                    "started_at": row.processing_started_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
