//! Rows of the entitlement schema and the values used to create them

use nexo_shared::Tier;
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub tier: i16,
    pub role: String,
    pub stripe_customer_id: Option<String>,
    /// Supabase Auth user id, set on first login
    pub auth_user_id: Option<String>,
    /// Course a STARTER user picked as their single course
    pub selected_course: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserRecord {
    /// Stored tier. The column is constrained to 0..=3.
    pub fn tier(&self) -> Tier {
        Tier::try_from(self.tier).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub tier: Tier,
    pub stripe_customer_id: Option<String>,
}

impl NewUser {
    pub fn free(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            tier: Tier::Free,
            stripe_customer_id: None,
        }
    }
}

/// Emails are the join key with the identity provider, so they are compared
/// trimmed and lowercased everywhere.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Order lifecycle: `PENDING → APPROVED | REJECTED | CANCELLED`.
///
/// `IN_PROCESS` is the payment provider's transient state, stored as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    InProcess,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Approved => "APPROVED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::InProcess => "IN_PROCESS",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Approved | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        !self.is_terminal() && *self != next
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "APPROVED" => Ok(OrderStatus::Approved),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "IN_PROCESS" => Ok(OrderStatus::InProcess),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: Uuid,
    pub external_session_id: String,
    pub user_id: Uuid,
    pub tier: i16,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub coupon_code: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OrderRecord {
    pub fn status(&self) -> OrderStatus {
        self.status.parse().unwrap_or(OrderStatus::Pending)
    }

    pub fn tier(&self) -> Tier {
        Tier::try_from(self.tier).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub external_session_id: String,
    pub user_id: Uuid,
    pub tier: Tier,
    pub amount_cents: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCodeRecord {
    pub id: Uuid,
    pub code: String,
    pub tier: i16,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub use_count: i32,
    pub last_used_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    pub order_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ActivationCodeRecord {
    pub fn tier(&self) -> Tier {
        Tier::try_from(self.tier).unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewActivationCode {
    pub code: String,
    pub tier: Tier,
    pub expires_at: Option<OffsetDateTime>,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    pub user_id: Uuid,
    pub tier: i16,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CouponRecord {
    pub code: String,
    /// `PERCENT` or `FIXED`
    pub discount_type: String,
    /// Percentage points for `PERCENT`, cents for `FIXED`
    pub amount: i64,
    pub max_redemptions: Option<i32>,
    pub redeemed_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
