//! Coupon validation and discount math

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::CouponRecord;
use crate::store::EntitlementStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    Percent,
    Fixed,
}

impl DiscountType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PERCENT" => Some(DiscountType::Percent),
            "FIXED" => Some(DiscountType::Fixed),
            _ => None,
        }
    }
}

/// Price after a coupon, in cents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponQuote {
    pub code: String,
    pub discount_type: DiscountType,
    pub original_amount: i64,
    pub discount: i64,
    pub discounted_amount: i64,
}

/// Why a coupon cannot be used right now, `None` if it can
pub fn unavailable_reason(coupon: &CouponRecord, now: OffsetDateTime) -> Option<&'static str> {
    if !coupon.active {
        return Some("coupon is inactive");
    }
    if coupon.expires_at.is_some_and(|expires| expires <= now) {
        return Some("coupon has expired");
    }
    if coupon
        .max_redemptions
        .is_some_and(|max| coupon.redeemed_count >= max)
    {
        return Some("coupon has been fully redeemed");
    }
    None
}

/// Discount in cents, never more than `amount`
pub fn discount_for(discount_type: DiscountType, coupon_amount: i64, amount: i64) -> i64 {
    let amount = amount.max(0);
    let discount = match discount_type {
        DiscountType::Percent => amount * coupon_amount.clamp(0, 100) / 100,
        DiscountType::Fixed => coupon_amount.max(0),
    };
    discount.min(amount)
}

#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn EntitlementStore>,
}

impl CouponService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    pub async fn validate(
        &self,
        code: &str,
        amount: i64,
        now: OffsetDateTime,
    ) -> BillingResult<CouponQuote> {
        if amount < 0 {
            return Err(BillingError::InvalidInput("amount must not be negative".to_string()));
        }
        let code = code.trim().to_ascii_uppercase();
        let coupon = self
            .store
            .find_coupon(&code)
            .await?
            .ok_or_else(|| BillingError::NotFound("Coupon".to_string()))?;

        if let Some(reason) = unavailable_reason(&coupon, now) {
            return Err(BillingError::CouponUnavailable(reason.to_string()));
        }

        let discount_type = DiscountType::parse(&coupon.discount_type).ok_or_else(|| {
            BillingError::Internal(format!("unknown discount type {}", coupon.discount_type))
        })?;
        let discount = discount_for(discount_type, coupon.amount, amount);

        Ok(CouponQuote {
            code: coupon.code,
            discount_type,
            original_amount: amount,
            discount,
            discounted_amount: amount - discount,
        })
    }

    /// Count a redemption if the coupon is still valid. Returns whether it
    /// was counted.
    pub async fn redeem(&self, code: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let code = code.trim().to_ascii_uppercase();
        let counted = self.store.redeem_coupon(&code, now).await?;
        if !counted {
            tracing::warn!(coupon = %code, "Coupon redemption not counted, coupon unavailable");
        }
        Ok(counted)
    }
}
