//! Tier resolution.
//!
//! A user's tier can be raised by three independent signals: the tier
//! already stored, an activation code, and a paid checkout session. The
//! resolver only ever takes the maximum. `max` is commutative and
//! idempotent, which is what lets a webhook and the polling fallback race on
//! the same user without coordination.
//!
//! Lowering a tier is never done here; see
//! [`EntitlementService::set_tier`](crate::entitlement::EntitlementService::set_tier).

use nexo_shared::Tier;

/// Signals that may raise a user's tier. Absent signals are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierSignals {
    pub stored: Option<Tier>,
    pub code_grant: Option<Tier>,
    pub session: Option<Tier>,
}

impl TierSignals {
    pub fn stored(tier: Tier) -> Self {
        Self {
            stored: Some(tier),
            ..Self::default()
        }
    }

    pub fn with_code_grant(mut self, tier: Tier) -> Self {
        self.code_grant = Some(tier);
        self
    }

    pub fn with_session(mut self, tier: Tier) -> Self {
        self.session = Some(tier);
        self
    }
}

/// `max(current, candidate)`
pub fn merge(current: Tier, candidate: Tier) -> Tier {
    current.max(candidate)
}

/// Highest tier among the present signals, `FREE` if none are present
pub fn resolve(signals: &TierSignals) -> Tier {
    [signals.stored, signals.code_grant, signals.session]
        .into_iter()
        .flatten()
        .fold(Tier::Free, merge)
}

/// Disagreement between the stored tier and a checkout session's tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDivergence {
    /// The stored tier is ahead, usually because the webhook already ran
    /// or the user redeemed a higher code
    StoredAhead { stored: Tier, session: Tier },
    /// The session grants more than is stored; reconciliation will raise it
    SessionAhead { stored: Tier, session: Tier },
}

pub fn divergence(stored: Tier, session: Tier) -> Option<TierDivergence> {
    match stored.cmp(&session) {
        std::cmp::Ordering::Greater => Some(TierDivergence::StoredAhead { stored, session }),
        std::cmp::Ordering::Less => Some(TierDivergence::SessionAhead { stored, session }),
        std::cmp::Ordering::Equal => None,
    }
}

/// Resolve a stored tier against a session tier, logging any divergence.
///
/// Never regresses: the result is the higher of the two.
pub fn reconcile_with_session(session_id: &str, stored: Tier, session: Tier) -> Tier {
    if let Some(d) = divergence(stored, session) {
        tracing::warn!(
            session_id = %session_id,
            stored_tier = %stored,
            session_tier = %session,
            divergence = ?d,
            "Stored tier and checkout session tier diverge, keeping the higher"
        );
    }
    merge(stored, session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_takes_the_maximum() {
        let signals = TierSignals::stored(Tier::Starter)
            .with_code_grant(Tier::Pro)
            .with_session(Tier::Free);
        assert_eq!(resolve(&signals), Tier::Pro);
    }

    #[test]
    fn resolve_without_signals_is_free() {
        assert_eq!(resolve(&TierSignals::default()), Tier::Free);
    }

    #[test]
    fn merge_never_lowers() {
        for current in Tier::ALL {
            for candidate in Tier::ALL {
                assert!(merge(current, candidate) >= current);
            }
        }
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        for a in Tier::ALL {
            for b in Tier::ALL {
                assert_eq!(merge(merge(a, b), b), merge(a, b));
                assert_eq!(merge(a, b), merge(b, a));
            }
        }
    }

    #[test]
    fn divergence_direction() {
        assert_eq!(
            divergence(Tier::Pro, Tier::Starter),
            Some(TierDivergence::StoredAhead {
                stored: Tier::Pro,
                session: Tier::Starter
            })
        );
        assert_eq!(
            divergence(Tier::Free, Tier::Operator),
            Some(TierDivergence::SessionAhead {
                stored: Tier::Free,
                session: Tier::Operator
            })
        );
        assert_eq!(divergence(Tier::Pro, Tier::Pro), None);
    }

    #[test]
    fn webhook_ahead_of_polling_keeps_stored_tier() {
        assert_eq!(
            reconcile_with_session("cs_test_1", Tier::Operator, Tier::Pro),
            Tier::Operator
        );
        assert_eq!(
            reconcile_with_session("cs_test_2", Tier::Starter, Tier::Pro),
            Tier::Pro
        );
    }
}
