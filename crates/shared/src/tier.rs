//! Access tier definitions.
//!
//! Tiers are stored as a small integer in the primary store and surfaced as
//! both a number and a symbolic name everywhere else (API responses, Supabase
//! user metadata, order rows). Both forms must round-trip.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Course access tier, ordered from least to most access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Marketing content and lead magnets only
    #[default]
    Free,
    /// One course (the user's selected path)
    Starter,
    /// Every course
    Pro,
    /// Every course plus operator assets
    Operator,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Operator];

    /// Numeric level stored in `users.tier`
    pub fn level(self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Starter => 1,
            Tier::Pro => 2,
            Tier::Operator => 3,
        }
    }

    /// Inverse of [`Tier::level`]. Returns `None` outside `0..=3`.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Tier::Free),
            1 => Some(Tier::Starter),
            2 => Some(Tier::Pro),
            3 => Some(Tier::Operator),
            _ => None,
        }
    }

    /// Symbolic name, as shown to users and written into identity metadata
    pub fn name(self) -> &'static str {
        match self {
            Tier::Free => "FREE",
            Tier::Starter => "STARTER",
            Tier::Pro => "PRO",
            Tier::Operator => "OPERATOR",
        }
    }

    pub fn is_paid(self) -> bool {
        self != Tier::Free
    }

    /// Column value for `users.tier` / `entitlements.tier`
    pub fn as_i16(self) -> i16 {
        i16::from(self.level())
    }

    /// Parse a tier as it appears in Stripe checkout metadata.
    ///
    /// Metadata written by different checkout flows uses either the number
    /// (`"2"`) or the name (`"pro"`, `"PRO"`).
    pub fn from_metadata(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(level) = value.parse::<i64>() {
            return Self::from_level(level);
        }
        value.parse().ok()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct ParseTierError(pub String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(Tier::Free),
            "STARTER" => Ok(Tier::Starter),
            "PRO" => Ok(Tier::Pro),
            "OPERATOR" => Ok(Tier::Operator),
            _ => Err(ParseTierError(s.to_string())),
        }
    }
}

impl TryFrom<i16> for Tier {
    type Error = ParseTierError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Tier::from_level(i64::from(value)).ok_or_else(|| ParseTierError(value.to_string()))
    }
}
