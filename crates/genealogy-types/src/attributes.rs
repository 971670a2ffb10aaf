//! Member attributes and raw ledger records
//!
//! The ledger reports amounts in base units (18 decimals) and tiers/ranks as
//! small integer codes. `LedgerUserInfo::ingest` converts a raw record into
//! `NodeAttributes` with every default resolved, so consumers never have to
//! second-guess a missing field.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Decimal places used by the ledger for every amount.
pub const AMOUNT_SCALE: u32 = 18;

/// Earnings at or above this share of the cap mark a member as near-cap.
const NEAR_CAP_PERCENT: i64 = 80;

/// Direct referrals needed for leader status.
const LEADER_DIRECT_REFERRALS: u32 = 3;

/// Largest mantissa a `Decimal` can hold (96 bits)
const MAX_MANTISSA: u128 = (1 << 96) - 1;

// ============================================================================
// PACKAGE TIER
// ============================================================================

/// Package a member bought into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageTier {
    /// Unknown or missing package level
    #[default]
    None,
    /// $30 package (level 1)
    Entry,
    /// $50 package (level 2)
    Standard,
    /// $100 package (level 3)
    Advanced,
    /// $200 package (level 4)
    Premium,
}

impl PackageTier {
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => PackageTier::Entry,
            2 => PackageTier::Standard,
            3 => PackageTier::Advanced,
            4 => PackageTier::Premium,
            _ => PackageTier::None,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            PackageTier::None => 0,
            PackageTier::Entry => 1,
            PackageTier::Standard => 2,
            PackageTier::Advanced => 3,
            PackageTier::Premium => 4,
        }
    }

    /// Package price in whole USD
    pub fn amount_usd(&self) -> u32 {
        match self {
            PackageTier::None => 0,
            PackageTier::Entry => 30,
            PackageTier::Standard => 50,
            PackageTier::Advanced => 100,
            PackageTier::Premium => 200,
        }
    }
}

// ============================================================================
// RANK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    #[default]
    Member,
    SilverStar,
    ShiningStar,
    DiamondLeader,
}

impl Rank {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Rank::SilverStar,
            2 => Rank::ShiningStar,
            3 => Rank::DiamondLeader,
            _ => Rank::Member,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Member => "Member",
            Rank::SilverStar => "Silver Star",
            Rank::ShiningStar => "Shining Star",
            Rank::DiamondLeader => "Diamond Leader",
        }
    }
}

// ============================================================================
// MEMBER STATUS
// ============================================================================

/// Status derived from the raw record at ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Unregistered,
    Blacklisted,
    /// Earnings reached 80% of the earnings cap
    NearCap,
    /// Three or more direct referrals
    Leader,
    /// Has earned something
    Earning,
    #[default]
    New,
}

// ============================================================================
// NODE ATTRIBUTES
// ============================================================================

/// Fixed attribute schema of a network member
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeAttributes {
    /// Registered on the ledger (false only for an unregistered root)
    pub registered: bool,
    pub package: PackageTier,
    pub rank: Rank,
    /// Cumulative earnings in token units
    pub earnings: Decimal,
    pub earnings_cap: Decimal,
    pub total_investment: Decimal,
    pub balance: Decimal,
    /// Direct-child count as reported by the ledger
    pub direct_referrals: u32,
    /// Subtree size as reported by the ledger
    pub team_size: u32,
    pub active: bool,
    pub status: MemberStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl NodeAttributes {
    /// Attributes of an active member with the given earnings (handy for tests and demos)
    pub fn active_with_earnings(earnings: Decimal) -> Self {
        Self {
            registered: true,
            active: true,
            earnings,
            status: if earnings > Decimal::ZERO {
                MemberStatus::Earning
            } else {
                MemberStatus::New
            },
            ..Default::default()
        }
    }
}

// ============================================================================
// RAW LEDGER RECORD
// ============================================================================

/// Member record exactly as the ledger reports it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerUserInfo {
    pub is_registered: bool,
    pub is_blacklisted: bool,
    pub package_level: u8,
    pub rank: u8,
    /// Base units (18 decimals)
    pub total_earnings: u128,
    pub earnings_cap: u128,
    pub total_investment: u128,
    pub balance: u128,
    pub direct_referrals: u32,
    pub team_size: u32,
    /// Unix seconds, 0 when unknown
    pub registration_time: i64,
    /// Unix seconds of the last pool claim, 0 when never claimed
    pub last_claim_time: i64,
}

impl LedgerUserInfo {
    /// Resolve the raw record into the fixed attribute schema.
    pub fn ingest(&self) -> NodeAttributes {
        let earnings = base_units_to_decimal(self.total_earnings);
        let earnings_cap = base_units_to_decimal(self.earnings_cap);
        let joined_at = unix_to_datetime(self.registration_time);

        NodeAttributes {
            registered: self.is_registered,
            package: PackageTier::from_level(self.package_level),
            rank: Rank::from_code(self.rank),
            earnings,
            earnings_cap,
            total_investment: base_units_to_decimal(self.total_investment),
            balance: base_units_to_decimal(self.balance),
            direct_referrals: self.direct_referrals,
            team_size: self.team_size,
            active: self.is_registered && !self.is_blacklisted,
            status: self.derive_status(earnings, earnings_cap),
            joined_at,
            last_activity_at: unix_to_datetime(self.last_claim_time).or(joined_at),
        }
    }

    fn derive_status(&self, earnings: Decimal, cap: Decimal) -> MemberStatus {
        if !self.is_registered {
            return MemberStatus::Unregistered;
        }
        if self.is_blacklisted {
            return MemberStatus::Blacklisted;
        }
        if cap > Decimal::ZERO && is_near_cap(earnings, cap) {
            return MemberStatus::NearCap;
        }
        if self.direct_referrals >= LEADER_DIRECT_REFERRALS {
            return MemberStatus::Leader;
        }
        if earnings > Decimal::ZERO {
            return MemberStatus::Earning;
        }
        MemberStatus::New
    }
}

/// `earnings >= 80% of cap`, without overflowing on huge amounts
fn is_near_cap(earnings: Decimal, cap: Decimal) -> bool {
    let hundred = Decimal::from(100);
    let percent = Decimal::from(NEAR_CAP_PERCENT);
    match (earnings.checked_mul(hundred), cap.checked_mul(percent)) {
        (Some(lhs), Some(rhs)) => lhs >= rhs,
        // a ratio too large to represent is far past the cap
        _ => earnings
            .checked_div(cap)
            .and_then(|ratio| ratio.checked_mul(hundred))
            .map_or(true, |share| share >= percent),
    }
}

/// Convert an 18-decimal base-unit amount into token units.
///
/// Exact whenever the amount fits the 96-bit Decimal mantissa. Larger
/// amounts give up trailing fractional digits (rounded half up) until they
/// fit; the integer part is always kept, since `u128::MAX` needs at most ten
/// digits dropped.
pub fn base_units_to_decimal(amount: u128) -> Decimal {
    let mut mantissa = amount;
    let mut scale = AMOUNT_SCALE;
    while mantissa > MAX_MANTISSA && scale > 0 {
        mantissa = mantissa / 10 + u128::from(mantissa % 10 >= 5);
        scale -= 1;
    }
    i128::try_from(mantissa)
        .ok()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, scale).ok())
        .map(|d| d.normalize())
        .unwrap_or(Decimal::MAX)
}

fn unix_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}
