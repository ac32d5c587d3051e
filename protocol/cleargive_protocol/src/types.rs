//! # Types
//!
//! Shared data structures used across the ClearGive disbursement protocol.
//!
//! ## Design decisions
//!
//! ### Amounts as fixed-point minor units
//!
//! Every monetary value is an [`Amount`]: a non-negative count of stroops
//! (1 unit = 10^7 stroops, matching the Stellar asset precision). Parsing
//! goes through `rust_decimal` so `"12.5"` and `"12.5000000"` are the same
//! value, and persistence can add amounts with plain integer arithmetic.
//!
//! ### Status as a Finite-State Machine
//!
//! [`ApprovalStatus`] and [`MilestoneStatus`] are closed enums. The legal
//! moves between variants live in [`crate::lifecycle`]; nothing else in the
//! workspace compares status strings.
//!
//! ```text
//! Approval:  Pending ──► Approved ──► Executed ──► Refunded
//!
//! Milestone: Pending ──► Completed ──► Verified ──► Released
//!               ▲            │
//!               └────────────┘  (verification rejected)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Stroops per whole unit of the funding asset.
pub const STROOPS_PER_UNIT: i64 = 10_000_000;

/// Decimal places carried by an [`Amount`].
pub const AMOUNT_SCALE: u32 = 7;

// ── Amount ───────────────────────────────────────────────────────────

/// A non-negative monetary value stored as stroops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build an amount from a raw stroop count. Negative counts are rejected.
    pub fn from_stroops(stroops: i64) -> Result<Self, Error> {
        if stroops < 0 {
            return Err(Error::Validation(format!(
                "amount cannot be negative ({stroops} stroops)"
            )));
        }
        Ok(Amount(stroops))
    }

    /// Whole units, for tests and fixtures.
    pub fn units(units: i64) -> Self {
        Amount(units * STROOPS_PER_UNIT)
    }

    pub fn stroops(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Subtraction that may go negative; callers decide what a deficit means.
    pub fn signed_sub(self, other: Amount) -> i128 {
        i128::from(self.0) - i128::from(other.0)
    }

    /// Sum a sequence of amounts, failing on overflow.
    pub fn sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Result<Amount, Error> {
        amounts.into_iter().try_fold(Amount::ZERO, |acc, a| {
            acc.checked_add(a)
                .ok_or_else(|| Error::Validation("amount total overflows".to_string()))
        })
    }

    fn as_decimal(self) -> Decimal {
        Decimal::new(self.0, AMOUNT_SCALE)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let value = Decimal::from_str(raw)
            .map_err(|_| Error::Validation(format!("'{raw}' is not a valid amount")))?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::Validation(format!("amount cannot be negative ({raw})")));
        }
        if value.scale() > AMOUNT_SCALE && value.normalize().scale() > AMOUNT_SCALE {
            return Err(Error::Validation(format!(
                "amount '{raw}' has more than {AMOUNT_SCALE} decimal places"
            )));
        }
        let stroops = value
            .checked_mul(Decimal::from(STROOPS_PER_UNIT))
            .and_then(|d| d.trunc().to_i64())
            .ok_or_else(|| Error::Validation(format!("amount '{raw}' is too large")))?;
        Ok(Amount(stroops))
    }
}

impl TryFrom<String> for Amount {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_decimal().normalize())
    }
}

// ── Statuses ─────────────────────────────────────────────────────────

/// Lifecycle status of a transaction approval.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Collecting signatures.
    Pending,
    /// Quorum reached; waiting for the owner to execute.
    Approved,
    /// Funds moved out; the budget ledger has been debited.
    Executed,
    /// Unreleased remainder returned. Terminal.
    Refunded,
}

impl ApprovalStatus {
    /// Storage identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "executed" => Ok(Self::Executed),
            "refunded" => Ok(Self::Refunded),
            other => Err(Error::Validation(format!("unknown approval status '{other}'"))),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a milestone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneStatus {
    /// Work not yet reported.
    Pending,
    /// Owner reported completion and attached proof.
    Completed,
    /// A cosigner accepted the proof.
    Verified,
    /// Funds for this milestone were disbursed. Terminal.
    Released,
    /// Reserved. No transition produces it.
    Cancelled,
}

impl MilestoneStatus {
    /// Storage identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::Released => "released",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for MilestoneStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "verified" => Ok(Self::Verified),
            "released" => Ok(Self::Released),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("unknown milestone status '{other}'"))),
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded by a cosigner reviewing a completed milestone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationDecision {
    Approved,
    Rejected,
}

impl VerificationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationDecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::Validation(format!(
                "verification status must be 'approved' or 'rejected', got '{other}'"
            ))),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────

/// A charity's signing policy and ownership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charity {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub owner_id: i64,
    pub is_multi_sig: bool,
    /// Current quorum policy. Approvals copy it at creation.
    pub required_signatures: u32,
    pub created_at: i64,
}

/// An identity allowed to sign approvals and verify milestones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cosigner {
    pub id: i64,
    pub charity_id: i64,
    /// Registered user id, when the cosigner has an account.
    pub user_id: Option<i64>,
    pub email: String,
    pub is_primary: bool,
    pub created_at: i64,
}

/// Per-category allocation and running spend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCategory {
    pub id: i64,
    pub charity_id: i64,
    pub name: String,
    /// Percentage of the charity's total budget.
    pub allocation: f64,
    pub spent: Amount,
}

/// A funding request that needs a signature quorum before execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionApproval {
    pub id: i64,
    pub charity_id: i64,
    pub amount: Amount,
    pub description: String,
    pub category: String,
    pub requested_by_id: i64,
    /// Snapshot of the charity policy at creation time.
    pub required_signatures: u32,
    pub current_signatures: u32,
    pub status: ApprovalStatus,
    /// External ledger reference, set on execution.
    pub tx_hash: Option<String>,
    /// Remainder returned by a refund.
    pub refund_amount: Option<Amount>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One signer's signature on an approval. Unique per (approval, signer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSignature {
    pub id: i64,
    pub approval_id: i64,
    pub signer_id: i64,
    /// Opaque blob; never verified here.
    pub signature: String,
    pub created_at: i64,
}

/// A sub-disbursement of an approval gated on completion and verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: i64,
    pub approval_id: i64,
    pub name: String,
    pub description: String,
    pub amount: Amount,
    pub due_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub verification_proof: Option<String>,
    pub status: MilestoneStatus,
    /// Disbursement reference, set on release.
    pub tx_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only review record for a milestone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneVerification {
    pub id: i64,
    pub milestone_id: i64,
    pub verifier_id: i64,
    pub status: VerificationDecision,
    pub comments: String,
    pub created_at: i64,
}
