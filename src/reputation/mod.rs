//! Reputation & risk adjuster
//!
//! Pure mapping from a loan transition to a counterparty's new reputation.
//! Callers persist the result in the same write as the transition itself.

use chrono::{DateTime, Utc};

use crate::models::{Reputation, RiskTier};

pub const MIN_SCORE: i32 = 0;
pub const MAX_SCORE: i32 = 1000;
pub const DEFAULT_SCORE: i32 = 500;

/// Score deltas per transition
const FUNDED_LENDER_DELTA: i32 = 2;
const REPAID_BORROWER_DELTA: i32 = 10;
const REPAID_LENDER_DELTA: i32 = 3;
const LIQUIDATED_BORROWER_DELTA: i32 = -50;

/// Transition as seen by one counterparty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    LenderFunded,
    BorrowerRepaid,
    LenderRepaid,
    BorrowerLiquidated,
}

impl RiskTier {
    pub fn from_score(score: i32) -> Self {
        match score {
            700..=MAX_SCORE => RiskTier::Low,
            400..=699 => RiskTier::Medium,
            _ => RiskTier::High,
        }
    }
}

/// Apply `event` to `current`.
pub fn adjust(current: &Reputation, event: ReputationEvent, now: DateTime<Utc>) -> Reputation {
    let mut next = current.clone();
    next.updated_at = now;

    match event {
        ReputationEvent::LenderFunded => {
            next.verified_transactions += 1;
            next.score = clamp(next.score + FUNDED_LENDER_DELTA);
            next.risk_tier = RiskTier::from_score(next.score);
        }
        ReputationEvent::BorrowerRepaid => {
            next.completed_loans += 1;
            next.verified_transactions += 1;
            next.score = clamp(next.score + REPAID_BORROWER_DELTA);
            next.risk_tier = RiskTier::from_score(next.score);
        }
        ReputationEvent::LenderRepaid => {
            next.completed_loans += 1;
            next.score = clamp(next.score + REPAID_LENDER_DELTA);
            next.risk_tier = RiskTier::from_score(next.score);
        }
        ReputationEvent::BorrowerLiquidated => {
            next.defaulted_loans += 1;
            next.score = clamp(next.score + LIQUIDATED_BORROWER_DELTA);
            next.risk_tier = RiskTier::High;
        }
    }

    next
}

fn clamp(score: i32) -> i32 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}
