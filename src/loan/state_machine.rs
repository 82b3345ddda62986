//! Loan lifecycle state machine
//!
//! The only place that decides a loan's next status. Each transition takes the
//! loan as it was read, checks the edge and its preconditions, and returns the
//! loan as it must be written. Persisting is conditioned on the status and
//! version that were read, so a transition computed from a stale read can never
//! land.

use chrono::{DateTime, Datelike, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::LoanPolicy;
use crate::loan::{Loan, LoanStatus, LoanTerms, RepaymentQuote};
use crate::models::{AccountId, Asset, AssetStatus, PLATFORM_ACCOUNT_ID};

/// Transition failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("loan is {actual}, expected {expected}")]
    StaleState {
        expected: LoanStatus,
        actual: LoanStatus,
    },

    #[error("{0}")]
    Rejected(String),
}

fn rejected(msg: impl Into<String>) -> TransitionError {
    TransitionError::Rejected(msg.into())
}

/// Loan lifecycle rules under a given policy
#[derive(Debug, Clone, Default)]
pub struct LoanStateMachine {
    policy: LoanPolicy,
}

impl LoanStateMachine {
    pub fn new(policy: LoanPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &LoanPolicy {
        &self.policy
    }

    /// Build a new `Open` loan pledging `asset`.
    ///
    /// The caller persists it together with the asset moving to
    /// `Collateralized`, guarded on the asset status read here.
    pub fn open(
        &self,
        borrower: AccountId,
        asset: &Asset,
        terms: &LoanTerms,
        now: DateTime<Utc>,
    ) -> Result<Loan, TransitionError> {
        if asset.owner_id != borrower {
            return Err(rejected("borrower does not own the collateral asset"));
        }
        if !asset.is_pledgeable() {
            return Err(match asset.status {
                AssetStatus::Draft => rejected("asset has no custody token yet"),
                status => rejected(format!("asset is {:?} and cannot be pledged", status)),
            });
        }
        if asset.value <= 0 {
            return Err(rejected("asset has no appraised value"));
        }

        let p = &self.policy;
        if terms.principal < p.min_principal || terms.principal > p.max_principal {
            return Err(rejected(format!(
                "principal must be between {} and {}",
                p.min_principal, p.max_principal
            )));
        }
        if terms.interest_rate_bps < p.min_rate_bps || terms.interest_rate_bps > p.max_rate_bps {
            return Err(rejected(format!(
                "interest rate must be between {} and {} bps",
                p.min_rate_bps, p.max_rate_bps
            )));
        }
        if terms.duration_days < p.min_duration_days || terms.duration_days > p.max_duration_days
        {
            return Err(rejected(format!(
                "duration must be between {} and {} days",
                p.min_duration_days, p.max_duration_days
            )));
        }
        if terms.grace_period_days < 0 {
            return Err(rejected("grace period cannot be negative"));
        }

        let ltv_bps = ltv_bps(terms.principal, asset.value);
        let max_ltv = if terms.express {
            p.max_express_ltv_bps
        } else {
            p.max_ltv_bps
        };
        if ltv_bps > max_ltv as i64 {
            return Err(rejected(format!(
                "loan-to-value {} bps exceeds the {} bps limit",
                ltv_bps, max_ltv
            )));
        }

        Ok(Loan {
            id: Uuid::new_v4(),
            borrower_id: borrower,
            lender_id: None,
            asset_id: asset.id,
            principal: terms.principal,
            interest_rate_bps: terms.interest_rate_bps,
            duration_days: terms.duration_days,
            grace_period_days: terms.grace_period_days,
            ltv_bps: ltv_bps as i32,
            express: terms.express,
            status: LoanStatus::Open,
            version: 0,
            funded_at: None,
            due_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// `Open -> Active`.
    ///
    /// Express loans are funded by the platform and ignore `lender`.
    pub fn fund(
        &self,
        loan: &Loan,
        lender: Option<AccountId>,
        now: DateTime<Utc>,
    ) -> Result<Loan, TransitionError> {
        expect_edge(loan, LoanStatus::Open, LoanStatus::Active)?;

        let lender = if loan.express {
            PLATFORM_ACCOUNT_ID
        } else {
            lender.ok_or_else(|| rejected("a lender is required to fund this loan"))?
        };
        if lender == loan.borrower_id {
            return Err(rejected("lender and borrower must be different accounts"));
        }

        let mut next = advance(loan, LoanStatus::Active, now);
        next.lender_id = Some(lender);
        next.funded_at = Some(now);
        next.due_at = Some(now + Duration::days(loan.duration_days as i64));
        Ok(next)
    }

    /// `Active -> Repaid`, returning the amount owed at `now`.
    pub fn repay(
        &self,
        loan: &Loan,
        payer: AccountId,
        now: DateTime<Utc>,
    ) -> Result<(Loan, RepaymentQuote), TransitionError> {
        expect_edge(loan, LoanStatus::Active, LoanStatus::Repaid)?;
        if payer != loan.borrower_id {
            return Err(rejected("only the borrower can repay this loan"));
        }

        let quote = self.quote(loan, now)?;
        let mut next = advance(loan, LoanStatus::Repaid, now);
        next.resolved_at = Some(now);
        Ok((next, quote))
    }

    /// `Active -> Liquidated`; strictly after the due date plus grace.
    pub fn liquidate(
        &self,
        loan: &Loan,
        claimant: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Loan, TransitionError> {
        expect_edge(loan, LoanStatus::Active, LoanStatus::Liquidated)?;
        if loan.lender_id != Some(claimant) {
            return Err(rejected("only the lender can claim the collateral"));
        }

        let claimable_after = self
            .claimable_after(loan)
            .ok_or_else(|| rejected("loan has no due date"))?;
        if now <= claimable_after {
            return Err(rejected(format!(
                "loan is not overdue until after {}",
                claimable_after.to_rfc3339()
            )));
        }

        let mut next = advance(loan, LoanStatus::Liquidated, now);
        next.resolved_at = Some(now);
        Ok(next)
    }

    /// `Open -> Cancelled`, borrower only.
    pub fn cancel(
        &self,
        loan: &Loan,
        requester: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Loan, TransitionError> {
        expect_edge(loan, LoanStatus::Open, LoanStatus::Cancelled)?;
        if requester != loan.borrower_id {
            return Err(rejected("only the borrower can cancel this loan"));
        }
        let mut next = advance(loan, LoanStatus::Cancelled, now);
        next.resolved_at = Some(now);
        Ok(next)
    }

    /// Principal plus simple interest over whole elapsed months (at least one).
    pub fn quote(&self, loan: &Loan, now: DateTime<Utc>) -> Result<RepaymentQuote, TransitionError> {
        let funded_at = loan
            .funded_at
            .ok_or_else(|| rejected("loan has not been funded"))?;
        let months = elapsed_whole_months(funded_at, now).max(1);
        let interest = simple_interest(loan.principal, loan.interest_rate_bps, months);
        Ok(RepaymentQuote {
            principal: loan.principal,
            interest,
            total: loan.principal + interest,
            elapsed_months: months,
        })
    }

    fn claimable_after(&self, loan: &Loan) -> Option<DateTime<Utc>> {
        let grace = loan.grace_period_days.max(self.policy.liquidation_grace_days);
        loan.due_at.map(|due| due + Duration::days(grace as i64))
    }
}

fn expect_edge(loan: &Loan, from: LoanStatus, to: LoanStatus) -> Result<(), TransitionError> {
    debug_assert!(from.can_transition_to(to));
    if loan.status != from || !loan.status.can_transition_to(to) {
        return Err(TransitionError::StaleState {
            expected: from,
            actual: loan.status,
        });
    }
    Ok(())
}

fn advance(loan: &Loan, status: LoanStatus, now: DateTime<Utc>) -> Loan {
    let mut next = loan.clone();
    next.status = status;
    next.version = loan.version + 1;
    next.updated_at = now;
    next
}

/// Loan-to-value in basis points, rounded up so the limit is never undercut.
pub fn ltv_bps(principal: i64, collateral_value: i64) -> i64 {
    let num = principal as i128 * 10_000;
    let den = collateral_value as i128;
    ((num + den - 1) / den) as i64
}

/// Calendar months between two instants, floored.
pub fn elapsed_whole_months(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to <= from {
        return 0;
    }
    let mut months =
        (to.year() as i64 - from.year() as i64) * 12 + to.month() as i64 - from.month() as i64;
    // Not a full month yet if the day/time-of-month has not come round again
    let to_rest = (to.day(), to.time());
    let from_rest = (from.day(), from.time());
    if to_rest < from_rest {
        months -= 1;
    }
    months.max(0)
}

/// `principal * rate * months / 12`, in minor units, rounded half up.
pub fn simple_interest(principal: i64, rate_bps: i32, months: i64) -> i64 {
    let num = principal as i128 * rate_bps as i128 * months as i128;
    let den: i128 = 10_000 * 12;
    ((num + den / 2) / den) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ALL: [LoanStatus; 6] = [
        LoanStatus::Open,
        LoanStatus::Active,
        LoanStatus::Repaid,
        LoanStatus::Defaulted,
        LoanStatus::Liquidated,
        LoanStatus::Cancelled,
    ];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn asset(owner: AccountId, value: i64) -> Asset {
        Asset {
            id: Uuid::new_v4(),
            owner_id: owner,
            custody_token_id: Some("PARCEL-1".to_string()),
            value,
            status: AssetStatus::Listed,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn terms(principal: i64) -> LoanTerms {
        LoanTerms {
            principal,
            interest_rate_bps: 850,
            duration_days: 30,
            grace_period_days: 0,
            express: false,
        }
    }

    fn open_loan(sm: &LoanStateMachine) -> Loan {
        let borrower = Uuid::new_v4();
        sm.open(borrower, &asset(borrower, 10_000_000), &terms(1_000_000), now())
            .unwrap()
    }

    fn funded_loan(sm: &LoanStateMachine) -> (Loan, AccountId) {
        let lender = Uuid::new_v4();
        let loan = sm.fund(&open_loan(sm), Some(lender), now()).unwrap();
        (loan, lender)
    }

    #[test]
    fn test_only_lifecycle_edges_are_legal() {
        let legal = [
            (LoanStatus::Open, LoanStatus::Active),
            (LoanStatus::Open, LoanStatus::Cancelled),
            (LoanStatus::Active, LoanStatus::Repaid),
            (LoanStatus::Active, LoanStatus::Liquidated),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_transitions_from_wrong_state_are_stale_and_leave_loan_unchanged() {
        let sm = LoanStateMachine::default();
        let (active, lender) = funded_loan(&sm);
        let before = active.clone();

        let err = sm.fund(&active, Some(Uuid::new_v4()), now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::StaleState {
                expected: LoanStatus::Open,
                actual: LoanStatus::Active
            }
        );
        assert!(matches!(
            sm.cancel(&active, active.borrower_id, now()),
            Err(TransitionError::StaleState { .. })
        ));
        assert_eq!(active, before);

        let (repaid, _) = sm.repay(&active, active.borrower_id, now()).unwrap();
        let later = now() + Duration::days(60);
        assert!(matches!(
            sm.liquidate(&repaid, lender, later),
            Err(TransitionError::StaleState { .. })
        ));
        assert!(matches!(
            sm.repay(&repaid, repaid.borrower_id, later),
            Err(TransitionError::StaleState { .. })
        ));
    }

    #[test]
    fn test_open_checks_asset_and_policy() {
        let sm = LoanStateMachine::default();
        let borrower = Uuid::new_v4();
        let listed = asset(borrower, 10_000_000);

        let loan = sm.open(borrower, &listed, &terms(5_000_000), now()).unwrap();
        assert_eq!(loan.status, LoanStatus::Open);
        assert_eq!(loan.ltv_bps, 5_000);
        assert_eq!(loan.lender_id, None);
        assert_eq!(loan.version, 0);

        // Someone else's asset
        assert!(sm.open(Uuid::new_v4(), &listed, &terms(5_000_000), now()).is_err());

        // Over the LTV ceiling
        assert!(sm.open(borrower, &listed, &terms(9_000_000), now()).is_err());

        // Principal below the floor
        assert!(sm.open(borrower, &listed, &terms(10), now()).is_err());

        let mut pledged = listed.clone();
        pledged.status = AssetStatus::Collateralized;
        assert!(sm.open(borrower, &pledged, &terms(5_000_000), now()).is_err());

        let mut draft = listed.clone();
        draft.status = AssetStatus::Draft;
        assert!(sm.open(borrower, &draft, &terms(5_000_000), now()).is_ok());
        draft.custody_token_id = None;
        assert!(sm.open(borrower, &draft, &terms(5_000_000), now()).is_err());
    }

    #[test]
    fn test_express_loans_capped_and_funded_by_platform() {
        let sm = LoanStateMachine::default();
        let borrower = Uuid::new_v4();
        let parcel = asset(borrower, 10_000_000);

        let mut express = terms(5_000_000);
        express.express = true;
        let loan = sm.open(borrower, &parcel, &express, now()).unwrap();

        let funded = sm.fund(&loan, None, now()).unwrap();
        assert_eq!(funded.lender_id, Some(PLATFORM_ACCOUNT_ID));

        express.principal = 6_000_000;
        assert!(sm.open(borrower, &parcel, &express, now()).is_err());
    }

    #[test]
    fn test_fund_sets_lender_and_due_date() {
        let sm = LoanStateMachine::default();
        let loan = open_loan(&sm);

        assert!(sm.fund(&loan, None, now()).is_err());
        assert!(sm.fund(&loan, Some(loan.borrower_id), now()).is_err());

        let lender = Uuid::new_v4();
        let funded = sm.fund(&loan, Some(lender), now()).unwrap();
        assert_eq!(funded.status, LoanStatus::Active);
        assert_eq!(funded.lender_id, Some(lender));
        assert_eq!(funded.funded_at, Some(now()));
        assert_eq!(funded.due_at, Some(now() + Duration::days(30)));
        assert_eq!(funded.version, loan.version + 1);
    }

    #[test]
    fn test_interest_for_loan_funded_45_days_ago() {
        let sm = LoanStateMachine::default();
        let (mut loan, _) = funded_loan(&sm);
        loan.principal = 1_000_000; // 10,000.00
        loan.interest_rate_bps = 850;
        loan.funded_at = Some(now() - Duration::days(45));

        let (repaid, quote) = sm.repay(&loan, loan.borrower_id, now()).unwrap();
        assert_eq!(quote.elapsed_months, 1);
        assert_eq!(quote.interest, 7_083); // 70.83
        assert_eq!(quote.total, 1_007_083); // 10,070.83
        assert_eq!(repaid.status, LoanStatus::Repaid);
    }

    #[test]
    fn test_interest_months_floor_to_one() {
        let sm = LoanStateMachine::default();
        let (loan, _) = funded_loan(&sm);
        let quote = sm.quote(&loan, now()).unwrap();
        assert_eq!(quote.elapsed_months, 1);
    }

    #[test]
    fn test_repay_requires_borrower() {
        let sm = LoanStateMachine::default();
        let (loan, lender) = funded_loan(&sm);
        assert_eq!(
            sm.repay(&loan, lender, now()).unwrap_err(),
            TransitionError::Rejected("only the borrower can repay this loan".to_string())
        );
    }

    #[test]
    fn test_liquidation_is_strictly_after_due_date() {
        let sm = LoanStateMachine::default();
        let (loan, lender) = funded_loan(&sm);
        let due = loan.due_at.unwrap();

        assert!(matches!(
            sm.liquidate(&loan, lender, due),
            Err(TransitionError::Rejected(_))
        ));
        let liquidated = sm
            .liquidate(&loan, lender, due + Duration::milliseconds(1))
            .unwrap();
        assert_eq!(liquidated.status, LoanStatus::Liquidated);

        // Only the lender may claim
        assert!(matches!(
            sm.liquidate(&loan, loan.borrower_id, due + Duration::days(1)),
            Err(TransitionError::Rejected(_))
        ));
    }

    #[test]
    fn test_liquidation_respects_grace_period() {
        let sm = LoanStateMachine::default();
        let (mut loan, lender) = funded_loan(&sm);
        loan.grace_period_days = 5;
        let due = loan.due_at.unwrap();

        assert!(sm.liquidate(&loan, lender, due + Duration::days(5)).is_err());
        assert!(sm
            .liquidate(&loan, lender, due + Duration::days(5) + Duration::milliseconds(1))
            .is_ok());
    }

    #[test]
    fn test_elapsed_whole_months() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap();
        assert_eq!(elapsed_whole_months(start, start), 0);
        assert_eq!(
            elapsed_whole_months(start, Utc.with_ymd_and_hms(2026, 2, 28, 9, 0, 0).unwrap()),
            0
        );
        assert_eq!(
            elapsed_whole_months(start, Utc.with_ymd_and_hms(2026, 3, 31, 9, 0, 0).unwrap()),
            2
        );
        assert_eq!(
            elapsed_whole_months(start, Utc.with_ymd_and_hms(2027, 1, 31, 8, 59, 59).unwrap()),
            11
        );
    }

    #[test]
    fn test_ltv_rounds_up() {
        assert_eq!(ltv_bps(5_000_000, 10_000_000), 5_000);
        assert_eq!(ltv_bps(1, 3), 3_334);
    }
}
