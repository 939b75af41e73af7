// Split Calculator - turns worked minutes and snapshotted rates into per-payee amounts
//
// The only place in the engine where money is rounded:
// - Every payee share is rounded half-up to cents on its own
// - The agency share is never rounded, it absorbs whatever residue is left
//   so client_charge == contractor + marketing + training + agency, to the cent

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::SplitError;

const MINUTES_PER_HOUR: i64 = 60;
const CENTS: u32 = 2;

/// Largest amount a ledger column (NUMERIC(14,2)) holds
pub const MAX_AMOUNT: Decimal = dec!(999999999999.99);

/// Inputs to a split, taken from a finalized work record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInput {
    pub minutes_worked: i64,
    pub client_hourly_rate: Decimal,
    pub contractor_hourly_rate: Decimal,
    /// Zero when no referral partner is attached
    pub marketing_commission_rate: Decimal,
    /// Zero when no training center is attributed
    pub training_commission_rate: Decimal,
}

/// Per-payee amounts for one work record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBreakdown {
    #[serde(with = "rust_decimal::serde::str")]
    pub client_charge: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub contractor_earnings: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub marketing_payout: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub training_payout: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub agency_retained: Decimal,
}

impl SplitBreakdown {
    /// Sum of everything owed to external payees
    pub fn payee_total(&self) -> Decimal {
        self.contractor_earnings + self.marketing_payout + self.training_payout
    }

    pub fn is_balanced(&self) -> bool {
        self.payee_total() + self.agency_retained == self.client_charge
    }
}

/// Compute the split for one shift.
///
/// Pure and side-effect free; safe to call from any number of tasks.
pub fn calculate_split(input: &SplitInput) -> Result<SplitBreakdown, SplitError> {
    validate(input)?;

    let client_charge = hourly_amount(input.minutes_worked, input.client_hourly_rate)?;
    let contractor_earnings = hourly_amount(input.minutes_worked, input.contractor_hourly_rate)?;
    let marketing_payout = hourly_amount(input.minutes_worked, input.marketing_commission_rate)?;
    let training_payout = hourly_amount(input.minutes_worked, input.training_commission_rate)?;

    let agency_retained = client_charge - contractor_earnings - marketing_payout - training_payout;

    let breakdown = SplitBreakdown {
        client_charge,
        contractor_earnings,
        marketing_payout,
        training_payout,
        agency_retained,
    };

    if agency_retained < Decimal::ZERO {
        return Err(SplitError::NegativeRetainedAmount { breakdown });
    }

    debug_assert!(breakdown.is_balanced());
    Ok(breakdown)
}

/// round(minutes / 60 * rate, 2), half-up.
///
/// Multiplying before dividing keeps the intermediate exact for every whole-cent rate.
fn hourly_amount(minutes: i64, rate: Decimal) -> Result<Decimal, SplitError> {
    let amount = Decimal::from(minutes)
        .checked_mul(rate)
        .and_then(|raw| raw.checked_div(Decimal::from(MINUTES_PER_HOUR)))
        .map(|raw| raw.round_dp_with_strategy(CENTS, RoundingStrategy::MidpointAwayFromZero))
        .filter(|amount| *amount <= MAX_AMOUNT)
        .ok_or_else(|| {
            SplitError::InvalidInput(format!(
                "{} minutes at {}/h exceeds the largest settleable amount",
                minutes, rate
            ))
        })?;
    Ok(amount)
}

fn validate(input: &SplitInput) -> Result<(), SplitError> {
    if input.minutes_worked < 0 {
        return Err(SplitError::InvalidInput(format!(
            "minutes worked must not be negative, got {}",
            input.minutes_worked
        )));
    }

    let rates = [
        ("client_hourly_rate", input.client_hourly_rate),
        ("contractor_hourly_rate", input.contractor_hourly_rate),
        ("marketing_commission_rate", input.marketing_commission_rate),
        ("training_commission_rate", input.training_commission_rate),
    ];

    for (name, rate) in rates {
        if rate.is_sign_negative() && !rate.is_zero() {
            return Err(SplitError::InvalidInput(format!(
                "{} must not be negative, got {}",
                name, rate
            )));
        }
        if rate.normalize().scale() > CENTS {
            return Err(SplitError::InvalidInput(format!(
                "{} must have at most {} fraction digits, got {}",
                name, CENTS, rate
            )));
        }
    }

    if input.client_hourly_rate.is_zero() {
        return Err(SplitError::InvalidInput(
            "client_hourly_rate must be positive".to_string(),
        ));
    }
    if input.contractor_hourly_rate.is_zero() {
        return Err(SplitError::InvalidInput(
            "contractor_hourly_rate must be positive".to_string(),
        ));
    }

    Ok(())
}
